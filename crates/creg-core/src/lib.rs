//! creg core
//!
//! Reflection-driven serialization of object graphs:
//! - Class metadata registry with two-phase finalization and checksums
//! - Type descriptors for primitives, enums, strings, arrays, embedded
//!   instances and object pointers
//! - Bidirectional serializer seam shared by field descriptors and custom hooks
//! - Package writer and reader with identity-preserving pointers

#![warn(rust_2018_idioms)]

pub mod class;
pub mod error;
pub mod graph;
pub mod input;
pub mod options;
pub mod output;
pub mod package;
pub mod registry;
pub mod serializer;
pub mod types;

use std::sync::Arc;

pub use class::{
    ClassBuilder, ClassDescriptor, ClassFlags, ClassId, FieldDescriptor, FieldFlags, PostLoadFn,
    Reflect, SerializeFn,
};
pub use error::{CregError, CregResult, ErrorCategory};
pub use graph::{ObjRef, ObjectGraph, Ptr};
pub use input::{run_post_load, InputSerializer, LoadedPackage};
pub use options::SessionOptions;
pub use output::OutputSerializer;
pub use package::{PackageHeader, PackageInfo};
pub use registry::{finalize_global, global_registry, register_global, ClassRegistry, RegistryBuilder};
pub use serializer::Serializer;
pub use types::{DeduceType, Primitive, ReflectEnum, TypeDescriptor, TypeRef};

/// Save everything reachable from `root` with default options
pub fn save_package(graph: &mut ObjectGraph, root: ObjRef) -> CregResult<Vec<u8>> {
    let registry = graph.registry().clone();
    let options = SessionOptions::default();
    let mut bytes = Vec::new();
    OutputSerializer::new(&registry, &options).save(graph, root, &mut bytes)?;
    Ok(bytes)
}

/// Load a package with default options
pub fn load_package(registry: &Arc<ClassRegistry>, bytes: &[u8]) -> CregResult<LoadedPackage> {
    let options = SessionOptions::default();
    InputSerializer::new(registry, &options).load_bytes(bytes)
}
