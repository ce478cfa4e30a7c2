//! The bidirectional serializer seam
//!
//! Type descriptors and custom hooks are written once against
//! [`Serializer`] and run unchanged in both directions: when writing, every
//! call reads from the given slot; when reading, every call fills it.

use std::any::Any;

use crate::class::{ClassId, Reflect};
use crate::error::{CregError, CregResult};
use crate::graph::{ObjRef, Ptr};
use crate::registry::ClassRegistry;
use crate::types::{DeduceType, TypeDescriptor};

/// One direction of a save or load session
pub trait Serializer {
    /// True for the output side
    fn is_writing(&self) -> bool;

    /// Registry the session resolves class names against
    fn registry(&self) -> &ClassRegistry;

    /// Copy raw bytes
    fn serialize_raw(&mut self, bytes: &mut [u8]) -> CregResult<()>;

    /// Integer of any width, always 8 bytes on the wire
    fn serialize_int(&mut self, value: &mut i64) -> CregResult<()>;

    /// Array or payload length, checked against session limits on read
    fn serialize_len(&mut self, len: &mut usize) -> CregResult<()>;

    /// Reject an array length the rest of the input cannot hold; a no-op
    /// when writing
    fn check_elements(&mut self, len: usize, elem: &TypeDescriptor) -> CregResult<()>;

    /// Length-prefixed byte payload
    fn serialize_bytes(&mut self, bytes: &mut Vec<u8>) -> CregResult<()>;

    /// Pointer to a referenced object of `class` or a class derived from it
    fn serialize_object_ptr(&mut self, slot: &mut Option<ObjRef>, class: ClassId) -> CregResult<()>;

    /// Object stored inline in its owner
    fn serialize_object_instance(&mut self, instance: &mut dyn Any, class: ClassId) -> CregResult<()>;

    /// Session-scoped extension state supplied by the caller
    fn context(&mut self) -> Option<&mut dyn Any>;
}

impl dyn Serializer + '_ {
    /// Serialize a value through its deduced type descriptor
    pub fn serialize_value<T: DeduceType>(&mut self, value: &mut T) -> CregResult<()> {
        T::describe().serialize(self, value)
    }

    /// Booleans travel as integers, 0 or 1
    pub fn serialize_bool(&mut self, value: &mut bool) -> CregResult<()> {
        let mut wide = *value as i64;
        self.serialize_int(&mut wide)?;
        if !self.is_writing() {
            *value = match wide {
                0 => false,
                1 => true,
                other => return Err(CregError::ValueOutOfRange { ty: "bool", value: other }),
            };
        }
        Ok(())
    }

    pub fn serialize_string(&mut self, value: &mut String) -> CregResult<()> {
        if self.is_writing() {
            let mut bytes = value.as_bytes().to_vec();
            self.serialize_bytes(&mut bytes)
        } else {
            let mut bytes = Vec::new();
            self.serialize_bytes(&mut bytes)?;
            *value = String::from_utf8(bytes)
                .map_err(|e| CregError::Corrupt(format!("invalid utf-8 string: {e}")))?;
            Ok(())
        }
    }

    /// Typed pointer; the declared class comes from `T`
    pub fn serialize_ptr<T: Reflect>(&mut self, ptr: &mut Ptr<T>) -> CregResult<()> {
        let class = self.registry().require(T::CLASS)?;
        self.serialize_object_ptr(ptr.raw_mut(), class)
    }

    /// Inline instance of a registered class
    pub fn serialize_instance<T: Reflect>(&mut self, instance: &mut T) -> CregResult<()> {
        let class = self.registry().require(T::CLASS)?;
        self.serialize_object_instance(instance, class)
    }

    /// Downcast the session context
    pub fn context_as<C: Any>(&mut self) -> Option<&mut C> {
        self.context()?.downcast_mut::<C>()
    }
}
