//! creg script
//!
//! Heap model of an embedded scripting interpreter and its state serializer:
//! - Tagged values, tables, prototypes, closures, upvalues, userdata, threads
//! - Class registrations with custom hooks for every heap kind
//! - Session string table writing each distinct string payload once
//! - Native function registry persisting host functions by name
//! - [`Interpreter::save`] / [`Interpreter::load`] over a creg package

#![warn(rust_2018_idioms)]

pub mod classes;
pub mod error;
pub mod function;
pub mod natives;
pub mod options;
pub mod session;
pub mod state;
pub mod table;
pub mod thread;
pub mod userdata;
pub mod value;

pub use classes::{register_script_classes, script_registry};
pub use error::{ScriptError, ScriptResult};
pub use function::{Closure, LocVar, LuaClosure, NativeClosure, Proto, UpVal, UpValState};
pub use natives::{NativeFn, NativeRegistry, MAX_AUTO_REGISTER_DEPTH};
pub use options::ScriptOptions;
pub use session::{ScriptSession, SessionAllocator, SessionStats, StringTable};
pub use state::{GlobalState, Interpreter, StringInterner, BASIC_STACK_SIZE, TAG_METHOD_NAMES};
pub use table::{Node, Table};
pub use thread::{CallInfo, DebugHook, Thread, ThreadStatus};
pub use userdata::{Userdata, UserdataPayload};
pub use value::{LuaStr, TableKey, Value, ValueKind};
