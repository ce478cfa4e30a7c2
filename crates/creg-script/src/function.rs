//! Prototypes, closures and upvalues
//!
//! Script closures and native closures share the [`Closure`] base class, so a
//! `Value::Function` is a pointer to the base and may target either kind.

use creg_core::{impl_embedded, CregError, CregResult, Ptr, Reflect, Serializer};

use crate::natives::NativeFn;
use crate::session::session_of;
use crate::table::Table;
use crate::thread::Thread;
use crate::value::{LuaStr, Value};

/// Local variable debug record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocVar {
    pub name: LuaStr,
    pub start_pc: i32,
    pub end_pc: i32,
}

impl Reflect for LocVar {
    const CLASS: &'static str = "LocVar";
}

impl_embedded!(LocVar);

/// Compiled function body
#[derive(Debug, Default)]
pub struct Proto {
    pub constants: Vec<Value>,
    pub code: Vec<u32>,
    pub protos: Vec<Ptr<Proto>>,
    pub line_info: Vec<i32>,
    pub locals: Vec<LocVar>,
    pub upvalue_names: Vec<LuaStr>,
    pub source: LuaStr,
    pub line_defined: i32,
    pub last_line_defined: i32,
    pub num_upvalues: u8,
    pub num_params: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
}

impl Reflect for Proto {
    const CLASS: &'static str = "Proto";
}

/// Part shared by every closure kind
#[derive(Debug, Default)]
pub struct Closure {
    pub env: Ptr<Table>,
}

impl Reflect for Closure {
    const CLASS: &'static str = "Closure";
}

/// Closure over a prototype
#[derive(Debug, Default)]
pub struct LuaClosure {
    pub closure: Closure,
    pub proto: Ptr<Proto>,
    pub upvalues: Vec<Ptr<UpVal>>,
}

impl Reflect for LuaClosure {
    const CLASS: &'static str = "LClosure";
}

/// Closure over a host function
#[derive(Debug, Default)]
pub struct NativeClosure {
    pub closure: Closure,
    /// Written by registered name, never by address
    pub function: Option<NativeFn>,
    pub upvalues: Vec<Value>,
}

impl Reflect for NativeClosure {
    const CLASS: &'static str = "CClosure";
}

pub(crate) fn serialize_native_closure(
    closure: &mut NativeClosure,
    s: &mut dyn Serializer,
) -> CregResult<()> {
    if s.is_writing() {
        let f = closure
            .function
            .ok_or_else(|| CregError::UnsupportedValue("native closure without a function".into()))?;
        let mut name = session_of(s)?
            .natives
            .name_of(f)
            .map(str::to_owned)
            .ok_or_else(|| {
                CregError::UnsupportedValue(format!("unregistered native function at {:#x}", f as usize))
            })?;
        return s.serialize_string(&mut name);
    }

    let mut name = String::new();
    s.serialize_string(&mut name)?;
    let f = session_of(s)?
        .natives
        .get(&name)
        .ok_or_else(|| CregError::UnsupportedValue(format!("unknown native function `{name}`")))?;
    closure.function = Some(f);
    Ok(())
}

/// Storage of an upvalue
#[derive(Debug, Clone, PartialEq)]
pub enum UpValState {
    /// Still aliases a stack slot; linked into the thread's open list, which
    /// is sorted by slot, highest first
    Open {
        thread: Ptr<Thread>,
        slot: usize,
        prev: Ptr<UpVal>,
        next: Ptr<UpVal>,
    },
    /// Owns its value
    Closed(Value),
}

impl Default for UpValState {
    fn default() -> Self {
        UpValState::Closed(Value::Nil)
    }
}

#[derive(Debug, Default)]
pub struct UpVal {
    pub state: UpValState,
}

impl Reflect for UpVal {
    const CLASS: &'static str = "UpVal";
}

impl UpVal {
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpValState::Open { .. })
    }

    pub fn slot(&self) -> Option<usize> {
        match self.state {
            UpValState::Open { slot, .. } => Some(slot),
            UpValState::Closed(_) => None,
        }
    }
}

/// Closed flag, then the embedded value or the open-list node
pub(crate) fn serialize_upval(upval: &mut UpVal, s: &mut dyn Serializer) -> CregResult<()> {
    let mut closed = !upval.is_open();
    s.serialize_bool(&mut closed)?;
    if !s.is_writing() {
        upval.state = if closed {
            UpValState::Closed(Value::Nil)
        } else {
            UpValState::Open {
                thread: Ptr::null(),
                slot: 0,
                prev: Ptr::null(),
                next: Ptr::null(),
            }
        };
    }
    match &mut upval.state {
        UpValState::Closed(value) => s.serialize_instance(value),
        UpValState::Open {
            thread,
            slot,
            prev,
            next,
        } => {
            s.serialize_ptr(thread)?;
            s.serialize_value(slot)?;
            s.serialize_ptr(prev)?;
            s.serialize_ptr(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upval_state() {
        let mut upval = UpVal::default();
        assert!(!upval.is_open());
        assert_eq!(upval.slot(), None);
        upval.state = UpValState::Open {
            thread: Ptr::null(),
            slot: 4,
            prev: Ptr::null(),
            next: Ptr::null(),
        };
        assert!(upval.is_open());
        assert_eq!(upval.slot(), Some(4));
    }
}
