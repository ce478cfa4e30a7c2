//! Script values
//!
//! [`Value`] is the tagged union every stack slot, table entry and constant
//! holds. Strings are immutable shared byte buffers; every other collectable
//! kind is a pointer into the object graph.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use creg_core::{impl_embedded, CregError, CregResult, ObjRef, Ptr, Reflect, Serializer};

use crate::function::Closure;
use crate::session::session_of;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::Userdata;

/// Immutable interned string
#[derive(Clone)]
pub struct LuaStr(Arc<[u8]>);

impl LuaStr {
    pub fn new(bytes: &[u8]) -> Self {
        LuaStr(Arc::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text form, invalid UTF-8 replaced
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// True if both handles share one buffer
    pub fn ptr_eq(&self, other: &LuaStr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for LuaStr {
    fn default() -> Self {
        LuaStr::new(b"")
    }
}

impl PartialEq for LuaStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for LuaStr {}

impl Hash for LuaStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Borrow<[u8]> for LuaStr {
    fn borrow(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_str_lossy())
    }
}

impl fmt::Display for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str_lossy())
    }
}

impl Reflect for LuaStr {
    const CLASS: &'static str = "TString";
}

/// Strings go through the session string table: an index, followed by the
/// payload the first time the index appears
pub(crate) fn serialize_lua_str(string: &mut LuaStr, s: &mut dyn Serializer) -> CregResult<()> {
    if s.is_writing() {
        let (index, fresh) = session_of(s)?.strings.index_for_write(string)?;
        let mut wire = index as i64;
        s.serialize_int(&mut wire)?;
        if fresh {
            let mut bytes = string.as_bytes().to_vec();
            s.serialize_bytes(&mut bytes)?;
        }
        return Ok(());
    }

    let mut wire = 0i64;
    s.serialize_int(&mut wire)?;
    let known = session_of(s)?.strings.len();
    let index = usize::try_from(wire)
        .ok()
        .filter(|&i| i <= known)
        .ok_or_else(|| {
            CregError::Corrupt(format!("string index {wire} outside table of {known}"))
        })?;
    if index == known {
        let mut bytes = Vec::new();
        s.serialize_bytes(&mut bytes)?;
        let session = session_of(s)?;
        session.allocator.charge(bytes.len())?;
        *string = session.strings.push_loaded(&bytes)?;
    } else {
        *string = session_of(s)?.strings.get_loaded(index)?;
    }
    Ok(())
}

/// Value kind, written as the one-byte tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Nil = 0,
    Boolean = 1,
    LightUserdata = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
}

impl ValueKind {
    /// Number of kinds; per-kind metatable slots use this
    pub const COUNT: usize = 9;

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ValueKind::Nil,
            1 => ValueKind::Boolean,
            2 => ValueKind::LightUserdata,
            3 => ValueKind::Number,
            4 => ValueKind::String,
            5 => ValueKind::Table,
            6 => ValueKind::Function,
            7 => ValueKind::Userdata,
            8 => ValueKind::Thread,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Boolean => "boolean",
            ValueKind::LightUserdata => "lightuserdata",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Table => "table",
            ValueKind::Function => "function",
            ValueKind::Userdata => "userdata",
            ValueKind::Thread => "thread",
        }
    }
}

/// Tagged script value
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    /// Opaque host integer
    LightUserdata(usize),
    Number(f64),
    String(LuaStr),
    Table(Ptr<Table>),
    Function(Ptr<Closure>),
    Userdata(Ptr<Userdata>),
    Thread(Ptr<Thread>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::LightUserdata(_) => ValueKind::LightUserdata,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Table(_) => ValueKind::Table,
            Value::Function(_) => ValueKind::Function,
            Value::Userdata(_) => ValueKind::Userdata,
            Value::Thread(_) => ValueKind::Thread,
        }
    }

    /// Empty payload of a kind, filled in by the reader
    fn empty(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Nil => Value::Nil,
            ValueKind::Boolean => Value::Boolean(false),
            ValueKind::LightUserdata => Value::LightUserdata(0),
            ValueKind::Number => Value::Number(0.0),
            ValueKind::String => Value::String(LuaStr::default()),
            ValueKind::Table => Value::Table(Ptr::null()),
            ValueKind::Function => Value::Function(Ptr::null()),
            ValueKind::Userdata => Value::Userdata(Ptr::null()),
            ValueKind::Thread => Value::Thread(Ptr::null()),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything but nil and false is true
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&LuaStr> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<Ptr<Table>> {
        match self {
            Value::Table(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<Ptr<Closure>> {
        match self {
            Value::Function(f) => Some(*f),
            _ => None,
        }
    }

    /// Graph object behind a collectable value
    pub fn object(&self) -> Option<ObjRef> {
        match self {
            Value::Table(p) => p.raw(),
            Value::Function(p) => p.raw(),
            Value::Userdata(p) => p.raw(),
            Value::Thread(p) => p.raw(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<LuaStr> for Value {
    fn from(s: LuaStr) -> Self {
        Value::String(s)
    }
}

impl From<Ptr<Table>> for Value {
    fn from(t: Ptr<Table>) -> Self {
        Value::Table(t)
    }
}

impl From<Ptr<Closure>> for Value {
    fn from(f: Ptr<Closure>) -> Self {
        Value::Function(f)
    }
}

impl Reflect for Value {
    const CLASS: &'static str = "TValue";
}

impl_embedded!(LuaStr, Value);

/// Tag byte, then the payload of that kind
pub(crate) fn serialize_tvalue(value: &mut Value, s: &mut dyn Serializer) -> CregResult<()> {
    let mut tag = [value.kind() as u8];
    s.serialize_raw(&mut tag)?;
    if !s.is_writing() {
        let kind = ValueKind::from_tag(tag[0])
            .ok_or_else(|| CregError::Corrupt(format!("invalid value tag {}", tag[0])))?;
        *value = Value::empty(kind);
    }
    match value {
        Value::Nil => Ok(()),
        Value::Boolean(b) => s.serialize_bool(b),
        Value::LightUserdata(p) => s.serialize_value(p),
        Value::Number(n) => s.serialize_value(n),
        Value::String(string) => s.serialize_instance(string),
        Value::Table(t) => s.serialize_ptr(t),
        Value::Function(f) => s.serialize_ptr(f),
        Value::Userdata(u) => s.serialize_ptr(u),
        Value::Thread(t) => s.serialize_ptr(t),
    }
}

/// Hashable form of a value used as a table key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Boolean(bool),
    LightUserdata(usize),
    /// Bit pattern, negative zero folded into zero
    Number(u64),
    String(LuaStr),
    /// Session-local graph handle; not stable across loads
    Object(ObjRef),
}

impl TableKey {
    pub fn from_value(value: &Value) -> Result<Self, &'static str> {
        match value {
            Value::Nil => Err("nil"),
            Value::Boolean(b) => Ok(TableKey::Boolean(*b)),
            Value::LightUserdata(p) => Ok(TableKey::LightUserdata(*p)),
            Value::Number(n) if n.is_nan() => Err("NaN"),
            Value::Number(n) => Ok(TableKey::Number(if *n == 0.0 { 0 } else { n.to_bits() })),
            Value::String(s) => Ok(TableKey::String(s.clone())),
            other => other.object().map(TableKey::Object).ok_or("null object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lua_str_content_equality() {
        let a = LuaStr::new(b"hello");
        let b = LuaStr::new(b"hello");
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
        assert_eq!(a.to_string(), "hello");
        assert_eq!(LuaStr::default().len(), 0);
    }

    #[test]
    fn test_kinds_and_tags() {
        for tag in 0..ValueKind::COUNT as u8 {
            let kind = ValueKind::from_tag(tag).unwrap();
            assert_eq!(kind as u8, tag);
            assert_eq!(Value::empty(kind).kind(), kind);
        }
        assert!(ValueKind::from_tag(9).is_none());
        assert_eq!(Value::from(2.5).kind().name(), "number");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Boolean(false).truthy());
        assert!(Value::Number(0.0).truthy());
        assert!(Value::String(LuaStr::default()).truthy());
    }

    #[test]
    fn test_table_keys() {
        assert_eq!(TableKey::from_value(&Value::Nil), Err("nil"));
        assert_eq!(TableKey::from_value(&Value::Number(f64::NAN)), Err("NaN"));
        assert_eq!(
            TableKey::from_value(&Value::Number(-0.0)),
            TableKey::from_value(&Value::Number(0.0))
        );
        assert_eq!(
            TableKey::from_value(&Value::Table(Ptr::null())),
            Err("null object")
        );
        assert_eq!(
            TableKey::from_value(&Value::String(LuaStr::new(b"k"))),
            Ok(TableKey::String(LuaStr::new(b"k")))
        );
    }
}
