//! Full userdata

use std::any::Any;
use std::fmt;

use creg_core::{CregError, CregResult, Ptr, Reflect, Serializer};

use crate::table::Table;

/// Host data carried by a userdata
pub enum UserdataPayload {
    /// Plain integer, persisted as is
    Integer(i64),
    /// Live host resource; has no serialized form
    Handle(Box<dyn Any + Send>),
}

impl Default for UserdataPayload {
    fn default() -> Self {
        UserdataPayload::Integer(0)
    }
}

impl fmt::Debug for UserdataPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserdataPayload::Integer(n) => f.debug_tuple("Integer").field(n).finish(),
            UserdataPayload::Handle(_) => f.write_str("Handle(..)"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Userdata {
    pub metatable: Ptr<Table>,
    pub env: Ptr<Table>,
    pub payload: UserdataPayload,
}

impl Reflect for Userdata {
    const CLASS: &'static str = "Udata";
}

impl Userdata {
    pub fn integer(&self) -> Option<i64> {
        match self.payload {
            UserdataPayload::Integer(n) => Some(n),
            UserdataPayload::Handle(_) => None,
        }
    }
}

pub(crate) fn serialize_userdata(udata: &mut Userdata, s: &mut dyn Serializer) -> CregResult<()> {
    match &mut udata.payload {
        UserdataPayload::Integer(n) => s.serialize_int(n),
        UserdataPayload::Handle(handle) => Err(CregError::UnsupportedValue(format!(
            "userdata holding a native handle ({:?})",
            (**handle).type_id()
        ))),
    }
}
