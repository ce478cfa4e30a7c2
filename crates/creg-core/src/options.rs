//! Session limits

/// Limits applied by one save or load session
///
/// Hitting any limit aborts the session with
/// [`CregError::CapacityExceeded`](crate::CregError::CapacityExceeded).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum number of object records, null slot excluded
    pub max_objects: u32,

    /// Maximum nesting of embedded instances
    pub max_depth: usize,

    /// Maximum element count of a growable array
    pub max_array_len: usize,

    /// Maximum byte length of a string or byte payload
    pub max_string_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_objects: 1 << 24,
            max_depth: 256,
            max_array_len: 1 << 26,
            max_string_len: 1 << 28,
        }
    }
}

impl SessionOptions {
    /// Options with no practical limits
    pub fn unlimited() -> Self {
        Self {
            max_objects: u32::MAX - 1,
            max_depth: usize::MAX,
            max_array_len: usize::MAX,
            max_string_len: usize::MAX,
        }
    }
}
