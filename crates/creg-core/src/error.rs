//! Error types shared by the registry, the writer and the reader

/// Broad class of a [`CregError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Broken class registrations, detected before any save/load runs
    Schema,
    /// Package written against different metadata
    Compatibility,
    /// Object graph that cannot be expressed in a package
    GraphShape,
    /// Value kind with no serializable representation
    Unsupported,
    /// Malformed or truncated package bytes
    Corrupt,
    /// Sink or source failure
    Io,
}

/// Serialization errors
///
/// Every variant aborts the current save or load; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum CregError {
    /// Class name registered more than once
    #[error("Duplicate class registration: {0}")]
    DuplicateClass(String),

    /// Base class name never registered
    #[error("Class {class} names unregistered base class {base}")]
    UnresolvedBase { class: String, base: String },

    /// Base accessor yields a type other than the named base class
    #[error("Class {class} base accessor does not yield {base}")]
    BaseTypeMismatch { class: String, base: String },

    /// Inheritance chain loops back on itself
    #[error("Inheritance cycle through class {0}")]
    InheritanceCycle(String),

    /// Field type refers to a class that was never registered
    #[error("Field {class}.{field} refers to unregistered class {target}")]
    UnresolvedFieldClass {
        class: String,
        field: String,
        target: String,
    },

    /// Two fields of one class share a name or an offset
    #[error("Class {class} declares field {field} twice (offset {offset})")]
    DuplicateField {
        class: String,
        field: String,
        offset: usize,
    },

    /// Registration attempted after the registry was frozen
    #[error("Class registry is already finalized")]
    RegistryFrozen,

    /// Rust type has no class descriptor
    #[error("Type {0} has no registered class")]
    UnregisteredType(&'static str),

    /// Package does not start with the expected magic tag
    #[error("Invalid package magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// Package names a class unknown to the local registry
    #[error("Package references unknown class {0}")]
    UnknownClass(String),

    /// Package metadata differs from the local registry
    #[error("Metadata checksum mismatch: package {package:#010x}, local {local:#010x}")]
    ChecksumMismatch { package: u32, local: u32 },

    /// An embedded object was reached a second time
    #[error("Reserialization of embedded object of class {0}")]
    ReserializedEmbedded(String),

    /// One identity used both as an embedded and as a referenced object
    #[error("Object of class {0} is both embedded and referenced")]
    EmbeddedAndReferenced(String),

    /// Object id outside [0, object count)
    #[error("Object id {id} out of range (object count {count})")]
    ObjectIdOutOfRange { id: i64, count: u32 },

    /// Pointer slot targets an embedded object
    #[error("Pointer targets embedded object {0}")]
    PointerToEmbedded(u32),

    /// Handle does not name a live object in the graph
    #[error("Dangling object reference {0}")]
    DanglingReference(u32),

    /// Object class is not the declared class or derived from it
    #[error("Class mismatch: expected {expected}, found {found}")]
    ClassMismatch { expected: String, found: String },

    /// Class cannot be default-constructed by the reader
    #[error("Class {0} cannot be constructed on load")]
    NotConstructible(String),

    /// Field value is not of the type its descriptor claims
    #[error("Field value does not match descriptor type {0}")]
    FieldTypeMismatch(String),

    /// Decoded integer does not fit the field's width
    #[error("Value {value} does not fit type {ty}")]
    ValueOutOfRange { ty: &'static str, value: i64 },

    /// A configured session limit was hit
    #[error("Capacity exceeded: {what} (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    /// Read past a section boundary
    #[error("Truncated package: {section} needs {needed} bytes at offset {offset}")]
    Truncated {
        section: &'static str,
        offset: usize,
        needed: usize,
    },

    /// Structurally invalid package
    #[error("Corrupt package: {0}")]
    Corrupt(String),

    /// Value kind that has no serializable form
    #[error("Unsupported value kind: {0}")]
    UnsupportedValue(String),

    /// Hook expected a session context that was not supplied
    #[error("Missing serializer context: {0}")]
    MissingContext(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CregError {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        use CregError::*;
        match self {
            DuplicateClass(_)
            | UnresolvedBase { .. }
            | BaseTypeMismatch { .. }
            | InheritanceCycle(_)
            | UnresolvedFieldClass { .. }
            | DuplicateField { .. }
            | RegistryFrozen
            | UnregisteredType(_) => ErrorCategory::Schema,
            InvalidMagic(_) | UnknownClass(_) | ChecksumMismatch { .. } => {
                ErrorCategory::Compatibility
            }
            ReserializedEmbedded(_)
            | EmbeddedAndReferenced(_)
            | ObjectIdOutOfRange { .. }
            | PointerToEmbedded(_)
            | DanglingReference(_)
            | ClassMismatch { .. }
            | NotConstructible(_)
            | FieldTypeMismatch(_)
            | CapacityExceeded { .. } => ErrorCategory::GraphShape,
            UnsupportedValue(_) | MissingContext(_) => ErrorCategory::Unsupported,
            ValueOutOfRange { .. } | Truncated { .. } | Corrupt(_) => ErrorCategory::Corrupt,
            Io(_) => ErrorCategory::Io,
        }
    }
}

/// Serialization result
pub type CregResult<T> = Result<T, CregError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            CregError::DuplicateClass("Unit".into()).category(),
            ErrorCategory::Schema
        );
        assert_eq!(
            CregError::ChecksumMismatch {
                package: 1,
                local: 2
            }
            .category(),
            ErrorCategory::Compatibility
        );
        assert_eq!(
            CregError::ReserializedEmbedded("Unit".into()).category(),
            ErrorCategory::GraphShape
        );
        assert_eq!(
            CregError::UnsupportedValue("handle".into()).category(),
            ErrorCategory::Unsupported
        );
    }

    #[test]
    fn test_display() {
        let err = CregError::ObjectIdOutOfRange { id: 9, count: 3 };
        assert_eq!(err.to_string(), "Object id 9 out of range (object count 3)");
    }
}
