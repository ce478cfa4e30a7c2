//! Type descriptors
//!
//! A [`TypeDescriptor`] says how one field value is written and read. It is a
//! closed set of shapes; composite shapes carry small erased adapters that
//! reach into the concrete Rust container without knowing its type.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::class::Reflect;
use crate::error::{CregError, CregResult};
use crate::graph::{ObjRef, Ptr};
use crate::serializer::Serializer;

/// Shared type descriptor
pub type TypeRef = Arc<TypeDescriptor>;

/// Scalar kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bool,
    I8,
    I16,
    I32,
    I64,
    Isize,
    U8,
    U16,
    U32,
    U64,
    Usize,
    F32,
    F64,
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::I8 => "i8",
            Primitive::I16 => "i16",
            Primitive::I32 => "i32",
            Primitive::I64 => "i64",
            Primitive::Isize => "isize",
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U32 => "u32",
            Primitive::U64 => "u64",
            Primitive::Usize => "usize",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
        }
    }

    /// In-memory width in bytes
    pub fn width(self) -> usize {
        match self {
            Primitive::Bool | Primitive::I8 | Primitive::U8 => 1,
            Primitive::I16 | Primitive::U16 => 2,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 4,
            Primitive::I64 | Primitive::U64 | Primitive::F64 => 8,
            Primitive::Isize | Primitive::Usize => std::mem::size_of::<usize>(),
        }
    }

    fn serialize(self, s: &mut dyn Serializer, value: &mut dyn Any) -> CregResult<()> {
        macro_rules! int {
            ($ty:ty) => {{
                let slot = value
                    .downcast_mut::<$ty>()
                    .ok_or_else(|| CregError::FieldTypeMismatch(self.name().into()))?;
                let mut wide = *slot as i64;
                s.serialize_int(&mut wide)?;
                if !s.is_writing() {
                    *slot = <$ty>::try_from(wide).map_err(|_| CregError::ValueOutOfRange {
                        ty: self.name(),
                        value: wide,
                    })?;
                }
                Ok(())
            }};
        }
        macro_rules! float {
            ($ty:ty) => {{
                let slot = value
                    .downcast_mut::<$ty>()
                    .ok_or_else(|| CregError::FieldTypeMismatch(self.name().into()))?;
                let mut bytes = slot.to_le_bytes();
                s.serialize_raw(&mut bytes)?;
                if !s.is_writing() {
                    *slot = <$ty>::from_le_bytes(bytes);
                }
                Ok(())
            }};
        }

        match self {
            Primitive::Bool => {
                let slot = value
                    .downcast_mut::<bool>()
                    .ok_or_else(|| CregError::FieldTypeMismatch(self.name().into()))?;
                s.serialize_bool(slot)
            }
            Primitive::I8 => int!(i8),
            Primitive::I16 => int!(i16),
            Primitive::I32 => int!(i32),
            Primitive::I64 => int!(i64),
            Primitive::Isize => int!(isize),
            Primitive::U8 => int!(u8),
            Primitive::U16 => int!(u16),
            Primitive::U32 => int!(u32),
            // full 64-bit range travels as the two's complement bit pattern
            Primitive::U64 => {
                let slot = value
                    .downcast_mut::<u64>()
                    .ok_or_else(|| CregError::FieldTypeMismatch(self.name().into()))?;
                let mut wide = *slot as i64;
                s.serialize_int(&mut wide)?;
                *slot = wide as u64;
                Ok(())
            }
            Primitive::Usize => {
                let slot = value
                    .downcast_mut::<usize>()
                    .ok_or_else(|| CregError::FieldTypeMismatch(self.name().into()))?;
                let mut wide = *slot as u64 as i64;
                s.serialize_int(&mut wide)?;
                if !s.is_writing() {
                    *slot = usize::try_from(wide as u64).map_err(|_| {
                        CregError::ValueOutOfRange {
                            ty: self.name(),
                            value: wide,
                        }
                    })?;
                }
                Ok(())
            }
            Primitive::F32 => float!(f32),
            Primitive::F64 => float!(f64),
        }
    }
}

/// Erased access to an array container
pub trait ArrayOps: Send + Sync {
    fn len(&self, array: &dyn Any) -> Option<usize>;

    /// Replace the contents with `len` default elements; false if the
    /// container cannot hold `len` elements
    fn resize(&self, array: &mut dyn Any, len: usize) -> bool;

    fn element_mut<'a>(&self, array: &'a mut dyn Any, index: usize) -> Option<&'a mut dyn Any>;
}

struct VecOps<E>(PhantomData<fn() -> E>);

impl<E: Any + Default> ArrayOps for VecOps<E> {
    fn len(&self, array: &dyn Any) -> Option<usize> {
        array.downcast_ref::<Vec<E>>().map(Vec::len)
    }

    fn resize(&self, array: &mut dyn Any, len: usize) -> bool {
        match array.downcast_mut::<Vec<E>>() {
            Some(vec) => {
                vec.clear();
                vec.resize_with(len, E::default);
                true
            }
            None => false,
        }
    }

    fn element_mut<'a>(&self, array: &'a mut dyn Any, index: usize) -> Option<&'a mut dyn Any> {
        let elem: &mut dyn Any = array.downcast_mut::<Vec<E>>()?.get_mut(index)?;
        Some(elem)
    }
}

struct FixedOps<E, const N: usize>(PhantomData<fn() -> E>);

impl<E: Any, const N: usize> ArrayOps for FixedOps<E, N> {
    fn len(&self, array: &dyn Any) -> Option<usize> {
        array.downcast_ref::<[E; N]>().map(|_| N)
    }

    fn resize(&self, array: &mut dyn Any, len: usize) -> bool {
        len == N && array.is::<[E; N]>()
    }

    fn element_mut<'a>(&self, array: &'a mut dyn Any, index: usize) -> Option<&'a mut dyn Any> {
        let elem: &mut dyn Any = array.downcast_mut::<[E; N]>()?.get_mut(index)?;
        Some(elem)
    }
}

/// Erased access to a fieldless enum
pub trait EnumOps: Send + Sync {
    fn get(&self, value: &dyn Any) -> Option<i64>;

    fn set(&self, value: &mut dyn Any, raw: i64) -> CregResult<()>;
}

/// Enum stored as its discriminant
pub trait ReflectEnum: Any + Copy {
    const NAME: &'static str;

    fn to_raw(self) -> i64;

    fn from_raw(raw: i64) -> Option<Self>;
}

struct EnumAdapter<E>(PhantomData<fn() -> E>);

impl<E: ReflectEnum> EnumOps for EnumAdapter<E> {
    fn get(&self, value: &dyn Any) -> Option<i64> {
        value.downcast_ref::<E>().map(|e| e.to_raw())
    }

    fn set(&self, value: &mut dyn Any, raw: i64) -> CregResult<()> {
        let slot = value
            .downcast_mut::<E>()
            .ok_or_else(|| CregError::FieldTypeMismatch(format!("enum {}", E::NAME)))?;
        *slot = E::from_raw(raw).ok_or(CregError::ValueOutOfRange { ty: E::NAME, value: raw })?;
        Ok(())
    }
}

/// Erased access to a pointer slot
pub trait PointerOps: Send + Sync {
    fn slot_mut<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut Option<ObjRef>>;
}

struct PtrOps<T>(PhantomData<fn() -> T>);

impl<T: 'static> PointerOps for PtrOps<T> {
    fn slot_mut<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut Option<ObjRef>> {
        value.downcast_mut::<Ptr<T>>().map(Ptr::raw_mut)
    }
}

pub struct ArrayType {
    pub elem: TypeRef,
    /// Element count for fixed arrays, zero for growable ones
    pub len: usize,
    ops: Box<dyn ArrayOps>,
}

pub struct EnumType {
    pub name: &'static str,
    ops: Box<dyn EnumOps>,
}

pub struct PointerType {
    pub class: &'static str,
    ops: Box<dyn PointerOps>,
}

/// How one field value is serialized
pub enum TypeDescriptor {
    Primitive(Primitive),
    Enum(EnumType),
    String,
    FixedArray(ArrayType),
    DynamicArray(ArrayType),
    /// Instance stored inline, by class name
    EmbeddedInstance(&'static str),
    /// Pointer to a referenced object, by declared class name
    ObjectPointer(PointerType),
    /// Placeholder of the given byte count; the value itself is untouched
    Ignored(usize),
}

impl TypeDescriptor {
    pub fn enumeration<E: ReflectEnum>() -> Self {
        TypeDescriptor::Enum(EnumType {
            name: E::NAME,
            ops: Box::new(EnumAdapter::<E>(PhantomData)),
        })
    }

    pub fn pointer<T: Reflect>() -> Self {
        TypeDescriptor::ObjectPointer(PointerType {
            class: T::CLASS,
            ops: Box::new(PtrOps::<T>(PhantomData)),
        })
    }

    /// Stable textual signature, folded into class checksums
    pub fn signature(&self) -> String {
        match self {
            TypeDescriptor::Primitive(p) => p.name().to_string(),
            TypeDescriptor::Enum(e) => format!("enum {}", e.name),
            TypeDescriptor::String => "String".to_string(),
            TypeDescriptor::FixedArray(a) => format!("[{}; {}]", a.elem.signature(), a.len),
            TypeDescriptor::DynamicArray(a) => format!("Vec<{}>", a.elem.signature()),
            TypeDescriptor::EmbeddedInstance(class) => (*class).to_string(),
            TypeDescriptor::ObjectPointer(p) => format!("*{}", p.class),
            TypeDescriptor::Ignored(n) => format!("ignored[{n}]"),
        }
    }

    /// Class names this descriptor depends on
    pub fn class_names(&self, out: &mut Vec<&'static str>) {
        match self {
            TypeDescriptor::FixedArray(a) | TypeDescriptor::DynamicArray(a) => {
                a.elem.class_names(out)
            }
            TypeDescriptor::EmbeddedInstance(class) => out.push(*class),
            TypeDescriptor::ObjectPointer(p) => out.push(p.class),
            _ => {}
        }
    }

    /// True if values of this type contain embedded instances
    pub fn has_embedded(&self) -> bool {
        match self {
            TypeDescriptor::EmbeddedInstance(_) => true,
            TypeDescriptor::FixedArray(a) | TypeDescriptor::DynamicArray(a) => a.elem.has_embedded(),
            _ => false,
        }
    }

    /// Fewest bytes one value of this type occupies on the wire
    pub fn min_wire_size(&self) -> usize {
        match self {
            TypeDescriptor::Primitive(Primitive::F32) => 4,
            TypeDescriptor::Primitive(_)
            | TypeDescriptor::Enum(_)
            | TypeDescriptor::String
            | TypeDescriptor::DynamicArray(_)
            | TypeDescriptor::ObjectPointer(_) => 8,
            TypeDescriptor::FixedArray(a) => a.len.saturating_mul(a.elem.min_wire_size()),
            TypeDescriptor::EmbeddedInstance(_) => 0,
            TypeDescriptor::Ignored(n) => *n,
        }
    }

    /// Embedded object records one value of this type takes at least
    pub fn min_embedded(&self) -> usize {
        match self {
            TypeDescriptor::EmbeddedInstance(_) => 1,
            TypeDescriptor::FixedArray(a) => a.len.saturating_mul(a.elem.min_embedded()),
            _ => 0,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayType> {
        match self {
            TypeDescriptor::FixedArray(a) | TypeDescriptor::DynamicArray(a) => Some(a),
            _ => None,
        }
    }

    fn mismatch(&self) -> CregError {
        CregError::FieldTypeMismatch(self.signature())
    }

    /// Write or read one value of this type
    pub fn serialize(&self, s: &mut dyn Serializer, value: &mut dyn Any) -> CregResult<()> {
        match self {
            TypeDescriptor::Primitive(p) => p.serialize(s, value),
            TypeDescriptor::Enum(e) => {
                let mut raw = if s.is_writing() {
                    e.ops.get(value).ok_or_else(|| self.mismatch())?
                } else {
                    0
                };
                s.serialize_int(&mut raw)?;
                if !s.is_writing() {
                    e.ops.set(value, raw)?;
                }
                Ok(())
            }
            TypeDescriptor::String => {
                let value = value
                    .downcast_mut::<String>()
                    .ok_or_else(|| self.mismatch())?;
                s.serialize_string(value)
            }
            TypeDescriptor::FixedArray(a) => {
                let len = a.ops.len(value).ok_or_else(|| self.mismatch())?;
                a.serialize_elements(s, value, len)
            }
            TypeDescriptor::DynamicArray(a) => {
                let mut len = if s.is_writing() {
                    a.ops.len(value).ok_or_else(|| self.mismatch())?
                } else {
                    0
                };
                s.serialize_len(&mut len)?;
                if !s.is_writing() {
                    s.check_elements(len, &a.elem)?;
                    if !a.ops.resize(value, len) {
                        return Err(self.mismatch());
                    }
                }
                a.serialize_elements(s, value, len)
            }
            TypeDescriptor::EmbeddedInstance(name) => {
                let class = s.registry().require(name)?;
                s.serialize_object_instance(value, class)
            }
            TypeDescriptor::ObjectPointer(p) => {
                let class = s.registry().require(p.class)?;
                let slot = p.ops.slot_mut(value).ok_or_else(|| self.mismatch())?;
                s.serialize_object_ptr(slot, class)
            }
            TypeDescriptor::Ignored(n) => {
                let mut pad = vec![0u8; *n];
                s.serialize_raw(&mut pad)
            }
        }
    }
}

impl ArrayType {
    fn serialize_elements(
        &self,
        s: &mut dyn Serializer,
        array: &mut dyn Any,
        len: usize,
    ) -> CregResult<()> {
        for index in 0..len {
            let elem = self
                .element_mut(array, index)
                .ok_or_else(|| CregError::FieldTypeMismatch(self.elem.signature()))?;
            self.elem.serialize(s, elem)?;
        }
        Ok(())
    }

    pub fn len(&self, array: &dyn Any) -> Option<usize> {
        self.ops.len(array)
    }

    pub fn element_mut<'a>(&self, array: &'a mut dyn Any, index: usize) -> Option<&'a mut dyn Any> {
        self.ops.element_mut(array, index)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDescriptor({})", self.signature())
    }
}

/// Types with a statically known descriptor
pub trait DeduceType: Any {
    fn describe() -> TypeDescriptor;
}

macro_rules! primitive_types {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl DeduceType for $ty {
                fn describe() -> TypeDescriptor {
                    TypeDescriptor::Primitive(Primitive::$kind)
                }
            }
        )*
    };
}

primitive_types! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    isize => Isize,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    usize => Usize,
    f32 => F32,
    f64 => F64,
}

impl DeduceType for String {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::String
    }
}

impl<E: DeduceType + Default> DeduceType for Vec<E> {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::DynamicArray(ArrayType {
            elem: Arc::new(E::describe()),
            len: 0,
            ops: Box::new(VecOps::<E>(PhantomData)),
        })
    }
}

impl<E: DeduceType, const N: usize> DeduceType for [E; N] {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::FixedArray(ArrayType {
            elem: Arc::new(E::describe()),
            len: N,
            ops: Box::new(FixedOps::<E, N>(PhantomData)),
        })
    }
}

impl<T: Reflect> DeduceType for Ptr<T> {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::pointer::<T>()
    }
}

/// Describe registered classes as inline field types
#[macro_export]
macro_rules! impl_embedded {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::DeduceType for $ty {
                fn describe() -> $crate::TypeDescriptor {
                    $crate::TypeDescriptor::EmbeddedInstance(<$ty as $crate::Reflect>::CLASS)
                }
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Mode {
        Idle,
        Busy,
    }

    impl ReflectEnum for Mode {
        const NAME: &'static str = "Mode";

        fn to_raw(self) -> i64 {
            self as i64
        }

        fn from_raw(raw: i64) -> Option<Self> {
            match raw {
                0 => Some(Mode::Idle),
                1 => Some(Mode::Busy),
                _ => None,
            }
        }
    }

    #[test]
    fn test_signatures() {
        assert_eq!(i32::describe().signature(), "i32");
        assert_eq!(<Vec<u16>>::describe().signature(), "Vec<u16>");
        assert_eq!(<[f64; 3]>::describe().signature(), "[f64; 3]");
        assert_eq!(<Vec<[u8; 2]>>::describe().signature(), "Vec<[u8; 2]>");
        assert_eq!(TypeDescriptor::enumeration::<Mode>().signature(), "enum Mode");
        assert_eq!(TypeDescriptor::Ignored(8).signature(), "ignored[8]");
    }

    #[test]
    fn test_vec_ops() {
        let ty = <Vec<i32>>::describe();
        let array = ty.as_array().unwrap();
        let mut value: Vec<i32> = vec![1, 2, 3];
        assert_eq!(array.len(&value), Some(3));
        let elem = array.element_mut(&mut value, 1).unwrap();
        *elem.downcast_mut::<i32>().unwrap() = 20;
        assert_eq!(value, vec![1, 20, 3]);
        assert!(array.element_mut(&mut value, 3).is_none());
        assert_eq!(array.len(&5u8), None);
    }

    #[test]
    fn test_fixed_ops_reject_resize() {
        let ty = <[u8; 4]>::describe();
        let TypeDescriptor::FixedArray(array) = &ty else {
            panic!("expected fixed array");
        };
        let mut value = [0u8; 4];
        assert!(array.ops.resize(&mut value, 4));
        assert!(!array.ops.resize(&mut value, 5));
    }

    #[test]
    fn test_enum_ops() {
        let TypeDescriptor::Enum(e) = TypeDescriptor::enumeration::<Mode>() else {
            panic!("expected enum");
        };
        let mut mode = Mode::Idle;
        e.ops.set(&mut mode, 1).unwrap();
        assert_eq!(mode, Mode::Busy);
        assert_eq!(e.ops.get(&mode), Some(1));
        assert!(matches!(
            e.ops.set(&mut mode, 7),
            Err(CregError::ValueOutOfRange { value: 7, .. })
        ));
    }

    #[test]
    fn test_min_wire_size() {
        assert_eq!(bool::describe().min_wire_size(), 8);
        assert_eq!(f32::describe().min_wire_size(), 4);
        assert_eq!(<[u16; 3]>::describe().min_wire_size(), 24);
        assert_eq!(<Vec<u8>>::describe().min_wire_size(), 8);
        assert_eq!(TypeDescriptor::EmbeddedInstance("Node").min_wire_size(), 0);
        assert_eq!(TypeDescriptor::EmbeddedInstance("Node").min_embedded(), 1);
        assert_eq!(<[i32; 2]>::describe().min_embedded(), 0);
    }

    #[test]
    fn test_has_embedded() {
        assert!(!<Vec<i64>>::describe().has_embedded());
        assert!(TypeDescriptor::EmbeddedInstance("Node").has_embedded());
    }
}
