//! Class and field descriptors
//!
//! A [`ClassDescriptor`] lists the serializable fields of one Rust type, its
//! optional base class and its optional hooks. Base classes are modelled as
//! composition: the derived type holds its base as a field and the descriptor
//! carries an accessor to it.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::CregResult;
use crate::serializer::Serializer;
use crate::types::{DeduceType, TypeDescriptor, TypeRef};

/// Index of a class in a finalized [`ClassRegistry`](crate::ClassRegistry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A Rust type registered under a class name
pub trait Reflect: Any + Send {
    const CLASS: &'static str;
}

/// Custom serialize hook, run after the class's own fields
pub type SerializeFn<T> = fn(&mut T, &mut dyn Serializer) -> CregResult<()>;

/// Hook run once the whole graph is loaded
pub type PostLoadFn<T> = fn(&mut T) -> CregResult<()>;

type ConstructFn = fn() -> Box<dyn Any + Send>;

pub(crate) trait FieldAccess: Send + Sync {
    fn get_mut<'a>(&self, owner: &'a mut dyn Any) -> Option<&'a mut dyn Any>;
}

struct Accessor<T, F> {
    get: fn(&mut T) -> &mut F,
}

impl<T: Any, F: Any> FieldAccess for Accessor<T, F> {
    fn get_mut<'a>(&self, owner: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        let owner = owner.downcast_mut::<T>()?;
        let field: &mut dyn Any = (self.get)(owner);
        Some(field)
    }
}

trait SerializeHook: Send + Sync {
    fn call(&self, object: &mut dyn Any, s: &mut dyn Serializer) -> Option<CregResult<()>>;
}

trait PostLoadHook: Send + Sync {
    fn call(&self, object: &mut dyn Any) -> Option<CregResult<()>>;
}

struct TypedHook<F> {
    f: F,
}

impl<T: Any> SerializeHook for TypedHook<SerializeFn<T>> {
    fn call(&self, object: &mut dyn Any, s: &mut dyn Serializer) -> Option<CregResult<()>> {
        object.downcast_mut::<T>().map(|o| (self.f)(o, s))
    }
}

impl<T: Any> PostLoadHook for TypedHook<PostLoadFn<T>> {
    fn call(&self, object: &mut dyn Any) -> Option<CregResult<()>> {
        object.downcast_mut::<T>().map(|o| (self.f)(o))
    }
}

/// Per-field flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(u8);

impl FieldFlags {
    /// Field is part of the metadata but never written
    pub const NO_SERIALIZE: FieldFlags = FieldFlags(0x01);

    pub fn contains(self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

/// One member of a class
pub struct FieldDescriptor {
    name: &'static str,
    offset: usize,
    ty: TypeRef,
    flags: FieldFlags,
    access: Option<Box<dyn FieldAccess>>,
}

impl FieldDescriptor {
    /// Field of type `F` reached through `get`
    pub fn member<T: Any, F: DeduceType>(
        name: &'static str,
        offset: usize,
        get: fn(&mut T) -> &mut F,
    ) -> Self {
        Self {
            name,
            offset,
            ty: Arc::new(F::describe()),
            flags: FieldFlags::default(),
            access: Some(Box::new(Accessor { get })),
        }
    }

    /// Field with an explicit descriptor, for types without [`DeduceType`]
    pub fn with_type<T: Any, F: Any>(
        name: &'static str,
        offset: usize,
        ty: TypeDescriptor,
        get: fn(&mut T) -> &mut F,
    ) -> Self {
        Self {
            name,
            offset,
            ty: Arc::new(ty),
            flags: FieldFlags::default(),
            access: Some(Box::new(Accessor { get })),
        }
    }

    /// Placeholder for a field whose contents are never persisted
    pub fn ignored(name: &'static str, offset: usize, size: usize) -> Self {
        Self {
            name,
            offset,
            ty: Arc::new(TypeDescriptor::Ignored(size)),
            flags: FieldFlags::default(),
            access: None,
        }
    }

    pub fn no_serialize(mut self) -> Self {
        self.flags = FieldFlags(self.flags.0 | FieldFlags::NO_SERIALIZE.0);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    pub fn flags(&self) -> FieldFlags {
        self.flags
    }

    /// True if the field contributes no bytes
    pub fn is_skipped(&self) -> bool {
        self.flags.contains(FieldFlags::NO_SERIALIZE)
    }

    pub(crate) fn set_type(&mut self, ty: TypeRef) {
        self.ty = ty;
    }

    /// Borrow the field inside an owner; `None` for ignored fields or a
    /// foreign owner type
    pub fn access_mut<'a>(&self, owner: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        self.access.as_ref()?.get_mut(owner)
    }

    /// Write or read this field of `owner`
    pub fn serialize(&self, s: &mut dyn Serializer, owner: &mut dyn Any) -> CregResult<()> {
        match self.access_mut(owner) {
            Some(value) => self.ty.serialize(s, value),
            // placeholders never look at the value
            None => self.ty.serialize(s, &mut ()),
        }
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("type", &self.ty.signature())
            .field("flags", &self.flags)
            .finish()
    }
}

pub(crate) struct BaseLink {
    pub(crate) name: &'static str,
    pub(crate) type_id: TypeId,
    access: Box<dyn FieldAccess>,
}

/// Class flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassFlags(u8);

impl ClassFlags {
    /// Objects may be addressed through a pointer to another class in the
    /// same inheritance chain
    pub const POLYMORPHIC: ClassFlags = ClassFlags(0x01);

    pub fn contains(self, other: ClassFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Metadata for one registered class
pub struct ClassDescriptor {
    pub(crate) name: &'static str,
    pub(crate) type_id: TypeId,
    type_name: &'static str,
    pub(crate) base: Option<BaseLink>,
    pub(crate) fields: Vec<FieldDescriptor>,
    size: usize,
    align: usize,
    pub(crate) flags: ClassFlags,
    construct: Option<ConstructFn>,
    serializer: Option<Box<dyn SerializeHook>>,
    post_load: Option<Box<dyn PostLoadHook>>,
    pub(crate) id: ClassId,
    pub(crate) base_id: Option<ClassId>,
    pub(crate) checksum: u32,
}

impl ClassDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Base class, resolved at finalization
    pub fn base(&self) -> Option<ClassId> {
        self.base_id
    }

    pub fn base_name(&self) -> Option<&'static str> {
        self.base.as_ref().map(|b| b.name)
    }

    /// Fields declared by this class, base fields excluded
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name, for diagnostics
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// Checksum over this class and its inherited fields
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn is_constructible(&self) -> bool {
        self.construct.is_some()
    }

    pub fn has_serializer(&self) -> bool {
        self.serializer.is_some()
    }

    pub fn has_post_load(&self) -> bool {
        self.post_load.is_some()
    }

    /// Default-initialized instance
    pub fn construct(&self) -> Option<Box<dyn Any + Send>> {
        self.construct.map(|f| f())
    }

    /// Borrow the base-class part of an instance
    pub fn base_mut<'a>(&self, object: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        self.base.as_ref()?.access.get_mut(object)
    }

    pub(crate) fn run_serializer(
        &self,
        object: &mut dyn Any,
        s: &mut dyn Serializer,
    ) -> Option<CregResult<()>> {
        self.serializer.as_ref()?.call(object, s)
    }

    pub(crate) fn run_post_load(&self, object: &mut dyn Any) -> Option<CregResult<()>> {
        self.post_load.as_ref()?.call(object)
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("base", &self.base_name())
            .field("fields", &self.fields)
            .field("size", &self.size)
            .field("checksum", &format_args!("{:#010x}", self.checksum))
            .finish()
    }
}

fn construct_default<T: Default + Send + 'static>() -> Box<dyn Any + Send> {
    Box::new(T::default())
}

/// Builder for the descriptor of `T`
///
/// ```ignore
/// let class = ClassBuilder::<Unit>::new()
///     .field(member!(Unit, health))
///     .field(member!(Unit, target))
///     .post_load(Unit::post_load)
///     .build();
/// ```
pub struct ClassBuilder<T> {
    desc: ClassDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Reflect + Default> ClassBuilder<T> {
    /// Builder for a class the reader can default-construct
    pub fn new() -> Self {
        let mut builder = Self::abstract_class();
        builder.desc.construct = Some(construct_default::<T>);
        builder
    }
}

impl<T: Reflect + Default> Default for ClassBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reflect> ClassBuilder<T> {
    /// Builder for a class that is only ever embedded or used as a base
    pub fn abstract_class() -> Self {
        Self {
            desc: ClassDescriptor {
                name: T::CLASS,
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                base: None,
                fields: Vec::new(),
                size: std::mem::size_of::<T>(),
                align: std::mem::align_of::<T>(),
                flags: ClassFlags::default(),
                construct: None,
                serializer: None,
                post_load: None,
                id: ClassId(u32::MAX),
                base_id: None,
                checksum: 0,
            },
            _marker: PhantomData,
        }
    }

    /// Declare the base class held inside `T`
    pub fn base<B: Reflect>(mut self, get: fn(&mut T) -> &mut B) -> Self {
        self.desc.base = Some(BaseLink {
            name: B::CLASS,
            type_id: TypeId::of::<B>(),
            access: Box::new(Accessor { get }),
        });
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.desc.fields.push(field);
        self
    }

    pub fn serializer(mut self, f: SerializeFn<T>) -> Self {
        self.desc.serializer = Some(Box::new(TypedHook { f }));
        self
    }

    pub fn post_load(mut self, f: PostLoadFn<T>) -> Self {
        self.desc.post_load = Some(Box::new(TypedHook { f }));
        self
    }

    pub fn build(self) -> ClassDescriptor {
        self.desc
    }
}

/// Byte size of a field type, for [`ignored!`](crate::ignored)
pub fn field_size<T, F>(_: fn(&T) -> &F) -> usize {
    std::mem::size_of::<F>()
}

/// Field descriptor for `owner.field`, type deduced
#[macro_export]
macro_rules! member {
    ($owner:ty, $field:ident) => {
        $crate::FieldDescriptor::member::<$owner, _>(
            stringify!($field),
            ::std::mem::offset_of!($owner, $field),
            |owner: &mut $owner| &mut owner.$field,
        )
    };
}

/// Placeholder descriptor for `owner.field`
#[macro_export]
macro_rules! ignored {
    ($owner:ty, $field:ident) => {
        $crate::FieldDescriptor::ignored(
            stringify!($field),
            ::std::mem::offset_of!($owner, $field),
            $crate::class::field_size(|owner: &$owner| &owner.$field),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Ptr;

    #[derive(Default)]
    struct Header {
        tag: u8,
    }

    impl Reflect for Header {
        const CLASS: &'static str = "Header";
    }

    #[derive(Default)]
    struct Body {
        header: Header,
        count: i32,
        next: Ptr<Body>,
        cache: Vec<u64>,
    }

    impl Reflect for Body {
        const CLASS: &'static str = "Body";
    }

    fn bump(body: &mut Body) -> CregResult<()> {
        body.count += 1;
        Ok(())
    }

    #[test]
    fn test_builder_collects_fields() {
        let class = ClassBuilder::<Body>::new()
            .base(|b: &mut Body| &mut b.header)
            .field(member!(Body, count))
            .field(member!(Body, next))
            .field(ignored!(Body, cache))
            .post_load(bump)
            .build();

        assert_eq!(class.name(), "Body");
        assert_eq!(class.base_name(), Some("Header"));
        assert_eq!(class.fields().len(), 3);
        assert_eq!(class.field("count").unwrap().ty().signature(), "i32");
        assert_eq!(class.field("next").unwrap().ty().signature(), "*Body");
        assert_eq!(
            class.field("cache").unwrap().ty().signature(),
            format!("ignored[{}]", std::mem::size_of::<Vec<u64>>())
        );
        assert!(class.is_constructible());
        assert!(class.has_post_load());
        assert_eq!(class.size(), std::mem::size_of::<Body>());
    }

    #[test]
    fn test_field_access() {
        let field = member!(Body, count);
        let mut body = Body::default();
        *field
            .access_mut(&mut body)
            .unwrap()
            .downcast_mut::<i32>()
            .unwrap() = 7;
        assert_eq!(body.count, 7);

        let mut header = Header::default();
        assert!(field.access_mut(&mut header).is_none());
        assert!(ignored!(Body, cache).access_mut(&mut body).is_none());
        assert_eq!(header.tag, 0);
    }

    #[test]
    fn test_hooks_and_base() {
        let class = ClassBuilder::<Body>::new()
            .base(|b: &mut Body| &mut b.header)
            .post_load(bump)
            .build();
        let mut object = class.construct().unwrap();
        let any: &mut dyn Any = &mut *object;
        assert!(class.run_post_load(any).unwrap().is_ok());
        assert_eq!(object.downcast_ref::<Body>().unwrap().count, 1);

        let any: &mut dyn Any = &mut *object;
        let header = class.base_mut(any).unwrap();
        header.downcast_mut::<Header>().unwrap().tag = 3;
        assert_eq!(object.downcast_ref::<Body>().unwrap().header.tag, 3);
    }

    #[test]
    fn test_no_serialize_flag() {
        let field = member!(Body, count).no_serialize();
        assert!(field.is_skipped());
        assert!(!member!(Body, count).is_skipped());
    }
}
