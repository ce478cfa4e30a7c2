//! Object arena
//!
//! Referenced objects live in an [`ObjectGraph`] and are addressed by
//! [`ObjRef`] handles. A handle is an arena index; it is stable for the
//! lifetime of the graph and never persisted.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::class::{ClassId, Reflect};
use crate::error::{CregError, CregResult};
use crate::registry::ClassRegistry;

/// Handle to an object stored in an [`ObjectGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    pub(crate) fn from_index(index: usize) -> Self {
        // index + 1 is never zero; arena size is bounded by u32 on insert
        ObjRef(NonZeroU32::MIN.saturating_add(index as u32))
    }

    /// Arena slot index
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Raw handle value (never zero)
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Typed, nullable object pointer
///
/// The type parameter names the declared class of the pointer; the target may
/// be an instance of a class derived from it.
pub struct Ptr<T> {
    raw: Option<ObjRef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Ptr<T> {
    /// Null pointer
    pub const fn null() -> Self {
        Self {
            raw: None,
            _marker: PhantomData,
        }
    }

    /// Pointer to an arena object
    pub const fn new(target: ObjRef) -> Self {
        Self {
            raw: Some(target),
            _marker: PhantomData,
        }
    }

    pub fn from_raw(raw: Option<ObjRef>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(self) -> Option<ObjRef> {
        self.raw
    }

    pub fn raw_mut(&mut self) -> &mut Option<ObjRef> {
        &mut self.raw
    }

    pub fn is_null(self) -> bool {
        self.raw.is_none()
    }

    /// Reinterpret the declared class
    pub fn cast<U>(self) -> Ptr<U> {
        Ptr::from_raw(self.raw)
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ptr<T> {}

impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> Hash for Ptr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(r) => write!(f, "Ptr({})", r.get()),
            None => write!(f, "Ptr(null)"),
        }
    }
}

struct Slot {
    class: ClassId,
    object: Box<dyn Any + Send>,
}

/// Arena of referenced objects
///
/// Every object is tagged with its registered class when inserted, so the
/// serializer never has to ask an object for its class.
pub struct ObjectGraph {
    registry: Arc<ClassRegistry>,
    slots: Vec<Option<Slot>>,
    live: usize,
}

impl ObjectGraph {
    /// Create an empty graph bound to a finalized registry
    pub fn new(registry: Arc<ClassRegistry>) -> Self {
        Self {
            registry,
            slots: Vec::new(),
            live: 0,
        }
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Insert an object of a registered class
    pub fn insert<T: Reflect>(&mut self, value: T) -> CregResult<Ptr<T>> {
        let class = self
            .registry
            .class_of_type(TypeId::of::<T>())
            .ok_or(CregError::UnregisteredType(std::any::type_name::<T>()))?;
        self.insert_boxed(class, Box::new(value)).map(Ptr::new)
    }

    pub(crate) fn insert_boxed(
        &mut self,
        class: ClassId,
        object: Box<dyn Any + Send>,
    ) -> CregResult<ObjRef> {
        if self.slots.len() >= (u32::MAX - 1) as usize {
            return Err(CregError::CapacityExceeded {
                what: "graph objects",
                limit: (u32::MAX - 1) as usize,
            });
        }
        let r = ObjRef::from_index(self.slots.len());
        self.slots.push(Some(Slot { class, object }));
        self.live += 1;
        Ok(r)
    }

    /// Remove an object; pointers to it become dangling
    pub fn remove(&mut self, r: ObjRef) -> Option<Box<dyn Any + Send>> {
        let slot = self.slots.get_mut(r.index())?.take()?;
        self.live -= 1;
        Some(slot.object)
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        matches!(self.slots.get(r.index()), Some(Some(_)))
    }

    /// Class an object was inserted with
    pub fn class_of(&self, r: ObjRef) -> Option<ClassId> {
        self.slots.get(r.index())?.as_ref().map(|s| s.class)
    }

    /// Borrow an object through a typed pointer
    pub fn get<T: Any>(&self, ptr: Ptr<T>) -> Option<&T> {
        self.get_as::<T>(ptr.raw()?)
    }

    pub fn get_mut<T: Any>(&mut self, ptr: Ptr<T>) -> Option<&mut T> {
        self.get_as_mut::<T>(ptr.raw()?)
    }

    /// Borrow an object as a concrete type, e.g. a derived class
    pub fn get_as<T: Any>(&self, r: ObjRef) -> Option<&T> {
        self.slots.get(r.index())?.as_ref()?.object.downcast_ref::<T>()
    }

    pub fn get_as_mut<T: Any>(&mut self, r: ObjRef) -> Option<&mut T> {
        self.slots
            .get_mut(r.index())?
            .as_mut()?
            .object
            .downcast_mut::<T>()
    }

    pub(crate) fn object_mut(&mut self, r: ObjRef) -> Option<&mut dyn Any> {
        let slot = self.slots.get_mut(r.index())?.as_mut()?;
        let object: &mut dyn Any = &mut *slot.object;
        Some(object)
    }

    /// Class of every slot, indexed by [`ObjRef::index`]
    pub(crate) fn class_table(&self) -> Vec<Option<ClassId>> {
        self.slots
            .iter()
            .map(|s| s.as_ref().map(|s| s.class))
            .collect()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles of all live objects in insertion order
    pub fn refs(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| ObjRef::from_index(i))
    }
}

impl fmt::Debug for ObjectGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectGraph")
            .field("objects", &self.live)
            .field("slots", &self.slots.len())
            .finish()
    }
}
