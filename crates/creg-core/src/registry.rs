//! Class metadata registry
//!
//! Registration has two phases. A [`RegistryBuilder`] accumulates class
//! descriptors in any order; [`RegistryBuilder::finalize`] resolves base
//! links, validates every class and computes checksums, producing an
//! immutable [`ClassRegistry`] that any number of sessions may share.
//!
//! A process-wide registry follows the same lifecycle through
//! [`register_global`] and [`finalize_global`].

use std::any::TypeId;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::class::{ClassDescriptor, ClassFlags, ClassId};
use crate::error::{CregError, CregResult};
use crate::types::TypeRef;

/// Accumulates class registrations
#[derive(Default)]
pub struct RegistryBuilder {
    classes: Vec<ClassDescriptor>,
    by_name: FxHashMap<&'static str, usize>,
    by_type: FxHashMap<TypeId, usize>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class; a name or Rust type seen before is rejected
    pub fn register(&mut self, class: ClassDescriptor) -> CregResult<&mut Self> {
        if self.by_name.contains_key(class.name) {
            return Err(CregError::DuplicateClass(class.name.to_string()));
        }
        if let Some(&existing) = self.by_type.get(&class.type_id) {
            return Err(CregError::DuplicateClass(format!(
                "{} (type {} already registered as {})",
                class.name,
                class.type_name(),
                self.classes[existing].name
            )));
        }
        let index = self.classes.len();
        self.by_name.insert(class.name, index);
        self.by_type.insert(class.type_id, index);
        self.classes.push(class);
        Ok(self)
    }

    /// Chaining form of [`register`](Self::register)
    pub fn with(mut self, class: ClassDescriptor) -> CregResult<Self> {
        self.register(class)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Resolve, validate and freeze
    pub fn finalize(self) -> CregResult<ClassRegistry> {
        let RegistryBuilder {
            mut classes,
            by_name,
            by_type,
        } = self;

        for (index, class) in classes.iter_mut().enumerate() {
            class.id = ClassId(index as u32);
        }

        // base links
        let mut base_ids = Vec::with_capacity(classes.len());
        for class in &classes {
            let base_id = match &class.base {
                None => None,
                Some(link) => {
                    let &base = by_name.get(link.name).ok_or_else(|| CregError::UnresolvedBase {
                        class: class.name.to_string(),
                        base: link.name.to_string(),
                    })?;
                    if classes[base].type_id != link.type_id {
                        return Err(CregError::BaseTypeMismatch {
                            class: class.name.to_string(),
                            base: link.name.to_string(),
                        });
                    }
                    Some(ClassId(base as u32))
                }
            };
            base_ids.push(base_id);
        }
        for (class, base_id) in classes.iter_mut().zip(&base_ids) {
            class.base_id = *base_id;
        }

        for start in 0..classes.len() {
            let mut seen = FxHashSet::default();
            let mut current = Some(start);
            while let Some(index) = current {
                if !seen.insert(index) {
                    return Err(CregError::InheritanceCycle(classes[start].name.to_string()));
                }
                current = base_ids[index].map(ClassId::index);
            }
        }

        // fields
        let mut interned: FxHashMap<String, TypeRef> = FxHashMap::default();
        for class in &mut classes {
            let mut names = FxHashSet::default();
            let mut offsets = FxHashSet::default();
            for field in &mut class.fields {
                if !names.insert(field.name()) || !offsets.insert(field.offset()) {
                    return Err(CregError::DuplicateField {
                        class: class.name.to_string(),
                        field: field.name().to_string(),
                        offset: field.offset(),
                    });
                }
                let mut targets = Vec::new();
                field.ty().class_names(&mut targets);
                if let Some(missing) = targets.iter().find(|t| !by_name.contains_key(*t)) {
                    return Err(CregError::UnresolvedFieldClass {
                        class: class.name.to_string(),
                        field: field.name().to_string(),
                        target: missing.to_string(),
                    });
                }
                let shared = interned
                    .entry(field.ty().signature())
                    .or_insert_with(|| field.ty().clone())
                    .clone();
                field.set_type(shared);
            }
        }

        for index in 0..classes.len() {
            if let Some(base) = base_ids[index] {
                classes[index].flags = ClassFlags::POLYMORPHIC;
                classes[base.index()].flags = ClassFlags::POLYMORPHIC;
            }
        }

        let checksums: Vec<u32> = (0..classes.len())
            .map(|index| class_checksum(&classes, &base_ids, index))
            .collect();
        for (class, checksum) in classes.iter_mut().zip(checksums) {
            class.checksum = checksum;
        }

        log::debug!(
            "class registry finalized: {} classes, {} shared type descriptors",
            classes.len(),
            interned.len()
        );

        Ok(ClassRegistry {
            by_name: by_name
                .into_iter()
                .map(|(name, index)| (name, ClassId(index as u32)))
                .collect(),
            by_type: by_type
                .into_iter()
                .map(|(ty, index)| (ty, ClassId(index as u32)))
                .collect(),
            classes,
        })
    }
}

/// CRC-32 over the class chain, base first: class names, field names,
/// type signatures, field flags and the presence of a custom serializer
fn class_checksum(classes: &[ClassDescriptor], base_ids: &[Option<ClassId>], index: usize) -> u32 {
    let mut chain = vec![index];
    while let Some(base) = base_ids[*chain.last().unwrap_or(&index)] {
        chain.push(base.index());
    }

    let mut hasher = crc32fast::Hasher::new();
    for &level in chain.iter().rev() {
        let class = &classes[level];
        hasher.update(class.name.as_bytes());
        hasher.update(&[0]);
        for field in &class.fields {
            hasher.update(field.name().as_bytes());
            hasher.update(&[0]);
            hasher.update(field.ty().signature().as_bytes());
            hasher.update(&[0, field.flags().bits()]);
        }
        hasher.update(&[class.has_serializer() as u8]);
    }
    hasher.finalize()
}

/// Frozen class metadata
pub struct ClassRegistry {
    classes: Vec<ClassDescriptor>,
    by_name: FxHashMap<&'static str, ClassId>,
    by_type: FxHashMap<TypeId, ClassId>,
}

impl ClassRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn lookup(&self, name: &str) -> Option<&ClassDescriptor> {
        self.by_name.get(name).map(|id| &self.classes[id.index()])
    }

    pub fn id_of(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Like [`id_of`](Self::id_of), failing with `UnknownClass`
    pub fn require(&self, name: &str) -> CregResult<ClassId> {
        self.id_of(name)
            .ok_or_else(|| CregError::UnknownClass(name.to_string()))
    }

    pub fn class(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.index()]
    }

    pub fn class_of_type(&self, ty: TypeId) -> Option<ClassId> {
        self.by_type.get(&ty).copied()
    }

    /// True if `class` is `ancestor` or derives from it
    pub fn is_a(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.class(id).base();
        }
        false
    }

    /// Checksum folded over a sequence of classes
    pub fn checksum_of(&self, classes: &[ClassId]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for id in classes {
            hasher.update(&self.class(*id).checksum.to_le_bytes());
        }
        hasher.finalize()
    }

    /// Checksum over every registered class
    pub fn checksum(&self) -> u32 {
        let all: Vec<ClassId> = (0..self.classes.len() as u32).map(ClassId).collect();
        self.checksum_of(&all)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.iter()
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.classes.len())
            .finish()
    }
}

static PENDING: Lazy<Mutex<Option<RegistryBuilder>>> =
    Lazy::new(|| Mutex::new(Some(RegistryBuilder::new())));

static GLOBAL: OnceCell<Arc<ClassRegistry>> = OnceCell::new();

/// Queue a class for the process-wide registry
pub fn register_global(class: ClassDescriptor) -> CregResult<()> {
    let mut pending = PENDING.lock();
    match pending.as_mut() {
        Some(builder) => builder.register(class).map(|_| ()),
        None => Err(CregError::RegistryFrozen),
    }
}

/// Freeze the process-wide registry; later calls return the same instance
pub fn finalize_global() -> CregResult<Arc<ClassRegistry>> {
    let mut pending = PENDING.lock();
    if let Some(registry) = GLOBAL.get() {
        return Ok(registry.clone());
    }
    let builder = pending.take().ok_or(CregError::RegistryFrozen)?;
    let registry = Arc::new(builder.finalize()?);
    let _ = GLOBAL.set(registry.clone());
    Ok(registry)
}

/// The process-wide registry, once finalized
pub fn global_registry() -> Option<Arc<ClassRegistry>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassBuilder, Reflect};
    use crate::graph::Ptr;
    use crate::member;

    #[derive(Default)]
    struct Base {
        id: u32,
    }

    impl Reflect for Base {
        const CLASS: &'static str = "Base";
    }

    /// Same class name and field name as [`Base`], wider field
    #[derive(Default)]
    struct WideBase {
        id: u64,
    }

    impl Reflect for WideBase {
        const CLASS: &'static str = "Base";
    }

    #[derive(Default)]
    struct Derived {
        base: Base,
        level: i16,
        rank: u32,
        peer: Ptr<Base>,
    }

    impl Reflect for Derived {
        const CLASS: &'static str = "Derived";
    }

    fn base_class() -> ClassDescriptor {
        ClassBuilder::<Base>::new().field(member!(Base, id)).build()
    }

    fn derived_class() -> ClassDescriptor {
        ClassBuilder::<Derived>::new()
            .base(|d: &mut Derived| &mut d.base)
            .field(member!(Derived, level))
            .field(member!(Derived, rank))
            .field(member!(Derived, peer))
            .build()
    }

    #[test]
    fn test_finalize_resolves_bases_in_any_order() {
        let registry = RegistryBuilder::new()
            .with(derived_class())
            .unwrap()
            .with(base_class())
            .unwrap()
            .finalize()
            .unwrap();

        let derived = registry.require("Derived").unwrap();
        let base = registry.require("Base").unwrap();
        assert_eq!(registry.class(derived).base(), Some(base));
        assert!(registry.is_a(derived, base));
        assert!(!registry.is_a(base, derived));
        assert!(registry
            .class(base)
            .flags()
            .contains(ClassFlags::POLYMORPHIC));
        assert_eq!(registry.class_of_type(TypeId::of::<Derived>()), Some(derived));
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(base_class()).unwrap();
        assert!(matches!(
            builder.register(base_class()),
            Err(CregError::DuplicateClass(name)) if name == "Base"
        ));
    }

    #[test]
    fn test_unresolved_base_rejected() {
        let result = RegistryBuilder::new()
            .with(derived_class())
            .unwrap()
            .finalize();
        assert!(matches!(
            result,
            Err(CregError::UnresolvedBase { base, .. }) if base == "Base"
        ));
    }

    #[test]
    fn test_duplicate_offset_rejected() {
        let class = ClassBuilder::<Base>::new()
            .field(member!(Base, id))
            .field(member!(Base, id))
            .build();
        let result = RegistryBuilder::new().with(class).unwrap().finalize();
        assert!(matches!(result, Err(CregError::DuplicateField { .. })));
    }

    #[test]
    fn test_checksum_tracks_field_changes() {
        let original = RegistryBuilder::new()
            .with(base_class())
            .unwrap()
            .finalize()
            .unwrap();
        let without_field = RegistryBuilder::new()
            .with(ClassBuilder::<Base>::new().build())
            .unwrap()
            .finalize()
            .unwrap();
        let skipped = RegistryBuilder::new()
            .with(
                ClassBuilder::<Base>::new()
                    .field(member!(Base, id).no_serialize())
                    .build(),
            )
            .unwrap()
            .finalize()
            .unwrap();
        let widened = RegistryBuilder::new()
            .with(ClassBuilder::<WideBase>::new().field(member!(WideBase, id)).build())
            .unwrap()
            .finalize()
            .unwrap();
        let again = RegistryBuilder::new()
            .with(base_class())
            .unwrap()
            .finalize()
            .unwrap();

        let c = |r: &ClassRegistry| r.lookup("Base").unwrap().checksum();
        assert_ne!(c(&original), c(&without_field));
        assert_ne!(c(&original), c(&skipped));
        assert_ne!(c(&original), c(&widened));
        assert_eq!(c(&original), c(&again));
    }

    #[test]
    fn test_derived_checksum_includes_base_fields() {
        let registry = RegistryBuilder::new()
            .with(base_class())
            .unwrap()
            .with(derived_class())
            .unwrap()
            .finalize()
            .unwrap();
        let bare_base = RegistryBuilder::new()
            .with(ClassBuilder::<Base>::new().build())
            .unwrap()
            .with(derived_class())
            .unwrap()
            .finalize()
            .unwrap();
        assert_ne!(
            registry.lookup("Derived").unwrap().checksum(),
            bare_base.lookup("Derived").unwrap().checksum()
        );
    }

    #[test]
    fn test_shared_type_descriptors() {
        let registry = RegistryBuilder::new()
            .with(base_class())
            .unwrap()
            .with(derived_class())
            .unwrap()
            .finalize()
            .unwrap();
        let base = registry.lookup("Base").unwrap();
        let derived = registry.lookup("Derived").unwrap();
        assert!(Arc::ptr_eq(
            base.field("id").unwrap().ty(),
            derived.field("rank").unwrap().ty()
        ));
        assert!(!Arc::ptr_eq(
            base.field("id").unwrap().ty(),
            derived.field("level").unwrap().ty()
        ));
    }
}
