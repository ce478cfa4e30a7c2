//! Output serializer
//!
//! Walks the graph from a root object with a FIFO worklist. Ids are assigned
//! when an object is first reached, before its body is written, so cycles
//! resolve to an existing id instead of recursing.

use std::any::Any;
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::class::ClassId;
use crate::error::{CregError, CregResult};
use crate::graph::{ObjRef, ObjectGraph};
use crate::options::SessionOptions;
use crate::package::{
    encode_object_table, write_cstr, MemberGroup, ObjectEntry, PackageHeader, GROUP_CUSTOM,
    HEADER_SIZE,
};
use crate::registry::ClassRegistry;
use crate::serializer::Serializer;
use crate::types::TypeDescriptor;

/// Session-scoped object identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Identity {
    /// Arena object
    Heap(ObjRef),
    /// Inline value, by address and class
    Inline(usize, ClassId),
}

/// Bookkeeping for one object id
#[derive(Debug)]
struct ObjectRecord {
    class: ClassId,
    embedded: bool,
    groups: Vec<MemberGroup>,
}

/// Identity map and records of one save session
#[derive(Debug, Default)]
struct ObjectTable {
    records: Vec<ObjectRecord>,
    ids: FxHashMap<Identity, u32>,
}

impl ObjectTable {
    fn record_mut(&mut self, id: u32) -> &mut ObjectRecord {
        &mut self.records[id as usize - 1]
    }

    fn next_id(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    fn push(&mut self, identity: Identity, class: ClassId, embedded: bool) -> u32 {
        let id = self.next_id();
        self.records.push(ObjectRecord {
            class,
            embedded,
            groups: Vec::new(),
        });
        self.ids.insert(identity, id);
        id
    }

    /// Id for a pointer target; `None` in the second slot if it was already known
    fn reference(
        &mut self,
        identity: Identity,
        class: ClassId,
        registry: &ClassRegistry,
    ) -> CregResult<(u32, bool)> {
        match self.ids.get(&identity) {
            Some(&id) => {
                let record = &self.records[id as usize - 1];
                if record.embedded {
                    return Err(CregError::EmbeddedAndReferenced(
                        registry.class(record.class).name().to_string(),
                    ));
                }
                Ok((id, false))
            }
            None => Ok((self.push(identity, class, false), true)),
        }
    }

    /// Id for an inline instance; reaching any known identity again is an error
    fn embed(
        &mut self,
        identity: Identity,
        class: ClassId,
        registry: &ClassRegistry,
    ) -> CregResult<u32> {
        if let Some(&id) = self.ids.get(&identity) {
            let record = &self.records[id as usize - 1];
            let name = registry.class(record.class).name().to_string();
            return Err(if record.embedded {
                CregError::ReserializedEmbedded(name)
            } else {
                CregError::EmbeddedAndReferenced(name)
            });
        }
        Ok(self.push(identity, class, true))
    }
}

/// Writing half of a session
pub struct OutputSerializer<'a> {
    registry: &'a ClassRegistry,
    options: &'a SessionOptions,
    context: Option<&'a mut dyn Any>,
    data: Vec<u8>,
    table: ObjectTable,
    heap_classes: Vec<Option<ClassId>>,
    pending: VecDeque<(u32, ObjRef)>,
    class_refs: Vec<ClassId>,
    class_ref_index: FxHashMap<ClassId, u32>,
    depth: usize,
}

impl<'a> OutputSerializer<'a> {
    pub fn new(registry: &'a ClassRegistry, options: &'a SessionOptions) -> Self {
        Self {
            registry,
            options,
            context: None,
            data: Vec::new(),
            table: ObjectTable::default(),
            heap_classes: Vec::new(),
            pending: VecDeque::new(),
            class_refs: Vec::new(),
            class_ref_index: FxHashMap::default(),
            depth: 0,
        }
    }

    /// Attach extension state that custom hooks reach through
    /// [`Serializer::context`]
    pub fn with_context(mut self, context: &'a mut dyn Any) -> Self {
        self.context = Some(context);
        self
    }

    /// Serialize everything reachable from `root` into `sink`
    ///
    /// The whole package is assembled in memory and written with a single
    /// call, header last-patched, so a failed save never leaves a package
    /// that validates.
    pub fn save<W: Write>(
        mut self,
        graph: &mut ObjectGraph,
        root: ObjRef,
        sink: &mut W,
    ) -> CregResult<PackageHeader> {
        self.heap_classes = graph.class_table();
        let root_class = graph
            .class_of(root)
            .ok_or(CregError::DanglingReference(root.get()))?;
        let (root_id, _) = self
            .table
            .reference(Identity::Heap(root), root_class, self.registry)?;
        self.pending.push_back((root_id, root));

        while let Some((id, target)) = self.pending.pop_front() {
            let class = self.table.record_mut(id).class;
            let object = graph
                .object_mut(target)
                .ok_or(CregError::DanglingReference(target.get()))?;
            log::trace!(
                "writing object {} ({})",
                id,
                self.registry.class(class).name()
            );
            self.write_body(object, class, id)?;
        }

        let (header, bytes) = self.finish()?;
        sink.write_all(&bytes)?;
        sink.flush()?;
        Ok(header)
    }

    /// Save to a file
    pub fn save_to_file(
        self,
        graph: &mut ObjectGraph,
        root: ObjRef,
        path: impl AsRef<Path>,
    ) -> CregResult<PackageHeader> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.save(graph, root, &mut file)
    }

    fn class_ref(&mut self, class: ClassId) -> u32 {
        if let Some(&index) = self.class_ref_index.get(&class) {
            return index;
        }
        let index = self.class_refs.len() as u32;
        self.class_refs.push(class);
        self.class_ref_index.insert(class, index);
        index
    }

    fn check_object_limit(&self) -> CregResult<()> {
        if self.table.records.len() >= self.options.max_objects as usize {
            return Err(CregError::CapacityExceeded {
                what: "objects",
                limit: self.options.max_objects as usize,
            });
        }
        Ok(())
    }

    /// Write the fields of `class` and its bases, base first
    fn write_body(&mut self, object: &mut dyn Any, class: ClassId, id: u32) -> CregResult<()> {
        let registry = self.registry;
        let desc = registry.class(class);
        let class_ref = self.class_ref(class);

        if let Some(base) = desc.base() {
            let base_object = desc
                .base_mut(object)
                .ok_or_else(|| CregError::FieldTypeMismatch(desc.name().to_string()))?;
            self.write_body(base_object, base, id)?;
        }

        let mut field_sizes = Vec::with_capacity(desc.fields().len());
        for field in desc.fields() {
            let start = self.data.len();
            if !field.is_skipped() {
                field.serialize(self, object)?;
            }
            field_sizes.push((self.data.len() - start) as u32);
        }
        self.table.record_mut(id).groups.push(MemberGroup {
            class_ref,
            flags: 0,
            field_sizes,
        });

        let start = self.data.len();
        if let Some(result) = desc.run_serializer(object, self) {
            result?;
            let size = (self.data.len() - start) as u32;
            self.table.record_mut(id).groups.push(MemberGroup {
                class_ref,
                flags: GROUP_CUSTOM,
                field_sizes: vec![size],
            });
        }
        Ok(())
    }

    fn finish(self) -> CregResult<(PackageHeader, Vec<u8>)> {
        let mut class_refs = self.class_refs;
        let mut class_ref_index = self.class_ref_index;
        let mut ensure_ref = |class: ClassId| -> u32 {
            *class_ref_index.entry(class).or_insert_with(|| {
                class_refs.push(class);
                (class_refs.len() - 1) as u32
            })
        };

        let entries: Vec<ObjectEntry> = self
            .table
            .records
            .iter()
            .map(|record| ObjectEntry {
                class_ref: ensure_ref(record.class),
                embedded: record.embedded,
                groups: record.groups.clone(),
            })
            .collect();

        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.data.len() + 16 * entries.len());
        bytes.resize(HEADER_SIZE, 0);
        bytes.extend_from_slice(&self.data);

        let class_ref_offset = bytes.len();
        for class in &class_refs {
            write_cstr(&mut bytes, self.registry.class(*class).name());
        }
        let object_table_offset = bytes.len();
        encode_object_table(&entries, &mut bytes)?;
        let end_offset = bytes.len();

        let to_i32 = |value: usize| {
            i32::try_from(value).map_err(|_| CregError::CapacityExceeded {
                what: "package bytes",
                limit: i32::MAX as usize,
            })
        };
        let header = PackageHeader {
            data_offset: HEADER_SIZE as i32,
            class_ref_offset: to_i32(class_ref_offset)?,
            object_table_offset: to_i32(object_table_offset)?,
            end_offset: to_i32(end_offset)?,
            object_count: to_i32(entries.len() + 1)?,
            class_ref_count: to_i32(class_refs.len())?,
            metadata_checksum: self.registry.checksum_of(&class_refs),
            ..PackageHeader::new()
        };
        bytes[..HEADER_SIZE].copy_from_slice(&header.encode());

        log::debug!(
            "saved package: {} objects ({} embedded), {} classes, {} bytes, checksum {:#010x}",
            entries.len(),
            entries.iter().filter(|e| e.embedded).count(),
            class_refs.len(),
            end_offset,
            header.metadata_checksum
        );
        Ok((header, bytes))
    }
}

impl Serializer for OutputSerializer<'_> {
    fn is_writing(&self) -> bool {
        true
    }

    fn registry(&self) -> &ClassRegistry {
        self.registry
    }

    fn serialize_raw(&mut self, bytes: &mut [u8]) -> CregResult<()> {
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn serialize_int(&mut self, value: &mut i64) -> CregResult<()> {
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn serialize_len(&mut self, len: &mut usize) -> CregResult<()> {
        if *len > self.options.max_array_len {
            return Err(CregError::CapacityExceeded {
                what: "array length",
                limit: self.options.max_array_len,
            });
        }
        let mut wide = *len as i64;
        self.serialize_int(&mut wide)
    }

    fn check_elements(&mut self, _len: usize, _elem: &TypeDescriptor) -> CregResult<()> {
        Ok(())
    }

    fn serialize_bytes(&mut self, bytes: &mut Vec<u8>) -> CregResult<()> {
        if bytes.len() > self.options.max_string_len {
            return Err(CregError::CapacityExceeded {
                what: "string length",
                limit: self.options.max_string_len,
            });
        }
        let mut len = bytes.len() as i64;
        self.serialize_int(&mut len)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn serialize_object_ptr(&mut self, slot: &mut Option<ObjRef>, class: ClassId) -> CregResult<()> {
        let id = match *slot {
            None => 0,
            Some(target) => {
                let actual = self
                    .heap_classes
                    .get(target.index())
                    .copied()
                    .flatten()
                    .ok_or(CregError::DanglingReference(target.get()))?;
                if !self.registry.is_a(actual, class) {
                    return Err(CregError::ClassMismatch {
                        expected: self.registry.class(class).name().to_string(),
                        found: self.registry.class(actual).name().to_string(),
                    });
                }
                if !self.table.ids.contains_key(&Identity::Heap(target)) {
                    self.check_object_limit()?;
                }
                let (id, fresh) =
                    self.table
                        .reference(Identity::Heap(target), actual, self.registry)?;
                if fresh {
                    self.pending.push_back((id, target));
                }
                id
            }
        };
        let mut wide = i64::from(id);
        self.serialize_int(&mut wide)
    }

    fn serialize_object_instance(&mut self, instance: &mut dyn Any, class: ClassId) -> CregResult<()> {
        let desc = self.registry.class(class);
        if (*instance).type_id() != desc.type_id() {
            return Err(CregError::FieldTypeMismatch(desc.name().to_string()));
        }
        if self.depth >= self.options.max_depth {
            return Err(CregError::CapacityExceeded {
                what: "embedding depth",
                limit: self.options.max_depth,
            });
        }
        self.check_object_limit()?;

        let address = &*instance as *const dyn Any as *const () as usize;
        let id = self
            .table
            .embed(Identity::Inline(address, class), class, self.registry)?;

        self.depth += 1;
        let result = self.write_body(instance, class, id);
        self.depth -= 1;
        result
    }

    fn context(&mut self) -> Option<&mut dyn Any> {
        match self.context.as_mut() {
            Some(context) => Some(&mut **context),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassBuilder, Reflect};
    use crate::member;
    use crate::registry::RegistryBuilder;

    #[derive(Default)]
    struct Cell {
        value: i32,
    }

    impl Reflect for Cell {
        const CLASS: &'static str = "Cell";
    }

    fn registry() -> ClassRegistry {
        RegistryBuilder::new()
            .with(ClassBuilder::<Cell>::new().field(member!(Cell, value)).build())
            .unwrap()
            .finalize()
            .unwrap()
    }

    #[test]
    fn test_object_table_identity() {
        let registry = registry();
        let class = registry.require("Cell").unwrap();
        let mut table = ObjectTable::default();
        let a = ObjRef::from_index(0);

        assert_eq!(
            table.reference(Identity::Heap(a), class, &registry).unwrap(),
            (1, true)
        );
        assert_eq!(
            table.reference(Identity::Heap(a), class, &registry).unwrap(),
            (1, false)
        );
        assert_eq!(table.embed(Identity::Inline(0x1000, class), class, &registry).unwrap(), 2);
    }

    #[test]
    fn test_embed_twice_is_reserialization() {
        let registry = registry();
        let class = registry.require("Cell").unwrap();
        let mut table = ObjectTable::default();
        table
            .embed(Identity::Inline(0x2000, class), class, &registry)
            .unwrap();
        assert!(matches!(
            table.embed(Identity::Inline(0x2000, class), class, &registry),
            Err(CregError::ReserializedEmbedded(name)) if name == "Cell"
        ));
        assert!(matches!(
            table.reference(Identity::Inline(0x2000, class), class, &registry),
            Err(CregError::EmbeddedAndReferenced(_))
        ));
    }

    #[test]
    fn test_reference_then_embed_rejected() {
        let registry = registry();
        let class = registry.require("Cell").unwrap();
        let mut table = ObjectTable::default();
        let identity = Identity::Inline(0x3000, class);
        table.reference(identity, class, &registry).unwrap();
        assert!(matches!(
            table.embed(identity, class, &registry),
            Err(CregError::EmbeddedAndReferenced(_))
        ));
        assert_eq!(table.records.len(), 1);
    }

    #[test]
    fn test_same_address_different_class_is_distinct() {
        let registry = registry();
        let class = registry.require("Cell").unwrap();
        let mut table = ObjectTable::default();
        table
            .embed(Identity::Inline(0x4000, class), class, &registry)
            .unwrap();
        let other = ClassId(class.0 + 1);
        table
            .embed(Identity::Inline(0x4000, other), class, &registry)
            .unwrap();
        assert_eq!(table.records.len(), 2);
    }
}
