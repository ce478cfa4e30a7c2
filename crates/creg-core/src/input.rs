//! Input serializer
//!
//! Loading runs in fixed phases: header, class references, checksum gate,
//! object table, construction of every referenced object, bodies in the order
//! they were written, fixup resolution, post-load hooks. Nothing is returned
//! to the caller unless every phase succeeds.
//!
//! Embedded instances a custom serializer reads are invisible to the field
//! walk of the post-load pass; their hooks run once their body is read.

use std::any::Any;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::class::ClassId;
use crate::error::{CregError, CregResult};
use crate::graph::{ObjRef, ObjectGraph};
use crate::options::SessionOptions;
use crate::package::{
    read_class_refs, read_object_table, ByteReader, ObjectEntry, PackageHeader, GROUP_CUSTOM,
};
use crate::registry::ClassRegistry;
use crate::serializer::Serializer;
use crate::types::TypeDescriptor;

/// A successfully loaded package
#[derive(Debug)]
pub struct LoadedPackage {
    pub graph: ObjectGraph,
    pub root: ObjRef,
    pub root_class: ClassId,
    pub header: PackageHeader,
}

/// Pointer read before its target's body was
#[derive(Debug, Clone, Copy)]
struct Fixup {
    owner: u32,
    target: u32,
}

/// Reading half of a session
pub struct InputSerializer<'a> {
    registry: &'a Arc<ClassRegistry>,
    options: &'a SessionOptions,
    context: Option<&'a mut dyn Any>,
}

/// State of one load, borrowed by the reading pass
struct ReadSession<'a, 'p> {
    registry: &'a ClassRegistry,
    options: &'a SessionOptions,
    context: Option<&'a mut dyn Any>,
    data: ByteReader<'p>,
    entries: Vec<ObjectEntry>,
    classes: Vec<ClassId>,
    refs: Vec<Option<ObjRef>>,
    populated: Vec<bool>,
    embedded_ids: Vec<u32>,
    next_embedded: usize,
    fixups: Vec<Fixup>,
    current: u32,
    depth: usize,
    /// Set while a custom serializer is running
    in_hook: bool,
}

impl<'a> InputSerializer<'a> {
    pub fn new(registry: &'a Arc<ClassRegistry>, options: &'a SessionOptions) -> Self {
        Self {
            registry,
            options,
            context: None,
        }
    }

    /// Attach extension state that custom hooks reach through
    /// [`Serializer::context`]
    pub fn with_context(mut self, context: &'a mut dyn Any) -> Self {
        self.context = Some(context);
        self
    }

    /// Read a whole package from `source`
    pub fn load<R: Read>(self, source: &mut R) -> CregResult<LoadedPackage> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        self.load_bytes(&bytes)
    }

    /// Load from a file
    pub fn load_from_file(self, path: impl AsRef<Path>) -> CregResult<LoadedPackage> {
        let bytes = std::fs::read(path)?;
        self.load_bytes(&bytes)
    }

    /// Load a package held in memory
    pub fn load_bytes(self, bytes: &[u8]) -> CregResult<LoadedPackage> {
        let registry: &'a ClassRegistry = self.registry;
        let header = PackageHeader::decode(bytes)?;
        header.validate(bytes.len())?;

        let names = read_class_refs(bytes, &header)?;
        let classes = names
            .iter()
            .map(|name| registry.require(name))
            .collect::<CregResult<Vec<_>>>()?;

        let local = registry.checksum_of(&classes);
        if local != header.metadata_checksum {
            return Err(CregError::ChecksumMismatch {
                package: header.metadata_checksum,
                local,
            });
        }

        let entries = read_object_table(bytes, &header)?;
        if entries.len() > self.options.max_objects as usize {
            return Err(CregError::CapacityExceeded {
                what: "objects",
                limit: self.options.max_objects as usize,
            });
        }
        if entries[0].embedded {
            return Err(CregError::Corrupt("root object is embedded".into()));
        }

        // construct every referenced object
        let mut graph = ObjectGraph::new(self.registry.clone());
        let mut refs = vec![None; entries.len() + 1];
        let mut embedded_ids = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            let id = index as u32 + 1;
            let class = classes[entry.class_ref as usize];
            if entry.embedded {
                embedded_ids.push(id);
                continue;
            }
            let desc = registry.class(class);
            let object = desc
                .construct()
                .ok_or_else(|| CregError::NotConstructible(desc.name().to_string()))?;
            refs[id as usize] = Some(graph.insert_boxed(class, object)?);
        }

        let data_range = header.data_range();
        let mut session = ReadSession {
            registry,
            options: self.options,
            context: self.context,
            data: ByteReader::new(&bytes[data_range.clone()], data_range.start, "object data"),
            populated: vec![false; entries.len() + 1],
            entries,
            classes,
            refs,
            embedded_ids,
            next_embedded: 0,
            fixups: Vec::new(),
            current: 0,
            depth: 0,
            in_hook: false,
        };

        for id in 1..=session.entries.len() as u32 {
            let entry = &session.entries[id as usize - 1];
            if entry.embedded {
                continue;
            }
            let class = session.classes[entry.class_ref as usize];
            let target = session.refs[id as usize].ok_or(CregError::DanglingReference(id))?;
            let object = graph
                .object_mut(target)
                .ok_or(CregError::DanglingReference(id))?;
            session.current = id;
            session.read_object(object, class, id)?;
        }
        session.finish_data()?;
        session.resolve_fixups()?;

        for id in 1..=session.entries.len() as u32 {
            let Some(target) = session.refs[id as usize] else {
                continue;
            };
            let class = session.classes[session.entries[id as usize - 1].class_ref as usize];
            let object = graph
                .object_mut(target)
                .ok_or(CregError::DanglingReference(id))?;
            run_post_load(registry, object, class)?;
        }

        let root = session.refs[1].ok_or(CregError::DanglingReference(1))?;
        let root_class = session.classes[session.entries[0].class_ref as usize];
        log::debug!(
            "loaded package: {} objects ({} embedded), {} classes, {} bytes",
            session.entries.len(),
            session.embedded_ids.len(),
            session.classes.len(),
            bytes.len()
        );
        Ok(LoadedPackage {
            graph,
            root,
            root_class,
            header,
        })
    }
}

impl ReadSession<'_, '_> {
    fn corrupt(&self, message: String) -> CregError {
        CregError::Corrupt(format!("object {}: {}", self.current, message))
    }

    /// Read one object body, checking each member group against the table
    fn read_object(&mut self, object: &mut dyn Any, class: ClassId, id: u32) -> CregResult<()> {
        let mut group = 0;
        self.read_body(object, class, id, &mut group)?;
        let expected = self.entries[id as usize - 1].groups.len();
        if group != expected {
            return Err(self.corrupt(format!("read {group} member groups, table lists {expected}")));
        }
        self.populated[id as usize] = true;
        Ok(())
    }

    fn group_sizes(&self, id: u32, group: usize, class: ClassId, flags: u8) -> CregResult<Vec<u32>> {
        let entry = &self.entries[id as usize - 1];
        let recorded = entry
            .groups
            .get(group)
            .ok_or_else(|| self.corrupt(format!("missing member group {group}")))?;
        let recorded_class = self.classes[recorded.class_ref as usize];
        if recorded_class != class || recorded.flags != flags {
            return Err(self.corrupt(format!(
                "member group {} is {} (flags {:#x}), expected {} (flags {:#x})",
                group,
                self.registry.class(recorded_class).name(),
                recorded.flags,
                self.registry.class(class).name(),
                flags
            )));
        }
        Ok(recorded.field_sizes.clone())
    }

    fn read_body(
        &mut self,
        object: &mut dyn Any,
        class: ClassId,
        id: u32,
        group: &mut usize,
    ) -> CregResult<()> {
        let registry = self.registry;
        let desc = registry.class(class);

        if let Some(base) = desc.base() {
            let base_object = desc
                .base_mut(object)
                .ok_or_else(|| CregError::FieldTypeMismatch(desc.name().to_string()))?;
            self.read_body(base_object, base, id, group)?;
        }

        let sizes = self.group_sizes(id, *group, class, 0)?;
        *group += 1;
        if sizes.len() != desc.fields().len() {
            return Err(self.corrupt(format!(
                "class {} has {} fields, package recorded {}",
                desc.name(),
                desc.fields().len(),
                sizes.len()
            )));
        }
        let in_hook = std::mem::replace(&mut self.in_hook, false);
        for (field, &size) in desc.fields().iter().zip(&sizes) {
            let start = self.data.position();
            if !field.is_skipped() {
                field.serialize(self, object)?;
            }
            let consumed = self.data.position() - start;
            if consumed != size as usize {
                return Err(self.corrupt(format!(
                    "field {}.{} read {} bytes, package recorded {}",
                    desc.name(),
                    field.name(),
                    consumed,
                    size
                )));
            }
        }

        if desc.has_serializer() {
            let sizes = self.group_sizes(id, *group, class, GROUP_CUSTOM)?;
            *group += 1;
            let start = self.data.position();
            self.in_hook = true;
            if let Some(result) = desc.run_serializer(object, self) {
                result?;
            }
            self.in_hook = false;
            let consumed = self.data.position() - start;
            if sizes.len() != 1 || consumed != sizes[0] as usize {
                return Err(self.corrupt(format!(
                    "custom serializer of {} read {} bytes, package recorded {:?}",
                    desc.name(),
                    consumed,
                    sizes
                )));
            }
        }
        self.in_hook = in_hook;
        Ok(())
    }

    fn finish_data(&self) -> CregResult<()> {
        if !self.data.is_empty() {
            return Err(CregError::Corrupt(format!(
                "{} unread bytes in object data",
                self.data.remaining()
            )));
        }
        if self.next_embedded != self.embedded_ids.len() {
            return Err(CregError::Corrupt(format!(
                "{} embedded objects listed but never read",
                self.embedded_ids.len() - self.next_embedded
            )));
        }
        Ok(())
    }

    /// Every forward pointer must name an object whose body was read
    fn resolve_fixups(&self) -> CregResult<()> {
        for fixup in &self.fixups {
            if !self.populated[fixup.target as usize] {
                return Err(CregError::Corrupt(format!(
                    "object {} points at object {} which has no body",
                    fixup.owner, fixup.target
                )));
            }
        }
        log::trace!("resolved {} forward references", self.fixups.len());
        Ok(())
    }
}

impl Serializer for ReadSession<'_, '_> {
    fn is_writing(&self) -> bool {
        false
    }

    fn registry(&self) -> &ClassRegistry {
        self.registry
    }

    fn serialize_raw(&mut self, bytes: &mut [u8]) -> CregResult<()> {
        self.data.read_into(bytes)
    }

    fn serialize_int(&mut self, value: &mut i64) -> CregResult<()> {
        *value = self.data.read_i64()?;
        Ok(())
    }

    fn serialize_len(&mut self, len: &mut usize) -> CregResult<()> {
        let raw = self.data.read_i64()?;
        let value = usize::try_from(raw)
            .map_err(|_| CregError::ValueOutOfRange { ty: "length", value: raw })?;
        if value > self.options.max_array_len {
            return Err(CregError::CapacityExceeded {
                what: "array length",
                limit: self.options.max_array_len,
            });
        }
        *len = value;
        Ok(())
    }

    fn check_elements(&mut self, len: usize, elem: &TypeDescriptor) -> CregResult<()> {
        let bytes = len.saturating_mul(elem.min_wire_size());
        if bytes > self.data.remaining() {
            return Err(self.corrupt(format!(
                "array of {} {} needs {} bytes, {} left",
                len,
                elem.signature(),
                bytes,
                self.data.remaining()
            )));
        }
        let embedded = len.saturating_mul(elem.min_embedded());
        let unread = self.embedded_ids.len() - self.next_embedded;
        if embedded > unread {
            return Err(self.corrupt(format!(
                "array of {len} {} needs {embedded} embedded objects, {unread} left",
                elem.signature()
            )));
        }
        Ok(())
    }

    fn serialize_bytes(&mut self, bytes: &mut Vec<u8>) -> CregResult<()> {
        let raw = self.data.read_i64()?;
        let len = usize::try_from(raw)
            .map_err(|_| CregError::ValueOutOfRange { ty: "length", value: raw })?;
        if len > self.options.max_string_len {
            return Err(CregError::CapacityExceeded {
                what: "string length",
                limit: self.options.max_string_len,
            });
        }
        bytes.clear();
        bytes.extend_from_slice(self.data.take(len)?);
        Ok(())
    }

    fn serialize_object_ptr(&mut self, slot: &mut Option<ObjRef>, class: ClassId) -> CregResult<()> {
        let raw = self.data.read_i64()?;
        if raw == 0 {
            *slot = None;
            return Ok(());
        }
        let count = self.entries.len() as u32 + 1;
        let id = match u32::try_from(raw) {
            Ok(id) if id < count => id,
            _ => return Err(CregError::ObjectIdOutOfRange { id: raw, count }),
        };
        let entry = &self.entries[id as usize - 1];
        if entry.embedded {
            return Err(CregError::PointerToEmbedded(id));
        }
        let actual = self.classes[entry.class_ref as usize];
        if !self.registry.is_a(actual, class) {
            return Err(CregError::ClassMismatch {
                expected: self.registry.class(class).name().to_string(),
                found: self.registry.class(actual).name().to_string(),
            });
        }
        if !self.populated[id as usize] {
            self.fixups.push(Fixup {
                owner: self.current,
                target: id,
            });
        }
        *slot = self.refs[id as usize];
        Ok(())
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
        let id = *self
            .embedded_ids
            .get(self.next_embedded)
            .ok_or_else(|| self.corrupt("more embedded objects than listed".into()))?;
        self.next_embedded += 1;

        let recorded = self.classes[self.entries[id as usize - 1].class_ref as usize];
        if recorded != class {
            return Err(CregError::ClassMismatch {
                expected: desc.name().to_string(),
                found: self.registry.class(recorded).name().to_string(),
            });
        }

        self.depth += 1;
        let from_hook = self.in_hook;
        let result = self.read_object(instance, class, id);
        self.depth -= 1;
        result?;

        if from_hook {
            run_post_load(self.registry, instance, class)?;
        }
        Ok(())
    }

    fn context(&mut self) -> Option<&mut dyn Any> {
        match self.context.as_mut() {
            Some(context) => Some(&mut **context),
            None => None,
        }
    }
}

/// Run post-load hooks for an object: embedded members first, base class
/// before derived class
pub fn run_post_load(
    registry: &ClassRegistry,
    object: &mut dyn Any,
    class: ClassId,
) -> CregResult<()> {
    let desc = registry.class(class);
    if let Some(base) = desc.base() {
        if let Some(base_object) = desc.base_mut(object) {
            run_post_load(registry, base_object, base)?;
        }
    }
    for field in desc.fields() {
        if field.is_skipped() || !field.ty().has_embedded() {
            continue;
        }
        if let Some(value) = field.access_mut(object) {
            post_load_value(registry, field.ty(), value)?;
        }
    }
    match desc.run_post_load(object) {
        Some(result) => result,
        None => Ok(()),
    }
}

fn post_load_value(
    registry: &ClassRegistry,
    ty: &TypeDescriptor,
    value: &mut dyn Any,
) -> CregResult<()> {
    match ty {
        TypeDescriptor::EmbeddedInstance(name) => {
            run_post_load(registry, value, registry.require(name)?)
        }
        TypeDescriptor::FixedArray(array) | TypeDescriptor::DynamicArray(array) => {
            let len = array.len(value).unwrap_or(0);
            for index in 0..len {
                if let Some(elem) = array.element_mut(value, index) {
                    post_load_value(registry, &array.elem, elem)?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
