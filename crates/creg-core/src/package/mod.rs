//! Package binary format
//!
//! ```text
//! header        32 bytes, see PackageHeader
//! object data   field bytes of every referenced object, worklist order
//! class refs    zero-terminated class names, first-use order
//! object table  one entry per object id >= 1
//! ```

mod header;
mod table;
mod wire;

use std::fmt;

pub use header::{PackageHeader, HEADER_SIZE, PACKAGE_MAGIC};
pub use table::{
    decode_object_table, encode_object_table, MemberGroup, ObjectEntry, GROUP_CUSTOM,
};
pub use wire::{write_cstr, write_varint, ByteReader, VARINT_MAX};

use crate::error::{CregError, CregResult};

/// Read the class-reference section
pub(crate) fn read_class_refs<'a>(
    bytes: &'a [u8],
    header: &PackageHeader,
) -> CregResult<Vec<&'a str>> {
    let range = header.class_ref_range();
    let mut reader = ByteReader::new(&bytes[range.clone()], range.start, "class references");
    let count = header.class_ref_count as usize;
    let mut names = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        names.push(reader.read_cstr()?);
    }
    if !reader.is_empty() {
        return Err(CregError::Corrupt(format!(
            "{} unread bytes in class-reference section",
            reader.remaining()
        )));
    }
    Ok(names)
}

/// Read the object-table section
pub(crate) fn read_object_table(
    bytes: &[u8],
    header: &PackageHeader,
) -> CregResult<Vec<ObjectEntry>> {
    let range = header.object_table_range();
    let mut reader = ByteReader::new(&bytes[range.clone()], range.start, "object table");
    let entries = decode_object_table(
        &mut reader,
        header.object_count as usize - 1,
        header.class_ref_count as u32,
    )?;
    if !reader.is_empty() {
        return Err(CregError::Corrupt(format!(
            "{} unread bytes in object table",
            reader.remaining()
        )));
    }
    Ok(entries)
}

/// Per-class totals reported by [`PackageInfo`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassUsage {
    pub name: String,
    pub objects: usize,
    pub embedded: usize,
    /// Body bytes written by this class's own member groups
    pub bytes: u64,
}

/// Structural summary of a package, decoded without a class registry
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub header: PackageHeader,
    pub classes: Vec<ClassUsage>,
    pub entries: Vec<ObjectEntry>,
}

impl PackageInfo {
    pub fn read(bytes: &[u8]) -> CregResult<Self> {
        let header = PackageHeader::decode(bytes)?;
        header.validate(bytes.len())?;
        let names = read_class_refs(bytes, &header)?;
        let entries = read_object_table(bytes, &header)?;

        let mut classes: Vec<ClassUsage> = names
            .iter()
            .map(|name| ClassUsage {
                name: name.to_string(),
                objects: 0,
                embedded: 0,
                bytes: 0,
            })
            .collect();
        for entry in &entries {
            let usage = &mut classes[entry.class_ref as usize];
            usage.objects += 1;
            usage.embedded += entry.embedded as usize;
            for group in &entry.groups {
                classes[group.class_ref as usize].bytes += group.byte_size();
            }
        }

        Ok(Self {
            header,
            classes,
            entries,
        })
    }

    /// Bytes of object data actually accounted for by the table
    ///
    /// Embedded bodies are counted both in their own entry and inside the
    /// owner's field, so this sums referenced entries only.
    pub fn referenced_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.embedded)
            .map(ObjectEntry::byte_size)
            .sum()
    }
}

impl fmt::Display for PackageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "package: {} objects, {} classes, {} bytes, checksum {:#010x}",
            self.header.object_count - 1,
            self.header.class_ref_count,
            self.header.end_offset,
            self.header.metadata_checksum
        )?;
        for class in &self.classes {
            writeln!(
                f,
                "  {:<24} {:>8} objects {:>8} embedded {:>10} bytes",
                class.name, class.objects, class.embedded, class.bytes
            )?;
        }
        Ok(())
    }
}
