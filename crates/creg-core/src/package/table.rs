//! Object table section

use crate::error::{CregError, CregResult};

use super::wire::{write_varint, ByteReader};

/// Member group written by a custom serializer
pub const GROUP_CUSTOM: u8 = 0x01;

/// Bytes written by one class level of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberGroup {
    /// Class-reference index of the contributing class
    pub class_ref: u32,
    pub flags: u8,
    /// Byte count per field, in declaration order
    pub field_sizes: Vec<u32>,
}

impl MemberGroup {
    pub fn is_custom(&self) -> bool {
        self.flags & GROUP_CUSTOM != 0
    }

    pub fn byte_size(&self) -> u64 {
        self.field_sizes.iter().map(|&s| s as u64).sum()
    }
}

/// Table entry for one object id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub class_ref: u32,
    pub embedded: bool,
    pub groups: Vec<MemberGroup>,
}

impl ObjectEntry {
    pub fn byte_size(&self) -> u64 {
        self.groups.iter().map(MemberGroup::byte_size).sum()
    }
}

/// Encode entries for ids 1..; the null id has no entry
pub fn encode_object_table(entries: &[ObjectEntry], out: &mut Vec<u8>) -> CregResult<()> {
    for entry in entries {
        write_varint(out, entry.class_ref)?;
        out.push(entry.embedded as u8);
        write_varint(out, entry.groups.len() as u32)?;
        for group in &entry.groups {
            write_varint(out, group.class_ref)?;
            write_varint(out, group.field_sizes.len() as u32)?;
            out.push(group.flags);
            for &size in &group.field_sizes {
                write_varint(out, size)?;
            }
        }
    }
    Ok(())
}

/// Decode `count` entries, checking class-reference indices
pub fn decode_object_table(
    reader: &mut ByteReader<'_>,
    count: usize,
    class_ref_count: u32,
) -> CregResult<Vec<ObjectEntry>> {
    let check_ref = |index: u32| {
        if index < class_ref_count {
            Ok(index)
        } else {
            Err(CregError::Corrupt(format!(
                "class reference {index} out of range ({class_ref_count} classes)"
            )))
        }
    };

    let mut entries = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let class_ref = check_ref(reader.read_varint()?)?;
        let embedded = match reader.read_u8()? {
            0 => false,
            1 => true,
            other => return Err(CregError::Corrupt(format!("invalid embedded flag {other}"))),
        };
        let group_count = reader.read_varint()? as usize;
        let mut groups = Vec::with_capacity(group_count.min(reader.remaining()));
        for _ in 0..group_count {
            let class_ref = check_ref(reader.read_varint()?)?;
            let field_count = reader.read_varint()? as usize;
            let flags = reader.read_u8()?;
            let mut field_sizes = Vec::with_capacity(field_count.min(reader.remaining()));
            for _ in 0..field_count {
                field_sizes.push(reader.read_varint()?);
            }
            groups.push(MemberGroup {
                class_ref,
                flags,
                field_sizes,
            });
        }
        entries.push(ObjectEntry {
            class_ref,
            embedded,
            groups,
        });
    }
    Ok(entries)
}
