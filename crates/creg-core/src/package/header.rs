//! Package header

use crate::error::{CregError, CregResult};

use super::wire::ByteReader;

/// Magic tag at the start of every package
pub const PACKAGE_MAGIC: [u8; 4] = *b"CREG";

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Package header (32 bytes, little-endian)
///
/// Sections follow the header in the order data, class references, object
/// table; `end_offset` is the total package length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageHeader {
    /// Magic tag (must be PACKAGE_MAGIC)
    pub magic: [u8; 4],

    /// Offset of the object-data section
    pub data_offset: i32,

    /// Offset of the class-reference section
    pub class_ref_offset: i32,

    /// Offset of the object-table section
    pub object_table_offset: i32,

    /// Offset one past the last byte of the package
    pub end_offset: i32,

    /// Number of object ids, the null id included
    pub object_count: i32,

    /// Number of class references
    pub class_ref_count: i32,

    /// Checksum over the referenced classes' metadata
    pub metadata_checksum: u32,
}

impl PackageHeader {
    /// Header with zeroed offsets, patched once the sections are written
    pub fn new() -> Self {
        Self {
            magic: PACKAGE_MAGIC,
            data_offset: 0,
            class_ref_offset: 0,
            object_table_offset: 0,
            end_offset: 0,
            object_count: 0,
            class_ref_count: 0,
            metadata_checksum: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..8].copy_from_slice(&self.data_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.class_ref_offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.object_table_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.end_offset.to_le_bytes());
        out[20..24].copy_from_slice(&self.object_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.class_ref_count.to_le_bytes());
        out[28..32].copy_from_slice(&self.metadata_checksum.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> CregResult<Self> {
        let mut reader = ByteReader::new(bytes, 0, "header");
        let mut magic = [0u8; 4];
        reader.read_into(&mut magic)?;
        if magic != PACKAGE_MAGIC {
            return Err(CregError::InvalidMagic(magic));
        }
        Ok(Self {
            magic,
            data_offset: reader.read_i32()?,
            class_ref_offset: reader.read_i32()?,
            object_table_offset: reader.read_i32()?,
            end_offset: reader.read_i32()?,
            object_count: reader.read_i32()?,
            class_ref_count: reader.read_i32()?,
            metadata_checksum: reader.read_u32()?,
        })
    }

    /// Check offsets and counts against the actual package length
    pub fn validate(&self, package_len: usize) -> CregResult<()> {
        let end = usize::try_from(self.end_offset)
            .map_err(|_| CregError::Corrupt(format!("negative end offset {}", self.end_offset)))?;
        if end > package_len {
            return Err(CregError::Truncated {
                section: "package",
                offset: package_len,
                needed: end - package_len,
            });
        }
        if end < package_len {
            return Err(CregError::Corrupt(format!(
                "{} trailing bytes after package end",
                package_len - end
            )));
        }

        let offsets = [
            self.data_offset,
            self.class_ref_offset,
            self.object_table_offset,
            self.end_offset,
        ];
        if self.data_offset != HEADER_SIZE as i32 || offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(CregError::Corrupt(format!(
                "section offsets out of order: {offsets:?}"
            )));
        }
        if self.object_count < 2 {
            return Err(CregError::Corrupt(format!(
                "object count {} leaves no root object",
                self.object_count
            )));
        }
        if self.class_ref_count < 1 {
            return Err(CregError::Corrupt("package references no classes".into()));
        }
        Ok(())
    }

    pub fn data_range(&self) -> std::ops::Range<usize> {
        self.data_offset as usize..self.class_ref_offset as usize
    }

    pub fn class_ref_range(&self) -> std::ops::Range<usize> {
        self.class_ref_offset as usize..self.object_table_offset as usize
    }

    pub fn object_table_range(&self) -> std::ops::Range<usize> {
        self.object_table_offset as usize..self.end_offset as usize
    }
}

impl Default for PackageHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageHeader {
        PackageHeader {
            data_offset: 32,
            class_ref_offset: 40,
            object_table_offset: 50,
            end_offset: 60,
            object_count: 3,
            class_ref_count: 1,
            metadata_checksum: 0xDEAD_BEEF,
            ..PackageHeader::new()
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..4], b"CREG");
        assert_eq!(&bytes[4..8], &[32, 0, 0, 0]);
        assert_eq!(&bytes[28..32], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(PackageHeader::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            PackageHeader::decode(&bytes),
            Err(CregError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_short_header() {
        let bytes = sample().encode();
        assert!(matches!(
            PackageHeader::decode(&bytes[..20]),
            Err(CregError::Truncated { .. })
        ));
    }

    #[test]
    fn test_validate_length() {
        let header = sample();
        assert!(header.validate(60).is_ok());
        assert!(matches!(
            header.validate(59),
            Err(CregError::Truncated { needed: 1, .. })
        ));
        assert!(matches!(header.validate(61), Err(CregError::Corrupt(_))));
    }

    #[test]
    fn test_validate_offsets() {
        let header = PackageHeader {
            class_ref_offset: 55,
            object_table_offset: 50,
            ..sample()
        };
        assert!(matches!(header.validate(60), Err(CregError::Corrupt(_))));
    }
}
