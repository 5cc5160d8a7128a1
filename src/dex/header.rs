/* DEX header: the 0x70-byte map at the front of every image. */

use crate::error::FormatError;
use crate::reader::Buffer;

pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x78563412;
pub const HEADER_SIZE: u32 = 0x70;
pub const NO_INDEX: u32 = 0xffffffff;

/// Entry widths of the fixed-size id sections, used for bounds validation.
const STRING_ID_SIZE: u32 = 4;
const TYPE_ID_SIZE: u32 = 4;
const PROTO_ID_SIZE: u32 = 12;
const FIELD_ID_SIZE: u32 = 8;
const METHOD_ID_SIZE: u32 = 8;
const CLASS_DEF_SIZE: u32 = 32;

#[derive(Debug, PartialEq, Eq)]
pub struct DexHeader {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl DexHeader {
    pub fn read(buf: &mut Buffer) -> Result<DexHeader, FormatError> {
        let magic = <[u8; 8]>::try_from(buf.read_bytes(8)?).unwrap();
        // `dex\n` then three version digits and a NUL
        let version_ok = magic[4].is_ascii_digit()
            && magic[5].is_ascii_digit()
            && magic[6].is_ascii_digit()
            && magic[7] == 0;
        if &magic[..4] != b"dex\n" || !version_ok {
            return Err(FormatError::BadMagic {
                found: magic.to_vec(),
            });
        }

        let header = DexHeader {
            magic,
            checksum: buf.read_u32()?,
            signature: <[u8; 20]>::try_from(buf.read_bytes(20)?).unwrap(),
            file_size: buf.read_u32()?,
            header_size: buf.read_u32()?,
            endian_tag: buf.read_u32()?,
            link_size: buf.read_u32()?,
            link_off: buf.read_u32()?,
            map_off: buf.read_u32()?,
            string_ids_size: buf.read_u32()?,
            string_ids_off: buf.read_u32()?,
            type_ids_size: buf.read_u32()?,
            type_ids_off: buf.read_u32()?,
            proto_ids_size: buf.read_u32()?,
            proto_ids_off: buf.read_u32()?,
            field_ids_size: buf.read_u32()?,
            field_ids_off: buf.read_u32()?,
            method_ids_size: buf.read_u32()?,
            method_ids_off: buf.read_u32()?,
            class_defs_size: buf.read_u32()?,
            class_defs_off: buf.read_u32()?,
            data_size: buf.read_u32()?,
            data_off: buf.read_u32()?,
        };

        if header.endian_tag != ENDIAN_CONSTANT {
            return Err(FormatError::WrongEndian {
                tag: header.endian_tag,
            });
        }
        if header.header_size != HEADER_SIZE {
            return Err(FormatError::BadHeaderSize {
                size: header.header_size,
                expected: HEADER_SIZE,
            });
        }

        header.check_section("string_ids", header.string_ids_off, header.string_ids_size, STRING_ID_SIZE)?;
        header.check_section("type_ids", header.type_ids_off, header.type_ids_size, TYPE_ID_SIZE)?;
        header.check_section("proto_ids", header.proto_ids_off, header.proto_ids_size, PROTO_ID_SIZE)?;
        header.check_section("field_ids", header.field_ids_off, header.field_ids_size, FIELD_ID_SIZE)?;
        header.check_section("method_ids", header.method_ids_off, header.method_ids_size, METHOD_ID_SIZE)?;
        header.check_section("class_defs", header.class_defs_off, header.class_defs_size, CLASS_DEF_SIZE)?;
        header.check_section("data", header.data_off, header.data_size, 1)?;
        header.check_section("link", header.link_off, header.link_size, 1)?;

        Ok(header)
    }

    fn check_section(
        &self,
        section: &'static str,
        offset: u32,
        count: u32,
        entry_size: u32,
    ) -> Result<(), FormatError> {
        let bytes = u64::from(count) * u64::from(entry_size);
        if u64::from(offset) + bytes > u64::from(self.file_size) {
            return Err(FormatError::SectionBounds {
                section,
                offset,
                count,
                file_size: self.file_size,
            });
        }
        Ok(())
    }

    /// The three ASCII digits of the format version, e.g. "035".
    pub fn version(&self) -> String {
        String::from_utf8_lossy(&self.magic[4..7]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Buffer;

    fn minimal_header_bytes() -> Vec<u8> {
        let mut b = vec![0u8; 0x70];
        b[..8].copy_from_slice(b"dex\n035\0");
        b[32..36].copy_from_slice(&0x70u32.to_le_bytes()); // file_size
        b[36..40].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        b[40..44].copy_from_slice(&ENDIAN_CONSTANT.to_le_bytes());
        b
    }

    #[test]
    fn accepts_minimal_header() {
        let bytes = minimal_header_bytes();
        let mut buf = Buffer::new(&bytes);
        let h = DexHeader::read(&mut buf).unwrap();
        assert_eq!(h.version(), "035");
        assert_eq!(h.file_size, 0x70);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = minimal_header_bytes();
        bytes[0] = b'x';
        let mut buf = Buffer::new(&bytes);
        assert!(matches!(
            DexHeader::read(&mut buf),
            Err(FormatError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_big_endian() {
        let mut bytes = minimal_header_bytes();
        bytes[40..44].copy_from_slice(&REVERSE_ENDIAN_CONSTANT.to_le_bytes());
        let mut buf = Buffer::new(&bytes);
        assert!(matches!(
            DexHeader::read(&mut buf),
            Err(FormatError::WrongEndian { .. })
        ));
    }

    #[test]
    fn rejects_section_past_eof() {
        let mut bytes = minimal_header_bytes();
        // one string id claimed at offset 0x70, past file_size 0x70
        bytes[56..60].copy_from_slice(&1u32.to_le_bytes());
        bytes[60..64].copy_from_slice(&0x70u32.to_le_bytes());
        let mut buf = Buffer::new(&bytes);
        assert!(matches!(
            DexHeader::read(&mut buf),
            Err(FormatError::SectionBounds { section: "string_ids", .. })
        ));
    }
}
