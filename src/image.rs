//! Maps a raw PE file into the flat, RVA-indexed view the rest of the crate
//! works on.
//!
//! VMProtect mixes code and data freely across its own sections, so instead of
//! translating RVAs through the section table on every access, the whole image
//! is materialized once into a zeroed 256 MiB buffer with each section copied
//! to its virtual address. Unmapped regions read as zero, which matches what
//! the loader would produce for uninitialized section tails.

use pelite::pe64::{Pe, PeFile};

/// Size of the flat mapping. Larger than any image VMProtect will produce.
const MAPPED_SIZE: usize = 0x1000_0000;

/// A single entry of the mapped image's section table.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name with trailing NULs stripped.
    pub name: String,
    /// RVA of the section start.
    pub rva: u64,
    /// Virtual size of the section.
    pub virtual_size: u64,
}

impl Section {
    /// Whether `rva` falls inside this section.
    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.rva && rva < self.rva + self.virtual_size
    }
}

/// A PE image mapped into a flat buffer, addressed by RVA.
pub struct MappedImage {
    buffer: Vec<u8>,
    preferred_base: u64,
    sections: Vec<Section>,
}

impl MappedImage {
    /// Map a raw PE file into a flat buffer.
    ///
    /// Headers are copied verbatim; each section lands at its virtual address;
    /// everything else stays zero.
    pub fn map(raw: &[u8]) -> pelite::Result<Self> {
        let pe = PeFile::from_bytes(raw)?;
        let optional_header = pe.optional_header();

        let mut buffer = vec![0u8; MAPPED_SIZE];

        let header_size = (optional_header.SizeOfHeaders as usize).min(raw.len()).min(buffer.len());
        buffer[..header_size].copy_from_slice(&raw[..header_size]);

        let mut sections = Vec::new();
        for header in pe.section_headers().iter() {
            let name = String::from_utf8_lossy(&header.Name).trim_end_matches('\0').to_string();
            sections.push(Section {
                name,
                rva: header.VirtualAddress as u64,
                virtual_size: header.VirtualSize as u64,
            });

            let raw_start = header.PointerToRawData as usize;
            let raw_size = (header.SizeOfRawData as usize)
                .min(raw.len().saturating_sub(raw_start))
                .min(buffer.len().saturating_sub(header.VirtualAddress as usize));
            if raw_size == 0 {
                continue;
            }
            buffer[header.VirtualAddress as usize..][..raw_size]
                .copy_from_slice(&raw[raw_start..][..raw_size]);
        }

        Ok(Self {
            buffer,
            preferred_base: optional_header.ImageBase,
            sections,
        })
    }

    /// Construct a mapped image directly from an already-flat buffer.
    pub fn from_parts(buffer: Vec<u8>, preferred_base: u64, sections: Vec<Section>) -> Self {
        Self {
            buffer,
            preferred_base,
            sections,
        }
    }

    /// The image base the PE header asks to be loaded at.
    pub fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    /// The mapped section table.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Find the section containing `rva`, if any.
    pub fn section_of(&self, rva: u64) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(rva))
    }

    /// Read at least `size` bytes at `rva`, returning the longest readable
    /// slice starting there.
    pub fn read(&self, rva: u64, size: usize) -> Option<&[u8]> {
        let offset: usize = rva.try_into().ok()?;
        let bytes = self.buffer.get(offset..)?;
        (bytes.len() >= size).then_some(bytes)
    }

    /// Read a `size`-byte little-endian integer at `rva`, zero-extended.
    pub fn read_int(&self, rva: u64, size: usize) -> Option<u64> {
        debug_assert!(size <= 8);
        let bytes = self.read(rva, size)?;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[..size]);
        Some(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_int_is_little_endian_and_zero_extended() {
        let image = MappedImage::from_parts(vec![0x78, 0x56, 0x34, 0x12, 0xFF], 0, Vec::new());
        assert_eq!(image.read_int(0, 4), Some(0x12345678));
        assert_eq!(image.read_int(0, 2), Some(0x5678));
        assert_eq!(image.read_int(2, 1), Some(0x34));
        assert_eq!(image.read_int(2, 8), None);
    }

    #[test]
    fn section_lookup() {
        let sections = vec![
            Section {
                name: ".text".into(),
                rva: 0x1000,
                virtual_size: 0x1000,
            },
            Section {
                name: ".vmp0".into(),
                rva: 0x2000,
                virtual_size: 0x800,
            },
        ];
        let image = MappedImage::from_parts(vec![0; 0x3000], 0x1_4000_0000, sections);
        assert_eq!(image.section_of(0x1800).map(|s| s.name.as_str()), Some(".text"));
        assert_eq!(image.section_of(0x2000).map(|s| s.name.as_str()), Some(".vmp0"));
        assert!(image.section_of(0x2800).is_none());
    }
}
