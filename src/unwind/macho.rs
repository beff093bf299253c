//! Parses a Mach-O `__TEXT,__unwind_info` section and answers "what compact
//! unwind encoding covers this function offset" (§4.6 steps 2-4).
//!
//! Section *location* goes through the `object` crate, the way
//! `framehop-in-process`/`samply-symbols` locate Mach-O sections by walking
//! load commands rather than hand-rolling the Mach-O header. The section's
//! *contents* -- the compact-unwind index/page format -- are parsed by hand
//! here, since owning that binary-search logic is this crate's actual
//! subject matter.

use byteorder::{ByteOrder, LittleEndian};
use object::read::macho::{MachHeader, MachOFile};
use object::{Object, ObjectSection};

use crate::error::{Error, Result};

const SECOND_LEVEL_REGULAR: u32 = 2;
const SECOND_LEVEL_COMPRESSED: u32 = 3;

const HEADER_LEN: usize = 28;
const INDEX_ENTRY_LEN: usize = 12;

/// Locates `__TEXT,__unwind_info` in a Mach-O image via the `object` crate
/// and returns an owned copy of its bytes (§4.6 step 1). Owned rather than
/// borrowed because the section data, as returned by `object`, may itself be
/// decompressed/copied and can't safely outlive the parsed `File`.
pub fn locate_unwind_info_section(image: &[u8]) -> Result<Vec<u8>> {
    let file = object::File::parse(image).map_err(Error::ObjectParse)?;
    let section = file
        .section_by_name("__unwind_info")
        .ok_or_else(|| Error::UnwindSectionMissing("__TEXT,__unwind_info not present".into()))?;
    let data = section.data().map_err(Error::ObjectParse)?;
    Ok(data.into_owned())
}

/// Same lookup against an already-parsed, header-typed Mach-O file (kept
/// distinct from the generic `object::File` path for callers that resolved
/// the header themselves while servicing §6's `GetRegion`).
pub fn locate_unwind_info_section_typed<Mach: MachHeader>(
    file: &MachOFile<'_, Mach>,
) -> Result<Vec<u8>> {
    let section = file
        .section_by_name("__unwind_info")
        .ok_or_else(|| Error::UnwindSectionMissing("__TEXT,__unwind_info not present".into()))?;
    let data = section.data().map_err(Error::ObjectParse)?;
    Ok(data.into_owned())
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    function_offset: u32,
    second_level_pages_section_offset: u32,
}

/// Parsed `__unwind_info` section: first-level index plus the raw bytes,
/// so second-level pages are decoded lazily on lookup.
#[derive(Debug, Clone)]
pub struct CompactUnwindInfo {
    data: Vec<u8>,
    common_encodings_offset: u32,
    common_encodings_count: u32,
    index: Vec<IndexEntry>,
}

impl CompactUnwindInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::UnwindSectionParse(
                "section shorter than the fixed header".into(),
            ));
        }
        let common_encodings_offset = LittleEndian::read_u32(&data[4..8]);
        let common_encodings_count = LittleEndian::read_u32(&data[8..12]);
        let index_section_offset = LittleEndian::read_u32(&data[20..24]);
        let index_count = LittleEndian::read_u32(&data[24..28]);

        let index_start = index_section_offset as usize;
        let index_end = index_start
            .checked_add(index_count as usize * INDEX_ENTRY_LEN)
            .ok_or_else(|| Error::UnwindSectionParse("index array overflow".into()))?;
        let index_bytes = data
            .get(index_start..index_end)
            .ok_or_else(|| Error::UnwindSectionParse("index array out of bounds".into()))?;

        let mut index = Vec::with_capacity(index_count as usize);
        for entry in index_bytes.chunks_exact(INDEX_ENTRY_LEN) {
            index.push(IndexEntry {
                function_offset: LittleEndian::read_u32(&entry[0..4]),
                second_level_pages_section_offset: LittleEndian::read_u32(&entry[4..8]),
            });
        }

        Ok(CompactUnwindInfo {
            data: data.to_vec(),
            common_encodings_offset,
            common_encodings_count,
            index,
        })
    }

    fn common_encoding(&self, index: u32) -> Option<u32> {
        if index >= self.common_encodings_count {
            return None;
        }
        let start = self.common_encodings_offset as usize + index as usize * 4;
        self.data
            .get(start..start + 4)
            .map(LittleEndian::read_u32)
    }

    /// Binary-searches the first-level index for the entry covering
    /// `orig_addr`, then resolves the encoding from whichever second-level
    /// page it points at (§4.6 steps 3-4).
    pub fn encoding_for(&self, orig_addr: u32) -> Option<u32> {
        if self.index.is_empty() {
            return None;
        }
        let entry_idx = match self
            .index
            .binary_search_by_key(&orig_addr, |e| e.function_offset)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let entry = self.index[entry_idx];
        if entry.second_level_pages_section_offset == 0 {
            return None;
        }
        self.second_level_encoding(entry, orig_addr)
    }

    fn second_level_encoding(&self, entry: IndexEntry, orig_addr: u32) -> Option<u32> {
        let page_start = entry.second_level_pages_section_offset as usize;
        let kind = LittleEndian::read_u32(self.data.get(page_start..page_start + 4)?);

        if kind == SECOND_LEVEL_REGULAR {
            let entry_page_offset = LittleEndian::read_u32(self.data.get(page_start + 4..page_start + 8)?);
            let entry_count = LittleEndian::read_u32(self.data.get(page_start + 8..page_start + 12)?);
            let entries_start = page_start + entry_page_offset as usize;
            for i in 0..entry_count as usize {
                let off = entries_start + i * 8;
                let func_offset = LittleEndian::read_u32(self.data.get(off..off + 4)?);
                let next_func_offset = if i + 1 < entry_count as usize {
                    Some(LittleEndian::read_u32(
                        self.data.get(off + 8..off + 12)?,
                    ))
                } else {
                    None
                };
                let covers = orig_addr >= func_offset
                    && next_func_offset.map_or(true, |next| orig_addr < next);
                if covers {
                    return Some(LittleEndian::read_u32(self.data.get(off + 4..off + 8)?));
                }
            }
            return None;
        }

        if kind == SECOND_LEVEL_COMPRESSED {
            let entry_page_offset = LittleEndian::read_u32(self.data.get(page_start + 4..page_start + 8)?);
            let entry_count = LittleEndian::read_u32(self.data.get(page_start + 8..page_start + 12)?);
            let encodings_page_offset = LittleEndian::read_u32(self.data.get(page_start + 12..page_start + 16)?);

            let entries_start = page_start + entry_page_offset as usize;
            let mut best: Option<(u32, u32)> = None; // (func_offset, packed entry)
            for i in 0..entry_count as usize {
                let off = entries_start + i * 4;
                let packed = LittleEndian::read_u32(self.data.get(off..off + 4)?);
                let delta = packed & 0x00FF_FFFF;
                let func_offset = entry.function_offset + delta;
                if func_offset <= orig_addr {
                    best = Some((func_offset, packed));
                } else {
                    break;
                }
            }
            let (_, packed) = best?;
            let encoding_index = packed >> 24;
            if encoding_index < self.common_encodings_count {
                return self.common_encoding(encoding_index);
            }
            let local_index = encoding_index - self.common_encodings_count;
            let local_start = page_start + encodings_page_offset as usize + local_index as usize * 4;
            return self.data.get(local_start..local_start + 4).map(LittleEndian::read_u32);
        }

        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SecondLevelPage {
    pub kind: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Builds a minimal section with one common encoding, one index entry
    /// pointing at a regular second-level page with two function ranges.
    fn build_regular_section() -> Vec<u8> {
        let mut data = Vec::new();
        // Header.
        push_u32(&mut data, 1); // version
        push_u32(&mut data, HEADER_LEN as u32); // common encodings offset
        push_u32(&mut data, 1); // common encodings count
        push_u32(&mut data, 0); // personality offset (unused)
        push_u32(&mut data, 0); // personality count (unused)
        let index_offset = HEADER_LEN as u32 + 4; // after the one common encoding
        push_u32(&mut data, index_offset);
        push_u32(&mut data, 2); // index count (1 real + 1 sentinel)

        // Common encodings array.
        push_u32(&mut data, 0xAAAA_0001);

        // First-level index: one real entry + sentinel.
        let page_offset = index_offset + 2 * INDEX_ENTRY_LEN as u32;
        push_u32(&mut data, 0x0000); // function_offset
        push_u32(&mut data, page_offset); // second_level_pages_section_offset
        push_u32(&mut data, 0); // lsda (unused)
        push_u32(&mut data, 0x2000); // sentinel function_offset
        push_u32(&mut data, 0); // sentinel: no second-level page
        push_u32(&mut data, 0);

        // Regular second-level page with two entries.
        push_u32(&mut data, SECOND_LEVEL_REGULAR);
        push_u32(&mut data, 12); // entry_page_offset (right after this 12-byte header)
        push_u32(&mut data, 2); // entry_count
        push_u32(&mut data, 0x0000);
        push_u32(&mut data, 7); // encoding for [0x0, 0x100)
        push_u32(&mut data, 0x0100);
        push_u32(&mut data, 9); // encoding for [0x100, ...)

        data
    }

    #[test]
    fn regular_page_resolves_by_function_offset_range() {
        let data = build_regular_section();
        let info = CompactUnwindInfo::parse(&data).unwrap();
        assert_eq!(info.encoding_for(0x0), Some(7));
        assert_eq!(info.encoding_for(0x50), Some(7));
        assert_eq!(info.encoding_for(0x100), Some(9));
        assert_eq!(info.encoding_for(0x1FFF), Some(9));
    }

    #[test]
    fn address_past_the_sentinel_resolves_to_nothing() {
        let data = build_regular_section();
        let info = CompactUnwindInfo::parse(&data).unwrap();
        assert_eq!(info.encoding_for(0x2000), None);
    }

    #[test]
    fn too_short_section_is_a_parse_error() {
        let result = CompactUnwindInfo::parse(&[0u8; 4]);
        assert!(result.is_err());
    }
}
