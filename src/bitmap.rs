//! Coverage bitmap (§3, "Coverage Bitmap") and the host-side coverage set
//! used by `GetCoverage`/persisted formats (§2.2, "Per-module coverage code
//! namespacing").

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::coverage_code::CoverageCode;
use crate::error::{Error, Result};
use crate::types::{FastHashMap, FastHashSet};

/// A benign runtime signal from the target (§7, "Bitmap write exception from
/// the target"), never represented as an [`Error`]. Consumed exclusively by
/// the registry's fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapFault {
    pub slot: u64,
}

/// One module's coverage bitmap: a host mirror plus the remote address it's
/// mapped at in the target. One byte per instrumented event; `0` until the
/// event fires, `1` after.
#[derive(Debug, Clone)]
pub struct Bitmap {
    host_mirror: Vec<u8>,
    remote_address: u64,
}

impl Bitmap {
    pub fn new(remote_address: u64) -> Self {
        Bitmap {
            host_mirror: Vec::new(),
            remote_address,
        }
    }

    pub fn remote_address(&self) -> u64 {
        self.remote_address
    }

    /// Grows the mirror (new bytes start at `0`) to cover at least `slot`,
    /// as the block/compare/I2S instrumenters allocate new slots.
    pub fn ensure_slot(&mut self, slot: u64) {
        let needed = slot as usize + 1;
        if self.host_mirror.len() < needed {
            self.host_mirror.resize(needed, 0);
        }
    }

    pub fn len(&self) -> usize {
        self.host_mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host_mirror.is_empty()
    }

    pub fn get(&self, slot: u64) -> Option<u8> {
        self.host_mirror.get(slot as usize).copied()
    }

    /// Applies a remote write observed through a bitmap-write exception
    /// (§5, "Ordering") or a direct remote-memory sync; returns whether this
    /// is the byte's first transition from `0` to `1`.
    pub fn mark(&mut self, slot: u64) -> bool {
        self.ensure_slot(slot);
        let byte = &mut self.host_mirror[slot as usize];
        let was_zero = *byte == 0;
        *byte = 1;
        was_zero
    }

    /// `ClearCoverage`: unconditionally zero every byte.
    pub fn clear_all(&mut self) {
        self.host_mirror.iter_mut().for_each(|b| *b = 0);
    }

    /// `EnableFullCoverage`'s reset pass (§2.2): zero only the bytes named
    /// in `slots`, leaving everything else (including bytes for codes this
    /// pass doesn't know about) untouched.
    pub fn reset_slots(&mut self, slots: impl IntoIterator<Item = u64>) {
        for slot in slots {
            if let Some(byte) = self.host_mirror.get_mut(slot as usize) {
                *byte = 0;
            }
        }
    }
}

/// A remote byte buffer with a host mirror, generic over content (used for
/// the I2S scratch buffer, §3 "I2S Scratch" -- unlike [`Bitmap`] it supports
/// multi-byte reads/writes, not just single-byte marking).
#[derive(Debug, Clone, Default)]
pub struct RemoteBuffer {
    host_mirror: Vec<u8>,
    remote_address: u64,
}

impl RemoteBuffer {
    pub fn new(remote_address: u64) -> Self {
        RemoteBuffer {
            host_mirror: Vec::new(),
            remote_address,
        }
    }

    pub fn remote_address(&self) -> u64 {
        self.remote_address
    }

    pub fn ensure_len(&mut self, len: u64) {
        if (self.host_mirror.len() as u64) < len {
            self.host_mirror.resize(len as usize, 0);
        }
    }

    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        self.host_mirror
            .get(start..start + len)
            .map(|s| s.to_vec())
            .unwrap_or_else(|| vec![0; len])
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) {
        self.ensure_len(offset + bytes.len() as u64);
        let start = offset as usize;
        self.host_mirror[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn clear(&mut self, offset: u64, len: usize) {
        self.write(offset, &vec![0u8; len]);
    }
}

/// `{module_name -> set<coverage_code>}`, the shape `GetCoverage` and the
/// persisted formats use (§6, §2.2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSet {
    by_module: FastHashMap<String, FastHashSet<CoverageCode>>,
}

impl CoverageSet {
    pub fn new() -> Self {
        CoverageSet::default()
    }

    pub fn insert(&mut self, module: &str, code: CoverageCode) -> bool {
        self.by_module
            .entry(module.to_string())
            .or_default()
            .insert(code)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.by_module.keys().map(String::as_str)
    }

    pub fn codes(&self, module: &str) -> Option<&FastHashSet<CoverageCode>> {
        self.by_module.get(module)
    }

    pub fn contains(&self, module: &str, code: CoverageCode) -> bool {
        self.by_module
            .get(module)
            .is_some_and(|set| set.contains(&code))
    }

    pub fn merge(&mut self, other: &CoverageSet) {
        for (module, codes) in &other.by_module {
            let entry = self.by_module.entry(module.clone()).or_default();
            entry.extend(codes.iter().copied());
        }
    }

    pub fn diff(&self, other: &CoverageSet) -> CoverageSet {
        let mut result = CoverageSet::new();
        for (module, codes) in &self.by_module {
            let other_codes = other.by_module.get(module);
            for &code in codes {
                if !other_codes.is_some_and(|o| o.contains(&code)) {
                    result.insert(module, code);
                }
            }
        }
        result
    }

    pub fn intersect(&self, other: &CoverageSet) -> CoverageSet {
        let mut result = CoverageSet::new();
        for (module, codes) in &self.by_module {
            if let Some(other_codes) = other.by_module.get(module) {
                for &code in codes.intersection(other_codes) {
                    result.insert(module, code);
                }
            }
        }
        result
    }

    /// Text format: one line per `(module, code)` pair, `module_name,hex_offset` (§6).
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut modules: Vec<&str> = self.modules().collect();
        modules.sort_unstable();
        for module in modules {
            let mut codes: Vec<u64> = self.codes(module).unwrap().iter().map(|c| c.raw()).collect();
            codes.sort_unstable();
            for code in codes {
                out.push_str(module);
                out.push(',');
                out.push_str(&format!("{code:x}\n"));
            }
        }
        out
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut set = CoverageSet::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (module, hex) = line.split_once(',').ok_or_else(|| {
                Error::PersistFormat(format!("line {line_no}: missing ',' separator"))
            })?;
            let raw = u64::from_str_radix(hex.trim(), 16)
                .map_err(|e| Error::PersistFormat(format!("line {line_no}: {e}")))?;
            set.insert(module, CoverageCode::from_raw(raw));
        }
        Ok(set)
    }

    /// Binary format (§6): per module, 4-byte name length, name bytes,
    /// 8-byte count, then `count` little-endian 8-byte coverage codes.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut modules: Vec<&str> = self.modules().collect();
        modules.sort_unstable();
        for module in modules {
            let name_bytes = module.as_bytes();
            out.write_u32::<LittleEndian>(name_bytes.len() as u32)
                .map_err(Error::ConfigIo)?;
            out.write_all(name_bytes).map_err(Error::ConfigIo)?;
            let mut codes: Vec<u64> = self.codes(module).unwrap().iter().map(|c| c.raw()).collect();
            codes.sort_unstable();
            out.write_u64::<LittleEndian>(codes.len() as u64)
                .map_err(Error::ConfigIo)?;
            for code in codes {
                out.write_u64::<LittleEndian>(code).map_err(Error::ConfigIo)?;
            }
        }
        Ok(out)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let mut set = CoverageSet::new();
        let mut cursor = Cursor::new(bytes);
        while (cursor.position() as usize) < bytes.len() {
            let name_len = cursor.read_u32::<LittleEndian>().map_err(Error::ConfigIo)? as usize;
            let mut name_bytes = vec![0u8; name_len];
            cursor.read_exact(&mut name_bytes).map_err(Error::ConfigIo)?;
            let module = String::from_utf8(name_bytes)
                .map_err(|e| Error::PersistFormat(e.to_string()))?;
            let count = cursor.read_u64::<LittleEndian>().map_err(Error::ConfigIo)?;
            for _ in 0..count {
                let raw = cursor.read_u64::<LittleEndian>().map_err(Error::ConfigIo)?;
                set.insert(&module, CoverageCode::from_raw(raw));
            }
        }
        Ok(set)
    }
}
