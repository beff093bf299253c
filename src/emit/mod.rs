//! Typed builder API for the handful of mnemonics the instrumenters emit
//! (§9, "Emitter helpers" redesign hint). Each builder returns the encoded
//! bytes together with the byte offsets of anything a caller might need to
//! patch later, instead of making the caller re-scan the tail of the buffer
//! to find e.g. the match-width `imm8`.

pub mod builder;

/// Bytes for one emitted mnemonic, plus bookkeeping offsets into those bytes.
#[derive(Debug, Clone)]
pub struct Emitted {
    pub bytes: Vec<u8>,
    /// Byte offset, within `bytes`, of an immediate or displacement a caller
    /// may need to patch in place later (e.g. the compare wrapper's
    /// match-width `imm8`). `None` when the builder has nothing fixup-worthy.
    pub patch_offset: Option<usize>,
}

impl Emitted {
    pub fn plain(bytes: Vec<u8>) -> Self {
        Emitted {
            bytes,
            patch_offset: None,
        }
    }

    pub fn with_patch(bytes: Vec<u8>, patch_offset: usize) -> Self {
        Emitted {
            bytes,
            patch_offset: Some(patch_offset),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A sequence of [`Emitted`] chunks that together make up one wrapper. Offers
/// the total length up front (needed to compute forward-branch displacements
/// before any bytes are written) and flattens to one `Vec<u8>` on demand.
#[derive(Debug, Default)]
pub struct Sequence {
    chunks: Vec<Emitted>,
}

impl Sequence {
    pub fn new() -> Self {
        Sequence { chunks: Vec::new() }
    }

    pub fn push(&mut self, emitted: Emitted) -> usize {
        let offset = self.len();
        self.chunks.push(emitted);
        offset
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Emitted::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Offset, in the flattened byte stream, of chunk `index`'s `patch_offset`.
    pub fn absolute_patch_offset(&self, index: usize) -> Option<usize> {
        let mut offset = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i == index {
                return chunk.patch_offset.map(|p| offset + p);
            }
            offset += chunk.len();
        }
        None
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks {
            out.extend_from_slice(&chunk.bytes);
        }
        out
    }
}

/// Emits a RIP-relative instruction built by `make(disp)`, fixing the
/// displacement against the wrapper's own address (§4.2 step 5, §4.3 steps
/// 5-7: "fix RIP-relative displacement against the wrapper's current
/// address"). Works because the encoders in [`builder`] always encode the
/// same length regardless of the displacement's value, so a throwaway probe
/// with `disp=0` reveals the instruction length needed to compute the real
/// one.
pub fn push_rip_relative(seq: &mut Sequence, wrapper_base: u64, target_abs: u64, make: impl Fn(i32) -> Emitted) -> usize {
    let instr_addr = wrapper_base + seq.len() as u64;
    let probe = make(0);
    let instr_len = probe.len() as u64;
    let next_addr = instr_addr + instr_len;
    let disp = (target_abs as i64 - next_addr as i64) as i32;
    seq.push(make(disp))
}
