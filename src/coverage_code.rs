//! Coverage codes: opaque 64-bit identifiers naming a coverage event.
//!
//! Three shapes share the same 64-bit space without colliding (see §3 of
//! SPEC_FULL.md): block codes and edge codes always have bit 63 clear
//! (module code offsets are assumed to fit in 31 bits, i.e. modules smaller
//! than 2 GiB), while compare codes always set bit 63 as a tag.

const COMPARE_TAG: u64 = 1 << 63;
const BLOCK_OFFSET_BITS: u32 = 24;
const CMP_OFFSET_BITS: u32 = 24;
const BLOCK_OFFSET_MASK: u64 = (1 << BLOCK_OFFSET_BITS) - 1;
const CMP_OFFSET_MASK: u64 = (1 << CMP_OFFSET_BITS) - 1;

/// Maximum in-block compare offset representable by a compare code. Compares
/// past this offset are declined (§7, "basic block too large for compare
/// coverage").
pub const MAX_COMPARE_OFFSET: u32 = 1 << CMP_OFFSET_BITS;
pub const MAX_COMPARE_BLOCK_OFFSET: u32 = 1 << BLOCK_OFFSET_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoverageCode(u64);

impl CoverageCode {
    pub fn block(block_offset: u32) -> Self {
        debug_assert!(
            (block_offset as u64) < COMPARE_TAG,
            "block offset must leave the tag bit clear"
        );
        CoverageCode(block_offset as u64)
    }

    pub fn edge(prev_block_offset: u32, next_block_offset: u32) -> Self {
        debug_assert!(
            next_block_offset < (1 << 31),
            "edge code requires the next-block offset to fit in 31 bits"
        );
        let value = (prev_block_offset as u64) | ((next_block_offset as u64) << 32);
        CoverageCode(value)
    }

    /// `match_width` must be a multiple of 8 and fit a byte; `block_offset`
    /// and `cmp_offset` must each be below `2^24` (§3).
    pub fn compare(block_offset: u32, cmp_offset: u32, match_width: u8) -> Self {
        debug_assert_eq!(match_width % 8, 0, "match_width must be a multiple of 8");
        debug_assert!(
            block_offset < MAX_COMPARE_BLOCK_OFFSET,
            "block offset too large for a compare code"
        );
        debug_assert!(
            cmp_offset < MAX_COMPARE_OFFSET,
            "in-block compare offset too large for a compare code"
        );
        let value = COMPARE_TAG
            | ((block_offset as u64 & BLOCK_OFFSET_MASK) << 32)
            | ((cmp_offset as u64 & CMP_OFFSET_MASK) << 8)
            | (match_width as u64);
        CoverageCode(value)
    }

    pub fn is_compare(self) -> bool {
        self.0 & COMPARE_TAG != 0
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        CoverageCode(raw)
    }

    /// If this is a compare code, returns `(block_offset, cmp_offset, match_width)`.
    pub fn as_compare_parts(self) -> Option<(u32, u32, u8)> {
        if !self.is_compare() {
            return None;
        }
        let block_offset = ((self.0 >> 32) & BLOCK_OFFSET_MASK) as u32;
        let cmp_offset = ((self.0 >> 8) & CMP_OFFSET_MASK) as u32;
        let match_width = (self.0 & 0xFF) as u8;
        Some((block_offset, cmp_offset, match_width))
    }

    /// Returns the compare code for the same compare with a new match width,
    /// used when raising the threshold (§4.2, "Raising the threshold").
    pub fn with_match_width(self, match_width: u8) -> Self {
        let (block_offset, cmp_offset, _) = self
            .as_compare_parts()
            .expect("with_match_width called on a non-compare code");
        CoverageCode::compare(block_offset, cmp_offset, match_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_and_edge_codes_never_set_the_compare_tag() {
        let block = CoverageCode::block(0x1234);
        assert!(!block.is_compare());

        let edge = CoverageCode::edge(0x1000, 0x2000);
        assert!(!edge.is_compare());
    }

    #[test]
    fn compare_code_round_trips_its_parts() {
        let code = CoverageCode::compare(0x00AB_CDEF & 0xFF_FFFF, 0x0012_3456 & 0xFF_FFFF, 24);
        assert!(code.is_compare());
        let (block_offset, cmp_offset, match_width) = code.as_compare_parts().unwrap();
        assert_eq!(block_offset, 0x00AB_CDEF & 0xFF_FFFF);
        assert_eq!(cmp_offset, 0x0012_3456 & 0xFF_FFFF);
        assert_eq!(match_width, 24);
    }

    #[test]
    fn distinct_shapes_never_collide() {
        let block = CoverageCode::block(0x100);
        let edge = CoverageCode::edge(0x100, 0x200);
        let compare = CoverageCode::compare(0x100, 0x8, 16);
        assert_ne!(block.raw(), compare.raw());
        assert_ne!(edge.raw(), compare.raw());
    }

    #[test]
    fn with_match_width_preserves_block_and_offset() {
        let code = CoverageCode::compare(10, 20, 8);
        let raised = code.with_match_width(16);
        assert_eq!(raised.as_compare_parts(), Some((10, 20, 16)));
    }

    #[test]
    fn raw_edge_code_layout_matches_spec() {
        let edge = CoverageCode::edge(0x11, 0x22);
        assert_eq!(edge.raw(), 0x11 | (0x22u64 << 32));
    }
}
