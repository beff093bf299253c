//! RFLAGS modeling for input-to-state collection (§4.3, "Collection").

use bitflags::bitflags;

bitflags! {
    /// The subset of RFLAGS the I2S branch-direction reconstruction needs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Rflags: u32 {
        const CF = 1 << 0;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const OF = 1 << 11;
    }
}

impl Rflags {
    pub fn from_pushed_value(value: u64) -> Self {
        Rflags::from_bits_truncate(value as u32)
    }

    /// Reconstructs whether the conditional following the compare would
    /// have branched, per the table in §4.3 "Collection".
    pub fn branch_taken(self, category: crate::decode::CompareCategory) -> bool {
        use crate::decode::CompareCategory::*;
        match category {
            Below => self.contains(Rflags::CF),
            Less => self.contains(Rflags::SF) != self.contains(Rflags::OF),
            Equal => self.contains(Rflags::ZF),
            Above => !self.contains(Rflags::CF) && !self.contains(Rflags::ZF),
            Greater => {
                (self.contains(Rflags::SF) == self.contains(Rflags::OF))
                    && !self.contains(Rflags::ZF)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::CompareCategory;

    #[test]
    fn equal_compare_with_zero_flag_set_is_taken() {
        let flags = Rflags::ZF;
        assert!(flags.branch_taken(CompareCategory::Equal));
        assert!(!flags.branch_taken(CompareCategory::Below));
    }

    #[test]
    fn above_requires_both_carry_and_zero_clear() {
        let flags = Rflags::empty();
        assert!(flags.branch_taken(CompareCategory::Above));
        assert!(!(Rflags::CF).branch_taken(CompareCategory::Above));
        assert!(!(Rflags::ZF).branch_taken(CompareCategory::Above));
    }

    #[test]
    fn greater_matches_signed_compare_semantics() {
        // SF == OF and ZF clear => greater.
        assert!(Rflags::empty().branch_taken(CompareCategory::Greater));
        assert!((Rflags::SF | Rflags::OF).branch_taken(CompareCategory::Greater));
        assert!(!(Rflags::SF).branch_taken(CompareCategory::Greater));
        assert!(!(Rflags::ZF).branch_taken(CompareCategory::Greater));
    }

    #[test]
    fn less_is_sign_xor_overflow() {
        assert!(!(Rflags::empty()).branch_taken(CompareCategory::Less));
        assert!((Rflags::SF).branch_taken(CompareCategory::Less));
        assert!((Rflags::OF).branch_taken(CompareCategory::Less));
        assert!(!(Rflags::SF | Rflags::OF).branch_taken(CompareCategory::Less));
    }

    #[test]
    fn scenario_1_eax_0x11223300_vs_0x11223344_is_not_equal_flags() {
        // From SPEC_FULL.md scenario 1/2: ZF=0, CF=0, SF=0, OF=0.
        let flags = Rflags::empty();
        assert!(!flags.branch_taken(CompareCategory::Equal));
    }
}
