//! Stack-unwind-info transcoder (§4.6): re-publishes the compact unwind
//! encoding that covered an *original* address against the instruction's
//! *translated* address, so exception unwinding still works in rewritten
//! code.

pub mod macho;

pub use macho::{CompactUnwindInfo, SecondLevelPage};

/// One contiguous run of translated addresses sharing the same encoding
/// (§3, "Unwind Metadata").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRun {
    pub encoding: u32,
    pub min_translated_addr: u64,
    pub max_translated_addr: u64,
}

/// The translated run-length table for one module, plus the parsed
/// original-address unwind info it was built from.
#[derive(Debug, Default)]
pub struct UnwindTable {
    source: Option<CompactUnwindInfo>,
    runs: Vec<UnwindRun>,
}

impl UnwindTable {
    pub fn new() -> Self {
        UnwindTable::default()
    }

    /// Snapshots the module's `__TEXT,__unwind_info` section (§4.6 step 1).
    pub fn load(&mut self, section_data: &[u8]) -> crate::error::Result<()> {
        self.source = Some(CompactUnwindInfo::parse(section_data)?);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.source.is_some()
    }

    /// Resolves the compact-unwind encoding covering `orig_addr` (a
    /// module-relative function offset), per §4.6 steps 2-4.
    pub fn encoding_for(&self, orig_addr: u32) -> Option<u32> {
        self.source.as_ref()?.encoding_for(orig_addr)
    }

    /// Appends or extends a run for `translated_addr` under `encoding`
    /// (§4.6 step 5 / §3 "Unwind Metadata").
    pub fn record(&mut self, encoding: u32, translated_addr: u64) {
        if let Some(last) = self.runs.last_mut() {
            if last.encoding == encoding && translated_addr == last.max_translated_addr + 1 {
                last.max_translated_addr = translated_addr;
                return;
            }
            if last.encoding == encoding && translated_addr <= last.max_translated_addr {
                // Re-observed an address already covered by the last run
                // (e.g. OnBasicBlockEnd using translated_addr - 1 against an
                // address OnInstruction already recorded); not a new run.
                return;
            }
        }
        self.runs.push(UnwindRun {
            encoding,
            min_translated_addr: translated_addr,
            max_translated_addr: translated_addr,
        });
    }

    /// Looks up `orig_addr`'s encoding and records it against
    /// `translated_addr` in one step; the common call shape for
    /// `OnBasicBlockStart`/`OnInstruction`/`OnBasicBlockEnd` (§4.6,
    /// "Order-sensitive detail").
    pub fn observe(&mut self, orig_addr: u32, translated_addr: u64) {
        if let Some(encoding) = self.encoding_for(orig_addr) {
            self.record(encoding, translated_addr);
        }
    }

    pub fn runs(&self) -> &[UnwindRun] {
        &self.runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_addresses_under_the_same_encoding_extend_one_run() {
        let mut table = UnwindTable::new();
        table.record(7, 0x1000);
        table.record(7, 0x1001);
        table.record(7, 0x1002);
        assert_eq!(table.runs().len(), 1);
        assert_eq!(table.runs()[0].min_translated_addr, 0x1000);
        assert_eq!(table.runs()[0].max_translated_addr, 0x1002);
    }

    #[test]
    fn encoding_change_starts_a_new_run() {
        let mut table = UnwindTable::new();
        table.record(7, 0x1000);
        table.record(9, 0x1001);
        assert_eq!(table.runs().len(), 2);
        assert_eq!(table.runs()[1].encoding, 9);
    }

    #[test]
    fn one_instruction_expanding_to_several_translated_instructions_stays_one_run() {
        // Simulates OnBasicBlockStart, OnInstruction, OnBasicBlockEnd(addr-1)
        // all observing the same original instruction (§4.6, order-sensitive
        // detail).
        let mut table = UnwindTable::new();
        table.record(11, 0x2000);
        table.record(11, 0x2001);
        table.record(11, 0x2002); // end address - 1, still within the run
        assert_eq!(table.runs().len(), 1);
        assert_eq!(table.runs()[0].max_translated_addr, 0x2002);
    }
}
