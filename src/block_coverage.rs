//! Block Coverage Instrumenter (§4.1): a 7-byte flags-free store of `1` into
//! the block's (or edge's) bitmap slot, emitted immediately before the
//! translated block body.

use log::trace;

use crate::config::CoverageType;
use crate::coverage_code::CoverageCode;
use crate::emit::builder::{nop, store_byte_one_rip};
use crate::registry::Module;
use crate::translator::Translator;

const RECORDER_LEN: u64 = 7;

pub struct BlockCoverageInstrumenter {
    coverage_type: CoverageType,
}

impl BlockCoverageInstrumenter {
    pub fn new(coverage_type: CoverageType) -> Self {
        BlockCoverageInstrumenter { coverage_type }
    }

    /// Emits the recorder for a newly-discovered block, or does nothing if
    /// this block (§4.5: keyed by block offset) is already instrumented.
    /// Returns the bitmap slot the recorder targets, new or pre-existing.
    pub fn instrument_block(
        &self,
        module: &mut Module,
        translator: &mut dyn Translator,
        bitmap_remote_base: u64,
        block_offset: u32,
    ) -> u64 {
        let code = match self.coverage_type {
            CoverageType::Block => CoverageCode::block(block_offset),
            CoverageType::Edge => {
                let prev = module.last_block_offset.unwrap_or(block_offset);
                CoverageCode::edge(prev, block_offset)
            }
        };

        if let Some(slot) = module.block_bitmap_slot(code) {
            trace!("block {block_offset:#x} already instrumented, skipping recorder");
            module.last_block_offset = Some(block_offset);
            return slot;
        }

        let slot = module.allocate_bitmap_slot();
        let instrumentation_offset = translator.current_instrumented_address();
        let next_instruction_addr = instrumentation_offset + RECORDER_LEN;
        let bitmap_slot_addr = bitmap_remote_base + slot;
        let disp = (bitmap_slot_addr as i64 - next_instruction_addr as i64) as i32;

        let recorder = store_byte_one_rip(disp);
        translator.write_code(&recorder.bytes);

        module.register_block(block_offset, slot, code, instrumentation_offset);
        module.last_block_offset = Some(block_offset);

        trace!("instrumented block {block_offset:#x} at bitmap slot {slot}");
        slot
    }

    /// `IgnoreCoverage`'s block-code case (§4.5): NOP-fill the 7-byte
    /// recorder. Idempotent -- clearing an already-cleared recorder just
    /// rewrites the same NOP bytes.
    pub fn clear_recorder(&self, translator: &mut dyn Translator, instrumentation_offset: u64) {
        let filler = nop(RECORDER_LEN as usize);
        translator.write_code_at_offset(instrumentation_offset, &filler.bytes);
        translator.commit_code(instrumentation_offset, RECORDER_LEN as usize);
    }
}
