//! Compare-Coverage Instrumenter (§4.2) and the SUB-viability scan (§4.4).

use log::{trace, warn};

use crate::coverage_code::{CoverageCode, MAX_COMPARE_BLOCK_OFFSET, MAX_COMPARE_OFFSET};
use crate::decode::{Category, CompareCategory, CondKind, DeclineReason, Decoder, Eligibility, Instruction, Reg};
use crate::emit::builder::{cmp_reg_imm8, jcc_rel32, mov_reg_rip_mem, nop, push_reg, store_byte_one_rip, xor_reg_imm32, xor_reg_reg, xor_reg_rip_mem, JccCondition};
use crate::emit::{push_rip_relative, Sequence};
use crate::registry::{CompareRecord, CompareRecordId, Module, Wrapper};
use crate::translator::Translator;

const JMP_LEN: u64 = 5;
const RECORDER_LEN: u64 = 7;
/// dst_reg candidate order, skipping RSP (never chosen, §4.2 step 3).
const SCRATCH_CANDIDATES: [Reg; 6] = [Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rbx, Reg::Rsi, Reg::Rdi];

/// Maps a decoder-reported condition-code suffix to the compare-progress
/// category this crate instruments (§4.3): `JB/CMOVB -> below`,
/// `JL/CMOVL -> less`, `JA/CMOVNBE -> above`, `JG/CMOVNLE -> greater`,
/// anything else -> `equal`.
pub fn classify_cond(cond: CondKind) -> CompareCategory {
    match cond {
        CondKind::B => CompareCategory::Below,
        CondKind::L => CompareCategory::Less,
        CondKind::A => CompareCategory::Above,
        CondKind::G => CompareCategory::Greater,
        CondKind::Ae | CondKind::Ge | CondKind::Be | CondKind::Le | CondKind::E | CondKind::Ne | CondKind::Other => {
            CompareCategory::Equal
        }
    }
}

/// Scans forward from a `SUB` looking for the first flag-consuming
/// instruction (§4.4). `region` bounds how far forward decoding is allowed.
pub fn sub_viability_scan(decoder: &dyn Decoder, sub: &Instruction) -> Eligibility<CompareCategory> {
    let region = decoder
        .region_containing(sub.address)
        .ok_or(DeclineReason::SubNotViable)?;

    let mut addr = sub.end_address();
    loop {
        if addr >= region.to {
            return Err(DeclineReason::SubNotViable);
        }
        let instr = match decoder.decode(addr) {
            Some(instr) => instr,
            None => return Err(DeclineReason::SubNotViable),
        };

        match instr.category {
            Category::CondBranch(cond) | Category::CondMove(cond) => return Ok(classify_cond(cond)),
            Category::Call | Category::Ret | Category::UncondBranch => {
                return Err(DeclineReason::SubNotViable)
            }
            _ if instr.reads_rflags => return Err(DeclineReason::SubNotViable),
            _ => {
                addr = instr.end_address();
            }
        }
    }
}

fn pick_scratch_register(operand1: &crate::decode::Operand, operand2: &crate::decode::Operand) -> Reg {
    if let Some(reg) = operand1.register() {
        return reg;
    }
    let avoid = operand2.register();
    SCRATCH_CANDIDATES
        .into_iter()
        .find(|r| Some(*r) != avoid)
        .expect("scratch candidate list is non-empty and avoid excludes at most one")
}

pub struct CompareCoverageInstrumenter;

impl CompareCoverageInstrumenter {
    pub fn new() -> Self {
        CompareCoverageInstrumenter
    }

    /// Checks eligibility (§4.2 first paragraph, §4.4) without emitting
    /// anything. Ineligibility is silent per §7: callers log at `trace!` and
    /// move on, never surfacing an [`crate::error::Error`].
    pub fn check_eligibility(
        &self,
        module: &Module,
        decoder: &dyn Decoder,
        instr: &Instruction,
        block_offset: u32,
        cmp_offset: u32,
    ) -> Eligibility<CompareCategory> {
        if !matches!(instr.category, Category::Cmp | Category::Sub) {
            return Err(DeclineReason::NotCmpOrSub);
        }

        let width = instr.operand_width_bits().ok_or(DeclineReason::OperandTooNarrow)?;
        if width < 16 {
            return Err(DeclineReason::OperandTooNarrow);
        }
        if instr.operands.iter().any(|op| op.is_stack_pointer()) {
            return Err(DeclineReason::StackPointerOperand);
        }
        if block_offset >= MAX_COMPARE_BLOCK_OFFSET || cmp_offset >= MAX_COMPARE_OFFSET {
            warn!("block {block_offset:#x}+{cmp_offset:#x} too large for a compare code, declining");
            return Err(DeclineReason::BlockTooLargeForCompareCode);
        }
        if module.find_compare_record_for(block_offset, cmp_offset).is_some() {
            return Err(DeclineReason::AlreadyInstrumented);
        }

        match instr.category {
            // SUB additionally requires the forward scan to succeed; its
            // result doubles as the I2S category (§4.3).
            Category::Sub => sub_viability_scan(decoder, instr),
            // CMP's eligibility never depends on the scan; its category
            // falls back to `equal` when the scan can't classify it.
            _ => Ok(sub_viability_scan(decoder, instr).unwrap_or(CompareCategory::Equal)),
        }
    }

    /// Emits the full wrapper (§4.2 steps 1-11) for an already-eligible
    /// compare and registers its record. Returns the new record's id.
    pub fn instrument(
        &self,
        module: &mut Module,
        translator: &mut dyn Translator,
        bitmap_remote_base: u64,
        instr: &Instruction,
        block_offset: u32,
        cmp_offset: u32,
    ) -> CompareRecordId {
        let operand1 = &instr.operands[0];
        let operand2 = &instr.operands[1];
        let width = instr.operand_width_bits().expect("checked by check_eligibility");
        let match_width = (width - 8) as u8;
        let dst_reg = pick_scratch_register(operand1, operand2);

        let wrapper_base = translator.current_instrumented_address();
        let mut seq = Sequence::new();

        // 1. 5-byte NOP placeholder, overwritten by a JMP when retired.
        seq.push(nop(JMP_LEN as usize));

        // 2. Stack-frame shim: this core's `Translator` does not expose a
        // frame depth to undo, so the shim is empty for every embedder this
        // crate currently targets.

        // 3. PUSH dst_reg.
        seq.push(push_reg(dst_reg));

        // 4. MOV dst_reg, operand1 if operand1 is memory.
        if let crate::decode::OperandKind::Memory { disp, .. } = operand1.kind {
            let target_abs = (instr.address as i64 + instr.length as i64 + disp as i64) as u64;
            push_rip_relative(&mut seq, wrapper_base, target_abs, |d| {
                mov_reg_rip_mem(dst_reg, width, d)
            });
        }

        // 5. XOR dst_reg, operand2.
        match operand2.kind {
            crate::decode::OperandKind::Register(src) => {
                seq.push(xor_reg_reg(dst_reg, src, width));
            }
            crate::decode::OperandKind::Memory { disp, .. } => {
                let target_abs = (instr.address as i64 + instr.length as i64 + disp as i64) as u64;
                push_rip_relative(&mut seq, wrapper_base, target_abs, |d| {
                    xor_reg_rip_mem(dst_reg, width, d)
                });
            }
            crate::decode::OperandKind::Immediate(imm) => {
                seq.push(xor_reg_imm32(dst_reg, width, imm as i32));
            }
        }

        // 6. LZCNT dst_reg, dst_reg.
        seq.push(crate::emit::builder::lzcnt_reg_reg(dst_reg, dst_reg, width));

        // 7. CMP dst_reg, imm8=match_width. Record the patch offset for
        // later threshold raises.
        let cmp_chunk_index = seq.push(cmp_reg_imm8(dst_reg, match_width, width));
        let match_width_patch_offset =
            wrapper_base + seq.absolute_patch_offset(cmp_chunk_index).expect("cmp_reg_imm8 always has a patch offset") as u64;

        // 8. JB end -- skip the recorder if fewer than match_width bits matched.
        // `end` (the POP) sits exactly RECORDER_LEN bytes after this Jcc.
        seq.push(jcc_rel32(JccCondition::Below, RECORDER_LEN as i32));

        // 9. 7-byte store of 1 into the bitmap slot.
        let slot = module.allocate_bitmap_slot();
        let recorder_addr = wrapper_base + seq.len() as u64;
        let bitmap_slot_addr = bitmap_remote_base + slot;
        let disp = (bitmap_slot_addr as i64 - (recorder_addr as i64 + RECORDER_LEN as i64)) as i32;
        seq.push(store_byte_one_rip(disp));

        // 10. end: POP dst_reg.
        seq.push(crate::emit::builder::pop_reg(dst_reg));

        // 11. Undo the stack shim: empty, matching step 2.

        let wrapper_size = seq.len() as u64;
        translator.write_code(&seq.into_bytes());

        let record = CompareRecord {
            block_offset,
            cmp_offset,
            width_bits: width,
            match_width,
            wrapper_offset: wrapper_base,
            match_width_patch_offset,
            wrapper_size,
            bitmap_slot: slot,
            ignored: false,
        };
        let code = record.coverage_code();
        let id = module.insert_compare_record(record, slot);
        module.register_wrapper(code, slot, wrapper_base, Wrapper::Compare(id));

        trace!(
            "instrumented compare at block {block_offset:#x}+{cmp_offset:#x}, width {width}, initial match_width {match_width}"
        );
        id
    }

    /// Raises a record's match-width threshold by 8 bits (§4.2, "Raising the
    /// threshold"), or retires the wrapper entirely if that reaches the full
    /// operand width (§4.2, "Retiring").
    pub fn raise_or_retire(&self, module: &mut Module, translator: &mut dyn Translator, id: CompareRecordId) {
        let old_code = module.compare_record(id).coverage_code();
        let (new_match_width, width_bits, patch_offset, wrapper_offset, wrapper_size) = {
            let record = module.compare_record(id);
            (
                record.match_width + 8,
                record.width_bits,
                record.match_width_patch_offset,
                record.wrapper_offset,
                record.wrapper_size,
            )
        };

        if new_match_width as u16 >= width_bits {
            self.retire(module, translator, id);
            return;
        }

        translator.write_code_at_offset(patch_offset, &[new_match_width]);
        translator.commit_code(patch_offset, 1);

        let record = module.compare_record_mut(id);
        record.match_width = new_match_width;
        let new_code = record.coverage_code();
        module.rekey_compare_record(id, old_code, new_code);
        let _ = (wrapper_offset, wrapper_size);
    }

    fn retire(&self, module: &mut Module, translator: &mut dyn Translator, id: CompareRecordId) {
        let record = module.compare_record(id);
        if record.ignored {
            return; // idempotent (§8, "IgnoreCoverage(C); IgnoreCoverage(C)")
        }
        let wrapper_offset = record.wrapper_offset;
        let wrapper_size = record.wrapper_size;
        let match_width = record.match_width;
        let width_bits = record.width_bits;

        let final_match_width = if match_width + 8 >= width_bits as u8 {
            width_bits as u8
        } else {
            match_width
        };

        let jmp_disp = (wrapper_size - JMP_LEN) as i32;
        let jmp = crate::emit::builder::jmp_rel32(jmp_disp);
        translator.write_code_at_offset(wrapper_offset, &jmp.bytes);
        translator.commit_code(wrapper_offset, jmp.bytes.len());

        let record = module.compare_record_mut(id);
        record.ignored = true;
        record.match_width = final_match_width;
    }
}
