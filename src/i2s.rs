//! Input-to-State Instrumenter (§4.3): for each eligible compare, a wrapper
//! that -- when enabled -- captures both operand values and the RFLAGS
//! state observed just after the original compare executes.

use log::trace;

use crate::decode::{CompareCategory, Instruction, OperandKind};
use crate::emit::builder::{jmp_rel32, mov_reg_imm32, mov_reg_reg, mov_reg_rip_mem, mov_rip_mem_reg, nop, pop_reg, push_reg, pushf, store_dword_one_rip};
use crate::emit::{push_rip_relative, Sequence};
use crate::registry::{I2sRecord, I2sRecordId, Module};
use crate::rflags::Rflags;
use crate::translator::Translator;

const SWITCH_LEN: u64 = 5;
const HIT_SLOT_LEN: u64 = 4;

pub struct I2SInstrumenter;

impl I2SInstrumenter {
    pub fn new() -> Self {
        I2SInstrumenter
    }

    /// Emits the wrapper (§4.3 steps 1-9), initially "off" (step 1 is a JMP
    /// over the whole body). `scratch_remote_base + *_slot` addresses the
    /// shared I2S scratch buffer (§3, "I2S Scratch").
    #[allow(clippy::too_many_arguments)]
    pub fn instrument(
        &self,
        module: &mut Module,
        translator: &mut dyn Translator,
        scratch_remote_base: u64,
        instr: &Instruction,
        category: CompareCategory,
        block_offset: u32,
        cmp_offset: u32,
    ) -> I2sRecordId {
        let operand1 = &instr.operands[0];
        let operand2 = &instr.operands[1];
        let width = instr.operand_width_bits().expect("checked by caller");
        let operand_len_bytes = (width / 8) as u8;
        let dst_reg = operand1
            .register()
            .unwrap_or(crate::decode::Reg::Rax);

        let hit_slot = module.allocate_i2s_scratch(HIT_SLOT_LEN);
        let op0_slot = module.allocate_i2s_scratch(operand_len_bytes as u64);
        let op1_slot = module.allocate_i2s_scratch(operand_len_bytes as u64);
        let flags_slot = module.allocate_i2s_scratch(operand_len_bytes as u64);

        let wrapper_base = translator.current_instrumented_address();
        let mut seq = Sequence::new();

        // 1. 5-byte forward JMP over the whole wrapper -- the on/off switch,
        // initially off. The real displacement is written directly below
        // once `wrapper_size` is known; this placeholder is never committed.
        seq.push(jmp_rel32(0));

        // 2. Stack-pointer shim: empty (see compare_coverage.rs's note).

        // 3. PUSH dst_reg.
        seq.push(push_reg(dst_reg));

        // 4. Write the 4-byte hit marker.
        push_rip_relative(&mut seq, wrapper_base, scratch_remote_base + hit_slot, |d| {
            store_dword_one_rip(d)
        });

        // 5. Materialize operand1 into dst_reg if needed, then store it.
        if let OperandKind::Memory { disp, .. } = operand1.kind {
            let target_abs = (instr.address as i64 + instr.length as i64 + disp as i64) as u64;
            push_rip_relative(&mut seq, wrapper_base, target_abs, |d| {
                mov_reg_rip_mem(dst_reg, width, d)
            });
        }
        push_rip_relative(&mut seq, wrapper_base, scratch_remote_base + op0_slot, |d| {
            mov_rip_mem_reg(dst_reg, width, d)
        });

        // 6. MOV dst_reg, operand2; store it.
        match operand2.kind {
            OperandKind::Register(src) => seq.push(mov_reg_reg(dst_reg, src, width)),
            OperandKind::Memory { disp, .. } => {
                let target_abs = (instr.address as i64 + instr.length as i64 + disp as i64) as u64;
                push_rip_relative(&mut seq, wrapper_base, target_abs, |d| {
                    mov_reg_rip_mem(dst_reg, width, d)
                });
            }
            OperandKind::Immediate(imm) => seq.push(mov_reg_imm32(dst_reg, width, imm as i32)),
        }
        push_rip_relative(&mut seq, wrapper_base, scratch_remote_base + op1_slot, |d| {
            mov_rip_mem_reg(dst_reg, width, d)
        });

        // 7. PUSHF; POP dst_reg; store it.
        seq.push(pushf());
        seq.push(pop_reg(dst_reg));
        push_rip_relative(&mut seq, wrapper_base, scratch_remote_base + flags_slot, |d| {
            mov_rip_mem_reg(dst_reg, width, d)
        });

        // 8. POP dst_reg.
        seq.push(pop_reg(dst_reg));

        // 9. Undo the stack shim: empty.

        let wrapper_size = seq.len() as u64;

        // Now that the size is known, fix the leading JMP's displacement:
        // off by construction (jumps past the whole body).
        let off_jmp = jmp_rel32((wrapper_size - SWITCH_LEN) as i32);
        translator.write_code(&off_jmp.bytes);
        translator.write_code(&seq.into_bytes()[SWITCH_LEN as usize..]);

        let record = I2sRecord {
            block_offset,
            cmp_offset,
            category,
            operand_len_bytes,
            wrapper_offset: wrapper_base,
            wrapper_size,
            hit_slot,
            op0_slot,
            op1_slot,
            flags_slot,
            enabled: false,
            ignored: false,
            last_hit: None,
        };
        let id = module.insert_i2s_record(record);

        trace!(
            "instrumented i2s wrapper at block {block_offset:#x}+{cmp_offset:#x}, category {:?}",
            category
        );
        id
    }

    /// Flips the leading switch to "on": NOP over the JMP (§4.3, "To enable").
    pub fn enable(&self, module: &mut Module, translator: &mut dyn Translator, id: I2sRecordId) {
        let record = module.i2s_record(id);
        if record.enabled {
            return;
        }
        let offset = record.wrapper_offset;
        translator.write_code_at_offset(offset, &nop(SWITCH_LEN as usize).bytes);
        translator.commit_code(offset, SWITCH_LEN as usize);
        module.i2s_record_mut(id).enabled = true;
    }

    /// Flips the leading switch back to "off": JMP over the whole wrapper
    /// (§4.3, "To disable again"). Always reversible -- never a permanent
    /// NOP-out (§9, "order number" open question, decided to omit).
    pub fn disable(&self, module: &mut Module, translator: &mut dyn Translator, id: I2sRecordId) {
        let record = module.i2s_record(id);
        if !record.enabled {
            return;
        }
        let offset = record.wrapper_offset;
        let disp = (record.wrapper_size - SWITCH_LEN) as i32;
        translator.write_code_at_offset(offset, &jmp_rel32(disp).bytes);
        translator.commit_code(offset, SWITCH_LEN as usize);
        module.i2s_record_mut(id).enabled = false;
    }

    /// Drains a fired hit slot into the record's `last_hit` (§4.3,
    /// "Collection"). `read_scratch` reads `len` bytes from the scratch
    /// buffer's host mirror at the given module-relative slot offset.
    pub fn collect(
        &self,
        module: &mut Module,
        id: I2sRecordId,
        read_scratch: &dyn Fn(u64, usize) -> Vec<u8>,
    ) -> bool {
        let record = module.i2s_record(id);
        let hit = read_scratch(record.hit_slot, HIT_SLOT_LEN as usize);
        if hit.iter().all(|b| *b == 0) {
            return false;
        }

        let len = record.operand_len_bytes as usize;
        let op0 = read_scratch(record.op0_slot, len);
        let op1 = read_scratch(record.op1_slot, len);
        let flags_bytes = read_scratch(record.flags_slot, len);
        let mut flags_raw = 0u64;
        for (i, byte) in flags_bytes.iter().enumerate().take(8) {
            flags_raw |= (*byte as u64) << (8 * i);
        }
        let flags = Rflags::from_pushed_value(flags_raw);
        let branch_taken = flags.branch_taken(record.category);

        let block_offset = record.block_offset;
        let cmp_offset = record.cmp_offset;
        let category = record.category;

        let record = module.i2s_record_mut(id);
        record.last_hit = Some(crate::registry::I2SData {
            block_offset,
            cmp_offset,
            category,
            op0,
            op1,
            flags_raw,
            branch_taken,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Category, Operand, OperandKind, Reg};
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeTranslator {
        buffer: RefCell<Vec<u8>>,
        base: u64,
    }

    impl Translator for FakeTranslator {
        fn write_code(&mut self, bytes: &[u8]) -> u64 {
            let addr = self.base + self.buffer.borrow().len() as u64;
            self.buffer.borrow_mut().extend_from_slice(bytes);
            addr
        }

        fn write_code_at_offset(&mut self, offset: u64, bytes: &[u8]) {
            let start = (offset - self.base) as usize;
            self.buffer.borrow_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        }

        fn commit_code(&mut self, _offset: u64, _len: usize) {}

        fn current_instrumented_address(&self) -> u64 {
            self.base + self.buffer.borrow().len() as u64
        }
    }

    fn reg_operand(reg: Reg, width_bits: u16) -> Operand {
        Operand {
            kind: OperandKind::Register(reg),
            width_bits,
        }
    }

    #[test]
    fn wrapper_starts_disabled_with_a_leading_jmp() {
        let instrumenter = I2SInstrumenter::new();
        let mut module = Module::new("a.out".into(), 0);
        let mut translator = FakeTranslator {
            base: 0x6000,
            ..Default::default()
        };
        let cmp = Instruction {
            address: 0x6000,
            length: 3,
            category: Category::Cmp,
            operands: vec![reg_operand(Reg::Rax, 32), reg_operand(Reg::Rbx, 32)],
            reads_rflags: false,
            writes_rflags: true,
        };
        let id = instrumenter.instrument(&mut module, &mut translator, 0xA000_0000, &cmp, CompareCategory::Equal, 0, 0);
        assert!(!module.i2s_record(id).enabled);
        assert_eq!(translator.buffer.borrow()[0], 0xE9); // JMP rel32 opcode
    }

    #[test]
    fn enable_then_disable_restores_the_original_jmp_bytes() {
        let instrumenter = I2SInstrumenter::new();
        let mut module = Module::new("a.out".into(), 0);
        let mut translator = FakeTranslator {
            base: 0x6000,
            ..Default::default()
        };
        let cmp = Instruction {
            address: 0x6000,
            length: 3,
            category: Category::Cmp,
            operands: vec![reg_operand(Reg::Rax, 32), reg_operand(Reg::Rbx, 32)],
            reads_rflags: false,
            writes_rflags: true,
        };
        let id = instrumenter.instrument(&mut module, &mut translator, 0xA000_0000, &cmp, CompareCategory::Equal, 0, 0);
        let original_switch = translator.buffer.borrow()[0..5].to_vec();

        instrumenter.enable(&mut module, &mut translator, id);
        assert!(module.i2s_record(id).enabled);
        assert_ne!(translator.buffer.borrow()[0..5].to_vec(), original_switch);

        instrumenter.disable(&mut module, &mut translator, id);
        assert!(!module.i2s_record(id).enabled);
        assert_eq!(translator.buffer.borrow()[0..5].to_vec(), original_switch);
    }
}
