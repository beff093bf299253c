//! Black-box end-to-end scenarios (mirrors the project's testable-properties
//! scenarios): instrument a compare, simulate an observed hit, drain I2S
//! data, retire a wrapper, and grow an unwind run table across encodings.
//! This crate never executes x86 itself, so "running the program" is
//! simulated by computing the wrapper's own arithmetic (XOR+LZCNT, RFLAGS)
//! in the test and feeding the result back through the same public surface
//! a translator would use.

use std::cell::RefCell;

use covtrace::bitmap::Bitmap;
use covtrace::compare_coverage::CompareCoverageInstrumenter;
use covtrace::decode::{Category, CompareCategory, Decoder, Instruction, Operand, OperandKind, Region, Reg};
use covtrace::i2s::I2SInstrumenter;
use covtrace::registry::Module;
use covtrace::rflags::Rflags;
use covtrace::translator::Translator;
use covtrace::unwind::UnwindTable;

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

struct NoDecoder;

impl Decoder for NoDecoder {
    fn decode(&self, _addr: u64) -> Option<Instruction> {
        None
    }

    fn region_containing(&self, _addr: u64) -> Option<Region<'_>> {
        None
    }
}

fn reg_operand(reg: Reg, width_bits: u16) -> Operand {
    Operand {
        kind: OperandKind::Register(reg),
        width_bits,
    }
}

fn cmp_eax_0x11223344() -> Instruction {
    Instruction {
        address: 0x4000,
        length: 6,
        category: Category::Cmp,
        operands: vec![reg_operand(Reg::Rax, 32), reg_operand(Reg::Rbx, 32)],
        reads_rflags: false,
        writes_rflags: true,
    }
}

/// Scenario 1: `CMP EAX, 0x11223344; JE L` with `EAX = 0x11223300` matches 24
/// leading bits (`0x11223300 XOR 0x11223344 = 0x44`, 25 leading zero bits in
/// a 32-bit word), so the wrapper's initial `match_width = 24` threshold
/// fires, but a hypothetical `match_width = 32` would not have.
#[test]
fn scenario_1_leading_bit_match_hits_initial_threshold_but_not_full_width() {
    let instrumenter = CompareCoverageInstrumenter::new();
    let mut module = Module::new("a.out".into(), 0);
    let mut translator = FakeTranslator {
        base: 0x4000,
        ..Default::default()
    };
    let cmp = cmp_eax_0x11223344();
    let decoder = NoDecoder;
    instrumenter
        .check_eligibility(&module, &decoder, &cmp, 0x10, 0x20)
        .expect("cmp of two 32-bit GPRs is eligible");
    let id = instrumenter.instrument(&mut module, &mut translator, 0x9000_0000, &cmp, 0x10, 0x20);
    let record = module.compare_record(id);
    assert_eq!(record.match_width, 24);

    let op0: u32 = 0x11223300;
    let op1: u32 = 0x11223344;
    let leading_matching_bits = (op0 ^ op1).leading_zeros();
    assert_eq!(leading_matching_bits, 25);

    let mut bitmap = Bitmap::new(0x9000_0000);
    let fires_at_24 = leading_matching_bits >= record.match_width as u32;
    assert!(fires_at_24);
    if fires_at_24 {
        bitmap.mark(record.bitmap_slot);
    }
    assert_eq!(bitmap.get(record.bitmap_slot), Some(1));

    let fires_at_32 = leading_matching_bits >= 32;
    assert!(!fires_at_32, "25 matching bits must not satisfy a 32-bit threshold");
}

/// Scenario 2: with I2S enabled for the same compare and input, the drained
/// record carries both operands and flags with every bit clear (not equal,
/// not below, not signed), branch not taken for an `equal` classification.
#[test]
fn scenario_2_i2s_collects_operands_and_not_equal_flags() {
    let instrumenter = I2SInstrumenter::new();
    let mut module = Module::new("a.out".into(), 0);
    let mut translator = FakeTranslator {
        base: 0x5000,
        ..Default::default()
    };
    let cmp = cmp_eax_0x11223344();
    let id = instrumenter.instrument(
        &mut module,
        &mut translator,
        0xA000_0000,
        &cmp,
        CompareCategory::Equal,
        0x10,
        0x20,
    );
    instrumenter.enable(&mut module, &mut translator, id);
    assert!(module.i2s_record(id).enabled);

    let op0: u32 = 0x11223300;
    let op1: u32 = 0x11223344;
    let flags = Rflags::empty(); // ZF=0, CF=0, SF=0, OF=0 per the scenario.

    let scratch: std::collections::HashMap<(u64, usize), Vec<u8>> = {
        let record = module.i2s_record(id);
        std::collections::HashMap::from([
            ((record.hit_slot, 4usize), vec![1, 0, 0, 0]),
            ((record.op0_slot, 4usize), op0.to_le_bytes().to_vec()),
            ((record.op1_slot, 4usize), op1.to_le_bytes().to_vec()),
            ((record.flags_slot, 4usize), flags.bits().to_le_bytes().to_vec()),
        ])
    };

    let hit = instrumenter.collect(&mut module, id, &|offset, len| {
        scratch.get(&(offset, len)).cloned().unwrap_or_else(|| vec![0; len])
    });
    assert!(hit);

    let data = module.i2s_record(id).last_hit.clone().expect("hit was collected");
    assert_eq!(data.op0, op0.to_le_bytes().to_vec());
    assert_eq!(data.op1, op1.to_le_bytes().to_vec());
    assert_eq!(data.category, CompareCategory::Equal);
    assert!(!data.branch_taken);
}

/// Scenario 3: toggling I2S off means a subsequent run produces no hit and
/// leaves the drained state untouched.
#[test]
fn scenario_3_disabled_i2s_produces_no_hit() {
    let instrumenter = I2SInstrumenter::new();
    let mut module = Module::new("a.out".into(), 0);
    let mut translator = FakeTranslator {
        base: 0x5000,
        ..Default::default()
    };
    let cmp = cmp_eax_0x11223344();
    let id = instrumenter.instrument(
        &mut module,
        &mut translator,
        0xA000_0000,
        &cmp,
        CompareCategory::Equal,
        0x10,
        0x20,
    );
    // Never enabled: the wrapper stays a JMP-over-itself, so no hit slot is
    // ever written by a real run. Collection sees an all-zero hit slot.
    let hit = instrumenter.collect(&mut module, id, &|_offset, len| vec![0; len]);
    assert!(!hit);
    assert!(module.i2s_record(id).last_hit.is_none());
}

/// Scenario 4: `IgnoreCoverage` on a 32-bit compare's code raises the
/// threshold past the full operand width in one step (24 -> 32), retiring
/// the wrapper; the match-width byte settles at the full operand width.
#[test]
fn scenario_4_ignore_coverage_retires_a_32_bit_compare_in_one_raise() {
    let instrumenter = CompareCoverageInstrumenter::new();
    let mut module = Module::new("a.out".into(), 0);
    let mut translator = FakeTranslator {
        base: 0x4000,
        ..Default::default()
    };
    let cmp = cmp_eax_0x11223344();
    let id = instrumenter.instrument(&mut module, &mut translator, 0x9000_0000, &cmp, 0x10, 0x20);
    assert_eq!(module.compare_record(id).match_width, 24);

    instrumenter.raise_or_retire(&mut module, &mut translator, id);

    let record = module.compare_record(id);
    assert!(record.ignored);
    assert_eq!(record.match_width, 32);

    // Re-running IgnoreCoverage again is idempotent (no further state change).
    instrumenter.raise_or_retire(&mut module, &mut translator, id);
    assert!(module.compare_record(id).ignored);
    assert_eq!(module.compare_record(id).match_width, 32);
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

const HEADER_LEN: u32 = 28;
const INDEX_ENTRY_LEN: u32 = 12;
const SECOND_LEVEL_REGULAR: u32 = 2;

/// Builds a synthetic `__unwind_info`-shaped section with a single regular
/// second-level page covering two function-offset ranges: `[0, 0x3C00)`
/// under `encoding_a` (standing in for the first 60 of 100 blocks, each 256
/// bytes apart) and `[0x3C00, 0x6400)` under `encoding_b` (the remaining 40).
fn build_two_encoding_section(encoding_a: u32, encoding_b: u32) -> Vec<u8> {
    let mut data = Vec::new();
    push_u32(&mut data, 1); // version
    push_u32(&mut data, HEADER_LEN); // common encodings offset (none, count 0)
    push_u32(&mut data, 0); // common encodings count
    push_u32(&mut data, 0); // personality offset
    push_u32(&mut data, 0); // personality count
    let index_offset = HEADER_LEN;
    push_u32(&mut data, index_offset);
    push_u32(&mut data, 2); // index count (1 real + sentinel)

    let page_offset = index_offset + 2 * INDEX_ENTRY_LEN;
    push_u32(&mut data, 0x0000);
    push_u32(&mut data, page_offset);
    push_u32(&mut data, 0);
    push_u32(&mut data, 0x10000); // sentinel function offset, past every block
    push_u32(&mut data, 0);
    push_u32(&mut data, 0);

    push_u32(&mut data, SECOND_LEVEL_REGULAR);
    push_u32(&mut data, 12);
    push_u32(&mut data, 2);
    push_u32(&mut data, 0x0000);
    push_u32(&mut data, encoding_a);
    push_u32(&mut data, 0x3C00);
    push_u32(&mut data, encoding_b);

    data
}

/// Scenario 5: 100 blocks (256 bytes apart) across two unwind encodings, the
/// first 60 under E1 and the rest under E2; the transcoder produces exactly
/// two disjoint, contiguous, ordered runs.
#[test]
fn scenario_5_two_encodings_across_a_hundred_blocks_yield_two_runs() {
    let section = build_two_encoding_section(7, 9);
    let mut table = UnwindTable::new();
    table.load(&section).unwrap();

    let mut translated_addr: u64 = 0x8000_0000;
    for block in 0..100u32 {
        let orig_addr = block * 256;
        table.observe(orig_addr, translated_addr);
        translated_addr += 1;
    }

    let runs = table.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].encoding, 7);
    assert_eq!(runs[1].encoding, 9);
    assert!(runs[0].max_translated_addr < runs[1].min_translated_addr);
    assert_eq!(runs[0].max_translated_addr + 1, runs[1].min_translated_addr);
}

/// Scenario 6: one original instruction expanding to three translated
/// instructions under one encoding contributes at most one additional run
/// spanning all three translated addresses.
#[test]
fn scenario_6_one_instruction_expanding_to_three_translated_stays_one_run() {
    let section = build_two_encoding_section(7, 7);
    let mut table = UnwindTable::new();
    table.load(&section).unwrap();

    // OnBasicBlockStart, OnInstruction, OnBasicBlockEnd(addr-1) all observe
    // the same original instruction against three translated addresses.
    table.observe(0x10, 0x9000_0000);
    table.observe(0x10, 0x9000_0001);
    table.observe(0x10, 0x9000_0002);

    assert_eq!(table.runs().len(), 1);
    let run = &table.runs()[0];
    assert_eq!(run.min_translated_addr, 0x9000_0000);
    assert_eq!(run.max_translated_addr, 0x9000_0002);
}
