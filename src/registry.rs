//! Per-module instrumentation registry (§4.5): the maps between block
//! offsets, bitmap slots, coverage codes and the compare/I2S records that
//! interpret a runtime hit.
//!
//! Records are owned by per-module arenas (`Vec<CompareRecord>` /
//! `Vec<I2sRecord>`) and referenced by newtype index, not by pointer (§9,
//! "Back-pointers from bitmap to record" / "Cyclic relations") -- dropping a
//! `Module` drops its arenas in one move.

use parking_lot::RwLock;

use crate::coverage_code::CoverageCode;
use crate::decode::CompareCategory;
use crate::types::{FastHashMap, FastHashSet};
use crate::unwind::UnwindTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompareRecordId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct I2sRecordId(pub u32);

/// What a bitmap slot (or, for I2S, a hit slot) is owned by. §9's "tagged
/// variant" redesign hint: the hooks below pattern-match on this instead of
/// overriding a base hook per instrumentation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    Block(u32),
    Compare(CompareRecordId),
    I2S(I2sRecordId),
}

/// Per-`CMP`/`SUB` compare-coverage bookkeeping (§3, "Compare Record").
#[derive(Debug, Clone)]
pub struct CompareRecord {
    pub block_offset: u32,
    pub cmp_offset: u32,
    pub width_bits: u16,
    pub match_width: u8,
    /// Module-relative offset of the first byte of the wrapper.
    pub wrapper_offset: u64,
    /// Module-relative offset of the mutable `imm8` match-width byte.
    pub match_width_patch_offset: u64,
    pub wrapper_size: u64,
    pub bitmap_slot: u64,
    pub ignored: bool,
}

impl CompareRecord {
    pub fn coverage_code(&self) -> CoverageCode {
        CoverageCode::compare(self.block_offset, self.cmp_offset, self.match_width)
    }
}

/// Per-compare input-to-state bookkeeping (§3, "I2S Record").
#[derive(Debug, Clone)]
pub struct I2sRecord {
    pub block_offset: u32,
    pub cmp_offset: u32,
    pub category: CompareCategory,
    pub operand_len_bytes: u8,
    pub wrapper_offset: u64,
    pub wrapper_size: u64,
    /// Offsets into the I2S scratch buffer (§3, "I2S Scratch").
    pub hit_slot: u64,
    pub op0_slot: u64,
    pub op1_slot: u64,
    pub flags_slot: u64,
    pub enabled: bool,
    pub ignored: bool,
    pub last_hit: Option<I2SData>,
}

/// One drained input-to-state observation (§4.3, "Collection").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2SData {
    pub block_offset: u32,
    pub cmp_offset: u32,
    pub category: CompareCategory,
    pub op0: Vec<u8>,
    pub op1: Vec<u8>,
    pub flags_raw: u64,
    pub branch_taken: bool,
}

/// Everything the core tracks about one loaded module (§3, "Module").
pub struct Module {
    pub name: String,
    pub min_address: u64,
    next_bitmap_slot: u64,

    /// Keyed by coverage code, not raw block offset, so edge mode's
    /// (predecessor, destination) identity is preserved (§4.1): two distinct
    /// edges converging on the same destination block are distinct entries.
    code_to_bitmap_slot: FastHashMap<u64, u64>,
    bitmap_slot_to_code: FastHashMap<u64, CoverageCode>,
    code_to_instrumentation_offset: FastHashMap<u64, u64>,
    bitmap_slot_to_wrapper: FastHashMap<u64, Wrapper>,
    code_to_wrapper: FastHashMap<u64, Wrapper>,

    compare_code_to_record: FastHashMap<u64, CompareRecordId>,
    compare_records: Vec<CompareRecord>,

    compare_offset_to_record: FastHashMap<(u32, u32), CompareRecordId>,

    i2s_hit_slot_to_record: FastHashMap<u64, I2sRecordId>,
    i2s_offset_to_record: FastHashMap<(u32, u32), I2sRecordId>,
    i2s_records: Vec<I2sRecord>,
    next_i2s_scratch_offset: u64,

    /// Offset of the previously-instrumented block, for edge coverage (§3,
    /// "Edge code").
    pub last_block_offset: Option<u32>,

    pub unwind: UnwindTable,

    /// Block/edge codes known to have fired, maintained in parallel with the
    /// bitmap so `HasNewCoverage`/`GetCoverage` don't need a full bitmap scan.
    known_codes: FastHashSet<CoverageCode>,
}

impl Module {
    pub fn new(name: String, min_address: u64) -> Self {
        Module {
            name,
            min_address,
            next_bitmap_slot: 0,
            code_to_bitmap_slot: FastHashMap::default(),
            bitmap_slot_to_code: FastHashMap::default(),
            code_to_instrumentation_offset: FastHashMap::default(),
            bitmap_slot_to_wrapper: FastHashMap::default(),
            code_to_wrapper: FastHashMap::default(),
            compare_code_to_record: FastHashMap::default(),
            compare_records: Vec::new(),
            compare_offset_to_record: FastHashMap::default(),
            i2s_hit_slot_to_record: FastHashMap::default(),
            i2s_offset_to_record: FastHashMap::default(),
            i2s_records: Vec::new(),
            next_i2s_scratch_offset: 0,
            last_block_offset: None,
            unwind: UnwindTable::new(),
            known_codes: FastHashSet::default(),
        }
    }

    pub fn allocate_bitmap_slot(&mut self) -> u64 {
        let slot = self.next_bitmap_slot;
        self.next_bitmap_slot += 1;
        slot
    }

    pub fn bitmap_len(&self) -> u64 {
        self.next_bitmap_slot
    }

    pub fn register_block(&mut self, block_offset: u32, slot: u64, code: CoverageCode, instrumentation_offset: u64) {
        self.code_to_bitmap_slot.insert(code.raw(), slot);
        self.bitmap_slot_to_code.insert(slot, code);
        self.code_to_instrumentation_offset
            .insert(code.raw(), instrumentation_offset);
        self.bitmap_slot_to_wrapper
            .insert(slot, Wrapper::Block(block_offset));
        self.code_to_wrapper.insert(code.raw(), Wrapper::Block(block_offset));
    }

    /// Looks up the owning wrapper for any coverage code (§4.5,
    /// `IgnoreCoverage`'s dispatch), regardless of shape.
    pub fn wrapper_for_code(&self, code: CoverageCode) -> Option<Wrapper> {
        self.code_to_wrapper.get(&code.raw()).copied()
    }

    /// Looks up a block/edge recorder's slot by its already-computed
    /// coverage code (§4.1). Edge mode's code is `(prev, block_offset)`, so
    /// two distinct predecessors of the same block never collide here.
    pub fn block_bitmap_slot(&self, code: CoverageCode) -> Option<u64> {
        self.code_to_bitmap_slot.get(&code.raw()).copied()
    }

    pub fn instrumentation_offset_for(&self, code: CoverageCode) -> Option<u64> {
        self.code_to_instrumentation_offset.get(&code.raw()).copied()
    }

    pub fn code_for_bitmap_slot(&self, slot: u64) -> Option<CoverageCode> {
        self.bitmap_slot_to_code.get(&slot).copied()
    }

    pub fn wrapper_for_bitmap_slot(&self, slot: u64) -> Option<Wrapper> {
        self.bitmap_slot_to_wrapper.get(&slot).copied()
    }

    /// Generalization of [`Module::register_block`] for coverage events
    /// whose bitmap slot isn't keyed by a single block offset (edge codes).
    /// Block-shaped codes should still prefer `register_block` so
    /// `block_bitmap_slot` stays populated for `IgnoreCoverage`.
    pub fn register_wrapper(&mut self, code: CoverageCode, slot: u64, instrumentation_offset: u64, wrapper: Wrapper) {
        self.bitmap_slot_to_code.insert(slot, code);
        self.code_to_instrumentation_offset
            .insert(code.raw(), instrumentation_offset);
        self.bitmap_slot_to_wrapper.insert(slot, wrapper);
        self.code_to_wrapper.insert(code.raw(), wrapper);
    }

    pub fn mark_known(&mut self, code: CoverageCode) -> bool {
        self.known_codes.insert(code)
    }

    pub fn known_codes(&self) -> impl Iterator<Item = &CoverageCode> {
        self.known_codes.iter()
    }

    pub fn forget_known(&mut self, code: CoverageCode) {
        self.known_codes.remove(&code);
    }

    // -- Compare records -----------------------------------------------

    /// Bitmap slots owned by block/edge recorders (never compare/I2S), the
    /// set `EnableFullCoverage`'s reset pass (§2.2) operates over.
    pub fn block_bitmap_slots(&self) -> Vec<u64> {
        self.bitmap_slot_to_wrapper
            .iter()
            .filter(|(_, w)| matches!(w, Wrapper::Block(_)))
            .map(|(slot, _)| *slot)
            .collect()
    }

    pub fn find_i2s_record_for(&self, block_offset: u32, cmp_offset: u32) -> Option<I2sRecordId> {
        self.i2s_offset_to_record.get(&(block_offset, cmp_offset)).copied()
    }

    pub fn find_compare_record_for(&self, block_offset: u32, cmp_offset: u32) -> Option<CompareRecordId> {
        self.compare_offset_to_record.get(&(block_offset, cmp_offset)).copied()
    }

    pub fn insert_compare_record(&mut self, record: CompareRecord, slot: u64) -> CompareRecordId {
        let id = CompareRecordId(self.compare_records.len() as u32);
        let code = record.coverage_code();
        let block_offset = record.block_offset;
        let cmp_offset = record.cmp_offset;
        self.compare_records.push(record);
        self.compare_code_to_record.insert(code.raw(), id);
        self.compare_offset_to_record.insert((block_offset, cmp_offset), id);
        self.bitmap_slot_to_code.insert(slot, code);
        self.bitmap_slot_to_wrapper.insert(slot, Wrapper::Compare(id));
        self.code_to_wrapper.insert(code.raw(), Wrapper::Compare(id));
        self.code_to_instrumentation_offset
            .insert(code.raw(), self.compare_records[id.0 as usize].wrapper_offset);
        id
    }

    pub fn compare_record(&self, id: CompareRecordId) -> &CompareRecord {
        &self.compare_records[id.0 as usize]
    }

    pub fn compare_record_mut(&mut self, id: CompareRecordId) -> &mut CompareRecord {
        &mut self.compare_records[id.0 as usize]
    }

    pub fn compare_record_for_code(&self, code: CoverageCode) -> Option<CompareRecordId> {
        self.compare_code_to_record.get(&code.raw()).copied()
    }

    /// Re-keys the compare-code index after a match-width raise (§4.2,
    /// "Raising the threshold") so future hits at the new width resolve.
    pub fn rekey_compare_record(&mut self, id: CompareRecordId, old_code: CoverageCode, new_code: CoverageCode) {
        self.compare_code_to_record.remove(&old_code.raw());
        self.compare_code_to_record.insert(new_code.raw(), id);
        self.code_to_wrapper.remove(&old_code.raw());
        self.code_to_wrapper.insert(new_code.raw(), Wrapper::Compare(id));
    }

    pub fn compare_records(&self) -> &[CompareRecord] {
        &self.compare_records
    }

    // -- I2S records ------------------------------------------------------

    /// Assigns the next `len`-byte slot in the per-module I2S scratch buffer
    /// (§3, "I2S Scratch"), returning its module-relative offset.
    pub fn allocate_i2s_scratch(&mut self, len: u64) -> u64 {
        let offset = self.next_i2s_scratch_offset;
        self.next_i2s_scratch_offset += len;
        offset
    }

    pub fn i2s_scratch_len(&self) -> u64 {
        self.next_i2s_scratch_offset
    }

    pub fn insert_i2s_record(&mut self, record: I2sRecord) -> I2sRecordId {
        let id = I2sRecordId(self.i2s_records.len() as u32);
        self.i2s_hit_slot_to_record.insert(record.hit_slot, id);
        self.i2s_offset_to_record
            .insert((record.block_offset, record.cmp_offset), id);
        self.i2s_records.push(record);
        id
    }

    pub fn i2s_record(&self, id: I2sRecordId) -> &I2sRecord {
        &self.i2s_records[id.0 as usize]
    }

    pub fn i2s_record_mut(&mut self, id: I2sRecordId) -> &mut I2sRecord {
        &mut self.i2s_records[id.0 as usize]
    }

    pub fn i2s_records(&self) -> &[I2sRecord] {
        &self.i2s_records
    }

    pub fn i2s_records_mut(&mut self) -> &mut [I2sRecord] {
        &mut self.i2s_records
    }

    pub fn i2s_record_for_hit_slot(&self, slot: u64) -> Option<I2sRecordId> {
        self.i2s_hit_slot_to_record.get(&slot).copied()
    }
}

/// All currently-instrumented modules, guarded by a single lock (§5, ambient
/// "Registry locking": the host is single-threaded per §5, but a multi-target
/// embedder can share one `Registry` across worker threads without this
/// crate re-architecting).
#[derive(Default)]
pub struct Registry {
    modules: RwLock<FastHashMap<String, Module>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            modules: RwLock::new(FastHashMap::default()),
        }
    }

    pub fn insert(&self, module: Module) {
        self.modules.write().insert(module.name.clone(), module);
    }

    pub fn remove(&self, name: &str) -> Option<Module> {
        self.modules.write().remove(name)
    }

    pub fn with_module<R>(&self, name: &str, f: impl FnOnce(&Module) -> R) -> Option<R> {
        self.modules.read().get(name).map(f)
    }

    pub fn with_module_mut<R>(&self, name: &str, f: impl FnOnce(&mut Module) -> R) -> Option<R> {
        self.modules.write().get_mut(name).map(f)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_destruction_drops_its_arenas() {
        let registry = Registry::new();
        let mut module = Module::new("a.out".to_string(), 0x1000);
        let slot = module.allocate_bitmap_slot();
        module.register_block(0x10, slot, CoverageCode::block(0x10), 0x2000);
        registry.insert(module);
        assert!(registry.contains("a.out"));

        let removed = registry.remove("a.out").unwrap();
        assert_eq!(removed.compare_records().len(), 0);
        assert!(!registry.contains("a.out"));
    }

    #[test]
    fn block_registration_round_trips_through_bitmap_slot() {
        let mut module = Module::new("a.out".to_string(), 0);
        let slot = module.allocate_bitmap_slot();
        let code = CoverageCode::block(0x40);
        module.register_block(0x40, slot, code, 0x500);
        assert_eq!(module.block_bitmap_slot(code), Some(slot));
        assert_eq!(module.code_for_bitmap_slot(slot), Some(code));
        assert_eq!(module.instrumentation_offset_for(code), Some(0x500));
        assert!(matches!(module.wrapper_for_bitmap_slot(slot), Some(Wrapper::Block(0x40))));
    }
}
