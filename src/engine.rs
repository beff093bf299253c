//! `Engine`: wires `Config`, the [`crate::registry::Registry`], and the
//! three instrumenters together, and exposes the fuzzer-facing API from §6.

use log::{debug, warn};

use crate::bitmap::{Bitmap, CoverageSet, RemoteBuffer};
use crate::block_coverage::BlockCoverageInstrumenter;
use crate::compare_coverage::CompareCoverageInstrumenter;
use crate::config::Config;
use crate::coverage_code::CoverageCode;
use crate::decode::{Decoder, Instruction};
use crate::i2s::I2SInstrumenter;
use crate::registry::{Module, Registry, Wrapper};
use crate::translator::Translator;
use crate::types::FastHashMap;
use crate::unwind::macho::locate_unwind_info_section;

/// Per-module remote memory this engine needs in addition to the
/// instrumented code buffer: the coverage bitmap and the I2S scratch, both
/// owned by the host with a remote alias in the target (§5, "Resource
/// ownership").
struct ModuleMemory {
    bitmap: Bitmap,
    scratch: RemoteBuffer,
}

pub struct Engine {
    config: Config,
    registry: Registry,
    memory: FastHashMap<String, ModuleMemory>,
    block_instrumenter: BlockCoverageInstrumenter,
    compare_instrumenter: CompareCoverageInstrumenter,
    i2s_instrumenter: I2SInstrumenter,
    full_coverage: bool,
    input_to_state_enabled: bool,
    saved_coverage: CoverageSet,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let block_instrumenter = BlockCoverageInstrumenter::new(config.coverage_type);
        Engine {
            config,
            registry: Registry::new(),
            memory: FastHashMap::default(),
            block_instrumenter,
            compare_instrumenter: CompareCoverageInstrumenter::new(),
            i2s_instrumenter: I2SInstrumenter::new(),
            full_coverage: false,
            input_to_state_enabled: false,
            saved_coverage: CoverageSet::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Hooks consumed from the translator (§6) ---------------------------

    /// `OnModuleInstrumented`: creates the module's registry entry, snapshots
    /// its unwind info (best-effort -- a module lacking `__unwind_info` just
    /// never produces unwind metadata, logged at `warn!`, never fatal), and
    /// allocates its coverage bitmap/I2S scratch remote-memory handles.
    pub fn on_module_instrumented(
        &mut self,
        module_name: &str,
        min_address: u64,
        module_image: &[u8],
        bitmap_remote_address: u64,
        scratch_remote_address: u64,
    ) {
        let mut module = Module::new(module_name.to_string(), min_address);
        match locate_unwind_info_section(module_image) {
            Ok(section) => {
                if let Err(err) = module.unwind.load(&section) {
                    warn!("module {module_name}: failed to parse __unwind_info: {err}");
                }
            }
            Err(err) => {
                debug!("module {module_name}: no __unwind_info section ({err}), unwind metadata will be empty");
            }
        }
        self.registry.insert(module);
        self.memory.insert(
            module_name.to_string(),
            ModuleMemory {
                bitmap: Bitmap::new(bitmap_remote_address),
                scratch: RemoteBuffer::new(scratch_remote_address),
            },
        );
    }

    /// `OnModuleUninstrumented`: drops the module's arena and remote-memory
    /// handles in one move (§2.2, "Per-module coverage code namespacing").
    pub fn on_module_uninstrumented(&mut self, module_name: &str) {
        self.registry.remove(module_name);
        self.memory.remove(module_name);
    }

    /// `OnModuleEntered`/`OnProcessExit`: no per-module state outlives a
    /// process per §5 ("Cancellation"); these are logging points only.
    pub fn on_module_entered(&self, module_name: &str) {
        debug!("module {module_name} entered");
    }

    pub fn on_process_exit(&mut self) {
        debug!("target process exited; dropping all per-module state");
        self.registry = Registry::new();
        self.memory.clear();
    }

    /// `OnException`: resolves a bitmap write exception (§7, "not an error")
    /// by marking the touched slot and growing the host mirror if needed, and
    /// records the owning coverage code as known so `GetCoverage`/
    /// `HasNewCoverage` see it without a full bitmap scan. Returns whether
    /// this was newly-covered.
    pub fn on_exception(&mut self, module_name: &str, faulting_slot: u64) -> bool {
        let newly_covered = self
            .memory
            .get_mut(module_name)
            .map(|mem| mem.bitmap.mark(faulting_slot))
            .unwrap_or(false);
        if newly_covered {
            self.registry.with_module_mut(module_name, |module| {
                if let Some(code) = module.code_for_bitmap_slot(faulting_slot) {
                    module.mark_known(code);
                }
            });
        }
        newly_covered
    }

    /// Mirrors raw bytes read from the target's I2S scratch region into the
    /// host buffer (§3, "I2S Scratch"). Unlike the coverage bitmap, scratch
    /// writes aren't exception-driven, so the embedder is responsible for
    /// reading the target's live memory at `scratch_remote_address` and
    /// forwarding it here before calling [`Engine::get_i2s_data`].
    pub fn sync_i2s_scratch(&mut self, module_name: &str, bytes: &[u8]) {
        if let Some(mem) = self.memory.get_mut(module_name) {
            mem.scratch.write(0, bytes);
        }
    }

    /// `InstrumentBasicBlock`/`InstrumentEdge`: emits the block/edge
    /// recorder and observes the block-start instruction for the unwind
    /// transcoder.
    pub fn instrument_basic_block(
        &mut self,
        module_name: &str,
        translator: &mut dyn Translator,
        block_offset: u32,
    ) {
        let bitmap_base = match self.memory.get(module_name) {
            Some(mem) => mem.bitmap.remote_address(),
            None => return,
        };
        self.registry.with_module_mut(module_name, |module| {
            let translated_addr = translator.current_instrumented_address();
            module.unwind.observe(block_offset, translated_addr);
            let slot = self
                .block_instrumenter
                .instrument_block(module, translator, bitmap_base, block_offset);
            if let Some(mem) = self.memory.get_mut(module_name) {
                mem.bitmap.ensure_slot(slot);
            }
        });
    }

    /// `InstrumentInstruction(before)`: dispatches to compare-coverage
    /// (emitted before the original instruction) and I2S (emitted after),
    /// and always observes the instruction for the unwind transcoder.
    pub fn instrument_instruction(
        &mut self,
        module_name: &str,
        translator: &mut dyn Translator,
        decoder: &dyn Decoder,
        instr: &Instruction,
        block_offset: u32,
        cmp_offset: u32,
        before: bool,
    ) {
        let translated_addr = translator.current_instrumented_address();
        self.registry.with_module_mut(module_name, |module| {
            module.unwind.observe(block_offset + cmp_offset, translated_addr);
        });

        if before && self.config.compare_coverage {
            self.try_instrument_compare(module_name, translator, decoder, instr, block_offset, cmp_offset);
        }
        if !before && self.config.input_to_state {
            self.try_instrument_i2s(module_name, translator, decoder, instr, block_offset, cmp_offset);
        }
    }

    fn try_instrument_compare(
        &mut self,
        module_name: &str,
        translator: &mut dyn Translator,
        decoder: &dyn Decoder,
        instr: &Instruction,
        block_offset: u32,
        cmp_offset: u32,
    ) {
        let bitmap_base = match self.memory.get(module_name) {
            Some(mem) => mem.bitmap.remote_address(),
            None => return,
        };
        let compare_instrumenter = &self.compare_instrumenter;
        self.registry.with_module_mut(module_name, |module| {
            match compare_instrumenter.check_eligibility(module, decoder, instr, block_offset, cmp_offset) {
                Ok(_category) => {
                    let id = compare_instrumenter.instrument(
                        module,
                        translator,
                        bitmap_base,
                        instr,
                        block_offset,
                        cmp_offset,
                    );
                    let slot = module.compare_record(id).bitmap_slot;
                    if let Some(mem) = self.memory.get_mut(module_name) {
                        mem.bitmap.ensure_slot(slot);
                    }
                }
                Err(reason) => {
                    log::trace!("compare at {block_offset:#x}+{cmp_offset:#x} declined: {reason:?}");
                }
            }
        });
    }

    fn try_instrument_i2s(
        &mut self,
        module_name: &str,
        translator: &mut dyn Translator,
        decoder: &dyn Decoder,
        instr: &Instruction,
        block_offset: u32,
        cmp_offset: u32,
    ) {
        let scratch_base = match self.memory.get(module_name) {
            Some(mem) => mem.scratch.remote_address(),
            None => return,
        };
        let compare_instrumenter = &self.compare_instrumenter;
        let i2s_instrumenter = &self.i2s_instrumenter;
        self.registry.with_module_mut(module_name, |module| {
            if module.find_i2s_record_for(block_offset, cmp_offset).is_some() {
                return;
            }
            match compare_instrumenter.check_eligibility(module, decoder, instr, block_offset, cmp_offset) {
                Ok(category) => {
                    i2s_instrumenter.instrument(
                        module,
                        translator,
                        scratch_base,
                        instr,
                        category,
                        block_offset,
                        cmp_offset,
                    );
                    if let Some(mem) = self.memory.get_mut(module_name) {
                        mem.scratch.ensure_len(module.i2s_scratch_len());
                    }
                }
                Err(reason) => {
                    log::trace!("i2s at {block_offset:#x}+{cmp_offset:#x} declined: {reason:?}");
                }
            }
        });
    }

    // -- Fuzzer-facing API (§6) --------------------------------------------

    pub fn get_coverage(&mut self, clear: bool) -> CoverageSet {
        let mut result = CoverageSet::new();
        for name in self.registry.module_names() {
            self.registry.with_module(&name, |module| {
                for &code in module.known_codes() {
                    result.insert(&name, code);
                }
            });
        }
        if clear {
            self.clear_coverage();
        }
        result
    }

    pub fn clear_coverage(&mut self) {
        for mem in self.memory.values_mut() {
            mem.bitmap.clear_all();
        }
    }

    pub fn enable_full_coverage(&mut self) {
        self.full_coverage = true;
    }

    pub fn disable_full_coverage(&mut self) {
        self.full_coverage = false;
    }

    /// Resets only the bitmap bytes for already-known block/edge codes
    /// (§2.2), leaving compare/I2S-owned bytes untouched; a no-op unless
    /// `EnableFullCoverage` is active.
    pub fn reset_non_sticky_bytes(&mut self) {
        if !self.full_coverage {
            return;
        }
        for name in self.registry.module_names() {
            let slots = self
                .registry
                .with_module(&name, |module| module.block_bitmap_slots())
                .unwrap_or_default();
            if let Some(mem) = self.memory.get_mut(&name) {
                mem.bitmap.reset_slots(slots);
            }
        }
    }

    /// `IgnoreCoverage` (§4.5): retires the backing instrumentation for each
    /// coverage code, dispatching on the wrapper kind it owns.
    pub fn ignore_coverage(&mut self, codes: &CoverageSet, translator: &mut dyn Translator) {
        for module_name in codes.modules().map(str::to_string).collect::<Vec<_>>() {
            let Some(code_set) = codes.codes(&module_name) else {
                continue;
            };
            for &code in code_set {
                self.ignore_one(&module_name, code, translator);
            }
        }
    }

    fn ignore_one(&mut self, module_name: &str, code: CoverageCode, translator: &mut dyn Translator) {
        let wrapper = self
            .registry
            .with_module(module_name, |module| module.wrapper_for_code(code))
            .flatten();

        match wrapper {
            Some(Wrapper::Block(_)) => {
                let offset = self
                    .registry
                    .with_module(module_name, |m| m.instrumentation_offset_for(code))
                    .flatten();
                if let Some(offset) = offset {
                    self.block_instrumenter.clear_recorder(translator, offset);
                }
            }
            Some(Wrapper::Compare(id)) => {
                let compare_instrumenter = &self.compare_instrumenter;
                self.registry.with_module_mut(module_name, |module| {
                    compare_instrumenter.raise_or_retire(module, translator, id);
                });
            }
            Some(Wrapper::I2S(id)) => {
                let i2s_instrumenter = &self.i2s_instrumenter;
                self.registry.with_module_mut(module_name, |module| {
                    i2s_instrumenter.disable(module, translator, id);
                });
            }
            None => {
                warn!("ignore_coverage: no owning record for code {code:?} in module {module_name}");
            }
        }
    }

    pub fn has_new_coverage(&self) -> bool {
        for name in self.registry.module_names() {
            let has_new = self
                .registry
                .with_module(&name, |module| {
                    module.known_codes().any(|code| {
                        !self
                            .saved_coverage
                            .contains(&name, *code)
                    })
                })
                .unwrap_or(false);
            if has_new {
                return true;
            }
        }
        false
    }

    pub fn enable_input_to_state(&mut self, translator: &mut dyn Translator) {
        self.input_to_state_enabled = true;
        for name in self.registry.module_names() {
            let i2s_instrumenter = &self.i2s_instrumenter;
            self.registry.with_module_mut(&name, |module| {
                let ids: Vec<_> = (0..module.i2s_records().len() as u32)
                    .map(crate::registry::I2sRecordId)
                    .collect();
                for id in ids {
                    i2s_instrumenter.enable(module, translator, id);
                }
            });
        }
    }

    pub fn disable_input_to_state(&mut self, translator: &mut dyn Translator) {
        self.input_to_state_enabled = false;
        for name in self.registry.module_names() {
            let i2s_instrumenter = &self.i2s_instrumenter;
            self.registry.with_module_mut(&name, |module| {
                let ids: Vec<_> = (0..module.i2s_records().len() as u32)
                    .map(crate::registry::I2sRecordId)
                    .collect();
                for id in ids {
                    i2s_instrumenter.disable(module, translator, id);
                }
            });
        }
    }

    /// `GetI2SData`: drains every record's hit slot, optionally clearing it.
    pub fn get_i2s_data(&mut self, clear: bool) -> Vec<crate::registry::I2SData> {
        let mut out = Vec::new();
        for name in self.registry.module_names() {
            let Some(mem) = self.memory.get(&name) else {
                continue;
            };
            let scratch = mem.scratch.clone();
            let i2s_instrumenter = &self.i2s_instrumenter;
            self.registry.with_module_mut(&name, |module| {
                let ids: Vec<_> = (0..module.i2s_records().len() as u32)
                    .map(crate::registry::I2sRecordId)
                    .collect();
                for id in ids {
                    let hit = i2s_instrumenter.collect(module, id, &|offset, len| scratch.read(offset, len));
                    if hit {
                        if let Some(data) = module.i2s_record(id).last_hit.clone() {
                            out.push(data);
                        }
                    }
                }
            });
            if clear {
                if let Some(mem) = self.memory.get_mut(&name) {
                    self.registry.with_module(&name, |module| {
                        for record in module.i2s_records() {
                            mem_clear_hit(mem, record.hit_slot);
                        }
                    });
                }
            }
        }
        out
    }
}

fn mem_clear_hit(mem: &mut ModuleMemory, hit_slot: u64) {
    mem.scratch.clear(hit_slot, 4);
}
