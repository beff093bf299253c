//! Coverage bitmap, compare-coverage, and input-to-state instrumentation core
//! for a dynamic binary translator.
//!
//! This crate does not disassemble, encode, or execute anything on its own.
//! It describes *what* instrumentation to emit and *how* to interpret it at
//! runtime, and consumes two traits the embedding translator must implement:
//! [`decode::Decoder`] (disassembly + host-readable region access) and
//! [`translator::Translator`] (the write/commit surface for instrumented
//! code). Everything else -- the bitmap, the compare/I2S wrapper state
//! machines, the Mach-O unwind transcoder -- lives here.
//!
//! The entry point is [`engine::Engine`]. It owns a [`registry::Registry`] of
//! per-module state and exposes the fuzzer-facing API (`GetCoverage`,
//! `IgnoreCoverage`, `EnableInputToState`, ...) plus the hooks a translator
//! calls while rewriting code (`OnModuleInstrumented`, `InstrumentBasicBlock`,
//! `InstrumentInstruction`, ...).
//!
//! # Example
//!
//! ```no_run
//! use covtrace::config::Config;
//! use covtrace::engine::Engine;
//!
//! let config = Config::default();
//! let mut engine = Engine::new(config);
//! // engine.on_module_instrumented(...) as the translator loads each module,
//! // engine.instrument_basic_block(...) / instrument_instruction(...) while
//! // rewriting it, then engine.get_coverage(true) between fuzzer runs.
//! ```

pub mod bitmap;
pub mod block_coverage;
pub mod compare_coverage;
pub mod config;
pub mod coverage_code;
pub mod decode;
pub mod emit;
pub mod engine;
pub mod error;
pub mod i2s;
pub mod registry;
pub mod rflags;
pub mod translator;
pub mod types;
pub mod unwind;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
