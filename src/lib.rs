//! Augmentum: function instrumentation for ahead-of-time-compiled code.
//!
//! Augmentum turns selected functions of a lowered IR module into
//! *extension points*: named, typed, dynamically re-routable call sites.
//! A compile-time pass ([`rewrite`]) preserves each function's original
//! body, routes its public entry through a writable function-pointer slot,
//! and generates the reflective plumbing plus a load-time constructor that
//! registers the point. The runtime ([`runtime`], [`types`]) owns the
//! registry of points, their before/around/after advice chains, the
//! descriptor trees advice uses to reflect over argument and return
//! storage, and the evaluator that weaves everything together.
//!
//! The [`exec`] host loads transformed modules, binds the generated code's
//! external references to the runtime ABI, runs constructors, and executes
//! IR with real-memory argument cells, so advice observes the same raw
//! pointers a native build would hand it.
//!
//! Thread-safety contract: registration happens at load time; advice,
//! listener, and replacement mutation belongs to single-threaded
//! initialization and shutdown phases; concurrent *invocation* of
//! instrumented functions is fine while no mutation is in flight. See
//! [`runtime`] for details.

pub mod exec;
pub mod gate;
pub mod ir;
pub mod ir_parse;
pub mod rewrite;
pub mod runtime;
pub mod serialize;
pub mod stats;
pub mod types;

pub use exec::{Program, Value};
pub use gate::{AlwaysInstrument, InstrumentPredicate, TargetedInstrument};
pub use rewrite::{run_pass, PassConfig};
pub use runtime::{unique_advice_id, ExtensionPoint, Listener, Runtime};
pub use types::TypeDesc;

/// Instrument a set of modules and load the result.
///
/// Convenience for the common pipeline: run the pass over every module,
/// then hand the transformed set to [`Program::load`].
pub fn instrument_and_load(
    mut modules: Vec<ir::Module>,
    config: &PassConfig,
) -> Result<Program, exec::LoadError> {
    for module in &mut modules {
        rewrite::run_pass(module, config);
    }
    Program::load(modules)
}
