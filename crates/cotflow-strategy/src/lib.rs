//! Strategy registry for cotflow pipelines
//!
//! A pipeline is a numbered list of phases. Each phase declares a THINK
//! completion, an EXECUTE behaviour (pass-through or search fan-out) and an
//! INTEGRATE completion. Adapter rules describe how a phase's output is
//! renamed into the context of later phases, so adding a phase never touches
//! the state machine.

mod builtin;
mod model;
mod registry;

pub use model::{
    AdapterRule, AdapterSource, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, ExecuteBehavior, FanOut,
    PhaseStrategy, StepSpec,
};
pub use registry::{PipelineFile, StrategyRegistry};
