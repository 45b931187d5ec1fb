//! Probe pipeline execution: templating, body capture, probe families and
//! the per-leg executor.

pub mod body;
pub mod executor;
pub mod family;
pub mod template;

pub use executor::{DEFAULT_BODY_BUDGET_BYTES, LegResult, PipelineExecutor};
pub use family::{Acceptance, ProbeFamily, StepExecution, family_for};
pub use template::{PriorResults, StepResponse};
