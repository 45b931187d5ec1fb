//! Domain model shared by the executor, coordinator, diff engine and stores.

pub mod event;
pub mod invocation;
pub mod outcome;
pub mod pipeline;
pub mod session;

pub use event::{DatacenterRef, TransitionEvent, TransitionState};
pub use invocation::{InvocationContext, InvocationPayload, Principal, Trigger};
pub use outcome::{ProbeOutcome, StepRecord};
pub use pipeline::{AcceptanceCriteria, DatacenterSelection, PipelineConfig, Scheduling, Step};
pub use session::{Session, SessionSuccession};

pub use probe_agent::ProbeKind;

pub type PipelineId = i64;
pub type ProjectId = i64;
pub type DatacenterId = i64;
