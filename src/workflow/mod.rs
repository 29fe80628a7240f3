//! Workflow orchestration
//!
//! A workflow is an ordered list of step command lines. The
//! [`WorkflowStateMachine`] prepares one step at a time through the
//! [`StepRegistry`], hands its jobs to a [`JobSubmitter`] and only moves on
//! once the step's promised outputs exist.

pub mod collect_lock;
pub mod descriptor;
pub mod jobs;
pub mod state_machine;
pub mod step;
pub mod submission;

pub use collect_lock::CollectLock;
pub use descriptor::{StepCommand, WorkflowDescriptor};
pub use jobs::{CollectJob, ResourceRequest, RunJob, StepJobs};
pub use state_machine::{Advance, PreparedStep, WorkflowState, WorkflowStateMachine};
pub use step::{check_required_inputs, JobRunner, StepContext, StepRegistry, WorkflowStep};
pub use submission::{JobStatus, JobSubmitter, LocalSubmitter, StepOutcome};
