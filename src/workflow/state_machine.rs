//! Sequential driver of a workflow's steps
//!
//! The machine prepares one step at a time. A step is only prepared after
//! the outputs the previous step promised were verified, and the first
//! failure during preparation aborts the whole workflow.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::descriptor::StepCommand;
use super::jobs::StepJobs;
use super::step::{check_required_inputs, missing_paths, StepContext, StepRegistry, WorkflowStep};
use super::submission::{JobSubmitter, StepOutcome};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Preparing,
    Running,
    Terminated,
    Aborted,
    Stopped,
}

impl WorkflowState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::Aborted | Self::Stopped)
    }
}

/// Result of advancing past a completed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The next step was prepared and its jobs can be submitted
    Continue,
    /// All steps completed, or the machine was stopped
    Terminated,
    /// Preparing the next step failed
    Aborted,
}

/// A step whose jobs were created
pub struct PreparedStep {
    pub index: usize,
    pub step: Arc<dyn WorkflowStep>,
    pub jobs: StepJobs,
    pub expected_outputs: Vec<PathBuf>,
}

impl std::fmt::Debug for PreparedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStep")
            .field("index", &self.index)
            .field("step", &self.step.name())
            .field("jobs", &self.jobs.run.len())
            .field("expected_outputs", &self.expected_outputs)
            .finish()
    }
}

pub struct WorkflowStateMachine {
    commands: Vec<StepCommand>,
    registry: Arc<StepRegistry>,
    context: StepContext,
    submitter: Arc<dyn JobSubmitter>,
    state: WorkflowState,
    tasks: Vec<PreparedStep>,
    outcomes: Vec<StepOutcome>,
    stop: Arc<AtomicBool>,
    exit_code: i32,
    last_error: Option<String>,
}

impl WorkflowStateMachine {
    pub fn new(
        commands: Vec<StepCommand>,
        registry: Arc<StepRegistry>,
        context: StepContext,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Self {
        Self {
            commands,
            registry,
            context,
            submitter,
            state: WorkflowState::Preparing,
            tasks: Vec::new(),
            outcomes: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            exit_code: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Steps prepared so far, in workflow order
    pub fn tasks(&self) -> &[PreparedStep] {
        &self.tasks
    }

    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Flag that halts the machine at its next transition
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Prepares the first step.
    pub async fn start(&mut self) -> Advance {
        if self.commands.is_empty() {
            return self.finish(WorkflowState::Terminated, 0, None);
        }
        self.prepare_and_track(0).await
    }

    /// Moves past step `done_index`, which completed.
    pub async fn advance(&mut self, done_index: usize) -> Advance {
        if self.is_stopped() {
            info!("Workflow stopped after step {}", done_index + 1);
            return self.finish(WorkflowState::Stopped, 0, None);
        }
        if let Err(e) = self.verify_outputs(done_index) {
            return self.abort(e);
        }
        let next = done_index + 1;
        if next >= self.commands.len() {
            info!("Workflow completed all {} steps", self.commands.len());
            return self.finish(WorkflowState::Terminated, 0, None);
        }
        self.prepare_and_track(next).await
    }

    /// Drives the workflow to a final state, submitting each prepared step.
    pub async fn run(&mut self) -> Result<WorkflowState> {
        let mut advance = self.start().await;
        while advance == Advance::Continue {
            let Some(prepared) = self.tasks.last() else {
                break;
            };
            let index = prepared.index;
            let step = Arc::clone(&prepared.step);
            let jobs = prepared.jobs.clone();
            self.state = WorkflowState::Running;
            info!("Submitting step {} ({})", index + 1, step.name());
            let outcome = match self.submitter.submit(step, jobs).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.abort(e);
                    break;
                }
            };
            if !outcome.succeeded() {
                warn!(
                    "Step {} finished with {} failed jobs",
                    outcome.step,
                    outcome.failed_jobs().count()
                );
            }
            self.outcomes.push(outcome);
            advance = self.advance(index).await;
        }
        Ok(self.state)
    }

    fn verify_outputs(&self, done_index: usize) -> Result<()> {
        let Some(prepared) = self.tasks.iter().find(|t| t.index == done_index) else {
            return Ok(());
        };
        let missing = missing_paths(&prepared.expected_outputs);
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::next_step(format!(
            "Step \"{}\" did not produce its outputs: {}",
            prepared.step.name(),
            missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    async fn prepare_and_track(&mut self, index: usize) -> Advance {
        self.state = WorkflowState::Preparing;
        match self.prepare(index).await {
            Ok(prepared) => {
                info!(
                    "Prepared step {} ({}) with {} jobs",
                    index + 1,
                    prepared.step.name(),
                    prepared.jobs.run.len()
                );
                self.tasks.push(prepared);
                Advance::Continue
            }
            Err(e) => self.abort(e),
        }
    }

    async fn prepare(&self, index: usize) -> Result<PreparedStep> {
        let command = &self.commands[index];
        info!("Preparing step {}: {}", index + 1, command);
        let step = self.registry.create(command, &self.context)?;
        check_required_inputs(step.as_ref())?;
        let jobs = step.create_jobs(step.batch_size()).await?;
        Ok(PreparedStep {
            index,
            expected_outputs: step.expected_outputs(),
            step,
            jobs,
        })
    }

    fn abort(&mut self, e: Error) -> Advance {
        error!("Workflow aborted: {}", e);
        let state = if self.is_stopped() {
            WorkflowState::Stopped
        } else {
            WorkflowState::Aborted
        };
        self.finish(state, 1, Some(e.to_string()));
        Advance::Aborted
    }

    fn finish(&mut self, state: WorkflowState, exit_code: i32, error: Option<String>) -> Advance {
        self.state = state;
        self.exit_code = exit_code;
        self.last_error = error;
        Advance::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BackendFactory, NativeModules};
    use crate::image::InMemoryImageReader;
    use crate::storage::InMemoryExperimentStore;
    use crate::workflow::jobs::{CollectJob, ResourceRequest, RunJob};
    use crate::workflow::step::JobRunner;
    use crate::workflow::submission::LocalSubmitter;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    /// Requires `--requires` and writes `--creates` when collected
    struct TouchStep {
        requires: Option<PathBuf>,
        creates: Option<PathBuf>,
    }

    #[async_trait]
    impl JobRunner for TouchStep {
        async fn run_job(&self, _job: &RunJob) -> Result<()> {
            Ok(())
        }

        async fn collect(&self, _job: &CollectJob) -> Result<()> {
            if let Some(path) = &self.creates {
                tokio::fs::write(path, "done").await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkflowStep for TouchStep {
        fn name(&self) -> &str {
            "touch"
        }

        fn required_inputs(&self) -> Vec<PathBuf> {
            self.requires.iter().cloned().collect()
        }

        fn expected_outputs(&self) -> Vec<PathBuf> {
            self.creates.iter().cloned().collect()
        }

        fn batch_size(&self) -> usize {
            1
        }

        async fn create_jobs(&self, _batch_size: usize) -> Result<StepJobs> {
            Ok(StepJobs {
                step: self.name().to_string(),
                run: Vec::new(),
                collect: Some(CollectJob {
                    resources: ResourceRequest::default(),
                }),
            })
        }
    }

    fn machine(dir: &Path, lines: &[&str]) -> WorkflowStateMachine {
        let mut registry = StepRegistry::new();
        registry.register("touch", |command: &StepCommand, _: &StepContext| {
            Ok(Arc::new(TouchStep {
                requires: command.option("requires").map(PathBuf::from),
                creates: command.option("creates").map(PathBuf::from),
            }) as Arc<dyn WorkflowStep>)
        });
        let variables = HashMap::from([(
            "experiment_dir".to_string(),
            dir.display().to_string(),
        )]);
        let commands = lines
            .iter()
            .map(|line| StepCommand::parse(line, &variables).unwrap())
            .collect();
        let context = StepContext {
            experiment_dir: dir.to_path_buf(),
            store: Arc::new(InMemoryExperimentStore::new()),
            images: Arc::new(InMemoryImageReader::new()),
            backends: BackendFactory::native(NativeModules::new()),
            resources: ResourceRequest::default(),
            lock_dir: dir.join("locks"),
        };
        WorkflowStateMachine::new(
            commands,
            Arc::new(registry),
            context,
            Arc::new(LocalSubmitter::new(2)),
        )
    }

    #[tokio::test]
    async fn test_workflow_runs_steps_in_order() {
        let dir = TempDir::new().unwrap();
        let mut machine = machine(
            dir.path(),
            &[
                "touch --creates {experiment_dir}/a",
                "touch --requires {experiment_dir}/a --creates {experiment_dir}/b",
            ],
        );
        let state = machine.run().await.unwrap();
        assert_eq!(state, WorkflowState::Terminated);
        assert_eq!(machine.exit_code(), 0);
        assert_eq!(machine.tasks().len(), 2);
        assert!(dir.path().join("b").exists());
    }

    #[tokio::test]
    async fn test_missing_required_input_aborts() {
        let dir = TempDir::new().unwrap();
        let mut machine = machine(
            dir.path(),
            &[
                "touch --creates {experiment_dir}/a",
                "touch --requires {experiment_dir}/other",
            ],
        );
        assert_eq!(machine.start().await, Advance::Continue);
        tokio::fs::write(dir.path().join("a"), "done").await.unwrap();
        assert_eq!(machine.advance(0).await, Advance::Aborted);
        assert_eq!(machine.state(), WorkflowState::Aborted);
        assert_eq!(machine.exit_code(), 1);
        assert_eq!(machine.tasks().len(), 1);
        assert!(machine.last_error().unwrap().contains("other"));
    }

    #[tokio::test]
    async fn test_missing_expected_output_aborts() {
        let dir = TempDir::new().unwrap();
        let mut machine = machine(
            dir.path(),
            &["touch --creates {experiment_dir}/a", "touch"],
        );
        assert_eq!(machine.start().await, Advance::Continue);
        // the step's collect never ran
        assert_eq!(machine.advance(0).await, Advance::Aborted);
        assert_eq!(machine.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_halts_at_next_transition() {
        let dir = TempDir::new().unwrap();
        let mut machine = machine(dir.path(), &["touch", "touch"]);
        assert_eq!(machine.start().await, Advance::Continue);
        machine.stop();
        assert_eq!(machine.advance(0).await, Advance::Terminated);
        assert_eq!(machine.state(), WorkflowState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_step_aborts_before_submission() {
        let dir = TempDir::new().unwrap();
        let mut machine = machine(dir.path(), &["unknown-step"]);
        let state = machine.run().await.unwrap();
        assert_eq!(state, WorkflowState::Aborted);
        assert!(machine.outcomes().is_empty());
    }
}
