//! Per-tick execution: one [`InstanceExecutor`] run fans out over targets,
//! each target walks its plan through the [`StepExecutor`], and results land
//! in the sink through the [`Publisher`].

use thiserror::Error;

use crate::fetch::FetchError;

pub mod instance;
pub mod publish;
pub mod step;

pub use instance::{InstanceExecutor, RunReport, Stagger, merge_inputs};
pub use publish::Publisher;
pub use step::{StepExecutor, StepOutcome};

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The instance was stopped while this target was running.
    #[error("execution cancelled")]
    Cancelled,

    #[error("step `{step_id}` failed: {source}")]
    Step {
        step_id: String,
        #[source]
        source: FetchError,
    },

    #[error("target panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}

/// Which instance and target a step runs for. Part of every cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionScope {
    pub instance_id: String,
    pub target_index: Option<usize>,
}

impl ExecutionScope {
    pub fn new(instance_id: impl Into<String>, target_index: Option<usize>) -> Self {
        Self {
            instance_id: instance_id.into(),
            target_index,
        }
    }

    pub fn target_suffix(&self) -> String {
        publish::target_suffix(self.target_index)
    }
}
