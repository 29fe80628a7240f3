//! Step programs known to the engine

pub mod image_analysis;

use std::sync::Arc;

pub use image_analysis::ImageAnalysisStep;

use crate::workflow::{StepCommand, StepContext, StepRegistry, WorkflowStep};

/// Registry with all built-in steps
pub fn default_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register(
        image_analysis::PROGRAM,
        |command: &StepCommand, context: &StepContext| {
            let step = ImageAnalysisStep::from_command(command, context)?;
            Ok(Arc::new(step) as Arc<dyn WorkflowStep>)
        },
    );
    registry
}
