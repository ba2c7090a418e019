//! Runs a pipeline's stages in order and applies the continue-or-abort policy.

use crate::config::{PipelineDefinition, StageDefinition};
use crate::error::BuildError;
use crate::stage::StageRunner;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

/// Asks whether to carry on after a stage failed.
pub trait Prompt {
    fn continue_after(&mut self, stage: &str) -> bool;
}

/// Interactive yes/no on stdin. Empty input means yes, end of input means no.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn continue_after(&mut self, _stage: &str) -> bool {
        print!("Do you want to continue anyway? [Yn] ");
        let _ = io::stdout().flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => accepts(&answer),
        }
    }
}

fn accepts(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "" | "y" | "yes"
    )
}

/// Always continues.
#[derive(Debug, Default)]
pub struct AssumeYes;

impl Prompt for AssumeYes {
    fn continue_after(&mut self, _stage: &str) -> bool {
        true
    }
}

/// Always aborts.
#[derive(Debug, Default)]
pub struct AssumeNo;

impl Prompt for AssumeNo {
    fn continue_after(&mut self, _stage: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every stage ran; the operator accepted any failures.
    Completed { failed_stages: Vec<String> },
    /// The operator declined to continue after `stage` failed.
    Aborted { stage: String, exit_code: i32 },
}

impl PipelineOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Completed { .. } => 0,
            PipelineOutcome::Aborted { exit_code, .. } => *exit_code,
        }
    }
}

/// Run every stage of `pipeline` in order.
///
/// Each stage document is loaded just before it runs, so a malformed
/// document is reported only after the stages preceding it have finished.
pub fn run(
    pipeline: &PipelineDefinition,
    stages: &mut StageRunner<'_>,
    prompt: &mut dyn Prompt,
) -> Result<PipelineOutcome, BuildError> {
    let mut failed_stages = Vec::new();
    for entry in &pipeline.stages {
        let definition = StageDefinition::load(&entry.document)?;
        let report = stages.run(&definition);
        if report.passed {
            continue;
        }
        warn!(
            "stage {} failed ({} module(s): {})",
            entry.name,
            report.failed_modules.len(),
            report.failed_modules.join(", ")
        );
        if !prompt.continue_after(&entry.name) {
            info!("aborting after stage {}", entry.name);
            return Ok(PipelineOutcome::Aborted {
                stage: entry.name.clone(),
                exit_code: entry.exit_code,
            });
        }
        failed_stages.push(entry.name.clone());
    }
    Ok(PipelineOutcome::Completed { failed_stages })
}
