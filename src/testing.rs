//! Test doubles for the executor, fetcher, confinement and prompt seams.

use crate::cache::{Checksum, FetchError, Fetcher};
use crate::config::PackageSpec;
use crate::error::CommandError;
use crate::executor::confine::Confinement;
use crate::executor::{CommandOutput, CommandRunner, ExecutionContext, Identity, Invocation, PasswdDb};
use crate::pipeline::Prompt;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A context for `root` running as the current user with a clean environment.
pub(crate) fn test_ctx(root: &Path) -> ExecutionContext {
    let identity = Identity::current(&PasswdDb::host()).unwrap();
    ExecutionContext::new(root, identity, "/bin/sh", false)
}

/// A `<name>.tar.gz` package downloadable from a fake host.
pub(crate) fn package_for(name: &str, md5: &str) -> PackageSpec {
    PackageSpec {
        description: name.to_string(),
        version: None,
        file: name.to_string(),
        url: Some("https://example.test/src".to_string()),
        extension: ".tar.gz".to_string(),
        checksum: Checksum::md5(md5).unwrap(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedCommand {
    pub(crate) command: String,
    pub(crate) dir: Option<PathBuf>,
    pub(crate) root_override: Option<PathBuf>,
    pub(crate) module: Option<String>,
    pub(crate) phase: Option<String>,
}

/// Records every invocation instead of spawning it.
#[derive(Debug, Default)]
pub(crate) struct RecordingRunner {
    pub(crate) calls: Vec<RecordedCommand>,
    fail_on: Vec<String>,
    outputs: Vec<(String, String)>,
}

impl RecordingRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail any command containing `needle`.
    pub(crate) fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on.push(needle.to_string());
        self
    }

    /// Answer commands containing `needle` with `output`.
    pub(crate) fn with_output(mut self, needle: &str, output: &str) -> Self {
        self.outputs.push((needle.to_string(), output.to_string()));
        self
    }

    pub(crate) fn commands(&self) -> Vec<&str> {
        self.calls.iter().map(|c| c.command.as_str()).collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(
        &mut self,
        ctx: &ExecutionContext,
        invocation: &Invocation<'_>,
    ) -> Result<CommandOutput, CommandError> {
        let command = invocation.command.to_string();
        self.calls.push(RecordedCommand {
            command: command.clone(),
            dir: invocation.working_dir.map(Path::to_path_buf),
            root_override: ctx.root_override().map(Path::to_path_buf),
            module: invocation.transcript.map(|key| key.module.to_string()),
            phase: invocation.transcript.map(|key| key.phase.to_string()),
        });
        if self.fail_on.iter().any(|needle| command.contains(needle)) {
            return Err(CommandError::Status {
                command,
                status: "exit status: 1".to_string(),
                output: Vec::new(),
            });
        }
        let output = self
            .outputs
            .iter()
            .find(|(needle, _)| command.contains(needle))
            .map(|(_, output)| output.as_bytes().to_vec())
            .unwrap_or_default();
        Ok(CommandOutput { output })
    }
}

/// Serves fixed bytes (or fails) and counts requests.
#[derive(Debug, Clone)]
pub(crate) struct CountingFetcher {
    calls: Rc<Cell<usize>>,
    body: Option<Vec<u8>>,
}

impl CountingFetcher {
    pub(crate) fn serving(body: &[u8]) -> Self {
        Self {
            calls: Rc::new(Cell::new(0)),
            body: Some(body.to_vec()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            calls: Rc::new(Cell::new(0)),
            body: None,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.calls.get()
    }
}

impl Fetcher for CountingFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        self.calls.set(self.calls.get() + 1);
        match &self.body {
            Some(body) => Ok(fs::write(dest, body)?),
            None => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
        }
    }
}

/// Records root switches without calling chroot(2).
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingConfinement {
    pub(crate) entered: Rc<RefCell<Vec<PathBuf>>>,
}

impl Confinement for RecordingConfinement {
    fn enter(&mut self, root: &Path) -> anyhow::Result<()> {
        self.entered.borrow_mut().push(root.to_path_buf());
        Ok(())
    }
}

/// Answers continuation prompts from a script; runs out as "no".
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompt {
    answers: VecDeque<bool>,
    pub(crate) asked: Vec<String>,
}

impl ScriptedPrompt {
    pub(crate) fn answering(answers: &[bool]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn continue_after(&mut self, stage: &str) -> bool {
        self.asked.push(stage.to_string());
        self.answers.pop_front().unwrap_or(false)
    }
}
