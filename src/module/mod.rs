//! The per-package phase state machine.
//!
//! A module walks [`Phase::FETCH`] (when it fetches its own archives) and
//! then [`Phase::BUILD`] in order. Phases with nothing to do are skipped
//! silently. The first failing phase ends the run; nothing after it,
//! including `cleanup`, is attempted.

pub mod phase;

pub use phase::Phase;

use crate::archive;
use crate::cache::{Artifact, CacheLock, DownloadCache};
use crate::config::{ModuleSpec, PackageSpec};
use crate::error::BuildError;
use crate::executor::{run_all, CommandOutput, CommandRunner, ExecutionContext, Invocation};
use crate::status::{Reporter, Status};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where a module is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Pending,
    Running(Phase),
    Passed,
    Skipped,
    Failed(Phase),
}

impl ModuleState {
    /// Passed and skipped both count as success.
    pub fn succeeded(self) -> bool {
        matches!(self, ModuleState::Passed | ModuleState::Skipped)
    }
}

/// Collaborators a module borrows for one run.
pub struct Session<'a> {
    pub ctx: &'a ExecutionContext,
    pub runner: &'a mut dyn CommandRunner,
    pub cache: &'a DownloadCache,
    pub reporter: &'a mut dyn Reporter,
}

/// One module being driven through its phases.
pub struct Module<'a> {
    spec: &'a ModuleSpec,
    state: ModuleState,
    locks: Vec<CacheLock>,
}

impl<'a> Module<'a> {
    pub fn new(spec: &'a ModuleSpec) -> Self {
        Self {
            spec,
            state: ModuleState::Pending,
            locks: Vec::new(),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Directory the main archive is extracted into: `sources/<stem>.d`.
    pub fn target_dir(&self, ctx: &ExecutionContext) -> Option<PathBuf> {
        self.spec
            .package
            .as_ref()
            .map(|package| ctx.sources_dir().join(format!("{}.d", package.stem())))
    }

    /// Whether this module downloads and promotes its own archives.
    ///
    /// A confined stage cannot reach the shared cache, so it relies on
    /// archives seeded before the root switch.
    pub fn fetches(&self, ctx: &ExecutionContext) -> bool {
        !ctx.is_confined()
            && self
                .spec
                .package
                .as_ref()
                .is_some_and(|package| package.url.is_some())
    }

    /// Drive every phase in order and return the terminal state.
    pub fn run(&mut self, session: &mut Session<'_>) -> ModuleState {
        let label = self.spec.label();
        if self.spec.skip {
            self.state = ModuleState::Skipped;
            session.reporter.status(Status::Skipped, &label);
            return self.state;
        }

        let fetch: &[Phase] = if self.fetches(session.ctx) {
            &Phase::FETCH
        } else {
            &[]
        };
        for &phase in fetch.iter().chain(Phase::BUILD.iter()) {
            if !self.has_work(phase, session.ctx) {
                continue;
            }
            self.state = ModuleState::Running(phase);
            session.reporter.status(phase.status(), &label);
            if let Err(err) = self.run_phase(phase, session) {
                warn!("{} failed at {}: {err}", self.spec.name, phase);
                self.locks.clear();
                self.state = ModuleState::Failed(phase);
                session.reporter.status(Status::Failed, &label);
                return self.state;
            }
        }

        info!("{} passed", self.spec.name);
        self.state = ModuleState::Passed;
        session.reporter.status(Status::Passed, &label);
        self.state
    }

    fn has_work(&self, phase: Phase, ctx: &ExecutionContext) -> bool {
        let has_commands = self
            .spec
            .commands_for(phase)
            .is_some_and(|commands| !commands.is_empty());
        match phase {
            Phase::Download | Phase::Checksum | Phase::Copy => true,
            Phase::Extract => self.spec.package.is_some() || has_commands,
            Phase::Patch => self.spec.patch.is_some() || has_commands,
            Phase::Cleanup => has_commands || self.target_dir(ctx).is_some(),
            _ => has_commands,
        }
    }

    fn run_phase(&mut self, phase: Phase, session: &mut Session<'_>) -> Result<(), BuildError> {
        match phase {
            Phase::Download => {
                for artifact in self.artifacts(session) {
                    self.locks.push(
                        session
                            .cache
                            .lock(&artifact)
                            .map_err(|err| BuildError::io(&artifact.cache_path, to_io(err)))?,
                    );
                    session.cache.try_scan(&artifact)?;
                    session.cache.try_download(&artifact)?;
                }
                Ok(())
            }
            Phase::Checksum => {
                for artifact in self.artifacts(session) {
                    session.cache.try_checksum(&artifact)?;
                }
                Ok(())
            }
            Phase::Copy => {
                for artifact in self.artifacts(session) {
                    session.cache.try_copy(&artifact)?;
                }
                self.locks.clear();
                Ok(())
            }
            Phase::Extract => {
                self.extract(session.ctx)?;
                self.run_commands(phase, session).map(drop)
            }
            Phase::Patch => {
                if let Some(patch) = &self.spec.patch {
                    let dir = self.work_dir(session.ctx)?;
                    let file = session.ctx.sources_dir().join(patch);
                    let command = format!("patch -Np1 -i {}", shell_quote(&file));
                    session.runner.run(
                        session.ctx,
                        &Invocation::new(&command)
                            .in_dir(&dir)
                            .logged_as(&self.spec.name, phase.name()),
                    )?;
                }
                self.run_commands(phase, session).map(drop)
            }
            Phase::Validate => {
                let output = self.run_commands(phase, session)?;
                self.check_result(output.as_ref())
            }
            Phase::Cleanup => {
                let result = self.run_commands(phase, session).map(drop);
                if let Some(target) = self.target_dir(session.ctx) {
                    if target.exists() {
                        if let Err(err) = fs::remove_dir_all(&target) {
                            warn!("cannot remove {}: {err}", target.display());
                        }
                    }
                }
                result
            }
            _ => self.run_commands(phase, session).map(drop),
        }
    }

    /// One artifact per distinct file name. Each is locked for the whole
    /// fetch, and a second lock on the same file would wait on the first.
    fn artifacts(&self, session: &Session<'_>) -> Vec<Artifact> {
        let mut seen = HashSet::new();
        self.packages()
            .filter(|package| seen.insert(package.file_name()))
            .map(|package| session.cache.artifact(package, session.ctx.build_root()))
            .collect()
    }

    fn packages(&self) -> impl Iterator<Item = &PackageSpec> {
        self.spec
            .package
            .iter()
            .chain(self.spec.sub_archives.iter().map(|sub| &sub.package))
    }

    /// Unpack the main archive, then each sub-archive into its folder.
    fn extract(&self, ctx: &ExecutionContext) -> Result<(), BuildError> {
        let (Some(package), Some(target)) = (&self.spec.package, self.target_dir(ctx)) else {
            return Ok(());
        };
        let sources = ctx.sources_dir();
        archive::extract(&sources.join(package.file_name()), &target)?;
        for sub in &self.spec.sub_archives {
            let dest = target.join(&sub.folder);
            debug!("extracting {} into {}", sub.name, dest.display());
            archive::extract(&sources.join(sub.package.file_name()), &dest)?;
        }
        Ok(())
    }

    /// Directory build commands run in.
    ///
    /// With an archive this is the extracted tree (plus `folder`), which must
    /// already exist. Without one it is the build root (plus `folder`).
    fn work_dir(&self, ctx: &ExecutionContext) -> Result<PathBuf, BuildError> {
        let dir = match self.target_dir(ctx) {
            Some(target) => {
                if !target.is_dir() {
                    return Err(BuildError::MissingDirectory { path: target });
                }
                join_folder(&target, self.spec.folder.as_deref())
            }
            None => join_folder(ctx.build_root(), self.spec.folder.as_deref()),
        };
        fs::create_dir_all(&dir).map_err(|err| BuildError::io(&dir, err))?;
        Ok(dir)
    }

    fn run_commands(
        &self,
        phase: Phase,
        session: &mut Session<'_>,
    ) -> Result<Option<CommandOutput>, BuildError> {
        let Some(commands) = self.spec.commands_for(phase).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        let dir = self.work_dir(session.ctx)?;
        let template = Invocation::new("")
            .in_dir(&dir)
            .logged_as(&self.spec.name, phase.name());
        Ok(run_all(&mut *session.runner, session.ctx, commands, template)?)
    }

    fn check_result(&self, output: Option<&CommandOutput>) -> Result<(), BuildError> {
        let (Some(groups), Some(output)) = (&self.spec.results, output) else {
            return Ok(());
        };
        let actual = output.last_line();
        if groups.iter().flatten().any(|accepted| *accepted == actual) {
            return Ok(());
        }
        Err(BuildError::Validation {
            module: self.spec.name.clone(),
            actual,
        })
    }
}

fn join_folder(base: &Path, folder: Option<&Path>) -> PathBuf {
    match folder {
        Some(folder) => base.join(folder),
        None => base.to_path_buf(),
    }
}

/// Single-quote `path` for `sh`.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

fn to_io(err: anyhow::Error) -> std::io::Error {
    std::io::Error::other(format!("{err:#}"))
}
