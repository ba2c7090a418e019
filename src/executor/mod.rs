//! Command execution - runs shell command lines under a stage's identity.
//!
//! - [`context`] - [`ExecutionContext`]: environment, build root, identity, log sink
//! - [`identity`] - [`Identity`] resolution from `etc/passwd`
//! - [`confine`] - the one-way chroot transition
//! - [`log`] - per-command transcripts
//!
//! # Usage
//!
//! ```rust,ignore
//! use wander::executor::{CommandRunner, ExecutionContext, Identity, Invocation, ShellExecutor};
//!
//! let ctx = ExecutionContext::new("/mnt/wander", Identity::root(), "/bin/sh", true);
//! let out = ShellExecutor.run(&ctx, &Invocation::new("uname -m"))?;
//! println!("{}", out.last_line());
//! ```

pub mod confine;
pub mod context;
pub mod identity;
pub mod log;

pub use confine::{Chroot, Confinement};
pub use context::{ExecutionContext, RootFs};
pub use identity::{Identity, PasswdDb};
pub use log::TranscriptLog;

use crate::error::CommandError;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Where a command's transcript entry is filed.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptKey<'a> {
    pub module: &'a str,
    pub phase: &'a str,
}

/// One command line and the per-command fields around it.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub command: &'a str,
    pub working_dir: Option<&'a Path>,
    pub transcript: Option<TranscriptKey<'a>>,
}

impl<'a> Invocation<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            working_dir: None,
            transcript: None,
        }
    }

    pub fn in_dir(mut self, dir: &'a Path) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn logged_as(mut self, module: &'a str, phase: &'a str) -> Self {
        self.transcript = Some(TranscriptKey { module, phase });
        self
    }
}

/// Combined stdout and stderr of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Last line of the output with surrounding whitespace removed.
    pub fn last_line(&self) -> String {
        self.text()
            .trim()
            .lines()
            .last()
            .unwrap_or("")
            .trim()
            .to_string()
    }
}

/// Runs one command line to completion.
pub trait CommandRunner {
    fn run(
        &mut self,
        ctx: &ExecutionContext,
        invocation: &Invocation<'_>,
    ) -> Result<CommandOutput, CommandError>;
}

/// Run `commands` in order, stopping at the first failure.
///
/// Returns the output of the last command, or `None` for an empty list.
pub fn run_all(
    runner: &mut dyn CommandRunner,
    ctx: &ExecutionContext,
    commands: &[String],
    template: Invocation<'_>,
) -> Result<Option<CommandOutput>, CommandError> {
    let mut last = None;
    for command in commands {
        let invocation = Invocation {
            command: command.as_str(),
            ..template
        };
        last = Some(runner.run(ctx, &invocation)?);
    }
    Ok(last)
}

/// Spawns `<shell> -c <command>` with the context's environment and identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl CommandRunner for ShellExecutor {
    fn run(
        &mut self,
        ctx: &ExecutionContext,
        invocation: &Invocation<'_>,
    ) -> Result<CommandOutput, CommandError> {
        let identity = ctx.identity();
        debug!(
            command = invocation.command,
            user = %identity.name,
            dir = ?invocation.working_dir,
            "running"
        );

        let mut cmd = Command::new(ctx.shell());
        // Fold stderr into stdout so the transcript keeps their interleaving.
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", invocation.command))
            .env_clear()
            .envs(ctx.env())
            .env("HOME", &identity.home)
            .env("LOGNAME", &identity.name)
            .env("USER", &identity.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = invocation.working_dir {
            cmd.current_dir(dir).env("PWD", dir);
        }
        if identity.differs_from_process() {
            // std applies setgid before setuid in the child.
            cmd.gid(identity.gid).uid(identity.uid);
        }

        let result = match cmd.output() {
            Ok(out) => {
                let mut output = out.stdout;
                output.extend_from_slice(&out.stderr);
                if out.status.success() {
                    Ok(CommandOutput { output })
                } else if let Some(signal) = out.status.signal() {
                    Err(CommandError::Signal {
                        command: invocation.command.to_string(),
                        signal,
                        output,
                    })
                } else {
                    Err(CommandError::Status {
                        command: invocation.command.to_string(),
                        status: out.status.to_string(),
                        output,
                    })
                }
            }
            Err(source) => Err(CommandError::Spawn {
                shell: ctx.shell().to_string(),
                command: invocation.command.to_string(),
                source,
            }),
        };

        if let (Some(log), Some(key)) = (ctx.log(), invocation.transcript) {
            match &result {
                Ok(out) => log.append(key.module, key.phase, invocation.command, &out.output, None),
                Err(err) => log.append(
                    key.module,
                    key.phase,
                    invocation.command,
                    err.output(),
                    Some(&err.to_string()),
                ),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn host_ctx(root: &Path) -> ExecutionContext {
        let identity = Identity::current(&PasswdDb::host()).unwrap();
        ExecutionContext::new(root, identity, "/bin/sh", false)
    }

    #[test]
    fn captures_combined_output() {
        let temp = TempDir::new().unwrap();
        let ctx = host_ctx(temp.path());
        let out = ShellExecutor
            .run(&ctx, &Invocation::new("echo out; echo err >&2"))
            .unwrap();
        assert_eq!(out.text(), "out\nerr\n");
    }

    #[test]
    fn nonzero_exit_is_command_error() {
        let temp = TempDir::new().unwrap();
        let ctx = host_ctx(temp.path());
        let err = ShellExecutor
            .run(&ctx, &Invocation::new("echo broken; exit 3"))
            .unwrap_err();
        assert!(matches!(err, CommandError::Status { .. }));
        assert_eq!(err.output(), b"broken\n");
    }

    #[test]
    fn working_dir_sets_cwd_and_pwd() {
        let temp = TempDir::new().unwrap();
        let ctx = host_ctx(temp.path());
        let out = ShellExecutor
            .run(&ctx, &Invocation::new("pwd -P; echo $PWD").in_dir(temp.path()))
            .unwrap();
        let canonical = fs::canonicalize(temp.path()).unwrap();
        let text = out.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], canonical.display().to_string());
        assert_eq!(lines[1], temp.path().display().to_string());
    }

    #[test]
    fn environment_is_context_plus_identity() {
        let temp = TempDir::new().unwrap();
        let mut ctx = host_ctx(temp.path());
        ctx.set_var("LC_ALL", "POSIX");
        let out = ShellExecutor
            .run(&ctx, &Invocation::new("echo $LC_ALL $WANDER; test -n \"$HOME\""))
            .unwrap();
        assert_eq!(
            out.last_line(),
            format!("POSIX {}", temp.path().display())
        );
    }

    #[test]
    fn attached_log_receives_transcript() {
        let temp = TempDir::new().unwrap();
        let log = TranscriptLog::for_stage(&temp.path().join("logs"), "stage");
        let ctx = host_ctx(temp.path()).with_log(log.clone());
        ShellExecutor
            .run(&ctx, &Invocation::new("echo hi").logged_as("zlib", "compile"))
            .unwrap();
        let text = fs::read_to_string(log.path("zlib", "compile")).unwrap();
        assert!(text.contains("$ echo hi\nstdout:\thi\n"));
    }

    #[test]
    fn run_all_stops_at_first_failure() {
        let temp = TempDir::new().unwrap();
        let ctx = host_ctx(temp.path());
        let marker = temp.path().join("marker");
        let commands = vec![
            "true".to_string(),
            "false".to_string(),
            format!("touch {}", marker.display()),
        ];
        let result = run_all(&mut ShellExecutor, &ctx, &commands, Invocation::new(""));
        assert!(result.is_err());
        assert!(!marker.exists());
    }

    #[test]
    fn last_line_trims_whitespace() {
        let out = CommandOutput {
            output: b"building\n0\n  ".to_vec(),
        };
        assert_eq!(out.last_line(), "0");
    }
}
