//! Build pipeline engine for assembling a Linux distribution from source.
//!
//! A pipeline is an ordered list of stages. Each stage drives its modules
//! (one source package and its recipe each) through a fixed phase
//! sequence, inside progressively more isolated build roots: the host,
//! a temporary toolchain owned by an unprivileged build user, then a chroot.
//!
//! - **Configuration** - stage and pipeline documents validated into typed specs
//! - **Download cache** - fetch, verify and promote archives into build roots
//! - **Executor** - shell commands under a stage's identity, root and environment
//! - **Modules and stages** - the phase state machine and its aggregation
//!
//! # Architecture
//!
//! ```text
//! pipeline ── continue-or-abort policy, exit codes
//!     │
//!     └── stage ── identity, init, chroot, cleanup
//!             │
//!             └── module ── extract → patch → ... → validate → cleanup
//!                     │
//!                     ├── executor  (CommandRunner)
//!                     ├── cache     (DownloadCache, Fetcher)
//!                     └── archive   (contained extraction)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use wander::cache::DownloadCache;
//! use wander::config::{BuildConfig, PipelineDefinition};
//! use wander::executor::{Chroot, ShellExecutor};
//! use wander::pipeline::{self, TerminalPrompt};
//! use wander::stage::StageRunner;
//! use wander::status::Console;
//!
//! let config = BuildConfig::from_env()?;
//! let definition = PipelineDefinition::load("wander.yaml".as_ref())?;
//! let cache = DownloadCache::http(&config.cache_dir);
//! let (mut shell, mut chroot, mut console) = (ShellExecutor, Chroot, Console);
//! let mut stages = StageRunner::new(&config, &mut shell, &cache, &mut chroot, &mut console);
//! let outcome = pipeline::run(&definition, &mut stages, &mut TerminalPrompt)?;
//! std::process::exit(outcome.exit_code());
//! ```

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod module;
pub mod pipeline;
pub mod preflight;
pub mod stage;
pub mod status;

#[cfg(test)]
mod testing;

pub use config::BuildConfig;
pub use error::{BuildError, CommandError};
