use crate::cache::SOURCES_DIR;
use crate::config::ROOT_ENV;
use crate::executor::identity::Identity;
use crate::executor::log::TranscriptLog;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where the stage's build root sits from the process's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootFs {
    /// Build root is a directory of the host filesystem.
    Host { build_root: PathBuf },
    /// The process has chrooted into `original`; the build root is `/`.
    Confined { original: PathBuf },
}

/// Everything a command needs besides its own text.
///
/// Built once per stage. Only the confinement transition and preamble
/// assignments mutate it; per-command fields are derived at spawn time.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    env: BTreeMap<String, String>,
    root: RootFs,
    identity: Identity,
    shell: String,
    log: Option<TranscriptLog>,
}

impl ExecutionContext {
    /// A context rooted at `build_root`.
    ///
    /// With `inherit_env` the environment starts as a copy of this process's;
    /// otherwise it starts empty.
    pub fn new(
        build_root: impl Into<PathBuf>,
        identity: Identity,
        shell: impl Into<String>,
        inherit_env: bool,
    ) -> Self {
        let build_root = build_root.into();
        let mut env = BTreeMap::new();
        if inherit_env {
            for (key, value) in std::env::vars_os() {
                if let (Ok(key), Ok(value)) = (key.into_string(), value.into_string()) {
                    env.insert(key, value);
                }
            }
        }
        env.insert(ROOT_ENV.to_string(), build_root.display().to_string());
        Self {
            env,
            root: RootFs::Host { build_root },
            identity,
            shell: shell.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: TranscriptLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Apply preamble assignments in order.
    ///
    /// `{arch}` expands to the host architecture. A variable that already has
    /// a value gets the new one colon-appended, so search paths accumulate.
    pub fn apply_preamble(&mut self, preamble: &[(String, String)]) {
        for (key, value) in preamble {
            let value = value.replace("{arch}", std::env::consts::ARCH);
            let merged = match self.env.get(key) {
                Some(existing) if !existing.is_empty() => format!("{existing}:{value}"),
                _ => value,
            };
            self.env.insert(key.clone(), merged);
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn log(&self) -> Option<&TranscriptLog> {
        self.log.as_ref()
    }

    pub fn root(&self) -> &RootFs {
        &self.root
    }

    pub fn is_confined(&self) -> bool {
        matches!(self.root, RootFs::Confined { .. })
    }

    /// The chroot path commands run under, if any.
    pub fn root_override(&self) -> Option<&Path> {
        match &self.root {
            RootFs::Host { .. } => None,
            RootFs::Confined { original } => Some(original),
        }
    }

    /// Build root as addressed by commands and by this process.
    pub fn build_root(&self) -> &Path {
        match &self.root {
            RootFs::Host { build_root } => build_root,
            RootFs::Confined { .. } => Path::new("/"),
        }
    }

    /// Resolve a build-root-relative path.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.build_root().join(relative)
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.resolve(SOURCES_DIR)
    }

    /// Record that the process now lives inside the build root.
    pub fn mark_confined(&mut self) {
        if let RootFs::Host { build_root } = &self.root {
            self.root = RootFs::Confined {
                original: build_root.clone(),
            };
        }
        self.env.insert(ROOT_ENV.to_string(), "/".to_string());
    }
}
