//! Build configuration and document loading.
//!
//! Stage and pipeline documents are read once, deserialized into loose raw
//! structs, then validated into the typed schema:
//!
//! - [`package`] - [`PackageSpec`] with `{version}` templating
//! - [`stage`] - [`ModuleSpec`], [`StageDefinition`], [`IdentityPolicy`]
//! - [`pipeline`] - [`PipelineDefinition`]
//!
//! Documents may be YAML (`.yaml`/`.yml`) or TOML (`.toml`).

pub mod package;
pub mod pipeline;
pub mod stage;

pub use package::PackageSpec;
pub use pipeline::{PipelineDefinition, StageEntry};
pub use stage::{IdentityPolicy, ModuleSpec, StageDefinition, StageKind, SubArchive};

use crate::error::BuildError;
use anyhow::{bail, Context, Result};
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::env;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};

/// Environment variable naming the root of the build tree.
pub const ROOT_ENV: &str = "WANDER";

/// Environment variable overriding the shared download cache location.
pub const CACHE_ENV: &str = "WANDER_CACHE";

/// Process-level settings shared by every stage of a run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root of the filesystem tree being assembled.
    pub build_root: PathBuf,
    /// Shared, content-addressed download cache.
    pub cache_dir: PathBuf,
    /// Transcript root; one subdirectory per stage.
    pub log_dir: PathBuf,
    /// Shell used to interpret command lines.
    pub shell: String,
    /// Login name of the dedicated unprivileged build user.
    pub build_user: String,
}

impl BuildConfig {
    /// Create a configuration with default cache, log, shell and user settings.
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let cache_dir = env::var_os(CACHE_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("wander/sources")))
            .unwrap_or_else(|| cwd.join("sources"));
        Self {
            build_root: build_root.into(),
            cache_dir,
            log_dir: cwd.join("logs"),
            shell: "/bin/sh".to_string(),
            build_user: "wander".to_string(),
        }
    }

    /// Create a configuration whose build root comes from `$WANDER`.
    pub fn from_env() -> Result<Self> {
        let root = env::var_os(ROOT_ENV).with_context(|| {
            format!("{ROOT_ENV} is not set; it must name the root of the build tree")
        })?;
        let root = PathBuf::from(root);
        if root.as_os_str().is_empty() {
            bail!("{ROOT_ENV} is set but empty");
        }
        Ok(Self::new(root))
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_build_user(mut self, user: impl Into<String>) -> Self {
        self.build_user = user.into();
        self
    }
}

/// Parse a document from text, choosing the format by file extension.
pub(crate) fn parse_document<T: DeserializeOwned>(
    document: &Path,
    text: &str,
) -> Result<T, BuildError> {
    let extension = document
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(text)
            .map_err(|err| BuildError::config(document, err.to_string())),
        "toml" => {
            toml::from_str(text).map_err(|err| BuildError::config(document, err.to_string()))
        }
        other => Err(BuildError::config(
            document,
            format!("unsupported document format '.{other}' (expected .yaml, .yml or .toml)"),
        )),
    }
}

/// Read and parse a document from disk.
pub(crate) fn read_document<T: DeserializeOwned>(document: &Path) -> Result<T, BuildError> {
    let text = std::fs::read_to_string(document).map_err(|err| BuildError::io(document, err))?;
    parse_document(document, &text)
}

/// Reject absolute paths and `..` components in document-supplied paths.
pub(crate) fn parse_relative_path(
    document: &Path,
    raw: &str,
    field: &str,
) -> Result<PathBuf, BuildError> {
    let candidate = Path::new(raw);
    if raw.trim().is_empty() {
        return Err(BuildError::config(document, format!("{field} must not be empty")));
    }
    if candidate.is_absolute() {
        return Err(BuildError::config(
            document,
            format!("{field} must be relative, got absolute path '{raw}'"),
        ));
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return Err(BuildError::config(
                document,
                format!("{field} contains invalid traversal/root component in '{raw}'"),
            ));
        }
    }
    Ok(candidate.to_path_buf())
}

/// A scalar document value. Versions such as `2.42` arrive as numbers in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(text) => f.write_str(text),
            Scalar::Integer(value) => write!(f, "{value}"),
            Scalar::Float(value) => write!(f, "{value}"),
            Scalar::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// A mapping that keeps the order its keys were written in.
///
/// Stage elements run in document order, so a sorted or hashed map would
/// silently reorder the build.
#[derive(Debug, Clone)]
pub(crate) struct OrderedMap<T>(pub(crate) Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    if entries.iter().any(|(existing, _)| *existing == key) {
                        return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}
