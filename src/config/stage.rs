//! Stage documents and the modules they declare.

use crate::config::package::RawPackageFields;
use crate::config::{parse_document, parse_relative_path, read_document, OrderedMap, Scalar};
use crate::config::PackageSpec;
use crate::error::BuildError;
use crate::module::Phase;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which user, and which filesystem root, a stage's commands run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// The invoking user, with the host environment.
    HostUser,
    /// The dedicated unprivileged build user, with a clean environment.
    BuildUser,
    /// Root on the host, with the host environment.
    Root,
    /// Root inside the build root, entered through an irreversible chroot.
    Chroot,
}

impl IdentityPolicy {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "default" | "host" => Some(Self::HostUser),
            "wander" | "build" => Some(Self::BuildUser),
            "root" => Some(Self::Root),
            "chroot" => Some(Self::Chroot),
            _ => None,
        }
    }

    /// Whether the stage starts from a copy of the process environment.
    pub fn inherits_environment(self) -> bool {
        matches!(self, Self::HostUser | Self::Root)
    }
}

/// What a stage does with its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Drive every element through the module phase sequence.
    Build,
    /// Seed the cache and the build root with every element's archive.
    Download,
}

/// An archive unpacked into a subfolder of its parent module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubArchive {
    pub name: String,
    pub package: PackageSpec,
    pub folder: PathBuf,
}

/// One buildable unit and its recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub description: String,
    pub package: Option<PackageSpec>,
    pub sub_archives: Vec<SubArchive>,
    /// Subfolder of the extracted tree the build commands run in.
    pub folder: Option<PathBuf>,
    /// Patch file, looked up in the build root's `sources` directory.
    pub patch: Option<String>,
    pub commands: BTreeMap<Phase, Vec<String>>,
    pub skip: bool,
    /// Accepted groups of validation output.
    pub results: Option<Vec<Vec<String>>>,
}

impl ModuleSpec {
    /// Status-line label.
    pub fn label(&self) -> String {
        match &self.package {
            Some(package) => package.label(),
            None => self.description.clone(),
        }
    }

    pub fn commands_for(&self, phase: Phase) -> Option<&[String]> {
        self.commands.get(&phase).map(Vec::as_slice)
    }
}

/// A fully validated stage document.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: String,
    /// Header shown when the stage starts.
    pub title: String,
    pub kind: StageKind,
    pub identity: IdentityPolicy,
    pub shell: Option<String>,
    pub init: Vec<String>,
    pub cleanup: Vec<String>,
    /// Environment assignments, in document order.
    pub preamble: Vec<(String, String)>,
    pub elements: Vec<ModuleSpec>,
    pub document: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    name: Option<String>,
    description: Option<String>,
    kind: Option<StageKind>,
    user: Option<String>,
    shell: Option<String>,
    init: Option<Vec<String>>,
    cleanup: Option<Vec<String>>,
    preamble: Option<OrderedMap<Scalar>>,
    elements: Option<OrderedMap<RawElement>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawElement {
    description: Option<String>,
    version: Option<Scalar>,
    file: Option<String>,
    url: Option<String>,
    extension: Option<String>,
    md5: Option<String>,
    sha256: Option<String>,
    folder: Option<String>,
    patch: Option<String>,
    modules: Option<OrderedMap<RawElement>>,
    commands: Option<BTreeMap<Phase, Vec<String>>>,
    skip: Option<bool>,
    result: Option<Vec<ResultGroup>>,
}

/// One accepted-output group; a bare string is a group of one.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ResultGroup {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl RawElement {
    fn package_fields(&self) -> RawPackageFields {
        RawPackageFields {
            description: self.description.clone(),
            version: self.version.clone(),
            file: self.file.clone(),
            url: self.url.clone(),
            extension: self.extension.clone(),
            md5: self.md5.clone(),
            sha256: self.sha256.clone(),
        }
    }

    fn description(&self, document: &Path, name: &str) -> Result<String, BuildError> {
        self.description.clone().ok_or_else(|| {
            BuildError::config(
                document,
                format!("element '{name}' is missing required key 'description'"),
            )
        })
    }

    fn into_module(self, document: &Path, name: &str) -> Result<ModuleSpec, BuildError> {
        let description = self.description(document, name)?;
        let fields = self.package_fields();
        let package = if fields.declares_package() {
            Some(fields.validate(document, name, &description)?)
        } else {
            None
        };

        let mut sub_archives = Vec::new();
        for (sub_name, sub) in self.modules.unwrap_or_default().0 {
            let qualified = format!("{name}.{sub_name}");
            let sub_description = sub
                .description
                .clone()
                .unwrap_or_else(|| sub_name.clone());
            let package = sub
                .package_fields()
                .validate(document, &qualified, &sub_description)?;
            let folder = sub.folder.as_deref().ok_or_else(|| {
                BuildError::config(
                    document,
                    format!("sub-archive '{qualified}' is missing required key 'folder'"),
                )
            })?;
            let folder = parse_relative_path(document, folder, &format!("{qualified}.folder"))?;
            sub_archives.push(SubArchive {
                name: sub_name,
                package,
                folder,
            });
        }
        if package.is_none() && !sub_archives.is_empty() {
            return Err(BuildError::config(
                document,
                format!("element '{name}' declares sub-archives but no archive of its own"),
            ));
        }

        let folder = self
            .folder
            .as_deref()
            .map(|raw| parse_relative_path(document, raw, &format!("{name}.folder")))
            .transpose()?;
        if let Some(patch) = &self.patch {
            parse_relative_path(document, patch, &format!("{name}.patch"))?;
        }

        let commands = self.commands.unwrap_or_default();
        if let Some(phase) = commands.keys().find(|phase| !phase.accepts_commands()) {
            return Err(BuildError::config(
                document,
                format!(
                    "element '{name}': phase '{}' does not take commands",
                    phase.name()
                ),
            ));
        }

        let results = self.result.map(|groups| {
            groups
                .into_iter()
                .map(|group| match group {
                    ResultGroup::One(value) => vec![value.to_string()],
                    ResultGroup::Many(values) => {
                        values.iter().map(ToString::to_string).collect()
                    }
                })
                .collect()
        });

        Ok(ModuleSpec {
            name: name.to_string(),
            description,
            package,
            sub_archives,
            folder,
            patch: self.patch,
            commands,
            skip: self.skip.unwrap_or(false),
            results,
        })
    }
}

impl StageDefinition {
    /// Load and validate a stage document.
    pub fn load(document: &Path) -> Result<Self, BuildError> {
        let raw: RawStage = read_document(document)?;
        Self::validate(document, raw)
    }

    /// Parse a stage document from text; `document` selects the format and names errors.
    pub fn parse(document: &Path, text: &str) -> Result<Self, BuildError> {
        let raw: RawStage = parse_document(document, text)?;
        Self::validate(document, raw)
    }

    fn validate(document: &Path, raw: RawStage) -> Result<Self, BuildError> {
        let name = raw.name.clone().unwrap_or_else(|| {
            document
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("stage")
                .to_string()
        });
        let kind = raw.kind.unwrap_or(StageKind::Build);

        let identity = match (&raw.user, kind) {
            (Some(token), _) => IdentityPolicy::parse(token).ok_or_else(|| {
                BuildError::config(
                    document,
                    format!(
                        "unsupported user '{token}' (expected 'default', 'wander', 'root' or 'chroot')"
                    ),
                )
            })?,
            (None, StageKind::Download) => IdentityPolicy::HostUser,
            (None, StageKind::Build) => {
                return Err(BuildError::config(document, "missing required key 'user'"))
            }
        };

        let raw_elements = raw
            .elements
            .ok_or_else(|| BuildError::config(document, "missing required key 'elements'"))?;

        let mut elements = Vec::with_capacity(raw_elements.0.len());
        for (element_name, element) in raw_elements.0 {
            let module = element.into_module(document, &element_name)?;
            if kind == StageKind::Download && module.package.is_none() {
                return Err(BuildError::config(
                    document,
                    format!("download element '{element_name}' declares no archive"),
                ));
            }
            elements.push(module);
        }

        let preamble = raw
            .preamble
            .unwrap_or_default()
            .0
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();

        let title = raw
            .description
            .unwrap_or_else(|| format!("Running stage {name}..."));

        Ok(Self {
            name,
            title,
            kind,
            identity,
            shell: raw.shell,
            init: raw.init.unwrap_or_default(),
            cleanup: raw.cleanup.unwrap_or_default(),
            preamble,
            elements,
            document: document.to_path_buf(),
        })
    }
}
