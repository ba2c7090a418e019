//! Package declarations: where an archive comes from and what it must hash to.

use crate::cache::Checksum;
use crate::config::Scalar;
use crate::error::BuildError;
use std::path::Path;

/// An immutable description of one source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub description: String,
    pub version: Option<String>,
    /// File-name template, without extension; may embed `{version}`.
    pub file: String,
    /// Base download location template; may embed `{version}`/`{version_}`.
    pub url: Option<String>,
    /// Archive extension appended to the file name, e.g. `.tar.xz`.
    pub extension: String,
    pub checksum: Checksum,
}

impl PackageSpec {
    /// File name without extension, version substituted.
    pub fn stem(&self) -> String {
        substitute(&self.file, self.version.as_deref())
    }

    /// File name as stored in the cache and the build root.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem(), self.extension)
    }

    /// Fully resolved download URL, if the package declares one.
    pub fn download_url(&self) -> Option<String> {
        let base = substitute(self.url.as_deref()?, self.version.as_deref());
        Some(format!("{}/{}", base.trim_end_matches('/'), self.file_name()))
    }

    /// Description plus version, as shown in status lines.
    pub fn label(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {}", self.description, version),
            None => self.description.clone(),
        }
    }
}

fn substitute(template: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => template
            .replace("{version_}", &version.replace('.', "_"))
            .replace("{version}", version),
        None => template.to_string(),
    }
}

/// Package-related fields as they appear in a document.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawPackageFields {
    pub(crate) description: Option<String>,
    pub(crate) version: Option<Scalar>,
    pub(crate) file: Option<String>,
    pub(crate) url: Option<String>,
    pub(crate) extension: Option<String>,
    pub(crate) md5: Option<String>,
    pub(crate) sha256: Option<String>,
}

impl RawPackageFields {
    /// Whether the element declares an archive at all.
    pub(crate) fn declares_package(&self) -> bool {
        self.file.is_some() || self.url.is_some() || self.md5.is_some() || self.sha256.is_some()
    }

    pub(crate) fn validate(
        &self,
        document: &Path,
        element: &str,
        description: &str,
    ) -> Result<PackageSpec, BuildError> {
        let missing = |field: &str| {
            BuildError::config(
                document,
                format!("element '{element}' is missing required key '{field}'"),
            )
        };
        let file = self.file.clone().ok_or_else(|| missing("file"))?;
        let checksum = match (&self.md5, &self.sha256) {
            (Some(md5), None) => Checksum::md5(md5),
            (None, Some(sha256)) => Checksum::sha256(sha256),
            (None, None) => return Err(missing("md5")),
            (Some(_), Some(_)) => Err(format!(
                "element '{element}' declares both md5 and sha256; keep one"
            )),
        }
        .map_err(|message| {
            BuildError::config(document, format!("element '{element}': {message}"))
        })?;

        let package = PackageSpec {
            description: description.to_string(),
            version: self.version.as_ref().map(ToString::to_string),
            file,
            url: self.url.clone(),
            extension: self.extension.clone().unwrap_or_default(),
            checksum,
        };
        // Joined onto `sources/` and the cache directory as-is.
        let name = package.file_name();
        if name.contains('/') || name == "." || name == ".." {
            return Err(BuildError::config(
                document,
                format!("element '{element}': file name '{name}' must be a bare file name"),
            ));
        }
        Ok(package)
    }
}
