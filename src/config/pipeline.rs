//! Pipeline documents: the ordered list of stage documents to run.

use crate::config::{parse_document, read_document};
use crate::error::BuildError;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// One stage reference inside a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    pub name: String,
    /// Stage document, resolved against the pipeline document's directory.
    pub document: PathBuf,
    /// Process exit code reported when the operator aborts after this stage fails.
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub stages: Vec<StageEntry>,
    pub document: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    stages: Option<Vec<RawStageEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStageEntry {
    file: String,
    name: Option<String>,
    exit_code: Option<i32>,
}

impl PipelineDefinition {
    pub fn load(document: &Path) -> Result<Self, BuildError> {
        let raw: RawPipeline = read_document(document)?;
        Self::validate(document, raw)
    }

    pub fn parse(document: &Path, text: &str) -> Result<Self, BuildError> {
        let raw: RawPipeline = parse_document(document, text)?;
        Self::validate(document, raw)
    }

    fn validate(document: &Path, raw: RawPipeline) -> Result<Self, BuildError> {
        let raw_stages = raw
            .stages
            .filter(|stages| !stages.is_empty())
            .ok_or_else(|| BuildError::config(document, "pipeline declares no stages"))?;
        let base = document.parent().unwrap_or_else(|| Path::new("."));

        let mut seen_codes = BTreeSet::new();
        let mut stages = Vec::with_capacity(raw_stages.len());
        for (index, entry) in raw_stages.into_iter().enumerate() {
            let stage_document = base.join(&entry.file);
            let name = entry.name.unwrap_or_else(|| {
                Path::new(&entry.file)
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(&entry.file)
                    .to_string()
            });
            let exit_code = entry.exit_code.unwrap_or(index as i32 + 1);
            if exit_code == 0 {
                return Err(BuildError::config(
                    document,
                    format!("stage '{name}': exit code 0 is reserved for full success"),
                ));
            }
            if !seen_codes.insert(exit_code) {
                return Err(BuildError::config(
                    document,
                    format!("stage '{name}': exit code {exit_code} is already used"),
                ));
            }
            stages.push(StageEntry {
                name,
                document: stage_document,
                exit_code,
            });
        }

        Ok(Self {
            stages,
            document: document.to_path_buf(),
        })
    }
}
