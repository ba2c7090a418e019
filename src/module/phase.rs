use crate::status::Status;
use serde::Deserialize;
use std::fmt;

/// One step of a module's build, in execution order.
///
/// The derived ordering is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Download,
    Checksum,
    Copy,
    Extract,
    Patch,
    Setup,
    #[serde(alias = "preparation")]
    Prepare,
    #[serde(alias = "compilation")]
    Compile,
    #[serde(alias = "configuration")]
    Configure,
    #[serde(alias = "testing")]
    Test,
    #[serde(alias = "installation")]
    Install,
    #[serde(alias = "validation")]
    Validate,
    Cleanup,
}

impl Phase {
    /// Phases run only when the module fetches its own archives.
    pub const FETCH: [Phase; 3] = [Phase::Download, Phase::Checksum, Phase::Copy];

    /// Phases every module runs.
    pub const BUILD: [Phase; 10] = [
        Phase::Extract,
        Phase::Patch,
        Phase::Setup,
        Phase::Prepare,
        Phase::Compile,
        Phase::Configure,
        Phase::Test,
        Phase::Install,
        Phase::Validate,
        Phase::Cleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Download => "download",
            Phase::Checksum => "checksum",
            Phase::Copy => "copy",
            Phase::Extract => "extract",
            Phase::Patch => "patch",
            Phase::Setup => "setup",
            Phase::Prepare => "prepare",
            Phase::Compile => "compile",
            Phase::Configure => "configure",
            Phase::Test => "test",
            Phase::Install => "install",
            Phase::Validate => "validate",
            Phase::Cleanup => "cleanup",
        }
    }

    /// Whether a document may attach shell commands to this phase.
    pub fn accepts_commands(self) -> bool {
        !Self::FETCH.contains(&self)
    }

    pub fn status(self) -> Status {
        match self {
            Phase::Download => Status::Downloading,
            Phase::Checksum => Status::Verifying,
            Phase::Copy => Status::Copying,
            Phase::Extract => Status::Extracting,
            Phase::Patch => Status::Patching,
            Phase::Setup => Status::SettingUp,
            Phase::Prepare => Status::Preparing,
            Phase::Compile => Status::Compiling,
            Phase::Configure => Status::Configuring,
            Phase::Test => Status::Testing,
            Phase::Install => Status::Installing,
            Phase::Validate => Status::Validating,
            Phase::Cleanup => Status::Cleaning,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_order_is_execution_order() {
        let mut sorted = Phase::BUILD;
        sorted.sort();
        assert_eq!(sorted, Phase::BUILD);
        assert!(Phase::Copy < Phase::Extract);
        assert!(Phase::Compile < Phase::Configure);
    }

    #[test]
    fn original_names_are_aliases() {
        let phase: Phase = serde_yaml::from_str("compilation").unwrap();
        assert_eq!(phase, Phase::Compile);
        let phase: Phase = serde_yaml::from_str("installation").unwrap();
        assert_eq!(phase, Phase::Install);
    }
}
