//! Per-command transcripts: `<logs>/<stage>/<module>/<phase>`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::warn;

const SEPARATOR: &str = "\n   *****   \n";

/// Append-only transcript sink for one stage.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    dir: PathBuf,
}

impl TranscriptLog {
    pub fn for_stage(log_dir: &Path, stage: &str) -> Self {
        Self {
            dir: log_dir.join(stage),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, module: &str, phase: &str) -> PathBuf {
        self.dir.join(module).join(phase)
    }

    /// Record one command. A transcript that cannot be written never fails the build.
    pub fn append(&self, module: &str, phase: &str, command: &str, output: &[u8], error: Option<&str>) {
        let path = self.path(module, phase);
        if let Err(err) = write_entry(&path, command, output, error) {
            warn!("cannot write transcript {}: {err}", path.display());
        }
    }
}

fn write_entry(path: &Path, command: &str, output: &[u8], error: Option<&str>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", timestamp())?;
    writeln!(file, "$ {command}")?;
    write!(file, "stdout:\t")?;
    file.write_all(output)?;
    if let Some(error) = error {
        write!(file, "\nstderr:\t{error}")?;
    }
    file.write_all(SEPARATOR.as_bytes())?;
    Ok(())
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_append_per_phase() {
        let temp = TempDir::new().unwrap();
        let log = TranscriptLog::for_stage(temp.path(), "temporary");

        log.append("binutils", "compile", "make", b"ok\n", None);
        log.append("binutils", "compile", "make check", b"", Some("exited with 2"));

        let text = fs::read_to_string(temp.path().join("temporary/binutils/compile")).unwrap();
        assert!(text.contains("$ make\nstdout:\tok\n"));
        assert!(text.contains("$ make check\nstdout:\t\nstderr:\texited with 2"));
        assert_eq!(text.matches("*****").count(), 2);
    }

    #[test]
    fn unwritable_log_is_ignored() {
        let temp = TempDir::new().unwrap();
        // A file where the stage directory should be.
        fs::write(temp.path().join("stage"), b"").unwrap();
        let log = TranscriptLog::for_stage(temp.path(), "stage");
        log.append("m", "p", "true", b"", None);
    }
}
