use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Each line type in a run archive JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveLine {
    RunStart {
        timestamp: DateTime<Utc>,
        session_id: String,
        workspace_id: String,
        language: String,
        source: String,
        limits: serde_json::Value,
    },
    Event {
        seq: u64,
        kind: String,
        payload: String,
        timestamp: DateTime<Utc>,
    },
    RunEnd {
        state: String,
        exit_code: Option<i32>,
        failure: Option<String>,
        problems: usize,
        duration_secs: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Writes one session as JSONL to a file under `<data_dir>/coderun/runs/`.
///
/// Takes plain fields rather than registry types so this crate stays below
/// `coderun-core` in the dependency graph.
pub struct RunArchive {
    file: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl RunArchive {
    /// Create an archive in the default data directory
    pub fn new(source: &str) -> io::Result<Self> {
        Self::in_dir(&Self::default_dir()?, source)
    }

    /// Create an archive in `dir`. The file name is the current UTC
    /// timestamp followed by a short hash of the source.
    pub fn in_dir(dir: &Path, source: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let timestamp_str = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string();

        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let hash = hex::encode(hasher.finalize());
        let short_hash = &hash[..6];

        let path = dir.join(format!("{}_{}.jsonl", timestamp_str, short_hash));
        let file = File::create(&path)?;

        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_start(
        &self,
        session_id: &str,
        workspace_id: &str,
        language: &str,
        source: &str,
        limits: serde_json::Value,
    ) {
        self.write_line(&ArchiveLine::RunStart {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            language: language.to_string(),
            source: source.to_string(),
            limits,
        });
    }

    pub fn write_event(&self, seq: u64, kind: &str, payload: &str, timestamp: DateTime<Utc>) {
        self.write_line(&ArchiveLine::Event {
            seq,
            kind: kind.to_string(),
            payload: payload.to_string(),
            timestamp,
        });
    }

    pub fn write_end(
        &self,
        state: &str,
        exit_code: Option<i32>,
        failure: Option<&str>,
        problems: usize,
        duration_secs: f64,
    ) {
        self.write_line(&ArchiveLine::RunEnd {
            state: state.to_string(),
            exit_code,
            failure: failure.map(String::from),
            problems,
            duration_secs,
            timestamp: Utc::now(),
        });
    }

    fn write_line(&self, line: &ArchiveLine) {
        if let Ok(json) = serde_json::to_string(line) {
            if let Ok(mut writer) = self.file.lock() {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
    }

    pub fn default_dir() -> io::Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Could not determine data directory")
        })?;
        Ok(data_dir.join("coderun").join("runs"))
    }

    /// Read every line of an archive file back
    pub fn read(path: &Path) -> io::Result<Vec<ArchiveLine>> {
        let contents = fs::read_to_string(path)?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(io::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_has_timestamp_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RunArchive::in_dir(dir.path(), "print(1)").unwrap();

        let name = archive.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".jsonl"));
        let (_, hash) = name.trim_end_matches(".jsonl").rsplit_once('_').unwrap();
        assert_eq!(hash.len(), 6);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_lines_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RunArchive::in_dir(dir.path(), "echo hi").unwrap();
        archive.write_start("s1", "w1", "shell", "echo hi", serde_json::json!({"timeout": "10s"}));
        archive.write_event(1, "lifecycle", "Started", Utc::now());
        archive.write_event(2, "stdout", "hi", Utc::now());
        archive.write_end("succeeded", Some(0), None, 0, 0.05);

        let lines = RunArchive::read(archive.path()).unwrap();
        assert_eq!(lines.len(), 4);
        assert!(matches!(&lines[0], ArchiveLine::RunStart { session_id, .. } if session_id == "s1"));
        assert!(matches!(&lines[2], ArchiveLine::Event { seq: 2, payload, .. } if payload == "hi"));
        assert!(matches!(
            &lines[3],
            ArchiveLine::RunEnd { exit_code: Some(0), failure: None, .. }
        ));
    }
}
