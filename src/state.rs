//! Persisted role state
//!
//! A role's durable lifecycle marker is a tiny JSON file holding two
//! string-encoded boolean flags, `deployed` and `dropped`. The file is
//! the source of truth across restarts: it is replaced atomically
//! (write temp, fsync, rename) so a crash at any point leaves either
//! the old record or the new one, never a torn write. A missing file is
//! the valid "never deployed" state; an unreadable one is treated the
//! same after a warning, since refusing to start the process over a
//! corrupt marker would be worse than re-running the bootstrap check.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{NodeError, Result};

/// Durable lifecycle flags for one role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedRecord {
    /// True once the role was successfully opened on this node
    pub deployed: bool,
    /// True once a drop has been durably recorded; never cleared
    pub dropped: bool,
}

/// On-disk shape: booleans are the strings "0"/"1".
#[derive(Serialize, Deserialize)]
struct RecordJson {
    deployed: String,
    dropped: String,
}

fn flag_to_str(v: bool) -> String {
    let s = if v { "1" } else { "0" };
    s.to_string()
}

fn parse_flag(s: &str, field: &str) -> Result<bool> {
    s.trim()
        .parse::<i32>()
        .map(|v| v != 0)
        .map_err(|_| NodeError::MalformedState(format!("field {} is not a number: {:?}", field, s)))
}

/// Reader/writer for one role's state file (`<data_dir>/<role>.json`).
pub struct RoleStateFile {
    path: PathBuf,
}

impl RoleStateFile {
    pub fn new(dir: &Path, role: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", role)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. A missing file yields the default record; a
    /// present but unreadable file is an error.
    pub fn read(&self) -> Result<PersistedRecord> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("role state file {} not found", self.path.display());
                return Ok(PersistedRecord::default());
            }
            Err(e) => {
                return Err(NodeError::Persistence(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let json: RecordJson = serde_json::from_slice(&data)
            .map_err(|e| NodeError::MalformedState(format!("{}: {}", self.path.display(), e)))?;

        Ok(PersistedRecord {
            deployed: parse_flag(&json.deployed, "deployed")?,
            dropped: parse_flag(&json.dropped, "dropped")?,
        })
    }

    /// Read the record, degrading an unreadable file to "never
    /// deployed" with a warning. Used at process startup.
    pub fn load_or_default(&self) -> PersistedRecord {
        match self.read() {
            Ok(record) => record,
            Err(e) => {
                log::warn!(
                    "treating {} as never deployed: {}",
                    self.path.display(),
                    e
                );
                PersistedRecord::default()
            }
        }
    }

    /// Atomically replace the record: write `<path>.bak`, fsync it,
    /// then rename over the original.
    pub fn write(&self, record: PersistedRecord) -> Result<()> {
        let tmp = PathBuf::from(format!("{}.bak", self.path.display()));
        let json = RecordJson {
            deployed: flag_to_str(record.deployed),
            dropped: flag_to_str(record.dropped),
        };
        let data = serde_json::to_vec_pretty(&json)
            .map_err(|e| NodeError::Persistence(format!("encode role state: {}", e)))?;

        let persist_err =
            |e: std::io::Error| NodeError::Persistence(format!("write {}: {}", tmp.display(), e));
        let mut file = File::create(&tmp).map_err(persist_err)?;
        file.write_all(&data).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| {
            NodeError::Persistence(format!("rename to {}: {}", self.path.display(), e))
        })?;

        log::info!(
            "role state written to {}: deployed={} dropped={}",
            self.path.display(),
            record.deployed,
            record.dropped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_never_deployed() {
        let dir = tempdir().unwrap();
        let file = RoleStateFile::new(dir.path(), "catalog");
        assert_eq!(file.read().unwrap(), PersistedRecord::default());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let file = RoleStateFile::new(dir.path(), "catalog");
        let record = PersistedRecord {
            deployed: true,
            dropped: false,
        };
        file.write(record).unwrap();
        assert_eq!(file.read().unwrap(), record);

        // Flags are string-encoded on disk
        let raw = fs::read_to_string(file.path()).unwrap();
        assert!(raw.contains("\"1\""));
        assert!(raw.contains("\"0\""));
    }

    #[test]
    fn test_rewrite_replaces_record() {
        let dir = tempdir().unwrap();
        let file = RoleStateFile::new(dir.path(), "catalog");
        file.write(PersistedRecord {
            deployed: true,
            dropped: false,
        })
        .unwrap();
        file.write(PersistedRecord {
            deployed: false,
            dropped: true,
        })
        .unwrap();

        let record = file.read().unwrap();
        assert!(!record.deployed);
        assert!(record.dropped);

        // The temp file must not linger after a successful replace
        assert!(!PathBuf::from(format!("{}.bak", file.path().display())).exists());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempdir().unwrap();
        let file = RoleStateFile::new(dir.path(), "catalog");
        fs::write(file.path(), b"{not json").unwrap();
        assert!(matches!(file.read(), Err(NodeError::MalformedState(_))));

        // Startup path degrades to the default record
        assert_eq!(file.load_or_default(), PersistedRecord::default());
    }

    #[test]
    fn test_malformed_flag_value() {
        let dir = tempdir().unwrap();
        let file = RoleStateFile::new(dir.path(), "catalog");
        fs::write(
            file.path(),
            br#"{"deployed": "yes", "dropped": "0"}"#,
        )
        .unwrap();
        assert!(matches!(file.read(), Err(NodeError::MalformedState(_))));
    }

    #[test]
    fn test_stale_temp_does_not_corrupt_record() {
        // A crash between temp-write and rename leaves a .bak file; the
        // original record must still read back.
        let dir = tempdir().unwrap();
        let file = RoleStateFile::new(dir.path(), "catalog");
        let record = PersistedRecord {
            deployed: true,
            dropped: false,
        };
        file.write(record).unwrap();
        fs::write(
            format!("{}.bak", file.path().display()),
            b"half-written garbage",
        )
        .unwrap();
        assert_eq!(file.read().unwrap(), record);
    }
}
