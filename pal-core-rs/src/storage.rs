//! On-disk persistence for the replica log.
//!
//! The file is JSON lines: one header record followed by one record per
//! entry in seqno order. Saves go to a temporary file that is renamed over
//! the previous one, so a crash mid-write leaves the old state intact.

use crate::error::{MeshError, Result};
use crate::reconcile::ReplicaLog;
use crate::wire::StateEntry;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    format: u32,
    next_seqno: u64,
}

/// Single-file store for one node's replica
#[derive(Debug, Clone)]
pub struct LogStore {
    path: PathBuf,
}

impl LogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored state with `log`
    pub fn save(&self, log: &ReplicaLog) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let temp_path = self.temp_path();
        {
            let mut out = BufWriter::new(File::create(&temp_path)?);
            let header = Header {
                format: FORMAT_VERSION,
                next_seqno: log.next_seqno(),
            };
            writeln!(out, "{}", serde_json::to_string(&header)?)?;
            for entry in log.entries() {
                writeln!(out, "{}", serde_json::to_string(entry)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!("Storage: Saved {} entries to {:?}", log.len(), self.path);
        Ok(())
    }

    /// Read the stored state; `None` if nothing was saved yet
    pub fn load(&self) -> Result<Option<ReplicaLog>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let header_line = match lines.next() {
            Some(line) => line?,
            None => return Err(self.corrupt("missing header")),
        };
        let header: Header = serde_json::from_str(&header_line)
            .map_err(|e| self.corrupt(format!("bad header: {}", e)))?;
        if header.format != FORMAT_VERSION {
            return Err(self.corrupt(format!("unsupported format {}", header.format)));
        }

        let mut entries = Vec::new();
        for (idx, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StateEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // Line numbers are 1-based and the header is line 1
                Err(e) => warn!("Storage: Skipping line {} of {:?}: {}", idx + 2, self.path, e),
            }
        }

        let log = ReplicaLog::from_entries(entries, header.next_seqno);
        info!(
            "Storage: Loaded {} entries from {:?} (next seqno {})",
            log.len(),
            self.path,
            log.next_seqno()
        );
        Ok(Some(log))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn corrupt(&self, reason: impl Into<String>) -> MeshError {
        MeshError::Storage {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}
