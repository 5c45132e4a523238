// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Run registry — the per-pgroup monotonic run counter and run manifests.
//!
//! On-disk layout under the pgroup raw directory:
//!
//! ```text
//! run_info/
//!   LAST_RUN                     # decimal text, last allocated run number
//!   LAST_RUN.lock                # advisory lock, never renamed
//!   CLOSED                      # presence bars new allocations
//!   001000/run_001234.json       # manifests in thousand-wide buckets
//!   001000/run_001234.JF06.log   # detector retrieval logs
//! ```
//!
//! Allocation is a read-modify-write of `LAST_RUN` under an exclusive
//! advisory lock. The lock lives on a dedicated file so that replacing
//! `LAST_RUN` itself by atomic rename can never strand a waiting allocator
//! on an unlinked inode. A crash between rename and manifest write leaves a
//! numbering gap, never a duplicate.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use tracing::{debug, info};

use crate::error::{DaqError, Result};

const LAST_RUN_FILE: &str = "LAST_RUN";
const LAST_RUN_LOCK_FILE: &str = "LAST_RUN.lock";
const CLOSED_SENTINEL: &str = "CLOSED";

/// Registry rooted at one pgroup raw directory.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    raw_dir: PathBuf,
    pgroup: String,
}

impl RunRegistry {
    pub fn new(raw_dir: &Path, pgroup: &str) -> Self {
        Self {
            raw_dir: raw_dir.to_path_buf(),
            pgroup: pgroup.to_string(),
        }
    }

    pub fn run_info_dir(&self) -> PathBuf {
        self.raw_dir.join("run_info")
    }

    /// Thousand-wide manifest bucket for `run_number`, e.g. `run_info/001000`.
    pub fn bucket_dir(&self, run_number: u64) -> PathBuf {
        self.run_info_dir()
            .join(format!("{:06}", run_number / 1000 * 1000))
    }

    pub fn manifest_path(&self, run_number: u64) -> PathBuf {
        self.bucket_dir(run_number)
            .join(format!("run_{run_number:06}.json"))
    }

    pub fn detector_log_path(&self, run_number: u64, detector: &str) -> PathBuf {
        self.bucket_dir(run_number)
            .join(format!("run_{run_number:06}.{detector}.log"))
    }

    /// Verify the raw directory is usable and not closed; create `run_info/`.
    pub fn ensure_open(&self) -> Result<()> {
        if !self.raw_dir.is_dir() {
            return Err(DaqError::RegistryUnavailable(format!(
                "raw directory {:?} does not exist",
                self.raw_dir
            )));
        }

        let run_info = self.run_info_dir();
        if run_info.join(CLOSED_SENTINEL).exists() {
            return Err(DaqError::RegistryClosed {
                pgroup: self.pgroup.clone(),
            });
        }

        std::fs::create_dir_all(&run_info).map_err(|e| {
            DaqError::RegistryUnavailable(format!("cannot create {run_info:?}: {e}"))
        })?;

        Ok(())
    }

    /// Allocate the next run number.
    ///
    /// Atomic across processes via the exclusive lock; the counter file is
    /// replaced by temp-file rename so readers never observe a torn write.
    pub fn allocate(&self) -> Result<u64> {
        self.ensure_open()?;
        let run_info = self.run_info_dir();

        let lock_file = File::create(run_info.join(LAST_RUN_LOCK_FILE)).map_err(|e| {
            DaqError::RegistryUnavailable(format!("cannot open run counter lock: {e}"))
        })?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write().map_err(|e| {
            DaqError::RegistryUnavailable(format!("cannot lock run counter: {e}"))
        })?;

        let last = self.read_counter()?;
        let run_number = last + 1;

        let tmp_path = run_info.join(format!("{LAST_RUN_FILE}.tmp"));
        let final_path = run_info.join(LAST_RUN_FILE);
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| {
                DaqError::RegistryUnavailable(format!("cannot write run counter: {e}"))
            })?;
            write!(tmp, "{run_number}")?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        let bucket = self.bucket_dir(run_number);
        std::fs::create_dir_all(&bucket).map_err(|e| {
            DaqError::RegistryUnavailable(format!("cannot create bucket {bucket:?}: {e}"))
        })?;

        info!(pgroup = self.pgroup, run = run_number, "Run allocated");
        Ok(run_number)
    }

    /// Read the counter without mutation. Absent counter reads as 0.
    pub fn current(&self) -> Result<u64> {
        self.read_counter()
    }

    fn read_counter(&self) -> Result<u64> {
        let path = self.run_info_dir().join(LAST_RUN_FILE);

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(DaqError::RegistryUnavailable(format!(
                    "cannot read {path:?}: {e}"
                )))
            }
        };

        content.trim().parse::<u64>().map_err(|_| {
            DaqError::RegistryUnavailable(format!(
                "run counter {path:?} holds non-numeric content"
            ))
        })
    }

    /// Write the run manifest, pretty printed, atomically. Never mutated after.
    pub fn write_manifest(&self, run_number: u64, request: &serde_json::Value) -> Result<PathBuf> {
        std::fs::create_dir_all(self.bucket_dir(run_number))?;
        let path = self.manifest_path(run_number);
        let tmp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(request)
            .map_err(|e| DaqError::RegistryUnavailable(format!("manifest encode: {e}")))?;

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        debug!(run = run_number, path = ?path, "Run manifest written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = RunRegistry::new(dir.path(), "p12345");

        assert_eq!(registry.current().expect("current"), 0);
        assert_eq!(registry.allocate().expect("first"), 1);
        assert_eq!(registry.allocate().expect("second"), 2);
        assert_eq!(registry.current().expect("current"), 2);
    }

    #[test]
    fn closed_sentinel_bars_allocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = RunRegistry::new(dir.path(), "p12345");
        registry.allocate().expect("open allocation");

        std::fs::write(dir.path().join("run_info/CLOSED"), b"").expect("close");
        let err = registry.allocate().unwrap_err();
        assert!(matches!(err, DaqError::RegistryClosed { .. }));
    }

    #[test]
    fn missing_raw_dir_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = RunRegistry::new(&dir.path().join("nope"), "p12345");
        let err = registry.allocate().unwrap_err();
        assert!(matches!(err, DaqError::RegistryUnavailable(_)));
    }

    #[test]
    fn manifest_lands_in_thousand_bucket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = RunRegistry::new(dir.path(), "p12345");

        let path = registry
            .write_manifest(1234, &serde_json::json!({"pgroup": "p12345"}))
            .expect("manifest");
        assert!(path.ends_with("run_info/001000/run_001234.json"));

        let content = std::fs::read_to_string(&path).expect("read back");
        let value: serde_json::Value = serde_json::from_str(&content).expect("json");
        assert_eq!(value["pgroup"], "p12345");
    }
}
