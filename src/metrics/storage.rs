//! Per-runner metric directories on the manager host.
//!
//! Files are pulled from the VM at deletion time and parsed here. A
//! malformed file condemns the whole directory to quarantine, untouched,
//! for later review. The VM rotates its copies with copy-truncate, so a
//! zero-length or missing file means "no data yet", never "corrupt".

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::instrument;

use super::{PostJobMetrics, PreJobMetrics, RunnerMetrics};
use crate::naming::InstanceName;

/// Anything past this is not a metrics file the VM scripts could have
/// produced.
pub const MAX_METRIC_FILE_SIZE: u64 = 1024 * 1024;

/// Orphaned metric directories are kept this long for late pulls.
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const PRE_JOB_FILE: &str = "pre_job.json";
pub const POST_JOB_FILE: &str = "post_job.json";
pub const INSTALL_START_FILE: &str = "installation_start.ts";
pub const INSTALLED_FILE: &str = "installed.ts";

pub const METRIC_FILES: [&str; 4] = [
    PRE_JOB_FILE,
    POST_JOB_FILE,
    INSTALL_START_FILE,
    INSTALLED_FILE,
];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("corrupt metrics file {file} for {runner}: {reason}")]
    Corrupt {
        runner: String,
        file: String,
        reason: String,
    },

    #[error("metrics storage io error")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct MetricsStorage {
    root: PathBuf,
    quarantine: PathBuf,
}

impl MetricsStorage {
    pub fn new(root: PathBuf, quarantine: PathBuf) -> Self {
        Self { root, quarantine }
    }

    pub fn dir(&self, name: &InstanceName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Create the runner's directory at VM birth so orphan collection can
    /// reason about its age even if nothing is ever pulled into it.
    pub fn ensure_dir(&self, name: &InstanceName) -> Result<(), MetricsError> {
        fs::create_dir_all(self.dir(name))?;
        Ok(())
    }

    /// Store one pulled file under the runner's directory, creating it on
    /// first write.
    pub fn store_file(
        &self,
        name: &InstanceName,
        file: &str,
        contents: &[u8],
    ) -> Result<(), MetricsError> {
        let dir = self.dir(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(file), contents)?;
        Ok(())
    }

    /// Parse the runner's metric files into one aggregate. Missing or empty
    /// files contribute nothing; a malformed one fails the whole load.
    pub fn load(&self, name: &InstanceName) -> Result<RunnerMetrics, MetricsError> {
        let dir = self.dir(name);
        let mut metrics = RunnerMetrics::named(name);

        metrics.install_started_at =
            self.read_timestamp(name, &dir, INSTALL_START_FILE)?;
        metrics.installed_at = self.read_timestamp(name, &dir, INSTALLED_FILE)?;
        metrics.pre_job = self.read_json::<PreJobMetrics>(name, &dir, PRE_JOB_FILE)?;
        metrics.post_job = self.read_json::<PostJobMetrics>(name, &dir, POST_JOB_FILE)?;

        Ok(metrics)
    }

    /// Load, or on corruption move the whole directory to quarantine and
    /// report nothing. Deletion of the runner proceeds either way.
    #[instrument(skip(self), fields(runner = %name))]
    pub fn load_or_quarantine(&self, name: &InstanceName) -> Option<RunnerMetrics> {
        match self.load(name) {
            Ok(metrics) => Some(metrics),
            Err(MetricsError::Corrupt { reason, file, .. }) => {
                tracing::warn!(file, reason, "corrupt metrics, quarantining directory");
                if let Err(e) = self.quarantine(name) {
                    tracing::error!(error = %e, "failed to quarantine metrics directory");
                }
                None
            }
            Err(MetricsError::Io(e)) => {
                tracing::warn!(error = %e, "failed to read metrics directory");
                None
            }
        }
    }

    /// Move `<root>/<name>` to `<quarantine>/<name>`, file by file so the
    /// move also works across filesystems. Nothing in quarantine is ever
    /// read back or removed by this manager.
    pub fn quarantine(&self, name: &InstanceName) -> Result<(), MetricsError> {
        let source = self.dir(name);
        let target = self.quarantine.join(name.as_str());
        fs::create_dir_all(&target)?;

        for entry in fs::read_dir(&source)? {
            let entry = entry?;
            let destination = target.join(entry.file_name());
            if fs::rename(entry.path(), &destination).is_err() {
                fs::copy(entry.path(), &destination)?;
                fs::remove_file(entry.path())?;
            }
        }
        fs::remove_dir(&source)?;

        Ok(())
    }

    pub fn delete_dir(&self, name: &InstanceName) -> Result<(), MetricsError> {
        match fs::remove_dir_all(self.dir(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_dirs(&self, prefix: &str) -> Result<Vec<InstanceName>, MetricsError> {
        let mut names = vec![];
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|raw| InstanceName::parse(prefix, raw))
            {
                names.push(name);
            }
        }

        Ok(names)
    }

    /// Delete metric directories past retention that no longer back a live
    /// instance. Returns how many were collected.
    #[instrument(skip(self, live, now))]
    pub fn collect_orphans(
        &self,
        prefix: &str,
        live: &HashSet<InstanceName>,
        now: SystemTime,
    ) -> Result<usize, MetricsError> {
        let mut collected = 0;

        for name in self.list_dirs(prefix)? {
            if live.contains(&name) {
                continue;
            }

            let dir = self.dir(&name);
            let modified = fs::metadata(&dir)?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= RETENTION {
                tracing::info!(runner = %name, age_days = age.as_secs() / 86_400, "collecting orphaned metrics directory");
                self.delete_dir(&name)?;
                collected += 1;
            }
        }

        Ok(collected)
    }

    fn read_raw(
        &self,
        name: &InstanceName,
        dir: &Path,
        file: &str,
    ) -> Result<Option<Vec<u8>>, MetricsError> {
        let path = dir.join(file);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if metadata.len() > MAX_METRIC_FILE_SIZE {
            return Err(MetricsError::Corrupt {
                runner: name.to_string(),
                file: file.to_string(),
                reason: format!("{} bytes exceeds the size bound", metadata.len()),
            });
        }

        let contents = fs::read(&path)?;
        if contents.iter().all(|b| b.is_ascii_whitespace()) {
            // Concurrently truncated by the VM's copy-truncate rotation.
            return Ok(None);
        }

        Ok(Some(contents))
    }

    fn read_timestamp(
        &self,
        name: &InstanceName,
        dir: &Path,
        file: &str,
    ) -> Result<Option<i64>, MetricsError> {
        let Some(raw) = self.read_raw(name, dir, file)? else {
            return Ok(None);
        };

        let text = String::from_utf8_lossy(&raw);
        text.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| MetricsError::Corrupt {
                runner: name.to_string(),
                file: file.to_string(),
                reason: e.to_string(),
            })
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        name: &InstanceName,
        dir: &Path,
        file: &str,
    ) -> Result<Option<T>, MetricsError> {
        let Some(raw) = self.read_raw(name, dir, file)? else {
            return Ok(None);
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| MetricsError::Corrupt {
                runner: name.to_string(),
                file: file.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PostJobStatus;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> MetricsStorage {
        MetricsStorage::new(tmp.path().join("metrics"), tmp.path().join("quarantine"))
    }

    fn name() -> InstanceName {
        InstanceName::parse("mgr-a", "mgr-a-abc12").unwrap()
    }

    #[test]
    fn loads_complete_directory() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);
        let name = name();

        store.store_file(&name, INSTALL_START_FILE, b"100\n").unwrap();
        store.store_file(&name, INSTALLED_FILE, b"160").unwrap();
        store
            .store_file(
                &name,
                PRE_JOB_FILE,
                br#"{"timestamp": 1000, "workflow": "build", "repository": "o/r", "event": "push"}"#,
            )
            .unwrap();
        store
            .store_file(&name, POST_JOB_FILE, br#"{"timestamp": 1300, "status": "normal"}"#)
            .unwrap();

        let metrics = store.load(&name).unwrap();
        assert_eq!(metrics.installation_duration(), Some(60));
        assert_eq!(metrics.job_duration(), Some(300));
        assert_eq!(
            metrics.post_job.unwrap().status,
            PostJobStatus::Normal
        );
    }

    #[test]
    fn missing_and_empty_files_are_no_data() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);
        let name = name();

        store.store_file(&name, INSTALL_START_FILE, b"  \n").unwrap();

        let metrics = store.load(&name).unwrap();
        assert_eq!(metrics.install_started_at, None);
        assert_eq!(metrics.pre_job, None);
        assert_eq!(metrics.post_job, None);
    }

    #[test]
    fn corrupt_json_quarantines_the_whole_directory() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);
        let name = name();

        store.store_file(&name, INSTALLED_FILE, b"200").unwrap();
        store.store_file(&name, PRE_JOB_FILE, b"{not json").unwrap();

        assert!(store.load_or_quarantine(&name).is_none());

        // The directory moved wholesale, intact files included.
        assert!(!store.dir(&name).exists());
        let quarantined = tmp.path().join("quarantine").join(name.as_str());
        assert!(quarantined.join(PRE_JOB_FILE).exists());
        assert!(quarantined.join(INSTALLED_FILE).exists());
    }

    #[test]
    fn oversize_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);
        let name = name();

        let big = vec![b'9'; (MAX_METRIC_FILE_SIZE + 1) as usize];
        store.store_file(&name, INSTALL_START_FILE, &big).unwrap();

        assert!(matches!(
            store.load(&name),
            Err(MetricsError::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_timestamp_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);
        let name = name();

        store.store_file(&name, INSTALLED_FILE, b"not-a-number").unwrap();
        assert!(matches!(
            store.load(&name),
            Err(MetricsError::Corrupt { .. })
        ));
    }

    #[test]
    fn orphan_collection_respects_retention_and_liveness() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);

        let live_name = InstanceName::parse("mgr-a", "mgr-a-live1").unwrap();
        let old_name = InstanceName::parse("mgr-a", "mgr-a-old11").unwrap();
        let fresh_name = InstanceName::parse("mgr-a", "mgr-a-new11").unwrap();
        store.store_file(&live_name, INSTALLED_FILE, b"1").unwrap();
        store.store_file(&old_name, INSTALLED_FILE, b"1").unwrap();
        store.store_file(&fresh_name, INSTALLED_FILE, b"1").unwrap();

        // Every directory was just written, so age them by moving "now"
        // past retention; only liveness can save a directory then.
        let future = SystemTime::now() + RETENTION + Duration::from_secs(60);
        let live: HashSet<InstanceName> = [live_name.clone(), fresh_name.clone()].into();

        let collected = store.collect_orphans("mgr-a", &live, future).unwrap();
        assert_eq!(collected, 1);
        assert!(store.dir(&live_name).exists());
        assert!(store.dir(&fresh_name).exists());
        assert!(!store.dir(&old_name).exists());
    }

    #[test]
    fn foreign_directories_are_invisible() {
        let tmp = TempDir::new().unwrap();
        let store = storage(&tmp);

        let ours = name();
        store.store_file(&ours, INSTALLED_FILE, b"1").unwrap();
        fs::create_dir_all(tmp.path().join("metrics").join("mgr-b-zzz99")).unwrap();

        assert_eq!(store.list_dirs("mgr-a").unwrap(), vec![ours]);
    }
}
