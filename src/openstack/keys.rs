//! Per-runner private keyfiles on local disk.
//!
//! One keypair per runner, named after the instance; the private half lives
//! at `<dir>/<instance>.key` with strict permissions. The store never reads
//! key material back, it only writes, lists and deletes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::naming::InstanceName;

const KEY_SUFFIX: &str = ".key";

#[derive(Clone, Debug)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn key_path(&self, name: &InstanceName) -> PathBuf {
        self.dir.join(format!("{name}{KEY_SUFFIX}"))
    }

    pub fn write_key(&self, name: &InstanceName, material: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;

        let path = self.key_path(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(material.as_bytes())?;

        Ok(path)
    }

    /// Remove the keyfile if present. Absence is not an error; the launch
    /// failure path deletes blindly.
    pub fn delete_key(&self, name: &InstanceName) -> std::io::Result<()> {
        match fs::remove_file(self.key_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Instance names for which a keyfile exists on disk, skipping anything
    /// that does not carry `prefix`.
    pub fn list_keys(&self, prefix: &str) -> std::io::Result<Vec<InstanceName>> {
        let mut names = vec![];

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(stem) = Path::new(&file_name)
                .to_str()
                .and_then(|s| s.strip_suffix(KEY_SUFFIX))
            else {
                continue;
            };

            if let Some(name) = InstanceName::parse(prefix, stem) {
                names.push(name);
            }
        }

        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_list_delete_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::new(tmp.path().join("keys"));
        let name = InstanceName::parse("mgr-a", "mgr-a-abc12").unwrap();

        let path = store.write_key(&name, "PRIVATE KEY MATERIAL").unwrap();
        assert!(path.ends_with("mgr-a-abc12.key"));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        assert_eq!(store.list_keys("mgr-a").unwrap(), vec![name.clone()]);

        store.delete_key(&name).unwrap();
        assert!(store.list_keys("mgr-a").unwrap().is_empty());

        // Deleting again is fine.
        store.delete_key(&name).unwrap();
    }

    #[test]
    fn listing_skips_foreign_prefixes_and_noise() {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::new(tmp.path().to_path_buf());

        let ours = InstanceName::parse("mgr-a", "mgr-a-one11").unwrap();
        store.write_key(&ours, "k").unwrap();
        fs::write(tmp.path().join("mgr-b-two22.key"), "k").unwrap();
        fs::write(tmp.path().join("notes.txt"), "n").unwrap();

        assert_eq!(store.list_keys("mgr-a").unwrap(), vec![ours]);
    }

    #[test]
    fn listing_missing_directory_is_empty() {
        let store = KeyStore::new(PathBuf::from("/nonexistent/for/sure"));
        assert!(store.list_keys("mgr-a").unwrap().is_empty());
    }
}
