use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use log::{info, warn};
use thiserror::Error;

use crate::{
    config::ConfigurationRecord,
    ini::IniError,
    paths::{CONFIG_BACKUP_FILE, CONFIG_FILE},
    types::BootFault,
};

/// Flat file namespace the configuration lives in.
pub trait Storage {
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;
    fn remove(&mut self, name: &str) -> io::Result<()>;
    fn exists(&self, name: &str) -> bool;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage mount failed at {}", path.display())]
    Mount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to move {name} aside")]
    Backup {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {name}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name} did not read back as written")]
    Verify { name: String },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no configuration stored")]
    NotFound,
    #[error("stored configuration is corrupt")]
    Corrupt(#[from] IniError),
    #[error("failed to read stored configuration")]
    Io(#[from] io::Error),
}

impl LoadError {
    pub fn boot_fault(&self) -> BootFault {
        match self {
            Self::NotFound => BootFault::ConfigMissing,
            Self::Corrupt(_) => BootFault::ConfigCorrupt,
            Self::Io(_) => BootFault::StorageUnavailable,
        }
    }
}

/// [`Storage`] over a mounted directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn mount(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Mount {
            path: root.clone(),
            source,
        })?;
        if !root.is_dir() {
            return Err(StoreError::Mount {
                source: io::Error::other("mount point is not a directory"),
                path: root,
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Storage for FsStorage {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path(name))
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write as _;

        let mut file = std::fs::File::create(self.path(name))?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        std::fs::rename(self.path(from), self.path(to))
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        std::fs::remove_file(self.path(name))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }
}

/// The node's data partition. A failed mount stays usable as a volume whose
/// every operation reports the mount failure, so configuration mode can
/// still run and report what could not be saved.
#[derive(Debug, Clone)]
pub enum Volume {
    Mounted(FsStorage),
    Unavailable { reason: String },
}

impl Volume {
    pub fn mount(root: impl Into<PathBuf>) -> Self {
        match FsStorage::mount(root) {
            Ok(storage) => Self::Mounted(storage),
            Err(err) => {
                let reason = match &err {
                    StoreError::Mount { path, source } => {
                        format!("{} unavailable: {source}", path.display())
                    }
                    other => other.to_string(),
                };
                warn!("{err}: {reason}");
                Self::Unavailable { reason }
            }
        }
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self, Self::Mounted(_))
    }

    fn unavailable(reason: &str) -> io::Error {
        io::Error::other(format!("storage not mounted: {reason}"))
    }
}

impl Storage for Volume {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        match self {
            Self::Mounted(storage) => storage.read(name),
            Self::Unavailable { reason } => Err(Self::unavailable(reason)),
        }
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Mounted(storage) => storage.write(name, bytes),
            Self::Unavailable { reason } => Err(Self::unavailable(reason)),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        match self {
            Self::Mounted(storage) => storage.rename(from, to),
            Self::Unavailable { reason } => Err(Self::unavailable(reason)),
        }
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        match self {
            Self::Mounted(storage) => storage.remove(name),
            Self::Unavailable { reason } => Err(Self::unavailable(reason)),
        }
    }

    fn exists(&self, name: &str) -> bool {
        match self {
            Self::Mounted(storage) => storage.exists(name),
            Self::Unavailable { .. } => false,
        }
    }
}

/// Backup-then-replace write that tolerates power loss at any step.
///
/// The current file is renamed to `backup`, the new bytes are written to
/// `primary` and read back, and only then is the backup removed. A failed
/// rename leaves the existing file untouched.
pub fn write_transactional<S: Storage + ?Sized>(
    storage: &mut S,
    primary: &str,
    backup: &str,
    bytes: &[u8],
) -> Result<(), StoreError> {
    if storage.exists(primary) {
        storage
            .rename(primary, backup)
            .map_err(|source| StoreError::Backup {
                name: primary.to_string(),
                source,
            })?;
    }

    storage
        .write(primary, bytes)
        .map_err(|source| StoreError::Write {
            name: primary.to_string(),
            source,
        })?;

    match storage.read(primary) {
        Ok(written) if written == bytes => {}
        _ => {
            return Err(StoreError::Verify {
                name: primary.to_string(),
            })
        }
    }

    if storage.exists(backup) {
        if let Err(err) = storage.remove(backup) {
            warn!("failed to remove {backup} after writing {primary}: {err}");
        }
    }

    Ok(())
}

pub struct ConfigStore<S> {
    storage: S,
}

impl<S: Storage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Loads the primary file, falling back to a backup left behind by an
    /// interrupted save.
    pub fn load(&self) -> Result<ConfigurationRecord, LoadError> {
        let primary_err = match self.read_record(CONFIG_FILE) {
            Ok(record) => return Ok(record),
            Err(err) => err,
        };

        match self.read_record(CONFIG_BACKUP_FILE) {
            Ok(record) => {
                warn!("recovered configuration from {CONFIG_BACKUP_FILE} ({primary_err})");
                Ok(record)
            }
            Err(LoadError::NotFound) => Err(primary_err),
            Err(backup_err) => match primary_err {
                LoadError::NotFound => Err(backup_err),
                other => Err(other),
            },
        }
    }

    pub fn save(&mut self, record: &ConfigurationRecord) -> Result<(), StoreError> {
        let text = record.to_ini();
        write_transactional(
            &mut self.storage,
            CONFIG_FILE,
            CONFIG_BACKUP_FILE,
            text.as_bytes(),
        )?;
        info!("configuration saved ({} bytes)", text.len());
        Ok(())
    }

    fn read_record(&self, name: &str) -> Result<ConfigurationRecord, LoadError> {
        let raw = match self.storage.read(name) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(LoadError::NotFound),
            Err(err) => return Err(err.into()),
        };
        let text = String::from_utf8(raw).map_err(|_| IniError::NotUtf8)?;
        Ok(ConfigurationRecord::from_ini(&text)?)
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::MemStorage, *};
    use crate::config::Bssid;
    use pretty_assertions::assert_eq;

    fn record() -> ConfigurationRecord {
        let mut record = ConfigurationRecord::default();
        record.network.ssid = "attic".to_string();
        record.network.bssid = Bssid([2, 4, 6, 8, 10, 12]);
        record.network.channel = 6;
        record.upload.device_id = "TS-02".to_string();
        record
    }

    #[test]
    fn load_of_saved_record_round_trips() {
        let mut store = ConfigStore::new(MemStorage::default());
        store.save(&record()).unwrap();

        assert_eq!(store.load().unwrap(), record());
        assert!(!store.storage().exists(CONFIG_BACKUP_FILE));
    }

    #[test]
    fn empty_storage_is_not_found() {
        let store = ConfigStore::new(MemStorage::default());
        assert!(matches!(store.load(), Err(LoadError::NotFound)));
    }

    #[test]
    fn garbage_without_backup_is_corrupt() {
        let mut storage = MemStorage::default();
        storage
            .files
            .insert(CONFIG_FILE.to_string(), b"[network]\nwifi_enabled=maybe\n".to_vec());
        let store = ConfigStore::new(storage);
        assert!(matches!(store.load(), Err(LoadError::Corrupt(_))));
    }

    #[test]
    fn load_errors_map_to_boot_faults() {
        assert_eq!(LoadError::NotFound.boot_fault(), BootFault::ConfigMissing);
        assert_eq!(
            LoadError::Corrupt(IniError::NotUtf8).boot_fault(),
            BootFault::ConfigCorrupt
        );
        assert_eq!(
            LoadError::Io(io::Error::other("bad block")).boot_fault(),
            BootFault::StorageUnavailable
        );
    }

    #[test]
    fn failed_rename_leaves_existing_file_untouched() {
        let mut store = ConfigStore::new(MemStorage::default());
        store.save(&record()).unwrap();
        let before = store.storage().text(CONFIG_FILE);

        store.storage_mut().fail_rename = true;
        let mut changed = record();
        changed.upload.device_id = "TS-99".to_string();

        assert!(matches!(
            store.save(&changed),
            Err(StoreError::Backup { .. })
        ));
        assert_eq!(store.storage().text(CONFIG_FILE), before);
        assert_eq!(store.load().unwrap(), record());
    }

    #[test]
    fn interrupted_write_recovers_from_backup() {
        let mut store = ConfigStore::new(MemStorage::default());
        store.save(&record()).unwrap();

        store.storage_mut().fail_write = true;
        let mut changed = record();
        changed.upload.device_id = "TS-99".to_string();
        assert!(matches!(store.save(&changed), Err(StoreError::Write { .. })));

        assert!(!store.storage().exists(CONFIG_FILE));
        assert!(store.storage().exists(CONFIG_BACKUP_FILE));
        assert_eq!(store.load().unwrap(), record());
    }

    #[test]
    fn short_write_fails_verification_and_keeps_backup() {
        let mut store = ConfigStore::new(MemStorage::default());
        store.save(&record()).unwrap();

        store.storage_mut().short_writes = true;
        assert!(matches!(
            store.save(&record()),
            Err(StoreError::Verify { .. })
        ));
        assert!(store.storage().exists(CONFIG_BACKUP_FILE));
        assert_eq!(store.load().unwrap(), record());
    }

    #[test]
    fn first_save_needs_no_backup() {
        let mut storage = MemStorage::default();
        storage.fail_rename = true;
        let mut store = ConfigStore::new(storage);

        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), record());
    }

    #[test]
    fn backup_removal_failure_is_not_a_save_failure() {
        let mut store = ConfigStore::new(MemStorage::default());
        store.save(&record()).unwrap();

        store.storage_mut().fail_remove = true;
        assert!(store.save(&record()).is_ok());
        assert_eq!(store.load().unwrap(), record());
    }

    #[test]
    fn fs_storage_round_trips_in_a_directory() {
        let root = std::env::temp_dir().join(format!(
            "thermosensor-store-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&root);

        let storage = FsStorage::mount(root.clone()).unwrap();
        let mut store = ConfigStore::new(storage);
        store.save(&record()).unwrap();
        store.save(&record()).unwrap();

        assert_eq!(store.load().unwrap(), record());
        assert!(root.join(CONFIG_FILE).is_file());
        assert!(!root.join(CONFIG_BACKUP_FILE).exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn unmounted_volume_loads_as_storage_fault_and_refuses_saves() {
        let file = std::env::temp_dir().join(format!(
            "thermosensor-volume-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::write(&file, b"not a directory").unwrap();

        let volume = Volume::mount(file.join("data"));
        assert!(!volume.is_mounted());

        let mut store = ConfigStore::new(volume);
        let err = store.load().unwrap_err();
        assert_eq!(err.boot_fault(), BootFault::StorageUnavailable);
        assert!(matches!(
            store.save(&record()),
            Err(StoreError::Write { .. })
        ));

        let _ = std::fs::remove_file(&file);
    }
}
