use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{CdmError, CdmResult};
use crate::types::SecurityLevel;

/// Named-blob persistence, partitioned by security level. An implementation
/// is already scoped to one origin; distinct origins must be given disjoint
/// stores.
pub trait FileStore: Send + Sync {
    fn store(&self, level: SecurityLevel, name: &str, data: &[u8]) -> CdmResult<()>;
    fn retrieve(&self, level: SecurityLevel, name: &str) -> CdmResult<Vec<u8>>;
    fn exists(&self, level: SecurityLevel, name: &str) -> bool;
    fn remove(&self, level: SecurityLevel, name: &str) -> CdmResult<()>;
    fn list(&self, level: SecurityLevel) -> CdmResult<Vec<String>>;
    fn size(&self, level: SecurityLevel, name: &str) -> CdmResult<usize>;
}

/// Blob store backed by the local filesystem.
///
/// Layout: `<base>/<origin>/L<level>/<name>`. The origin directory is
/// `global` when no origin was supplied.
pub struct FileSystemStore {
    base: PathBuf,
    origin: String,
}

impl FileSystemStore {
    pub fn new(base: impl Into<PathBuf>, origin: &str) -> Self {
        FileSystemStore {
            base: base.into(),
            origin: if origin.is_empty() {
                "global".to_owned()
            } else {
                origin.to_owned()
            },
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn dir(&self, level: SecurityLevel) -> PathBuf {
        self.base
            .join(&self.origin)
            .join(format!("L{}", level.to_u8()))
    }

    fn path(&self, level: SecurityLevel, name: &str) -> PathBuf {
        self.dir(level).join(name)
    }
}

impl FileStore for FileSystemStore {
    fn store(&self, level: SecurityLevel, name: &str, data: &[u8]) -> CdmResult<()> {
        let dir = self.dir(level);
        fs::create_dir_all(&dir).map_err(|_| CdmError::BasePathUnavailable)?;
        fs::write(self.path(level, name), data).map_err(|e| CdmError::FileWrite(e.to_string()))
    }

    fn retrieve(&self, level: SecurityLevel, name: &str) -> CdmResult<Vec<u8>> {
        match fs::read(self.path(level, name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CdmError::LicenseNotFound(name.to_owned()))
            }
            Err(e) => Err(CdmError::FileRead(e.to_string())),
        }
    }

    fn exists(&self, level: SecurityLevel, name: &str) -> bool {
        self.path(level, name).is_file()
    }

    fn remove(&self, level: SecurityLevel, name: &str) -> CdmResult<()> {
        match fs::remove_file(self.path(level, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CdmError::FileWrite(e.to_string())),
        }
    }

    fn list(&self, level: SecurityLevel) -> CdmResult<Vec<String>> {
        let dir = self.dir(level);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| CdmError::FileRead(e.to_string()))? {
            let entry = entry.map_err(|e| CdmError::FileRead(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn size(&self, level: SecurityLevel, name: &str) -> CdmResult<usize> {
        fs::metadata(self.path(level, name))
            .map(|m| m.len() as usize)
            .map_err(|e| CdmError::FileRead(e.to_string()))
    }
}

/// In-memory blob store, for hosts without persistent storage and for tests.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<(u8, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryStore {
    fn store(&self, level: SecurityLevel, name: &str, data: &[u8]) -> CdmResult<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert((level.to_u8(), name.to_owned()), data.to_vec());
        Ok(())
    }

    fn retrieve(&self, level: SecurityLevel, name: &str) -> CdmResult<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(level.to_u8(), name.to_owned()))
            .cloned()
            .ok_or_else(|| CdmError::LicenseNotFound(name.to_owned()))
    }

    fn exists(&self, level: SecurityLevel, name: &str) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .contains_key(&(level.to_u8(), name.to_owned()))
    }

    fn remove(&self, level: SecurityLevel, name: &str) -> CdmResult<()> {
        self.blobs
            .lock()
            .unwrap()
            .remove(&(level.to_u8(), name.to_owned()));
        Ok(())
    }

    fn list(&self, level: SecurityLevel) -> CdmResult<Vec<String>> {
        let mut names: Vec<String> = self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|(l, _)| *l == level.to_u8())
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn size(&self, level: SecurityLevel, name: &str) -> CdmResult<usize> {
        self.retrieve(level, name).map(|d| d.len())
    }
}
