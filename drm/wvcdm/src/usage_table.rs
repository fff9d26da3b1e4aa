//! Usage-table header bookkeeping (usage-entry TCE semantics).
//!
//! The TCE keeps an opaque header indexing every live usage entry at one
//! security level; we mirror it with a persistent reverse-lookup table so
//! each entry number can be traced back to the license or usage-info record
//! that owns it. The invariant after every mutation: entry numbers are
//! dense in `0..size`, every live entry has a persistent record claiming
//! that number, and the header blob on disk matches the TCE's.

use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{info, warn};

use crate::device_files::{DeviceFiles, ReservedKeySetIds, UsageEntryInfo, UsageEntryStorageType};
use crate::error::{CdmError, CdmResult};
use crate::file_store::FileStore;
use crate::tce::{CryptoSession, TceLocks, TrustedCryptoEngine};
use crate::types::{RequestedSecurityLevel, SecurityLevel};

const MAX_CRYPTO_RETRIES: u32 = 3;
/// Tables larger than this get an add+delete probe at load time to confirm
/// the TCE can still grow them.
const MIN_USAGE_ENTRIES_SUPPORTED: usize = 200;
const PROBE_KEY_SET_ID: &str = "DummyKsid";

struct Inner {
    header: Vec<u8>,
    entry_info: Vec<UsageEntryInfo>,
    is_inited: bool,
}

/// Per-security-level usage table header, shared by every session at that
/// level. All mutations hold one internal mutex.
pub struct UsageTableHeader {
    engine: Arc<dyn TrustedCryptoEngine>,
    locks: Arc<TceLocks>,
    requested_level: RequestedSecurityLevel,
    security_level: SecurityLevel,
    device_files: DeviceFiles,
    inner: Mutex<Inner>,
}

impl UsageTableHeader {
    pub fn new(
        engine: Arc<dyn TrustedCryptoEngine>,
        locks: Arc<TceLocks>,
        security_level: SecurityLevel,
        store: Arc<dyn FileStore>,
        reserved: Arc<ReservedKeySetIds>,
    ) -> Self {
        let requested_level = if security_level == SecurityLevel::L3 {
            RequestedSecurityLevel::Level3
        } else {
            RequestedSecurityLevel::Default
        };
        UsageTableHeader {
            engine,
            locks,
            requested_level,
            security_level,
            device_files: DeviceFiles::new(store, security_level, reserved),
            inner: Mutex::new(Inner {
                header: Vec::new(),
                entry_info: Vec::new(),
                is_inited: false,
            }),
        }
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entry_info.len()
    }

    pub fn is_inited(&self) -> bool {
        self.inner.lock().unwrap().is_inited
    }

    fn open_own_session(&self) -> CdmResult<CryptoSession> {
        CryptoSession::open(self.engine.clone(), self.locks.clone(), self.requested_level)
    }

    /// Load the persisted header into the TCE, or create a fresh one. A
    /// persisted table that the TCE rejects (or that fails the capacity
    /// probe) is wiped together with every record that referenced it.
    pub fn init(&self, crypto_session: &CryptoSession) -> CdmResult<()> {
        info!(level = %self.security_level, "usage table init");

        let loaded = self.device_files.retrieve_usage_table_info().ok();
        if let Some((header, entry_info)) = loaded {
            info!(entries = entry_info.len(), "usage table loaded from store");
            {
                let mut inner = self.inner.lock().unwrap();
                inner.header = header.clone();
                inner.entry_info = entry_info;
            }
            let mut status = crypto_session.load_usage_table_header(&header);

            if status.is_ok() && self.size() > MIN_USAGE_ENTRIES_SUPPORTED {
                status = self.probe_add_delete();
            }

            if let Err(e) = status {
                warn!(error = %e, "stored usage table unusable, rebuilding");
                self.device_files.delete_all_licenses()?;
                self.device_files.delete_all_usage_info()?;
                self.device_files.delete_usage_table_info()?;
                let mut inner = self.inner.lock().unwrap();
                inner.entry_info.clear();
                inner.header = crypto_session.create_usage_table_header()?;
                self.persist(&inner)?;
            }
        } else {
            let mut inner = self.inner.lock().unwrap();
            inner.header = crypto_session.create_usage_table_header()?;
            self.persist(&inner)?;
        }

        self.inner.lock().unwrap().is_inited = true;
        Ok(())
    }

    /// Round-trip an add+delete through a scratch session to confirm the
    /// TCE can still manipulate the table.
    fn probe_add_delete(&self) -> CdmResult<()> {
        let probe_session = self.open_own_session()?;
        let entry_number =
            self.add_entry(&probe_session, true, PROBE_KEY_SET_ID, "")?;
        self.delete_entry(entry_number, &self.device_files)
    }

    /// Create a fresh entry bound to a license (`persistent_license`) or a
    /// streaming usage record. On resource exhaustion a random existing
    /// entry is evicted, up to three times.
    pub fn add_entry(
        &self,
        crypto_session: &CryptoSession,
        persistent_license: bool,
        key_set_id: &str,
        usage_info_file_name: &str,
    ) -> CdmResult<u32> {
        let mut status = crypto_session.create_usage_entry();
        for _ in 0..MAX_CRYPTO_RETRIES {
            if !matches!(status, Err(CdmError::InsufficientCryptoResources)) {
                break;
            }
            let Some(evictee) = random_in_range(self.size(), None) else {
                break;
            };
            if let Err(e) = self.delete_entry(evictee, &self.device_files) {
                warn!(entry = evictee, error = %e, "failed to evict usage entry");
            }
            status = crypto_session.create_usage_entry();
        }
        let entry_number = status?;

        let mut inner = self.inner.lock().unwrap();
        let size = inner.entry_info.len() as u32;
        if entry_number < size {
            return Err(CdmError::UsageInvalidEntry);
        }
        if entry_number > size {
            warn!(entry_number, size, "usage entry number overshoots table");
        }
        inner
            .entry_info
            .resize_with(entry_number as usize + 1, UsageEntryInfo::unknown);

        inner.entry_info[entry_number as usize] = UsageEntryInfo {
            storage_type: if persistent_license {
                UsageEntryStorageType::License
            } else {
                UsageEntryStorageType::UsageInfo
            },
            key_set_id: key_set_id.to_owned(),
            usage_info_file_name: if persistent_license {
                String::new()
            } else {
                usage_info_file_name.to_owned()
            },
        };

        info!(entry_number, "usage entry added");
        self.persist(&inner)?;
        Ok(entry_number)
    }

    /// Load a persisted entry blob into the live table. Same eviction
    /// discipline as `add_entry`, never evicting `entry_number` itself.
    pub fn load_entry(
        &self,
        crypto_session: &CryptoSession,
        usage_entry: &[u8],
        entry_number: u32,
    ) -> CdmResult<()> {
        {
            let inner = self.inner.lock().unwrap();
            if entry_number as usize >= inner.entry_info.len() {
                return Err(CdmError::UsageInvalidEntry);
            }
        }

        let mut status = crypto_session.load_usage_entry(entry_number, usage_entry);
        for _ in 0..MAX_CRYPTO_RETRIES {
            if !matches!(status, Err(CdmError::InsufficientCryptoResources)) {
                break;
            }
            let Some(evictee) = random_in_range(self.size(), Some(entry_number)) else {
                break;
            };
            if let Err(e) = self.delete_entry(evictee, &self.device_files) {
                warn!(entry = evictee, error = %e, "failed to evict usage entry");
            }
            status = crypto_session.load_usage_entry(entry_number, usage_entry);
        }
        status
    }

    /// Have the TCE rewrite the session's live entry; persists the updated
    /// header and returns the new entry blob for the caller to store with
    /// its owning record.
    pub fn update_entry(&self, crypto_session: &CryptoSession) -> CdmResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let (header, entry) = crypto_session.update_usage_entry()?;
        inner.header = header;
        self.persist(&inner)?;
        Ok(entry)
    }

    /// Delete an entry: move the highest-numbered valid entry into the
    /// hole, rewrite its owning record, then shrink the table. The caller
    /// must ensure no open crypto session still references `entry_number`.
    pub fn delete_entry(&self, entry_number: u32, handle: &DeviceFiles) -> CdmResult<()> {
        info!(entry_number, "usage entry delete");
        let mut inner = self.inner.lock().unwrap();
        if entry_number as usize >= inner.entry_info.len() {
            return Err(CdmError::UsageInvalidEntry);
        }

        // Find the last entry with a retrievable owning record to swap into
        // the hole.
        let mut swap_entry_number = inner.entry_info.len() as u32 - 1;
        let mut swap_usage_entry = None;
        while swap_entry_number > entry_number {
            match inner.entry_info[swap_entry_number as usize].storage_type {
                UsageEntryStorageType::License | UsageEntryStorageType::UsageInfo => {
                    if let Ok(entry) = self.get_entry(&inner, swap_entry_number, handle) {
                        swap_usage_entry = Some(entry);
                        break;
                    }
                }
                UsageEntryStorageType::Unknown => {}
            }
            swap_entry_number -= 1;
        }

        let mut entries_to_delete = inner.entry_info.len() as u32 - entry_number;

        if let Some(swap_entry) = swap_usage_entry {
            match self.move_entry(&mut inner, swap_entry_number, &swap_entry, entry_number, handle)
            {
                Ok(()) => {
                    entries_to_delete = inner.entry_info.len() as u32 - swap_entry_number;
                }
                Err(e) => {
                    // Could not move: blank the hole and shrink down to
                    // just past the stuck entry.
                    warn!(error = %e, "usage entry move failed");
                    inner.entry_info[entry_number as usize] = UsageEntryInfo::unknown();
                    if inner.entry_info.len() as u32 - 1 == swap_entry_number {
                        self.persist(&inner)?;
                    } else {
                        let count = inner.entry_info.len() as u32 - swap_entry_number - 1;
                        self.shrink(&mut inner, count)?;
                    }
                    return Ok(());
                }
            }
        }
        self.shrink(&mut inner, entries_to_delete)
    }

    fn move_entry(
        &self,
        inner: &mut Inner,
        from: u32,
        from_usage_entry: &[u8],
        to: u32,
        handle: &DeviceFiles,
    ) -> CdmResult<()> {
        info!(from, to, "usage entry move");

        // Entries cannot be reparented by a session that already holds
        // them; use a scratch session.
        let crypto_session = self.open_own_session()?;
        crypto_session.load_usage_entry(from, from_usage_entry)?;
        crypto_session.move_usage_entry(to)?;

        inner.entry_info[to as usize] = inner.entry_info[from as usize].clone();

        let (header, usage_entry) = crypto_session.update_usage_entry()?;
        inner.header = header;
        self.persist(inner)?;

        self.store_entry(inner, to, handle, &usage_entry)
    }

    /// Read back the persisted entry blob for `entry_number`, verifying the
    /// record still claims that number.
    fn get_entry(
        &self,
        inner: &Inner,
        entry_number: u32,
        handle: &DeviceFiles,
    ) -> CdmResult<Vec<u8>> {
        let info = &inner.entry_info[entry_number as usize];
        let (usage_entry, stored_number) = match info.storage_type {
            UsageEntryStorageType::License => {
                let record = handle.retrieve_license(&info.key_set_id)?;
                (record.usage_entry, record.usage_entry_number)
            }
            UsageEntryStorageType::UsageInfo => {
                let record = handle
                    .find_usage_record_by_key_set_id(&info.usage_info_file_name, &info.key_set_id)?;
                (record.usage_entry, record.usage_entry_number)
            }
            UsageEntryStorageType::Unknown => return Err(CdmError::UsageInvalidEntry),
        };
        if stored_number != entry_number {
            return Err(CdmError::UsageEntryNumberMismatch);
        }
        Ok(usage_entry)
    }

    /// Rewrite the owning record of `entry_number` with a new entry blob
    /// (after a move changed its number).
    fn store_entry(
        &self,
        inner: &Inner,
        entry_number: u32,
        handle: &DeviceFiles,
        usage_entry: &[u8],
    ) -> CdmResult<()> {
        let info = &inner.entry_info[entry_number as usize];
        match info.storage_type {
            UsageEntryStorageType::License => {
                let mut record = handle.retrieve_license(&info.key_set_id)?;
                record.usage_entry = usage_entry.to_vec();
                record.usage_entry_number = entry_number;
                handle.store_license(&info.key_set_id, &record)
            }
            UsageEntryStorageType::UsageInfo => {
                let mut record = handle
                    .find_usage_record_by_key_set_id(&info.usage_info_file_name, &info.key_set_id)?;
                record.usage_entry = usage_entry.to_vec();
                record.usage_entry_number = entry_number;
                handle.add_usage_record(&info.usage_info_file_name, record)
            }
            UsageEntryStorageType::Unknown => Err(CdmError::UsageInvalidEntry),
        }
    }

    fn shrink(
        &self,
        inner: &mut Inner,
        number_of_entries_to_delete: u32,
    ) -> CdmResult<()> {
        info!(
            count = number_of_entries_to_delete,
            size = inner.entry_info.len(),
            "usage table shrink"
        );
        if inner.entry_info.is_empty() {
            return Err(CdmError::NoUsageEntries);
        }
        if (inner.entry_info.len() as u32) < number_of_entries_to_delete {
            warn!("shrink request exceeds table size");
            return Ok(());
        }
        if number_of_entries_to_delete == 0 {
            return Ok(());
        }

        let new_len = inner.entry_info.len() - number_of_entries_to_delete as usize;
        inner.entry_info.truncate(new_len);

        let crypto_session = self.open_own_session()?;
        inner.header = crypto_session.shrink_usage_table_header(new_len as u32)?;
        self.persist(inner)
    }

    fn persist(&self, inner: &Inner) -> CdmResult<()> {
        self.device_files
            .store_usage_table_info(&inner.header, &inner.entry_info)
    }

    #[cfg(test)]
    pub(crate) fn entry_info_for_test(&self) -> Vec<UsageEntryInfo> {
        self.inner.lock().unwrap().entry_info.clone()
    }
}

fn random_in_range(upper_bound_exclusive: usize, exclude: Option<u32>) -> Option<u32> {
    let candidates: Vec<u32> = (0..upper_bound_exclusive as u32)
        .filter(|n| Some(*n) != exclude)
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[index])
}
