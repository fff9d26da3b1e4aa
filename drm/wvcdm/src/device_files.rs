use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use prost::Message;
use sha2::{Digest, Sha256};
use wvcdm_proto::storage;

use crate::error::{CdmError, CdmResult};
use crate::file_store::FileStore;
use crate::types::{
    AppParameterMap, HlsMethod, KeySetId, OfflineLicenseState, SecurityLevel,
};

const CERTIFICATE_FILE_NAME: &str = "cert.bin";
const USAGE_TABLE_FILE_NAME: &str = "usage_tbl.bin";
const LICENSE_FILE_EXTENSION: &str = ".lic";
const HLS_FILE_EXTENSION: &str = ".hls";
const USAGE_INFO_FILE_PREFIX: &str = "usage_info_";

/// Key set ids handed out but not yet persisted, shared process-wide so two
/// concurrent sessions cannot pick the same fresh id.
#[derive(Default)]
pub struct ReservedKeySetIds {
    ids: Mutex<HashSet<KeySetId>>,
}

impl ReservedKeySetIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already reserved.
    pub fn reserve(&self, key_set_id: &str) -> bool {
        self.ids.lock().unwrap().insert(key_set_id.to_owned())
    }

    pub fn unreserve(&self, key_set_id: &str) {
        self.ids.lock().unwrap().remove(key_set_id);
    }

    pub fn contains(&self, key_set_id: &str) -> bool {
        self.ids.lock().unwrap().contains(key_set_id)
    }
}

/// Everything persisted for one offline license (or one releasing secure
/// stop that shares the same record shape).
#[derive(Default, Debug, Clone)]
pub struct LicenseRecord {
    pub state: OfflineLicenseState,
    pub pssh_data: Vec<u8>,
    pub key_request: Vec<u8>,
    pub key_response: Vec<u8>,
    pub renewal_request: Vec<u8>,
    pub renewal_response: Vec<u8>,
    pub release_server_url: String,
    pub playback_start_time: i64,
    pub last_playback_time: i64,
    pub grace_period_end_time: i64,
    pub app_parameters: AppParameterMap,
    pub usage_entry: Vec<u8>,
    pub usage_entry_number: u32,
}

/// One streaming-usage record (secure stop) inside a per-app usage file.
#[derive(Default, Debug, Clone)]
pub struct UsageRecord {
    pub provider_session_token: Vec<u8>,
    pub license_request: Vec<u8>,
    pub license_response: Vec<u8>,
    pub key_set_id: KeySetId,
    pub usage_entry: Vec<u8>,
    pub usage_entry_number: u32,
}

/// How a usage entry's owning record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEntryStorageType {
    License,
    UsageInfo,
    Unknown,
}

/// Reverse-lookup info for one usage entry slot, stored alongside the
/// usage table header.
#[derive(Debug, Clone)]
pub struct UsageEntryInfo {
    pub storage_type: UsageEntryStorageType,
    pub key_set_id: KeySetId,
    pub usage_info_file_name: String,
}

impl UsageEntryInfo {
    pub fn unknown() -> Self {
        UsageEntryInfo {
            storage_type: UsageEntryStorageType::Unknown,
            key_set_id: String::new(),
            usage_info_file_name: String::new(),
        }
    }
}

/// Typed, hash-verified records over a [`FileStore`], scoped to one
/// security level.
pub struct DeviceFiles {
    store: Arc<dyn FileStore>,
    level: SecurityLevel,
    reserved: Arc<ReservedKeySetIds>,
}

impl DeviceFiles {
    pub fn new(
        store: Arc<dyn FileStore>,
        level: SecurityLevel,
        reserved: Arc<ReservedKeySetIds>,
    ) -> Self {
        DeviceFiles {
            store,
            level,
            reserved,
        }
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.level
    }

    /// `usage_info_<sha256(app_id)>`, the per-app streaming-usage file.
    pub fn usage_info_file_name(app_id: &str) -> String {
        let digest = Sha256::digest(app_id.as_bytes());
        format!("{USAGE_INFO_FILE_PREFIX}{}", hex::encode(digest))
    }

    pub fn license_file_name(key_set_id: &str) -> String {
        format!("{key_set_id}{LICENSE_FILE_EXTENSION}")
    }

    // ── Device certificate ────────────────────────────────────────────

    pub fn store_certificate(&self, certificate: &[u8], wrapped_private_key: &[u8]) -> CdmResult<()> {
        let file = storage::File {
            r#type: Some(storage::file::FileType::DeviceCertificate as i32),
            device_certificate: Some(storage::DeviceCertificateFile {
                certificate: Some(certificate.to_vec()),
                wrapped_private_key: Some(wrapped_private_key.to_vec()),
            }),
            ..Default::default()
        };
        self.store_hashed(CERTIFICATE_FILE_NAME, &file)
    }

    /// Returns (certificate, wrapped private key).
    pub fn retrieve_certificate(&self) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        let file = self.retrieve_hashed(CERTIFICATE_FILE_NAME, storage::file::FileType::DeviceCertificate)?;
        let record = file.device_certificate.ok_or(CdmError::FileParse)?;
        Ok((
            record.certificate.unwrap_or_default(),
            record.wrapped_private_key.unwrap_or_default(),
        ))
    }

    pub fn has_certificate(&self) -> bool {
        self.store.exists(self.level, CERTIFICATE_FILE_NAME)
    }

    pub fn remove_certificate(&self) -> CdmResult<()> {
        self.store.remove(self.level, CERTIFICATE_FILE_NAME)
    }

    // ── Licenses ──────────────────────────────────────────────────────

    pub fn store_license(&self, key_set_id: &str, record: &LicenseRecord) -> CdmResult<()> {
        let state = match record.state {
            OfflineLicenseState::Releasing => storage::license_file::LicenseState::Releasing,
            _ => storage::license_file::LicenseState::Active,
        };
        let file = storage::File {
            r#type: Some(storage::file::FileType::License as i32),
            license: Some(storage::LicenseFile {
                state: Some(state as i32),
                pssh_data: Some(record.pssh_data.clone()),
                license_request: Some(record.key_request.clone()),
                license: Some(record.key_response.clone()),
                renewal_request: Some(record.renewal_request.clone()),
                renewal: Some(record.renewal_response.clone()),
                release_server_url: Some(record.release_server_url.clone()),
                playback_start_time: Some(record.playback_start_time),
                last_playback_time: Some(record.last_playback_time),
                grace_period_end_time: Some(record.grace_period_end_time),
                app_parameters: record
                    .app_parameters
                    .iter()
                    .map(|(name, value)| storage::NameValue {
                        name: Some(name.clone()),
                        value: Some(value.clone()),
                    })
                    .collect(),
                usage_entry: Some(record.usage_entry.clone()),
                usage_entry_number: Some(record.usage_entry_number),
            }),
            ..Default::default()
        };
        self.store_hashed(&Self::license_file_name(key_set_id), &file)
    }

    pub fn retrieve_license(&self, key_set_id: &str) -> CdmResult<LicenseRecord> {
        let file = self.retrieve_hashed(
            &Self::license_file_name(key_set_id),
            storage::file::FileType::License,
        )?;
        let lic = file.license.ok_or(CdmError::FileParse)?;
        let state = match lic.state.and_then(|s| storage::license_file::LicenseState::try_from(s).ok())
        {
            Some(storage::license_file::LicenseState::Active) => OfflineLicenseState::Active,
            Some(storage::license_file::LicenseState::Releasing) => OfflineLicenseState::Releasing,
            None => OfflineLicenseState::Unknown,
        };
        Ok(LicenseRecord {
            state,
            pssh_data: lic.pssh_data.unwrap_or_default(),
            key_request: lic.license_request.unwrap_or_default(),
            key_response: lic.license.unwrap_or_default(),
            renewal_request: lic.renewal_request.unwrap_or_default(),
            renewal_response: lic.renewal.unwrap_or_default(),
            release_server_url: lic.release_server_url.unwrap_or_default(),
            playback_start_time: lic.playback_start_time.unwrap_or_default(),
            last_playback_time: lic.last_playback_time.unwrap_or_default(),
            grace_period_end_time: lic.grace_period_end_time.unwrap_or_default(),
            app_parameters: lic
                .app_parameters
                .into_iter()
                .map(|nv| (nv.name.unwrap_or_default(), nv.value.unwrap_or_default()))
                .collect(),
            usage_entry: lic.usage_entry.unwrap_or_default(),
            usage_entry_number: lic.usage_entry_number.unwrap_or_default(),
        })
    }

    pub fn delete_license(&self, key_set_id: &str) -> CdmResult<()> {
        self.store
            .remove(self.level, &Self::license_file_name(key_set_id))
    }

    pub fn license_exists(&self, key_set_id: &str) -> bool {
        self.reserved.contains(key_set_id)
            || self
                .store
                .exists(self.level, &Self::license_file_name(key_set_id))
    }

    pub fn reserve_key_set_id(&self, key_set_id: &str) -> bool {
        self.reserved.reserve(key_set_id)
    }

    pub fn unreserve_key_set_id(&self, key_set_id: &str) {
        self.reserved.unreserve(key_set_id);
    }

    pub fn list_licenses(&self) -> CdmResult<Vec<KeySetId>> {
        Ok(self
            .store
            .list(self.level)?
            .into_iter()
            .filter_map(|name| {
                name.strip_suffix(LICENSE_FILE_EXTENSION)
                    .map(str::to_owned)
            })
            .collect())
    }

    pub fn delete_all_licenses(&self) -> CdmResult<()> {
        for ksid in self.list_licenses()? {
            self.delete_license(&ksid)?;
        }
        Ok(())
    }

    pub fn delete_all_files(&self) -> CdmResult<()> {
        for name in self.store.list(self.level)? {
            self.store.remove(self.level, &name)?;
        }
        Ok(())
    }

    // ── Streaming usage records ───────────────────────────────────────

    pub fn add_usage_record(&self, file_name: &str, record: UsageRecord) -> CdmResult<()> {
        let mut records = self.usage_records(file_name).unwrap_or_default();
        records.retain(|r| r.provider_session_token != record.provider_session_token);
        records.push(record);
        self.write_usage_records(file_name, &records)
    }

    /// Replace the record matching `token`; errors if absent.
    pub fn update_usage_record(
        &self,
        file_name: &str,
        token: &[u8],
        record: UsageRecord,
    ) -> CdmResult<()> {
        let mut records = self.usage_records(file_name)?;
        let slot = records
            .iter_mut()
            .find(|r| r.provider_session_token == token)
            .ok_or(CdmError::UsageInfoNotFound)?;
        *slot = record;
        self.write_usage_records(file_name, &records)
    }

    pub fn usage_records(&self, file_name: &str) -> CdmResult<Vec<UsageRecord>> {
        if !self.store.exists(self.level, file_name) {
            return Ok(Vec::new());
        }
        let file = self.retrieve_hashed(file_name, storage::file::FileType::UsageInfo)?;
        let info = file.usage_info.ok_or(CdmError::FileParse)?;
        Ok(info
            .sessions
            .into_iter()
            .map(|s| UsageRecord {
                provider_session_token: s.token.unwrap_or_default(),
                license_request: s.license_request.unwrap_or_default(),
                license_response: s.license.unwrap_or_default(),
                key_set_id: s.key_set_id.unwrap_or_default(),
                usage_entry: s.usage_entry.unwrap_or_default(),
                usage_entry_number: s.usage_entry_number.unwrap_or_default(),
            })
            .collect())
    }

    pub fn find_usage_record_by_token(
        &self,
        file_name: &str,
        token: &[u8],
    ) -> CdmResult<UsageRecord> {
        self.usage_records(file_name)?
            .into_iter()
            .find(|r| r.provider_session_token == token)
            .ok_or(CdmError::UsageInfoNotFound)
    }

    pub fn find_usage_record_by_key_set_id(
        &self,
        file_name: &str,
        key_set_id: &str,
    ) -> CdmResult<UsageRecord> {
        self.usage_records(file_name)?
            .into_iter()
            .find(|r| r.key_set_id == key_set_id)
            .ok_or(CdmError::UsageInfoNotFound)
    }

    pub fn delete_usage_record(&self, file_name: &str, token: &[u8]) -> CdmResult<()> {
        let mut records = self.usage_records(file_name)?;
        let before = records.len();
        records.retain(|r| r.provider_session_token != token);
        if records.len() == before {
            return Err(CdmError::UsageInfoNotFound);
        }
        if records.is_empty() {
            self.store.remove(self.level, file_name)
        } else {
            self.write_usage_records(file_name, &records)
        }
    }

    /// Delete the whole per-app usage file; returns the tokens it held.
    pub fn delete_all_usage_records(&self, file_name: &str) -> CdmResult<Vec<Vec<u8>>> {
        let tokens = self
            .usage_records(file_name)
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.provider_session_token)
            .collect();
        self.store.remove(self.level, file_name)?;
        Ok(tokens)
    }

    pub fn list_usage_info_files(&self) -> CdmResult<Vec<String>> {
        Ok(self
            .store
            .list(self.level)?
            .into_iter()
            .filter(|name| name.starts_with(USAGE_INFO_FILE_PREFIX))
            .collect())
    }

    pub fn delete_all_usage_info(&self) -> CdmResult<()> {
        for name in self.list_usage_info_files()? {
            self.store.remove(self.level, &name)?;
        }
        Ok(())
    }

    /// (key set ids, provider session tokens) for one app's usage file.
    pub fn list_usage_ids(&self, file_name: &str) -> CdmResult<(Vec<KeySetId>, Vec<Vec<u8>>)> {
        let records = self.usage_records(file_name)?;
        let ksids = records.iter().map(|r| r.key_set_id.clone()).collect();
        let tokens = records
            .into_iter()
            .map(|r| r.provider_session_token)
            .collect();
        Ok((ksids, tokens))
    }

    // ── Usage table header ────────────────────────────────────────────

    pub fn store_usage_table_info(
        &self,
        header: &[u8],
        entry_info: &[UsageEntryInfo],
    ) -> CdmResult<()> {
        let file = storage::File {
            r#type: Some(storage::file::FileType::UsageTableInfo as i32),
            usage_table_info: Some(storage::UsageTableInfo {
                usage_table_header: Some(header.to_vec()),
                usage_entry_info: entry_info
                    .iter()
                    .map(|info| {
                        let storage_type = match info.storage_type {
                            UsageEntryStorageType::License => {
                                storage::usage_table_info::usage_entry_info::UsageEntryStorage::License
                            }
                            UsageEntryStorageType::UsageInfo => {
                                storage::usage_table_info::usage_entry_info::UsageEntryStorage::UsageInfo
                            }
                            UsageEntryStorageType::Unknown => {
                                storage::usage_table_info::usage_entry_info::UsageEntryStorage::Unknown
                            }
                        };
                        storage::usage_table_info::UsageEntryInfo {
                            storage: Some(storage_type as i32),
                            key_set_id: Some(info.key_set_id.clone()),
                            usage_info_file_name: Some(info.usage_info_file_name.clone()),
                        }
                    })
                    .collect(),
            }),
            ..Default::default()
        };
        self.store_hashed(USAGE_TABLE_FILE_NAME, &file)
    }

    pub fn retrieve_usage_table_info(&self) -> CdmResult<(Vec<u8>, Vec<UsageEntryInfo>)> {
        let file =
            self.retrieve_hashed(USAGE_TABLE_FILE_NAME, storage::file::FileType::UsageTableInfo)?;
        let info = file.usage_table_info.ok_or(CdmError::FileParse)?;
        let entries = info
            .usage_entry_info
            .into_iter()
            .map(|e| {
                use storage::usage_table_info::usage_entry_info::UsageEntryStorage;
                let storage_type = match e.storage.and_then(|s| UsageEntryStorage::try_from(s).ok())
                {
                    Some(UsageEntryStorage::License) => UsageEntryStorageType::License,
                    Some(UsageEntryStorage::UsageInfo) => UsageEntryStorageType::UsageInfo,
                    _ => UsageEntryStorageType::Unknown,
                };
                UsageEntryInfo {
                    storage_type,
                    key_set_id: e.key_set_id.unwrap_or_default(),
                    usage_info_file_name: e.usage_info_file_name.unwrap_or_default(),
                }
            })
            .collect();
        Ok((info.usage_table_header.unwrap_or_default(), entries))
    }

    pub fn has_usage_table_info(&self) -> bool {
        self.store.exists(self.level, USAGE_TABLE_FILE_NAME)
    }

    pub fn delete_usage_table_info(&self) -> CdmResult<()> {
        self.store.remove(self.level, USAGE_TABLE_FILE_NAME)
    }

    // ── HLS attributes ────────────────────────────────────────────────

    pub fn store_hls_attributes(
        &self,
        key_set_id: &str,
        method: HlsMethod,
        media_segment_iv: &[u8],
    ) -> CdmResult<()> {
        let proto_method = match method {
            HlsMethod::SampleAes => storage::hls_attributes::Method::SampleAes,
            _ => storage::hls_attributes::Method::Aes128,
        };
        let file = storage::File {
            r#type: Some(storage::file::FileType::HlsAttributes as i32),
            hls_attributes: Some(storage::HlsAttributes {
                method: Some(proto_method as i32),
                media_segment_iv: Some(media_segment_iv.to_vec()),
            }),
            ..Default::default()
        };
        self.store_hashed(&format!("{key_set_id}{HLS_FILE_EXTENSION}"), &file)
    }

    pub fn retrieve_hls_attributes(&self, key_set_id: &str) -> CdmResult<(HlsMethod, Vec<u8>)> {
        let file = self.retrieve_hashed(
            &format!("{key_set_id}{HLS_FILE_EXTENSION}"),
            storage::file::FileType::HlsAttributes,
        )?;
        let attrs = file.hls_attributes.ok_or(CdmError::FileParse)?;
        let method = match attrs
            .method
            .and_then(|m| storage::hls_attributes::Method::try_from(m).ok())
        {
            Some(storage::hls_attributes::Method::SampleAes) => HlsMethod::SampleAes,
            Some(storage::hls_attributes::Method::Aes128) => HlsMethod::Aes128,
            None => HlsMethod::None,
        };
        Ok((method, attrs.media_segment_iv.unwrap_or_default()))
    }

    pub fn delete_hls_attributes(&self, key_set_id: &str) -> CdmResult<()> {
        self.store
            .remove(self.level, &format!("{key_set_id}{HLS_FILE_EXTENSION}"))
    }

    // ── Hash-wrapped file helpers ─────────────────────────────────────

    fn store_hashed(&self, name: &str, file: &storage::File) -> CdmResult<()> {
        let bytes = file.encode_to_vec();
        let hash = Sha256::digest(&bytes).to_vec();
        let wrapper = storage::HashedFile {
            file: Some(bytes),
            hash: Some(hash),
        };
        self.store.store(self.level, name, &wrapper.encode_to_vec())
    }

    fn retrieve_hashed(
        &self,
        name: &str,
        expected: storage::file::FileType,
    ) -> CdmResult<storage::File> {
        let raw = self.store.retrieve(self.level, name)?;
        let wrapper = storage::HashedFile::decode(raw.as_slice())?;
        let bytes = wrapper.file.unwrap_or_default();
        let hash = wrapper.hash.unwrap_or_default();
        if Sha256::digest(&bytes).as_slice() != hash.as_slice() {
            return Err(CdmError::FileHashMismatch);
        }
        let file = storage::File::decode(bytes.as_slice())?;
        if file.r#type != Some(expected as i32) {
            return Err(CdmError::IncorrectFileType);
        }
        Ok(file)
    }

    fn write_usage_records(&self, file_name: &str, records: &[UsageRecord]) -> CdmResult<()> {
        let file = storage::File {
            r#type: Some(storage::file::FileType::UsageInfo as i32),
            usage_info: Some(storage::UsageInfo {
                sessions: records
                    .iter()
                    .map(|r| storage::usage_info::ProviderSession {
                        token: Some(r.provider_session_token.clone()),
                        license_request: Some(r.license_request.clone()),
                        license: Some(r.license_response.clone()),
                        key_set_id: Some(r.key_set_id.clone()),
                        usage_entry: Some(r.usage_entry.clone()),
                        usage_entry_number: Some(r.usage_entry_number),
                    })
                    .collect(),
            }),
            ..Default::default()
        };
        self.store_hashed(file_name, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::MemoryStore;

    fn device_files() -> (Arc<MemoryStore>, DeviceFiles) {
        let store = Arc::new(MemoryStore::new());
        let files = DeviceFiles::new(
            store.clone(),
            SecurityLevel::L1,
            Arc::new(ReservedKeySetIds::new()),
        );
        (store, files)
    }

    #[test]
    fn certificate_round_trip() {
        let (_, files) = device_files();
        assert!(!files.has_certificate());
        files.store_certificate(b"cert", b"wrapped").unwrap();
        assert!(files.has_certificate());
        let (cert, key) = files.retrieve_certificate().unwrap();
        assert_eq!(cert, b"cert");
        assert_eq!(key, b"wrapped");
        files.remove_certificate().unwrap();
        assert!(!files.has_certificate());
    }

    #[test]
    fn license_round_trip_preserves_every_field() {
        let (_, files) = device_files();
        let mut app_parameters = AppParameterMap::new();
        app_parameters.insert("package".into(), "com.example.app".into());
        let record = LicenseRecord {
            state: OfflineLicenseState::Releasing,
            pssh_data: b"pssh".to_vec(),
            key_request: b"request".to_vec(),
            key_response: b"response".to_vec(),
            renewal_request: b"renew-req".to_vec(),
            renewal_response: b"renew-resp".to_vec(),
            release_server_url: "https://license.example.com".into(),
            playback_start_time: 1000,
            last_playback_time: 1010,
            grace_period_end_time: 1050,
            app_parameters,
            usage_entry: b"entry".to_vec(),
            usage_entry_number: 7,
        };
        files.store_license("ks0102030405", &record).unwrap();
        let restored = files.retrieve_license("ks0102030405").unwrap();
        assert_eq!(restored.state, OfflineLicenseState::Releasing);
        assert_eq!(restored.pssh_data, record.pssh_data);
        assert_eq!(restored.key_request, record.key_request);
        assert_eq!(restored.key_response, record.key_response);
        assert_eq!(restored.renewal_request, record.renewal_request);
        assert_eq!(restored.renewal_response, record.renewal_response);
        assert_eq!(restored.release_server_url, record.release_server_url);
        assert_eq!(restored.playback_start_time, 1000);
        assert_eq!(restored.last_playback_time, 1010);
        assert_eq!(restored.grace_period_end_time, 1050);
        assert_eq!(
            restored.app_parameters.get("package").map(String::as_str),
            Some("com.example.app")
        );
        assert_eq!(restored.usage_entry, record.usage_entry);
        assert_eq!(restored.usage_entry_number, 7);

        assert_eq!(files.list_licenses().unwrap(), vec!["ks0102030405"]);
    }

    #[test]
    fn tampered_file_fails_hash_check() {
        let (store, files) = device_files();
        files.store_certificate(b"cert", b"wrapped").unwrap();
        let mut raw = store.retrieve(SecurityLevel::L1, "cert.bin").unwrap();
        // Flip a byte inside the wrapped payload.
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        store.store(SecurityLevel::L1, "cert.bin", &raw).unwrap();
        assert!(matches!(
            files.retrieve_certificate(),
            Err(CdmError::FileHashMismatch)
        ));
    }

    #[test]
    fn usage_records_add_find_delete() {
        let (_, files) = device_files();
        let file_name = DeviceFiles::usage_info_file_name("app");
        let record = UsageRecord {
            provider_session_token: b"pst_xyz".to_vec(),
            license_request: b"req".to_vec(),
            license_response: b"resp".to_vec(),
            key_set_id: "ksaabbccddeeff".into(),
            usage_entry: b"entry".to_vec(),
            usage_entry_number: 0,
        };
        files.add_usage_record(&file_name, record.clone()).unwrap();

        let found = files
            .find_usage_record_by_token(&file_name, b"pst_xyz")
            .unwrap();
        assert_eq!(found.key_set_id, "ksaabbccddeeff");
        let found = files
            .find_usage_record_by_key_set_id(&file_name, "ksaabbccddeeff")
            .unwrap();
        assert_eq!(found.provider_session_token, b"pst_xyz");

        let (ksids, tokens) = files.list_usage_ids(&file_name).unwrap();
        assert_eq!(ksids, vec!["ksaabbccddeeff"]);
        assert_eq!(tokens, vec![b"pst_xyz".to_vec()]);

        files.delete_usage_record(&file_name, b"pst_xyz").unwrap();
        assert!(matches!(
            files.find_usage_record_by_token(&file_name, b"pst_xyz"),
            Err(CdmError::UsageInfoNotFound)
        ));
    }

    #[test]
    fn usage_table_info_round_trip() {
        let (_, files) = device_files();
        let entries = vec![
            UsageEntryInfo {
                storage_type: UsageEntryStorageType::License,
                key_set_id: "ks00".into(),
                usage_info_file_name: String::new(),
            },
            UsageEntryInfo::unknown(),
        ];
        files.store_usage_table_info(b"header", &entries).unwrap();
        let (header, restored) = files.retrieve_usage_table_info().unwrap();
        assert_eq!(header, b"header");
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].storage_type, UsageEntryStorageType::License);
        assert_eq!(restored[0].key_set_id, "ks00");
        assert_eq!(restored[1].storage_type, UsageEntryStorageType::Unknown);
    }

    #[test]
    fn reserved_ids_block_collisions() {
        let (_, files) = device_files();
        assert!(files.reserve_key_set_id("ks0102030405"));
        assert!(!files.reserve_key_set_id("ks0102030405"));
        assert!(files.license_exists("ks0102030405"));
        files.unreserve_key_set_id("ks0102030405");
        assert!(!files.license_exists("ks0102030405"));
    }

    #[test]
    fn hls_attributes_round_trip() {
        let (_, files) = device_files();
        files
            .store_hls_attributes("ksaa", HlsMethod::SampleAes, &[9u8; 16])
            .unwrap();
        let (method, iv) = files.retrieve_hls_attributes("ksaa").unwrap();
        assert_eq!(method, HlsMethod::SampleAes);
        assert_eq!(iv, vec![9u8; 16]);
        files.delete_hls_attributes("ksaa").unwrap();
        assert!(files.retrieve_hls_attributes("ksaa").is_err());
    }
}
