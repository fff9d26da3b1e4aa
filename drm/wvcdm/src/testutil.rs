//! Scripted trusted-crypto-engine mock and protocol fixtures shared by the
//! crate's tests.

use std::sync::{Arc, Mutex};

use prost::Message;
use wvcdm_proto::license::KeyContainer;
use wvcdm_proto::license::key_container::KeyType as ProtoKeyType;
use wvcdm_proto::signed_message::MessageType;
use wvcdm_proto::{License, LicenseIdentification, SignedMessage};

use crate::error::{CdmError, CdmResult};
use crate::tce::{
    AnalogOutputCapabilities, CryptoSession, SupportedCertificateTypes, TceLocks, TceSession,
    TrustedCryptoEngine,
};
use crate::types::{
    ClientTokenType, CryptoKey, DecryptParams, EncryptionAlgorithm, HdcpVersion,
    LicenseKeyType, RequestedSecurityLevel, SecurityLevel, SigningAlgorithm, UsageDurationStatus,
    UsageReport, UsageSupportType,
};

pub const MOCK_NONCE: u32 = 0x49e8_1305;

/// Shared, scriptable state behind a [`MockTce`].
pub struct MockTceState {
    pub security_level: SecurityLevel,
    pub usage_support: UsageSupportType,
    pub provisioning_method: ClientTokenType,
    pub hdcp: (HdcpVersion, HdcpVersion),
    pub build_info: String,
    pub max_chunk_size: usize,
    pub next_nonce: u32,
    pub random_counter: u8,
    /// Times `create_usage_entry`/`load_usage_entry` fail with
    /// InsufficientCryptoResources before succeeding.
    pub insufficient_resource_failures: u32,
    /// Error every `load_certificate_private_key` call returns.
    pub load_certificate_error: Option<CdmError>,
    /// Error every `load_keys` call returns.
    pub load_keys_error: Option<CdmError>,
    /// Scripted usage report.
    pub usage_report: UsageReport,
    /// Live usage table emulation: number of live entries.
    pub usage_table_size: u32,
    pub header_generation: u64,
    pub usage_table_header_loaded: bool,

    // Call recording.
    pub loaded_keys: Vec<CryptoKey>,
    pub loaded_entitled_keys: Vec<CryptoKey>,
    pub refreshed: u32,
    pub released_tokens: Vec<Vec<u8>>,
    pub deactivated_tokens: Vec<Vec<u8>>,
    pub decrypt_chunk_sizes: Vec<usize>,
    pub decrypt_ivs: Vec<Vec<u8>>,
    pub moved_entries: Vec<(u32, u32)>,
    pub shrunk_to: Vec<u32>,
    pub srm_updates: Vec<Vec<u8>>,
    pub open_sessions: u32,
}

impl Default for MockTceState {
    fn default() -> Self {
        MockTceState {
            security_level: SecurityLevel::L1,
            usage_support: UsageSupportType::Entry,
            provisioning_method: ClientTokenType::Keybox,
            hdcp: (HdcpVersion::V2_2, HdcpVersion::V2_3),
            build_info: "mock-oemcrypto v15".to_owned(),
            max_chunk_size: 0,
            next_nonce: MOCK_NONCE,
            random_counter: 1,
            insufficient_resource_failures: 0,
            load_certificate_error: None,
            load_keys_error: None,
            usage_report: UsageReport {
                report: b"usage-report".to_vec(),
                duration_status: UsageDurationStatus::Invalid,
                seconds_since_started: 0,
                seconds_since_last_played: 0,
            },
            usage_table_size: 0,
            header_generation: 0,
            usage_table_header_loaded: false,
            loaded_keys: Vec::new(),
            loaded_entitled_keys: Vec::new(),
            refreshed: 0,
            released_tokens: Vec::new(),
            deactivated_tokens: Vec::new(),
            decrypt_chunk_sizes: Vec::new(),
            decrypt_ivs: Vec::new(),
            moved_entries: Vec::new(),
            shrunk_to: Vec::new(),
            srm_updates: Vec::new(),
            open_sessions: 0,
        }
    }
}

impl MockTceState {
    pub fn header_blob(&self) -> Vec<u8> {
        format!("hdr:{}:{}", self.header_generation, self.usage_table_size).into_bytes()
    }

    pub fn entry_blob(entry_number: u32) -> Vec<u8> {
        format!("entry:{entry_number}").into_bytes()
    }
}

#[derive(Default)]
pub struct MockTce {
    pub state: Arc<Mutex<MockTceState>>,
}

impl MockTce {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state(state: MockTceState) -> Arc<Self> {
        Arc::new(MockTce {
            state: Arc::new(Mutex::new(state)),
        })
    }
}

impl TrustedCryptoEngine for MockTce {
    fn open_session(&self, level: RequestedSecurityLevel) -> CdmResult<Box<dyn TceSession>> {
        let mut state = self.state.lock().unwrap();
        state.open_sessions += 1;
        let security_level = match level {
            RequestedSecurityLevel::Level3 => SecurityLevel::L3,
            RequestedSecurityLevel::Default => state.security_level,
        };
        let session_number = state.open_sessions as u64;
        drop(state);
        Ok(Box::new(MockTceSession {
            state: self.state.clone(),
            security_level,
            session_number,
            loaded_entry: None,
        }))
    }

    fn api_version(&self, _level: RequestedSecurityLevel) -> u32 {
        15
    }

    fn security_patch_level(&self, _level: RequestedSecurityLevel) -> u32 {
        1
    }

    fn build_information(&self, _level: RequestedSecurityLevel) -> String {
        self.state.lock().unwrap().build_info.clone()
    }

    fn usage_support_type(&self, _level: RequestedSecurityLevel) -> CdmResult<UsageSupportType> {
        Ok(self.state.lock().unwrap().usage_support)
    }

    fn provisioning_method(&self, _level: RequestedSecurityLevel) -> CdmResult<ClientTokenType> {
        Ok(self.state.lock().unwrap().provisioning_method)
    }

    fn supported_certificate_types(
        &self,
        _level: RequestedSecurityLevel,
    ) -> SupportedCertificateTypes {
        SupportedCertificateTypes {
            rsa_2048: true,
            ..Default::default()
        }
    }

    fn analog_output_capabilities(
        &self,
        _level: RequestedSecurityLevel,
    ) -> AnalogOutputCapabilities {
        AnalogOutputCapabilities::default()
    }

    fn srm_version(&self, _level: RequestedSecurityLevel) -> CdmResult<u32> {
        Ok(1)
    }

    fn is_srm_update_supported(&self, _level: RequestedSecurityLevel) -> bool {
        true
    }

    fn resource_rating_tier(&self, _level: RequestedSecurityLevel) -> u32 {
        1
    }

    fn max_number_of_sessions(&self, _level: RequestedSecurityLevel) -> usize {
        64
    }

    fn number_of_open_sessions(&self, _level: RequestedSecurityLevel) -> usize {
        self.state.lock().unwrap().open_sessions as usize
    }

    fn system_id(&self, _level: RequestedSecurityLevel) -> CdmResult<u32> {
        Ok(4242)
    }

    fn device_unique_id(&self, _level: RequestedSecurityLevel) -> CdmResult<Vec<u8>> {
        Ok(b"mock-device-id".to_vec())
    }

    fn provisioning_token(&self, _level: RequestedSecurityLevel) -> CdmResult<Vec<u8>> {
        Ok(b"mock-keybox-token".to_vec())
    }

    fn max_subsample_chunk_size(&self, _level: RequestedSecurityLevel) -> usize {
        self.state.lock().unwrap().max_chunk_size
    }
}

pub struct MockTceSession {
    state: Arc<Mutex<MockTceState>>,
    security_level: SecurityLevel,
    session_number: u64,
    loaded_entry: Option<u32>,
}

impl MockTceSession {
    fn state(&self) -> std::sync::MutexGuard<'_, MockTceState> {
        self.state.lock().unwrap()
    }
}

impl TceSession for MockTceSession {
    fn oec_session_id(&self) -> u64 {
        self.session_number
    }

    fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    fn request_id(&self) -> Vec<u8> {
        let mut id = vec![0u8; 16];
        id[0..8].copy_from_slice(&self.session_number.to_le_bytes());
        id
    }

    fn generate_nonce(&mut self) -> CdmResult<u32> {
        Ok(self.state().next_nonce)
    }

    fn get_random(&mut self, n: usize) -> CdmResult<Vec<u8>> {
        let mut state = self.state();
        let fill = state.random_counter;
        state.random_counter = state.random_counter.wrapping_add(1);
        Ok(vec![fill; n])
    }

    fn hdcp_capabilities(&self) -> CdmResult<(HdcpVersion, HdcpVersion)> {
        Ok(self.state().hdcp)
    }

    fn load_certificate_private_key(&mut self, _wrapped_key: &[u8]) -> CdmResult<()> {
        match &self.state().load_certificate_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn prepare_request(&mut self, message: &[u8], is_provisioning: bool) -> CdmResult<Vec<u8>> {
        let tag: &[u8] = if is_provisioning {
            b"prov-signature:"
        } else {
            b"request-signature:"
        };
        let mut signature = tag.to_vec();
        signature.extend_from_slice(&(message.len() as u32).to_be_bytes());
        Ok(signature)
    }

    fn prepare_renewal_request(&mut self, message: &[u8]) -> CdmResult<Vec<u8>> {
        let mut signature = b"renewal-signature:".to_vec();
        signature.extend_from_slice(&(message.len() as u32).to_be_bytes());
        Ok(signature)
    }

    fn generate_derived_keys(&mut self, _message: &[u8], _session_key: &[u8]) -> CdmResult<()> {
        Ok(())
    }

    fn rewrap_certificate(
        &mut self,
        _message: &[u8],
        _signature: &[u8],
        _nonce: &[u8],
        enc_private_key: &[u8],
        _iv: &[u8],
        _wrapping_key: &[u8],
    ) -> CdmResult<Vec<u8>> {
        let mut wrapped = b"rewrapped:".to_vec();
        wrapped.extend_from_slice(enc_private_key);
        Ok(wrapped)
    }

    fn load_keys(
        &mut self,
        _message: &[u8],
        _signature: &[u8],
        _mac_key_iv: &[u8],
        _mac_keys: &[u8],
        keys: &[CryptoKey],
        _provider_session_token: &[u8],
        _srm_requirement: &[u8],
        _key_type: LicenseKeyType,
    ) -> CdmResult<()> {
        let mut state = self.state();
        if let Some(e) = &state.load_keys_error {
            return Err(e.clone());
        }
        state.loaded_keys = keys.to_vec();
        Ok(())
    }

    fn load_entitled_content_keys(&mut self, keys: &[CryptoKey]) -> CdmResult<()> {
        self.state().loaded_entitled_keys = keys.to_vec();
        Ok(())
    }

    fn refresh_keys(
        &mut self,
        _message: &[u8],
        _signature: &[u8],
        _keys: &[CryptoKey],
    ) -> CdmResult<()> {
        self.state().refreshed += 1;
        Ok(())
    }

    fn decrypt(&mut self, params: &DecryptParams) -> CdmResult<Vec<u8>> {
        let mut state = self.state();
        state.decrypt_chunk_sizes.push(params.input.len());
        state.decrypt_ivs.push(params.iv.to_vec());
        Ok(params.input.to_vec())
    }

    fn load_srm(&mut self, srm: &[u8]) -> CdmResult<()> {
        self.state().srm_updates.push(srm.to_vec());
        Ok(())
    }

    fn generic_encrypt(
        &mut self,
        input: &[u8],
        _key_id: &[u8],
        _iv: &[u8],
        _algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        Ok(input.iter().map(|b| b ^ 0x5a).collect())
    }

    fn generic_decrypt(
        &mut self,
        input: &[u8],
        _key_id: &[u8],
        _iv: &[u8],
        _algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        Ok(input.iter().map(|b| b ^ 0x5a).collect())
    }

    fn generic_sign(
        &mut self,
        message: &[u8],
        _key_id: &[u8],
        _algorithm: SigningAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        let mut signature = b"generic-signature:".to_vec();
        signature.extend_from_slice(&(message.len() as u32).to_be_bytes());
        Ok(signature)
    }

    fn generic_verify(
        &mut self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> CdmResult<()> {
        let expected = self.generic_sign(message, key_id, algorithm)?;
        if expected == signature {
            Ok(())
        } else {
            Err(CdmError::SignatureMismatch)
        }
    }

    fn create_usage_table_header(&mut self) -> CdmResult<Vec<u8>> {
        let mut state = self.state();
        state.usage_table_size = 0;
        state.header_generation += 1;
        state.usage_table_header_loaded = true;
        Ok(state.header_blob())
    }

    fn load_usage_table_header(&mut self, _header: &[u8]) -> CdmResult<()> {
        self.state().usage_table_header_loaded = true;
        Ok(())
    }

    fn create_usage_entry(&mut self) -> CdmResult<u32> {
        let mut state = self.state();
        if state.insufficient_resource_failures > 0 {
            state.insufficient_resource_failures -= 1;
            return Err(CdmError::InsufficientCryptoResources);
        }
        let entry_number = state.usage_table_size;
        state.usage_table_size += 1;
        drop(state);
        self.loaded_entry = Some(entry_number);
        Ok(entry_number)
    }

    fn load_usage_entry(&mut self, entry_number: u32, _entry: &[u8]) -> CdmResult<()> {
        let mut state = self.state();
        if state.insufficient_resource_failures > 0 {
            state.insufficient_resource_failures -= 1;
            return Err(CdmError::InsufficientCryptoResources);
        }
        drop(state);
        self.loaded_entry = Some(entry_number);
        Ok(())
    }

    fn update_usage_entry(&mut self) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        let entry = self.loaded_entry.ok_or(CdmError::NoUsageEntries)?;
        let mut state = self.state();
        state.header_generation += 1;
        Ok((state.header_blob(), MockTceState::entry_blob(entry)))
    }

    fn move_usage_entry(&mut self, to_entry_number: u32) -> CdmResult<()> {
        let from = self.loaded_entry.ok_or(CdmError::NoUsageEntries)?;
        self.state().moved_entries.push((from, to_entry_number));
        self.loaded_entry = Some(to_entry_number);
        Ok(())
    }

    fn shrink_usage_table_header(&mut self, new_entry_count: u32) -> CdmResult<Vec<u8>> {
        let mut state = self.state();
        state.usage_table_size = new_entry_count;
        state.header_generation += 1;
        state.shrunk_to.push(new_entry_count);
        Ok(state.header_blob())
    }

    fn copy_old_usage_entry(&mut self, _provider_session_token: &[u8]) -> CdmResult<()> {
        Ok(())
    }

    fn deactivate_usage_entry(&mut self, provider_session_token: &[u8]) -> CdmResult<()> {
        self.state()
            .deactivated_tokens
            .push(provider_session_token.to_vec());
        Ok(())
    }

    fn generate_usage_report(&mut self, _provider_session_token: &[u8]) -> CdmResult<UsageReport> {
        Ok(self.state().usage_report.clone())
    }

    fn release_usage_information(
        &mut self,
        _message: &[u8],
        _signature: &[u8],
        provider_session_token: &[u8],
    ) -> CdmResult<()> {
        self.state()
            .released_tokens
            .push(provider_session_token.to_vec());
        Ok(())
    }

    fn delete_usage_information(&mut self, _provider_session_token: &[u8]) -> CdmResult<()> {
        Ok(())
    }

    fn delete_all_usage_reports(&mut self) -> CdmResult<()> {
        let mut state = self.state();
        state.usage_table_size = 0;
        Ok(())
    }
}

/// A fresh crypto session over a fresh mock engine, for tests that only
/// need a handle.
pub fn open_mock_crypto_session() -> CryptoSession {
    let tce = MockTce::new();
    CryptoSession::open(tce, TceLocks::new(), RequestedSecurityLevel::Default).unwrap()
}

/// A license with one CONTENT key container per entry in `key_ids`.
pub fn test_license(
    policy: wvcdm_proto::license::Policy,
    license_start_time: i64,
    key_ids: &[Vec<u8>],
) -> License {
    License {
        id: Some(LicenseIdentification {
            request_id: Some(b"req-1".to_vec()),
            version: Some(1),
            r#type: Some(wvcdm_proto::LicenseType::Streaming as i32),
            ..Default::default()
        }),
        policy: Some(policy),
        key: key_ids
            .iter()
            .map(|id| KeyContainer {
                id: Some(id.clone()),
                iv: Some(vec![3u8; 16]),
                // 16 bytes of key material plus a full PKCS#5 padding block.
                key: Some(vec![7u8; 32]),
                r#type: Some(ProtoKeyType::Content as i32),
                ..Default::default()
            })
            .collect(),
        license_start_time: Some(license_start_time),
        ..Default::default()
    }
}

/// Wrap a license in a signed LICENSE response message.
pub fn signed_license_response(license: &License) -> Vec<u8> {
    SignedMessage {
        r#type: Some(MessageType::License as i32),
        msg: Some(license.encode_to_vec()),
        signature: Some(b"server-signature".to_vec()),
        session_key: Some(b"wrapped-session-key".to_vec()),
        ..Default::default()
    }
    .encode_to_vec()
}
