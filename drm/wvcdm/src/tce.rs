//! Boundary over the trusted crypto engine (TCE).
//!
//! The TCE holds every secret: device keys, derived session keys, content
//! keys, usage tables. The CDM core only routes wrapped material in and
//! ciphertext through. [`TrustedCryptoEngine`] covers device-wide queries
//! and session creation; [`TceSession`] covers everything scoped to one open
//! crypto session. [`CryptoSession`] layers the process-wide locking
//! contract and subsample chunking on top.

use std::sync::{Arc, Mutex, RwLock};

use crate::error::{CdmError, CdmResult};
use crate::types::{
    CipherMode, ClientTokenType, CryptoKey, DecryptParams, EncryptionAlgorithm, HdcpVersion,
    LicenseKeyType, RequestedSecurityLevel, SecurityLevel, SigningAlgorithm, UsageReport,
    UsageSupportType,
};

/// Certificate key types the device can be provisioned with.
#[derive(Default, Debug, Clone, Copy)]
pub struct SupportedCertificateTypes {
    pub rsa_2048: bool,
    pub rsa_3072: bool,
    pub rsa_cast: bool,
}

/// Analog output behavior of the device.
#[derive(Default, Debug, Clone, Copy)]
pub struct AnalogOutputCapabilities {
    pub supported: bool,
    pub can_disable: bool,
    pub supports_cgms_a: bool,
}

/// Device-wide TCE surface. Property queries are valid without any open
/// session.
pub trait TrustedCryptoEngine: Send + Sync {
    fn open_session(&self, level: RequestedSecurityLevel) -> CdmResult<Box<dyn TceSession>>;

    fn api_version(&self, level: RequestedSecurityLevel) -> u32;
    fn security_patch_level(&self, level: RequestedSecurityLevel) -> u32;
    fn build_information(&self, level: RequestedSecurityLevel) -> String;
    fn usage_support_type(&self, level: RequestedSecurityLevel) -> CdmResult<UsageSupportType>;
    fn provisioning_method(&self, level: RequestedSecurityLevel) -> CdmResult<ClientTokenType>;
    fn supported_certificate_types(
        &self,
        level: RequestedSecurityLevel,
    ) -> SupportedCertificateTypes;
    fn analog_output_capabilities(&self, level: RequestedSecurityLevel)
    -> AnalogOutputCapabilities;
    fn srm_version(&self, level: RequestedSecurityLevel) -> CdmResult<u32>;
    fn is_srm_update_supported(&self, level: RequestedSecurityLevel) -> bool;
    fn resource_rating_tier(&self, level: RequestedSecurityLevel) -> u32;
    fn max_number_of_sessions(&self, level: RequestedSecurityLevel) -> usize;
    fn number_of_open_sessions(&self, level: RequestedSecurityLevel) -> usize;
    fn system_id(&self, level: RequestedSecurityLevel) -> CdmResult<u32>;
    fn device_unique_id(&self, level: RequestedSecurityLevel) -> CdmResult<Vec<u8>>;
    /// Keybox or OEM certificate token presented before DRM-cert
    /// provisioning. Never the DRM certificate itself.
    fn provisioning_token(&self, level: RequestedSecurityLevel) -> CdmResult<Vec<u8>>;
    /// Largest encrypted subsample the device can decrypt in one call.
    /// 0 means unlimited.
    fn max_subsample_chunk_size(&self, level: RequestedSecurityLevel) -> usize;
}

/// One open TCE session.
#[allow(clippy::too_many_arguments)]
pub trait TceSession: Send {
    fn oec_session_id(&self) -> u64;
    fn security_level(&self) -> SecurityLevel;
    fn request_id(&self) -> Vec<u8>;

    fn generate_nonce(&mut self) -> CdmResult<u32>;
    fn get_random(&mut self, n: usize) -> CdmResult<Vec<u8>>;
    fn hdcp_capabilities(&self) -> CdmResult<(HdcpVersion, HdcpVersion)>;

    fn load_certificate_private_key(&mut self, wrapped_key: &[u8]) -> CdmResult<()>;
    /// Derive request keys and sign `message`. `is_provisioning` selects the
    /// provisioning key ladder.
    fn prepare_request(&mut self, message: &[u8], is_provisioning: bool) -> CdmResult<Vec<u8>>;
    fn prepare_renewal_request(&mut self, message: &[u8]) -> CdmResult<Vec<u8>>;
    fn generate_derived_keys(&mut self, message: &[u8], session_key: &[u8]) -> CdmResult<()>;
    fn rewrap_certificate(
        &mut self,
        message: &[u8],
        signature: &[u8],
        nonce: &[u8],
        enc_private_key: &[u8],
        iv: &[u8],
        wrapping_key: &[u8],
    ) -> CdmResult<Vec<u8>>;

    fn load_keys(
        &mut self,
        message: &[u8],
        signature: &[u8],
        mac_key_iv: &[u8],
        mac_keys: &[u8],
        keys: &[CryptoKey],
        provider_session_token: &[u8],
        srm_requirement: &[u8],
        key_type: LicenseKeyType,
    ) -> CdmResult<()>;
    fn load_entitled_content_keys(&mut self, keys: &[CryptoKey]) -> CdmResult<()>;
    fn refresh_keys(&mut self, message: &[u8], signature: &[u8], keys: &[CryptoKey])
    -> CdmResult<()>;
    fn decrypt(&mut self, params: &DecryptParams) -> CdmResult<Vec<u8>>;
    fn load_srm(&mut self, srm: &[u8]) -> CdmResult<()>;

    fn generic_encrypt(
        &mut self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>>;
    fn generic_decrypt(
        &mut self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>>;
    fn generic_sign(
        &mut self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> CdmResult<Vec<u8>>;
    fn generic_verify(
        &mut self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> CdmResult<()>;

    // Usage-entry support (v13+ semantics).
    fn create_usage_table_header(&mut self) -> CdmResult<Vec<u8>>;
    fn load_usage_table_header(&mut self, header: &[u8]) -> CdmResult<()>;
    fn create_usage_entry(&mut self) -> CdmResult<u32>;
    fn load_usage_entry(&mut self, entry_number: u32, entry: &[u8]) -> CdmResult<()>;
    /// Rewrite the live entry; returns (header, entry) blobs to persist.
    fn update_usage_entry(&mut self) -> CdmResult<(Vec<u8>, Vec<u8>)>;
    fn move_usage_entry(&mut self, to_entry_number: u32) -> CdmResult<()>;
    fn shrink_usage_table_header(&mut self, new_entry_count: u32) -> CdmResult<Vec<u8>>;
    fn copy_old_usage_entry(&mut self, provider_session_token: &[u8]) -> CdmResult<()>;

    // Usage reporting shared by the release flow.
    fn deactivate_usage_entry(&mut self, provider_session_token: &[u8]) -> CdmResult<()>;
    fn generate_usage_report(&mut self, provider_session_token: &[u8]) -> CdmResult<UsageReport>;
    fn release_usage_information(
        &mut self,
        message: &[u8],
        signature: &[u8],
        provider_session_token: &[u8],
    ) -> CdmResult<()>;
    fn delete_usage_information(&mut self, provider_session_token: &[u8]) -> CdmResult<()>;
    fn delete_all_usage_reports(&mut self) -> CdmResult<()>;
}

/// Session-wide static state guarded by the first lock in the global order.
#[derive(Default, Debug)]
pub struct TceStaticState {
    pub initialized: bool,
    pub open_sessions: usize,
}

/// Process-wide lock set for TCE access, constructed explicitly by the
/// engine owner and shared by every [`CryptoSession`].
///
/// Fixed acquisition order: `static_field` before `oem_crypto` whenever both
/// are required; `oem_crypto` (reader or writer) before any per-session
/// lock.
#[derive(Default)]
pub struct TceLocks {
    pub static_field: RwLock<TceStaticState>,
    pub oem_crypto: RwLock<()>,
}

impl TceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// An open crypto session with the locking contract applied per call class:
/// open/close are writers on the global TCE lock, session-scoped calls are
/// readers plus the per-session mutex, property reads are readers.
pub struct CryptoSession {
    engine: Arc<dyn TrustedCryptoEngine>,
    locks: Arc<TceLocks>,
    session: Mutex<Box<dyn TceSession>>,
    requested_level: RequestedSecurityLevel,
    security_level: SecurityLevel,
    max_chunk_size: usize,
    open: bool,
}

impl CryptoSession {
    pub fn open(
        engine: Arc<dyn TrustedCryptoEngine>,
        locks: Arc<TceLocks>,
        level: RequestedSecurityLevel,
    ) -> CdmResult<Self> {
        let session;
        {
            let mut stat = locks.static_field.write().unwrap();
            let _w = locks.oem_crypto.write().unwrap();
            session = engine.open_session(level)?;
            stat.initialized = true;
            stat.open_sessions += 1;
        }
        let security_level = session.security_level();
        let max_chunk_size = engine.max_subsample_chunk_size(level) & !0xf;
        Ok(CryptoSession {
            engine,
            locks,
            session: Mutex::new(session),
            requested_level: level,
            security_level,
            max_chunk_size,
            open: true,
        })
    }

    pub fn requested_security_level(&self) -> RequestedSecurityLevel {
        self.requested_level
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn engine(&self) -> &Arc<dyn TrustedCryptoEngine> {
        &self.engine
    }

    pub fn locks(&self) -> &Arc<TceLocks> {
        &self.locks
    }

    /// Explicitly close the underlying TCE session. Further session calls
    /// fail with `NotInitialized`.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut stat = self.locks.static_field.write().unwrap();
        let _w = self.locks.oem_crypto.write().unwrap();
        stat.open_sessions = stat.open_sessions.saturating_sub(1);
    }

    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut dyn TceSession) -> CdmResult<R>,
    ) -> CdmResult<R> {
        if !self.open {
            return Err(CdmError::NotInitialized);
        }
        let _r = self.locks.oem_crypto.read().unwrap();
        let mut session = self.session.lock().unwrap();
        f(session.as_mut())
    }

    pub fn oec_session_id(&self) -> u64 {
        self.session.lock().unwrap().oec_session_id()
    }

    pub fn request_id(&self) -> Vec<u8> {
        self.session.lock().unwrap().request_id()
    }

    pub fn generate_nonce(&self) -> CdmResult<u32> {
        self.with_session(|s| s.generate_nonce())
    }

    pub fn get_random(&self, n: usize) -> CdmResult<Vec<u8>> {
        self.with_session(|s| s.get_random(n))
    }

    pub fn hdcp_capabilities(&self) -> CdmResult<(HdcpVersion, HdcpVersion)> {
        self.with_session(|s| s.hdcp_capabilities())
    }

    pub fn load_certificate_private_key(&self, wrapped_key: &[u8]) -> CdmResult<()> {
        self.with_session(|s| s.load_certificate_private_key(wrapped_key))
    }

    pub fn prepare_request(&self, message: &[u8], is_provisioning: bool) -> CdmResult<Vec<u8>> {
        self.with_session(|s| s.prepare_request(message, is_provisioning))
    }

    pub fn prepare_renewal_request(&self, message: &[u8]) -> CdmResult<Vec<u8>> {
        self.with_session(|s| s.prepare_renewal_request(message))
    }

    pub fn generate_derived_keys(&self, message: &[u8], session_key: &[u8]) -> CdmResult<()> {
        self.with_session(|s| s.generate_derived_keys(message, session_key))
    }

    pub fn rewrap_certificate(
        &self,
        message: &[u8],
        signature: &[u8],
        nonce: &[u8],
        enc_private_key: &[u8],
        iv: &[u8],
        wrapping_key: &[u8],
    ) -> CdmResult<Vec<u8>> {
        self.with_session(|s| {
            s.rewrap_certificate(message, signature, nonce, enc_private_key, iv, wrapping_key)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_keys(
        &self,
        message: &[u8],
        signature: &[u8],
        mac_key_iv: &[u8],
        mac_keys: &[u8],
        keys: &[CryptoKey],
        provider_session_token: &[u8],
        srm_requirement: &[u8],
        key_type: LicenseKeyType,
    ) -> CdmResult<()> {
        self.with_session(|s| {
            s.load_keys(
                message,
                signature,
                mac_key_iv,
                mac_keys,
                keys,
                provider_session_token,
                srm_requirement,
                key_type,
            )
        })
    }

    pub fn load_entitled_content_keys(&self, keys: &[CryptoKey]) -> CdmResult<()> {
        self.with_session(|s| s.load_entitled_content_keys(keys))
    }

    pub fn refresh_keys(
        &self,
        message: &[u8],
        signature: &[u8],
        keys: &[CryptoKey],
    ) -> CdmResult<()> {
        self.with_session(|s| s.refresh_keys(message, signature, keys))
    }

    pub fn load_srm(&self, srm: &[u8]) -> CdmResult<()> {
        self.with_session(|s| s.load_srm(srm))
    }

    /// Decrypt one subsample, splitting it when it exceeds the device's
    /// maximum chunk size. Only CTR subsamples chunk; the counter advances
    /// by one block per 16 input bytes.
    pub fn decrypt(&self, params: &DecryptParams) -> CdmResult<Vec<u8>> {
        let needs_chunking = params.is_encrypted
            && params.cipher_mode == CipherMode::Ctr
            && self.max_chunk_size != 0
            && params.input.len() > self.max_chunk_size;
        if !needs_chunking {
            return self.with_session(|s| s.decrypt(params));
        }

        let mut output = Vec::with_capacity(params.input.len());
        let mut iv = params.iv.to_vec();
        for chunk in params.input.chunks(self.max_chunk_size) {
            let chunk_params = DecryptParams {
                input: chunk,
                iv: &iv,
                ..*params
            };
            output.extend_from_slice(&self.with_session(|s| s.decrypt(&chunk_params))?);
            increment_ctr_iv(&mut iv, (chunk.len() / 16) as u64);
        }
        Ok(output)
    }

    pub fn generic_encrypt(
        &self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        self.with_session(|s| s.generic_encrypt(input, key_id, iv, algorithm))
    }

    pub fn generic_decrypt(
        &self,
        input: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        self.with_session(|s| s.generic_decrypt(input, key_id, iv, algorithm))
    }

    pub fn generic_sign(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        self.with_session(|s| s.generic_sign(message, key_id, algorithm))
    }

    pub fn generic_verify(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> CdmResult<()> {
        self.with_session(|s| s.generic_verify(message, key_id, algorithm, signature))
    }

    // Usage table calls take the global lock exclusively per the contract.

    fn with_session_exclusive<R>(
        &self,
        f: impl FnOnce(&mut dyn TceSession) -> CdmResult<R>,
    ) -> CdmResult<R> {
        if !self.open {
            return Err(CdmError::NotInitialized);
        }
        let _w = self.locks.oem_crypto.write().unwrap();
        let mut session = self.session.lock().unwrap();
        f(session.as_mut())
    }

    pub fn create_usage_table_header(&self) -> CdmResult<Vec<u8>> {
        self.with_session_exclusive(|s| s.create_usage_table_header())
    }

    pub fn load_usage_table_header(&self, header: &[u8]) -> CdmResult<()> {
        self.with_session_exclusive(|s| s.load_usage_table_header(header))
    }

    pub fn create_usage_entry(&self) -> CdmResult<u32> {
        self.with_session_exclusive(|s| s.create_usage_entry())
    }

    pub fn load_usage_entry(&self, entry_number: u32, entry: &[u8]) -> CdmResult<()> {
        self.with_session_exclusive(|s| s.load_usage_entry(entry_number, entry))
    }

    pub fn update_usage_entry(&self) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        self.with_session_exclusive(|s| s.update_usage_entry())
    }

    pub fn move_usage_entry(&self, to_entry_number: u32) -> CdmResult<()> {
        self.with_session_exclusive(|s| s.move_usage_entry(to_entry_number))
    }

    pub fn shrink_usage_table_header(&self, new_entry_count: u32) -> CdmResult<Vec<u8>> {
        self.with_session_exclusive(|s| s.shrink_usage_table_header(new_entry_count))
    }

    pub fn copy_old_usage_entry(&self, provider_session_token: &[u8]) -> CdmResult<()> {
        self.with_session_exclusive(|s| s.copy_old_usage_entry(provider_session_token))
    }

    pub fn deactivate_usage_entry(&self, provider_session_token: &[u8]) -> CdmResult<()> {
        self.with_session(|s| s.deactivate_usage_entry(provider_session_token))
    }

    pub fn generate_usage_report(&self, provider_session_token: &[u8]) -> CdmResult<UsageReport> {
        self.with_session(|s| s.generate_usage_report(provider_session_token))
    }

    pub fn release_usage_information(
        &self,
        message: &[u8],
        signature: &[u8],
        provider_session_token: &[u8],
    ) -> CdmResult<()> {
        self.with_session(|s| s.release_usage_information(message, signature, provider_session_token))
    }

    pub fn delete_usage_information(&self, provider_session_token: &[u8]) -> CdmResult<()> {
        self.with_session(|s| s.delete_usage_information(provider_session_token))
    }

    pub fn delete_all_usage_reports(&self) -> CdmResult<()> {
        self.with_session_exclusive(|s| s.delete_all_usage_reports())
    }
}

impl Drop for CryptoSession {
    fn drop(&mut self) {
        // Destructors must not fail the unwind path; lock poisoning is
        // ignored here.
        if self.open {
            self.open = false;
            if let Ok(mut stat) = self.locks.static_field.write() {
                stat.open_sessions = stat.open_sessions.saturating_sub(1);
            }
        }
    }
}

/// Advance a 16-byte CTR IV by `blocks`, carrying through the low 64 bits
/// big-endian, as CENC counters do.
fn increment_ctr_iv(iv: &mut [u8], blocks: u64) {
    if iv.len() != 16 {
        return;
    }
    let mut counter = u64::from_be_bytes([
        iv[8], iv[9], iv[10], iv[11], iv[12], iv[13], iv[14], iv[15],
    ]);
    counter = counter.wrapping_add(blocks);
    iv[8..16].copy_from_slice(&counter.to_be_bytes());
}
