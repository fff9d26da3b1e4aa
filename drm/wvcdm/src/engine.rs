//! The public CDM engine: session lifecycle, provisioning, usage
//! accounting, the periodic timer, and read-through queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};

use rand::Rng;
use tracing::{error, info, warn};

use crate::clock::{SystemClock, WallClock};
use crate::constants::{
    KEY_SYSTEM_TOKEN, RELEASE_SESSION_TTL, USAGE_INFORMATION_UPDATE_PERIOD,
};
use crate::device_files::{DeviceFiles, ReservedKeySetIds, UsageRecord};
use crate::error::{CdmError, CdmResult};
use crate::events::EventListener;
use crate::file_store::FileStore;
use crate::init_data::InitData;
use crate::properties::{ClientPropertySet, HostProperties, PropertyRegistry};
use crate::provisioning::CertificateProvisioning;
use crate::service_certificate::ServiceCertificate;
use crate::session::{CdmSession, SessionContext};
use crate::session_map::{SessionMap, SharedSession};
use crate::tce::{CryptoSession, TceLocks, TrustedCryptoEngine};
use crate::types::{
    AddKeyOutcome, AppParameterMap, CertificateType, ClientTokenType, DecryptParams,
    EncryptionAlgorithm, HlsMethod, KeyAllowedUsage, KeyRequest, KeySetId, LicenseType,
    OfflineLicenseState, QueryMap, RequestedSecurityLevel, SecurityLevel, SessionId,
    SigningAlgorithm, UsageSupportType,
};
use crate::usage_table::UsageTableHeader;

/// Result of feeding a response into [`CdmEngine::add_key`].
#[derive(Debug, Clone)]
pub struct AddKeyResult {
    pub outcome: AddKeyOutcome,
    pub license_type: LicenseType,
    /// Present when the license is offline or bears a provider session
    /// token; use it with `restore_key` or a release request.
    pub key_set_id: Option<KeySetId>,
}

/// Everything the embedder supplies to construct an engine.
pub struct EngineConfig {
    pub tce: Arc<dyn TrustedCryptoEngine>,
    pub store: Arc<dyn FileStore>,
    pub host_properties: HostProperties,
    /// Stable per-origin identifier forwarded to provisioning, may be
    /// empty.
    pub spoid: String,
    pub app_package_name: String,
    pub clock: Arc<dyn WallClock>,
}

impl EngineConfig {
    pub fn new(tce: Arc<dyn TrustedCryptoEngine>, store: Arc<dyn FileStore>) -> Self {
        EngineConfig {
            tce,
            store,
            host_properties: HostProperties::default(),
            spoid: String::new(),
            app_package_name: String::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct CdmEngine {
    tce: Arc<dyn TrustedCryptoEngine>,
    locks: Arc<TceLocks>,
    store: Arc<dyn FileStore>,
    reserved: Arc<ReservedKeySetIds>,
    properties: Arc<PropertyRegistry>,
    clock: Arc<dyn WallClock>,
    spoid: String,
    app_package_name: String,

    session_map: SessionMap,
    /// key set id → (session id, close deadline) for release sessions.
    release_key_sets: Mutex<HashMap<KeySetId, (SessionId, i64)>>,
    usage_table_headers: Mutex<HashMap<SecurityLevel, Arc<UsageTableHeader>>>,
    cert_provisioning: Mutex<Option<CertificateProvisioning>>,
    cert_provisioning_requested_level: Mutex<RequestedSecurityLevel>,
    usage_session: Mutex<Option<CdmSession>>,
    last_usage_information_update_time: AtomicI64,
}

impl CdmEngine {
    pub fn new(config: EngineConfig) -> Self {
        CdmEngine {
            tce: config.tce,
            locks: TceLocks::new(),
            store: config.store,
            reserved: Arc::new(ReservedKeySetIds::new()),
            properties: Arc::new(PropertyRegistry::new(config.host_properties)),
            clock: config.clock,
            spoid: config.spoid,
            app_package_name: config.app_package_name,
            session_map: SessionMap::new(),
            release_key_sets: Mutex::new(HashMap::new()),
            usage_table_headers: Mutex::new(HashMap::new()),
            cert_provisioning: Mutex::new(None),
            cert_provisioning_requested_level: Mutex::new(RequestedSecurityLevel::Default),
            usage_session: Mutex::new(None),
            last_usage_information_update_time: AtomicI64::new(0),
        }
    }

    pub fn app_package_name(&self) -> &str {
        &self.app_package_name
    }

    pub fn session_size(&self) -> usize {
        self.session_map.size()
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            tce: self.tce.clone(),
            locks: self.locks.clone(),
            store: self.store.clone(),
            reserved: self.reserved.clone(),
            properties: self.properties.clone(),
            clock: self.clock.clone(),
        }
    }

    fn device_files(&self, level: SecurityLevel) -> DeviceFiles {
        DeviceFiles::new(self.store.clone(), level, self.reserved.clone())
    }

    fn usage_table_header_for(&self, level: SecurityLevel) -> Arc<UsageTableHeader> {
        self.usage_table_headers
            .lock()
            .unwrap()
            .entry(level)
            .or_insert_with(|| {
                Arc::new(UsageTableHeader::new(
                    self.tce.clone(),
                    self.locks.clone(),
                    level,
                    self.store.clone(),
                    self.reserved.clone(),
                ))
            })
            .clone()
    }

    fn find_session(&self, session_id: &str) -> CdmResult<SharedSession> {
        self.session_map
            .find(session_id)
            .ok_or_else(|| CdmError::SessionNotFound(session_id.to_owned()))
    }

    fn validate_key_system(key_system: &str) -> bool {
        key_system.contains(KEY_SYSTEM_TOKEN)
    }

    // ── Session lifecycle ─────────────────────────────────────────────

    pub fn open_session(
        &self,
        key_system: &str,
        property_set: &ClientPropertySet,
        event_listener: Option<Arc<dyn EventListener>>,
    ) -> CdmResult<SessionId> {
        self.open_session_internal(key_system, property_set, None, event_listener)
    }

    /// Same as `open_session` with a caller-chosen id. Fails with
    /// `DuplicateSessionId` when the id is taken.
    pub fn open_session_forced(
        &self,
        key_system: &str,
        property_set: &ClientPropertySet,
        forced_session_id: &str,
        event_listener: Option<Arc<dyn EventListener>>,
    ) -> CdmResult<()> {
        if self.session_map.exists(forced_session_id) {
            return Err(CdmError::DuplicateSessionId(forced_session_id.to_owned()));
        }
        self.open_session_internal(
            key_system,
            property_set,
            Some(forced_session_id),
            event_listener,
        )
        .map(|_| ())
    }

    fn open_session_internal(
        &self,
        key_system: &str,
        property_set: &ClientPropertySet,
        forced_session_id: Option<&str>,
        event_listener: Option<Arc<dyn EventListener>>,
    ) -> CdmResult<SessionId> {
        info!("open session");
        if !Self::validate_key_system(key_system) {
            return Err(CdmError::InvalidKeySystem(key_system.to_owned()));
        }

        self.close_expired_release_sessions();

        let mut session =
            CdmSession::init(self.session_context(), property_set, forced_session_id, event_listener)
                .inspect_err(|e| {
                    if matches!(e, CdmError::NeedProvisioning) {
                        *self.cert_provisioning_requested_level.lock().unwrap() =
                            property_set.security_level;
                    } else {
                        error!(error = %e, "session init failed");
                    }
                })?;

        if session.usage_support_type() == UsageSupportType::Entry {
            let header = self.usage_table_header_for(session.security_level());
            session.attach_usage_table_header(header)?;
        }

        let session_id = session.session_id().to_owned();
        info!(session_id = %session_id, "session open");
        self.session_map.add(&session_id, session);
        Ok(session_id)
    }

    pub fn close_session(&self, session_id: &str) -> CdmResult<()> {
        info!(session_id = %session_id, "close session");
        if !self.session_map.close_session(session_id) {
            return Err(CdmError::SessionNotFound(session_id.to_owned()));
        }
        Ok(())
    }

    pub fn is_open_session(&self, session_id: &str) -> bool {
        self.session_map.exists(session_id)
    }

    /// Open an internal session bound to a stored key set id, with a TTL
    /// after which the engine closes it. An existing binding for the same
    /// key set id is closed first.
    pub fn open_key_set_session(
        &self,
        key_set_id: &str,
        property_set: &ClientPropertySet,
        event_listener: Option<Arc<dyn EventListener>>,
    ) -> CdmResult<()> {
        info!(key_set_id = %key_set_id, "open key set session");
        if key_set_id.is_empty() {
            return Err(CdmError::EmptyKeySetId);
        }

        let in_use = self
            .release_key_sets
            .lock()
            .unwrap()
            .contains_key(key_set_id);
        if in_use {
            self.close_key_set_session(key_set_id)?;
        }

        let session_id =
            self.open_session_internal(KEY_SYSTEM_TOKEN, property_set, None, event_listener)?;
        self.release_key_sets.lock().unwrap().insert(
            key_set_id.to_owned(),
            (session_id, self.clock.now() + RELEASE_SESSION_TTL),
        );
        Ok(())
    }

    pub fn close_key_set_session(&self, key_set_id: &str) -> CdmResult<()> {
        let session_id = {
            let map = self.release_key_sets.lock().unwrap();
            map.get(key_set_id)
                .map(|(session_id, _)| session_id.clone())
                .ok_or_else(|| CdmError::KeySetIdNotFound(key_set_id.to_owned()))?
        };
        let result = self.close_session(&session_id);
        self.release_key_sets.lock().unwrap().remove(key_set_id);
        result
    }

    fn close_expired_release_sessions(&self) {
        let now = self.clock.now();
        let expired: Vec<SessionId> = {
            let mut map = self.release_key_sets.lock().unwrap();
            let expired_keys: Vec<KeySetId> = map
                .iter()
                .filter(|(_, (_, deadline))| *deadline < now)
                .map(|(k, _)| k.clone())
                .collect();
            expired_keys
                .into_iter()
                .filter_map(|k| map.remove(&k).map(|(session_id, _)| session_id))
                .collect()
        };
        for session_id in expired {
            let _ = self.close_session(&session_id);
        }
    }

    // ── License exchange ──────────────────────────────────────────────

    /// Construct a license request. For release requests `session_id` may
    /// be empty and `key_set_id` selects the session.
    pub fn generate_key_request(
        &self,
        session_id: &str,
        key_set_id: &str,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> CdmResult<KeyRequest> {
        info!(session_id = %session_id, "generate key request");
        let mut id = session_id.to_owned();

        if license_type == LicenseType::Release
            && !self.properties.host().always_use_key_set_ids
        {
            if key_set_id.is_empty() {
                return Err(CdmError::EmptyKeySetId);
            }
            if !session_id.is_empty() {
                return Err(CdmError::SessionNotFound(session_id.to_owned()));
            }
            id = self
                .release_key_sets
                .lock()
                .unwrap()
                .get(key_set_id)
                .map(|(session_id, _)| session_id.clone())
                .ok_or_else(|| CdmError::KeySetIdNotFound(key_set_id.to_owned()))?;
        }

        let session = self.find_session(&id)?;
        let mut session = session.lock().unwrap();

        if license_type == LicenseType::Release && !session.license_received() {
            // Restore the stored license before generating the release.
            session.restore_offline_session(key_set_id, LicenseType::Release)?;
        }

        let request = session
            .generate_key_request(init_data, license_type, app_parameters)
            .inspect_err(|e| {
                if matches!(e, CdmError::NeedProvisioning) {
                    *self.cert_provisioning_requested_level.lock().unwrap() =
                        session.requested_security_level();
                }
            })?;

        if license_type == LicenseType::Release {
            drop(session);
            self.on_key_release_event(key_set_id);
        }
        Ok(request)
    }

    /// Feed a license / renewal / release / service-certificate response.
    /// An empty `session_id` means release by `key_set_id`.
    pub fn add_key(
        &self,
        session_id: &str,
        key_data: &[u8],
        key_set_id: &str,
    ) -> CdmResult<AddKeyResult> {
        info!(session_id = %session_id, "add key");
        let release_by_key_set = session_id.is_empty();
        let id = if release_by_key_set {
            if key_set_id.is_empty() {
                return Err(CdmError::EmptyKeySetId);
            }
            self.release_key_sets
                .lock()
                .unwrap()
                .get(key_set_id)
                .map(|(session_id, _)| session_id.clone())
                .ok_or_else(|| CdmError::KeySetIdNotFound(key_set_id.to_owned()))?
        } else {
            session_id.to_owned()
        };

        let session = self.find_session(&id)?;
        let mut session = session.lock().unwrap();

        if key_data.is_empty() {
            return Err(CdmError::EmptyKeyData);
        }

        let outcome = session.add_key(key_data)?;

        let license_type = if session.is_release() {
            LicenseType::Release
        } else if session.is_temporary() {
            LicenseType::Temporary
        } else if session.is_offline() {
            LicenseType::Offline
        } else {
            LicenseType::Streaming
        };

        let out_key_set_id = if (session.is_offline() || session.has_provider_session_token())
            && !release_by_key_set
        {
            Some(session.key_set_id().to_owned())
        } else {
            None
        };

        Ok(AddKeyResult {
            outcome,
            license_type,
            key_set_id: out_key_set_id,
        })
    }

    /// Reload an offline license into an open session.
    pub fn restore_key(&self, session_id: &str, key_set_id: &str) -> CdmResult<()> {
        info!(session_id = %session_id, key_set_id = %key_set_id, "restore key");
        if key_set_id.is_empty() {
            return Err(CdmError::EmptyKeySetId);
        }
        let session = self.find_session(session_id)?;
        let mut session = session.lock().unwrap();
        session
            .restore_offline_session(key_set_id, LicenseType::Offline)
            .inspect_err(|e| {
                if matches!(e, CdmError::NeedProvisioning) {
                    *self.cert_provisioning_requested_level.lock().unwrap() =
                        session.requested_security_level();
                }
            })
    }

    pub fn remove_keys(&self, session_id: &str) -> CdmResult<()> {
        let session = self.find_session(session_id)?;
        let mut session = session.lock().unwrap();
        session.remove_keys()
    }

    /// Delete the session's persisted license and usage record immediately,
    /// without a release round-trip.
    pub fn remove_license(&self, session_id: &str) -> CdmResult<()> {
        let session = self.find_session(session_id)?;
        let mut session = session.lock().unwrap();
        session.remove_license()
    }

    pub fn generate_renewal_request(&self, session_id: &str) -> CdmResult<KeyRequest> {
        let session = self.find_session(session_id)?;
        let mut session = session.lock().unwrap();
        session.generate_renewal_request()
    }

    pub fn renew_key(&self, session_id: &str, key_data: &[u8]) -> CdmResult<()> {
        if key_data.is_empty() {
            return Err(CdmError::EmptyKeyData);
        }
        let session = self.find_session(session_id)?;
        let mut session = session.lock().unwrap();
        session.renew_key(key_data)
    }

    fn on_key_release_event(&self, key_set_id: &str) {
        for session in self.session_map.list() {
            session.lock().unwrap().on_key_release_event(key_set_id);
        }
    }

    // ── Decrypt & generic crypto ──────────────────────────────────────

    /// Decrypt one subsample. With an empty session id, the session holding
    /// the key with the longest remaining validity is used.
    pub fn decrypt(&self, session_id: &str, params: &DecryptParams) -> CdmResult<Vec<u8>> {
        let session = if session_id.is_empty() {
            let mut best: Option<SharedSession> = None;
            let mut best_remaining = 0;
            for candidate in self.session_map.list() {
                let guard = candidate.lock().unwrap();
                if guard.is_key_loaded(params.key_id) {
                    let remaining = guard.duration_remaining();
                    if remaining > best_remaining {
                        best_remaining = remaining;
                        drop(guard);
                        best = Some(candidate);
                    }
                }
            }
            best.ok_or_else(|| CdmError::SessionNotFound(String::new()))?
        } else {
            self.find_session(session_id)?
        };
        let mut session = session.lock().unwrap();
        session.decrypt(params)
    }

    pub fn generic_encrypt(
        &self,
        session_id: &str,
        in_buffer: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        session.generic_encrypt(in_buffer, key_id, iv, algorithm)
    }

    pub fn generic_decrypt(
        &self,
        session_id: &str,
        in_buffer: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        session.generic_decrypt(in_buffer, key_id, iv, algorithm)
    }

    pub fn generic_sign(
        &self,
        session_id: &str,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        session.generic_sign(message, key_id, algorithm)
    }

    pub fn generic_verify(
        &self,
        session_id: &str,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> CdmResult<()> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        session.generic_verify(message, key_id, algorithm, signature)
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Engine-wide property query at a security level.
    pub fn query_status(
        &self,
        level: RequestedSecurityLevel,
        query_token: &str,
    ) -> CdmResult<String> {
        match query_token {
            "SecurityLevel" => {
                let crypto =
                    CryptoSession::open(self.tce.clone(), self.locks.clone(), level)?;
                Ok(crypto.security_level().to_string())
            }
            "HdcpLevel" => {
                let crypto =
                    CryptoSession::open(self.tce.clone(), self.locks.clone(), level)?;
                let (current, _max) = crypto.hdcp_capabilities()?;
                Ok(format!("{current:?}"))
            }
            "MaxHdcpLevel" => {
                let crypto =
                    CryptoSession::open(self.tce.clone(), self.locks.clone(), level)?;
                let (_current, max) = crypto.hdcp_capabilities()?;
                Ok(format!("{max:?}"))
            }
            "OemCryptoApiVersion" => Ok(self.tce.api_version(level).to_string()),
            "SecurityPatchLevel" => Ok(self.tce.security_patch_level(level).to_string()),
            "SystemId" => Ok(self.tce.system_id(level)?.to_string()),
            "MaxNumberOfSessions" => Ok(self.tce.max_number_of_sessions(level).to_string()),
            "NumberOfOpenSessions" => Ok(self.tce.number_of_open_sessions(level).to_string()),
            "SrmVersion" => Ok(self.tce.srm_version(level)?.to_string()),
            "CurrentSrmUpdatable" => Ok(self.tce.is_srm_update_supported(level).to_string()),
            _ => Err(CdmError::InvalidQueryKey(query_token.to_owned())),
        }
    }

    pub fn query_session_status(&self, session_id: &str) -> CdmResult<QueryMap> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        Ok(session.query_status())
    }

    pub fn is_release_session(&self, session_id: &str) -> bool {
        self.find_session(session_id)
            .map(|s| s.lock().unwrap().is_release())
            .unwrap_or(false)
    }

    pub fn is_offline_session(&self, session_id: &str) -> bool {
        self.find_session(session_id)
            .map(|s| s.lock().unwrap().is_offline())
            .unwrap_or(false)
    }

    pub fn query_key_status(&self, session_id: &str) -> CdmResult<QueryMap> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        Ok(session.query_key_status())
    }

    pub fn query_key_allowed_usage(
        &self,
        session_id: &str,
        key_id: &[u8],
    ) -> CdmResult<KeyAllowedUsage> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        session.query_key_allowed_usage(key_id)
    }

    /// Key allowed-usage across all sessions; conflicting settings between
    /// sessions clear the result.
    pub fn query_key_allowed_usage_any_session(
        &self,
        key_id: &[u8],
    ) -> CdmResult<KeyAllowedUsage> {
        let mut found: Option<KeyAllowedUsage> = None;
        for session in self.session_map.list() {
            let session = session.lock().unwrap();
            if let Ok(usage) = session.query_key_allowed_usage(key_id) {
                match &found {
                    Some(existing) if *existing != usage => return Err(CdmError::KeyNotFound),
                    _ => found = Some(usage),
                }
            }
        }
        found.ok_or(CdmError::KeyNotFound)
    }

    pub fn query_oem_crypto_session_id(&self, session_id: &str) -> CdmResult<QueryMap> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        Ok(session.query_oem_crypto_session_id())
    }

    pub fn query_key_status_for_key(
        &self,
        session_id: &str,
        key_id: &[u8],
    ) -> CdmResult<crate::types::KeyStatus> {
        let session = self.find_session(session_id)?;
        let session = session.lock().unwrap();
        Ok(session.key_status(key_id))
    }

    pub fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.session_map
            .list()
            .iter()
            .any(|s| s.lock().unwrap().is_key_loaded(key_id))
    }

    pub fn find_session_for_key(&self, key_id: &[u8]) -> Option<SessionId> {
        self.session_map
            .list()
            .iter()
            .find(|s| s.lock().unwrap().is_key_loaded(key_id))
            .map(|s| s.lock().unwrap().session_id().to_owned())
    }

    pub fn notify_resolution(&self, session_id: &str, width: u32, height: u32) -> bool {
        match self.find_session(session_id) {
            Ok(session) => {
                session.lock().unwrap().notify_resolution(width, height);
                true
            }
            Err(_) => false,
        }
    }

    pub fn validate_service_certificate(&self, certificate: &[u8]) -> CdmResult<()> {
        ServiceCertificate::new().init(certificate)
    }

    // ── Provisioning ──────────────────────────────────────────────────

    pub fn get_provisioning_request(
        &self,
        cert_type: CertificateType,
        cert_authority: &str,
        service_certificate: &[u8],
    ) -> CdmResult<(Vec<u8>, String)> {
        info!("provisioning request");
        let requested_level = *self.cert_provisioning_requested_level.lock().unwrap();
        let mut slot = self.cert_provisioning.lock().unwrap();
        if slot.is_none() {
            let mut provisioning =
                CertificateProvisioning::new(self.tce.clone(), self.locks.clone());
            provisioning.init(service_certificate)?;
            *slot = Some(provisioning);
        }
        let Some(provisioning) = slot.as_mut() else {
            return Err(CdmError::NotInitialized);
        };
        let origin = self.app_package_name.clone();
        let result = provisioning.get_provisioning_request(
            requested_level,
            cert_type,
            cert_authority,
            &origin,
            &self.spoid,
            self.properties.host(),
        );
        if result.is_err() {
            *slot = None;
        }
        result
    }

    pub fn handle_provisioning_response(
        &self,
        response: &[u8],
    ) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        info!("provisioning response");
        if response.is_empty() {
            *self.cert_provisioning.lock().unwrap() = None;
            return Err(CdmError::ProvisioningResponse("empty response"));
        }

        let requested_level = *self.cert_provisioning_requested_level.lock().unwrap();
        let mut slot = self.cert_provisioning.lock().unwrap();
        let Some(provisioning) = slot.as_mut() else {
            // The provisioning state was released; a concurrent attempt may
            // already have provisioned the device.
            let crypto =
                CryptoSession::open(self.tce.clone(), self.locks.clone(), requested_level)?;
            let level = crypto.security_level();
            drop(crypto);
            if self.is_provisioned(level) {
                return Ok((Vec::new(), Vec::new()));
            }
            return Err(CdmError::ProvisioningResponse("no request in flight"));
        };

        let crypto = CryptoSession::open(self.tce.clone(), self.locks.clone(), requested_level)?;
        let device_files = self.device_files(crypto.security_level());
        drop(crypto);

        let result =
            provisioning.handle_provisioning_response(&device_files, response, self.properties.host());
        // Release state only on success; a later concurrent attempt may
        // still complete against the kept state.
        if result.is_ok() {
            *slot = None;
        }
        result
    }

    pub fn is_provisioned(&self, security_level: SecurityLevel) -> bool {
        let property_set = ClientPropertySet {
            security_level: if security_level == SecurityLevel::L3 {
                RequestedSecurityLevel::Level3
            } else {
                RequestedSecurityLevel::Default
            },
            ..Default::default()
        };
        CdmSession::init(self.session_context(), &property_set, None, None).is_ok()
    }

    /// Erase the stored certificate and usage table at a level. Devices
    /// with baked-in DRM certificates cannot be reprovisioned and are
    /// refused.
    pub fn unprovision(&self, security_level: SecurityLevel) -> CdmResult<()> {
        info!(level = %security_level, "unprovision");
        let requested_level = if security_level == SecurityLevel::L3 {
            RequestedSecurityLevel::Level3
        } else {
            RequestedSecurityLevel::Default
        };
        if self.tce.provisioning_method(requested_level)? == ClientTokenType::DrmCert {
            return Err(CdmError::DeviceCannotReprovision);
        }

        let device_files = self.device_files(security_level);
        device_files.delete_all_files()?;
        self.delete_usage_table(security_level)
    }

    /// Delete the TCE's usage reports at a level.
    pub fn delete_usage_table(&self, security_level: SecurityLevel) -> CdmResult<()> {
        let requested_level = if security_level == SecurityLevel::L3 {
            RequestedSecurityLevel::Level3
        } else {
            RequestedSecurityLevel::Default
        };
        let crypto = CryptoSession::open(self.tce.clone(), self.locks.clone(), requested_level)?;
        crypto.delete_all_usage_reports()
    }

    // ── Offline license & usage record management ─────────────────────

    pub fn list_stored_licenses(&self, security_level: SecurityLevel) -> CdmResult<Vec<KeySetId>> {
        self.device_files(security_level).list_licenses()
    }

    pub fn list_usage_ids(
        &self,
        app_id: &str,
        security_level: SecurityLevel,
    ) -> CdmResult<(Vec<KeySetId>, Vec<Vec<u8>>)> {
        let file_name = DeviceFiles::usage_info_file_name(app_id);
        self.device_files(security_level).list_usage_ids(&file_name)
    }

    /// Per-segment HLS cipher attributes persisted with an offline license.
    pub fn get_hls_attributes(
        &self,
        key_set_id: &str,
        security_level: SecurityLevel,
    ) -> CdmResult<(HlsMethod, Vec<u8>)> {
        self.device_files(security_level)
            .retrieve_hls_attributes(key_set_id)
    }

    pub fn get_offline_license_state(
        &self,
        key_set_id: &str,
        security_level: SecurityLevel,
    ) -> CdmResult<OfflineLicenseState> {
        let record = self.device_files(security_level).retrieve_license(key_set_id)?;
        Ok(record.state)
    }

    pub fn remove_offline_license(
        &self,
        key_set_id: &str,
        security_level: SecurityLevel,
    ) -> CdmResult<()> {
        let device_files = self.device_files(security_level);
        let record = device_files.retrieve_license(key_set_id).map_err(|e| match e {
            CdmError::LicenseNotFound(_) => CdmError::KeySetIdNotFound(key_set_id.to_owned()),
            other => other,
        })?;

        // Free the TCE usage entry first if the license holds one.
        if !record.usage_entry.is_empty()
            && let Ok(mut session) = self.internal_session(security_level, "")
        {
            let header = self.usage_table_header_for(session.security_level());
            if session.attach_usage_table_header(header).is_ok()
                && let Err(e) = session.delete_usage_entry(record.usage_entry_number)
            {
                warn!(error = %e, "failed to delete usage entry for offline license");
            }
        }
        device_files.delete_license(key_set_id)
    }

    /// Delete the usage record bound to `key_set_id` in both the file
    /// system and the TCE table.
    pub fn delete_usage_record(
        &self,
        app_id: &str,
        security_level: SecurityLevel,
        key_set_id: &str,
    ) -> CdmResult<()> {
        let device_files = self.device_files(security_level);
        let file_name = DeviceFiles::usage_info_file_name(app_id);
        let record = device_files.find_usage_record_by_key_set_id(&file_name, key_set_id)?;

        let mut session = self.internal_session(security_level, app_id)?;
        if session.usage_support_type() == UsageSupportType::Entry {
            let header = self.usage_table_header_for(session.security_level());
            session.attach_usage_table_header(header)?;
            session.delete_usage_entry(record.usage_entry_number)?;
        }
        device_files.delete_usage_record(&file_name, &record.provider_session_token)
    }

    /// A signed release message for one stored usage record of this app
    /// (a random one), or empty when none exist. Feed the server's reply to
    /// `release_usage_info`.
    pub fn get_usage_info(&self, app_id: &str) -> CdmResult<Vec<Vec<u8>>> {
        // Try a random security level first, then the other.
        let first = if rand::thread_rng().gen_bool(0.5) {
            SecurityLevel::L1
        } else {
            SecurityLevel::L3
        };
        let second = if first == SecurityLevel::L1 {
            SecurityLevel::L3
        } else {
            SecurityLevel::L1
        };

        match self.get_usage_info_at(app_id, first, None) {
            Ok(info) if !info.is_empty() => return Ok(info),
            _ => {}
        }
        match self.get_usage_info_at(app_id, second, None) {
            // One level not being provisioned is a valid state.
            Err(CdmError::NeedProvisioning) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Release message for the usage record with the given provider
    /// session token.
    pub fn get_usage_info_by_ssid(
        &self,
        app_id: &str,
        ssid: &[u8],
    ) -> CdmResult<Vec<Vec<u8>>> {
        match self.get_usage_info_at(app_id, SecurityLevel::L1, Some(ssid)) {
            Ok(info) if !info.is_empty() => Ok(info),
            _ => self.get_usage_info_at(app_id, SecurityLevel::L3, Some(ssid)),
        }
    }

    fn get_usage_info_at(
        &self,
        app_id: &str,
        security_level: SecurityLevel,
        ssid: Option<&[u8]>,
    ) -> CdmResult<Vec<Vec<u8>>> {
        let device_files = self.device_files(security_level);
        let file_name = DeviceFiles::usage_info_file_name(app_id);
        let records = device_files.usage_records(&file_name)?;

        let record: UsageRecord = match ssid {
            Some(ssid) => records
                .into_iter()
                .find(|r| r.provider_session_token == ssid)
                .ok_or(CdmError::UsageInfoNotFound)?,
            None => {
                if records.is_empty() {
                    return Ok(Vec::new());
                }
                let index = rand::thread_rng().gen_range(0..records.len());
                records.into_iter().nth(index).ok_or(CdmError::UsageInfoNotFound)?
            }
        };

        let mut session = self.internal_session(security_level, app_id)?;
        if session.usage_support_type() == UsageSupportType::Entry {
            let header = self.usage_table_header_for(session.security_level());
            session.attach_usage_table_header(header)?;
        }
        session.restore_usage_session(&record)?;
        let request = session.generate_release_request()?;
        *self.usage_session.lock().unwrap() = Some(session);
        Ok(vec![request.message])
    }

    /// Feed the server's release response for a message handed out by
    /// `get_usage_info`; deletes the persistent record and the TCE entry.
    pub fn release_usage_info(&self, message: &[u8]) -> CdmResult<()> {
        let mut slot = self.usage_session.lock().unwrap();
        let Some(session) = slot.as_mut() else {
            return Err(CdmError::NotInitialized);
        };
        let result = session.release_key(message);
        *slot = None;
        result
    }

    /// Remove every usage record for the app at one level.
    pub fn remove_all_usage_info_at(
        &self,
        app_id: &str,
        security_level: SecurityLevel,
    ) -> CdmResult<()> {
        let device_files = self.device_files(security_level);
        let file_name = DeviceFiles::usage_info_file_name(app_id);
        if device_files.usage_records(&file_name)?.is_empty() {
            return Ok(());
        }

        let mut session = self.internal_session(security_level, app_id)?;
        if session.usage_support_type() == UsageSupportType::Entry {
            let header = self.usage_table_header_for(session.security_level());
            session.attach_usage_table_header(header)?;
            // Delete one entry per pass: each deletion may renumber the
            // remaining records.
            loop {
                let records = device_files.usage_records(&file_name)?;
                let Some(record) = records.first() else { break };
                session.delete_usage_entry(record.usage_entry_number)?;
                device_files.delete_usage_record(&file_name, &record.provider_session_token)?;
            }
        }
        device_files.delete_all_usage_records(&file_name)?;
        Ok(())
    }

    /// Remove every usage record for the app, across security levels.
    pub fn remove_all_usage_info(&self, app_id: &str) -> CdmResult<()> {
        let result_l1 = self.remove_all_usage_info_at(app_id, SecurityLevel::L1);
        match self.remove_all_usage_info_at(app_id, SecurityLevel::L3) {
            Ok(()) => Ok(()),
            Err(_) => result_l1,
        }
    }

    /// Remove one usage record by provider session token, searching both
    /// levels.
    pub fn remove_usage_info(&self, app_id: &str, ssid: &[u8]) -> CdmResult<()> {
        let file_name = DeviceFiles::usage_info_file_name(app_id);
        for security_level in [SecurityLevel::L1, SecurityLevel::L3] {
            let device_files = self.device_files(security_level);
            let Ok(record) = device_files.find_usage_record_by_token(&file_name, ssid) else {
                continue;
            };
            let mut session = self.internal_session(security_level, app_id)?;
            if session.usage_support_type() == UsageSupportType::Entry {
                let header = self.usage_table_header_for(session.security_level());
                session.attach_usage_table_header(header)?;
                session.delete_usage_entry(record.usage_entry_number)?;
            }
            return device_files.delete_usage_record(&file_name, ssid);
        }
        Err(CdmError::UsageInfoNotFound)
    }

    /// Internal, listener-less session used by usage flows.
    fn internal_session(
        &self,
        security_level: SecurityLevel,
        app_id: &str,
    ) -> CdmResult<CdmSession> {
        let property_set = ClientPropertySet {
            security_level: if security_level == SecurityLevel::L3 {
                RequestedSecurityLevel::Level3
            } else {
                RequestedSecurityLevel::Default
            },
            app_id: app_id.to_owned(),
            ..Default::default()
        };
        CdmSession::init(self.session_context(), &property_set, None, None)
    }

    // ── Timer ─────────────────────────────────────────────────────────

    /// Periodic driver, called roughly once per second. Not re-entrant;
    /// the host serializes ticks.
    pub fn on_timer_event(&self) {
        let current_time = self.clock.now();

        let last = self.last_usage_information_update_time.load(Ordering::Relaxed);
        let usage_update_period_expired =
            current_time - last > USAGE_INFORMATION_UPDATE_PERIOD;
        if usage_update_period_expired {
            self.last_usage_information_update_time
                .store(current_time, Ordering::Relaxed);
        }

        let mut is_initial_usage_update = false;
        let mut is_usage_update_needed = false;

        // Sessions created after this snapshot are visited next tick.
        let sessions = self.session_map.list();
        for session in &sessions {
            let mut session = session.lock().unwrap();
            is_initial_usage_update |= session.is_initial_usage_update();
            is_usage_update_needed |= session.is_usage_update_needed();
            session.on_timer_event(usage_update_period_expired);
        }

        if is_usage_update_needed && (usage_update_period_expired || is_initial_usage_update) {
            for session in self.session_map.list() {
                let mut session = session.lock().unwrap();
                session.reset_usage_flags();
                if session.usage_support_type() == UsageSupportType::Entry
                    && session.has_provider_session_token()
                    && let Err(e) = session.update_usage_entry_information()
                {
                    warn!(error = %e, "periodic usage entry update failed");
                }
            }
        }

        self.close_expired_release_sessions();
    }
}

impl Drop for CdmEngine {
    fn drop(&mut self) {
        self.session_map.terminate_all();
    }
}
