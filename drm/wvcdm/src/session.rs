//! One DRM session: the license parser, policy engine, crypto session and
//! persistence glued together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use prost::Message;
use tracing::{debug, info, warn};
use wvcdm_proto::{DrmCertificate, SignedDrmCertificate};

use crate::clock::WallClock;
use crate::constants::{KEY_SET_ID_LENGTH, KEY_SET_ID_PREFIX, SESSION_ID_PREFIX};
use crate::device_files::{DeviceFiles, LicenseRecord, ReservedKeySetIds, UsageRecord};
use crate::error::{CdmError, CdmResult};
use crate::events::EventListener;
use crate::file_store::FileStore;
use crate::init_data::InitData;
use crate::license::LicenseParser;
use crate::policy::PolicyEngine;
use crate::properties::{ClientPropertySet, PropertyRegistry};
use crate::tce::{CryptoSession, TceLocks, TrustedCryptoEngine};
use crate::types::{
    AddKeyOutcome, AppParameterMap, DecryptParams, EncryptionAlgorithm, KeyAllowedUsage,
    KeyRequest, KeyRequestType, KeySetId, LicenseType, OfflineLicenseState, QueryMap,
    RequestedSecurityLevel, SecurityLevel, SessionId, SigningAlgorithm, UsageSupportType,
    QUERY_KEY_OEMCRYPTO_SESSION_ID, QUERY_KEY_SECURITY_LEVEL,
};
use crate::usage_table::UsageTableHeader;

/// Process-monotonic counter backing non-key-set session ids.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Everything a session borrows from its engine at construction.
pub struct SessionContext {
    pub tce: Arc<dyn TrustedCryptoEngine>,
    pub locks: Arc<TceLocks>,
    pub store: Arc<dyn FileStore>,
    pub reserved: Arc<ReservedKeySetIds>,
    pub properties: Arc<PropertyRegistry>,
    pub clock: Arc<dyn WallClock>,
}

pub struct CdmSession {
    closed: bool,
    session_id: SessionId,
    key_set_id: KeySetId,
    security_level: SecurityLevel,
    requested_level: RequestedSecurityLevel,

    crypto_session: CryptoSession,
    license_parser: LicenseParser,
    policy_engine: PolicyEngine,
    device_files: DeviceFiles,
    usage_table_header: Option<Arc<UsageTableHeader>>,
    usage_support_type: UsageSupportType,
    properties: Arc<PropertyRegistry>,
    clock: Arc<dyn WallClock>,

    license_received: bool,
    is_offline: bool,
    is_release: bool,
    is_temporary: bool,
    app_parameters: AppParameterMap,

    is_initial_decryption: bool,
    has_decrypted_since_last_report: bool,
    is_initial_usage_update: bool,
    is_usage_update_needed: bool,

    usage_entry: Vec<u8>,
    usage_entry_number: u32,
    usage_provider_session_token: Vec<u8>,

    key_request: Vec<u8>,
    key_response: Vec<u8>,
    offline_init_data: Vec<u8>,
    offline_key_renewal_request: Vec<u8>,
    offline_key_renewal_response: Vec<u8>,
    offline_release_server_url: String,
}

impl CdmSession {
    /// Open and initialize a session. Returns `NeedProvisioning` when no
    /// device certificate is stored (or it fails to load for any reason
    /// other than lost state / invalidation).
    pub fn init(
        context: SessionContext,
        property_set: &ClientPropertySet,
        forced_session_id: Option<&str>,
        event_listener: Option<Arc<dyn EventListener>>,
    ) -> CdmResult<Self> {
        let requested_level = property_set.security_level;
        let crypto_session =
            CryptoSession::open(context.tce.clone(), context.locks.clone(), requested_level)?;
        let security_level = crypto_session.security_level();
        info!(level = %security_level, "session crypto open");

        let device_files =
            DeviceFiles::new(context.store.clone(), security_level, context.reserved.clone());

        let usage_support_type = context
            .tce
            .usage_support_type(requested_level)
            .unwrap_or(UsageSupportType::NonSecure);

        // The license-server client token is the stored DRM certificate;
        // stage it or report that provisioning is needed.
        let (client_token, wrapped_key) = device_files
            .retrieve_certificate()
            .map_err(|_| CdmError::NeedProvisioning)?;
        match crypto_session.load_certificate_private_key(&wrapped_key) {
            Ok(()) => {}
            Err(e @ (CdmError::SessionLostState | CdmError::SystemInvalidated)) => return Err(e),
            Err(_) => return Err(CdmError::NeedProvisioning),
        }
        let device_id = extract_certificate_serial(&client_token).unwrap_or_default();

        let key_set_id = match forced_session_id {
            Some(forced) => forced.to_owned(),
            None => generate_key_set_id(&crypto_session, &device_files)?,
        };
        let session_id = if context.properties.host().always_use_key_set_ids {
            key_set_id.clone()
        } else {
            format!(
                "{SESSION_ID_PREFIX}{}",
                SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
            )
        };
        if session_id.is_empty() {
            return Err(CdmError::EmptySessionId);
        }
        context.properties.register(&session_id, property_set.clone());

        let policy_engine = PolicyEngine::new(
            session_id.clone(),
            event_listener,
            &crypto_session,
            context.clock.clone(),
        );

        let mut license_parser = LicenseParser::new(session_id.clone(), context.clock.clone());
        license_parser.init(
            &client_token,
            crate::types::ClientTokenType::DrmCert,
            &device_id,
            &property_set.app_id,
            property_set.use_privacy_mode,
            &context.properties.service_certificate(&session_id),
            context.properties.host().allow_service_certificate_requests,
        )?;

        Ok(CdmSession {
            closed: false,
            session_id,
            key_set_id,
            security_level,
            requested_level,
            crypto_session,
            license_parser,
            policy_engine,
            device_files,
            usage_table_header: None,
            usage_support_type,
            properties: context.properties,
            clock: context.clock,
            license_received: false,
            is_offline: false,
            is_release: false,
            is_temporary: false,
            app_parameters: AppParameterMap::new(),
            is_initial_decryption: true,
            has_decrypted_since_last_report: false,
            is_initial_usage_update: true,
            is_usage_update_needed: false,
            usage_entry: Vec::new(),
            usage_entry_number: 0,
            usage_provider_session_token: Vec::new(),
            key_request: Vec::new(),
            key_response: Vec::new(),
            offline_init_data: Vec::new(),
            offline_key_renewal_request: Vec::new(),
            offline_key_renewal_response: Vec::new(),
            offline_release_server_url: String::new(),
        })
    }

    /// Latch the per-level usage table header once the engine knows the
    /// session's actual security level. No-op unless the TCE uses
    /// usage-entry semantics.
    pub fn attach_usage_table_header(&mut self, header: Arc<UsageTableHeader>) -> CdmResult<()> {
        if self.usage_support_type != UsageSupportType::Entry {
            return Ok(());
        }
        if !header.is_inited() {
            header.init(&self.crypto_session)?;
        }
        self.usage_table_header = Some(header);
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn key_set_id(&self) -> &str {
        &self.key_set_id
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn requested_security_level(&self) -> RequestedSecurityLevel {
        self.requested_level
    }

    pub fn is_offline(&self) -> bool {
        self.is_offline
    }

    pub fn is_release(&self) -> bool {
        self.is_release
    }

    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    pub fn license_received(&self) -> bool {
        self.license_received
    }

    pub fn usage_support_type(&self) -> UsageSupportType {
        self.usage_support_type
    }

    pub fn has_provider_session_token(&self) -> bool {
        !self.license_parser.provider_session_token().is_empty()
    }

    pub fn is_initial_usage_update(&self) -> bool {
        self.is_initial_usage_update
    }

    pub fn is_usage_update_needed(&self) -> bool {
        self.is_usage_update_needed
    }

    pub fn reset_usage_flags(&mut self) {
        self.is_initial_usage_update = false;
        self.is_usage_update_needed = false;
    }

    pub fn application_id(&self) -> String {
        self.properties.app_id(&self.session_id)
    }

    // ── Key requests ──────────────────────────────────────────────────

    pub fn generate_key_request(
        &mut self,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> CdmResult<KeyRequest> {
        match license_type {
            LicenseType::Temporary => self.is_temporary = true,
            LicenseType::Streaming => self.is_offline = false,
            LicenseType::Offline => self.is_offline = true,
            LicenseType::Release => self.is_release = true,
            LicenseType::EmbeddedKeyData => {
                self.license_parser.handle_embedded_key_data(
                    init_data,
                    &self.crypto_session,
                    &mut self.policy_engine,
                )?;
                return Ok(KeyRequest {
                    message: Vec::new(),
                    request_type: KeyRequestType::None,
                    url: String::new(),
                });
            }
        }

        if self.is_release {
            return self.generate_release_request();
        }
        if self.license_received {
            // After the initial license this is either key rotation or a
            // renewal.
            if init_data.contains_entitled_keys() {
                self.license_parser.handle_embedded_key_data(
                    init_data,
                    &self.crypto_session,
                    &mut self.policy_engine,
                )?;
                return Ok(KeyRequest {
                    message: Vec::new(),
                    request_type: KeyRequestType::None,
                    url: String::new(),
                });
            }
            return self.generate_renewal_request();
        }

        if !init_data.is_supported() {
            return Err(CdmError::UnsupportedInitData(
                init_data.type_name().to_owned(),
            ));
        }
        if init_data.is_empty() && !self.license_parser.has_stored_init_data() {
            return Err(CdmError::InitDataNotFound);
        }
        if self.is_offline && self.key_set_id.is_empty() {
            return Err(CdmError::EmptyKeySetId);
        }

        self.app_parameters = app_parameters.clone();
        let (message, url) = self.license_parser.prepare_key_request(
            init_data.clone(),
            license_type,
            app_parameters,
            &self.crypto_session,
        )?;

        self.key_request = message.clone();
        if self.is_offline {
            self.offline_init_data = init_data.data().to_vec();
            self.offline_release_server_url = url.clone();
            if init_data.is_hls() {
                self.device_files.store_hls_attributes(
                    &self.key_set_id,
                    init_data.hls_method(),
                    init_data.hls_iv(),
                )?;
            }
        }
        Ok(KeyRequest {
            message,
            request_type: KeyRequestType::Initial,
            url,
        })
    }

    pub fn add_key(&mut self, key_response: &[u8]) -> CdmResult<AddKeyOutcome> {
        if self.is_release {
            self.release_key(key_response)?;
            return Ok(AddKeyOutcome::KeysLoaded);
        }
        if self.license_received {
            self.renew_key(key_response)?;
            return Ok(AddKeyOutcome::KeysLoaded);
        }

        // With usage-entry support, a provider session token in the
        // response needs an entry allocated before the keys load.
        let provider_session_token =
            LicenseParser::extract_provider_session_token(key_response).unwrap_or_default();
        let mut entry_allocated = false;
        if let Some(header) = self.usage_table_header.clone()
            && !provider_session_token.is_empty()
        {
            let usage_info_file_name =
                DeviceFiles::usage_info_file_name(&self.application_id());
            self.usage_entry_number = header.add_entry(
                &self.crypto_session,
                self.is_offline,
                &self.key_set_id,
                &usage_info_file_name,
            )?;
            entry_allocated = true;
        }

        let outcome = self.license_parser.handle_key_response(
            key_response,
            &self.crypto_session,
            &mut self.policy_engine,
        );

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // A failed load must release the entry it allocated.
                if entry_allocated
                    && let Some(header) = &self.usage_table_header
                    && let Err(delete_error) =
                        header.delete_entry(self.usage_entry_number, &self.device_files)
                {
                    warn!(error = %delete_error, "failed to roll back usage entry");
                }
                return Err(e);
            }
        };
        if outcome == AddKeyOutcome::ServiceCertificateLoaded {
            return Ok(outcome);
        }

        self.license_received = true;
        self.key_response = key_response.to_vec();
        if let Some(version) = self.license_parser.latest_service_version() {
            debug!(
                sdk = version.license_sdk_version.as_deref().unwrap_or(""),
                service = version.license_service_version.as_deref().unwrap_or(""),
                "license service version"
            );
        }

        if self.is_offline || self.has_provider_session_token() {
            if self.has_provider_session_token()
                && let Some(header) = self.usage_table_header.clone()
            {
                self.usage_entry = header.update_entry(&self.crypto_session)?;
            }
            if !self.is_offline {
                self.usage_provider_session_token =
                    self.license_parser.provider_session_token().to_vec();
            }
            self.store_license_initial()?;
        }
        Ok(AddKeyOutcome::KeysLoaded)
    }

    // ── Decrypt ───────────────────────────────────────────────────────

    pub fn decrypt(&mut self, params: &DecryptParams) -> CdmResult<Vec<u8>> {
        // Encrypted playback may not begin before the start time or with
        // insufficient output protection. Clear-lead subsamples pass even
        // when the key is unknown.
        if params.is_encrypted {
            if !self.policy_engine.can_decrypt_content(params.key_id) {
                if self.policy_engine.is_license_for_future() {
                    return Err(CdmError::DecryptNotReady);
                }
                if !self.policy_engine.is_sufficient_output_protection(params.key_id) {
                    return Err(CdmError::InsufficientOutputProtection);
                }
                return Err(CdmError::NeedKey);
            }
            if !self.policy_engine.can_use_key_for_security_level(params.key_id) {
                return Err(CdmError::KeyProhibitedForSecurityLevel);
            }
        }

        match self.crypto_session.decrypt(params) {
            Ok(output) => {
                if self.is_initial_decryption {
                    self.is_initial_decryption = !self.policy_engine.begin_decryption();
                }
                self.has_decrypted_since_last_report = true;
                if !self.is_usage_update_needed {
                    self.is_usage_update_needed = self.has_provider_session_token();
                }
                Ok(output)
            }
            Err(e) => {
                let current_time = self.clock.now();
                if self
                    .policy_engine
                    .has_license_or_playback_duration_expired(current_time)
                {
                    return Err(CdmError::NeedKey);
                }
                Err(e)
            }
        }
    }

    // ── Renewal / release ─────────────────────────────────────────────

    pub fn generate_renewal_request(&mut self) -> CdmResult<KeyRequest> {
        let (message, url) = self.license_parser.prepare_key_update_request(
            true,
            &self.app_parameters,
            None,
            &self.crypto_session,
            &self.policy_engine,
        )?;
        if self.is_offline {
            self.offline_key_renewal_request = message.clone();
        }
        Ok(KeyRequest {
            message,
            request_type: KeyRequestType::Renewal,
            url,
        })
    }

    pub fn renew_key(&mut self, key_response: &[u8]) -> CdmResult<()> {
        self.license_parser.handle_key_update_response(
            true,
            key_response,
            &self.crypto_session,
            &mut self.policy_engine,
        )?;
        if self.is_offline {
            self.offline_key_renewal_response = key_response.to_vec();
            self.store_license(OfflineLicenseState::Active)?;
        }
        Ok(())
    }

    pub fn generate_release_request(&mut self) -> CdmResult<KeyRequest> {
        self.is_release = true;

        let (message, url) = {
            let usage_table_header = self.usage_table_header.clone();
            let crypto_session = &self.crypto_session;
            let usage_entry = &mut self.usage_entry;
            let mut updater = || -> CdmResult<()> {
                if let Some(header) = &usage_table_header {
                    *usage_entry = header.update_entry(crypto_session)?;
                }
                Ok(())
            };
            self.license_parser.prepare_key_update_request(
                false,
                &self.app_parameters,
                Some(&mut updater),
                crypto_session,
                &self.policy_engine,
            )?
        };

        if self.is_offline {
            // Mark the stored license as being released.
            self.store_license(OfflineLicenseState::Releasing)?;
        } else if !self.usage_provider_session_token.is_empty()
            && self.usage_support_type == UsageSupportType::Entry
        {
            self.update_usage_record()?;
        }

        Ok(KeyRequest {
            message,
            request_type: KeyRequestType::Release,
            url,
        })
    }

    pub fn release_key(&mut self, key_response: &[u8]) -> CdmResult<()> {
        self.license_parser.handle_key_update_response(
            false,
            key_response,
            &self.crypto_session,
            &mut self.policy_engine,
        )?;
        self.remove_license()
    }

    // ── Offline restore ───────────────────────────────────────────────

    pub fn restore_offline_session(
        &mut self,
        key_set_id: &str,
        license_type: LicenseType,
    ) -> CdmResult<()> {
        if !self.key_set_id.is_empty() {
            self.device_files.unreserve_key_set_id(&self.key_set_id);
        }
        self.key_set_id = key_set_id.to_owned();

        let record = self
            .device_files
            .retrieve_license(key_set_id)
            .map_err(|e| match e {
                CdmError::LicenseNotFound(_) => CdmError::KeySetIdNotFound(key_set_id.to_owned()),
                other => other,
            })?;

        // Only active licenses restore; a release retry is the exception.
        if license_type != LicenseType::Release && record.state != OfflineLicenseState::Active {
            return Err(CdmError::GetReleasedLicense);
        }

        self.offline_init_data = record.pssh_data.clone();
        self.key_request = record.key_request.clone();
        self.key_response = record.key_response.clone();
        self.offline_key_renewal_request = record.renewal_request.clone();
        self.offline_key_renewal_response = record.renewal_response.clone();
        self.offline_release_server_url = record.release_server_url.clone();
        self.app_parameters = record.app_parameters.clone();
        self.usage_entry = record.usage_entry.clone();
        self.usage_entry_number = record.usage_entry_number;

        let provider_session_token =
            LicenseParser::extract_provider_session_token(&record.key_response)
                .unwrap_or_default();
        if let Some(header) = &self.usage_table_header
            && !provider_session_token.is_empty()
        {
            header.load_entry(&self.crypto_session, &self.usage_entry, self.usage_entry_number)?;
        }

        if license_type == LicenseType::Release {
            self.license_parser.restore_license_for_release(
                &record.key_request,
                &record.key_response,
                &self.crypto_session,
                &mut self.policy_engine,
            )?;
        } else {
            let usage_table_header = self.usage_table_header.clone();
            let crypto_session = &self.crypto_session;
            let usage_entry = &mut self.usage_entry;
            let mut updater = || -> CdmResult<()> {
                if let Some(header) = &usage_table_header {
                    *usage_entry = header.update_entry(crypto_session)?;
                }
                Ok(())
            };
            self.license_parser.restore_offline_license(
                &record.key_request,
                &record.key_response,
                &record.renewal_response,
                record.playback_start_time,
                record.last_playback_time,
                record.grace_period_end_time,
                Some(&mut updater),
                crypto_session,
                &mut self.policy_engine,
            )?;
        }

        if let Some(header) = self.usage_table_header.clone()
            && !provider_session_token.is_empty()
        {
            self.usage_entry = header.update_entry(&self.crypto_session)?;
            if let Err(e) = self.store_license(record.state) {
                warn!(error = %e, "unable to save restored usage info");
            }
        }

        self.license_received = true;
        self.is_offline = true;
        self.is_release = license_type == LicenseType::Release;
        Ok(())
    }

    /// Restore a streaming usage record (secure stop) for release.
    pub fn restore_usage_session(&mut self, usage_record: &UsageRecord) -> CdmResult<()> {
        if !self.key_set_id.is_empty() {
            self.device_files.unreserve_key_set_id(&self.key_set_id);
        }
        self.key_set_id = usage_record.key_set_id.clone();
        self.key_request = usage_record.license_request.clone();
        self.key_response = usage_record.license_response.clone();
        self.usage_entry = usage_record.usage_entry.clone();
        self.usage_entry_number = usage_record.usage_entry_number;
        self.usage_provider_session_token = usage_record.provider_session_token.clone();

        if let Some(header) = &self.usage_table_header {
            header.load_entry(&self.crypto_session, &self.usage_entry, self.usage_entry_number)?;
        }

        self.license_parser.restore_license_for_release(
            &self.key_request.clone(),
            &self.key_response.clone(),
            &self.crypto_session,
            &mut self.policy_engine,
        )?;

        if let Some(header) = self.usage_table_header.clone() {
            self.usage_entry = header.update_entry(&self.crypto_session)?;
            if let Err(e) = self.update_usage_record() {
                warn!(error = %e, "unable to save restored usage info");
            }
        }

        self.license_received = true;
        self.is_offline = false;
        self.is_release = true;
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────────

    fn store_license_initial(&mut self) -> CdmResult<()> {
        if self.is_temporary {
            return Err(CdmError::StorageProhibited);
        }

        if self.is_offline {
            if self.key_set_id.is_empty() {
                return Err(CdmError::EmptyKeySetId);
            }
            if !self.license_parser.is_offline() {
                return Err(CdmError::OfflineLicenseProhibited);
            }
            return self.store_license(OfflineLicenseState::Active);
        }

        // Streaming with a provider session token: a secure stop record.
        if self.usage_provider_session_token.is_empty() {
            return Err(CdmError::UsageInfoNotFound);
        }
        if let Err(e) = self.update_usage_record() {
            warn!(error = %e, "unable to store usage info, dropping usage entry");
            if self.usage_support_type == UsageSupportType::Entry {
                let _ = self.delete_usage_entry(self.usage_entry_number);
            }
            let file_name = DeviceFiles::usage_info_file_name(&self.application_id());
            let _ = self.device_files.delete_all_usage_records(&file_name);
            return Err(e);
        }
        Ok(())
    }

    fn store_license(&mut self, state: OfflineLicenseState) -> CdmResult<()> {
        self.device_files.store_license(
            &self.key_set_id,
            &LicenseRecord {
                state,
                pssh_data: self.offline_init_data.clone(),
                key_request: self.key_request.clone(),
                key_response: self.key_response.clone(),
                renewal_request: self.offline_key_renewal_request.clone(),
                renewal_response: self.offline_key_renewal_response.clone(),
                release_server_url: self.offline_release_server_url.clone(),
                playback_start_time: self.policy_engine.playback_start_time(),
                last_playback_time: self.policy_engine.last_playback_time(),
                grace_period_end_time: self.policy_engine.grace_period_end_time(),
                app_parameters: self.app_parameters.clone(),
                usage_entry: self.usage_entry.clone(),
                usage_entry_number: self.usage_entry_number,
            },
        )
    }

    fn update_usage_record(&self) -> CdmResult<()> {
        let file_name = DeviceFiles::usage_info_file_name(&self.application_id());
        self.device_files.add_usage_record(
            &file_name,
            UsageRecord {
                provider_session_token: self.usage_provider_session_token.clone(),
                license_request: self.key_request.clone(),
                license_response: self.key_response.clone(),
                key_set_id: self.key_set_id.clone(),
                usage_entry: self.usage_entry.clone(),
                usage_entry_number: self.usage_entry_number,
            },
        )
    }

    /// Refresh the usage entry and re-persist whichever record owns it.
    pub fn update_usage_entry_information(&mut self) -> CdmResult<()> {
        if self.usage_support_type != UsageSupportType::Entry
            || !self.has_provider_session_token()
        {
            return Err(CdmError::IncorrectUsageSupportType);
        }
        let Some(header) = self.usage_table_header.clone() else {
            return Err(CdmError::IncorrectUsageSupportType);
        };
        self.usage_entry = header.update_entry(&self.crypto_session)?;

        if self.is_offline {
            self.store_license(if self.is_release {
                OfflineLicenseState::Releasing
            } else {
                OfflineLicenseState::Active
            })
        } else if !self.usage_provider_session_token.is_empty() {
            self.update_usage_record()
        } else {
            Ok(())
        }
    }

    /// Delete a usage entry. The entry cannot be deleted while a crypto
    /// session holds it, so this session's handle is cycled first.
    pub fn delete_usage_entry(&mut self, usage_entry_number: u32) -> CdmResult<()> {
        if self.usage_support_type != UsageSupportType::Entry {
            return Err(CdmError::IncorrectUsageSupportType);
        }
        let _ = self.update_usage_entry_information();

        self.crypto_session.close();
        self.crypto_session = CryptoSession::open(
            self.crypto_session.engine().clone(),
            locks_of(&self.crypto_session),
            self.requested_level,
        )?;

        let header = self
            .usage_table_header
            .clone()
            .ok_or(CdmError::IncorrectUsageSupportType)?;
        header.delete_entry(usage_entry_number, &self.device_files)
    }

    /// Remove the current offline license and/or matching usage record.
    pub fn remove_license(&mut self) -> CdmResult<()> {
        if self.is_offline || self.has_provider_session_token() {
            if self.usage_support_type == UsageSupportType::Entry
                && self.has_provider_session_token()
            {
                let entry_number = self.usage_entry_number;
                if let Err(e) = self.delete_usage_entry(entry_number) {
                    warn!(error = %e, "failed to delete usage entry");
                }
            }
            self.delete_license_file()?;
        }
        Ok(())
    }

    /// Delete this session's license or usage-record file only; the usage
    /// table is left untouched.
    pub fn delete_license_file(&mut self) -> CdmResult<()> {
        if self.is_offline {
            self.device_files.delete_hls_attributes(&self.key_set_id)?;
            self.device_files.delete_license(&self.key_set_id)
        } else if self.has_provider_session_token() {
            let file_name = DeviceFiles::usage_info_file_name(&self.application_id());
            let token = self.license_parser.provider_session_token().to_vec();
            self.device_files.delete_usage_record(&file_name, &token)
        } else {
            Ok(())
        }
    }

    /// Release crypto and policy resources, leaving the session open but
    /// useless. Prefer closing the session outright.
    pub fn remove_keys(&mut self) -> CdmResult<()> {
        self.crypto_session.close();
        self.crypto_session = CryptoSession::open(
            self.crypto_session.engine().clone(),
            locks_of(&self.crypto_session),
            self.requested_level,
        )?;
        self.policy_engine = PolicyEngine::new(
            self.session_id.clone(),
            None,
            &self.crypto_session,
            self.clock.clone(),
        );
        Ok(())
    }

    // ── Timer & events ────────────────────────────────────────────────

    pub fn on_timer_event(&mut self, update_usage: bool) {
        if update_usage && self.has_decrypted_since_last_report {
            self.policy_engine.decryption_event();
            self.has_decrypted_since_last_report = false;
            if self.is_offline && !self.is_release {
                if let Err(e) = self.store_license(OfflineLicenseState::Active) {
                    warn!(error = %e, "periodic license store failed");
                }
            }
        }
        self.policy_engine.on_timer_event(&self.crypto_session);
    }

    pub fn on_key_release_event(&mut self, key_set_id: &str) {
        if self.key_set_id == key_set_id {
            self.policy_engine.notify_session_expiration(&self.crypto_session);
        }
    }

    pub fn notify_resolution(&mut self, width: u32, height: u32) {
        self.policy_engine
            .notify_resolution(width, height, &self.crypto_session);
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn query_status(&self) -> QueryMap {
        let mut response = QueryMap::new();
        response.insert(QUERY_KEY_SECURITY_LEVEL, self.security_level.to_string());
        response
    }

    pub fn query_key_status(&self) -> QueryMap {
        self.policy_engine.query()
    }

    pub fn query_key_allowed_usage(&self, key_id: &[u8]) -> CdmResult<KeyAllowedUsage> {
        self.policy_engine.query_key_allowed_usage(key_id)
    }

    pub fn query_oem_crypto_session_id(&self) -> QueryMap {
        let mut response = QueryMap::new();
        response.insert(
            QUERY_KEY_OEMCRYPTO_SESSION_ID,
            self.crypto_session.oec_session_id().to_string(),
        );
        response
    }

    pub fn key_status(&self, key_id: &[u8]) -> crate::types::KeyStatus {
        self.policy_engine.key_status(key_id)
    }

    pub fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.license_parser.is_key_loaded(key_id)
    }

    #[cfg(test)]
    pub(crate) fn playback_start_time_for_test(&self) -> i64 {
        self.policy_engine.playback_start_time()
    }

    pub fn duration_remaining(&self) -> i64 {
        if self.policy_engine.is_license_for_future() {
            return 0;
        }
        self.policy_engine.license_or_playback_duration_remaining()
    }

    // ── Generic crypto operations ─────────────────────────────────────

    pub fn generic_encrypt(
        &self,
        in_buffer: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        self.crypto_session.generic_encrypt(in_buffer, key_id, iv, algorithm)
    }

    pub fn generic_decrypt(
        &self,
        in_buffer: &[u8],
        key_id: &[u8],
        iv: &[u8],
        algorithm: EncryptionAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        self.crypto_session.generic_decrypt(in_buffer, key_id, iv, algorithm)
    }

    pub fn generic_sign(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
    ) -> CdmResult<Vec<u8>> {
        self.crypto_session.generic_sign(message, key_id, algorithm)
    }

    pub fn generic_verify(
        &self,
        message: &[u8],
        key_id: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> CdmResult<()> {
        self.crypto_session
            .generic_verify(message, key_id, algorithm, signature)
    }
}

impl Drop for CdmSession {
    fn drop(&mut self) {
        // The usage entry gets one last update before the crypto handle
        // goes away; failures must not propagate out of drop.
        if self.has_provider_session_token()
            && self.usage_support_type == UsageSupportType::Entry
        {
            let _ = self.update_usage_entry_information();
        }
        self.properties.unregister(&self.session_id);
        self.device_files.unreserve_key_set_id(&self.key_set_id);
    }
}

fn locks_of(crypto_session: &CryptoSession) -> Arc<TceLocks> {
    crypto_session.locks().clone()
}

/// Fresh `ks` + hex key set id from TCE randomness, unique against the
/// store and reserved until persisted or the session drops.
fn generate_key_set_id(
    crypto_session: &CryptoSession,
    device_files: &DeviceFiles,
) -> CdmResult<KeySetId> {
    let random_len = (KEY_SET_ID_LENGTH - KEY_SET_ID_PREFIX.len()) / 2;
    loop {
        let random = crypto_session.get_random(random_len)?;
        let key_set_id = format!("{KEY_SET_ID_PREFIX}{}", hex::encode(random));
        if device_files.license_exists(&key_set_id) {
            continue;
        }
        if device_files.reserve_key_set_id(&key_set_id) {
            return Ok(key_set_id);
        }
    }
}

/// Serial number from a stored SignedDrmCertificate, used as the device id
/// in client identification.
fn extract_certificate_serial(certificate: &[u8]) -> Option<Vec<u8>> {
    let signed = SignedDrmCertificate::decode(certificate).ok()?;
    let cert = DrmCertificate::decode(signed.drm_certificate.as_deref()?).ok()?;
    cert.serial_number
}
