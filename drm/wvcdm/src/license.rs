//! License protocol parser: builds signed license requests and digests
//! license responses (initial, renewal, release, service certificate,
//! embedded key rotation, offline restore).

use std::collections::HashSet;
use std::sync::Arc;

use prost::Message;
use wvcdm_proto::license::KeyContainer;
use wvcdm_proto::license::key_container::KeyType as ProtoKeyType;
use wvcdm_proto::license_request::content_identification::{
    ContentIdVariant, ExistingLicense, WebmKeyId, WidevinePsshData as PsshContentId,
};
use wvcdm_proto::license_request::{ContentIdentification, RequestType};
use wvcdm_proto::signed_message::MessageType;
use wvcdm_proto::widevine_pssh_data::EntitledKey;
use wvcdm_proto::{
    License, LicenseError, LicenseRequest, LicenseType as ProtoLicenseType, ProtocolVersion,
    SignedMessage, VersionInfo, license_error,
};

use crate::client_identification::build_client_id;
use crate::clock::WallClock;
use crate::constants::{CONTENT_KEY_SIZE, KEY_IV_SIZE, MAC_KEY_SIZE};
use crate::error::{CdmError, CdmResult};
use crate::init_data::InitData;
use crate::policy::PolicyEngine;
use crate::service_certificate::ServiceCertificate;
use crate::tce::CryptoSession;
use crate::types::{
    AddKeyOutcome, AppParameterMap, CipherMode, ClientTokenType, CryptoKey, KeyId, LicenseKeyType,
    LicenseType, SessionId, UsageDurationStatus,
};

/// Hook the session supplies so the parser can trigger a usage-entry
/// update/persist at the protocol-mandated point without owning the usage
/// table plumbing.
pub type UsageEntryUpdater<'a> = &'a mut dyn FnMut() -> CdmResult<()>;

fn extract_content_keys(license: &License) -> Vec<CryptoKey> {
    let four_cc = license.protection_scheme.unwrap_or(0);
    let cipher_mode = if license.protection_scheme.is_some() {
        CipherMode::from_protection_scheme(four_cc)
    } else {
        CipherMode::Ctr
    };

    let mut key_array = Vec::new();
    for key in &license.key {
        match key.r#type.and_then(|t| ProtoKeyType::try_from(t).ok()) {
            Some(ProtoKeyType::Content) | Some(ProtoKeyType::OperatorSession) => {
                let raw = key.key.as_deref().unwrap_or_default();
                // Strip PKCS#5 padding; the key is 16 or 32 bytes so the
                // padding is always one full block.
                let length = raw.len().saturating_sub(16);
                key_array.push(CryptoKey {
                    key_id: key.id.clone().unwrap_or_default(),
                    key_data: raw[..length].to_vec(),
                    key_data_iv: key.iv.clone().unwrap_or_default(),
                    key_control: key
                        .key_control
                        .as_ref()
                        .and_then(|kc| kc.key_control_block.clone())
                        .unwrap_or_default(),
                    key_control_iv: key
                        .key_control
                        .as_ref()
                        .and_then(|kc| kc.iv.clone())
                        .unwrap_or_default(),
                    track_label: key.track_label.clone().unwrap_or_default(),
                    cipher_mode,
                    ..Default::default()
                });
            }
            Some(ProtoKeyType::KeyControl) => {
                if let Some(control) = &key.key_control {
                    key_array.push(CryptoKey {
                        key_control: control.key_control_block.clone().unwrap_or_default(),
                        key_control_iv: control.iv.clone().unwrap_or_default(),
                        ..Default::default()
                    });
                }
            }
            _ => {}
        }
    }
    key_array
}

fn extract_entitlement_keys(license: &License) -> Vec<CryptoKey> {
    let four_cc = license.protection_scheme.unwrap_or(0);
    let cipher_mode = if license.protection_scheme.is_some() {
        CipherMode::from_protection_scheme(four_cc)
    } else {
        CipherMode::Ctr
    };

    let mut key_array = Vec::new();
    for key in &license.key {
        if key.r#type != Some(ProtoKeyType::Entitlement as i32) {
            continue;
        }
        let raw = key.key.as_deref().unwrap_or_default();
        // Entitlement keys are 32 bytes; anything longer carries one block
        // of PKCS#5 padding.
        let length = if raw.len() > 32 { raw.len() - 16 } else { 0 };
        key_array.push(CryptoKey {
            key_id: key.id.clone().unwrap_or_default(),
            key_data: raw[..length].to_vec(),
            key_data_iv: key.iv.clone().unwrap_or_default(),
            key_control: key
                .key_control
                .as_ref()
                .and_then(|kc| kc.key_control_block.clone())
                .unwrap_or_default(),
            key_control_iv: key
                .key_control
                .as_ref()
                .and_then(|kc| kc.iv.clone())
                .unwrap_or_default(),
            track_label: key.track_label.clone().unwrap_or_default(),
            cipher_mode,
            ..Default::default()
        });
    }
    key_array
}

pub struct LicenseParser {
    session_id: SessionId,
    initialized: bool,
    client_token: Vec<u8>,
    client_token_type: ClientTokenType,
    device_id: Vec<u8>,
    app_id: String,
    use_privacy_mode: bool,
    allow_service_certificate_requests: bool,
    service_certificate: ServiceCertificate,
    clock: Arc<dyn WallClock>,

    stored_init_data: Option<InitData>,
    key_request: Vec<u8>,
    server_url: String,
    provider_session_token: Vec<u8>,
    provider_client_token: Vec<u8>,
    renew_with_client_id: bool,
    is_offline: bool,
    license_key_type: LicenseKeyType,
    entitlement_keys: Vec<KeyContainer>,
    wrapped_keys: Vec<EntitledKey>,
    loaded_keys: HashSet<KeyId>,
    latest_service_version: Option<VersionInfo>,
}

impl LicenseParser {
    pub fn new(session_id: SessionId, clock: Arc<dyn WallClock>) -> Self {
        LicenseParser {
            session_id,
            initialized: false,
            client_token: Vec::new(),
            client_token_type: ClientTokenType::DrmCert,
            device_id: Vec::new(),
            app_id: String::new(),
            use_privacy_mode: false,
            allow_service_certificate_requests: true,
            service_certificate: ServiceCertificate::new(),
            clock,
            stored_init_data: None,
            key_request: Vec::new(),
            server_url: String::new(),
            provider_session_token: Vec::new(),
            provider_client_token: Vec::new(),
            renew_with_client_id: false,
            is_offline: false,
            license_key_type: LicenseKeyType::Content,
            entitlement_keys: Vec::new(),
            wrapped_keys: Vec::new(),
            loaded_keys: HashSet::new(),
            latest_service_version: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        client_token: &[u8],
        client_token_type: ClientTokenType,
        device_id: &[u8],
        app_id: &str,
        use_privacy_mode: bool,
        signed_service_certificate: &[u8],
        allow_service_certificate_requests: bool,
    ) -> CdmResult<()> {
        if self.session_id.is_empty() {
            return Err(CdmError::EmptySessionId);
        }
        if client_token.is_empty() {
            return Err(CdmError::NotInitialized);
        }
        if use_privacy_mode {
            if !signed_service_certificate.is_empty() {
                self.service_certificate.init(signed_service_certificate)?;
            }
            if !self.service_certificate.has_certificate() && !allow_service_certificate_requests {
                return Err(CdmError::PrivacyMode);
            }
        }
        self.client_token = client_token.to_vec();
        self.client_token_type = client_token_type;
        self.device_id = device_id.to_vec();
        self.app_id = app_id.to_owned();
        self.use_privacy_mode = use_privacy_mode;
        self.allow_service_certificate_requests = allow_service_certificate_requests;
        self.initialized = true;
        Ok(())
    }

    pub fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.loaded_keys.contains(key_id)
    }

    pub fn provider_session_token(&self) -> &[u8] {
        &self.provider_session_token
    }

    pub fn is_offline(&self) -> bool {
        self.is_offline
    }

    pub fn license_key_type(&self) -> LicenseKeyType {
        self.license_key_type
    }

    pub fn has_stored_init_data(&self) -> bool {
        self.stored_init_data.is_some()
    }

    pub fn latest_service_version(&self) -> Option<&VersionInfo> {
        self.latest_service_version.as_ref()
    }

    /// Extract the provider session token from a raw license response
    /// without loading anything.
    pub fn extract_provider_session_token(license_response: &[u8]) -> Option<Vec<u8>> {
        let signed = SignedMessage::decode(license_response).ok()?;
        if signed.r#type != Some(MessageType::License as i32) {
            return None;
        }
        let license = License::decode(signed.msg.as_deref()?).ok()?;
        let token = license.id?.provider_session_token?;
        (!token.is_empty()).then_some(token)
    }

    // ── Request construction ──────────────────────────────────────────

    /// Build the initial signed license request, or a service-certificate
    /// request when privacy mode needs one first (the init data is stashed
    /// and replayed on the next call).
    pub fn prepare_key_request(
        &mut self,
        init_data: InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
        crypto_session: &CryptoSession,
    ) -> CdmResult<(Vec<u8>, String)> {
        if !self.initialized {
            return Err(CdmError::NotInitialized);
        }
        let init_data = if init_data.is_empty() && self.stored_init_data.is_some() {
            self.stored_init_data.take().unwrap_or(init_data)
        } else {
            init_data
        };
        self.wrapped_keys = init_data.extract_wrapped_keys();
        if !init_data.is_supported() {
            return Err(CdmError::UnsupportedInitData(
                init_data.type_name().to_owned(),
            ));
        }
        if init_data.is_empty() {
            return Err(CdmError::InitDataNotFound);
        }

        // Privacy mode without a certificate: ask the server for one first.
        if self.use_privacy_mode && !self.service_certificate.has_certificate() {
            if !self.allow_service_certificate_requests {
                return Err(CdmError::PrivacyMode);
            }
            self.stored_init_data = Some(init_data);
            return Ok((ServiceCertificate::request(), self.server_url.clone()));
        }

        let request_id = crypto_session.request_id();

        let mut license_request = LicenseRequest::default();
        self.prepare_client_id(app_parameters, b"", crypto_session, &mut license_request)?;
        self.prepare_content_id(&init_data, license_type, &request_id, &mut license_request)?;

        license_request.r#type = Some(RequestType::New as i32);
        license_request.request_time = Some(self.clock.now());

        // The nonce comes back in the key control block of the response.
        let nonce = match crypto_session.generate_nonce() {
            Ok(nonce) => nonce,
            Err(e @ (CdmError::SessionLostState | CdmError::SystemInvalidated)) => return Err(e),
            Err(_) => return Err(CdmError::NonceGeneration),
        };
        license_request.key_control_nonce = Some(nonce);
        license_request.protocol_version = Some(ProtocolVersion::Version21 as i32);

        let serialized = license_request.encode_to_vec();
        self.key_request = serialized.clone();

        let signature = crypto_session.prepare_request(&serialized, false)?;
        if signature.is_empty() {
            return Err(CdmError::SignatureEmpty);
        }

        let signed_message = SignedMessage {
            r#type: Some(MessageType::LicenseRequest as i32),
            msg: Some(serialized),
            signature: Some(signature),
            ..Default::default()
        };
        Ok((signed_message.encode_to_vec(), self.server_url.clone()))
    }

    /// Build a renewal (`is_renewal`) or release request for the loaded
    /// license. `usage_entry_updater` runs after usage deactivation so the
    /// session can persist the final usage entry.
    pub fn prepare_key_update_request(
        &mut self,
        is_renewal: bool,
        app_parameters: &AppParameterMap,
        mut usage_entry_updater: Option<UsageEntryUpdater<'_>>,
        crypto_session: &CryptoSession,
        policy: &PolicyEngine,
    ) -> CdmResult<(Vec<u8>, String)> {
        if !self.initialized {
            return Err(CdmError::NotInitialized);
        }
        if is_renewal && !policy.can_renew() {
            return Err(CdmError::RenewalProhibited);
        }
        if self.renew_with_client_id
            && self.use_privacy_mode
            && !self.service_certificate.has_certificate()
        {
            return Err(CdmError::PrivacyMode);
        }

        let mut license_request = LicenseRequest {
            r#type: Some(if is_renewal {
                RequestType::Renewal as i32
            } else {
                RequestType::Release as i32
            }),
            request_time: Some(self.clock.now()),
            ..Default::default()
        };

        if self.renew_with_client_id {
            let provider_client_token = self.provider_client_token.clone();
            self.prepare_client_id(
                app_parameters,
                &provider_client_token,
                crypto_session,
                &mut license_request,
            )?;
        }

        let mut existing = ExistingLicense {
            license_id: Some(policy.license_id().clone()),
            ..Default::default()
        };

        let mut duration_status = UsageDurationStatus::Invalid;
        let mut seconds_since_started = 0;
        let mut seconds_since_last_played = 0;
        if !self.provider_session_token.is_empty() {
            if !is_renewal {
                crypto_session.deactivate_usage_entry(&self.provider_session_token)?;
            }
            if let Some(updater) = usage_entry_updater.as_mut() {
                updater()?;
            }
            let report = crypto_session.generate_usage_report(&self.provider_session_token);
            match report {
                Ok(report) => {
                    duration_status = report.duration_status;
                    seconds_since_started = report.seconds_since_started;
                    seconds_since_last_played = report.seconds_since_last_played;
                    if !is_renewal {
                        existing.session_usage_table_entry = Some(report.report);
                    }
                }
                Err(e) => {
                    if !is_renewal {
                        return Err(e);
                    }
                }
            }
        }

        if duration_status != UsageDurationStatus::Valid
            && let (Some(started), Some(last_played)) =
                (policy.seconds_since_started(), policy.seconds_since_last_played())
        {
            duration_status = UsageDurationStatus::Valid;
            seconds_since_started = started;
            seconds_since_last_played = last_played;
        }
        if duration_status == UsageDurationStatus::Valid {
            existing.seconds_since_started = Some(seconds_since_started);
            existing.seconds_since_last_played = Some(seconds_since_last_played);
        }

        license_request.content_id = Some(ContentIdentification {
            content_id_variant: Some(ContentIdVariant::ExistingLicense(existing)),
        });

        let nonce = match crypto_session.generate_nonce() {
            Ok(nonce) => nonce,
            Err(e @ (CdmError::SessionLostState | CdmError::SystemInvalidated)) => return Err(e),
            Err(_) => return Err(CdmError::NonceGeneration),
        };
        license_request.key_control_nonce = Some(nonce);
        license_request.protocol_version = Some(ProtocolVersion::Version21 as i32);

        let serialized = license_request.encode_to_vec();
        let signature = crypto_session.prepare_renewal_request(&serialized)?;
        if signature.is_empty() {
            return Err(CdmError::SignatureEmpty);
        }

        let signed_message = SignedMessage {
            r#type: Some(MessageType::LicenseRequest as i32),
            msg: Some(serialized),
            signature: Some(signature),
            ..Default::default()
        };
        Ok((signed_message.encode_to_vec(), self.server_url.clone()))
    }

    // ── Response handling ─────────────────────────────────────────────

    pub fn handle_key_response(
        &mut self,
        license_response: &[u8],
        crypto_session: &CryptoSession,
        policy: &mut PolicyEngine,
    ) -> CdmResult<AddKeyOutcome> {
        if !self.initialized {
            return Err(CdmError::NotInitialized);
        }
        self.latest_service_version = None;
        if license_response.is_empty() {
            return Err(CdmError::EmptyLicenseResponse);
        }

        let signed_response = SignedMessage::decode(license_response)?;
        self.latest_service_version = signed_response.service_version_info.clone();

        if self.use_privacy_mode
            && self.allow_service_certificate_requests
            && signed_response.r#type == Some(MessageType::ServiceCertificate as i32)
        {
            let signed_certificate = ServiceCertificate::parse_response(license_response)?;
            self.service_certificate.init(&signed_certificate)?;
            return Ok(AddKeyOutcome::ServiceCertificateLoaded);
        }

        if signed_response.r#type == Some(MessageType::ErrorResponse as i32) {
            return Err(handle_error_response(&signed_response));
        }
        if signed_response.r#type != Some(MessageType::License as i32) {
            return Err(CdmError::InvalidResponseType(
                signed_response.r#type.unwrap_or(0),
            ));
        }
        if signed_response.signature.is_none() {
            return Err(CdmError::SignatureMissing);
        }

        let msg = signed_response.msg.as_deref().unwrap_or_default();
        let license = License::decode(msg)?;

        let session_key = signed_response
            .session_key
            .as_deref()
            .ok_or(CdmError::SessionKeysNotFound)?;
        crypto_session.generate_derived_keys(&self.key_request, session_key)?;

        // MAC keys arrive in a SIGNING container, two keys and their IV,
        // PKCS#5 padded.
        let mut mac_key_iv = Vec::new();
        let mut mac_keys = Vec::new();
        for key in &license.key {
            if key.r#type == Some(ProtoKeyType::Signing as i32) {
                mac_key_iv = key.iv.clone().unwrap_or_default();
                let raw = key.key.as_deref().unwrap_or_default();
                mac_keys = raw[..raw.len().min(2 * MAC_KEY_SIZE)].to_vec();
            }
        }
        let policy_can_renew = license
            .policy
            .as_ref()
            .and_then(|p| p.can_renew)
            .unwrap_or(false);
        if (policy_can_renew || !mac_key_iv.is_empty() || !mac_keys.is_empty())
            && (mac_key_iv.len() != KEY_IV_SIZE || mac_keys.len() != 2 * MAC_KEY_SIZE)
        {
            return Err(CdmError::KeySize("mac keys"));
        }

        let mut key_type = LicenseKeyType::Entitlement;
        let mut key_array = extract_entitlement_keys(&license);
        if key_array.is_empty() {
            key_array = extract_content_keys(&license);
            key_type = LicenseKeyType::Content;
        }
        if key_array.is_empty() {
            return Err(CdmError::NoContentKeys);
        }
        self.license_key_type = key_type;

        if let Some(token) = &license.provider_client_token {
            self.provider_client_token = token.clone();
        }

        if let Some(srm_update) = &license.srm_update {
            match crypto_session.load_srm(srm_update) {
                Err(CdmError::SystemInvalidated) => return Err(CdmError::SystemInvalidated),
                _ => {} // other failures are advisory
            }
        }

        let license_id = license.id.clone().unwrap_or_default();
        let can_persist = license
            .policy
            .as_ref()
            .and_then(|p| p.can_persist)
            .unwrap_or(false);
        if license_id.r#type == Some(ProtoLicenseType::Offline as i32) && can_persist {
            self.is_offline = true;
        }
        if let Some(token) = &license_id.provider_session_token {
            self.provider_session_token = token.clone();
        }
        if let Some(url) = license.policy.as_ref().and_then(|p| p.renewal_server_url.as_ref())
        {
            self.server_url = url.clone();
        }
        if let Some(always) = license
            .policy
            .as_ref()
            .and_then(|p| p.always_include_client_id)
        {
            self.renew_with_client_id = always;
        }

        let signature = signed_response.signature.as_deref().unwrap_or_default();
        let srm_requirement = license.srm_requirement.clone().unwrap_or_default();
        crypto_session.load_keys(
            msg,
            signature,
            &mac_key_iv,
            &mac_keys,
            &key_array,
            &self.provider_session_token,
            &srm_requirement,
            key_type,
        )?;

        if key_type == LicenseKeyType::Entitlement {
            self.entitlement_keys = license.key.clone();
            policy.set_license(&license, crypto_session);
            let wrapped = std::mem::take(&mut self.wrapped_keys);
            let result = self.handle_new_entitled_keys(&wrapped, crypto_session, policy);
            self.wrapped_keys = wrapped;
            result?;
        } else {
            self.loaded_keys = key_array.iter().map(|k| k.key_id.clone()).collect();
            policy.set_license(&license, crypto_session);
        }
        Ok(AddKeyOutcome::KeysLoaded)
    }

    /// Renewal (`is_renewal`) or release response.
    pub fn handle_key_update_response(
        &mut self,
        is_renewal: bool,
        license_response: &[u8],
        crypto_session: &CryptoSession,
        policy: &mut PolicyEngine,
    ) -> CdmResult<()> {
        if !self.initialized {
            return Err(CdmError::NotInitialized);
        }
        if license_response.is_empty() {
            return Err(CdmError::EmptyLicenseResponse);
        }

        let signed_response = SignedMessage::decode(license_response)?;
        match signed_response.r#type {
            Some(t) if t == MessageType::License as i32 => {}
            Some(t) if t == MessageType::ErrorResponse as i32 => {
                return Err(handle_error_response(&signed_response));
            }
            other => return Err(CdmError::InvalidResponseType(other.unwrap_or(0))),
        }
        if signed_response.signature.is_none() {
            return Err(CdmError::SignatureMissing);
        }

        let msg = signed_response.msg.as_deref().unwrap_or_default();
        let license = License::decode(msg)?;
        if license.id.is_none() {
            return Err(CdmError::LicenseIdNotFound);
        }

        if let Some(always) = license
            .policy
            .as_ref()
            .and_then(|p| p.always_include_client_id)
        {
            self.renew_with_client_id = always;
        }

        let signature = signed_response.signature.as_deref().unwrap_or_default();

        if !is_renewal {
            // Release: the response authorizes the TCE to free the usage
            // entry bound to the provider session token.
            let Some(token) = license.id.as_ref().and_then(|id| id.provider_session_token.clone())
            else {
                return Ok(());
            };
            self.provider_session_token = token;
            return crypto_session.release_usage_information(
                msg,
                signature,
                &self.provider_session_token,
            );
        }

        if let Some(url) = license.policy.as_ref().and_then(|p| p.renewal_server_url.as_ref())
            && !url.is_empty()
        {
            self.server_url = url.clone();
        }

        let key_array = extract_content_keys(&license);
        crypto_session.refresh_keys(msg, signature, &key_array)?;
        policy.update_license(&license, crypto_session);
        Ok(())
    }

    /// Key rotation: a new batch of entitled keys arrives in init data with
    /// no server round-trip.
    pub fn handle_embedded_key_data(
        &mut self,
        init_data: &InitData,
        crypto_session: &CryptoSession,
        policy: &mut PolicyEngine,
    ) -> CdmResult<()> {
        let wrapped = init_data.extract_wrapped_keys();
        self.handle_new_entitled_keys(&wrapped, crypto_session, policy)
    }

    fn handle_new_entitled_keys(
        &mut self,
        wrapped_keys: &[EntitledKey],
        crypto_session: &CryptoSession,
        policy: &mut PolicyEngine,
    ) -> CdmResult<()> {
        let mut entitled_key_array = Vec::new();
        for container in &self.entitlement_keys {
            if container.r#type != Some(ProtoKeyType::Entitlement as i32) {
                continue;
            }
            for wrapped in wrapped_keys {
                if wrapped.entitlement_key_id != container.id {
                    continue;
                }
                let mut content_key = wrapped.key.clone().unwrap_or_default();
                // Strip PKCS#5 padding from the wrapped content key.
                if content_key.len() < CONTENT_KEY_SIZE {
                    return Err(CdmError::KeySize("entitled content key"));
                }
                content_key.truncate(CONTENT_KEY_SIZE);

                entitled_key_array.push(CryptoKey {
                    key_id: wrapped.key_id.clone().unwrap_or_default(),
                    key_data: content_key,
                    key_data_iv: wrapped.iv.clone().unwrap_or_default(),
                    entitlement_key_id: wrapped.entitlement_key_id.clone().unwrap_or_default(),
                    ..Default::default()
                });
            }
        }

        crypto_session.load_entitled_content_keys(&entitled_key_array)?;
        for wrapped in wrapped_keys {
            if let Some(key_id) = &wrapped.key_id {
                self.loaded_keys.insert(key_id.clone());
            }
        }
        policy.set_entitled_license_keys(wrapped_keys);
        Ok(())
    }

    // ── Offline restore ───────────────────────────────────────────────

    /// Re-run the persisted request/response pair (and renewal, if any),
    /// then reconcile persisted playback timestamps against the TCE's
    /// usage report.
    #[allow(clippy::too_many_arguments)]
    pub fn restore_offline_license(
        &mut self,
        license_request: &[u8],
        license_response: &[u8],
        license_renewal_response: &[u8],
        mut playback_start_time: i64,
        mut last_playback_time: i64,
        grace_period_end_time: i64,
        mut usage_entry_updater: Option<UsageEntryUpdater<'_>>,
        crypto_session: &CryptoSession,
        policy: &mut PolicyEngine,
    ) -> CdmResult<()> {
        if license_request.is_empty() {
            return Err(CdmError::EmptyLicenseResponse);
        }
        if license_response.is_empty() {
            return Err(CdmError::EmptyLicenseResponse);
        }

        let signed_request = SignedMessage::decode(license_request)?;
        if signed_request.r#type != Some(MessageType::LicenseRequest as i32) {
            return Err(CdmError::InvalidResponseType(
                signed_request.r#type.unwrap_or(0),
            ));
        }
        self.key_request = signed_request.msg.unwrap_or_default();

        self.handle_key_response(license_response, crypto_session, policy)?;

        if !license_renewal_response.is_empty() {
            self.handle_key_update_response(true, license_renewal_response, crypto_session, policy)?;
        }

        if !self.provider_session_token.is_empty() {
            if let Some(updater) = usage_entry_updater.as_mut() {
                updater()?;
            }
            if let Ok(report) = crypto_session.generate_usage_report(&self.provider_session_token)
            {
                match report.duration_status {
                    UsageDurationStatus::PlaybackNotBegun => {
                        playback_start_time = 0;
                        last_playback_time = 0;
                    }
                    UsageDurationStatus::Valid => {
                        let current_time = self.clock.now();
                        if current_time - report.seconds_since_started > 0 {
                            playback_start_time = current_time - report.seconds_since_started;
                        }
                        if current_time - report.seconds_since_last_played > 0 {
                            last_playback_time = current_time - report.seconds_since_last_played;
                        }
                    }
                    UsageDurationStatus::Invalid => {}
                }
            }
        }

        policy.restore_playback_times(
            playback_start_time,
            last_playback_time,
            grace_period_end_time,
        );
        Ok(())
    }

    /// Populate just enough state from a persisted request/response pair to
    /// build a release request, without reloading decryption keys.
    pub fn restore_license_for_release(
        &mut self,
        license_request: &[u8],
        license_response: &[u8],
        crypto_session: &CryptoSession,
        policy: &mut PolicyEngine,
    ) -> CdmResult<()> {
        if license_request.is_empty() || license_response.is_empty() {
            return Err(CdmError::EmptyLicenseResponse);
        }

        let signed_request = SignedMessage::decode(license_request)?;
        if signed_request.r#type != Some(MessageType::LicenseRequest as i32) {
            return Err(CdmError::InvalidResponseType(
                signed_request.r#type.unwrap_or(0),
            ));
        }
        self.key_request = signed_request.msg.unwrap_or_default();

        let signed_response = SignedMessage::decode(license_response)?;
        if signed_response.r#type != Some(MessageType::License as i32) {
            return Err(CdmError::InvalidResponseType(
                signed_response.r#type.unwrap_or(0),
            ));
        }
        if signed_response.signature.is_none() {
            return Err(CdmError::SignatureMissing);
        }
        let license = License::decode(signed_response.msg.as_deref().unwrap_or_default())?;

        if let Some(token) = &license.provider_client_token {
            self.provider_client_token = token.clone();
        }
        if let Some(token) = license.id.as_ref().and_then(|id| id.provider_session_token.clone())
        {
            self.provider_session_token = token;
        }
        if let Some(always) = license
            .policy
            .as_ref()
            .and_then(|p| p.always_include_client_id)
        {
            self.renew_with_client_id = always;
        }
        if signed_response.session_key.is_none() {
            return Err(CdmError::SessionKeysNotFound);
        }

        let has_token = license
            .id
            .as_ref()
            .and_then(|id| id.provider_session_token.as_ref())
            .is_some();
        if !has_token {
            self.handle_key_response(license_response, crypto_session, policy)?;
            return Ok(());
        }

        if let Some(url) = license.policy.as_ref().and_then(|p| p.renewal_server_url.as_ref())
        {
            self.server_url = url.clone();
        }

        // Existing keys expire; absent keys are not added.
        policy.set_license_for_release(&license, crypto_session);
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn prepare_client_id(
        &mut self,
        app_parameters: &AppParameterMap,
        provider_client_token: &[u8],
        crypto_session: &CryptoSession,
        license_request: &mut LicenseRequest,
    ) -> CdmResult<()> {
        let client_id = build_client_id(
            self.client_token_type,
            &self.client_token,
            &self.device_id,
            &self.app_id,
            app_parameters,
            provider_client_token,
            crypto_session,
        );

        if self.use_privacy_mode {
            if !self.service_certificate.has_certificate() {
                return Err(CdmError::PrivacyMode);
            }
            let encrypted = self.service_certificate.encrypt_client_id(&client_id)?;
            license_request.encrypted_client_id = Some(encrypted);
            license_request.client_id = None;
        } else {
            license_request.client_id = Some(client_id);
        }
        Ok(())
    }

    fn prepare_content_id(
        &self,
        init_data: &InitData,
        license_type: LicenseType,
        request_id: &[u8],
        license_request: &mut LicenseRequest,
    ) -> CdmResult<()> {
        let proto_license_type = match license_type {
            LicenseType::Offline => ProtoLicenseType::Offline,
            LicenseType::Streaming | LicenseType::Temporary => ProtoLicenseType::Streaming,
            _ => return Err(CdmError::InvalidLicenseType),
        };

        let variant = if init_data.is_cenc() || init_data.is_hls() {
            ContentIdVariant::WidevinePsshData(PsshContentId {
                pssh_data: vec![init_data.data().to_vec()],
                license_type: Some(proto_license_type as i32),
                request_id: Some(request_id.to_vec()),
            })
        } else if init_data.is_webm() {
            ContentIdVariant::WebmKeyId(WebmKeyId {
                header: Some(init_data.data().to_vec()),
                license_type: Some(proto_license_type as i32),
                request_id: Some(request_id.to_vec()),
            })
        } else {
            return Err(CdmError::UnsupportedInitData(
                init_data.type_name().to_owned(),
            ));
        };

        license_request.content_id = Some(ContentIdentification {
            content_id_variant: Some(variant),
        });
        Ok(())
    }
}

fn handle_error_response(signed_message: &SignedMessage) -> CdmError {
    let Ok(license_error) = LicenseError::decode(signed_message.msg.as_deref().unwrap_or_default())
    else {
        return CdmError::KeyError;
    };
    match license_error
        .error_code
        .and_then(|e| license_error::Error::try_from(e).ok())
    {
        Some(license_error::Error::InvalidDrmDeviceCertificate) => CdmError::NeedProvisioning,
        Some(license_error::Error::RevokedDrmDeviceCertificate) => CdmError::DeviceRevoked,
        _ => CdmError::KeyError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::test_support::FakeClock;
    use crate::constants::PROVISIONING_SERVICE_CERTIFICATE;
    use crate::testutil::{
        MockTce, open_mock_crypto_session, signed_license_response, test_license, MOCK_NONCE,
    };
    use crate::tce::TceLocks;
    use crate::types::RequestedSecurityLevel;
    use wvcdm_proto::WidevinePsshData;

    const START: i64 = 1_413_517_500;

    fn parser(privacy: bool) -> (LicenseParser, PolicyEngine, CryptoSession) {
        let crypto = open_mock_crypto_session();
        let clock = Arc::new(FakeClock::at(START));
        let policy = PolicyEngine::new("sid1".into(), None, &crypto, clock.clone());
        let mut parser = LicenseParser::new("sid1".into(), clock);
        parser
            .init(
                b"client-token",
                ClientTokenType::DrmCert,
                b"serial",
                "app",
                privacy,
                &[],
                true,
            )
            .unwrap();
        (parser, policy, crypto)
    }

    fn cenc_init_data(key_ids: &[Vec<u8>]) -> InitData {
        let payload = WidevinePsshData {
            key_id: key_ids.to_vec(),
            ..Default::default()
        }
        .encode_to_vec();
        let mut bx = Vec::new();
        let size = 32 + payload.len();
        bx.extend_from_slice(&(size as u32).to_be_bytes());
        bx.extend_from_slice(b"pssh");
        bx.extend_from_slice(&[0u8; 4]);
        bx.extend_from_slice(&crate::constants::WIDEVINE_SYSTEM_ID);
        bx.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bx.extend_from_slice(&payload);
        InitData::cenc(&bx, false)
    }

    fn playable_policy() -> wvcdm_proto::license::Policy {
        wvcdm_proto::license::Policy {
            can_play: Some(true),
            license_duration_seconds: Some(3600),
            ..Default::default()
        }
    }

    #[test]
    fn initial_request_shape() {
        let (mut parser, _policy, crypto) = parser(false);
        let (message, _url) = parser
            .prepare_key_request(
                cenc_init_data(&[vec![0x11; 16]]),
                LicenseType::Streaming,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();

        let signed = SignedMessage::decode(message.as_slice()).unwrap();
        assert_eq!(signed.r#type, Some(MessageType::LicenseRequest as i32));
        assert!(signed.signature.is_some());

        let request = LicenseRequest::decode(signed.msg.as_deref().unwrap()).unwrap();
        assert_eq!(request.r#type, Some(RequestType::New as i32));
        assert_eq!(request.protocol_version, Some(ProtocolVersion::Version21 as i32));
        assert_eq!(request.key_control_nonce, Some(MOCK_NONCE));
        assert!(request.client_id.is_some());
        assert!(request.encrypted_client_id.is_none());
        match request.content_id.unwrap().content_id_variant.unwrap() {
            ContentIdVariant::WidevinePsshData(cenc) => {
                assert_eq!(cenc.license_type, Some(ProtoLicenseType::Streaming as i32));
                assert_eq!(cenc.pssh_data.len(), 1);
            }
            other => panic!("unexpected content id variant: {other:?}"),
        }
    }

    #[test]
    fn offline_request_marks_license_type() {
        let (mut parser, _policy, crypto) = parser(false);
        let (message, _) = parser
            .prepare_key_request(
                cenc_init_data(&[vec![0x11; 16]]),
                LicenseType::Offline,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();
        let signed = SignedMessage::decode(message.as_slice()).unwrap();
        let request = LicenseRequest::decode(signed.msg.as_deref().unwrap()).unwrap();
        match request.content_id.unwrap().content_id_variant.unwrap() {
            ContentIdVariant::WidevinePsshData(cenc) => {
                assert_eq!(cenc.license_type, Some(ProtoLicenseType::Offline as i32));
            }
            other => panic!("unexpected content id variant: {other:?}"),
        }
    }

    #[test]
    fn empty_init_data_is_rejected() {
        let (mut parser, _policy, crypto) = parser(false);
        let err = parser
            .prepare_key_request(
                InitData::cenc(&[], false),
                LicenseType::Streaming,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap_err();
        assert!(matches!(err, CdmError::InitDataNotFound));
    }

    #[test]
    fn privacy_mode_defers_request_until_certificate() {
        let (mut parser, mut policy, crypto) = parser(true);

        // First call: a service certificate request, init data stashed.
        let (message, _) = parser
            .prepare_key_request(
                cenc_init_data(&[vec![0x11; 16]]),
                LicenseType::Streaming,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();
        let signed = SignedMessage::decode(message.as_slice()).unwrap();
        assert_eq!(
            signed.r#type,
            Some(MessageType::ServiceCertificateRequest as i32)
        );
        assert!(parser.has_stored_init_data());

        // Server responds with a certificate; parser installs it.
        let response = SignedMessage {
            r#type: Some(MessageType::ServiceCertificate as i32),
            msg: Some(PROVISIONING_SERVICE_CERTIFICATE.to_vec()),
            ..Default::default()
        }
        .encode_to_vec();
        let outcome = parser
            .handle_key_response(&response, &crypto, &mut policy)
            .unwrap();
        assert_eq!(outcome, AddKeyOutcome::ServiceCertificateLoaded);

        // Second call with empty init data replays the stash and encrypts
        // the client id.
        let (message, _) = parser
            .prepare_key_request(
                InitData::cenc(&[], false),
                LicenseType::Streaming,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();
        let signed = SignedMessage::decode(message.as_slice()).unwrap();
        assert_eq!(signed.r#type, Some(MessageType::LicenseRequest as i32));
        let request = LicenseRequest::decode(signed.msg.as_deref().unwrap()).unwrap();
        assert!(request.client_id.is_none());
        assert!(request.encrypted_client_id.is_some());
        assert!(!parser.has_stored_init_data());
    }

    #[test]
    fn license_response_loads_keys() {
        let (mut parser, mut policy, crypto) = parser(false);
        parser
            .prepare_key_request(
                cenc_init_data(&[b"key1".to_vec()]),
                LicenseType::Streaming,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();

        let license = test_license(playable_policy(), START, &[b"key1".to_vec()]);
        let outcome = parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap();
        assert_eq!(outcome, AddKeyOutcome::KeysLoaded);
        assert!(parser.is_key_loaded(b"key1"));
        assert!(policy.can_decrypt_content(b"key1"));
        assert_eq!(parser.license_key_type(), LicenseKeyType::Content);
    }

    #[test]
    fn content_key_padding_is_stripped() {
        let license = test_license(playable_policy(), START, &[b"key1".to_vec()]);
        let keys = extract_content_keys(&license);
        assert_eq!(keys.len(), 1);
        // 32-byte container key = 16 bytes of material + one padding block.
        assert_eq!(keys[0].key_data.len(), 16);
    }

    #[test]
    fn error_response_maps_error_codes() {
        let (mut parser, mut policy, crypto) = parser(false);
        let error_response = |code: license_error::Error| {
            SignedMessage {
                r#type: Some(MessageType::ErrorResponse as i32),
                msg: Some(
                    LicenseError {
                        error_code: Some(code as i32),
                    }
                    .encode_to_vec(),
                ),
                ..Default::default()
            }
            .encode_to_vec()
        };

        assert!(matches!(
            parser.handle_key_response(
                &error_response(license_error::Error::InvalidDrmDeviceCertificate),
                &crypto,
                &mut policy,
            ),
            Err(CdmError::NeedProvisioning)
        ));
        assert!(matches!(
            parser.handle_key_response(
                &error_response(license_error::Error::RevokedDrmDeviceCertificate),
                &crypto,
                &mut policy,
            ),
            Err(CdmError::DeviceRevoked)
        ));
        assert!(matches!(
            parser.handle_key_response(
                &error_response(license_error::Error::ServiceUnavailable),
                &crypto,
                &mut policy,
            ),
            Err(CdmError::KeyError)
        ));
    }

    #[test]
    fn missing_session_key_is_rejected() {
        let (mut parser, mut policy, crypto) = parser(false);
        let license = test_license(playable_policy(), START, &[b"key1".to_vec()]);
        let mut signed = SignedMessage::decode(
            signed_license_response(&license).as_slice(),
        )
        .unwrap();
        signed.session_key = None;
        let err = parser
            .handle_key_response(&signed.encode_to_vec(), &crypto, &mut policy)
            .unwrap_err();
        assert!(matches!(err, CdmError::SessionKeysNotFound));
    }

    #[test]
    fn renewable_license_requires_mac_keys() {
        let (mut parser, mut policy, crypto) = parser(false);
        let mut license = test_license(
            wvcdm_proto::license::Policy {
                can_play: Some(true),
                can_renew: Some(true),
                ..Default::default()
            },
            START,
            &[b"key1".to_vec()],
        );
        // No SIGNING container at all: renewable licenses must carry one.
        let err = parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap_err();
        assert!(matches!(err, CdmError::KeySize(_)));

        // Correctly-sized MAC material passes.
        license.key.push(KeyContainer {
            iv: Some(vec![1u8; KEY_IV_SIZE]),
            key: Some(vec![2u8; 2 * MAC_KEY_SIZE + 16]),
            r#type: Some(ProtoKeyType::Signing as i32),
            ..Default::default()
        });
        parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap();
    }

    #[test]
    fn entitlement_license_and_embedded_key_rotation() {
        let tce = MockTce::new();
        let crypto =
            CryptoSession::open(tce.clone(), TceLocks::new(), RequestedSecurityLevel::Default)
                .unwrap();
        let clock = Arc::new(FakeClock::at(START));
        let mut policy = PolicyEngine::new("sid1".into(), None, &crypto, clock.clone());
        let mut parser = LicenseParser::new("sid1".into(), clock);
        parser
            .init(
                b"client-token",
                ClientTokenType::DrmCert,
                b"serial",
                "app",
                false,
                &[],
                true,
            )
            .unwrap();
        let entitlement_id = b"ent-key-id".to_vec();
        let content_id = b"content-key-id".to_vec();

        let mut license = test_license(playable_policy(), START, &[]);
        license.key.push(KeyContainer {
            id: Some(entitlement_id.clone()),
            iv: Some(vec![1u8; 16]),
            key: Some(vec![2u8; 48]), // 32-byte key + padding block
            r#type: Some(ProtoKeyType::Entitlement as i32),
            ..Default::default()
        });

        parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap();
        assert_eq!(parser.license_key_type(), LicenseKeyType::Entitlement);

        // Rotation: wrapped key arrives via init data.
        let wrapped = EntitledKey {
            entitlement_key_id: Some(entitlement_id.clone()),
            key_id: Some(content_id.clone()),
            // 16-byte key + 16 bytes PKCS#5 padding.
            key: Some(vec![9u8; 32]),
            iv: Some(vec![4u8; 16]),
            ..Default::default()
        };
        let payload = WidevinePsshData {
            entitled_keys: vec![wrapped],
            ..Default::default()
        }
        .encode_to_vec();
        let mut bx = Vec::new();
        let size = 32 + payload.len();
        bx.extend_from_slice(&(size as u32).to_be_bytes());
        bx.extend_from_slice(b"pssh");
        bx.extend_from_slice(&[0u8; 4]);
        bx.extend_from_slice(&crate::constants::WIDEVINE_SYSTEM_ID);
        bx.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bx.extend_from_slice(&payload);
        let init_data = InitData::cenc(&bx, true);
        assert!(init_data.contains_entitled_keys());

        parser
            .handle_embedded_key_data(&init_data, &crypto, &mut policy)
            .unwrap();
        assert!(parser.is_key_loaded(&content_id));
        assert!(policy.can_decrypt_content(&content_id));

        // The TCE received the wrapped key truncated to key-material size.
        let state = tce.state.lock().unwrap();
        assert_eq!(state.loaded_entitled_keys.len(), 1);
        assert_eq!(state.loaded_entitled_keys[0].key_data.len(), CONTENT_KEY_SIZE);
        assert_eq!(state.loaded_entitled_keys[0].entitlement_key_id, entitlement_id);
    }

    #[test]
    fn short_entitled_key_is_rejected() {
        let (mut parser, mut policy, crypto) = parser(false);
        let entitlement_id = b"ent".to_vec();
        let mut license = test_license(playable_policy(), START, &[]);
        license.key.push(KeyContainer {
            id: Some(entitlement_id.clone()),
            iv: Some(vec![1u8; 16]),
            key: Some(vec![2u8; 48]),
            r#type: Some(ProtoKeyType::Entitlement as i32),
            ..Default::default()
        });
        parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap();

        let wrapped = EntitledKey {
            entitlement_key_id: Some(entitlement_id),
            key_id: Some(b"content".to_vec()),
            key: Some(vec![9u8; CONTENT_KEY_SIZE - 1]),
            iv: Some(vec![4u8; 16]),
            ..Default::default()
        };
        let err = parser
            .handle_new_entitled_keys(&[wrapped], &crypto, &mut policy)
            .unwrap_err();
        assert!(matches!(err, CdmError::KeySize(_)));
    }

    #[test]
    fn renewal_request_and_response() {
        let (mut parser, mut policy, crypto) = parser(false);
        parser
            .prepare_key_request(
                cenc_init_data(&[b"key1".to_vec()]),
                LicenseType::Streaming,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();
        let policy_proto = wvcdm_proto::license::Policy {
            can_play: Some(true),
            can_renew: Some(true),
            license_duration_seconds: Some(3600),
            ..Default::default()
        };
        let mut license = test_license(policy_proto.clone(), START, &[b"key1".to_vec()]);
        license.key.push(KeyContainer {
            iv: Some(vec![1u8; KEY_IV_SIZE]),
            key: Some(vec![2u8; 2 * MAC_KEY_SIZE + 16]),
            r#type: Some(ProtoKeyType::Signing as i32),
            ..Default::default()
        });
        parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap();

        let (message, _) = parser
            .prepare_key_update_request(true, &AppParameterMap::new(), None, &crypto, &policy)
            .unwrap();
        let signed = SignedMessage::decode(message.as_slice()).unwrap();
        let request = LicenseRequest::decode(signed.msg.as_deref().unwrap()).unwrap();
        assert_eq!(request.r#type, Some(RequestType::Renewal as i32));
        match request.content_id.unwrap().content_id_variant.unwrap() {
            ContentIdVariant::ExistingLicense(existing) => {
                assert!(existing.license_id.is_some());
            }
            other => panic!("unexpected content id variant: {other:?}"),
        }

        // Renewal response with a bumped version refreshes keys.
        let mut renewed = test_license(policy_proto, START + 100, &[b"key1".to_vec()]);
        if let Some(id) = renewed.id.as_mut() {
            id.version = Some(2);
        }
        parser
            .handle_key_update_response(
                true,
                &signed_license_response(&renewed),
                &crypto,
                &mut policy,
            )
            .unwrap();
    }

    #[test]
    fn renewal_prohibited_without_can_renew() {
        let (mut parser, mut policy, crypto) = parser(false);
        let license = test_license(playable_policy(), START, &[b"key1".to_vec()]);
        parser
            .handle_key_response(&signed_license_response(&license), &crypto, &mut policy)
            .unwrap();
        let err = parser
            .prepare_key_update_request(true, &AppParameterMap::new(), None, &crypto, &policy)
            .unwrap_err();
        assert!(matches!(err, CdmError::RenewalProhibited));
    }

    #[test]
    fn release_response_frees_usage_information() {
        let locks = TceLocks::new();
        let tce = MockTce::new();
        let crypto =
            CryptoSession::open(tce.clone(), locks, RequestedSecurityLevel::Default).unwrap();
        let clock = Arc::new(FakeClock::at(START));
        let mut policy = PolicyEngine::new("sid1".into(), None, &crypto, clock.clone());
        let mut parser = LicenseParser::new("sid1".into(), clock);
        parser
            .init(
                b"client-token",
                ClientTokenType::DrmCert,
                b"serial",
                "app",
                false,
                &[],
                true,
            )
            .unwrap();

        let mut license = test_license(playable_policy(), START, &[b"key1".to_vec()]);
        if let Some(id) = license.id.as_mut() {
            id.provider_session_token = Some(b"pst_xyz".to_vec());
        }
        parser
            .handle_key_update_response(
                false,
                &signed_license_response(&license),
                &crypto,
                &mut policy,
            )
            .unwrap();
        assert_eq!(parser.provider_session_token(), b"pst_xyz");
        assert_eq!(
            tce.state.lock().unwrap().released_tokens,
            vec![b"pst_xyz".to_vec()]
        );
    }

    #[test]
    fn restore_offline_license_reinstalls_playback_times() {
        let (mut parser, mut policy, crypto) = parser(false);

        // Build a stored request/response pair the way a live session
        // would have.
        let (request, _) = parser
            .prepare_key_request(
                cenc_init_data(&[b"key1".to_vec()]),
                LicenseType::Offline,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();
        let policy_proto = wvcdm_proto::license::Policy {
            can_play: Some(true),
            can_persist: Some(true),
            ..Default::default()
        };
        let mut license = test_license(policy_proto, 1000, &[b"key1".to_vec()]);
        if let Some(id) = license.id.as_mut() {
            id.r#type = Some(ProtoLicenseType::Offline as i32);
        }
        let response = signed_license_response(&license);

        let mut fresh = LicenseParser::new("sid2".into(), Arc::new(FakeClock::at(START)));
        fresh
            .init(
                b"client-token",
                ClientTokenType::DrmCert,
                b"serial",
                "app",
                false,
                &[],
                true,
            )
            .unwrap();
        fresh
            .restore_offline_license(
                &request,
                &response,
                &[],
                1000,
                1010,
                1050,
                None,
                &crypto,
                &mut policy,
            )
            .unwrap();
        assert!(fresh.is_offline());
        assert_eq!(policy.playback_start_time(), 1000);
        assert_eq!(policy.last_playback_time(), 1010);
        assert_eq!(policy.grace_period_end_time(), 1050);
    }

    #[test]
    fn restore_for_release_expires_keys_without_loading() {
        let (mut parser, mut policy, crypto) = parser(false);
        let (request, _) = parser
            .prepare_key_request(
                cenc_init_data(&[b"key1".to_vec()]),
                LicenseType::Offline,
                &AppParameterMap::new(),
                &crypto,
            )
            .unwrap();
        let mut license = test_license(playable_policy(), START, &[b"key1".to_vec()]);
        if let Some(id) = license.id.as_mut() {
            id.provider_session_token = Some(b"pst_off".to_vec());
        }
        let response = signed_license_response(&license);

        let mut fresh = LicenseParser::new("sid3".into(), Arc::new(FakeClock::at(START)));
        fresh
            .init(
                b"client-token",
                ClientTokenType::DrmCert,
                b"serial",
                "app",
                false,
                &[],
                true,
            )
            .unwrap();
        fresh
            .restore_license_for_release(&request, &response, &crypto, &mut policy)
            .unwrap();
        assert_eq!(fresh.provider_session_token(), b"pst_off");
        assert!(!fresh.is_key_loaded(b"key1"));
    }
}
