//! Device provisioning: exchange a signed per-device message for a DRM
//! certificate stored persistently (or handed back to the caller for x509).

use std::sync::Arc;

use prost::Message;
use tracing::warn;
use wvcdm_proto::signed_provisioning_message::ProtocolVersion as ProvisioningProtocolVersion;
use wvcdm_proto::{
    ProvisioningOptions, ProvisioningRequest, ProvisioningResponse, SignedProvisioningMessage,
    provisioning_options,
};

use crate::client_identification::build_client_id;
use crate::constants::{PROVISIONING_SERVER_URL, PROVISIONING_SERVICE_CERTIFICATE};
use crate::device_files::DeviceFiles;
use crate::error::{CdmError, CdmResult};
use crate::properties::HostProperties;
use crate::service_certificate::ServiceCertificate;
use crate::tce::{CryptoSession, TceLocks, TrustedCryptoEngine};
use crate::types::{AppParameterMap, CertificateType, ClientTokenType, RequestedSecurityLevel};

const JSON_RESPONSE_START: &str = "\"signedResponse\": \"";

pub struct CertificateProvisioning {
    engine: Arc<dyn TrustedCryptoEngine>,
    locks: Arc<TceLocks>,
    service_certificate: ServiceCertificate,
    crypto_session: Option<CryptoSession>,
    cert_type: CertificateType,
}

impl CertificateProvisioning {
    pub fn new(engine: Arc<dyn TrustedCryptoEngine>, locks: Arc<TceLocks>) -> Self {
        CertificateProvisioning {
            engine,
            locks,
            service_certificate: ServiceCertificate::new(),
            crypto_session: None,
            cert_type: CertificateType::WidevineDrm,
        }
    }

    /// Install the service certificate used to encrypt the client identity;
    /// falls back to the built-in production certificate.
    pub fn init(&mut self, service_certificate: &[u8]) -> CdmResult<()> {
        if service_certificate.is_empty() {
            self.service_certificate
                .init(&PROVISIONING_SERVICE_CERTIFICATE)
        } else {
            self.service_certificate.init(service_certificate)
        }
    }

    /// Compose a provisioning request. Returns (request, default URL); the
    /// request is web-safe base64 without padding unless the host says
    /// provisioning messages are binary.
    #[allow(clippy::too_many_arguments)]
    pub fn get_provisioning_request(
        &mut self,
        requested_level: RequestedSecurityLevel,
        cert_type: CertificateType,
        cert_authority: &str,
        origin: &str,
        spoid: &str,
        host: &HostProperties,
    ) -> CdmResult<(Vec<u8>, String)> {
        let crypto_session =
            CryptoSession::open(self.engine.clone(), self.locks.clone(), requested_level)?;

        if !self.service_certificate.has_certificate() {
            return Err(CdmError::PrivacyMode);
        }

        // The pre-provisioning token, never the DRM certificate.
        let token_type = self.engine.provisioning_method(requested_level)?;
        let token = self.engine.provisioning_token(requested_level)?;

        let client_id = build_client_id(
            token_type,
            &token,
            &[],
            "",
            &AppParameterMap::new(),
            &[],
            &crypto_session,
        );
        let encrypted_client_id = self.service_certificate.encrypt_client_id(&client_id)?;

        let mut request = ProvisioningRequest {
            encrypted_client_id: Some(encrypted_client_id),
            ..Default::default()
        };

        // The server passes the nonce bytes back verbatim.
        let nonce = match crypto_session.generate_nonce() {
            Ok(nonce) => nonce,
            Err(e @ (CdmError::SessionLostState | CdmError::SystemInvalidated)) => return Err(e),
            Err(_) => return Err(CdmError::NonceGeneration),
        };
        request.nonce = Some(nonce.to_le_bytes().to_vec());

        let certificate_type = match cert_type {
            CertificateType::WidevineDrm => provisioning_options::CertificateType::WidevineDrm,
            CertificateType::X509 => provisioning_options::CertificateType::X509,
        };
        request.options = Some(ProvisioningOptions {
            certificate_type: Some(certificate_type as i32),
            certificate_authority: Some(cert_authority.to_owned()),
        });
        self.cert_type = cert_type;

        self.set_spoid_parameter(origin, spoid, host, requested_level, &mut request)?;

        let serialized = request.encode_to_vec();
        let signature = crypto_session.prepare_request(&serialized, true)?;
        if signature.is_empty() {
            return Err(CdmError::SignatureEmpty);
        }

        let protocol_version = if token_type == ClientTokenType::OemCert {
            ProvisioningProtocolVersion::Version3
        } else {
            ProvisioningProtocolVersion::Version2
        };
        let signed = SignedProvisioningMessage {
            message: Some(serialized),
            signature: Some(signature),
            protocol_version: Some(protocol_version as i32),
        }
        .encode_to_vec();

        self.crypto_session = Some(crypto_session);

        let request_bytes = if host.provisioning_messages_are_binary {
            signed
        } else {
            data_encoding::BASE64URL_NOPAD
                .encode(&signed)
                .into_bytes()
        };
        Ok((request_bytes, PROVISIONING_SERVER_URL.to_owned()))
    }

    /// One of spoid, provider id or the legacy stable id identifies the
    /// origin to the provisioning server. Leaving all unset is valid.
    fn set_spoid_parameter(
        &self,
        origin: &str,
        spoid: &str,
        host: &HostProperties,
        requested_level: RequestedSecurityLevel,
        request: &mut ProvisioningRequest,
    ) -> CdmResult<()> {
        if !spoid.is_empty() {
            request.spoid = Some(spoid.as_bytes().to_vec());
        } else if host.use_provider_id_in_provisioning_request {
            if self.service_certificate.provider_id().is_empty() {
                return Err(CdmError::CertificateDecode(
                    "service certificate has no provider id".into(),
                ));
            }
            request.provider_id = Some(self.service_certificate.provider_id().to_owned());
        } else if !origin.is_empty() {
            let mut stable_id = self.engine.device_unique_id(requested_level)?;
            stable_id.extend_from_slice(origin.as_bytes());
            request.stable_id = Some(stable_id);
        }
        Ok(())
    }

    /// Verify and process a provisioning response. For Widevine DRM certs
    /// the (certificate, wrapped key) pair is also stored through
    /// `device_files`; for x509 it is only returned.
    pub fn handle_provisioning_response(
        &mut self,
        device_files: &DeviceFiles,
        response_message: &[u8],
        host: &HostProperties,
    ) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        if response_message.is_empty() {
            return Err(CdmError::ProvisioningResponse("empty response"));
        }
        let response = if host.provisioning_messages_are_binary {
            response_message.to_vec()
        } else {
            extract_and_decode_signed_message(response_message)?
        };

        let signed = SignedProvisioningMessage::decode(response.as_slice())
            .map_err(|_| CdmError::ProvisioningResponse("signed message parse failed"))?;
        let message = signed
            .message
            .as_deref()
            .ok_or(CdmError::ProvisioningResponse("message not found"))?;
        let signature = signed
            .signature
            .as_deref()
            .ok_or(CdmError::ProvisioningResponse("signature not found"))?;

        let provisioning_response = ProvisioningResponse::decode(message)
            .map_err(|_| CdmError::ProvisioningResponse("inner message parse failed"))?;
        let new_private_key = provisioning_response
            .device_rsa_key
            .as_deref()
            .ok_or(CdmError::ProvisioningResponse("device key not found"))?;

        let crypto_session = self
            .crypto_session
            .as_ref()
            .ok_or(CdmError::NotInitialized)?;

        // Provisioning 3.0 responses are server-signed; verify before
        // trusting the payload.
        let requested_level = crypto_session.requested_security_level();
        if self.engine.provisioning_method(requested_level)? == ClientTokenType::OemCert {
            self.service_certificate
                .verify_signed_message(message, signature)?;
        }

        let nonce = provisioning_response.nonce.as_deref().unwrap_or_default();
        let iv = provisioning_response
            .device_rsa_key_iv
            .as_deref()
            .unwrap_or_default();
        let wrapping_key = provisioning_response
            .wrapping_key
            .as_deref()
            .unwrap_or_default();

        let wrapped_private_key = crypto_session.rewrap_certificate(
            message,
            signature,
            nonce,
            new_private_key,
            iv,
            wrapping_key,
        )?;

        let device_certificate = provisioning_response
            .device_certificate
            .unwrap_or_default();
        self.crypto_session = None;

        if self.cert_type == CertificateType::X509 {
            return Ok((device_certificate, wrapped_private_key));
        }

        device_files.store_certificate(&device_certificate, &wrapped_private_key)?;
        Ok((device_certificate, wrapped_private_key))
    }
}

/// Provisioning responses arrive as base64 inside a JSON wrapper unless the
/// platform says binary. Extract and decode the embedded message.
fn extract_and_decode_signed_message(provisioning_response: &[u8]) -> CdmResult<Vec<u8>> {
    let text = std::str::from_utf8(provisioning_response)
        .map_err(|_| CdmError::ProvisioningResponse("response is not UTF-8"))?;
    let start = text
        .find(JSON_RESPONSE_START)
        .ok_or(CdmError::ProvisioningResponse("missing signedResponse"))?
        + JSON_RESPONSE_START.len();
    let end = text[start..]
        .find('"')
        .ok_or(CdmError::ProvisioningResponse("unterminated signedResponse"))?;
    let encoded = &text[start..start + end];
    if encoded.is_empty() {
        return Err(CdmError::ProvisioningResponse("empty signedResponse"));
    }
    data_encoding::BASE64URL_NOPAD
        .decode(encoded.as_bytes())
        .map_err(|e| {
            warn!(error = %e, "provisioning response base64 decode failed");
            CdmError::ProvisioningResponse("invalid base64")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::MemoryStore;
    use crate::device_files::ReservedKeySetIds;
    use crate::testutil::MockTce;
    use crate::types::SecurityLevel;

    fn fixture() -> (Arc<MockTce>, CertificateProvisioning, DeviceFiles) {
        let tce = MockTce::new();
        let locks = TceLocks::new();
        let mut provisioning = CertificateProvisioning::new(tce.clone(), locks);
        provisioning.init(&[]).unwrap();
        let files = DeviceFiles::new(
            Arc::new(MemoryStore::new()),
            SecurityLevel::L1,
            Arc::new(ReservedKeySetIds::new()),
        );
        (tce, provisioning, files)
    }

    fn scripted_response() -> Vec<u8> {
        let inner = ProvisioningResponse {
            device_rsa_key: Some(b"enc-private-key".to_vec()),
            device_rsa_key_iv: Some(vec![1u8; 16]),
            device_certificate: Some(b"device-certificate".to_vec()),
            nonce: Some(crate::testutil::MOCK_NONCE.to_le_bytes().to_vec()),
            ..Default::default()
        };
        SignedProvisioningMessage {
            message: Some(inner.encode_to_vec()),
            signature: Some(b"server-signature".to_vec()),
            protocol_version: Some(ProvisioningProtocolVersion::Version2 as i32),
        }
        .encode_to_vec()
    }

    #[test]
    fn request_is_web_safe_base64_by_default() {
        let (_, mut provisioning, _) = fixture();
        let host = HostProperties::default();
        let (request, url) = provisioning
            .get_provisioning_request(
                RequestedSecurityLevel::Default,
                CertificateType::WidevineDrm,
                "authority",
                "example.com",
                "",
                &host,
            )
            .unwrap();
        assert_eq!(url, PROVISIONING_SERVER_URL);

        let decoded = data_encoding::BASE64URL_NOPAD.decode(&request).unwrap();
        let signed = SignedProvisioningMessage::decode(decoded.as_slice()).unwrap();
        assert_eq!(
            signed.protocol_version,
            Some(ProvisioningProtocolVersion::Version2 as i32)
        );
        let inner = ProvisioningRequest::decode(signed.message.as_deref().unwrap()).unwrap();
        // Client identity travels encrypted, identified by provider id.
        assert!(inner.encrypted_client_id.is_some());
        assert!(inner.client_id.is_none());
        assert_eq!(inner.provider_id.as_deref(), Some("widevine.com"));
        assert_eq!(
            inner.nonce.as_deref(),
            Some(crate::testutil::MOCK_NONCE.to_le_bytes().as_slice())
        );
    }

    #[test]
    fn binary_mode_skips_base64() {
        let (_, mut provisioning, _) = fixture();
        let host = HostProperties {
            provisioning_messages_are_binary: true,
            ..Default::default()
        };
        let (request, _) = provisioning
            .get_provisioning_request(
                RequestedSecurityLevel::Default,
                CertificateType::WidevineDrm,
                "",
                "",
                "",
                &host,
            )
            .unwrap();
        assert!(SignedProvisioningMessage::decode(request.as_slice()).is_ok());
    }

    #[test]
    fn explicit_spoid_takes_precedence() {
        let (_, mut provisioning, _) = fixture();
        let host = HostProperties::default();
        let (request, _) = provisioning
            .get_provisioning_request(
                RequestedSecurityLevel::Default,
                CertificateType::WidevineDrm,
                "",
                "example.com",
                "spoid-value",
                &host,
            )
            .unwrap();
        let decoded = data_encoding::BASE64URL_NOPAD.decode(&request).unwrap();
        let signed = SignedProvisioningMessage::decode(decoded.as_slice()).unwrap();
        let inner = ProvisioningRequest::decode(signed.message.as_deref().unwrap()).unwrap();
        assert_eq!(inner.spoid.as_deref(), Some(b"spoid-value".as_slice()));
        assert!(inner.provider_id.is_none());
    }

    #[test]
    fn legacy_stable_id_concatenates_device_id_and_origin() {
        let (_, mut provisioning, _) = fixture();
        let host = HostProperties {
            use_provider_id_in_provisioning_request: false,
            ..Default::default()
        };
        let (request, _) = provisioning
            .get_provisioning_request(
                RequestedSecurityLevel::Default,
                CertificateType::WidevineDrm,
                "",
                "example.com",
                "",
                &host,
            )
            .unwrap();
        let decoded = data_encoding::BASE64URL_NOPAD.decode(&request).unwrap();
        let signed = SignedProvisioningMessage::decode(decoded.as_slice()).unwrap();
        let inner = ProvisioningRequest::decode(signed.message.as_deref().unwrap()).unwrap();
        assert_eq!(
            inner.stable_id.as_deref(),
            Some(b"mock-device-idexample.com".as_slice())
        );
    }

    #[test]
    fn response_rewraps_and_stores_certificate() {
        let (_, mut provisioning, files) = fixture();
        let host = HostProperties::default();
        provisioning
            .get_provisioning_request(
                RequestedSecurityLevel::Default,
                CertificateType::WidevineDrm,
                "",
                "",
                "",
                &host,
            )
            .unwrap();

        let encoded = data_encoding::BASE64URL_NOPAD.encode(&scripted_response());
        let json = format!("{{\"signedResponse\": \"{encoded}\"}}");

        let (cert, wrapped_key) = provisioning
            .handle_provisioning_response(&files, json.as_bytes(), &host)
            .unwrap();
        assert_eq!(cert, b"device-certificate");
        assert_eq!(wrapped_key, b"rewrapped:enc-private-key");

        let (stored_cert, stored_key) = files.retrieve_certificate().unwrap();
        assert_eq!(stored_cert, cert);
        assert_eq!(stored_key, wrapped_key);
    }

    #[test]
    fn malformed_json_wrapper_is_rejected() {
        let (_, mut provisioning, files) = fixture();
        let host = HostProperties::default();
        provisioning
            .get_provisioning_request(
                RequestedSecurityLevel::Default,
                CertificateType::WidevineDrm,
                "",
                "",
                "",
                &host,
            )
            .unwrap();
        assert!(matches!(
            provisioning.handle_provisioning_response(&files, b"not json", &host),
            Err(CdmError::ProvisioningResponse(_))
        ));
    }
}
