//! Service certificates encrypt the ClientIdentification message carried in
//! provisioning, license, renewal and release requests, and authenticate
//! server-signed provisioning responses. They are usually supplied by the
//! application; with privacy mode on and none supplied, the CDM requests one
//! from the target server. Once established for a session it does not
//! change.

use prost::Message;
use rand::RngCore;
use wvcdm_proto::{
    ClientIdentification, DrmCertificate, EncryptedClientIdentification, SignedDrmCertificate,
    SignedMessage, signed_message::MessageType,
};

use crate::constants::{ROOT_PUBLIC_KEY_E, ROOT_PUBLIC_KEY_N};
use crate::crypto::{aes, padding, rsa};
use crate::error::{CdmError, CdmResult};

/// A parsed, root-verified service certificate.
#[derive(Default)]
pub struct ServiceCertificate {
    certificate: Vec<u8>,
    serial_number: Vec<u8>,
    provider_id: String,
    public_key_der: Vec<u8>,
    has_certificate: bool,
}

impl ServiceCertificate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a serialized SignedDrmCertificate. The embedded signature is
    /// verified against the hard-coded root public key. An empty input
    /// resets to the uninitialized state.
    pub fn init(&mut self, signed_certificate: &[u8]) -> CdmResult<()> {
        *self = Self::default();
        if signed_certificate.is_empty() {
            return Ok(());
        }

        let signed = SignedDrmCertificate::decode(signed_certificate)?;
        let cert_bytes = signed
            .drm_certificate
            .as_deref()
            .ok_or_else(|| CdmError::CertificateDecode("missing drm_certificate".into()))?;
        let signature = signed
            .signature
            .as_deref()
            .ok_or_else(|| CdmError::CertificateDecode("missing signature".into()))?;

        let root_der = rsa::public_key_der_from_raw(&ROOT_PUBLIC_KEY_N, &ROOT_PUBLIC_KEY_E)?;
        rsa::rsa_pss_sha1_verify(&root_der, cert_bytes, signature)?;

        let cert = DrmCertificate::decode(cert_bytes)?;
        let public_key_der = cert
            .public_key
            .ok_or_else(|| CdmError::CertificateDecode("missing public key".into()))?;

        self.certificate = signed_certificate.to_vec();
        self.serial_number = cert.serial_number.unwrap_or_default();
        self.provider_id = cert.provider_id.unwrap_or_default();
        self.public_key_der = public_key_der;
        self.has_certificate = true;
        Ok(())
    }

    pub fn has_certificate(&self) -> bool {
        self.has_certificate
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    /// Verify a server signature (RSA-PSS-SHA1) with this certificate's key.
    pub fn verify_signed_message(&self, message: &[u8], signature: &[u8]) -> CdmResult<()> {
        if !self.has_certificate {
            return Err(CdmError::PrivacyMode);
        }
        rsa::rsa_pss_sha1_verify(&self.public_key_der, message, signature)
    }

    /// Encrypt a ClientIdentification under this certificate: AES-CBC-128
    /// with a fresh privacy key/IV, the key RSA-OAEP-wrapped to the
    /// certificate's public key.
    pub fn encrypt_client_id(
        &self,
        clear_client_id: &ClientIdentification,
    ) -> CdmResult<EncryptedClientIdentification> {
        if !self.has_certificate {
            return Err(CdmError::PrivacyMode);
        }

        let mut privacy_key = [0u8; 16];
        let mut privacy_iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut privacy_key);
        rand::thread_rng().fill_bytes(&mut privacy_iv);

        let padded = padding::pkcs7_pad(&clear_client_id.encode_to_vec(), 16);
        let encrypted_client_id = aes::aes_cbc_encrypt(&privacy_key, &privacy_iv, &padded);
        let encrypted_privacy_key = rsa::rsa_oaep_sha1_encrypt(&self.public_key_der, &privacy_key)?;

        Ok(EncryptedClientIdentification {
            provider_id: Some(self.provider_id.clone()),
            service_certificate_serial_number: Some(self.serial_number.clone()),
            encrypted_client_id: Some(encrypted_client_id),
            encrypted_client_id_iv: Some(privacy_iv.to_vec()),
            encrypted_privacy_key: Some(encrypted_privacy_key),
        })
    }

    /// Build the outgoing service-certificate request message.
    pub fn request() -> Vec<u8> {
        SignedMessage {
            r#type: Some(MessageType::ServiceCertificateRequest as i32),
            ..Default::default()
        }
        .encode_to_vec()
    }

    /// Extract the signed certificate from a service-certificate response.
    pub fn parse_response(response: &[u8]) -> CdmResult<Vec<u8>> {
        let signed = SignedMessage::decode(response)?;
        if signed.r#type != Some(MessageType::ServiceCertificate as i32) {
            return Err(CdmError::InvalidResponseType(signed.r#type.unwrap_or(0)));
        }
        signed.msg.ok_or(CdmError::EmptyLicenseResponse)
    }
}
