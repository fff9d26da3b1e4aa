use rsa::{
    BigUint, RsaPublicKey, oaep,
    pkcs1::DecodeRsaPublicKey,
    pss,
    traits::{PublicKeyParts, RandomizedEncryptor},
};
use sha1::Sha1;
use signature::Verifier;

use crate::error::CdmError;

/**
    RSA-PSS-SHA1 signature verification.

    Parameters (all protocol-mandated, not implementation choices):
      Hash: SHA-1 (NOT SHA-256)
      MGF: MGF1-SHA-1
      Salt length: 20 bytes (SHA-1 digest length)
      Trailer: 0xBC (standard)

    Used for service certificates (against the Widevine root public key) and
    for server-signed provisioning responses (against the service
    certificate's key). `message` is the raw serialized protobuf; the
    verifier hashes internally, so do not pre-hash.
*/
pub fn rsa_pss_sha1_verify(
    public_key_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CdmError> {
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)
        .map_err(|e| CdmError::RsaKeyParse(e.to_string()))?;
    let verifying_key = pss::VerifyingKey::<Sha1>::new_with_salt_len(public_key, 20);
    let signature = pss::Signature::try_from(signature).map_err(|_| CdmError::SignatureMismatch)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CdmError::SignatureMismatch)
}

/**
    RSA-OAEP-SHA1 encryption for privacy mode (wrapping the AES privacy key).

    Parameters (protocol-mandated):
      Hash: SHA-1
      MGF: MGF1-SHA-1
      Label: empty

    Key: DrmCertificate.public_key from the verified service certificate
    (DER-encoded PKCS#1 RSAPublicKey).
*/
pub fn rsa_oaep_sha1_encrypt(public_key_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CdmError> {
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_der)
        .map_err(|e| CdmError::RsaKeyParse(e.to_string()))?;
    let encrypting_key = oaep::EncryptingKey::<Sha1>::new(public_key);
    let mut rng = rsa::rand_core::OsRng;
    encrypting_key
        .encrypt_with_rng(&mut rng, plaintext)
        .map_err(|e| CdmError::RsaOperation(e.to_string()))
}

/// Build a PKCS#1 DER public key from raw big-endian modulus and exponent.
pub fn public_key_der_from_raw(n: &[u8], e: &[u8]) -> Result<Vec<u8>, CdmError> {
    use rsa::pkcs1::EncodeRsaPublicKey;
    let key = RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
        .map_err(|e| CdmError::RsaKeyParse(e.to_string()))?;
    let der = key
        .to_pkcs1_der()
        .map_err(|e| CdmError::RsaKeyParse(e.to_string()))?;
    Ok(der.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::traits::Decryptor;
    use signature::RandomizedSigner;

    fn test_key() -> RsaPrivateKey {
        let mut rng = rsa::rand_core::OsRng;
        RsaPrivateKey::new(&mut rng, 1024).unwrap()
    }

    #[test]
    fn verifies_pss_signature() {
        let key = test_key();
        let pub_der = key.to_public_key().to_pkcs1_der().unwrap();
        let signing_key = pss::SigningKey::<Sha1>::new_with_salt_len(key, 20);
        let mut rng = rsa::rand_core::OsRng;

        let message = b"signed service certificate body";
        let signature = signing_key.try_sign_with_rng(&mut rng, message).unwrap();
        let sig_bytes: Box<[u8]> = signature.into();

        rsa_pss_sha1_verify(pub_der.as_bytes(), message, &sig_bytes).unwrap();
        let err = rsa_pss_sha1_verify(pub_der.as_bytes(), b"different body", &sig_bytes)
            .unwrap_err();
        assert!(matches!(err, CdmError::SignatureMismatch));
    }

    #[test]
    fn oaep_encrypt_round_trips_with_private_key() {
        let key = test_key();
        let pub_der = key.to_public_key().to_pkcs1_der().unwrap();
        let plaintext = [0x5au8; 16];

        let ciphertext = rsa_oaep_sha1_encrypt(pub_der.as_bytes(), &plaintext).unwrap();
        let decrypting_key = oaep::DecryptingKey::<Sha1>::new(key);
        assert_eq!(decrypting_key.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn bad_der_is_rejected() {
        assert!(matches!(
            rsa_oaep_sha1_encrypt(b"not-a-key", b"data"),
            Err(CdmError::RsaKeyParse(_))
        ));
    }

    #[test]
    fn raw_key_builds_valid_der() {
        let key = test_key().to_public_key();
        let n = key.n().to_bytes_be();
        let e = key.e().to_bytes_be();
        let der = public_key_der_from_raw(&n, &e).unwrap();
        assert_eq!(der, key.to_pkcs1_der().unwrap().as_bytes());
    }
}
