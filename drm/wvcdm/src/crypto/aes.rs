use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};

/// AES-128-CBC encryption for privacy mode (ClientIdentification encryption).
///
/// Key: random 16-byte privacy key (generated per request).
/// IV: random 16-byte privacy IV (generated per request).
/// Plaintext: PKCS#7-padded serialized ClientIdentification bytes.
pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    debug_assert!(
        !plaintext.is_empty() && plaintext.len().is_multiple_of(16),
        "plaintext must be pre-padded to AES block size"
    );

    let cipher = Aes128::new(key.into());
    let mut ciphertext = Vec::with_capacity(plaintext.len());
    let mut prev = *iv;

    for chunk in plaintext.chunks_exact(16) {
        let mut block = [0u8; 16];
        for i in 0..16 {
            block[i] = chunk[i] ^ prev[i];
        }
        let mut block_ga = aes::cipher::generic_array::GenericArray::from(block);
        cipher.encrypt_block(&mut block_ga);
        prev.copy_from_slice(&block_ga);
        ciphertext.extend_from_slice(&block_ga);
    }

    ciphertext
}
