//! AES-CBC + truncated HMAC-SHA256 message envelope.
//!
//! Padding appends `padlen` repeated `padlen` times where
//! `padlen = 16 - (len mod 16)`, so an aligned plaintext gains a full
//! padding block (PKCS#7). The unpad check rejects `padlen` of zero, larger
//! than the block size, or larger than the data, and any trailing byte that
//! differs from `padlen`.
//!
//! Authentication is HMAC-SHA256 over ratchet header ‖ ciphertext body,
//! truncated to the first 8 bytes. The MAC is checked before any decryption
//! runs.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type Aes128CbcEnc = ::cbc::Encryptor<aes::Aes128>;
type Aes256CbcEnc = ::cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = ::cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = ::cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const AES_BLOCK_SIZE: usize = 16;
/// Truncated authentication tag length.
pub const SHORT_MAC_LENGTH: usize = 8;

/// AES-CBC encrypt with PKCS#7-style padding. Key must be 16 or 32 bytes,
/// IV must equal the block size.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::WrongBlockSize);
    }
    match key.len() {
        16 => Ok(Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(|_| CryptoError::WrongBlockSize)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        32 => Ok(Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|_| CryptoError::WrongBlockSize)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        _ => Err(CryptoError::UnsupportedKeySize),
    }
}

/// AES-CBC decrypt and strip padding. Padding violations surface as
/// `MsgPaddingFailed`; use [`aes_cbc_decrypt_supplement`] for the
/// supplement path so the caller can distinguish the two.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt_inner(key, iv, ciphertext, CryptoError::MsgPaddingFailed)
}

pub fn aes_cbc_decrypt_supplement(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    decrypt_inner(key, iv, ciphertext, CryptoError::SupPaddingFailed)
}

fn decrypt_inner(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    padding_error: CryptoError,
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::WrongBlockSize);
    }
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::WrongBlockSize);
    }
    match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::WrongBlockSize)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| padding_error),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::WrongBlockSize)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| padding_error),
        _ => Err(CryptoError::UnsupportedKeySize),
    }
}

/// Truncated HMAC-SHA256 over a sequence of slices.
pub fn hmac_trunc8(mac_key: &[u8], parts: &[&[u8]]) -> Result<[u8; SHORT_MAC_LENGTH], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; SHORT_MAC_LENGTH];
    out.copy_from_slice(&full[..SHORT_MAC_LENGTH]);
    Ok(out)
}

/// Constant-time verification of a truncated tag.
pub fn hmac_trunc8_verify(
    mac_key: &[u8],
    parts: &[&[u8]],
    tag: &[u8],
) -> Result<(), CryptoError> {
    if tag.len() != SHORT_MAC_LENGTH {
        return Err(CryptoError::MacCheckFailed);
    }
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_truncated_left(tag)
        .map_err(|_| CryptoError::MacCheckFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_both_key_sizes() {
        let iv = [0x24u8; AES_BLOCK_SIZE];
        let plaintext = b"attack at dawn";
        for key in [vec![0x11u8; 16], vec![0x22u8; 32]] {
            let ct = aes_cbc_encrypt(&key, &iv, plaintext).unwrap();
            assert_eq!(ct.len() % AES_BLOCK_SIZE, 0);
            let pt = aes_cbc_decrypt(&key, &iv, &ct).unwrap();
            assert_eq!(pt, plaintext);
        }
    }

    #[test]
    fn aligned_plaintext_gains_full_padding_block() {
        let key = [0x33u8; 32];
        let iv = [0x01u8; AES_BLOCK_SIZE];
        let plaintext = [0xaau8; 32];
        let ct = aes_cbc_encrypt(&key, &iv, &plaintext).unwrap();
        assert_eq!(ct.len(), plaintext.len() + AES_BLOCK_SIZE);
        assert_eq!(aes_cbc_decrypt(&key, &iv, &ct).unwrap(), plaintext);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = [0x44u8; 32];
        let iv = [0x02u8; AES_BLOCK_SIZE];
        let ct = aes_cbc_encrypt(&key, &iv, b"").unwrap();
        assert_eq!(ct.len(), AES_BLOCK_SIZE);
        assert!(aes_cbc_decrypt(&key, &iv, &ct).unwrap().is_empty());
    }

    #[test]
    fn rejects_wrong_iv_length() {
        let key = [0u8; 32];
        assert!(matches!(
            aes_cbc_encrypt(&key, &[0u8; 12], b"x"),
            Err(CryptoError::WrongBlockSize)
        ));
    }

    #[test]
    fn rejects_unsupported_key_size() {
        let iv = [0u8; AES_BLOCK_SIZE];
        assert!(matches!(
            aes_cbc_encrypt(&[0u8; 24], &iv, b"x"),
            Err(CryptoError::UnsupportedKeySize)
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails_padding_check() {
        let key = [0x55u8; 32];
        let iv = [0x03u8; AES_BLOCK_SIZE];
        let mut ct = aes_cbc_encrypt(&key, &iv, b"short").unwrap();
        // Flip a bit in the final block; the padding bytes change.
        let last = ct.len() - 1;
        ct[last] ^= 0x80;
        assert!(matches!(
            aes_cbc_decrypt(&key, &iv, &ct),
            Err(CryptoError::MsgPaddingFailed)
        ));
    }

    #[test]
    fn supplement_padding_error_is_distinct() {
        let key = [0x56u8; 32];
        let iv = [0x04u8; AES_BLOCK_SIZE];
        let mut ct = aes_cbc_encrypt(&key, &iv, b"supplement").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x80;
        assert!(matches!(
            aes_cbc_decrypt_supplement(&key, &iv, &ct),
            Err(CryptoError::SupPaddingFailed)
        ));
    }

    #[test]
    fn truncated_mac_verifies() {
        let mac_key = [0x66u8; 32];
        let tag = hmac_trunc8(&mac_key, &[b"header", b"body"]).unwrap();
        assert_eq!(tag.len(), SHORT_MAC_LENGTH);
        hmac_trunc8_verify(&mac_key, &[b"header", b"body"], &tag).unwrap();
    }

    #[test]
    fn truncated_mac_rejects_tampering() {
        let mac_key = [0x66u8; 32];
        let mut tag = hmac_trunc8(&mac_key, &[b"header", b"body"]).unwrap();
        tag[0] ^= 1;
        assert!(matches!(
            hmac_trunc8_verify(&mac_key, &[b"header", b"body"], &tag),
            Err(CryptoError::MacCheckFailed)
        ));
        assert!(matches!(
            hmac_trunc8_verify(&mac_key, &[b"header", b"tampered"], &tag),
            Err(CryptoError::MacCheckFailed)
        ));
    }
}
