//! AES-256-CBC payload encryption with PBKDF2 key/IV derivation.
//!
//! Key material: PBKDF2-HMAC(password, salt, 1000 iterations) over the
//! configured hash produces 48 bytes — key = bytes 0..32, IV = bytes
//! 32..48.  The salt is the 16 random bytes stored in the collection
//! header, so the same password yields a distinct key per collection.
//!
//! # Checksum protocol
//! The header stores `encrypt(salt[0..2])` — a single padded CBC block,
//! exactly 16 bytes.  On re-open the supplied password must decrypt that
//! block back to the first two salt bytes; a wrong password fails either
//! at PKCS7 unpadding or at the byte comparison.  This is the only
//! password check the format has — payloads carry no per-record MAC.
//!
//! The derived material is immutable after [`CryptoContext::derive`];
//! cipher state is constructed per call, so any number of pipeline
//! workers may encrypt concurrently.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use thiserror::Error;

use crate::options::EncryptionAlgorithm;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SALT_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 16;
pub const KDF_ITERATIONS: u32 = 1000;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Decryption failed — wrong password or corrupted data")]
    DecryptionFailed,
}

/// Derived AES key + IV for one collection.  Cheap to clone, immutable.
#[derive(Clone)]
pub struct CryptoContext {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("CryptoContext { .. }")
    }
}

impl CryptoContext {
    /// Derive key and IV from a password and the collection salt.
    pub fn derive(
        password: &str,
        salt: &[u8; SALT_LEN],
        algorithm: EncryptionAlgorithm,
    ) -> Self {
        let mut okm = [0u8; KEY_LEN + IV_LEN];
        match algorithm {
            EncryptionAlgorithm::Sha1 => {
                pbkdf2_hmac::<sha1::Sha1>(password.as_bytes(), salt, KDF_ITERATIONS, &mut okm)
            }
            EncryptionAlgorithm::Sha256 => {
                pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, &mut okm)
            }
            EncryptionAlgorithm::Sha512 => {
                pbkdf2_hmac::<sha2::Sha512>(password.as_bytes(), salt, KDF_ITERATIONS, &mut okm)
            }
        }
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&okm[..KEY_LEN]);
        iv.copy_from_slice(&okm[KEY_LEN..]);
        Self { key, iv }
    }

    /// Encrypt `plaintext` (PKCS7-padded CBC).  Output length is the next
    /// multiple of 16 above the input length.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new((&self.key).into(), (&self.iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Aes256CbcDec::new((&self.key).into(), (&self.iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Compute the header checksum block: `encrypt(salt[0..2])`.
    pub fn checksum(&self, salt: &[u8; SALT_LEN]) -> [u8; CHECKSUM_LEN] {
        let block = self.encrypt(&salt[..2]);
        debug_assert_eq!(block.len(), CHECKSUM_LEN);
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(&block);
        out
    }

    /// Verify a stored header checksum against the salt.
    pub fn verify(
        &self,
        salt: &[u8; SALT_LEN],
        checksum: &[u8; CHECKSUM_LEN],
    ) -> Result<(), CryptoError> {
        let plain = self.decrypt(checksum)?;
        if plain.as_slice() != &salt[..2] {
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(())
    }
}

/// Fresh random salt for a new encrypted collection.
pub fn generate_salt() -> [u8; SALT_LEN] {
    *uuid::Uuid::new_v4().as_bytes()
}
