//! Collection file header — format anchor at offset 0.
//!
//! # On-disk layout (36 bytes, all numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      2   version           = 1       (LE u16)
//!    2      1   serializer tag    0=BinaryContractless 1=BinaryContract 2=JsonUtf8
//!    3      1   format flags      0x01=Encrypted  0x02=Compressed
//!    4     16   encryption salt   zeros when not encrypted
//!   20     16   encryption checksum = encrypt(salt[0..2]), one CBC block;
//!                                 zeros when not encrypted
//! ```
//!
//! Everything after offset 36 is the slot stream (`slot.rs`).
//!
//! # Reconciliation
//! On re-open the header is authoritative: the serializer tag and format
//! flags override whatever the caller configured.  If the Encrypted flag
//! is set, the supplied password must decrypt the checksum back to
//! `salt[0..2]` before any payload is touched.

use std::io::{self, Read, Write};
use thiserror::Error;

use crate::crypto::{CryptoContext, CHECKSUM_LEN, SALT_LEN};
use crate::options::Serializer;

pub const HEADER_SIZE: usize = 36;
pub const FORMAT_VERSION: u16 = 1;

/// Format flag: payloads are AES-256-CBC encrypted.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0001;
/// Format flag: payloads are LZ4-compressed inside the binary framing.
pub const FLAG_COMPRESSED: u8 = 0b0000_0010;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Unsupported collection file version {0} (current: {FORMAT_VERSION})")]
    UnsupportedVersion(u16),
    #[error("Unknown serializer tag {0}")]
    UnknownSerializer(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u16,
    pub serializer: Serializer,
    pub flags: u8,
    pub salt: [u8; SALT_LEN],
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Header {
    /// Header for a new unencrypted collection.
    pub fn new(serializer: Serializer, compressed: bool) -> Self {
        Self {
            version: FORMAT_VERSION,
            serializer,
            flags: if compressed { FLAG_COMPRESSED } else { 0 },
            salt: [0u8; SALT_LEN],
            checksum: [0u8; CHECKSUM_LEN],
        }
    }

    /// Header for a new encrypted collection.  The checksum commits the
    /// derived key to the salt so a wrong password is caught at open.
    pub fn new_encrypted(
        serializer: Serializer,
        compressed: bool,
        salt: [u8; SALT_LEN],
        crypto: &CryptoContext,
    ) -> Self {
        let mut h = Self::new(serializer, compressed);
        h.flags |= FLAG_ENCRYPTED;
        h.salt = salt;
        h.checksum = crypto.checksum(&salt);
        h
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2] = self.serializer.tag();
        buf[3] = self.flags;
        buf[4..20].copy_from_slice(&self.salt);
        buf[20..36].copy_from_slice(&self.checksum);
        buf
    }

    /// Write the fixed 36-byte header.
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }

    /// Read and validate a header.  Fails hard on an unknown version or
    /// serializer tag; the caller MUST NOT scan slots in that case.
    pub fn read<R: Read>(mut r: R) -> Result<Self, HeaderError> {
        let mut buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut buf)?;

        let version = u16::from_le_bytes([buf[0], buf[1]]);
        if version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let serializer =
            Serializer::from_tag(buf[2]).ok_or(HeaderError::UnknownSerializer(buf[2]))?;
        let flags = buf[3];

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[4..20]);
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&buf[20..36]);

        Ok(Self { version, serializer, flags, salt, checksum })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_salt;
    use crate::options::EncryptionAlgorithm;
    use std::io::Cursor;

    #[test]
    fn plain_header_round_trip() {
        let h = Header::new(Serializer::BinaryContractless, true);
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let parsed = Header::read(Cursor::new(bytes)).unwrap();
        assert_eq!(parsed.version, FORMAT_VERSION);
        assert_eq!(parsed.serializer, Serializer::BinaryContractless);
        assert!(parsed.is_compressed());
        assert!(!parsed.is_encrypted());
        assert_eq!(parsed.salt, [0u8; SALT_LEN]);
    }

    #[test]
    fn encrypted_header_verifies() {
        let salt = generate_salt();
        let crypto = CryptoContext::derive("pw", &salt, EncryptionAlgorithm::Sha256);
        let h = Header::new_encrypted(Serializer::JsonUtf8, false, salt, &crypto);

        let parsed = Header::read(Cursor::new(h.to_bytes())).unwrap();
        assert!(parsed.is_encrypted());
        crypto.verify(&parsed.salt, &parsed.checksum).unwrap();

        let wrong = CryptoContext::derive("nope", &salt, EncryptionAlgorithm::Sha256);
        assert!(wrong.verify(&parsed.salt, &parsed.checksum).is_err());
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = Header::new(Serializer::BinaryContract, false).to_bytes();
        bytes[0] = 9;
        assert!(matches!(
            Header::read(Cursor::new(bytes)),
            Err(HeaderError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn unknown_serializer_rejected() {
        let mut bytes = Header::new(Serializer::BinaryContract, false).to_bytes();
        bytes[2] = 7;
        assert!(matches!(
            Header::read(Cursor::new(bytes)),
            Err(HeaderError::UnknownSerializer(7))
        ));
    }
}
