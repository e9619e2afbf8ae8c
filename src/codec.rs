//! Pair codec — (key,value) to payload bytes and back.
//!
//! Write order: serialize → compress (binary framings only) → encrypt.
//! Read order:  decrypt → decompress → deserialize.
//!
//! # Framings
//! - `BinaryContractless` / `BinaryContract`: a bincode pair `(K, V)`,
//!   varint-packed vs fixed-width integers.  Compression (LZ4 block
//!   format, size-prepended) is applied inside these framings.
//! - `JsonUtf8`: a JSON object `{"k": …, "v": …}`.  Never compressed.
//!
//! The serializer tag and the compressed/encrypted flags live in the
//! collection header, so `decode` needs no per-record sniffing.
//!
//! # Concurrency
//! A [`PairCodec`] holds no mutable state — encryption constructs cipher
//! state per call — so one instance behind an `Arc` serves every
//! transformation worker of the parallel write path at once.

use std::borrow::Cow;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoContext, CryptoError};
use crate::options::Serializer;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Serialize)]
struct JsonPairRef<'a, K, V> {
    k: &'a K,
    v: &'a V,
}

#[derive(Deserialize)]
#[serde(bound = "K: DeserializeOwned, V: DeserializeOwned")]
struct JsonPair<K, V> {
    k: K,
    v: V,
}

pub struct PairCodec<K, V> {
    serializer: Serializer,
    compressed: bool,
    crypto: Option<CryptoContext>,
    _pair: PhantomData<fn() -> (K, V)>,
}

impl<K, V> PairCodec<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(serializer: Serializer, compressed: bool, crypto: Option<CryptoContext>) -> Self {
        Self {
            // Compression is a binary-framing feature; JSON stays plain.
            compressed: compressed && serializer.is_binary(),
            serializer,
            crypto,
            _pair: PhantomData,
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Encode one pair into payload bytes ready for the slot file.
    pub fn encode(&self, key: &K, value: &V) -> Result<Vec<u8>, CodecError> {
        let mut bytes = match self.serializer {
            Serializer::BinaryContractless => {
                bincode::serde::encode_to_vec(&(key, value), bincode::config::standard())
                    .map_err(|e| CodecError::Serialization(e.to_string()))?
            }
            Serializer::BinaryContract => bincode::serde::encode_to_vec(
                &(key, value),
                bincode::config::standard().with_fixed_int_encoding(),
            )
            .map_err(|e| CodecError::Serialization(e.to_string()))?,
            Serializer::JsonUtf8 => serde_json::to_vec(&JsonPairRef { k: key, v: value })
                .map_err(|e| CodecError::Serialization(e.to_string()))?,
        };

        if self.compressed {
            bytes = lz4_flex::compress_prepend_size(&bytes);
        }
        if let Some(crypto) = &self.crypto {
            bytes = crypto.encrypt(&bytes);
        }
        Ok(bytes)
    }

    /// Decode payload bytes back into a pair.  Exact inverse of
    /// [`encode`](Self::encode).
    pub fn decode(&self, payload: &[u8]) -> Result<(K, V), CodecError> {
        let plain: Cow<[u8]> = match &self.crypto {
            Some(crypto) => Cow::Owned(crypto.decrypt(payload)?),
            None => Cow::Borrowed(payload),
        };

        let raw: Cow<[u8]> = if self.compressed {
            Cow::Owned(
                lz4_flex::decompress_size_prepended(&plain)
                    .map_err(|e| CodecError::Deserialization(e.to_string()))?,
            )
        } else {
            plain
        };

        match self.serializer {
            Serializer::BinaryContractless => {
                bincode::serde::decode_from_slice::<(K, V), _>(&raw, bincode::config::standard())
                    .map(|(pair, _)| pair)
                    .map_err(|e| CodecError::Deserialization(e.to_string()))
            }
            Serializer::BinaryContract => bincode::serde::decode_from_slice::<(K, V), _>(
                &raw,
                bincode::config::standard().with_fixed_int_encoding(),
            )
            .map(|(pair, _)| pair)
            .map_err(|e| CodecError::Deserialization(e.to_string())),
            Serializer::JsonUtf8 => serde_json::from_slice::<JsonPair<K, V>>(&raw)
                .map(|p| (p.k, p.v))
                .map_err(|e| CodecError::Deserialization(e.to_string())),
        }
    }
}
