//! AES-256-CBC + HMAC-SHA256 framing for `ENCRYPTED` messages.
//!
//! Before a challenge has been received the device encrypts with the long-lived
//! API secret key; afterwards every frame in both directions uses the ephemeral
//! session key. The MAC is always keyed with the API auth key and covers the
//! serialized `data` object, so ciphertext and IV are authenticated together.
use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

use crate::codec;
use crate::messages::{EncryptedData, EncryptedFrame};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("no session key; encryption requires an authenticated session")]
    NoSessionKey,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("malformed encrypted frame: {0}")]
    Malformed(String),
    #[error("frame MAC does not match")]
    MacMismatch,
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Pre-shared API keys, fixed for the lifetime of a client.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    secret_key: [u8; KEY_LEN],
    auth_key: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Parses the two 64-character hex keys shown in the Remootio app.
    pub fn from_hex(secret_key: &str, auth_key: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            secret_key: decode_hex_key("secret key", secret_key)?,
            auth_key: decode_hex_key("auth key", auth_key)?,
        })
    }

    pub fn auth_key(&self) -> &[u8; KEY_LEN] {
        &self.auth_key
    }

    /// AES key for the current trust phase.
    pub fn derive_key(&self, session_key: Option<&SessionKey>) -> [u8; KEY_LEN] {
        match session_key {
            Some(key) => key.bytes,
            None => self.secret_key,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

fn decode_hex_key(name: &str, hex_key: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut out = [0u8; KEY_LEN];
    hex::decode_to_slice(hex_key.trim(), &mut out)
        .map_err(|e| CryptoError::InvalidKey(format!("{name}: {e}")))?;
    Ok(out)
}

/// Ephemeral key handed out in a challenge. Valid for one connection only.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
}

impl SessionKey {
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("session key: {e}")))?;
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "session key must be {KEY_LEN} bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self { bytes })
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// HMAC-SHA256 over the canonical `data` serialization.
pub fn auth_tag(data: &EncryptedData, auth_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let bytes =
        codec::authenticated_bytes(data).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(auth_key)
        .map_err(|e| CryptoError::InvalidKey(format!("auth key: {e}")))?;
    mac.update(&bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Encrypts an outbound payload under the session key with a fresh random IV.
pub fn encrypt(
    plaintext: &[u8],
    session_key: Option<&SessionKey>,
    keys: &KeyMaterial,
) -> Result<EncryptedFrame, CryptoError> {
    let session_key = session_key.ok_or(CryptoError::NoSessionKey)?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, &keys.derive_key(Some(session_key)), &iv, keys.auth_key())
}

/// Encrypts with caller-provided key and IV. Only [`encrypt`] picks IVs for live traffic.
pub fn encrypt_with_iv(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    auth_key: &[u8],
) -> Result<EncryptedFrame, CryptoError> {
    let ciphertext = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let data = EncryptedData {
        iv: STANDARD.encode(iv),
        payload: STANDARD.encode(ciphertext),
    };
    let mac = STANDARD.encode(auth_tag(&data, auth_key)?);
    Ok(EncryptedFrame { data, mac })
}

/// Verifies the MAC and, only if it matches, decrypts the payload bytes.
pub fn decrypt_and_verify(
    frame: &EncryptedFrame,
    key: &[u8; KEY_LEN],
    auth_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let declared = STANDARD
        .decode(&frame.mac)
        .map_err(|e| CryptoError::Malformed(format!("mac: {e}")))?;
    let bytes = codec::authenticated_bytes(&frame.data)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(auth_key)
        .map_err(|e| CryptoError::InvalidKey(format!("auth key: {e}")))?;
    mac.update(&bytes);
    mac.verify_slice(&declared)
        .map_err(|_| CryptoError::MacMismatch)?;

    let iv = STANDARD
        .decode(&frame.data.iv)
        .map_err(|e| CryptoError::Malformed(format!("iv: {e}")))?;
    let ciphertext = STANDARD
        .decode(&frame.data.payload)
        .map_err(|e| CryptoError::Malformed(format!("payload: {e}")))?;
    Aes256CbcDec::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::Malformed(format!("iv must be {IV_LEN} bytes")))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}
