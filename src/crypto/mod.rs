//! Message signatures and the AES-256-CBC envelope used on the webhook.
//!
//! The platform derives a 32-byte key from the 43-character
//! `encodingAESKey` (base64 with one `=` appended) and uses its first 16
//! bytes as the IV. Plaintext layout before encryption:
//!
//! ```text
//! random(16) ‖ be_u32(len(msg)) ‖ msg ‖ app_id ‖ pkcs7 padding (block 32)
//! ```

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{
    alphabet,
    engine::{general_purpose::STANDARD as BASE64, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Size of the derived key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// IV length; the IV is the key's prefix
const IV_SIZE: usize = 16;

const RANDOM_PREFIX_SIZE: usize = 16;
const LENGTH_FIELD_SIZE: usize = 4;

/// PKCS#7 block size used by the platform, twice the AES block.
const PAD_BLOCK: usize = 32;

/// The key alphabet is standard base64, but the 43rd character carries
/// two bits the decoder must ignore.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encodingAESKey must decode to 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encodingAESKey is not valid base64: {0}")]
    InvalidKey(String),

    #[error("ciphertext is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("ciphertext length {0} is not a whole number of blocks")]
    InvalidCiphertextLength(usize),

    #[error("decrypted payload is malformed: {0}")]
    Malformed(&'static str),

    #[error("cipher failure")]
    Cipher,
}

/// Result of decrypting an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub message: String,
    /// App id appended by the sender
    pub app_id: String,
}

/// SHA-1 hex of the lexicographically sorted, concatenated parts.
fn sorted_sha1(parts: &mut [&str]) -> String {
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts.iter() {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Signature used when the webhook runs in plaintext mode.
pub fn plain_signature(token: &str, timestamp: &str, nonce: &str) -> String {
    sorted_sha1(&mut [token, timestamp, nonce])
}

/// Constant-time comparison of two hex signatures.
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// 8 random bytes, hex encoded. Used as the nonce of outbound envelopes.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Signs, encrypts and decrypts webhook envelopes for one component.
#[derive(Clone)]
pub struct MsgCrypt {
    token: String,
    key: [u8; KEY_SIZE],
    app_id: String,
}

impl std::fmt::Debug for MsgCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgCrypt")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl MsgCrypt {
    pub fn new(token: &str, encoding_aes_key: &str, app_id: &str) -> Result<Self, CryptoError> {
        let decoded = KEY_ENGINE
            .decode(format!("{}=", encoding_aes_key.trim()))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let key: [u8; KEY_SIZE] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(decoded.len()))?;

        Ok(Self {
            token: token.to_string(),
            key,
            app_id: app_id.to_string(),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Envelope signature over `(token, timestamp, nonce, text)`.
    pub fn signature(&self, timestamp: &str, nonce: &str, text: &str) -> String {
        sorted_sha1(&mut [self.token.as_str(), timestamp, nonce, text])
    }

    /// Whether `signature` matches the envelope signature. Never an error.
    pub fn verify(&self, signature: &str, timestamp: &str, nonce: &str, text: &str) -> bool {
        signatures_match(&self.signature(timestamp, nonce, text), signature)
    }

    /// Encrypts `message` with a fresh random prefix.
    pub fn encrypt(&self, message: &str) -> Result<String, CryptoError> {
        let mut prefix = [0u8; RANDOM_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        self.encrypt_with_prefix(message, &prefix)
    }

    fn encrypt_with_prefix(
        &self,
        message: &str,
        prefix: &[u8; RANDOM_PREFIX_SIZE],
    ) -> Result<String, CryptoError> {
        let msg = message.as_bytes();
        let msg_len =
            u32::try_from(msg.len()).map_err(|_| CryptoError::Malformed("message too long"))?;

        let mut buf = Vec::with_capacity(
            RANDOM_PREFIX_SIZE + LENGTH_FIELD_SIZE + msg.len() + self.app_id.len() + PAD_BLOCK,
        );
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(msg);
        buf.extend_from_slice(self.app_id.as_bytes());

        // Always at least one byte of padding, at most a full block
        let pad = PAD_BLOCK - (buf.len() % PAD_BLOCK);
        buf.resize(buf.len() + pad, pad as u8);

        let len = buf.len();
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..IV_SIZE])
            .map_err(|_| CryptoError::Cipher)?;
        let encrypted = cipher
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| CryptoError::Cipher)?;

        Ok(BASE64.encode(encrypted))
    }

    /// Decrypts a base64 envelope.
    ///
    /// The trailing app id is returned, not enforced; callers decide whether
    /// a mismatch matters.
    pub fn decrypt(&self, encrypted: &str) -> Result<Decrypted, CryptoError> {
        let mut buf = BASE64
            .decode(encrypted.trim())
            .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;

        if buf.is_empty() || buf.len() % IV_SIZE != 0 {
            return Err(CryptoError::InvalidCiphertextLength(buf.len()));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..IV_SIZE])
            .map_err(|_| CryptoError::Cipher)?;
        let plain = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CryptoError::Cipher)?;

        // Out-of-range pad bytes are treated as no padding
        let pad = plain.last().copied().unwrap_or(0) as usize;
        let pad = if (1..=PAD_BLOCK).contains(&pad) { pad } else { 0 };
        let content = &plain[..plain.len().saturating_sub(pad)];

        let header = RANDOM_PREFIX_SIZE + LENGTH_FIELD_SIZE;
        if content.len() < header {
            return Err(CryptoError::Malformed("payload shorter than header"));
        }

        let mut len_bytes = [0u8; LENGTH_FIELD_SIZE];
        len_bytes.copy_from_slice(&content[RANDOM_PREFIX_SIZE..header]);
        let msg_len = u32::from_be_bytes(len_bytes) as usize;

        let body = &content[header..];
        if msg_len > body.len() {
            return Err(CryptoError::Malformed("length field exceeds payload"));
        }

        let message = std::str::from_utf8(&body[..msg_len])
            .map_err(|_| CryptoError::Malformed("message is not UTF-8"))?;
        let app_id = std::str::from_utf8(&body[msg_len..])
            .map_err(|_| CryptoError::Malformed("app id is not UTF-8"))?;

        Ok(Decrypted {
            message: message.to_string(),
            app_id: app_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AES_KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn crypt() -> MsgCrypt {
        MsgCrypt::new("component_token", AES_KEY, "wx_component").unwrap()
    }

    #[test]
    fn test_key_with_trailing_bits() {
        // 'G' leaves non-zero bits past the 32nd byte
        let crypt = crypt();
        assert_eq!(crypt.key.len(), KEY_SIZE);
        assert_eq!(crypt.app_id(), "wx_component");
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            MsgCrypt::new("t", "short", "wx"),
            Err(CryptoError::InvalidKey(_)) | Err(CryptoError::InvalidKeyLength(_))
        ));
        assert!(matches!(
            MsgCrypt::new("t", &"*".repeat(43), "wx"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_round_trip() {
        let crypt = crypt();
        for message in ["", "hello", "<xml><Content><![CDATA[你好]]></Content></xml>"] {
            let encrypted = crypt.encrypt(message).unwrap();
            let decrypted = crypt.decrypt(&encrypted).unwrap();
            assert_eq!(decrypted.message, message);
            assert_eq!(decrypted.app_id, "wx_component");
        }
    }

    #[test]
    fn test_padding_fills_whole_block() {
        // 16 + 4 + 1 + 11 = 32 bytes of content, so a full 32-byte pad block
        let crypt = MsgCrypt::new("t", AES_KEY, "wx_abcdefgh").unwrap();
        let encrypted = crypt.encrypt_with_prefix("x", &[7u8; 16]).unwrap();
        assert_eq!(BASE64.decode(&encrypted).unwrap().len(), 64);
        assert_eq!(crypt.decrypt(&encrypted).unwrap().message, "x");
    }

    #[test]
    fn test_random_prefix_changes_ciphertext() {
        let crypt = crypt();
        let a = crypt.encrypt_with_prefix("same", &[1u8; 16]).unwrap();
        let b = crypt.encrypt_with_prefix("same", &[2u8; 16]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, crypt.encrypt_with_prefix("same", &[1u8; 16]).unwrap());
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let crypt = crypt();
        assert!(matches!(
            crypt.decrypt("not base64!"),
            Err(CryptoError::InvalidBase64(_))
        ));
        assert!(matches!(
            crypt.decrypt(&BASE64.encode([0u8; 15])),
            Err(CryptoError::InvalidCiphertextLength(15))
        ));
        assert!(crypt.decrypt(&BASE64.encode([0u8; 32])).is_err());
    }

    #[test]
    fn test_decrypt_with_other_key_fails_or_differs() {
        let encrypted = crypt().encrypt("secret message").unwrap();
        let other = MsgCrypt::new("component_token", &"B".repeat(43), "wx_component").unwrap();
        match other.decrypt(&encrypted) {
            Ok(d) => assert_ne!(d.message, "secret message"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_signature_deterministic_and_order_free() {
        let crypt = crypt();
        let sig = crypt.signature("1700000000", "nonce1", "cipher");
        assert_eq!(sig.len(), 40);
        assert_eq!(sig, crypt.signature("1700000000", "nonce1", "cipher"));

        // Sorting makes the result independent of argument roles
        let swapped = sorted_sha1(&mut ["cipher", "nonce1", "component_token", "1700000000"]);
        assert_eq!(sig, swapped);
    }

    #[test]
    fn test_signature_tamper_sensitivity() {
        let crypt = crypt();
        let sig = crypt.signature("1700000000", "nonce1", "cipher");
        assert!(crypt.verify(&sig, "1700000000", "nonce1", "cipher"));
        assert!(!crypt.verify(&sig, "1700000001", "nonce1", "cipher"));
        assert!(!crypt.verify(&sig, "1700000000", "nonce2", "cipher"));
        assert!(!crypt.verify(&sig, "1700000000", "nonce1", "cipheR"));
        assert!(!crypt.verify("", "1700000000", "nonce1", "cipher"));
    }

    #[test]
    fn test_plain_signature_known_value() {
        // sha1("123abctoken")
        let mut hasher = Sha1::new();
        hasher.update(b"123abctoken");
        let expected = hex::encode(hasher.finalize());

        assert_eq!(plain_signature("token", "123", "abc"), expected);
    }

    #[test]
    fn test_random_nonce() {
        let nonce = random_nonce();
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, random_nonce());
    }
}
