use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// ChaCha20Poly1305 key size in bytes.
pub const KEY_LEN: usize = 32;
/// Per-message nonce, prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;
/// Random bytes behind a default address. Hex doubles them to `KEY_LEN` characters.
pub const ADDRESS_ENTROPY: usize = KEY_LEN / 2;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ciphertext is shorter than its nonce prefix")]
    InvalidCiphertext,
    #[error("address is {actual} bytes but the cipher needs a {expected}-byte key")]
    KeyLength { expected: usize, actual: usize },
    #[error("encrypt failed")]
    Encrypt,
    #[error("decrypt failed")]
    Decrypt,
}

/// Public handle of a secret. The same string is the store key and the
/// symmetric key of its ciphertext, so it is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Address(..)")
    }
}

/// Per-secret symmetric cipher keyed by the secret's own address.
pub trait Cipher: Send + Sync {
    /// Key size the cipher requires, in bytes.
    fn key_len(&self) -> usize;

    /// Fresh random address. Uniqueness rests on its width alone.
    fn generate_address(&self) -> Address;

    /// Encrypt under `address`. The output carries its own nonce prefix.
    fn encrypt(&self, address: &Address, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Reverse `encrypt`. Fails for a foreign address or a tampered payload.
    fn decrypt(&self, address: &Address, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Verify that the addresses `cipher` hands out can key it.
/// Run once at startup; a mismatch is a configuration error.
pub fn check_key_binding(cipher: &dyn Cipher) -> Result<(), CipherError> {
    let sample = cipher.generate_address();
    if sample.len() != cipher.key_len() {
        return Err(CipherError::KeyLength {
            expected: cipher.key_len(),
            actual: sample.len(),
        });
    }
    Ok(())
}

/// ChaCha20Poly1305 using the address's ASCII bytes as the key.
#[derive(Debug, Clone)]
pub struct ChaChaCipher {
    address_entropy: usize,
}

impl Default for ChaChaCipher {
    fn default() -> Self {
        Self {
            address_entropy: ADDRESS_ENTROPY,
        }
    }
}

impl ChaChaCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how many random bytes back each address.
    /// Anything but `ADDRESS_ENTROPY` fails `check_key_binding`.
    pub fn with_address_entropy(address_entropy: usize) -> Self {
        Self { address_entropy }
    }

    fn aead(&self, address: &Address) -> Result<ChaCha20Poly1305, CipherError> {
        ChaCha20Poly1305::new_from_slice(address.as_bytes()).map_err(|_| CipherError::KeyLength {
            expected: KEY_LEN,
            actual: address.len(),
        })
    }
}

impl Cipher for ChaChaCipher {
    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn generate_address(&self) -> Address {
        let mut raw = Zeroizing::new(vec![0u8; self.address_entropy]);
        OsRng.fill_bytes(&mut raw);
        Address(hex::encode(&*raw))
    }

    fn encrypt(&self, address: &Address, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = self.aead(address)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, address: &Address, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CipherError::InvalidCiphertext);
        }
        let cipher = self.aead(address)?;
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CipherError::Decrypt)
    }
}
