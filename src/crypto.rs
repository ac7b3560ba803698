//! Tuya payload encryption and decryption.
//! AES-128-ECB with PKCS#7 padding, as used by protocol versions 3.1 and 3.3.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};

const BLOCK: usize = 16;

/// Constant password whose MD5 digest keys the v3.3 discovery broadcasts.
const DISCOVERY_PASSWORD: &[u8] = b"yGAdlopoPVldABfn";

/// The 16-byte AES key for decrypting beacons on the v3.3 discovery port.
pub fn discovery_key() -> [u8; 16] {
    md5::compute(DISCOVERY_PASSWORD).0
}

/// Derive a 16-byte AES key from the user-provided local key string.
/// Longer strings are truncated, shorter ones zero-padded.
pub fn local_key(key: &str) -> [u8; 16] {
    let mut k = [0u8; 16];
    let bytes = key.as_bytes();
    let n = bytes.len().min(16);
    k[..n].copy_from_slice(&bytes[..n]);
    k
}

/// AES-128-ECB encryption and decryption with a fixed 16-byte key.
pub struct TuyaCipher {
    key: [u8; 16],
}

impl TuyaCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::EncryptionFailed);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    /// Encrypt `data`, applying PKCS#7 padding. A full block of padding is
    /// added when the input is already block-aligned.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        let pad = BLOCK - data.len() % BLOCK;
        let mut buf = data.to_vec();
        buf.resize(data.len() + pad, pad as u8);

        for chunk in buf.chunks_mut(BLOCK) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        buf
    }

    /// Decrypt `data` and strip PKCS#7 padding leniently: the padding is
    /// removed only when the final byte is a plausible pad length, which
    /// tolerates devices that occasionally emit non-padded frames.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK != 0 {
            return Err(TuyaError::DecryptionFailed);
        }
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        let mut buf = data.to_vec();

        for chunk in buf.chunks_mut(BLOCK) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        let last = buf[buf.len() - 1] as usize;
        if last > 0 && last < BLOCK {
            buf.truncate(buf.len() - last);
        }
        Ok(buf)
    }
}
