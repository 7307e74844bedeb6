//! AES-128 Segment Decryption

use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::Aes128;
use anyhow::{anyhow, Result};
use block_padding::Pkcs7;
use cbc::Decryptor;

type Aes128CbcDec = Decryptor<Aes128>;

/// Decrypt an AES-128-CBC segment body with PKCS#7 unpadding
pub fn aes128_cbc_decrypt(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| anyhow!("invalid key or IV length: {}", e))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|e| anyhow!("unpad failed: {:?}", e))
}
