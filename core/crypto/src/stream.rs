//! Chunked content encryption for file transfers.
//!
//! Content is encrypted with AES-128-CTR (IV = `nonce || counter`). Integrity
//! is a CBC-MAC per chunk, folded into a file MAC and condensed into the 8-byte
//! meta-MAC stored in the file key. Chunk boundaries grow from 128 KiB in
//! 128 KiB steps up to 1 MiB, then stay at 1 MiB.

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use subtle::ConstantTimeEq;

use crate::block::{cipher, encrypt_block, BLOCK_SIZE};
use crate::keys::{FileKey, NONCE_LENGTH};
use stowage_common::{Error, Result};

type Ctr = ctr::Ctr128BE<Aes128>;

/// Size of the first chunk and of each growth step.
pub const CHUNK_STEP: u64 = 128 * 1024;

/// Largest chunk size.
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Size of the chunk with the given zero-based index.
pub fn chunk_size(index: u64) -> u64 {
    CHUNK_STEP.saturating_mul(index.saturating_add(1)).min(MAX_CHUNK_SIZE)
}

/// `(offset, length)` of every chunk of a file of `total` bytes.
pub fn chunk_layout(total: u64) -> Vec<(u64, u64)> {
    let mut layout = Vec::new();
    let mut offset = 0u64;
    let mut index = 0u64;
    while offset < total {
        let len = chunk_size(index).min(total - offset);
        layout.push((offset, len));
        offset += len;
        index += 1;
    }
    layout
}

fn new_ctr(key: &FileKey, offset: u64) -> Ctr {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[..NONCE_LENGTH].copy_from_slice(key.nonce());
    let mut ctr = Ctr::new(
        GenericArray::from_slice(key.aes_key()),
        GenericArray::from_slice(&iv),
    );
    ctr.seek(offset);
    ctr
}

/// Encrypts or decrypts a whole file chunk by chunk while computing its MAC.
///
/// Chunks must be fed in order and must follow [`chunk_size`] boundaries;
/// [`ChunkCipher::next_chunk_len`] gives the expected length.
pub struct ChunkCipher {
    ctr: Ctr,
    mac_cipher: Aes128,
    nonce: [u8; NONCE_LENGTH],
    file_mac: [u8; BLOCK_SIZE],
    index: u64,
}

impl ChunkCipher {
    /// Start at offset zero of the file encrypted under `key`.
    pub fn new(key: &FileKey) -> Self {
        Self {
            ctr: new_ctr(key, 0),
            mac_cipher: cipher(key.aes_key()),
            nonce: *key.nonce(),
            file_mac: [0u8; BLOCK_SIZE],
            index: 0,
        }
    }

    /// Length of the next full chunk.
    pub fn next_chunk_len(&self) -> usize {
        chunk_size(self.index) as usize
    }

    fn chunk_mac(&self, plain: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut mac = [0u8; BLOCK_SIZE];
        mac[..NONCE_LENGTH].copy_from_slice(&self.nonce);
        mac[NONCE_LENGTH..].copy_from_slice(&self.nonce);

        for block in plain.chunks(BLOCK_SIZE) {
            for (m, b) in mac.iter_mut().zip(block) {
                *m ^= b;
            }
            encrypt_block(&self.mac_cipher, &mut mac);
        }
        mac
    }

    fn fold(&mut self, chunk_mac: [u8; BLOCK_SIZE]) {
        for (f, c) in self.file_mac.iter_mut().zip(chunk_mac) {
            *f ^= c;
        }
        encrypt_block(&self.mac_cipher, &mut self.file_mac);
        self.index += 1;
    }

    /// Encrypt one plaintext chunk in place.
    pub fn encrypt_chunk(&mut self, chunk: &mut [u8]) {
        let mac = self.chunk_mac(chunk);
        self.fold(mac);
        self.ctr.apply_keystream(chunk);
    }

    /// Decrypt one ciphertext chunk in place.
    pub fn decrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.ctr.apply_keystream(chunk);
        let mac = self.chunk_mac(chunk);
        self.fold(mac);
    }

    /// Condensed MAC of everything processed so far.
    pub fn meta_mac(&self) -> [u8; NONCE_LENGTH] {
        let m = &self.file_mac;
        let mut out = [0u8; NONCE_LENGTH];
        for i in 0..4 {
            out[i] = m[i] ^ m[i + 4];
            out[i + 4] = m[i + 8] ^ m[i + 12];
        }
        out
    }

    /// Compare the computed meta-MAC with the one in the file key.
    ///
    /// # Errors
    /// - `CorruptData` on mismatch
    pub fn verify(&self, key: &FileKey) -> Result<()> {
        if bool::from(self.meta_mac()[..].ct_eq(&key.meta_mac()[..])) {
            Ok(())
        } else {
            Err(Error::CorruptData(
                "Content MAC does not match the file key".to_string(),
            ))
        }
    }
}

/// Decrypts an arbitrary byte range without integrity checking.
pub struct RangeDecryptor {
    ctr: Ctr,
}

impl RangeDecryptor {
    /// Position the keystream at `offset` bytes into the file.
    pub fn new(key: &FileKey, offset: u64) -> Self {
        Self {
            ctr: new_ctr(key, offset),
        }
    }

    /// Decrypt the next bytes of the range in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.ctr.apply_keystream(data);
    }
}
