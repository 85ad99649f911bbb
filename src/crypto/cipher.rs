//! AES-256 block cipher in ECB or CBC mode.
//!
//! The card path encrypts a single BCD block per value and uses ECB.
//! The generic path encrypts PKCS7-padded data of arbitrary length and
//! chains the blocks (CBC) starting from an all-zero IV:
//!
//! ```text
//! c[0] = E(p[0] XOR 0)
//! c[i] = E(p[i] XOR c[i-1])
//! ```
//!
//! No IV is stored next to the ciphertext.  Existing records depend on
//! the fixed zero IV, so it must stay that way.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};

use crate::errors::{CardVaultError, Result};

/// AES block size in bytes.
pub const BLOCK_LEN: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_LEN: usize = 32;

/// Block chaining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Every block is encrypted independently.
    Ecb,
    /// Blocks are chained with a fixed all-zero IV.
    Cbc,
}

/// An AES-256 cipher bound to one key and one chaining mode.
pub struct AesCodec {
    cipher: Aes256,
    mode: CipherMode,
}

impl AesCodec {
    /// Build a codec from a raw key, which must be exactly 32 bytes.
    pub fn new(key: &[u8], mode: CipherMode) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(CardVaultError::InvalidKeySize {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let cipher = Aes256::new_from_slice(key).map_err(|_| CardVaultError::InvalidKeySize {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        Ok(Self { cipher, mode })
    }

    /// Shorthand for an ECB codec.
    pub fn ecb(key: &[u8]) -> Result<Self> {
        Self::new(key, CipherMode::Ecb)
    }

    /// Shorthand for a CBC codec.
    pub fn cbc(key: &[u8]) -> Result<Self> {
        Self::new(key, CipherMode::Cbc)
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Encrypt block-aligned, non-empty input.
    pub fn encrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        check_block_aligned(input, "input text")?;

        let mut out = input.to_vec();
        let mut prev = [0u8; BLOCK_LEN];
        for chunk in out.chunks_exact_mut(BLOCK_LEN) {
            if self.mode == CipherMode::Cbc {
                xor_in_place(chunk, &prev);
            }
            self.cipher.encrypt_block(Block::from_mut_slice(chunk));
            if self.mode == CipherMode::Cbc {
                prev.copy_from_slice(chunk);
            }
        }
        Ok(out)
    }

    /// Decrypt block-aligned, non-empty ciphertext.
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        check_block_aligned(input, "input cipher")?;

        let mut out = input.to_vec();
        let mut prev = [0u8; BLOCK_LEN];
        for chunk in out.chunks_exact_mut(BLOCK_LEN) {
            let mut current = [0u8; BLOCK_LEN];
            current.copy_from_slice(chunk);
            self.cipher.decrypt_block(Block::from_mut_slice(chunk));
            if self.mode == CipherMode::Cbc {
                xor_in_place(chunk, &prev);
                prev = current;
            }
        }
        Ok(out)
    }
}

fn check_block_aligned(input: &[u8], what: &str) -> Result<()> {
    if input.is_empty() || input.len() % BLOCK_LEN != 0 {
        return Err(CardVaultError::InvalidBlockSize(format!(
            "{what} size must be a non-zero multiple of {BLOCK_LEN}, got {}",
            input.len()
        )));
    }
    Ok(())
}

fn xor_in_place(buf: &mut [u8], other: &[u8]) {
    for (b, o) in buf.iter_mut().zip(other) {
        *b ^= o;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 32] = b"12345678901234567890123456789012";

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }

    #[test]
    fn ecb_known_vectors() {
        let codec = AesCodec::ecb(KEY).unwrap();
        let cases = [
            ("1234567890123456", "CF 21 48 02 A9 EA F1 F8 A1 68 91 6A 80 7F 60 54"),
            ("abcdefghijklmnop", "CB 3B D7 7F 8B 72 28 4A 17 66 21 88 4E 3E 06 C9"),
            ("ABCDEFGHIJKLMNOP", "08 7F B2 43 85 52 94 E2 00 2D B9 59 B4 D8 95 27"),
        ];
        for (plain, cipher) in cases {
            assert_eq!(codec.encrypt(plain.as_bytes()).unwrap(), unhex(cipher));
            assert_eq!(codec.decrypt(&unhex(cipher)).unwrap(), plain.as_bytes());
        }
    }

    #[test]
    fn ecb_repeats_identical_blocks() {
        let codec = AesCodec::ecb(KEY).unwrap();
        let out = codec.encrypt(b"ABCDEFGHIJKLMNOPABCDEFGHIJKLMNOP").unwrap();
        assert_eq!(out[..16], out[16..]);
    }

    #[test]
    fn cbc_chains_blocks_from_zero_iv() {
        let codec = AesCodec::cbc(KEY).unwrap();
        let expected = unhex(
            "08 7F B2 43 85 52 94 E2 00 2D B9 59 B4 D8 95 27 \
             B3 0A 93 0E C3 7E B0 7A 79 26 F7 82 5C D8 80 9F",
        );
        let plain = b"ABCDEFGHIJKLMNOPABCDEFGHIJKLMNOP";
        assert_eq!(codec.encrypt(plain).unwrap(), expected);
        assert_eq!(codec.decrypt(&expected).unwrap(), plain);
    }

    #[test]
    fn rejects_wrong_key_size() {
        assert!(matches!(
            AesCodec::ecb(&[0u8; 16]),
            Err(CardVaultError::InvalidKeySize { actual: 16, .. })
        ));
        assert!(AesCodec::cbc(&[0u8; 33]).is_err());
    }

    #[test]
    fn rejects_unaligned_input() {
        let codec = AesCodec::ecb(KEY).unwrap();
        for bad in ["", "1234", "12345678", "ABCDEFGHIJKL"] {
            assert!(matches!(
                codec.encrypt(bad.as_bytes()),
                Err(CardVaultError::InvalidBlockSize(_))
            ));
        }
        assert!(codec.decrypt(&[0u8; 17]).is_err());
    }
}
