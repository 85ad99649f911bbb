//! Cryptographic primitives for CardVault.
//!
//! This module provides:
//! - AES-256 in ECB and zero-IV CBC mode (`cipher`)
//! - BCD and PKCS7 block padding (`padding`)
//! - Zeroizing key type, KEK assembly and HMAC digests (`keys`)

pub mod cipher;
pub mod keys;
pub mod padding;

// Re-export the most commonly used items so callers can write:
//   use crate::crypto::{AesCodec, bcd_encode, SecretKey, ...};
pub use cipher::{AesCodec, CipherMode};
pub use keys::{
    assemble_kek, control_code, hmac_digest, random_digest, unwrap_key, wrap_key, SecretKey,
};
pub use padding::{bcd_decode, bcd_encode, pkcs7_decode, pkcs7_encode};
