//! Key material helpers.
//!
//! A master key (KEK) is never stored anywhere.  It is rebuilt from three
//! independently stored 32-byte shares:
//!
//! ```text
//! KEK = SHA256(share1 XOR share2 XOR share3)
//! ```
//!
//! Share #1 lives in the remote key-share service, share #2 in the local
//! settings file and share #3 in the database, so no single store reveals
//! the key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::cipher::{AesCodec, KEY_LEN};
use crate::errors::{CardVaultError, Result};

/// Size of a single KEK share in bytes.
pub const SHARE_LEN: usize = 32;

/// Number of random bytes behind a placeholder digest.
const RANDOM_DIGEST_SOURCE_LEN: usize = 10;

/// A 32-byte secret key that zeroes its memory when dropped.
///
/// Used for master keys, DEKs and HMAC keys alike.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Copy key material out of a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CardVaultError::InvalidKeySize {
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self::new(arr))
    }

    /// Fresh random key material.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        let key = Self::new(bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for SecretKey {}

/// Decode one hex-encoded share and check its length.
pub fn decode_share(share_hex: &str, part: u8) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = Zeroizing::new(hex::decode(share_hex.trim()).map_err(|e| {
        CardVaultError::InvalidInput(format!("KEK share #{part} is not valid hex: {e}"))
    })?);
    if bytes.len() != SHARE_LEN {
        return Err(CardVaultError::InvalidShareSize {
            part,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Rebuild a master key from its three hex-encoded shares.
pub fn assemble_kek(part1_hex: &str, part2_hex: &str, part3_hex: &str) -> Result<SecretKey> {
    let part1 = decode_share(part1_hex, 1)?;
    let part2 = decode_share(part2_hex, 2)?;
    let part3 = decode_share(part3_hex, 3)?;

    let mut combined = Zeroizing::new([0u8; SHARE_LEN]);
    for (i, byte) in combined.iter_mut().enumerate() {
        *byte = part1[i] ^ part2[i] ^ part3[i];
    }

    let mut digest: [u8; KEY_LEN] = Sha256::digest(combined.as_slice()).into();
    let key = SecretKey::new(digest);
    digest.zeroize();
    Ok(key)
}

/// Generate a random share as lowercase hex.
pub fn generate_share_hex() -> String {
    let mut share = Zeroizing::new([0u8; SHARE_LEN]);
    rand::rng().fill_bytes(share.as_mut_slice());
    hex::encode(share.as_slice())
}

/// Encrypt `key` under `master` (AES-ECB) and base64 the result.
///
/// This is how DEKs and HMAC keys are kept in the `data_key` table.
pub fn wrap_key(master: &SecretKey, key: &SecretKey) -> Result<String> {
    let codec = AesCodec::ecb(master.as_bytes())?;
    Ok(BASE64.encode(codec.encrypt(key.as_bytes())?))
}

/// Reverse of `wrap_key`.
pub fn unwrap_key(master: &SecretKey, wrapped: &str) -> Result<SecretKey> {
    let crypted = BASE64
        .decode(wrapped.trim())
        .map_err(|e| CardVaultError::InvalidInput(format!("wrapped key is not base64: {e}")))?;
    let codec = AesCodec::ecb(master.as_bytes())?;
    let plain = Zeroizing::new(codec.decrypt(&crypted)?);
    SecretKey::from_slice(&plain)
}

/// Control code proving a master key is the intended one:
/// base64 of the control phrase encrypted with AES-ECB.
///
/// The phrase is used as-is, so its length must be a multiple of 16.
pub fn control_code(master: &SecretKey, control_phrase: &str) -> Result<String> {
    let codec = AesCodec::ecb(master.as_bytes())?;
    Ok(BASE64.encode(codec.encrypt(control_phrase.as_bytes())?))
}

/// Base64 HMAC-SHA256 of `plain_text` under `hmac_key`.
///
/// Used as the lookup index for deduplication.
pub fn hmac_digest(hmac_key: &SecretKey, plain_text: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key.as_bytes())
        .map_err(|e| CardVaultError::InvalidInput(format!("invalid HMAC key: {e}")))?;
    mac.update(plain_text);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// A digest-shaped value that matches nothing.
///
/// Stored for values that must not be findable through the HMAC index.
pub fn random_digest() -> String {
    let mut source = [0u8; RANDOM_DIGEST_SOURCE_LEN];
    rand::rng().fill_bytes(&mut source);
    BASE64.encode(Sha256::digest(source))
}

/// `n` random bytes rendered as lowercase hex.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: &str = "0101010101010101010101010101010101010101010101010101010101010101";
    const P2: &str = "0202020202020202020202020202020202020202020202020202020202020202";
    const P3: &str = "0404040404040404040404040404040404040404040404040404040404040404";

    #[test]
    fn assemble_kek_hashes_xor_of_shares() {
        let key = assemble_kek(P1, P2, P3).unwrap();
        let expected: [u8; 32] = Sha256::digest([0x07u8; 32]).into();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn assemble_kek_is_deterministic() {
        assert_eq!(assemble_kek(P1, P2, P3).unwrap(), assemble_kek(P1, P2, P3).unwrap());
    }

    #[test]
    fn assemble_kek_rejects_short_share() {
        let err = assemble_kek(P1, "0202", P3).unwrap_err();
        assert!(matches!(
            err,
            CardVaultError::InvalidShareSize { part: 2, actual: 2 }
        ));
    }

    #[test]
    fn assemble_kek_rejects_non_hex() {
        assert!(matches!(
            assemble_kek(P1, P2, "zz"),
            Err(CardVaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn secret_key_from_slice_checks_length() {
        assert!(SecretKey::from_slice(&[1u8; 32]).is_ok());
        assert!(SecretKey::from_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn secret_key_debug_hides_bytes() {
        let key = SecretKey::new([0xAB; 32]);
        assert_eq!(format!("{key:?}"), "SecretKey(..)");
    }

    #[test]
    fn hmac_digest_depends_on_key() {
        let k1 = SecretKey::new([1; 32]);
        let k2 = SecretKey::new([2; 32]);
        let d1 = hmac_digest(&k1, b"4111111111111111").unwrap();
        assert_eq!(d1, hmac_digest(&k1, b"4111111111111111").unwrap());
        assert_ne!(d1, hmac_digest(&k2, b"4111111111111111").unwrap());
    }

    #[test]
    fn random_digest_is_unique() {
        assert_ne!(random_digest(), random_digest());
    }

    #[test]
    fn wrapped_key_unwraps_only_under_same_master() {
        let master = SecretKey::new([9; 32]);
        let other = SecretKey::new([8; 32]);
        let dek = SecretKey::generate();

        let wrapped = wrap_key(&master, &dek).unwrap();
        assert_eq!(unwrap_key(&master, &wrapped).unwrap(), dek);
        assert_ne!(unwrap_key(&other, &wrapped).unwrap(), dek);
        assert!(unwrap_key(&master, "not base64!").is_err());
    }

    #[test]
    fn control_code_is_deterministic_per_master() {
        let master = SecretKey::new([3; 32]);
        let code = control_code(&master, "control phrase!!").unwrap();
        assert_eq!(code, control_code(&master, "control phrase!!").unwrap());
        assert_ne!(code, control_code(&SecretKey::new([4; 32]), "control phrase!!").unwrap());
    }

    #[test]
    fn control_code_is_plain_ecb_of_the_phrase() {
        let master = SecretKey::new(*b"12345678901234567890123456789012");
        // One block in, one block out: no padding block is appended.
        assert_eq!(
            control_code(&master, "1234567890123456").unwrap(),
            "zyFIAqnq8fihaJFqgH9gVA=="
        );
    }

    #[test]
    fn control_code_rejects_unaligned_phrase() {
        let master = SecretKey::new([3; 32]);
        assert!(matches!(
            control_code(&master, "short"),
            Err(CardVaultError::InvalidBlockSize(_))
        ));
    }

    #[test]
    fn generated_share_assembles() {
        let key = assemble_kek(&generate_share_hex(), &generate_share_hex(), &generate_share_hex());
        assert!(key.is_ok());
    }
}
