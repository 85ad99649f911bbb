//! Block padding schemes.
//!
//! - **BCD** packs a digit string (card numbers, CVNs) into exactly one
//!   16-byte block: two digits per byte, a `0xF` terminator nibble, and
//!   random filler nibbles up to 32 nibbles total.
//! - **PKCS7** pads arbitrary bytes to a positive multiple of 16.

use rand::RngCore;

use crate::crypto::cipher::BLOCK_LEN;
use crate::errors::{CardVaultError, Result};

/// Maximum number of digits a single BCD block can hold.
pub const BCD_MAX_DIGITS: usize = BLOCK_LEN * 2;

/// Terminator nibble written right after the last digit.
const BCD_TERMINATOR: u8 = 0xF;

/// Pack `digits` into a 16-byte BCD block.
pub fn bcd_encode(digits: &str) -> Result<Vec<u8>> {
    if digits.is_empty() || digits.len() > BCD_MAX_DIGITS {
        return Err(CardVaultError::InvalidBlockSize(format!(
            "BCD input must have 1..={BCD_MAX_DIGITS} digits, got {}",
            digits.len()
        )));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CardVaultError::InvalidInput(
            "BCD input must contain only ASCII digits".into(),
        ));
    }

    // Start from random filler; digits and terminator overwrite the head.
    let mut filler = [0u8; BLOCK_LEN];
    rand::rng().fill_bytes(&mut filler);
    let mut nibbles: Vec<u8> = filler
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0F])
        .collect();

    for (slot, d) in nibbles.iter_mut().zip(digits.bytes()) {
        *slot = d - b'0';
    }
    if digits.len() < BCD_MAX_DIGITS {
        nibbles[digits.len()] = BCD_TERMINATOR;
    }

    Ok(nibbles
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect())
}

/// Unpack the leading run of digits from a BCD block.
pub fn bcd_decode(block: &[u8]) -> String {
    let mut out = String::with_capacity(BCD_MAX_DIGITS);
    for nibble in block.iter().flat_map(|b| [b >> 4, b & 0x0F]) {
        if nibble > 9 {
            break;
        }
        out.push(char::from(b'0' + nibble));
    }
    out
}

/// Append `k` bytes of value `k`, where `k = 16 - len % 16`.
pub fn pkcs7_encode(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_LEN - data.len() % BLOCK_LEN;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS7 padding, validating every pad byte.
pub fn pkcs7_decode(data: &[u8]) -> Result<Vec<u8>> {
    let last = *data
        .last()
        .ok_or_else(|| CardVaultError::PaddingError("empty input".into()))?;
    let pad = usize::from(last);

    if pad == 0 || pad > BLOCK_LEN || pad > data.len() {
        return Err(CardVaultError::PaddingError(format!(
            "bad pad length {pad}"
        )));
    }
    let (body, tail) = data.split_at(data.len() - pad);
    if tail.iter().any(|&b| b != last) {
        return Err(CardVaultError::PaddingError(
            "inconsistent pad bytes".into(),
        ));
    }
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_upper(bytes: &[u8]) -> String {
        hex::encode_upper(bytes)
    }

    #[test]
    fn bcd_block_is_always_16_bytes() {
        for digits in ["123", "1234567890123", "1234567890123456", "12345678901234567890"] {
            assert_eq!(bcd_encode(digits).unwrap().len(), 16);
        }
    }

    #[test]
    fn bcd_layout_has_digits_then_terminator() {
        let cases = [
            ("1", "1F"),
            ("12", "12F"),
            ("87638103692640182746", "87638103692640182746F"),
            ("1234567890123456123456789012345", "1234567890123456123456789012345F"),
        ];
        for (digits, prefix) in cases {
            let encoded = bcd_encode(digits).unwrap();
            assert!(
                hex_upper(&encoded).starts_with(prefix),
                "{digits} -> {}",
                hex_upper(&encoded)
            );
            assert_eq!(bcd_decode(&encoded), digits);
        }
    }

    #[test]
    fn bcd_decode_stops_at_first_non_digit() {
        let block = hex::decode("87638103692640182746F00000000000").unwrap();
        assert_eq!(bcd_decode(&block), "87638103692640182746");
        assert_eq!(bcd_decode(&[]), "");
    }

    #[test]
    fn bcd_accepts_full_block_without_terminator() {
        let digits = "12345678901234567890123456789012";
        let encoded = bcd_encode(digits).unwrap();
        assert_eq!(hex_upper(&encoded), digits);
        assert_eq!(bcd_decode(&encoded), digits);
    }

    #[test]
    fn bcd_rejects_bad_input() {
        assert!(matches!(
            bcd_encode("123456789012345678901234567890123"),
            Err(CardVaultError::InvalidBlockSize(_))
        ));
        assert!(bcd_encode("").is_err());
        assert!(matches!(
            bcd_encode("12a4"),
            Err(CardVaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn pkcs7_known_layouts() {
        assert_eq!(pkcs7_encode(b""), vec![0x10; 16]);
        assert_eq!(pkcs7_encode(b"12"), [b"12".as_slice(), &[0x0E; 14]].concat());
        assert_eq!(
            pkcs7_encode(b"abcdefghijklmnopabcdefghijklmno"),
            [b"abcdefghijklmnopabcdefghijklmno".as_slice(), &[0x01]].concat()
        );
        assert_eq!(pkcs7_encode(b"1234567890123456").len(), 32);
    }

    #[test]
    fn pkcs7_decode_strips_padding() {
        let padded = [b"98275192837768916432927652854".as_slice(), &[3, 3, 3]].concat();
        assert_eq!(pkcs7_decode(&padded).unwrap(), b"98275192837768916432927652854");
        assert_eq!(pkcs7_decode(&[0x10; 16]).unwrap(), b"");
    }

    #[test]
    fn pkcs7_decode_rejects_bad_padding() {
        assert!(pkcs7_decode(b"").is_err());
        assert!(pkcs7_decode(&[0u8; 16]).is_err());
        assert!(pkcs7_decode(&[0x11u8; 16]).is_err());
        let mut bad = vec![0u8; 15];
        bad.push(0x02);
        assert!(matches!(
            pkcs7_decode(&bad),
            Err(CardVaultError::PaddingError(_))
        ));
    }
}
