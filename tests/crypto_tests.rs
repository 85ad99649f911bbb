//! Integration tests for the CardVault crypto module.

use cardvault::crypto::keys::{generate_share_hex, random_hex};
use cardvault::crypto::{
    assemble_kek, bcd_decode, bcd_encode, control_code, hmac_digest, pkcs7_decode, pkcs7_encode,
    random_digest, unwrap_key, wrap_key, AesCodec, SecretKey,
};
use cardvault::errors::CardVaultError;

// ---------------------------------------------------------------------------
// AES codec
// ---------------------------------------------------------------------------

#[test]
fn aes256_known_answer_single_block() {
    // FIPS-197 appendix C.3.
    let key: Vec<u8> = (0u8..32).collect();
    let plain = hex::decode("00112233445566778899aabbccddeeff").unwrap();

    let codec = AesCodec::ecb(&key).unwrap();
    let crypted = codec.encrypt(&plain).unwrap();
    assert_eq!(hex::encode(&crypted), "8ea2b7ca516745bfeafc49904b496089");
    assert_eq!(codec.decrypt(&crypted).unwrap(), plain);
}

#[test]
fn cbc_chains_identical_blocks() {
    let codec = AesCodec::cbc(&[9u8; 32]).unwrap();
    let crypted = codec.encrypt(&[0x41; 32]).unwrap();
    assert_ne!(crypted[..16], crypted[16..]);
    assert_eq!(codec.decrypt(&crypted).unwrap(), vec![0x41; 32]);
}

#[test]
fn cbc_first_block_matches_ecb_with_zero_iv() {
    let ecb = AesCodec::ecb(&[3u8; 32]).unwrap();
    let cbc = AesCodec::cbc(&[3u8; 32]).unwrap();
    let block = [0x5Au8; 16];
    assert_eq!(ecb.encrypt(&block).unwrap(), cbc.encrypt(&block).unwrap());
}

#[test]
fn codec_rejects_wrong_key_and_block_sizes() {
    assert!(matches!(
        AesCodec::ecb(&[0u8; 16]),
        Err(CardVaultError::InvalidKeySize { expected: 32, actual: 16 })
    ));

    let codec = AesCodec::ecb(&[0u8; 32]).unwrap();
    assert!(matches!(codec.encrypt(&[]), Err(CardVaultError::InvalidBlockSize(_))));
    assert!(matches!(codec.encrypt(&[0u8; 15]), Err(CardVaultError::InvalidBlockSize(_))));
    assert!(matches!(codec.decrypt(&[0u8; 17]), Err(CardVaultError::InvalidBlockSize(_))));
}

// ---------------------------------------------------------------------------
// Padding
// ---------------------------------------------------------------------------

#[test]
fn bcd_block_starts_with_digits_and_terminator() {
    let block = bcd_encode("4111").unwrap();
    assert_eq!(block.len(), 16);
    assert_eq!(block[0], 0x41);
    assert_eq!(block[1], 0x11);
    assert_eq!(block[2] >> 4, 0xF);
    assert_eq!(bcd_decode(&block), "4111");
}

#[test]
fn bcd_full_block_has_no_terminator() {
    let digits = "12345678901234567890123456789012";
    let block = bcd_encode(digits).unwrap();
    assert_eq!(hex::encode(&block), digits);
    assert_eq!(bcd_decode(&block), digits);
}

#[test]
fn bcd_rejects_empty_long_and_non_digit_input() {
    assert!(matches!(bcd_encode(""), Err(CardVaultError::InvalidBlockSize(_))));
    assert!(matches!(
        bcd_encode(&"1".repeat(33)),
        Err(CardVaultError::InvalidBlockSize(_))
    ));
    assert!(matches!(bcd_encode("12a4"), Err(CardVaultError::InvalidInput(_))));
}

#[test]
fn pkcs7_always_adds_padding() {
    assert_eq!(pkcs7_encode(b""), vec![16u8; 16]);
    let padded = pkcs7_encode(&[7u8; 16]);
    assert_eq!(padded.len(), 32);
    assert_eq!(padded[16..], [16u8; 16]);
    assert_eq!(pkcs7_decode(&padded).unwrap(), vec![7u8; 16]);
}

#[test]
fn pkcs7_rejects_corrupt_padding() {
    let mut padded = pkcs7_encode(b"card holder");
    let last = padded.len() - 1;
    padded[last - 1] ^= 0xFF;
    assert!(matches!(pkcs7_decode(&padded), Err(CardVaultError::PaddingError(_))));

    assert!(pkcs7_decode(&[0u8; 16]).is_err());
    assert!(pkcs7_decode(&[]).is_err());
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

#[test]
fn kek_depends_on_every_share() {
    let (p1, p2, p3) = (generate_share_hex(), generate_share_hex(), generate_share_hex());
    let kek = assemble_kek(&p1, &p2, &p3).unwrap();

    let other = generate_share_hex();
    assert_ne!(assemble_kek(&other, &p2, &p3).unwrap(), kek);
    assert_ne!(assemble_kek(&p1, &other, &p3).unwrap(), kek);
    assert_ne!(assemble_kek(&p1, &p2, &other).unwrap(), kek);
}

#[test]
fn kek_share_order_does_not_matter() {
    let (p1, p2, p3) = (generate_share_hex(), generate_share_hex(), generate_share_hex());
    assert_eq!(
        assemble_kek(&p1, &p2, &p3).unwrap(),
        assemble_kek(&p3, &p1, &p2).unwrap()
    );
}

#[test]
fn kek_rejects_bad_hex() {
    let good = generate_share_hex();
    assert!(matches!(
        assemble_kek(&good, &good, "zz"),
        Err(CardVaultError::InvalidInput(_))
    ));
}

#[test]
fn wrapped_key_unwraps_only_under_its_master() {
    let master = SecretKey::generate();
    let dek = SecretKey::generate();
    let wrapped = wrap_key(&master, &dek).unwrap();

    assert_eq!(unwrap_key(&master, &wrapped).unwrap(), dek);
    assert_ne!(unwrap_key(&SecretKey::generate(), &wrapped).unwrap(), dek);
}

#[test]
fn control_code_identifies_the_master_key() {
    let master = SecretKey::generate();
    let phrase = random_hex(16);

    let code = control_code(&master, &phrase).unwrap();
    assert_eq!(control_code(&master, &phrase).unwrap(), code);
    assert_ne!(control_code(&SecretKey::generate(), &phrase).unwrap(), code);
    // 32 hex characters are two blocks, no padding block.
    assert_eq!(code.len(), 44);
}

#[test]
fn hmac_digest_is_keyed_and_deterministic() {
    let key = SecretKey::new([1; 32]);
    let a = hmac_digest(&key, b"4111111111111111").unwrap();
    assert_eq!(a, hmac_digest(&key, b"4111111111111111").unwrap());
    assert_ne!(a, hmac_digest(&SecretKey::new([2; 32]), b"4111111111111111").unwrap());
    assert_ne!(a, hmac_digest(&key, b"4111111111111112").unwrap());
    // base64 of 32 bytes
    assert_eq!(a.len(), 44);
}

#[test]
fn random_digest_looks_like_a_digest_but_never_repeats() {
    let a = random_digest();
    let b = random_digest();
    assert_eq!(a.len(), 44);
    assert_ne!(a, b);
}
