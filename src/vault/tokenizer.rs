//! Tokenize, detokenize and deduplicate sensitive values.
//!
//! ```text
//! tokenize:   plain --encode--> block(s) --AES(DEK)--> base64 --> row, token
//! detokenize: token --> row --> DEK (unwrapped by its KEK) --> plain
//! ```
//!
//! Card data is BCD-packed into one block and encrypted with AES-ECB;
//! generic data is PKCS7-padded and encrypted with zero-IV AES-CBC.
//! Values of at least `MIN_INDEXED_LEN` characters are indexed by an HMAC
//! digest so a second `tokenize` of the same value can return the
//! existing token.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::DekSettings;
use crate::crypto::keys::{hmac_digest, random_digest, random_hex, unwrap_key, wrap_key};
use crate::crypto::{bcd_decode, bcd_encode, pkcs7_decode, pkcs7_encode, AesCodec, SecretKey};
use crate::errors::{CardVaultError, Result};
use crate::kek::TokenizerConfig;

use super::dek_pool::DekPool;
use super::model::{DataKey, DekPoolStatus, NewDataToken, TokenTable};
use super::store::Store;

/// Shorter values get a random digest and are never deduplicated.
pub const MIN_INDEXED_LEN: usize = 10;

/// Random bytes behind a token string (hex doubles the length).
pub const TOKEN_BYTES: usize = 16;

/// What kind of value a tokenizer handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Card numbers and CVNs: up to 32 digits, BCD + AES-ECB.
    Card,
    /// Any UTF-8 text: PKCS7 + AES-CBC.
    Generic,
}

impl DataKind {
    pub fn table(self) -> TokenTable {
        match self {
            DataKind::Card => TokenTable::DataToken,
            DataKind::Generic => TokenTable::SecureVault,
        }
    }

    fn codec(self, dek: &SecretKey) -> Result<AesCodec> {
        match self {
            DataKind::Card => AesCodec::ecb(dek.as_bytes()),
            DataKind::Generic => AesCodec::cbc(dek.as_bytes()),
        }
    }

    fn encode(self, plain_text: &str) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(match self {
            DataKind::Card => bcd_encode(plain_text)?,
            DataKind::Generic => pkcs7_encode(plain_text.as_bytes()),
        }))
    }

    fn decode(self, block: &[u8]) -> Result<String> {
        match self {
            DataKind::Card => Ok(bcd_decode(block)),
            DataKind::Generic => {
                let bytes = pkcs7_decode(block)?;
                String::from_utf8(bytes).map_err(|e| {
                    CardVaultError::InvalidInput(format!("decrypted value is not UTF-8: {e}"))
                })
            }
        }
    }
}

/// Encode `plain_text` for `kind`, encrypt it with `dek` and base64 it.
pub fn encrypt_data(dek: &SecretKey, plain_text: &str, kind: DataKind) -> Result<String> {
    let encoded = kind.encode(plain_text)?;
    Ok(BASE64.encode(kind.codec(dek)?.encrypt(&encoded)?))
}

/// Reverse of `encrypt_data`.
pub fn decrypt_data(dek: &SecretKey, data_crypted: &str, kind: DataKind) -> Result<String> {
    let crypted = BASE64
        .decode(data_crypted.trim())
        .map_err(|e| CardVaultError::InvalidInput(format!("stored data is not base64: {e}")))?;
    let block = Zeroizing::new(kind.codec(dek)?.decrypt(&crypted)?);
    kind.decode(&block)
}

/// One tokenizer per database connection.  The key config is shared.
pub struct Tokenizer {
    store: Store,
    config: Arc<TokenizerConfig>,
    dek_settings: DekSettings,
    kind: DataKind,
    pool: Option<DekPool>,
}

impl Tokenizer {
    pub fn new(
        store: Store,
        config: Arc<TokenizerConfig>,
        dek_settings: DekSettings,
        kind: DataKind,
    ) -> Result<Self> {
        config.refresh(&store, false)?;
        Ok(Self {
            store,
            config,
            dek_settings,
            kind,
            pool: None,
        })
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Arc<TokenizerConfig> {
        &self.config
    }

    fn refresh_config(&self) -> Result<()> {
        self.config.refresh(&self.store, false)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Existing token for `plain_text`, trying the active HMAC version
    /// first and then every other loaded version.
    pub fn search(&self, plain_text: &str) -> Result<Option<String>> {
        self.refresh_config()?;
        if plain_text.len() < MIN_INDEXED_LEN {
            return Ok(None);
        }

        let table = self.kind.table();
        for version in self.config.get_hmac_versions()? {
            let key = self.config.get_hmac_key(version)?;
            let digest = hmac_digest(&key, plain_text.as_bytes())?;
            if let Some(token) = self.store.find_token_by_digest(table, version, &digest)? {
                debug!(hmac_version = version, "deduplicated");
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    /// Store `plain_text` and return its token.
    ///
    /// With `deduplicate`, a value tokenized before returns its existing
    /// token instead.
    pub fn tokenize(
        &mut self,
        plain_text: &str,
        finish_ts: DateTime<Utc>,
        deduplicate: bool,
    ) -> Result<String> {
        self.refresh_config()?;
        if deduplicate {
            if let Some(token) = self.search(plain_text)? {
                return Ok(token);
            }
        }

        let hmac_version = self.config.get_active_hmac_key_version()?;
        let digest = if plain_text.len() >= MIN_INDEXED_LEN {
            hmac_digest(&self.config.get_hmac_key(hmac_version)?, plain_text.as_bytes())?
        } else {
            random_digest()
        };

        let table = self.kind.table();
        loop {
            let dek_record = self.get_active_data_key()?;
            let dek = self.decrypt_dek(&dek_record.dek_crypted, dek_record.kek_version)?;
            let record = NewDataToken {
                token_string: self.generate_token_string()?,
                data_crypted: encrypt_data(&dek, plain_text, self.kind)?,
                hmac_version,
                hmac_digest: digest.clone(),
                finish_ts,
            };

            if self
                .store
                .insert_token_using_key(table, dek_record.id, &record, Utc::now())?
            {
                info!(table = table.name(), dek_id = dek_record.id, "tokenized value");
                return Ok(record.token_string);
            }

            debug!(id = dek_record.id, "DEK used up before the token was stored, retrying");
            if let Some(pool) = self.pool.as_mut() {
                pool.discard(dek_record.id);
            }
        }
    }

    /// The value behind `token_string`.
    pub fn detokenize(&self, token_string: &str) -> Result<String> {
        self.refresh_config()?;
        let record = self
            .store
            .find_token(self.kind.table(), token_string)?
            .ok_or(CardVaultError::TokenNotFound)?;
        let key = self.store.get_data_key(record.dek_id)?.ok_or_else(|| {
            CardVaultError::KeyVersionNotFound(format!("data_key id {}", record.dek_id))
        })?;

        let dek = self.decrypt_dek(&key.dek_crypted, key.kek_version)?;
        decrypt_data(&dek, &record.data_crypted, self.kind)
    }

    /// Delete a token; `false` if it did not exist.
    pub fn remove_data_token(&self, token_string: &str) -> Result<bool> {
        let removed = self.store.delete_token(self.kind.table(), token_string)?;
        if removed {
            info!(table = self.kind.table().name(), "removed token");
        }
        Ok(removed)
    }

    /// A token string not yet present in this tokenizer's table.
    pub fn generate_token_string(&self) -> Result<String> {
        loop {
            let token = random_hex(TOKEN_BYTES);
            if !self.store.token_exists(self.kind.table(), &token)? {
                return Ok(token);
            }
            debug!("token string collision, generating another");
        }
    }

    /// Wrap DEK material under KEK `kek_version`.
    pub fn encrypt_dek(&self, dek: &SecretKey, kek_version: i32) -> Result<String> {
        wrap_key(&self.config.get_master_key(kek_version, true)?, dek)
    }

    /// Unwrap DEK material stored under KEK `kek_version`.
    pub fn decrypt_dek(&self, dek_crypted: &str, kek_version: i32) -> Result<SecretKey> {
        unwrap_key(&self.config.get_master_key(kek_version, true)?, dek_crypted)
    }

    // ------------------------------------------------------------------
    // DEK pool
    // ------------------------------------------------------------------

    pub fn get_active_data_key(&mut self) -> Result<DataKey> {
        let pool = pool_for_active_version(&mut self.pool, &self.config, self.dek_settings)?;
        pool.get_active_data_key(&mut self.store)
    }

    pub fn get_status(&mut self) -> Result<DekPoolStatus> {
        self.refresh_config()?;
        let pool = pool_for_active_version(&mut self.pool, &self.config, self.dek_settings)?;
        pool.get_status(&self.store)
    }

    /// Top the DEK pool up to its configured headroom.
    pub fn generate_enough_deks(&mut self) -> Result<i64> {
        self.refresh_config()?;
        let pool = pool_for_active_version(&mut self.pool, &self.config, self.dek_settings)?;
        pool.generate_enough_deks(&self.store)
    }
}

/// The pool wrapping new keys under the active KEK version; replaced
/// when the active version changes.
fn pool_for_active_version<'a>(
    slot: &'a mut Option<DekPool>,
    config: &TokenizerConfig,
    settings: DekSettings,
) -> Result<&'a mut DekPool> {
    let version = config.get_active_master_key_version()?;
    let pool = match slot.take() {
        Some(pool) if pool.kek_version() == version => pool,
        _ => DekPool::new(settings, version, config.get_master_key(version, true)?)?,
    };
    Ok(slot.insert(pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_data_roundtrips_through_one_block() {
        let dek = SecretKey::new([7; 32]);
        let crypted = encrypt_data(&dek, "4111111111111111", DataKind::Card).unwrap();
        assert_eq!(BASE64.decode(&crypted).unwrap().len(), 16);
        assert_eq!(decrypt_data(&dek, &crypted, DataKind::Card).unwrap(), "4111111111111111");
    }

    #[test]
    fn card_encryption_is_randomized_by_filler() {
        let dek = SecretKey::new([7; 32]);
        let a = encrypt_data(&dek, "123", DataKind::Card).unwrap();
        let b = encrypt_data(&dek, "123", DataKind::Card).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn generic_data_roundtrips() {
        let dek = SecretKey::new([1; 32]);
        for value in ["", "short", "exactly sixteen!", "пароль с юникодом и длинный хвост"] {
            let crypted = encrypt_data(&dek, value, DataKind::Generic).unwrap();
            assert_eq!(decrypt_data(&dek, &crypted, DataKind::Generic).unwrap(), value);
        }
    }

    #[test]
    fn card_kind_rejects_letters() {
        let dek = SecretKey::new([1; 32]);
        assert!(matches!(
            encrypt_data(&dek, "4111-1111", DataKind::Card),
            Err(CardVaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn decrypt_rejects_bad_base64() {
        let dek = SecretKey::new([1; 32]);
        assert!(matches!(
            decrypt_data(&dek, "***", DataKind::Generic),
            Err(CardVaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn kinds_use_separate_tables() {
        assert_eq!(DataKind::Card.table(), TokenTable::DataToken);
        assert_eq!(DataKind::Generic.table(), TokenTable::SecureVault);
    }
}
