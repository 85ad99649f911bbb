//! SQLite persistence for config entries, data keys and token records.
//!
//! Several processes may open the same database file.  All exclusion goes
//! through SQLite transactions; every connection waits on the file lock
//! (busy timeout) instead of failing straight away.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::warn;

use crate::errors::Result;

use super::model::{
    format_ts, parse_ts, DataKey, DataToken, NewDataKey, NewDataToken, TokenTable,
};

/// How long a connection waits for a competing writer.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    ckey    TEXT PRIMARY KEY,
    cvalue  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_key (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    dek_crypted  TEXT NOT NULL,
    kek_version  INTEGER NOT NULL,
    start_ts     TEXT NOT NULL,
    finish_ts    TEXT NOT NULL,
    counter      INTEGER NOT NULL DEFAULT 0,
    max_counter  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS data_token (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    token_string  TEXT NOT NULL UNIQUE,
    dek_id        INTEGER NOT NULL REFERENCES data_key(id),
    data_crypted  TEXT NOT NULL,
    hmac_version  INTEGER NOT NULL,
    hmac_digest   TEXT NOT NULL,
    finish_ts     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS data_token_digest ON data_token(hmac_digest);

CREATE TABLE IF NOT EXISTS secure_vault (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    token_string  TEXT NOT NULL UNIQUE,
    dek_id        INTEGER NOT NULL REFERENCES data_key(id),
    data_crypted  TEXT NOT NULL,
    hmac_version  INTEGER NOT NULL,
    hmac_digest   TEXT NOT NULL,
    finish_ts     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS secure_vault_digest ON secure_vault(hmac_digest);
";

/// A handle on the vault database.
pub struct Store {
    conn: Connection,
}

impl Store {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Open (or create) the database file at `path` and make sure the
    /// schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Owner-only access: the file holds share #3 of every KEK.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!(path = %path.display(), error = %e, "could not restrict database permissions");
            }
        }

        // WAL lets readers proceed while one writer holds the lock.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Config entries
    // ------------------------------------------------------------------

    /// Every config entry.
    pub fn config_params(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT ckey, cvalue FROM config")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut params = BTreeMap::new();
        for row in rows {
            let (key, value): (String, String) = row?;
            params.insert(key, value);
        }
        Ok(params)
    }

    pub fn get_config_param(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT cvalue FROM config WHERE ckey = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Insert or overwrite one config entry.
    pub fn set_config_param(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (ckey, cvalue) VALUES (?1, ?2)
             ON CONFLICT(ckey) DO UPDATE SET cvalue = excluded.cvalue",
            params![key, value],
        )?;
        Ok(())
    }

    /// Remove one config entry; `false` if it was not set.
    pub fn delete_config_param(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM config WHERE ckey = ?1", params![key])?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Data keys
    // ------------------------------------------------------------------

    /// Insert a data key and return it with its new id.
    pub fn insert_data_key(&self, key: &NewDataKey) -> Result<DataKey> {
        self.conn.execute(
            "INSERT INTO data_key (dek_crypted, kek_version, start_ts, finish_ts, counter, max_counter)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                key.dek_crypted,
                key.kek_version,
                format_ts(key.start_ts),
                format_ts(key.finish_ts),
                key.max_counter,
            ],
        )?;
        Ok(DataKey {
            id: self.conn.last_insert_rowid(),
            dek_crypted: key.dek_crypted.clone(),
            kek_version: key.kek_version,
            start_ts: key.start_ts,
            finish_ts: key.finish_ts,
            counter: 0,
            max_counter: key.max_counter,
        })
    }

    pub fn get_data_key(&self, id: i64) -> Result<Option<DataKey>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, dek_crypted, kek_version, start_ts, finish_ts, counter, max_counter
                 FROM data_key WHERE id = ?1",
                params![id],
                data_key_from_row,
            )
            .optional()?)
    }

    /// Re-read one data key inside an immediate (write-locked)
    /// transaction, so the values reflect every committed use.
    pub fn lock_data_key(&mut self, id: i64) -> Result<Option<DataKey>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let key = tx
            .query_row(
                "SELECT id, dek_crypted, kek_version, start_ts, finish_ts, counter, max_counter
                 FROM data_key WHERE id = ?1",
                params![id],
                data_key_from_row,
            )
            .optional()?;
        tx.commit()?;
        Ok(key)
    }

    /// Data keys that may encrypt new values at `now`.
    ///
    /// HMAC-purpose keys (`max_counter = 0`) are never included.
    pub fn active_data_keys(&self, now: DateTime<Utc>) -> Result<Vec<DataKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, dek_crypted, kek_version, start_ts, finish_ts, counter, max_counter
             FROM data_key
             WHERE max_counter > 0 AND counter < max_counter AND finish_ts > ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![format_ts(now)], data_key_from_row)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Number of data-purpose keys ever created.
    pub fn count_data_keys(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM data_key WHERE max_counter > 0",
            [],
            |row| row.get(0),
        )?)
    }

    /// Active key count and remaining uses summed over them.
    pub fn active_headroom(&self, now: DateTime<Utc>) -> Result<(i64, i64)> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(max_counter - counter), 0)
             FROM data_key
             WHERE max_counter > 0 AND counter < max_counter AND finish_ts > ?1",
            params![format_ts(now)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    // ------------------------------------------------------------------
    // Token records
    // ------------------------------------------------------------------

    /// Record one use of `dek_id` and insert the token in one transaction.
    ///
    /// The counter update only applies while the key is still active; if
    /// another caller used up the key first nothing is written and
    /// `Ok(false)` is returned.  When the new counter reaches
    /// `max_counter`, `finish_ts` is pulled in to `now`.
    pub fn insert_token_using_key(
        &mut self,
        table: TokenTable,
        dek_id: i64,
        token: &NewDataToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_text = format_ts(now);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed = tx.execute(
            "UPDATE data_key
             SET counter = counter + 1,
                 finish_ts = CASE WHEN counter + 1 >= max_counter THEN ?2 ELSE finish_ts END
             WHERE id = ?1 AND max_counter > 0 AND counter < max_counter AND finish_ts > ?2",
            params![dek_id, now_text],
        )?;
        if claimed == 0 {
            tx.rollback()?;
            return Ok(false);
        }

        tx.execute(
            &format!(
                "INSERT INTO {} (token_string, dek_id, data_crypted, hmac_version, hmac_digest, finish_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                table.name()
            ),
            params![
                token.token_string,
                dek_id,
                token.data_crypted,
                token.hmac_version,
                token.hmac_digest,
                format_ts(token.finish_ts),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn token_exists(&self, table: TokenTable, token_string: &str) -> Result<bool> {
        Ok(self.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE token_string = ?1)",
                table.name()
            ),
            params![token_string],
            |row| row.get(0),
        )?)
    }

    pub fn find_token(&self, table: TokenTable, token_string: &str) -> Result<Option<DataToken>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT id, token_string, dek_id, data_crypted, hmac_version, hmac_digest, finish_ts
                     FROM {} WHERE token_string = ?1",
                    table.name()
                ),
                params![token_string],
                data_token_from_row,
            )
            .optional()?)
    }

    /// Oldest token whose digest under `hmac_version` equals `digest`.
    pub fn find_token_by_digest(
        &self,
        table: TokenTable,
        hmac_version: i32,
        digest: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT token_string FROM {}
                     WHERE hmac_digest = ?1 AND hmac_version = ?2
                     ORDER BY id LIMIT 1",
                    table.name()
                ),
                params![digest, hmac_version],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Delete a token; `false` if there was nothing to delete.
    pub fn delete_token(&self, table: TokenTable, token_string: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            &format!("DELETE FROM {} WHERE token_string = ?1", table.name()),
            params![token_string],
        )?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_ts(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn data_key_from_row(row: &Row<'_>) -> rusqlite::Result<DataKey> {
    Ok(DataKey {
        id: row.get(0)?,
        dek_crypted: row.get(1)?,
        kek_version: row.get(2)?,
        start_ts: ts_column(row, 3)?,
        finish_ts: ts_column(row, 4)?,
        counter: row.get(5)?,
        max_counter: row.get(6)?,
    })
}

fn data_token_from_row(row: &Row<'_>) -> rusqlite::Result<DataToken> {
    Ok(DataToken {
        id: row.get(0)?,
        token_string: row.get(1)?,
        dek_id: row.get(2)?,
        data_crypted: row.get(3)?,
        hmac_version: row.get(4)?,
        hmac_digest: row.get(5)?,
        finish_ts: ts_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn new_key(max_counter: i64, ttl: Duration) -> NewDataKey {
        let now = Utc::now();
        NewDataKey {
            dek_crypted: "c2VjcmV0".into(),
            kek_version: 1,
            start_ts: now,
            finish_ts: now + ttl,
            max_counter,
        }
    }

    fn new_token(token: &str, digest: &str) -> NewDataToken {
        NewDataToken {
            token_string: token.into(),
            data_crypted: "Y2lwaGVy".into(),
            hmac_version: 1,
            hmac_digest: digest.into(),
            finish_ts: Utc::now() + Duration::days(30),
        }
    }

    #[test]
    fn open_creates_database_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");
        Store::open(&path).unwrap();
        assert!(path.exists());
        // Opening again must not fail on the existing schema.
        Store::open(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn database_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");
        Store::open(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn config_params_upsert() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_config_param("KEK_VERSION").unwrap(), None);

        store.set_config_param("KEK_VERSION", "1").unwrap();
        store.set_config_param("KEK_VERSION", "2").unwrap();
        store.set_config_param("HMAC_VERSION", "1").unwrap();

        assert_eq!(store.get_config_param("KEK_VERSION").unwrap().as_deref(), Some("2"));
        let all = store.config_params().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["HMAC_VERSION"], "1");
    }

    #[test]
    fn delete_config_param_reports_absence() {
        let store = Store::open_in_memory().unwrap();
        store.set_config_param("KEK_TARGET_VERSION", "2").unwrap();

        assert!(store.delete_config_param("KEK_TARGET_VERSION").unwrap());
        assert!(!store.delete_config_param("KEK_TARGET_VERSION").unwrap());
        assert_eq!(store.get_config_param("KEK_TARGET_VERSION").unwrap(), None);
    }

    #[test]
    fn active_data_keys_skip_exhausted_expired_and_hmac_keys() {
        let mut store = Store::open_in_memory().unwrap();
        let live = store.insert_data_key(&new_key(2, Duration::days(1))).unwrap();
        store.insert_data_key(&new_key(2, Duration::seconds(-5))).unwrap();
        store.insert_data_key(&new_key(0, Duration::days(366))).unwrap();
        let spent = store.insert_data_key(&new_key(1, Duration::days(1))).unwrap();

        assert!(store
            .insert_token_using_key(TokenTable::DataToken, spent.id, &new_token("t1", "d1"), Utc::now())
            .unwrap());

        let active = store.active_data_keys(Utc::now()).unwrap();
        assert_eq!(active.iter().map(|k| k.id).collect::<Vec<_>>(), vec![live.id]);
        assert_eq!(store.count_data_keys().unwrap(), 3);
        assert_eq!(store.active_headroom(Utc::now()).unwrap(), (1, 2));
    }

    #[test]
    fn key_use_stops_at_max_counter() {
        let mut store = Store::open_in_memory().unwrap();
        let key = store.insert_data_key(&new_key(2, Duration::days(1))).unwrap();
        let table = TokenTable::DataToken;

        assert!(store.insert_token_using_key(table, key.id, &new_token("a", "x"), Utc::now()).unwrap());
        assert!(store.insert_token_using_key(table, key.id, &new_token("b", "y"), Utc::now()).unwrap());
        assert!(!store.insert_token_using_key(table, key.id, &new_token("c", "z"), Utc::now()).unwrap());

        let reread = store.lock_data_key(key.id).unwrap().unwrap();
        assert_eq!(reread.counter, 2);
        assert!(!reread.is_active(Utc::now()));
        // The losing insert was rolled back.
        assert!(!store.token_exists(table, "c").unwrap());
    }

    #[test]
    fn tokens_are_found_by_string_and_digest() {
        let mut store = Store::open_in_memory().unwrap();
        let key = store.insert_data_key(&new_key(10, Duration::days(1))).unwrap();
        let table = TokenTable::SecureVault;
        store.insert_token_using_key(table, key.id, &new_token("first", "dig"), Utc::now()).unwrap();
        store.insert_token_using_key(table, key.id, &new_token("second", "dig"), Utc::now()).unwrap();

        let rec = store.find_token(table, "second").unwrap().unwrap();
        assert_eq!(rec.dek_id, key.id);
        assert_eq!(rec.hmac_digest, "dig");

        assert_eq!(store.find_token_by_digest(table, 1, "dig").unwrap().as_deref(), Some("first"));
        assert_eq!(store.find_token_by_digest(table, 2, "dig").unwrap(), None);
        // Tables are separate.
        assert!(store.find_token(TokenTable::DataToken, "first").unwrap().is_none());
    }

    #[test]
    fn delete_token_reports_absence() {
        let mut store = Store::open_in_memory().unwrap();
        let key = store.insert_data_key(&new_key(10, Duration::days(1))).unwrap();
        let table = TokenTable::DataToken;
        store.insert_token_using_key(table, key.id, &new_token("gone", "d"), Utc::now()).unwrap();

        assert!(store.delete_token(table, "gone").unwrap());
        assert!(!store.delete_token(table, "gone").unwrap());
        assert!(!store.delete_token(table, "never").unwrap());
    }
}
