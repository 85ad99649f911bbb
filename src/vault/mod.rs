//! Vault module: token storage and the tokenization engine.
//!
//! This module provides:
//! - Persisted record types (`model`)
//! - SQLite access for config entries, data keys and tokens (`store`)
//! - The DEK pool with race-safe key selection (`dek_pool`)
//! - The `Tokenizer` that ties keys, ciphers and storage together (`tokenizer`)

pub mod dek_pool;
pub mod model;
pub mod store;
pub mod tokenizer;

// Re-export the most commonly used items.
pub use dek_pool::DekPool;
pub use model::{DataKey, DataToken, DekPoolStatus, KeyPurpose, TokenTable};
pub use store::Store;
pub use tokenizer::{decrypt_data, encrypt_data, DataKind, Tokenizer};
