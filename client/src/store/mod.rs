//! Encrypted local persistence: entities, the durable mutation queue, the
//! pull cursor, and conflict records.

pub mod crypto;
pub mod schema;
pub mod sqlite;

pub use crypto::{Cipher, KeyProvider, StaticKeyProvider};
pub use sqlite::{LocalStore, SyncCommit};
