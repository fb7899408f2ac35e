//! # tandem-client
//!
//! Device-side half of Tandem, an offline-first sync system for shared
//! family data. Every read and write goes against an encrypted local
//! SQLite store; changes queue as durable mutations and a background
//! engine reconciles with the server whenever connectivity allows.
//!
//! The pure reconciliation rules (conflict detection, resolution
//! strategies, queue ordering) live in `tandem-engine`; this crate adds
//! persistence, the wire transport seam, orchestration, and scheduling.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tandem_client::*;
//! # use tandem_engine::{FieldDef, FieldType, SyncSchema, TypePolicy};
//! # async fn demo(transport: Arc<dyn SyncTransport>) -> Result<()> {
//! let schema = SyncSchema::new(1).with_type(TypePolicy::new(
//!     "tasks",
//!     vec![FieldDef::required("title", FieldType::String)],
//! ));
//! let store = LocalStore::open(
//!     std::path::Path::new("tandem.db"),
//!     &StaticKeyProvider([0u8; 32]),
//! )
//! .await?;
//! let context = SyncContext {
//!     device_id: "device-a".into(),
//!     family_scope: "family-1".into(),
//!     auth: Arc::new(StaticTokenProvider("token".into())),
//! };
//! let engine =
//!     SyncEngine::new(store, transport, schema, Config::default(), context).await?;
//!
//! engine.create("tasks", serde_json::json!({"title": "Dishes"})).await?;
//! let report = engine.sync().await?;
//! println!("pushed {}", report.session.pushed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod presenter;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use config::Config;
pub use engine::{SyncEngine, SyncReport};
pub use error::{Error, Result};
pub use presenter::{ConflictInbox, ConflictPresenter};
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use store::{Cipher, KeyProvider, LocalStore, StaticKeyProvider, SyncCommit};
pub use transport::{PullPage, PushOutcome, RejectCode, SyncTransport};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the bearer token attached to server requests. Token refresh
/// is the provider's concern; transports call this per request.
pub trait AuthTokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, for tests and long-lived device credentials.
pub struct StaticTokenProvider(pub String);

impl AuthTokenProvider for StaticTokenProvider {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Identity under which this device syncs.
#[derive(Clone)]
pub struct SyncContext {
    /// Stable identifier for this device
    pub device_id: String,
    /// The family whose data this device sees
    pub family_scope: String,
    /// Credential source for the transport
    pub auth: Arc<dyn AuthTokenProvider>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("device_id", &self.device_id)
            .field("family_scope", &self.family_scope)
            .finish_non_exhaustive()
    }
}

/// Wall-clock milliseconds since the Unix epoch, for data timestamps.
pub(crate) fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
