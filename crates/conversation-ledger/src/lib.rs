pub mod collaborator;
pub mod config;
pub mod dedup;
pub mod error;
pub mod heatmap;
pub mod memory_db;
pub mod search;
pub mod shared_state;
pub mod sync_engine;
pub mod telemetry;
pub mod topics;
pub mod utils;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod metrics;
#[cfg(feature = "cli")]
pub mod server;

// Public API exports
pub use config::Config;
pub use error::{LedgerError, LedgerResult};
pub use heatmap::{KeywordEvent, WeightClass};
pub use memory_db::{CanonicalMessage, MemoryDatabase, MemoryEntry, NewMemory, RawMessage, Role, Topic};
pub use search::{SearchFilters, SearchOutcome};
pub use shared_state::SharedState;
pub use sync_engine::SyncOutcome;

#[cfg(feature = "cli")]
pub use server::{build_router, run_server};
