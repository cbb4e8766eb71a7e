pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod guard;
pub mod memory;
pub mod metrics;
pub mod middleware;
pub mod producer;
pub mod server;
pub mod sources;
pub mod store;
pub mod sweeper;
pub mod webhook;

pub use error::IdempotencyError;
pub use executor::{Execution, OperationExecutor, OperationRequest};
pub use guard::{ConcurrencyGuard, KeyLock};
pub use store::{ClaimOutcome, IdempotencyStore, RedbIdempotencyStore};
pub use sweeper::CleanupSweeper;
pub use webhook::WebhookIdempotencyAdapter;
