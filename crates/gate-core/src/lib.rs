pub mod fingerprint;
pub mod key;
pub mod model;
pub mod signatures;

pub use fingerprint::{Fingerprint, fingerprint};
pub use key::{IdempotencyKey, InvalidKeyFormat};
pub use model::{IdempotencyRecord, RecordStatus, TransitionError};
