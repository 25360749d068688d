//! Session persistence, locking, and stale-session recovery (component D).

pub mod lock;
pub mod registry;
pub mod store;

pub use lock::{AcquireOptions, AcquireResult, CheckResult, SessionLock};
pub use registry::{RegistryEntry, SessionRegistry};
pub use store::{
    detect_and_recover_stale_session, PersistedSessionState, SessionMeta, SessionStatus,
    SessionStore, StaleRecoveryOutcome, TrackerState,
};
