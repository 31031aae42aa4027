//! Process lifecycle of a user's pipeline backend
//!
//! The lifecycle manager owns the only mutable state of the spawner: one
//! [`ProcessRecord`] per user [`Session`], guarded by the session's mutex.
//!
//! # State machine
//!
//! ```text
//! NotStarted --start--> Starting --probe ok--> Running
//!                          |                      |
//!                          |  exit / timeout      | exit
//!                          v                      v
//!                        Failed <-----------------+
//!
//! Starting | Running --stop--> Stopping --exit or SIGKILL--> Stopped
//! ```
//!
//! `Stopped` and `Failed` are terminal; a later `start` replaces the record with a fresh one.
//!
//! # Re-attachment
//!
//! Records restored through [`LifecycleManager::load_state`] have no child handle. Their
//! liveness comes from a [`ProcessInspector`], which also guards against a pid that has
//! been reused by an unrelated process.

mod inspect;
mod manager;
mod probe;
mod record;
mod session;

pub use inspect::{Liveness, ProcessInspector, SystemInspector};
pub use manager::LifecycleManager;
pub use probe::{ReadinessProbe, TcpProbe};
pub use record::{FailureKind, PersistedState, ProcessRecord, ProcessState};
pub use session::Session;
