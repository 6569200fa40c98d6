#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Lease-based distributed mutex for leader election.
//!
//! Exactly one process among N cooperating processes holds a time-bounded
//! lease on a named resource and runs a caller-supplied workload while it
//! does. The lease is renewed in the background; if renewal fails or the
//! holder shuts down, the workload is cancelled and another process takes
//! over on its next acquisition attempt.
//!
//! The lease arbiter itself lives behind the [`LeaseStore`] trait; any
//! backend offering atomic, expiring, at-most-one-holder leases will do.
//! [`InMemoryLeaseStore`] is the in-process reference implementation.

pub mod error;
pub mod manager;
pub mod mutex;
pub mod store;

pub mod test_utils;

pub use error::{Error, Result};
pub use manager::LeaseManager;
pub use mutex::{DistributedMutex, MutexSettings};
pub use store::{AcquireOutcome, InMemoryLeaseStore, LeaseStore, LeaseToken};

/// Logical name of the mutually-exclusive resource (e.g. `"leader"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LeaseKey(pub String);

impl LeaseKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl From<&str> for LeaseKey {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
