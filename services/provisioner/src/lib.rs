//! zoneclaim provisioner
//!
//! Claims, attaches, and prepares one zone-pinned resource (block volume,
//! network interface, or floating address) for an auto-scaled node at boot,
//! recovering the same resource after the node is replaced.
//!
//! ## Architecture
//!
//! - **TagStore**: resource tags as the fleet's only shared metadata
//! - **LeaseManager**: tag-encoded leases with timeout-based takeover
//! - **LocalStateCache**: the claimed id, persisted across daemon restarts
//! - **Convergence**: polling the provider until a resource reaches a state
//! - **ResourceProvisioner**: the boot sequence composing all of the above
//! - **Backend**: provider capability interface (HTTP gateway or in-memory)

pub mod backend;
pub mod clock;
pub mod config;
pub mod converge;
pub mod disk;
pub mod error;
pub mod lease;
pub mod logging;
pub mod model;
pub mod provisioner;
pub mod state;
pub mod tags;

pub use backend::{BackendError, HttpBackend, InMemoryBackend, ResourceBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::ProvisionError;
pub use lease::{ClaimOutcome, LeaseManager, LeasePolicy, LeaseRecord};
pub use provisioner::{Acquisition, ProvisionReport, ResourceProvisioner};
pub use state::{LocalStateCache, LocalStateRecord};
pub use tags::{TagKeys, TagStore};
