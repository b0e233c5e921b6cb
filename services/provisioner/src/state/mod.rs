//! Local state persistence for the provisioner.
//!
//! A single JSON document records the resource this node claimed, so a
//! restarted daemon re-attaches it without re-running the claim race. An
//! absent file is the normal first-boot state.

mod store;

pub use store::{LocalStateCache, LocalStateRecord, StateStoreError};
