//! # zoneclaim-id
//!
//! Typed identifiers used by the resource-claim engine.
//!
//! ## Design Principles
//!
//! - Identifiers are assigned by the cloud backend (resources, attachments)
//!   or by the node itself (its instance identifier); this crate never mints them
//! - Every identifier has a canonical string form with strict parsing
//! - Identifiers are typed so a node id can never be passed where a
//!   resource id is expected
//!
//! ## Format
//!
//! Identifiers are opaque, non-empty ASCII strings of at most
//! [`MAX_ID_LEN`] bytes without whitespace or control characters:
//!
//! - `i-0a1b2c3d4e5f67890` (node)
//! - `vol-0123456789abcdef0` (resource)
//! - `eni-attach-0f00ba44` (attachment)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Maximum accepted identifier length in bytes.
pub const MAX_ID_LEN: usize = 255;

/// Validates the canonical form shared by every identifier type.
pub fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            len: s.len(),
            max: MAX_ID_LEN,
        });
    }
    if let Some((position, ch)) = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii() || c.is_ascii_whitespace() || c.is_ascii_control())
    {
        return Err(IdError::InvalidCharacter { ch, position });
    }
    Ok(())
}
