//! Re-exports the signing contract for callers that only need the trait,
//! not the rest of [`crate::config`]. The actual trait and its no-op
//! implementation live there since [`crate::config::SystemContext`] owns
//! the signer instance.

pub use crate::config::{NoopSigner, Signer};
