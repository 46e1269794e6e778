//! Shared wire types for agent-trail: composite identifiers, the normalized
//! entry model, session listings and the patch protocol frames.
//!
//! Everything here is plain data. No I/O happens in this crate.

pub mod entry;
pub mod ids;
pub mod patch;
pub mod session;

pub use entry::*;
pub use ids::*;
pub use patch::*;
pub use session::*;
