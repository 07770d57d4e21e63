//! # confab-shared
//!
//! Identifier types, the room identity codec and constants shared by the
//! confab store and service crates. Nothing in here performs I/O.

pub mod constants;
pub mod error;
pub mod identity;
pub mod types;

pub use error::IdentityError;
pub use types::*;
