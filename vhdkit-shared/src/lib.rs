//! vhdkit shared code
//!
//! This crate contains the error taxonomy and the backend status/ABI constants
//! used by the `vhdkit` library and by backend implementations (including the
//! in-memory test backends).

pub mod constants;
pub mod errors;

pub use errors::{VhdkitError, VhdkitResult};
