//! Domain types for the process table.
//!
//! [`BuildProcess`] is the only value exchanged with storage backends. All
//! the invariant checks that do not depend on a backend (ownership, phase
//! finality, supersession) are pure methods on it.

pub mod process;

pub use process::*;
