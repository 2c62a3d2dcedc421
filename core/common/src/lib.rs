//! Common utilities and types shared across Keyward crates.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy, vault identifiers, sensitive buffers and the clock
//! abstraction used for expiry and lockout deadlines.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{SensitiveBytes, VaultId};
