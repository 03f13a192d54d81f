//! Shared vocabulary for the AP2 reference stack.
//!
//! Two things live here because every other crate needs them:
//!
//! - [`error`]: the enumerated protocol error codes and the structured
//!   error type that carries them across service boundaries.
//! - [`money`]: exact-decimal amounts. No float ever touches the signed
//!   path; cross-currency arithmetic fails loudly.

pub mod error;
pub mod money;

pub use error::{ErrorCode, ProtocolError};
pub use money::{Amount, MoneyError};
