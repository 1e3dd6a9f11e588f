//! Common types for the CRM credential gateway

mod clock;
mod error;
mod secret;

pub use clock::now_millis;
pub use error::{Error, Result};
pub use secret::Secret;
