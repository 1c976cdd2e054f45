//! Utility modules for the backup client.

pub mod errors;
pub mod logger;
pub mod retry;

pub use errors::{ClientError, Result};
