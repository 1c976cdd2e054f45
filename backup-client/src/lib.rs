//! Backup client library.
//!
//! Scans a directory, hashes its files and uploads the content a
//! content-addressed receiver does not hold yet, resuming interrupted
//! uploads from the receiver's byte offset.

pub mod api;
pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod fs;
pub mod transfer;
pub mod utils;

pub use config::Config;
pub use executor::{RunReport, SyncEngine};
pub use utils::errors::ClientError;
pub type Result<T> = std::result::Result<T, ClientError>;
