//! Content-addressed backup receiver.
//!
//! Clients open a session with their manifest, upload the content the
//! receiver lacks (resumable, hash-verified), then commit a version that is
//! filed under a per-date day bucket.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;

pub use config::AppConfig;
pub use routes::create_router;
pub use state::AppState;
