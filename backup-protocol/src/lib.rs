//! Types shared by the backup client and the receiver.
//!
//! The receiver stores file content by its SHA-256 digest, so both sides
//! agree on [`ContentHash`] and on the JSON bodies in [`wire`].

pub mod hash;
pub mod wire;

pub use hash::{hash_bytes, hash_file, hash_reader, ContentHash, InvalidHash};
