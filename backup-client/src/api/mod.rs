//! Talking to the receiver.

pub mod receiver;

pub use receiver::{no_progress, ReceiverClient, UploadTarget};
