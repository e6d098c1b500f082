//! sayerd: one `speak(role, text)` RPC in front of interchangeable TTS backends,
//! restarted in place whenever its config file changes.

pub mod backends;
pub mod config_loader;
pub mod config_store;
pub mod error;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use error::{Result, SayerError};
