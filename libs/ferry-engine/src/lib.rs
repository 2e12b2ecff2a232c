pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
mod ingest;
pub mod lifecycle;
pub mod loopback;
pub mod record;
pub mod relay;
pub mod state;
pub mod subscription;

pub use error::RelayError;
pub use relay::Relay;
