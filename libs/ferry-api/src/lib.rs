pub mod broker;
pub mod delivery;
pub mod error;
pub mod message;
pub mod record;
