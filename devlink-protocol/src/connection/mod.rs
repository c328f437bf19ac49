//! Active link management
//!
//! Owns every secured link, one reader and one writer task per link, and
//! routes inbound packets to the pairing state machine or the plugin layer.

mod manager;

pub use manager::{ConnectionConfig, ConnectionManager, ReconnectPolicy};
