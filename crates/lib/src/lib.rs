//! Courier core library: device session lifecycle, pairing, and the HTTP send gateway
//! used by the `courier` binary.

pub mod address;
pub mod client;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod gateway;
pub mod init;
pub mod pairing;
pub mod session;
pub mod store;
