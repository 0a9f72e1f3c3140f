//! Multi-tenant WhatsApp session gateway.

pub mod config;
pub mod handlers;
pub mod protocol;
pub mod qr;
pub mod response;
pub mod server;
pub mod session;
pub mod store;
