//! The verso fanout gateway: one persistent push connection per session,
//! fed from a shared publish/subscribe bus so any process handling a write
//! can notify every process holding interested connections.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod redis_bus;
pub mod ws;
