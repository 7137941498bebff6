//! Runbox: remote code execution sandbox server.
//!
//! Accepts untrusted source over REST, runs it in per-session isolated
//! containers, and relays stdio over a WebSocket stream channel.

pub mod api;
pub mod container;
pub mod exec;
pub mod languages;
pub mod reaper;
pub mod relay;
pub mod sandbox;
pub mod session;
pub mod settings;
