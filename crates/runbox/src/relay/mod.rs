//! Stdio relay: duplex channel between stream clients and running processes.

mod handler;
mod hub;
mod types;

pub use handler::stream_handler;
pub use hub::RelayHub;
pub use types::{RelayCommand, RelayEvent};
