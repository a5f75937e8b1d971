pub mod config;
pub mod control;
pub mod signaling;
pub mod wire;

pub use config::*;
pub use control::*;
pub use signaling::*;
pub use wire::*;
