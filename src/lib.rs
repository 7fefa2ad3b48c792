pub mod ackq;
pub mod admission;
pub mod auth;
pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod error;
pub mod input;
pub mod login;
pub mod net;
pub mod registry;
pub mod screen;
pub mod telnet;
pub mod tunnel;

// Convenient re-exports (so call sites can do `bbsgate::Registry`, etc.)
pub use config::{Cli, Settings};
pub use registry::{GateStats, Registry};
