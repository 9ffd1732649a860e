#[macro_use]
extern crate tracing;

pub mod config;
pub mod daemon;
pub mod logs;
pub mod server;

pub use logs::init_log;
