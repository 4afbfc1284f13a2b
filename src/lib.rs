pub mod body;
pub mod ca;
pub mod commands;
pub mod config;
pub mod criteria;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod proxy;
pub mod state;
pub mod stream;

pub use proxy::{BoundProxy, Proxy};
