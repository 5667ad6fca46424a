pub mod cache;
pub mod cli;
pub mod config;
pub mod core;

pub use crate::config::TokenMapConfig;
pub use crate::core::*;
