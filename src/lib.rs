pub mod config;
pub mod control;
pub mod error;
pub mod servo;
