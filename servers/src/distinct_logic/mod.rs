pub mod config;
pub mod handler;
pub mod logger;
pub mod monitor;
pub mod scheduler;
pub mod state;
