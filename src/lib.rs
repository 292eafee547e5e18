pub mod cache;
pub mod characters;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod monitoring;
pub mod motivation;
pub mod needs;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod telegram;
