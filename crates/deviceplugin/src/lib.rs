pub mod api;
pub mod config;
mod discover;
pub mod errors;
pub mod lister;
pub mod manager;
pub mod plugin;
pub mod record;
pub mod service;
