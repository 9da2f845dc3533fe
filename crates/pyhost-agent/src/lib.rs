pub mod api;
pub mod config;
pub mod env_file;
pub mod error_payload;
pub mod http;
pub mod lifecycle;
pub mod logs;
pub mod process_manager;
pub mod repo;
pub mod stats;
pub mod store;
