//! Warden - Proxy Pool & Health Management
//!
//! Keeps a pool of upstream proxies healthy and hands them out to accounts.
//!
//! ## Features
//!
//! - Prioritized TCP + HTTP health probing with bounded concurrency
//! - Score and status rules with automatic blacklisting
//! - Exclusive proxy-to-account assignment
//! - Write-behind persistence to PostgreSQL
//! - REST API with a WebSocket event stream

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod proxy;
pub mod repository;
pub mod services;

pub use config::Config;
pub use database::Database;
pub use error::{Result, WardenError};
