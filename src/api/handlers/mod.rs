//! API request handlers

pub mod assignment;
pub mod health;
pub mod proxy;
