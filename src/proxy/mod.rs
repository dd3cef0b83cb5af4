//! Proxy pool and health management
//!
//! This module provides:
//! - The in-memory registry and its status/score rules
//! - Two-stage health probing
//! - Priority scheduling and the batch health worker
//! - Exclusive assignment of proxies to accounts

pub mod broker;
pub mod health;
pub mod registry;
pub mod scheduler;
pub mod scoring;
pub mod worker;

pub use broker::AssignmentBroker;
pub use health::{HttpProber, ProbeConfig, Prober};
pub use registry::Registry;
pub use scheduler::{HealthTask, PriorityLevel, PriorityScheduler, SchedulerConfig};
pub use scoring::{AssignmentEffect, ScorePolicy, Transition};
pub use worker::{HealthWorker, HealthWorkerHandle, WorkerConfig, WorkerStats, WorkerStatsSnapshot};
