//! Multi-tenant browser orchestration.
//!
//! This crate is the control plane proper: it multiplexes many agent users
//! onto a bounded pool of persistent browser contexts while keeping per-tab
//! operations serialized, per-user operations bounded, and long-lived
//! profiles correct under eviction and crashes.
//!
//! The pieces, leaf to root:
//!
//! - [`rate_limit::RateLimiter`] — per-user fixed windows
//! - [`health::HealthTracker`] — consecutive-failure health signal
//! - [`pool::ContextPool`] — bounded LRU of persistent contexts
//! - [`registry::SessionRegistry`] — sessions → tab groups → tabs
//! - [`limiter::UserLimiter`] — per-user max-in-flight with FIFO wait
//! - [`tab_lock::TabLocks`] — strict per-tab serialization
//! - [`snapshot`] — aria snapshot → ref table → annotated text
//! - [`actions`] — ref-addressed page actions
//! - [`downloads::DownloadRegistry`] — quota'd, crash-safe download registry
//! - [`resources`] — scoped DOM extraction and batch downloading
//! - [`core::Core`] — the owned struct wiring it all together

pub mod actions;
pub mod core;
pub mod downloads;
pub mod health;
pub mod limiter;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod resources;
pub mod snapshot;
pub mod tab_lock;
pub mod types;

pub use {
    actions::Action,
    core::Core,
    types::{DownloadInfo, DownloadStatus, RefInfo, SnapshotWindow},
};
