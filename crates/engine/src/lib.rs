//! Browser engine capability seam.
//!
//! The control plane never talks to a browser directly; it goes through the
//! [`Engine`] family of traits. Two implementations ship here:
//!
//! - [`cdp::CdpEngine`] — Chrome/Chromium over CDP via chromiumoxide, one
//!   process per persistent profile directory.
//! - [`fake::FakeEngine`] — deterministic in-memory engine for tests.

pub mod cdp;
pub mod error;
pub mod fake;
pub mod traits;
pub mod types;

pub use {
    error::EngineError,
    traits::{DownloadHandler, Engine, EngineContext, EngineDownload, EnginePage},
    types::{
        BoundingBox, Cookie, FetchedBody, LaunchOptions, LoadState, ScrollMetrics, ScrollRequest,
        SeedOptions, Selector,
    },
};

pub type Result<T> = std::result::Result<T, EngineError>;
