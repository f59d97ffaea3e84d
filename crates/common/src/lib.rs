//! Shared error taxonomy and small utilities used across all camofox crates.

pub mod error;
pub mod time;

pub use {
    error::{CoreError, Result},
    time::now_millis,
};
