//! Environment-driven configuration.
//!
//! Every tunable is read once at startup into an immutable [`Config`].
//! Invalid integers fall back to the documented default with a warning;
//! an invalid port or an un-creatable directory is a startup error.

mod env;
mod schema;

pub use {
    env::load_from_env,
    schema::{Config, HeadlessMode, ProxyConfig},
};
