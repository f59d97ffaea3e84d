//! Key checks for the script-execution and admin surfaces.

use axum::http::HeaderMap;

use camofox_common::{CoreError, Result};

use crate::state::AppState;

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Endpoints that execute arbitrary script or import cookies require the
/// configured API key as a bearer token. With no key configured they are
/// open (the server warns at startup).
pub fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(ref expected) = state.core.config.api_key else {
        return Ok(());
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token, expected) => Ok(()),
        _ => Err(CoreError::auth("invalid or missing API key")),
    }
}

/// The admin stop endpoint always requires `x-admin-key`.
pub fn require_admin_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(ref expected) = state.core.config.admin_key else {
        return Err(CoreError::auth("admin key not configured"));
    };
    let presented = headers.get("x-admin-key").and_then(|v| v.to_str().ok());
    match presented {
        Some(key) if constant_time_eq(key, expected) => Ok(()),
        _ => Err(CoreError::auth("invalid or missing admin key")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "a"));
        assert!(constant_time_eq("", ""));
    }
}
