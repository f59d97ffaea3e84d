//! Engine-facing value types.

use serde::{Deserialize, Serialize};

/// Load states a page wait can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    Load,
    NetworkIdle,
}

/// How an element is addressed.
///
/// Ref resolution always produces a [`Selector::Role`]; CSS selectors are
/// reserved for internal probes (consent dismissal, resource extraction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    Role {
        role: String,
        name: String,
        nth: usize,
    },
}

impl Selector {
    pub fn role(role: impl Into<String>, name: impl Into<String>, nth: usize) -> Self {
        Self::Role {
            role: role.into(),
            name: name.into(),
            nth,
        }
    }
}

/// First-launch seed options for a persistent context.
///
/// Honored only when the context is actually launched; a live context keeps
/// whatever it was seeded with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedOptions {
    pub locale: Option<String>,
    pub timezone_id: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub viewport: Option<Viewport>,
}

impl SeedOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Proxy settings passed through to the engine process.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Options for launching a persistent context.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Run without a window. When false with `virtual_display` set, the
    /// engine still gets headless-adjacent flags but renders to the display
    /// the environment provides.
    pub headless: bool,
    pub virtual_display: bool,
    pub proxy: Option<ProxySettings>,
    pub seed: SeedOptions,
    /// Directory the engine may spill in-progress downloads into.
    pub downloads_dir: Option<std::path::PathBuf>,
}

/// An element's bounding box in CSS pixels.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Scroll request against an element: absolute target or relative delta.
#[derive(Debug, Clone, Copy)]
pub enum ScrollRequest {
    To { top: f64, left: f64 },
    By { delta_x: f64, delta_y: f64 },
}

/// The six scroll metrics of an element after a scroll.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub scroll_width: f64,
    pub scroll_height: f64,
    pub client_width: f64,
    pub client_height: f64,
}

/// A browser cookie, in the wire shape clients import/export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Unix seconds; absent for session cookies.
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

/// Body fetched through the context's request capability.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_options_empty_detection() {
        assert!(SeedOptions::default().is_empty());
        let seeded = SeedOptions {
            locale: Some("de-DE".into()),
            ..Default::default()
        };
        assert!(!seeded.is_empty());
    }

    #[test]
    fn bounding_box_center() {
        let b = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(b.center(), (60.0, 40.0));
    }

    #[test]
    fn cookie_wire_shape_roundtrips() {
        let json = r#"{"name":"sid","value":"abc","domain":".example.com","httpOnly":true}"#;
        let c: Cookie = serde_json::from_str(json).unwrap();
        assert_eq!(c.name, "sid");
        assert!(c.http_only);
        assert!(!c.secure);
        assert!(c.expires.is_none());
    }
}
