//! Router assembly and server startup.

use std::{future::Future, net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        routing::{delete, get, post},
    },
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use camofox_browser::Core;

use crate::{download_routes, session_routes, state::AppState, system_routes, tab_routes};

/// Build the full router (shared between production startup and tests).
pub fn build_app(core: Arc<Core>) -> Router {
    let state = AppState::new(core);

    if state.core.config.api_key.is_none() {
        warn!("no API key configured; evaluate and cookie-import endpoints are open");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Tabs
        .route("/tabs", post(tab_routes::create_tab).get(tab_routes::list_tabs))
        .route("/tabs/{tabId}", delete(tab_routes::close_tab))
        .route("/tabs/group/{listItemId}", delete(tab_routes::close_group))
        .route("/tabs/{tabId}/navigate", post(tab_routes::navigate))
        .route("/tabs/{tabId}/snapshot", get(tab_routes::snapshot))
        .route("/tabs/{tabId}/click", post(tab_routes::click))
        .route("/tabs/{tabId}/type", post(tab_routes::type_text))
        .route("/tabs/{tabId}/press", post(tab_routes::press))
        .route("/tabs/{tabId}/scroll", post(tab_routes::scroll))
        .route("/tabs/{tabId}/scroll-element", post(tab_routes::scroll_element))
        .route("/tabs/{tabId}/hover", post(tab_routes::hover))
        .route("/tabs/{tabId}/wait", post(tab_routes::wait))
        .route("/tabs/{tabId}/back", post(tab_routes::back))
        .route("/tabs/{tabId}/forward", post(tab_routes::forward))
        .route("/tabs/{tabId}/refresh", post(tab_routes::refresh))
        .route("/tabs/{tabId}/links", get(tab_routes::links))
        .route("/tabs/{tabId}/screenshot", get(tab_routes::screenshot))
        .route("/tabs/{tabId}/stats", get(tab_routes::stats))
        .route("/tabs/{tabId}/cookies", get(tab_routes::cookies))
        .route("/tabs/{tabId}/evaluate", post(tab_routes::evaluate))
        .route(
            "/tabs/{tabId}/evaluate-extended",
            post(tab_routes::evaluate_extended),
        )
        .route(
            "/tabs/{tabId}/extract-resources",
            post(tab_routes::extract_resources),
        )
        .route(
            "/tabs/{tabId}/batch-download",
            post(tab_routes::batch_download),
        )
        .route("/tabs/{tabId}/resolve-blobs", post(tab_routes::resolve_blobs))
        // Downloads
        .route("/tabs/{tabId}/downloads", get(download_routes::tab_downloads))
        .route("/users/{userId}/downloads", get(download_routes::user_downloads))
        .route(
            "/downloads/{downloadId}",
            get(download_routes::get_download).delete(download_routes::delete_download),
        )
        .route(
            "/downloads/{downloadId}/content",
            get(download_routes::download_content),
        )
        // Sessions
        .route(
            "/sessions/{userId}",
            delete(session_routes::close_user_sessions),
        )
        .route(
            "/sessions/{userId}/cookies",
            post(session_routes::import_cookies),
        )
        .route(
            "/sessions/{userId}/toggle-display",
            post(session_routes::toggle_display),
        )
        // System
        .route("/health", get(system_routes::health))
        .route("/presets", get(system_routes::presets))
        .route("/admin/stop", post(system_routes::admin_stop))
        .layer(cors)
        .with_state(state)
}

/// Serve until the shutdown signal resolves.
pub async fn serve(
    core: Arc<Core>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let port = core.config.port;
    let app = build_app(core);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
