#![allow(clippy::unwrap_used, clippy::expect_used)]
//! HTTP integration tests: a real listener, the fake engine underneath.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {serde_json::{Value, json}, tokio::net::TcpListener};

use {
    camofox_browser::Core,
    camofox_config::Config,
    camofox_engine::fake::{FakeEngine, FakeSite},
    camofox_gateway::build_app,
};

struct TestServer {
    addr: SocketAddr,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn start_server(engine: &FakeEngine, tweak: impl FnOnce(&mut Config)) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config {
        profiles_dir: tmp.path().join("profiles"),
        downloads_dir: tmp.path().join("downloads"),
        cookies_dir: tmp.path().join("cookies"),
        ..Config::default()
    };
    tweak(&mut config);

    let core = Core::init(Arc::new(config), Arc::new(engine.clone()))
        .await
        .unwrap();
    let app = build_app(core);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, _tmp: tmp }
}

fn engine_with_example() -> FakeEngine {
    let engine = FakeEngine::new();
    engine.add_site(
        "https://example.com/",
        FakeSite::new(
            "Example Domain",
            "- heading \"Example Domain\"\n- link \"More information\"",
        ),
    );
    engine
}

async fn create_tab(client: &reqwest::Client, server: &TestServer, user: &str) -> String {
    let resp = client
        .post(server.url("/tabs"))
        .json(&json!({ "userId": user, "sessionKey": "s" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    body["tabId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_navigate_snapshot_flow() {
    let engine = engine_with_example();
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;

    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/navigate")))
        .json(&json!({ "userId": "u1", "url": "https://example.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let nav: Value = resp.json().await.unwrap();
    assert_eq!(nav["ok"], true);
    assert!(nav["url"].as_str().unwrap().starts_with("https://example.com"));

    let resp = client
        .get(server.url(&format!("/tabs/{tab_id}/snapshot?userId=u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let snap: Value = resp.json().await.unwrap();
    assert!(snap["snapshot"].as_str().unwrap().contains("[e1]"));
    assert!(snap["refsCount"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn cross_user_snapshot_is_404() {
    let engine = engine_with_example();
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;

    let resp = client
        .get(server.url(&format!("/tabs/{tab_id}/snapshot?userId=u2")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Tab not found");

    // Missing userId entirely is indistinguishable.
    let resp = client
        .get(server.url(&format!("/tabs/{tab_id}/snapshot")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn non_http_navigation_is_rejected() {
    let engine = engine_with_example();
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;

    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/navigate")))
        .json(&json!({ "userId": "u1", "url": "file:///etc/passwd" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("scheme"));
}

#[tokio::test]
async fn evaluate_extended_rate_limit_returns_429_with_header() {
    let engine = engine_with_example();
    let server = start_server(&engine, |config| {
        config.eval_extended_rate_limit_max = 3;
    })
    .await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;

    for _ in 0..3 {
        let resp = client
            .post(server.url(&format!("/tabs/{tab_id}/evaluate-extended")))
            .json(&json!({ "userId": "u1", "expression": "1 + 1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/evaluate-extended")))
        .json(&json!({ "userId": "u1", "expression": "1 + 1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    assert!(resp.headers().contains_key("retry-after"));
    let body: Value = resp.json().await.unwrap();
    assert!(body["retryAfterMs"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn evaluate_timeout_shape() {
    let engine = engine_with_example();
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;
    engine.set_eval_delay(Duration::from_millis(400));

    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/evaluate-extended")))
        .json(&json!({
            "userId": "u1",
            "expression": "(async()=>{await new Promise(r=>setTimeout(r,5000));return 'done';})()",
            "timeout": 100,
        }))
        .send()
        .await
        .unwrap();
    engine.clear_eval_delay();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["errorType"], "timeout");
}

#[tokio::test]
async fn api_key_guards_evaluate_and_cookie_import() {
    let engine = engine_with_example();
    let server = start_server(&engine, |config| {
        config.api_key = Some("sekrit".to_string());
    })
    .await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;

    // No key → 403.
    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/evaluate")))
        .json(&json!({ "userId": "u1", "expression": "1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Wrong key → 403.
    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/evaluate")))
        .bearer_auth("wrong")
        .json(&json!({ "userId": "u1", "expression": "1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Right key → 200.
    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/evaluate")))
        .bearer_auth("sekrit")
        .json(&json!({ "userId": "u1", "expression": "1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Cookie import under the same guard.
    let resp = client
        .post(server.url("/sessions/u1/cookies"))
        .json(&json!({ "cookies": [{ "name": "sid", "value": "x" }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let resp = client
        .post(server.url("/sessions/u1/cookies"))
        .bearer_auth("sekrit")
        .json(&json!({ "cookies": [{ "name": "sid", "value": "x" }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn serialized_ops_observe_navigation_order() {
    let engine = FakeEngine::new();
    engine.add_site(
        "https://a.test/",
        FakeSite::new("A", "- link \"Next\""),
    );
    engine.add_site("https://a.test/pageB", FakeSite::new("B", "- heading \"B\""));
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;
    client
        .post(server.url(&format!("/tabs/{tab_id}/navigate")))
        .json(&json!({ "userId": "u1", "url": "https://a.test/" }))
        .send()
        .await
        .unwrap();

    let snap1 = client.get(server.url(&format!("/tabs/{tab_id}/snapshot?userId=u1")));
    let nav = client
        .post(server.url(&format!("/tabs/{tab_id}/navigate")))
        .json(&json!({ "userId": "u1", "url": "https://a.test/pageB" }));
    let snap2 = client.get(server.url(&format!("/tabs/{tab_id}/snapshot?userId=u1")));

    let (r1, r2, r3) = tokio::join!(snap1.send(), nav.send(), snap2.send());
    assert!(r1.unwrap().status().is_success());
    assert!(r2.unwrap().status().is_success());
    let last: Value = r3.unwrap().json().await.unwrap();
    assert_eq!(last["ok"], true);

    // After all three settle, the tab is on pageB.
    let resp = client
        .get(server.url(&format!("/tabs/{tab_id}/stats?userId=u1")))
        .send()
        .await
        .unwrap();
    let stats: Value = resp.json().await.unwrap();
    assert!(stats["url"].as_str().unwrap().ends_with("/pageB"));
}

#[tokio::test]
async fn downloads_lifecycle_over_http() {
    let engine = FakeEngine::new();
    engine.add_site(
        "https://a.test/",
        FakeSite::new("A", "- button \"Export\"").with_click_download(
            "button",
            "Export",
            "report.csv",
            b"a,b\n".to_vec(),
        ),
    );
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;
    client
        .post(server.url(&format!("/tabs/{tab_id}/navigate")))
        .json(&json!({ "userId": "u1", "url": "https://a.test/" }))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(server.url(&format!("/tabs/{tab_id}/click")))
        .json(&json!({ "userId": "u1", "ref": "e1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let clicked: Value = resp.json().await.unwrap();
    let download_id = clicked["downloads"][0]["id"].as_str().unwrap().to_string();

    // Wait for completion, then fetch the metadata and content.
    let mut info = Value::Null;
    for _ in 0..50 {
        let resp = client
            .get(server.url(&format!("/downloads/{download_id}?userId=u1")))
            .send()
            .await
            .unwrap();
        info = resp.json().await.unwrap();
        if info["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(info["status"], "completed");
    assert_eq!(info["mimeType"], "text/csv");

    let resp = client
        .get(server.url(&format!("/downloads/{download_id}/content?userId=u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/csv"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"a,b\n");

    // Another user cannot see it.
    let resp = client
        .get(server.url(&format!("/downloads/{download_id}?userId=u2")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Delete removes metadata and file.
    let resp = client
        .delete(server.url(&format!("/downloads/{download_id}?userId=u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(server.url(&format!("/downloads/{download_id}?userId=u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn health_reports_pool_state() {
    let engine = engine_with_example();
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["browserConnected"], false);

    create_tab(&client, &server, "u1").await;
    let body: Value = client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["browserConnected"], true);
    assert_eq!(body["poolSize"], 1);
    assert_eq!(body["activeUserIds"][0], "u1");
}

#[tokio::test]
async fn admin_stop_requires_key() {
    let engine = engine_with_example();
    let server = start_server(&engine, |config| {
        config.admin_key = Some("adm".to_string());
    })
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/admin/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .post(server.url("/admin/stop"))
        .header("x-admin-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    // The correct key is not exercised here: it would exit the test process.
}

#[tokio::test]
async fn delete_session_closes_tabs() {
    let engine = engine_with_example();
    let server = start_server(&engine, |_| {}).await;
    let client = reqwest::Client::new();

    let tab_id = create_tab(&client, &server, "u1").await;

    let resp = client
        .delete(server.url("/sessions/u1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(server.url(&format!("/tabs/{tab_id}/snapshot?userId=u1")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn presets_listing_is_names_only() {
    let engine = engine_with_example();
    let tmp_presets = tempfile::tempdir().unwrap();
    std::fs::write(tmp_presets.path().join("news.json"), b"{}").unwrap();
    std::fs::write(tmp_presets.path().join("shopping.json"), b"{}").unwrap();
    std::fs::write(tmp_presets.path().join("notes.txt"), b"x").unwrap();

    let presets_path = tmp_presets.path().to_path_buf();
    let server = start_server(&engine, move |config| {
        config.presets_dir = presets_path;
    })
    .await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(server.url("/presets"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["presets"], json!(["news", "shopping"]));
}
