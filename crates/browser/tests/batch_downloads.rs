#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Batch downloader behavior through the core, on the fake engine.

use std::{sync::Arc, time::Duration};

use {
    camofox_browser::{Core, DownloadStatus, resources::BatchItem, resources::BatchOptions},
    camofox_config::Config,
    camofox_engine::{FetchedBody, fake::{FakeEngine, FakeSite}},
};

async fn core_with(
    engine: &FakeEngine,
    tweak: impl FnOnce(&mut Config),
) -> (tempfile::TempDir, Arc<Core>) {
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
    (tmp, core)
}

async fn tab_on_site(core: &Arc<Core>, engine: &FakeEngine) -> String {
    engine.add_site("https://a.test/", FakeSite::new("A", "- heading \"A\""));
    let created = core.create_tab("u1", "s", None).await.unwrap();
    let tab_id = created["tabId"].as_str().unwrap().to_string();
    core.navigate("u1", &tab_id, "https://a.test/").await.unwrap();
    tab_id
}

fn item(url: &str) -> BatchItem {
    BatchItem {
        url: url.to_string(),
        filename: None,
    }
}

#[tokio::test]
async fn http_items_download_through_the_context() {
    let engine = FakeEngine::new();
    engine.set_fetch_body(
        "https://a.test/one.png",
        FetchedBody {
            status: 200,
            content_type: Some("image/png".into()),
            bytes: vec![1, 2, 3],
        },
    );
    let (_tmp, core) = core_with(&engine, |_| {}).await;
    let tab_id = tab_on_site(&core, &engine).await;

    let result = core
        .batch_download(
            "u1",
            &tab_id,
            vec![item("https://a.test/one.png")],
            BatchOptions::default(),
        )
        .await
        .unwrap();

    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "completed");

    let id = results[0]["downloadId"].as_str().unwrap();
    let info = core.downloads.get(id, "u1").unwrap();
    assert_eq!(info.status, DownloadStatus::Completed);
    assert_eq!(info.size, Some(3));
    assert_eq!(info.suggested_filename, "one.png");
    assert_eq!(std::fs::read(core.downloads.file_path(&info)).unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn data_uris_decode_and_unfetchable_urls_fail_individually() {
    let engine = FakeEngine::new();
    let (_tmp, core) = core_with(&engine, |_| {}).await;
    let tab_id = tab_on_site(&core, &engine).await;

    let result = core
        .batch_download(
            "u1",
            &tab_id,
            vec![
                BatchItem {
                    url: "data:text/plain;base64,aGVsbG8=".into(),
                    filename: Some("hello.txt".into()),
                },
                item("https://a.test/missing.bin"),
            ],
            BatchOptions::default(),
        )
        .await
        .unwrap();

    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);

    let ok = results.iter().find(|r| r["status"] == "completed").unwrap();
    let id = ok["downloadId"].as_str().unwrap();
    let info = core.downloads.get(id, "u1").unwrap();
    assert_eq!(info.suggested_filename, "hello.txt");
    assert_eq!(
        std::fs::read(core.downloads.file_path(&info)).unwrap(),
        b"hello"
    );

    let failed = results.iter().find(|r| r["status"] == "failed").unwrap();
    assert!(failed["error"].as_str().unwrap().contains("missing.bin"));
}

#[tokio::test]
async fn blob_urls_are_refused_unless_resolution_is_enabled() {
    let engine = FakeEngine::new();
    let (_tmp, core) = core_with(&engine, |_| {}).await;
    let tab_id = tab_on_site(&core, &engine).await;

    let result = core
        .batch_download(
            "u1",
            &tab_id,
            vec![item("blob:https://a.test/abc-123")],
            BatchOptions {
                resolve_blobs: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let results = result["results"].as_array().unwrap();
    assert_eq!(results[0]["status"], "failed");
    assert!(results[0]["error"].as_str().unwrap().contains("blob"));
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let engine = FakeEngine::new();
    engine.set_fetch_body(
        "https://a.test/huge.bin",
        FetchedBody {
            status: 200,
            content_type: None,
            bytes: vec![0u8; 2 * 1024 * 1024],
        },
    );
    let (_tmp, core) = core_with(&engine, |config| {
        config.max_download_size_mb = 1;
    })
    .await;
    let tab_id = tab_on_site(&core, &engine).await;

    let result = core
        .batch_download(
            "u1",
            &tab_id,
            vec![item("https://a.test/huge.bin")],
            BatchOptions::default(),
        )
        .await
        .unwrap();

    let results = result["results"].as_array().unwrap();
    assert_eq!(results[0]["status"], "failed");
    assert!(results[0]["error"].as_str().unwrap().contains("exceeds"));

    // The entry records the failure; no file is left behind.
    let id = results[0]["downloadId"].as_str().unwrap();
    let info = core.downloads.get(id, "u1").unwrap();
    assert_eq!(info.status, DownloadStatus::Failed);
    assert!(!core.downloads.file_path(&info).exists());
}

#[tokio::test]
async fn candidate_cap_truncates_the_batch() {
    let engine = FakeEngine::new();
    for i in 0..4 {
        engine.set_fetch_body(
            format!("https://a.test/f{i}.bin"),
            FetchedBody {
                status: 200,
                content_type: None,
                bytes: vec![i as u8],
            },
        );
    }
    let (_tmp, core) = core_with(&engine, |config| {
        config.max_batch_files = 2;
    })
    .await;
    let tab_id = tab_on_site(&core, &engine).await;

    let items = (0..4).map(|i| item(&format!("https://a.test/f{i}.bin"))).collect();
    let result = core
        .batch_download("u1", &tab_id, items, BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(result["results"].as_array().unwrap().len(), 2);
    assert_eq!(core.downloads.count_for_user("u1"), 2);
}

#[tokio::test]
async fn explicit_max_files_overrides_the_config_default() {
    let engine = FakeEngine::new();
    for i in 0..3 {
        engine.set_fetch_body(
            format!("https://a.test/g{i}.bin"),
            FetchedBody {
                status: 200,
                content_type: None,
                bytes: vec![i as u8],
            },
        );
    }
    let (_tmp, core) = core_with(&engine, |config| {
        config.max_batch_files = 50;
    })
    .await;
    let tab_id = tab_on_site(&core, &engine).await;

    let items = (0..3).map(|i| item(&format!("https://a.test/g{i}.bin"))).collect();
    let result = core
        .batch_download(
            "u1",
            &tab_id,
            items,
            BatchOptions {
                max_files: Some(1),
                resolve_blobs: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(result["results"].as_array().unwrap().len(), 1);
}
