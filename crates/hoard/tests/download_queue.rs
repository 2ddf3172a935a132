mod support;

use packrat_core::{AssetIdentity, DownloadEvent, DownloadFailure};
use packrat_hoard::{DiskCache, DownloadQueue, DownloadSettings};
use std::sync::Arc;
use std::time::Duration;
use support::{init_logging, next_outcome, Reply, ScriptedHttp};
use tempfile::TempDir;

fn queue(dir: &TempDir, http: Arc<ScriptedHttp>, concurrency: usize) -> DownloadQueue {
    init_logging();
    let cache = Arc::new(DiskCache::open(dir.path().join("cache"), 1 << 20).unwrap());
    DownloadQueue::new(
        http,
        cache,
        DownloadSettings {
            concurrency,
            timeout: Duration::from_secs(5),
            max_redirects: 5,
            max_body_bytes: 64 * 1024,
        },
    )
}

fn model(asset: &str) -> AssetIdentity {
    AssetIdentity::model("pokemon", asset, "default")
}

fn url(asset: &str) -> String {
    format!("https://cdn.example/{}.glb", asset)
}

#[async_std::test]
async fn queued_downloads_start_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    for asset in ["001", "002", "003"] {
        http.reply(&url(asset), Reply::Body(asset.as_bytes().to_vec()));
    }
    let gate = http.hold(&url("001"));
    let queue = queue(&dir, http.clone(), 1);
    let mut events = queue.subscribe();

    queue.request(&model("001"), &url("001"), 0, None);
    queue.request(&model("002"), &url("002"), 5, None);
    queue.request(&model("003"), &url("003"), 1, None);
    assert_eq!(queue.active_len(), 1);
    assert_eq!(queue.queued_len(), 2);

    gate.send(()).unwrap();
    for _ in 0..3 {
        assert!(matches!(next_outcome(&mut events).await, DownloadEvent::Completed { .. }));
    }
    assert_eq!(http.calls(), vec![url("001"), url("003"), url("002")]);
}

#[async_std::test]
async fn duplicate_requests_share_one_transfer() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    http.reply(&url("025"), Reply::Body(b"pikachu".to_vec()));
    let gate = http.hold(&url("025"));
    let queue = queue(&dir, http.clone(), 2);
    let mut events = queue.subscribe();

    queue.request(&model("025"), &url("025"), 3, None);
    queue.request(&model("025"), &url("025"), 0, None);
    assert!(queue.is_pending(&DownloadQueue::key_for(&model("025"))));
    gate.send(()).unwrap();

    let DownloadEvent::Completed { path, .. } = next_outcome(&mut events).await else {
        panic!("download should complete");
    };
    assert_eq!(std::fs::read(&path).unwrap(), b"pikachu");

    // Already on disk: answered without another GET.
    queue.request(&model("025"), &url("025"), 0, None);
    assert!(matches!(next_outcome(&mut events).await, DownloadEvent::Completed { .. }));
    assert_eq!(http.calls_to(&url("025")), 1);
}

#[async_std::test]
async fn failures_are_sticky_until_cleared() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    http.reply(&url("404"), Reply::Status(404));
    let queue = queue(&dir, http.clone(), 2);
    let mut events = queue.subscribe();
    let key = DownloadQueue::key_for(&model("404"));

    queue.request(&model("404"), &url("404"), 0, None);
    let DownloadEvent::Failed { failure, .. } = next_outcome(&mut events).await else {
        panic!("404 must fail");
    };
    assert_eq!(failure, DownloadFailure::HttpStatus(404));
    assert_eq!(queue.failure(&key), Some(DownloadFailure::HttpStatus(404)));

    queue.request(&model("404"), &url("404"), 0, None);
    assert!(matches!(next_outcome(&mut events).await, DownloadEvent::Failed { .. }));
    assert_eq!(http.calls_to(&url("404")), 1);

    assert!(queue.clear_failure(&key));
    http.reply(&url("404"), Reply::Body(b"back".to_vec()));
    queue.request(&model("404"), &url("404"), 0, None);
    assert!(matches!(next_outcome(&mut events).await, DownloadEvent::Completed { .. }));
    assert_eq!(http.calls_to(&url("404")), 2);
}

#[async_std::test]
async fn relative_redirects_are_followed() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    http.reply(&url("old"), Reply::Redirect("/mirror/new.glb".to_string()));
    http.reply("https://cdn.example/mirror/new.glb", Reply::Body(b"moved".to_vec()));
    let queue = queue(&dir, http.clone(), 1);
    let mut events = queue.subscribe();

    queue.request(&model("133"), &url("old"), 0, None);
    let DownloadEvent::Completed { path, .. } = next_outcome(&mut events).await else {
        panic!("redirect should be followed");
    };
    assert_eq!(std::fs::read(path).unwrap(), b"moved");
}

#[async_std::test]
async fn redirect_loops_are_cut_off() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    http.reply(&url("loop"), Reply::Redirect(url("loop")));
    let queue = queue(&dir, http.clone(), 1);
    let mut events = queue.subscribe();

    queue.request(&model("loop"), &url("loop"), 0, None);
    let DownloadEvent::Failed { failure, .. } = next_outcome(&mut events).await else {
        panic!("loop must fail");
    };
    assert_eq!(failure, DownloadFailure::TooManyRedirects);
    assert_eq!(http.calls_to(&url("loop")), 6);
}

#[async_std::test]
async fn override_destination_bypasses_the_cache() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    http.reply(&url("bundle"), Reply::Body(b"zip".to_vec()));
    let cache = Arc::new(DiskCache::open(dir.path().join("cache"), 1 << 20).unwrap());
    let queue = DownloadQueue::new(
        http,
        cache.clone(),
        DownloadSettings {
            concurrency: 1,
            timeout: Duration::from_secs(5),
            max_redirects: 5,
            max_body_bytes: 1024,
        },
    );
    let mut events = queue.subscribe();
    let dest = dir.path().join("installs").join("bundle.zip");

    queue.request(&model("bundle"), &url("bundle"), 0, Some(dest.clone()));
    let DownloadEvent::Completed { key, path, .. } = next_outcome(&mut events).await else {
        panic!("install should complete");
    };
    assert_eq!(key, DownloadQueue::key_for_path(&dest));
    assert_eq!(path, dest);
    assert_eq!(std::fs::read(&dest).unwrap(), b"zip");
    assert!(cache.is_empty());
}

#[async_std::test]
async fn oversized_bodies_leave_no_partial_file() {
    let dir = TempDir::new().unwrap();
    let http = ScriptedHttp::new();
    http.reply(&url("huge"), Reply::Body(vec![7u8; 100 * 1024]));
    let queue = queue(&dir, http, 1);
    let mut events = queue.subscribe();
    let dest = dir.path().join("huge.glb");

    queue.request_file(&url("huge"), dest.clone(), 0);
    let DownloadEvent::Failed { failure, .. } = next_outcome(&mut events).await else {
        panic!("body over the limit must fail");
    };
    assert_eq!(failure, DownloadFailure::BodyTooLarge);
    assert!(!dest.exists());
    assert!(!dir.path().join("huge.glb.part").exists());
}
