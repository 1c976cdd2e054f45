use backup_client::api::{no_progress, UploadTarget};
use backup_client::events::SyncEvent;
use backup_client::{ClientError, Config, SyncEngine};
use backup_protocol::wire::{InitBackupRequest, ManifestEntry};
use backup_protocol::hash_bytes;
use backup_receiver::services::version_manifest;
use backup_receiver::store::DirectoryBackend;
use backup_receiver::{create_router, AppConfig, AppState};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

async fn spawn_receiver(dir: &TempDir) -> (String, Arc<AppState>) {
    let state = Arc::new(AppState::open(AppConfig::with_data_root(dir.path())).await.unwrap());
    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn config_for(url: &str) -> Config {
    let mut config = Config::default();
    config.server.url = url.to_string();
    config.server.retry_delay_ms = 10;
    config.backup.client_id = Some("test-client".into());
    config
}

/// Leaves `prefix` as the start of the blob for `content` in the active
/// location, as if an earlier upload had written the wrong bytes.
fn seed_corrupt_prefix(state: &AppState, content: &[u8], prefix: &[u8]) {
    let (roots, active) = state.store.locations();
    std::fs::write(roots[active].join(hash_bytes(content).as_str()), prefix).unwrap();
}

fn write(root: &Path, relpath: &str, content: &[u8]) {
    let path = root.join(relpath);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// relpath → hash of the committed version.
async fn committed_files(state: &AppState, version_path: &str) -> BTreeMap<String, String> {
    let dir = state.config.data_root.join(version_path);
    let manifest = version_manifest::read(&dir).await.unwrap().unwrap();
    manifest
        .files
        .into_iter()
        .map(|(relpath, entry)| (relpath, entry.sha.to_string()))
        .collect()
}

#[tokio::test]
async fn test_two_runs_of_same_tree() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;
    write(source.path(), "a.txt", b"hello");
    write(source.path(), "b.txt", b"world");

    let engine = SyncEngine::new(&config_for(&url)).unwrap();
    let mut events = engine.events().subscribe();

    let first = engine.run(source.path()).await.unwrap();
    assert_eq!(first.day_index, 1);
    assert_eq!(first.stats.uploaded_files, 2);
    assert_eq!(first.stats.uploaded_bytes, 10);
    assert!(first.failed_uploads.is_empty());

    let hashes = vec![hash_bytes(b"hello"), hash_bytes(b"world")];
    let present = engine.client().has_hashes(&hashes).await.unwrap();
    assert_eq!(present.len(), 2);
    assert!(present.values().all(|p| *p));

    let second = engine.run(source.path()).await.unwrap();
    assert_eq!(second.day_index, 2);
    assert_eq!(second.date, first.date);
    assert_eq!(second.stats.uploaded_files, 0);
    assert_eq!(second.stats.uploaded_bytes, 0);
    assert_ne!(second.version_id, first.version_id);

    let first_files = committed_files(&state, &first.version_path).await;
    let second_files = committed_files(&state, &second.version_path).await;
    assert_eq!(first_files.len(), 2);
    assert_eq!(first_files["a.txt"], hash_bytes(b"hello").to_string());
    assert_eq!(first_files, second_files);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(SyncEvent::RunStarted { .. })));
    let uploaded = seen
        .iter()
        .filter(|e| matches!(e, SyncEvent::FileUploaded { .. }))
        .count();
    assert_eq!(uploaded, 2);
    let completed = seen
        .iter()
        .filter(|e| matches!(e, SyncEvent::RunCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_excluded_files_never_reach_the_receiver() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;
    write(source.path(), "src/app.js", b"console.log(1)");
    write(source.path(), "node_modules/left-pad/index.js", b"module.exports = 1");
    write(source.path(), "web/node_modules/x/y.js", b"nested dependency");

    let engine = SyncEngine::new(&config_for(&url)).unwrap();
    let report = engine.run(source.path()).await.unwrap();

    let files = committed_files(&state, &report.version_path).await;
    assert_eq!(files.keys().collect::<Vec<_>>(), vec!["src/app.js"]);
    assert_eq!(report.stats.total_files, 1);

    let excluded = vec![hash_bytes(b"module.exports = 1"), hash_bytes(b"nested dependency")];
    let present = engine.client().has_hashes(&excluded).await.unwrap();
    assert!(present.values().all(|p| !*p));
}

#[tokio::test]
async fn test_interrupted_upload_is_resumed() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;

    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let sha = hash_bytes(&content);
    write(source.path(), "big.bin", &content);
    write(scratch.path(), "head.bin", &content[..100_000]);

    let engine = SyncEngine::new(&config_for(&url)).unwrap();
    let client = engine.client();

    // An earlier run that stopped after the first 100 000 bytes
    let init = client
        .init(&InitBackupRequest {
            date: "2024-05-01".into(),
            client_id: "earlier-run".into(),
            manifest: vec![ManifestEntry {
                relpath: "big.bin".into(),
                size: content.len() as u64,
                mtime: 0,
                sha: sha.clone(),
            }],
        })
        .await
        .unwrap();
    let target = UploadTarget {
        sha: &sha,
        relpath: "big.bin",
        version_id: &init.version_id,
    };
    let partial = client
        .upload(&target, &scratch.path().join("head.bin"), 0, content.len() as u64, no_progress())
        .await;
    assert!(matches!(partial, Err(ClientError::OffsetGap { bytes: 100_000 })));
    assert_eq!(client.file_offset(&sha, content.len() as u64).await.unwrap().bytes, 100_000);

    let report = engine.run(source.path()).await.unwrap();
    assert_eq!(report.stats.uploaded_files, 1);
    assert_eq!(report.stats.uploaded_bytes, 200_000);

    let (location, size) = state.store.locate(&sha).unwrap().unwrap();
    assert_eq!(size, content.len() as u64);
    assert_eq!(std::fs::read(location.join(sha.as_str())).unwrap(), content);
    assert_eq!(hash_bytes(&std::fs::read(source.path().join("big.bin")).unwrap()), sha);
}

#[tokio::test]
async fn test_partial_upload_left_in_old_location_is_restarted() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;

    let content: Vec<u8> = (0..150_000u32).map(|i| (i % 241) as u8).collect();
    let sha = hash_bytes(&content);
    write(source.path(), "big.bin", &content);
    write(scratch.path(), "head.bin", &content[..40_000]);

    let engine = SyncEngine::new(&config_for(&url)).unwrap();
    let client = engine.client();
    let init = client
        .init(&InitBackupRequest {
            date: "2024-05-01".into(),
            client_id: "earlier-run".into(),
            manifest: vec![ManifestEntry {
                relpath: "big.bin".into(),
                size: content.len() as u64,
                mtime: 0,
                sha: sha.clone(),
            }],
        })
        .await
        .unwrap();
    let target = UploadTarget {
        sha: &sha,
        relpath: "big.bin",
        version_id: &init.version_id,
    };
    let partial = client
        .upload(&target, &scratch.path().join("head.bin"), 0, content.len() as u64, no_progress())
        .await;
    assert!(matches!(partial, Err(ClientError::OffsetGap { bytes: 40_000 })));

    let second = data.path().join("second-disk");
    let backend = DirectoryBackend::open(&second).unwrap();
    assert!(state.store.add_location(Arc::new(backend)));
    state.store.set_active(1).unwrap();

    let offset = client.file_offset(&sha, content.len() as u64).await.unwrap();
    assert_eq!(offset.bytes, 0);

    let report = engine.run(source.path()).await.unwrap();
    assert_eq!(report.stats.uploaded_files, 1);
    assert_eq!(report.stats.uploaded_bytes, content.len() as u64);
    assert!(report.failed_uploads.is_empty());
    assert_eq!(std::fs::read(second.join(sha.as_str())).unwrap(), content);

    let files = committed_files(&state, &report.version_path).await;
    assert_eq!(files["big.bin"], sha.to_string());
}

#[tokio::test]
async fn test_failed_upload_is_left_out_of_the_commit() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;
    write(source.path(), "good.txt", b"uploads fine");
    write(source.path(), "bad.txt", b"ends up with a mismatched blob");
    seed_corrupt_prefix(&state, b"ends up with a mismatched blob", b"XXXX");

    let mut config = config_for(&url);
    config.server.retry_attempts = 1;
    let engine = SyncEngine::new(&config).unwrap();
    let mut events = engine.events().subscribe();
    let report = engine.run(source.path()).await.unwrap();

    assert_eq!(report.failed_uploads, vec!["bad.txt".to_string()]);
    let files = committed_files(&state, &report.version_path).await;
    assert_eq!(files.keys().collect::<Vec<_>>(), vec!["good.txt"]);

    let dir = state.config.data_root.join(&report.version_path);
    let manifest = version_manifest::read(&dir).await.unwrap().unwrap();
    assert_eq!(manifest.metadata.extra["failedUploads"], 1);

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::UploadFailed { relpath, .. } = event {
            failed.push(relpath);
        }
    }
    assert_eq!(failed, vec!["bad.txt".to_string()]);
}

#[tokio::test]
async fn test_run_fails_when_every_upload_fails() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;
    write(source.path(), "only.txt", b"the only file in the tree");
    seed_corrupt_prefix(&state, b"the only file in the tree", b"nope");

    let mut config = config_for(&url);
    config.server.retry_attempts = 1;
    let engine = SyncEngine::new(&config).unwrap();
    let err = engine.run(source.path()).await.unwrap_err();
    assert!(matches!(err, ClientError::UploadsFailed(1)));
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_duplicate_content_uploaded_once() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let (url, state) = spawn_receiver(&data).await;
    write(source.path(), "one/copy.txt", b"same bytes");
    write(source.path(), "two/copy.txt", b"same bytes");
    write(source.path(), "empty.txt", b"");

    let mut config = config_for(&url);
    config.backup.parallel_uploads = 4;
    let engine = SyncEngine::new(&config).unwrap();
    let report = engine.run(source.path()).await.unwrap();

    assert_eq!(report.stats.uploaded_files, 2);
    let files = committed_files(&state, &report.version_path).await;
    assert_eq!(files.len(), 3);
    assert_eq!(files["one/copy.txt"], files["two/copy.txt"]);
    assert_eq!(files["empty.txt"], hash_bytes(b"").to_string());
}

#[tokio::test]
async fn test_empty_tree_fails_the_run() {
    let data = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    let (url, _state) = spawn_receiver(&data).await;
    write(source.path(), "node_modules/only.js", b"ignored");

    let engine = SyncEngine::new(&config_for(&url)).unwrap();
    let mut events = engine.events().subscribe();
    let err = engine.run(source.path()).await.unwrap_err();
    assert!(matches!(err, ClientError::NothingToBackUp(_)));

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert!(matches!(last, Some(SyncEvent::RunFailed { .. })));
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_unreachable_receiver_fails_cleanly() {
    let source = TempDir::new().unwrap();
    write(source.path(), "a.txt", b"hello");

    // Nothing listens on this port once the listener is dropped
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let engine = SyncEngine::new(&config_for(&url)).unwrap();
    let err = engine.run(source.path()).await.unwrap_err();
    assert!(matches!(err, ClientError::Http(_)));
}
