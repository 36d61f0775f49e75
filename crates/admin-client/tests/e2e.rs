//! End-to-end tests for admin-client against a real admin-daemon.
//!
//! Each test starts a host on a random loopback port serving `<temp>/host`
//! and mirrors it into `<temp>/peer/<context>`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use admin_client::{Client, ClientError, Identity};
use admin_core::auth::Ed25519Signer;
use admin_daemon::{Config, ContextConfig, Host, LogForwarder, server};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

struct Fixture {
    temp: TempDir,
    host: Arc<Host>,
    addr: SocketAddr,
    signer: Ed25519Signer,
}

impl Fixture {
    /// Start a host serving `web` with `a.txt` and `b.txt`.
    async fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let signer = Ed25519Signer::generate();

        let content = temp.path().join("host");
        std::fs::create_dir_all(&content).unwrap();
        std::fs::write(content.join("a.txt"), "hello").unwrap();
        std::fs::write(content.join("b.txt"), "bye").unwrap();

        let users = json!([{
            "username": "ann",
            "emails": ["ann@example.com"],
            "publicKeys": [{"name": "laptop", "publicKey": signer.public_key_base64()}],
        }]);
        std::fs::write(temp.path().join("users.json"), users.to_string()).unwrap();

        let config = Config {
            listen: "127.0.0.1:0".into(),
            quiescence_millis: 50,
            contexts: vec![ContextConfig {
                id: "web".into(),
                path: content,
            }],
            ..Default::default()
        };
        let host = Arc::new(
            Host::from_config(&config, temp.path(), LogForwarder::new())
                .await
                .unwrap(),
        );
        let listener = server::bind(&config.listen).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::run(Arc::clone(&host), listener));

        Self {
            temp,
            host,
            addr,
            signer,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn identity(&self) -> Identity {
        Identity {
            username: Some("ann".into()),
            email: None,
            signer: Ed25519Signer::from_base64(&self.signer.seed_base64()).unwrap(),
        }
    }

    fn host_dir(&self) -> PathBuf {
        self.temp.path().join("host")
    }

    fn peer_dir(&self) -> PathBuf {
        self.temp.path().join("peer")
    }

    /// Connect, authenticate and mirror.
    async fn synced_client(&self) -> Client {
        let mut client = Client::connect(&self.url()).await.unwrap();
        client.authenticate(&self.identity()).await.unwrap();
        client.start_sync(&self.peer_dir()).await.unwrap();
        client
    }
}

/// Poll until `condition` holds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "Timeout waiting for {}", what);
}

fn read(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_authenticate() {
    let fixture = Fixture::start().await;

    let mut client = Client::connect(&fixture.url()).await.unwrap();
    let profile = client.authenticate(&fixture.identity()).await.unwrap();

    assert_eq!(profile.username, "ann");
    assert!(fixture.host.sessions().is_authenticated(client.token()));
}

#[tokio::test]
async fn test_wrong_key_is_unauthorized() {
    let fixture = Fixture::start().await;
    let stranger = Identity {
        username: Some("ann".into()),
        email: None,
        signer: Ed25519Signer::generate(),
    };

    let mut client = Client::connect(&fixture.url()).await.unwrap();
    let result = client.authenticate(&stranger).await;

    assert!(matches!(result, Err(ClientError::Unauthorized)));
    assert!(!fixture.host.sessions().is_authenticated(client.token()));
}

#[tokio::test]
async fn test_approving_another_session() {
    let fixture = Fixture::start().await;

    let mut approver = Client::connect(&fixture.url()).await.unwrap();
    approver.authenticate(&fixture.identity()).await.unwrap();
    let mut pending = Client::connect(&fixture.url()).await.unwrap();
    let token = pending.token().to_string();

    let approved = approver.approve(&fixture.identity(), &token).await.unwrap();
    let profile = timeout(Duration::from_secs(5), pending.wait_for_approval())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(approved.token, token);
    assert_eq!(approved.user.username, "ann");
    assert_eq!(profile.username, "ann");
    assert!(fixture.host.sessions().is_authenticated(&token));
}

#[tokio::test]
async fn test_approving_unknown_token_fails() {
    let fixture = Fixture::start().await;

    let mut approver = Client::connect(&fixture.url()).await.unwrap();
    approver.authenticate(&fixture.identity()).await.unwrap();

    let result = approver.approve(&fixture.identity(), "T").await;
    assert!(matches!(result, Err(ClientError::Unauthorized)));
}

// ============================================================================
// Synchronization
// ============================================================================

#[tokio::test]
async fn test_bulk_download_then_nothing_to_do() {
    let fixture = Fixture::start().await;

    let mut client = Client::connect(&fixture.url()).await.unwrap();
    client.authenticate(&fixture.identity()).await.unwrap();
    let reports = client.start_sync(&fixture.peer_dir()).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "web");
    assert_eq!(reports[0].1.downloaded, vec!["/a.txt", "/b.txt"]);
    assert_eq!(read(&fixture.peer_dir().join("web/a.txt")).as_deref(), Some("hello"));
    client.stop().await;

    let mut again = Client::connect(&fixture.url()).await.unwrap();
    again.authenticate(&fixture.identity()).await.unwrap();
    let reports = again.start_sync(&fixture.peer_dir()).await.unwrap();
    assert_eq!(reports[0].1.transfers(), 0);
}

#[tokio::test]
async fn test_bulk_removes_local_extras() {
    let fixture = Fixture::start().await;
    let local = fixture.peer_dir().join("web");
    std::fs::create_dir_all(local.join("old/deeper")).unwrap();
    std::fs::write(local.join("old/deeper/stale.txt"), "stale").unwrap();

    let mut client = Client::connect(&fixture.url()).await.unwrap();
    client.authenticate(&fixture.identity()).await.unwrap();
    let reports = client.start_sync(&fixture.peer_dir()).await.unwrap();

    assert_eq!(reports[0].1.deleted_files, vec!["/old/deeper/stale.txt"]);
    assert!(!local.join("old").exists());
    assert!(fixture.host_dir().join("a.txt").exists());
}

#[tokio::test]
async fn test_local_delete_is_sent_once() {
    let fixture = Fixture::start().await;
    let client = fixture.synced_client().await;
    let running = tokio::spawn(client.run());

    let local = fixture.peer_dir().join("web/b.txt");
    std::fs::remove_file(&local).unwrap();

    let hosted = fixture.host_dir().join("b.txt");
    eventually("host deletion", || !hosted.exists()).await;
    sleep(Duration::from_millis(500)).await;
    assert!(!local.exists(), "deleted file came back");

    running.abort();
}

#[tokio::test]
async fn test_local_write_is_uploaded() {
    let fixture = Fixture::start().await;
    let client = fixture.synced_client().await;
    let running = tokio::spawn(client.run());

    std::fs::create_dir_all(fixture.peer_dir().join("web/notes")).unwrap();
    std::fs::write(fixture.peer_dir().join("web/notes/c.txt"), "from peer").unwrap();

    let hosted = fixture.host_dir().join("notes/c.txt");
    eventually("upload", || read(&hosted).as_deref() == Some("from peer")).await;

    running.abort();
}

#[tokio::test]
async fn test_host_changes_are_mirrored() {
    let fixture = Fixture::start().await;
    let client = fixture.synced_client().await;
    let running = tokio::spawn(client.run());

    std::fs::write(fixture.host_dir().join("new.txt"), "fresh").unwrap();
    std::fs::remove_file(fixture.host_dir().join("a.txt")).unwrap();

    let local = fixture.peer_dir().join("web");
    eventually("download", || read(&local.join("new.txt")).as_deref() == Some("fresh")).await;
    eventually("local removal", || !local.join("a.txt").exists()).await;

    // The mirrored write must not bounce back as an upload
    sleep(Duration::from_millis(500)).await;
    assert_eq!(read(&fixture.host_dir().join("new.txt")).as_deref(), Some("fresh"));
    assert!(!fixture.host_dir().join("a.txt").exists());

    running.abort();
}

#[tokio::test]
async fn test_closed_session_ends_run() {
    let fixture = Fixture::start().await;
    let client = fixture.synced_client().await;
    let token = client.token().to_string();
    let running = tokio::spawn(client.run());

    assert!(fixture.host.sessions().destroy(&token));

    let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(result.is_ok());
}
