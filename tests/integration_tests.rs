//! End-to-end mesh tests.
//!
//! Every node bootstraps through a real WebSocket hub on a loopback port;
//! peer links run in-process. Covers meshing, worker balancing, worker
//! departure, bootstrap retry and content upload and download.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use weft_core::{PeerId, Role, RootHash};
use weft_files::{ContentStore, MemoryStore};
use weft_integration_tests::fixtures::{Member, MeshFixture};
use weft_integration_tests::test_helpers::wait_for;
use weft_mesh::{MemoryConnector, MeshNode, NodeEvent, bootstrap};

/// Wait until `member` reports a direct link to `peer`
async fn linked(member: &mut Member, peer: PeerId) -> bool {
    wait_for(&mut member.events, |e| {
        matches!(e, NodeEvent::PeerConnected { peer: p } if *p == peer).then_some(())
    })
    .await
    .is_some()
}

/// The non-hub peer `member` was paired with
async fn paired_worker(member: &mut Member, hub: PeerId) -> Option<PeerId> {
    wait_for(&mut member.events, |e| match e {
        NodeEvent::PeerConnected { peer } if *peer != hub => Some(*peer),
        _ => None,
    })
    .await
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

// ============================================================================
// Meshing
// ============================================================================

#[tokio::test]
async fn test_worker_and_client_meshed_over_websocket_hub() {
    let mesh = MeshFixture::start().await.unwrap();
    let mut worker = mesh.join(Role::Worker).await.unwrap();
    let mut client = mesh.join(Role::Client).await.unwrap();

    assert!(linked(&mut client, worker.id).await);
    assert!(linked(&mut worker, client.id).await);

    let hub = mesh.hub.snapshot().await.unwrap().hub.unwrap();
    assert_eq!(hub.workers, vec![worker.id]);
    assert_eq!(hub.clients, vec![client.id]);
    assert!(hub.queued.is_empty());
    assert!(hub.unmeshed.is_empty());

    let snap = client.handle.snapshot().await.unwrap();
    assert_eq!(snap.hub_peer, Some(mesh.hub_id));
    assert!(snap.connected.contains(&worker.id));
    assert!(snap.signaling.is_empty());

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_clients_balanced_across_workers() {
    let mesh = MeshFixture::start().await.unwrap();
    let first_worker = mesh.join(Role::Worker).await.unwrap();
    let second_worker = mesh.join(Role::Worker).await.unwrap();

    let mut first = mesh.join(Role::Client).await.unwrap();
    let busy = paired_worker(&mut first, mesh.hub_id).await.unwrap();
    assert!(busy == first_worker.id || busy == second_worker.id);

    // let the busy worker report its new connection count
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut second = mesh.join(Role::Client).await.unwrap();
    let idle = paired_worker(&mut second, mesh.hub_id).await.unwrap();
    assert_ne!(idle, busy);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_worker_departure_parks_new_clients() {
    let mesh = MeshFixture::start().await.unwrap();
    let mut hub_events = mesh.hub.subscribe();
    let worker = mesh.join(Role::Worker).await.unwrap();

    worker.handle.shutdown().await.unwrap();
    let gone = wait_for(&mut hub_events, |e| {
        matches!(e, NodeEvent::PeerClosed { peer } if *peer == worker.id).then_some(())
    })
    .await;
    assert!(gone.is_some());

    let mut client = mesh.join(Role::Client).await.unwrap();
    let hub = mesh.hub.snapshot().await.unwrap().hub.unwrap();
    assert!(hub.workers.is_empty());
    assert_eq!(hub.unmeshed, vec![client.id]);

    // a new worker picks up the parked client
    let replacement = mesh.join(Role::Worker).await.unwrap();
    assert!(linked(&mut client, replacement.id).await);
    let hub = mesh.hub.snapshot().await.unwrap().hub.unwrap();
    assert!(hub.unmeshed.is_empty());

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_retries_until_hub_starts() {
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = reserved.local_addr().unwrap();
    drop(reserved);

    let connector = MemoryConnector::new();
    let node = MeshNode::new(
        Role::Worker,
        MeshFixture::node_config(),
        Arc::new(connector.clone()),
        Arc::new(MemoryStore::new()),
    );
    let (handle, _) = node.spawn();

    let mut config = MeshFixture::bootstrap_config(&format!("ws://{addr}"), true);
    config.max_attempts = 20;
    config.backoff_base = Duration::from_millis(100);
    config.backoff_step = Duration::ZERO;
    let joining = tokio::spawn({
        let handle = handle.clone();
        async move { bootstrap(&config, &handle).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mesh = MeshFixture::start_on(addr, connector).await.unwrap();

    let hub = joining.await.unwrap().unwrap();
    assert_eq!(hub, mesh.hub_id);
    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.connected, vec![mesh.hub_id]);

    handle.shutdown().await.unwrap();
    mesh.shutdown().await;
}

// ============================================================================
// Content transfer
// ============================================================================

#[tokio::test]
async fn test_upload_then_fetch_from_second_client() {
    let mesh = MeshFixture::start().await.unwrap();
    let mut worker = mesh.join(Role::Worker).await.unwrap();
    let mut sender = mesh.join(Role::Client).await.unwrap();
    assert!(linked(&mut sender, worker.id).await);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("survey.bin");
    let data = content(70_000);
    std::fs::write(&path, &data).unwrap();

    let root = sender.handle.upload(worker.id, &path).await.unwrap();

    // 70_000 bytes in 16 KiB pieces
    let acked = wait_for(&mut sender.events, |e| match e {
        NodeEvent::UploadProgress {
            root: r,
            acked,
            total,
            ..
        } if *r == root && acked == total => Some(*total),
        _ => None,
    })
    .await;
    assert_eq!(acked, Some(5));

    let imported = wait_for(&mut worker.events, |e| match e {
        NodeEvent::ImportComplete { root: r, name, size } if *r == root => {
            Some((name.clone(), *size))
        }
        _ => None,
    })
    .await;
    assert_eq!(imported, Some(("survey.bin".to_string(), 70_000)));
    assert!(worker.store.contains(&root).await.unwrap());

    // offering it again is declined
    sender.handle.upload(worker.id, &path).await.unwrap();
    let declined = wait_for(&mut sender.events, |e| {
        matches!(e, NodeEvent::UploadRejected { root: r, .. } if *r == root).then_some(())
    })
    .await;
    assert!(declined.is_some());

    let mut fetcher = mesh.join(Role::Client).await.unwrap();
    assert!(linked(&mut fetcher, worker.id).await);
    fetcher.handle.download(worker.id, root).await.unwrap();
    let fetched = wait_for(&mut fetcher.events, |e| match e {
        NodeEvent::ImportComplete { root: r, name, size } if *r == root => {
            Some((name.clone(), *size))
        }
        _ => None,
    })
    .await;
    assert_eq!(fetched, Some(("survey.bin".to_string(), 70_000)));
    let stored = fetcher.store.get(&root).await.unwrap().unwrap();
    assert_eq!(&stored[..], &data[..]);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_fetch_unknown_root_reports_missing() {
    let mesh = MeshFixture::start().await.unwrap();
    let worker = mesh.join(Role::Worker).await.unwrap();
    let mut client = mesh.join(Role::Client).await.unwrap();
    assert!(linked(&mut client, worker.id).await);

    let unknown: RootHash = [0xAB; 32];
    client.handle.download(worker.id, unknown).await.unwrap();
    let missing = wait_for(&mut client.events, |e| match e {
        NodeEvent::DownloadMissing { peer, root } if *root == unknown => Some(*peer),
        _ => None,
    })
    .await;
    assert_eq!(missing, Some(worker.id));

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_upload_to_unlinked_peer_fails() {
    let mesh = MeshFixture::start().await.unwrap();
    let client = mesh.join(Role::Client).await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lonely.txt");
    std::fs::write(&path, b"nobody to send this to").unwrap();

    let err = client
        .handle
        .upload(PeerId::random(), &path)
        .await
        .unwrap_err();
    assert!(matches!(err, weft_mesh::MeshError::PeerNotFound(_)));

    mesh.shutdown().await;
}
