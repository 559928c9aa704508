use crate::*;

use peerindex_core::wire::{read_frame, write_frame};
use peerindex_core::{BulkHandshake, BulkOp, BulkStatus};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

// ══════════════════════════════════════════════════════════════════════════════
//  Aborted transfers and refused requests
// ══════════════════════════════════════════════════════════════════════════════

async fn open_upload(d: &TestDaemon, peer: &str, name: &str, size: u64) -> TcpStream {
    let mut stream = TcpStream::connect(d.bulk).await.unwrap();
    let handshake = BulkHandshake {
        op: BulkOp::Upload,
        peer_id: peer.into(),
        name: name.into(),
        size_bytes: Some(size),
    };
    write_frame(&mut stream, &handshake).await.unwrap();
    stream
}

/// The uploader vanishes halfway: no record, no blob, name free again.
#[tokio::test]
async fn test_upload_dropped_mid_stream_leaves_nothing() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;

    let reply = d.send(&alice, "R alice big.iso").await.unwrap();
    assert!(matches!(reply, Reply::Ready { .. }), "{:?}", reply);

    let mut stream = open_upload(&d, "alice", "big.iso", 1_000_000).await;
    let status: BulkStatus = read_frame(&mut stream).await.unwrap();
    assert_eq!(status, BulkStatus::Accepted);
    stream.write_all(&pattern(100_000, 1)).await.unwrap();
    drop(stream);

    let coordinator = d.coordinator.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            coordinator
                .registry()
                .pending_generation("alice", "big.iso")
                .is_none()
        })
        .await,
        "pending record was not aborted"
    );

    assert_eq!(reply_code(&d.send(&alice, "S big.iso").await.unwrap()), "NOT_FOUND");
    assert_eq!(
        d.send(&alice, "L alice").await.unwrap(),
        Reply::Listing {
            peer_id: "alice".into(),
            names: vec![]
        }
    );
    assert!(eventually(Duration::from_secs(2), || d.blob_files() == 0).await);
    assert_eq!(d.coordinator.uploads_in_flight(), 0);

    // the name can be registered again
    publish(&d, &alice, "alice", "big.iso", b"retry").await.unwrap();
}

#[tokio::test]
async fn test_malformed_requests_are_bad_request() {
    let d = TestDaemon::start().await.unwrap();
    let peer = peer_socket().await;
    let long_name = "x".repeat(256);
    let cases = [
        "R alice".to_string(),
        "R alice a b".to_string(),
        "X alice a".to_string(),
        "S".to_string(),
        format!("S {}", long_name),
        " ".to_string(),
    ];
    for case in &cases {
        let reply = d.send(&peer, case).await.unwrap();
        assert_eq!(reply_code(&reply), "BAD_REQUEST", "case {:?}", case);
    }
    assert_eq!(d.coordinator.registry().stats().peers, 0);
}

#[tokio::test]
async fn test_oversized_datagram_is_bad_request() {
    let d = TestDaemon::start().await.unwrap();
    let peer = peer_socket().await;
    let big = format!("S {}", "y".repeat(1500));
    assert_eq!(reply_code(&d.send(&peer, &big).await.unwrap()), "BAD_REQUEST");
}

#[tokio::test]
async fn test_duplicate_and_in_progress_registrations() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;

    assert!(matches!(
        d.send(&alice, "R alice a").await.unwrap(),
        Reply::Ready { .. }
    ));
    assert_eq!(
        reply_code(&d.send(&alice, "R alice a").await.unwrap()),
        "TRANSFER_IN_PROGRESS"
    );
    d.send(&alice, "Q alice a").await.unwrap();

    publish(&d, &alice, "alice", "a", b"bytes").await.unwrap();
    let err = publish(&d, &alice, "alice", "a", b"again").await.unwrap_err();
    assert_eq!(server_code(&err), Some("DUPLICATE_NAME"));
}

#[tokio::test]
async fn test_per_peer_capacity() {
    let d = TestDaemon::start_with(|c| c.registry.max_contents_per_peer = 2)
        .await
        .unwrap();
    let alice = peer_socket().await;
    publish(&d, &alice, "alice", "one", b"1").await.unwrap();
    publish(&d, &alice, "alice", "two", b"2").await.unwrap();

    let err = publish(&d, &alice, "alice", "three", b"3").await.unwrap_err();
    assert_eq!(server_code(&err), Some("CAPACITY_EXCEEDED"));

    // other peers are unaffected
    let bob = peer_socket().await;
    publish(&d, &bob, "bob", "three", b"3").await.unwrap();
}

#[tokio::test]
async fn test_blob_size_limit() {
    let d = TestDaemon::start_with(|c| c.transfer.max_blob_bytes = 1024)
        .await
        .unwrap();
    let alice = peer_socket().await;

    let err = publish(&d, &alice, "alice", "huge", &pattern(4096, 0))
        .await
        .unwrap_err();
    assert_eq!(server_code(&err), Some("CAPACITY_EXCEEDED"));
    assert!(d
        .coordinator
        .registry()
        .pending_generation("alice", "huge")
        .is_none());
    assert_eq!(d.blob_files(), 0);

    publish(&d, &alice, "alice", "small", &pattern(1024, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_upload_without_register_is_rejected() {
    let d = TestDaemon::start().await.unwrap();
    let mut stream = open_upload(&d, "mallory", "anything", 10).await;
    match read_frame::<BulkStatus, _>(&mut stream).await.unwrap() {
        BulkStatus::Rejected { code, .. } => assert_eq!(code, "NOT_FOUND"),
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_unclaimed_registration_expires() {
    let d = TestDaemon::start_with(|c| c.transfer.connect_timeout_secs = 1)
        .await
        .unwrap();
    let alice = peer_socket().await;
    assert!(matches!(
        d.send(&alice, "R alice late").await.unwrap(),
        Reply::Ready { .. }
    ));

    let coordinator = d.coordinator.clone();
    assert!(
        eventually(Duration::from_secs(5), || coordinator.uploads_in_flight() == 0).await,
        "upload slot never expired"
    );
    assert!(d
        .coordinator
        .registry()
        .pending_generation("alice", "late")
        .is_none());
    assert!(matches!(
        d.send(&alice, "R alice late").await.unwrap(),
        Reply::Ready { .. }
    ));
}

#[tokio::test]
async fn test_download_of_unknown_content() {
    let d = TestDaemon::start().await.unwrap();
    let bob = peer_socket().await;
    assert_eq!(reply_code(&d.send(&bob, "D nothing").await.unwrap()), "NOT_FOUND");

    let mut out = Vec::new();
    let err = client::download(d.bulk, "alice", "nothing", &mut out)
        .await
        .unwrap_err();
    assert_eq!(server_code(&err), Some("NOT_FOUND"));
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_garbage_handshake_is_rejected() {
    let d = TestDaemon::start().await.unwrap();
    let mut stream = TcpStream::connect(d.bulk).await.unwrap();
    let mut frame = 5u32.to_be_bytes().to_vec();
    frame.extend_from_slice(b"nope!");
    stream.write_all(&frame).await.unwrap();

    match read_frame::<BulkStatus, _>(&mut stream).await.unwrap() {
        BulkStatus::Rejected { code, .. } => assert_eq!(code, "BAD_REQUEST"),
        other => panic!("unexpected status {:?}", other),
    }
}
