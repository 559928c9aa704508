use crate::*;

use peerindex_core::Request;

// ══════════════════════════════════════════════════════════════════════════════
//  Publish, find, download
// ══════════════════════════════════════════════════════════════════════════════

/// alice registers a 10 MB file, bob finds and downloads it byte for byte,
/// then alice withdraws it.
#[tokio::test]
async fn test_register_search_download_deregister() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    let bob = peer_socket().await;
    let movie = pattern(10 * 1024 * 1024, 7);

    let stored = publish(&d, &alice, "alice", "movie.mp4", &movie)
        .await
        .unwrap();
    assert_eq!(stored, movie.len() as u64);
    assert_eq!(d.blob_files(), 1);

    let reply = d.send(&bob, "S movie.mp4").await.unwrap();
    assert_eq!(
        reply,
        Reply::Found {
            name: "movie.mp4".into(),
            addr: alice.local_addr().unwrap(),
            owner: "alice".into()
        }
    );

    let (owner, bytes) = fetch(&d, "movie.mp4").await.unwrap();
    assert_eq!(owner, "alice");
    assert_eq!(bytes.len(), movie.len());
    assert!(bytes == movie, "downloaded bytes differ");

    let reply = d.send(&alice, "Q alice movie.mp4").await.unwrap();
    assert_eq!(
        reply,
        Reply::Removed {
            name: "movie.mp4".into()
        }
    );

    let reply = d.send(&bob, "S movie.mp4").await.unwrap();
    assert_eq!(reply_code(&reply), "NOT_FOUND");
    assert_eq!(d.blob_files(), 0);
}

#[tokio::test]
async fn test_download_reply_names_owner_and_size() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    publish(&d, &alice, "alice", "notes.txt", b"hello index")
        .await
        .unwrap();

    let reply = client::request(
        d.control,
        &Request::Download {
            name: "notes.txt".into(),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        reply,
        Reply::Download {
            name: "notes.txt".into(),
            addr: alice.local_addr().unwrap(),
            owner: "alice".into(),
            size_bytes: 11,
            bulk_port: d.bulk.port()
        }
    );
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    assert_eq!(publish(&d, &alice, "alice", "empty", b"").await.unwrap(), 0);

    let (_, bytes) = fetch(&d, "empty").await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_list_in_registration_order() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    for name in ["zeta", "alpha", "mid"] {
        publish(&d, &alice, "alice", name, name.as_bytes())
            .await
            .unwrap();
    }

    let reply = d.send(&alice, "L alice").await.unwrap();
    assert_eq!(
        reply,
        Reply::Listing {
            peer_id: "alice".into(),
            names: vec!["zeta".into(), "alpha".into(), "mid".into()]
        }
    );
}

/// Two holders of the same name: the peer registered first is returned.
#[tokio::test]
async fn test_search_prefers_first_registered_peer() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    let carol = peer_socket().await;
    publish(&d, &alice, "alice", "song.ogg", b"alice's copy")
        .await
        .unwrap();
    publish(&d, &carol, "carol", "song.ogg", b"carol's copy")
        .await
        .unwrap();

    match d.send(&carol, "S song.ogg").await.unwrap() {
        Reply::Found { owner, .. } => assert_eq!(owner, "alice"),
        other => panic!("unexpected reply {:?}", other),
    }

    // alice withdraws; carol's copy is found next
    d.send(&alice, "Q alice song.ogg").await.unwrap();
    let (owner, bytes) = fetch(&d, "song.ogg").await.unwrap();
    assert_eq!(owner, "carol");
    assert_eq!(bytes, b"carol's copy");
}

#[tokio::test]
async fn test_reregister_serves_new_bytes() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    publish(&d, &alice, "alice", "doc", b"first version")
        .await
        .unwrap();
    d.send(&alice, "Q alice doc").await.unwrap();
    publish(&d, &alice, "alice", "doc", b"second version")
        .await
        .unwrap();

    let (_, bytes) = fetch(&d, "doc").await.unwrap();
    assert_eq!(bytes, b"second version");
    assert_eq!(d.blob_files(), 1);
}

#[tokio::test]
async fn test_concurrent_downloads_get_identical_bytes() {
    let d = TestDaemon::start().await.unwrap();
    let alice = peer_socket().await;
    let data = pattern(512 * 1024, 3);
    publish(&d, &alice, "alice", "shared.bin", &data)
        .await
        .unwrap();

    let control = d.control;
    let mut tasks = Vec::new();
    for _ in 0..6 {
        tasks.push(tokio::spawn(async move {
            let mut out = Vec::new();
            client::fetch(control, "shared.bin", &mut out).await.map(|_| out)
        }));
    }
    for task in tasks {
        let bytes = task.await.unwrap().unwrap();
        assert!(bytes == data);
    }
}
