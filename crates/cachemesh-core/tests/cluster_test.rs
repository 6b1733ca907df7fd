//! cachemesh Cluster Tests
//!
//! Run two nodes in one process over the TCP transport on loopback, using
//! manual discovery so no multicast is required.

use std::sync::Arc;
use std::time::Duration;

use cachemesh_core::service::{CacheMeshNode, CacheStore, ReplicatedCache};
use cachemesh_core::{Configuration, Element};

fn configuration(extra: &[(&str, &str)]) -> Configuration {
    let mut builder = config::Config::builder()
        .set_override("cachemesh.peer.discovery", "manual")
        .unwrap()
        .set_override("cachemesh.listener.host.name", "127.0.0.1")
        .unwrap()
        .set_override("cachemesh.listener.port", "0")
        .unwrap()
        .set_override("cachemesh.listener.socket.timeout.ms", "2000")
        .unwrap();
    for (key, value) in extra {
        builder = builder.set_override(*key, *value).unwrap();
    }
    Configuration::from_config(builder.build().unwrap())
}

async fn started_node(extra: &[(&str, &str)]) -> CacheMeshNode {
    let node = CacheMeshNode::new(&configuration(extra)).unwrap();
    node.start().await.unwrap();
    node
}

/// Make each node a manual peer of the other for one cache
fn connect(a: &CacheMeshNode, b: &CacheMeshNode, cache: &str) {
    a.provider().register_peer(&b.listener().url_for(cache));
    b.provider().register_peer(&a.listener().url_for(cache));
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}

fn value(cache: &ReplicatedCache, key: &str) -> Option<Vec<u8>> {
    cache.get(key).map(|element| element.value)
}

#[tokio::test]
async fn test_synchronous_replication_between_nodes() {
    let settings = [
        ("cachemesh.bootstrap.enabled", "false"),
        ("cachemesh.replication.replicate-asynchronously", "false"),
    ];
    let a = started_node(&settings).await;
    let b = started_node(&settings).await;

    let cache_a = a.add_cache("users").await.unwrap();
    let cache_b = b.add_cache("users").await.unwrap();
    connect(&a, &b, "users");

    cache_a.put(Element::new("alice", b"1".to_vec())).await;
    assert_eq!(value(&cache_b, "alice"), Some(b"1".to_vec()));

    cache_a
        .put(Element::new("alice", b"2".to_vec()).with_version(2))
        .await;
    assert_eq!(value(&cache_b, "alice"), Some(b"2".to_vec()));

    cache_b.remove("alice").await;
    assert!(cache_a.get("alice").is_none());

    cache_a.put(Element::new("bob", b"3".to_vec())).await;
    cache_a.remove_all().await;
    assert_eq!(cache_b.size(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_asynchronous_replication_between_nodes() {
    let settings = [
        ("cachemesh.bootstrap.enabled", "false"),
        ("cachemesh.replication.async-interval-ms", "20"),
    ];
    let a = started_node(&settings).await;
    let b = started_node(&settings).await;

    let cache_a = a.add_cache("sessions").await.unwrap();
    let cache_b = b.add_cache("sessions").await.unwrap();
    connect(&a, &b, "sessions");

    for i in 0..10 {
        cache_a
            .put(Element::new(format!("s{}", i), vec![i as u8]))
            .await;
    }

    wait_for(|| cache_b.size() == 10).await;
    assert_eq!(value(&cache_b, "s7"), Some(vec![7]));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_does_not_fail_local_write() {
    let node = started_node(&[
        ("cachemesh.bootstrap.enabled", "false"),
        ("cachemesh.replication.replicate-asynchronously", "false"),
    ])
    .await;
    let cache = node.add_cache("users").await.unwrap();

    // Nothing listens on this port
    let port = {
        let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    };
    node.provider()
        .register_peer(&format!("tcp://127.0.0.1:{}/users", port));

    cache.put(Element::new("k", b"v".to_vec())).await;
    assert_eq!(value(&cache, "k"), Some(b"v".to_vec()));

    node.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_from_peer() {
    let source = started_node(&[
        ("cachemesh.bootstrap.enabled", "false"),
        ("cachemesh.replication.replicate-asynchronously", "false"),
    ])
    .await;
    let source_cache = source.add_cache("catalog").await.unwrap();
    for i in 0..25 {
        source_cache
            .store()
            .put_quiet(Element::new(format!("item{}", i), vec![0u8; 512]));
    }

    // The joining node knows the source before it creates the cache
    let source_url = source.listener().url_for("catalog");
    let joiner = CacheMeshNode::new(&configuration(&[
        ("cachemesh.bootstrap.asynchronously", "false"),
        ("cachemesh.bootstrap.maximum.chunk.size.bytes", "5000"),
        ("cachemesh.peer.urls", source_url.as_str()),
    ]))
    .unwrap();
    joiner.start().await.unwrap();

    let joined: Arc<ReplicatedCache> = joiner.add_cache("catalog").await.unwrap();
    assert_eq!(joined.size(), 25);
    assert_eq!(joined.get("item3").unwrap().value.len(), 512);

    joiner.shutdown().await;
    source.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_with_chunk_size_above_frame_limit() {
    let source = started_node(&[
        ("cachemesh.bootstrap.enabled", "false"),
        ("cachemesh.listener.socket.timeout.ms", "30000"),
    ])
    .await;
    let source_cache = source.add_cache("blobs").await.unwrap();
    // Together these encode to well over one frame
    for i in 0..20 {
        source_cache
            .store()
            .put_quiet(Element::new(format!("blob{}", i), vec![255u8; 1_000_000]));
    }

    let source_url = source.listener().url_for("blobs");
    let joiner = CacheMeshNode::new(&configuration(&[
        ("cachemesh.bootstrap.asynchronously", "false"),
        ("cachemesh.bootstrap.maximum.chunk.size.bytes", "100000000"),
        ("cachemesh.listener.socket.timeout.ms", "30000"),
        ("cachemesh.peer.urls", source_url.as_str()),
    ]))
    .unwrap();
    joiner.start().await.unwrap();

    let joined = joiner.add_cache("blobs").await.unwrap();
    assert_eq!(joined.size(), 20);
    assert_eq!(joined.get("blob19").unwrap().value.len(), 1_000_000);

    joiner.shutdown().await;
    source.shutdown().await;
}
