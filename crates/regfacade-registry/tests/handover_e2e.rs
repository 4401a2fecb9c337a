//! Listener handover between two facade generations.
//!
//! The second instance takes over the first one's TCP listener through
//! the handover socket, so it comes up on an already-bound port without
//! `EADDRINUSE`, while the first drains and exits cleanly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeUpstream, UpstreamLayer};
use regfacade_registry::config::{Config, HandoverConfig, StaticSpecConfig};
use regfacade_registry::{Registry, ResolverFactory};

/// Picks a port that is free right now.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_ok(client: &reqwest::Client, url: &str) {
    for _ in 0..100 {
        if let Ok(response) = client.get(url).send().await {
            if response.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server at {url} did not come up");
}

#[tokio::test]
async fn test_zero_downtime_handover() {
    let upstream = FakeUpstream::start().await;
    let (base_ref, _, _, _) = upstream.add_image(
        "workspace/base",
        "1.0",
        &[UpstreamLayer::gzipped(b"base layer")],
    );

    let tmp = tempfile::tempdir().unwrap();
    let sockets_dir = tmp.path().join("handover");
    let port = free_port().await;

    let config = |store: &str| Config {
        port,
        store: tmp.path().join(store),
        static_spec: Some(StaticSpecConfig {
            base_ref: base_ref.clone(),
            ..StaticSpecConfig::default()
        }),
        handover: HandoverConfig {
            enabled: true,
            sockets: sockets_dir.clone(),
        },
        ..Config::default()
    };

    let client = reqwest::Client::new();
    let base_url = format!("http://127.0.0.1:{port}/v2/");

    // First generation binds the port itself (no donor around yet).
    let first = Arc::new(
        Registry::new(config("store-1"), ResolverFactory::new().unwrap())
            .await
            .unwrap(),
    );
    let first_task = tokio::spawn(first.serve());
    wait_for_ok(&client, &base_url).await;

    // A manifest request served by the first generation.
    let response = client
        .get(format!(
            "http://127.0.0.1:{port}/v2/static/ide/manifests/x"
        ))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Second generation takes the listener over instead of binding.
    let second = Arc::new(
        Registry::new(config("store-2"), ResolverFactory::new().unwrap())
            .await
            .unwrap(),
    );
    let second_task = tokio::spawn(second.serve());

    // The donor notices the handover, drains, and returns cleanly - that
    // is the "exit 0" path.
    let first_result = tokio::time::timeout(Duration::from_secs(15), first_task)
        .await
        .expect("donor did not drain in time")
        .unwrap();
    assert!(first_result.is_ok(), "donor serve(): {first_result:?}");

    // New requests on the same port are answered by the successor, with
    // no connection refusal in between.
    wait_for_ok(&client, &base_url).await;
    let response = client
        .get(format!(
            "http://127.0.0.1:{port}/v2/static/ide/manifests/x"
        ))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Exactly one offer socket remains: the successor's own.
    let sockets: Vec<_> = std::fs::read_dir(&sockets_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(sockets.len(), 1, "sockets: {sockets:?}");

    second_task.abort();
}
