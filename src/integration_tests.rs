//! End-to-end scenarios run against `testutil::MockComfyServer`, covering
//! the dispatch, fallback, and rewrite invariants the scheduler promises.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::backend::error::BackendError;
use crate::config::GatewayConfig;
use crate::gateway::{Gateway, JobMode};
use crate::rewriter::Workflow;
use crate::testutil::MockComfyServer;

fn image_template() -> Workflow {
    json!({
        "10": {"class_type": "LoadImage", "inputs": {"image": "old.png"}},
        "20": {"class_type": "KSampler", "inputs": {}}
    })
    .as_object()
    .unwrap()
    .clone()
}

async fn gateway_with_backends(backends: Vec<String>) -> Gateway {
    let config = GatewayConfig {
        backends,
        timeouts: crate::config::TimeoutsConfig {
            workflow_timeout: Duration::from_secs(5),
            video_workflow_timeout: Duration::from_secs(5),
            preload_timeout: Duration::from_secs(5),
        },
        comfyui_input_dir: std::env::temp_dir().join("forgegate_test_input"),
        ..Default::default()
    };
    Gateway::start(config).unwrap()
}

#[tokio::test]
async fn scenario_two_backend_least_load_dispatch() {
    let server_a = MockComfyServer::start().await;
    let server_b = MockComfyServer::start().await;

    let gateway = gateway_with_backends(vec![server_a.addr.clone(), server_b.addr.clone()]).await;
    gateway
        .load_template(image_template(), "demo".to_string(), JobMode::Image)
        .await
        .unwrap();

    let (r1, r2) = tokio::join!(
        gateway.process("in1.png", JobMode::Image),
        gateway.process("in2.png", JobMode::Image),
    );
    let r1 = r1.unwrap();
    let r2 = r2.unwrap();

    let mut addresses = vec![r1.backend_address, r2.backend_address];
    addresses.sort();
    let mut expected = vec![server_a.addr.clone(), server_b.addr.clone()];
    expected.sort();
    assert_eq!(addresses, expected, "each request should land on a different backend");

    gateway.shutdown().await;
    server_a.shutdown().await;
    server_b.shutdown().await;
}

#[tokio::test]
async fn scenario_unavailable_fallback() {
    let server_a = MockComfyServer::start().await; // will be marked unavailable
    let server_b = MockComfyServer::start().await;
    server_b.set_queue_depth(5, 0);

    let gateway = gateway_with_backends(vec![server_a.addr.clone(), server_b.addr.clone()]).await;
    // Force A unavailable by tripping the failure threshold directly.
    for _ in 0..3 {
        gateway.registry().apply_probe(&server_a.addr, crate::registry::ProbeOutcome::Failure);
    }
    assert!(!gateway.registry().get(&server_a.addr).unwrap().available);

    gateway
        .load_template(image_template(), "demo".to_string(), JobMode::Image)
        .await
        .unwrap();
    let result = gateway.process("in.png", JobMode::Image).await.unwrap();
    assert_eq!(result.backend_address, server_b.addr);

    gateway.shutdown().await;
    server_a.shutdown().await;
    server_b.shutdown().await;
}

#[tokio::test]
async fn scenario_all_unavailable_degenerate() {
    // Neither address is a live server; registered in this order so A is
    // the insertion-order fallback.
    let gateway = gateway_with_backends(vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()]).await;
    for addr in ["127.0.0.1:1", "127.0.0.1:2"] {
        for _ in 0..3 {
            gateway.registry().apply_probe(addr, crate::registry::ProbeOutcome::Failure);
        }
    }

    gateway
        .load_template(image_template(), "demo".to_string(), JobMode::Image)
        .await
        .ok();
    let result = gateway.process("in.png", JobMode::Image).await;
    assert!(matches!(result, Err(BackendError::TransportError { backend, .. }) if backend == "127.0.0.1:1"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn scenario_preload_fanout_partial_success() {
    let server_a = MockComfyServer::start().await;
    let server_b = MockComfyServer::start().await;
    let server_c = MockComfyServer::start().await;
    server_c.set_fail_prompt(true);

    let gateway = gateway_with_backends(vec![
        server_a.addr.clone(),
        server_b.addr.clone(),
        server_c.addr.clone(),
    ])
    .await;

    let result = gateway
        .load_template(image_template(), "demo".to_string(), JobMode::Image)
        .await
        .unwrap();
    assert!(result.ok);
    assert_eq!(result.per_backend.len(), 3);
    let success_count = result.per_backend.iter().filter(|o| o.ok).count();
    assert_eq!(success_count, 2);

    gateway.shutdown().await;
    server_a.shutdown().await;
    server_b.shutdown().await;
    server_c.shutdown().await;
}

#[tokio::test]
async fn scenario_execution_timeout_surfaces() {
    let server = MockComfyServer::start().await;
    server.set_no_completion(true);

    let config = GatewayConfig {
        backends: vec![server.addr.clone()],
        timeouts: crate::config::TimeoutsConfig {
            workflow_timeout: Duration::from_millis(200),
            video_workflow_timeout: Duration::from_millis(200),
            preload_timeout: Duration::from_millis(200),
        },
        ..Default::default()
    };
    let gateway = Gateway::start(config).unwrap();
    gateway
        .pool()
        .load_workflow(image_template(), "demo".to_string());

    let result = gateway.process("in.png", JobMode::Image).await;
    assert!(matches!(
        result,
        Err(BackendError::ExecutionTimeout { .. })
    ));

    gateway.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn scenario_in_flight_returns_to_zero_after_completion() {
    let server = MockComfyServer::start().await;
    let gateway = Arc::new(gateway_with_backends(vec![server.addr.clone()]).await);
    gateway
        .load_template(image_template(), "demo".to_string(), JobMode::Image)
        .await
        .unwrap();

    gateway.process("in.png", JobMode::Image).await.unwrap();
    let status = gateway.status_snapshot();
    assert_eq!(status[0].in_flight, 0);

    gateway.shutdown().await;
    server.shutdown().await;
}
