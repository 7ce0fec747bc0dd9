mod common;

use common::{feed, service, RecordingHost};
use prism_core::admin::serve_admin;
use prism_core::AdapterConfig;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_admin_api_reports_metrics() {
    let service = service(AdapterConfig::default());
    let host = RecordingHost::with_body();
    let xaction = service.make_xaction(host.handle());
    xaction.begin().unwrap();
    xaction.request_adapted_body().unwrap();
    feed(&host, &xaction, b"0123456789");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = service.admin_state();
    let _server = tokio::spawn(async move {
        if let Err(e) = serve_admin(listener, state).await {
            eprintln!("Admin API failed: {}", e);
        }
    });

    // Verify Admin API (Health)
    let health_url = format!("http://{}/health", addr);
    let resp = reqwest::get(&health_url).await.unwrap();
    assert!(resp.status().is_success());
    let body = resp.text().await.unwrap();
    assert!(body.contains("ok"));

    // Verify Admin API (Metrics)
    let metrics_url = format!("http://{}/metrics", addr);
    let resp = reqwest::get(&metrics_url).await.unwrap();
    assert!(resp.status().is_success());
    let metrics: serde_json::Value = resp.json().await.unwrap();
    assert!(metrics["counters"]["xactions_created"].as_u64().unwrap() >= 1);
    assert_eq!(metrics["counters"]["virgin_bytes"], 10);
    assert_eq!(metrics["buffered_bytes"], 10);
    assert_eq!(metrics["scheduler"]["working"], 0);
    assert_eq!(metrics["scheduler"]["waiting"], 0);

    xaction.stop();
}
