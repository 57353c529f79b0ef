// Integration tests for the release checker behind its circuit breaker

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use mining_core::{CircuitBreakerConfig, CircuitState, MiningError, RequestContext};
use mining_manager::ReleaseChecker;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct ReleaseApi {
    hits: AtomicUsize,
    failing: AtomicBool,
}

async fn latest_release(State(api): State<Arc<ReleaseApi>>) -> Result<Json<Value>, StatusCode> {
    api.hits.fetch_add(1, Ordering::SeqCst);
    if api.failing.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(json!({ "tag_name": "v6.21.0", "name": "XMRig v6.21.0" })))
}

async fn spawn_release_api() -> (String, Arc<ReleaseApi>) {
    let api = Arc::new(ReleaseApi::default());
    let app = Router::new()
        .route("/repos/:owner/:repo/releases/latest", get(latest_release))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), api)
}

fn checker(base: &str, cooldown: Duration) -> ReleaseChecker {
    ReleaseChecker::new(
        reqwest::Client::new(),
        base,
        CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown,
        },
    )
}

#[tokio::test]
async fn test_latest_version() {
    let (base, api) = spawn_release_api().await;
    let checker = checker(&base, Duration::from_secs(60));
    let ctx = RequestContext::background();

    let tag = checker.latest_version("xmrig", "xmrig", &ctx).await.unwrap();
    assert_eq!(tag, "v6.21.0");
    assert_eq!(api.hits.load(Ordering::SeqCst), 1);
    assert_eq!(checker.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_open_circuit_serves_cached_tag() {
    let (base, api) = spawn_release_api().await;
    let checker = checker(&base, Duration::from_secs(60));
    let ctx = RequestContext::background();

    checker.latest_version("xmrig", "xmrig", &ctx).await.unwrap();

    api.failing.store(true, Ordering::SeqCst);
    for _ in 0..5 {
        let result = checker.latest_version("xmrig", "xmrig", &ctx).await;
        assert!(matches!(result, Err(MiningError::UnexpectedStatus(500))));
    }
    assert_eq!(checker.breaker().state(), CircuitState::Open);
    assert_eq!(api.hits.load(Ordering::SeqCst), 6);

    // sixth failure-era call never reaches the API
    let tag = checker.latest_version("xmrig", "xmrig", &ctx).await.unwrap();
    assert_eq!(tag, "v6.21.0");
    assert_eq!(api.hits.load(Ordering::SeqCst), 6);
    assert_eq!(checker.breaker().get_cached().as_deref(), Some("v6.21.0"));
}

#[tokio::test]
async fn test_open_circuit_without_cache() {
    let (base, api) = spawn_release_api().await;
    api.failing.store(true, Ordering::SeqCst);
    let checker = checker(&base, Duration::from_secs(60));
    let ctx = RequestContext::background();

    for _ in 0..5 {
        assert!(checker.latest_version("xmrig", "xmrig", &ctx).await.is_err());
    }

    let result = checker.latest_version("xmrig", "xmrig", &ctx).await;
    assert!(matches!(result, Err(MiningError::CircuitOpen(_))));
    assert_eq!(api.hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_half_open_trial_closes_circuit() {
    let (base, api) = spawn_release_api().await;
    api.failing.store(true, Ordering::SeqCst);
    let checker = checker(&base, Duration::from_millis(50));
    let ctx = RequestContext::background();

    for _ in 0..5 {
        let _ = checker.latest_version("TrailingStop", "TT-Miner-release", &ctx).await;
    }
    assert_eq!(checker.breaker().state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    api.failing.store(false, Ordering::SeqCst);

    let tag = checker
        .latest_version("TrailingStop", "TT-Miner-release", &ctx)
        .await
        .unwrap();
    assert_eq!(tag, "v6.21.0");
    assert_eq!(checker.breaker().state(), CircuitState::Closed);
    assert_eq!(checker.breaker().failure_count(), 0);
}

#[tokio::test]
async fn test_cancelled_lookup_is_not_a_failure() {
    let (base, api) = spawn_release_api().await;
    let checker = checker(&base, Duration::from_secs(60));

    let ctx = RequestContext::background();
    ctx.cancel();
    let result = checker.latest_version("xmrig", "xmrig", &ctx).await;
    assert!(matches!(result, Err(MiningError::Cancelled)));
    assert_eq!(checker.breaker().failure_count(), 0);
    assert_eq!(api.hits.load(Ordering::SeqCst), 0);
}
