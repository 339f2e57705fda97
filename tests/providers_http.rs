// tests/providers_http.rs
//
// HttpJsonProvider against a throwaway local axum server (ephemeral port).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};

use market_ingest::ingest::config::ProviderConfigEntry;
use market_ingest::ingest::error::ProviderError;
use market_ingest::ingest::providers::http_json::HttpJsonProvider;
use market_ingest::ingest::types::{IngestionOptions, Provider, ProviderContext};

#[derive(Clone, Default)]
struct Upstream {
    hits: Arc<AtomicUsize>,
    last_auth: Arc<parking_lot::Mutex<Option<String>>>,
    last_body: Arc<parking_lot::Mutex<Value>>,
}

async fn ok_handler(
    State(up): State<Upstream>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    up.hits.fetch_add(1, Ordering::SeqCst);
    *up.last_auth.lock() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *up.last_body.lock() = body.clone();

    let symbols: Vec<String> = serde_json::from_value(body["symbols"].clone()).unwrap_or_default();
    let prices: Vec<Value> = symbols
        .iter()
        .map(|s| json!({"symbol": s, "ts": 1000, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5}))
        .collect();
    let docs: Vec<Value> = symbols
        .iter()
        .map(|s| json!({"id": format!("{s}-1"), "symbol": s, "text": "note"}))
        .collect();
    Json(json!({ "prices": prices, "docs": docs }))
}

async fn spawn_upstream() -> (String, Upstream) {
    let up = Upstream::default();
    let app = Router::new()
        .route("/ingest", post(ok_handler))
        .route("/busy", post(|| async { StatusCode::TOO_MANY_REQUESTS }))
        .route("/down", post(|| async { StatusCode::BAD_GATEWAY }))
        .route(
            "/reject",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "unknown symbol ZZZ") }),
        )
        .route("/garbage", post(|| async { "not json" }))
        .with_state(up.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), up)
}

fn ctx() -> ProviderContext {
    ProviderContext::new(Arc::new(ProviderConfigEntry::new("up")))
}

fn opts(symbols: &[&str], rag: bool) -> IngestionOptions {
    IngestionOptions {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        rag_enabled: rag,
        api_key: Some("secret".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn decodes_normalized_payload_and_sends_bearer() {
    let (base, up) = spawn_upstream().await;
    let p = HttpJsonProvider::new("up", format!("{base}/ingest")).unwrap();

    let r = p.ingest(&ctx(), &opts(&["AAA", "BBB"], true)).await.unwrap();
    assert_eq!(r.provider_id, "up");
    assert_eq!(r.prices.len(), 2);
    assert_eq!(r.docs.len(), 2);
    assert_eq!(r.symbols_tried, vec!["AAA", "BBB"]);

    assert_eq!(up.hits.load(Ordering::SeqCst), 1);
    assert_eq!(up.last_auth.lock().as_deref(), Some("Bearer secret"));
    assert_eq!(up.last_body.lock()["rag"], json!(true));
}

#[tokio::test]
async fn docs_dropped_when_rag_disabled() {
    let (base, _up) = spawn_upstream().await;
    let p = HttpJsonProvider::new("up", format!("{base}/ingest")).unwrap();
    let r = p.ingest(&ctx(), &opts(&["AAA"], false)).await.unwrap();
    assert_eq!(r.prices.len(), 1);
    assert!(r.docs.is_empty());
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let (base, _up) = spawn_upstream().await;

    let busy = HttpJsonProvider::new("up", format!("{base}/busy")).unwrap();
    let e = busy.ingest(&ctx(), &opts(&["AAA"], false)).await.unwrap_err();
    assert!(matches!(&e, ProviderError::RateLimited { provider } if provider == "up"));
    assert!(e.is_transient());

    let down = HttpJsonProvider::new("up", format!("{base}/down")).unwrap();
    let e = down.ingest(&ctx(), &opts(&["AAA"], false)).await.unwrap_err();
    assert!(matches!(e, ProviderError::Transient(_)));

    let reject = HttpJsonProvider::new("up", format!("{base}/reject")).unwrap();
    let e = reject.ingest(&ctx(), &opts(&["AAA"], false)).await.unwrap_err();
    assert!(matches!(e, ProviderError::Validation(ref m) if m.contains("unknown symbol ZZZ")));
    assert!(!e.is_transient());

    let garbage = HttpJsonProvider::new("up", format!("{base}/garbage")).unwrap();
    let e = garbage.ingest(&ctx(), &opts(&["AAA"], false)).await.unwrap_err();
    assert!(matches!(e, ProviderError::Decode(_)));
    assert!(!e.is_transient());
}

#[tokio::test]
async fn unreachable_upstream_is_transient() {
    // Bind then drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let p = HttpJsonProvider::new("up", format!("http://{addr}/ingest")).unwrap();
    let e = p.ingest(&ctx(), &opts(&["AAA"], false)).await.unwrap_err();
    assert!(matches!(e, ProviderError::Http(_)));
    assert!(e.is_transient());
}
