//! HTTP surface of the order pipeline.
//!
//! One API route resolves orders by id through the cache with a durable
//! store fallback; everything else is ambient: static files for the demo
//! UI, health and prometheus endpoints, and the middleware stack
//! (request id, logging, panic recovery, URL format stripping, timeout).
//!
//! Every expected outcome of the order route is an HTTP 200 carrying the
//! uniform `{status, error?, order?}` envelope; the envelope, not the
//! status code, is the discriminator. Only unexpected panics surface a 500
//! through the recoverer.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Path as UrlPath, Request, State};
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::FutureExt;
use model::Order;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use storage::{OrderStorage, StorageError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STATUS_OK: &str = "OK";
const STATUS_ERROR: &str = "Error";

/// Base envelope shared by every API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            error: Some(msg.into()),
        }
    }
}

/// Envelope extended with the order body on success.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub response: ApiResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

impl OrderResponse {
    pub fn ok(order: Order) -> Self {
        Self {
            response: ApiResponse::ok(),
            order: Some(order),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            response: ApiResponse::error(msg),
            order: None,
        }
    }
}

/// Shared state for handlers: the cache, the durable store behind it, and
/// the ambient plumbing.
#[derive(Clone)]
struct AppState {
    cache: Arc<dyn OrderStorage>,
    storage: Arc<dyn OrderStorage>,
    static_dir: String,
    metrics: Arc<Metrics>,
}

/// HTTP server for the order read path.
pub struct Server {
    cfg: app_config::HttpServer,
    cache: Arc<dyn OrderStorage>,
    storage: Arc<dyn OrderStorage>,
    static_dir: String,
    metrics: Arc<Metrics>,
}

impl Server {
    pub fn new(
        cfg: app_config::HttpServer,
        cache: Arc<dyn OrderStorage>,
        storage: Arc<dyn OrderStorage>,
        static_dir: String,
    ) -> Self {
        info!(address = %cfg.address, "initializing http server");
        Self {
            cfg,
            cache,
            storage,
            static_dir,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Binds the listener and serves until the token is cancelled.
    /// In-flight requests are allowed to finish.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(&self.cfg.address)
            .await
            .context("failed to bind http listener")?;
        info!(
            address = %self.cfg.address,
            idle_timeout = ?self.cfg.idle_timeout,
            "http server listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(ctx.cancelled_owned())
            .await
            .context("server error")?;

        info!("http server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        let state = AppState {
            cache: self.cache.clone(),
            storage: self.storage.clone(),
            static_dir: self.static_dir.clone(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/order/{order_uid}", get(handle_get_order))
            .route("/order", get(handle_missing_uid))
            .route("/order/", get(handle_missing_uid))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .fallback(handle_static)
            .layer(middleware::from_fn_with_state(
                self.metrics.clone(),
                record_metrics,
            ))
            .layer(middleware::from_fn_with_state(
                self.cfg.timeout,
                enforce_timeout,
            ))
            .layer(middleware::from_fn(recover_panics))
            .layer(middleware::from_fn(log_requests))
            .layer(middleware::from_fn(strip_url_format))
            .layer(middleware::from_fn(assign_request_id))
            .with_state(state)
    }
}

async fn handle_get_order(
    State(state): State<AppState>,
    UrlPath(order_uid): UrlPath<String>,
) -> Json<OrderResponse> {
    Json(resolve_order(&state.cache, &state.storage, &order_uid).await)
}

async fn handle_missing_uid() -> Json<OrderResponse> {
    warn!("order uid is empty");
    Json(OrderResponse::error("order uid is empty"))
}

/// The lookup-through algorithm: cache first, then the durable store; a
/// store hit schedules a detached cache fill so a client disconnect can
/// never leave the cache cold.
async fn resolve_order(
    cache: &Arc<dyn OrderStorage>,
    storage: &Arc<dyn OrderStorage>,
    order_uid: &str,
) -> OrderResponse {
    if order_uid.is_empty() {
        warn!("order uid is empty");
        return OrderResponse::error("order uid is empty");
    }

    match cache.get_order(order_uid).await {
        Ok(order) => {
            debug!(order_uid, "order served from cache");
            OrderResponse::ok(order)
        }
        Err(StorageError::NoOrder) => {
            debug!(order_uid, "order not found in cache");
            match storage.get_order(order_uid).await {
                Ok(order) => {
                    let cache = cache.clone();
                    let cached = order.clone();
                    tokio::spawn(async move {
                        debug!(order_uid = %cached.order_uid, "saving order in cache");
                        if let Err(err) = cache.save_order(&cached).await {
                            error!(error = %err, "failed to save order in cache");
                        }
                    });
                    OrderResponse::ok(order)
                }
                Err(StorageError::NoOrder) => {
                    info!(order_uid, "order not found");
                    OrderResponse::error("order not found")
                }
                Err(StorageError::EmptyOrder) => {
                    info!(order_uid, "empty order");
                    OrderResponse::error("empty order")
                }
                Err(err) => {
                    error!(error = %err, "failed to get order");
                    OrderResponse::error("failed to get order")
                }
            }
        }
        Err(StorageError::EmptyOrder) => {
            info!(order_uid, "empty order");
            OrderResponse::error("empty order")
        }
        Err(err) => {
            error!(error = %err, "failed to get order");
            OrderResponse::error("failed to get order")
        }
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
            .into_response();
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => {
            error!(error = %err, "metrics are not valid utf-8");
            (StatusCode::INTERNAL_SERVER_ERROR, "invalid metrics data").into_response()
        }
    }
}

/// Serves the demo UI from the static directory.
async fn handle_static(State(state): State<AppState>, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };
    if path.contains("..") {
        return (StatusCode::NOT_FOUND, "file not found").into_response();
    }

    let file_path = Path::new(&state.static_dir).join(path);
    match tokio::fs::read(&file_path).await {
        Ok(content) => {
            let content_type = if path.ends_with(".html") {
                "text/html"
            } else if path.ends_with(".css") {
                "text/css"
            } else if path.ends_with(".js") {
                "application/javascript"
            } else {
                "application/octet-stream"
            };

            ([(axum::http::header::CONTENT_TYPE, content_type)], content).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "file not found").into_response(),
    }
}

#[derive(Debug, Clone, Default)]
struct RequestId(String);

/// Tags every request with a uuid, echoed back in `x-request-id`.
async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default();

    let start = Instant::now();
    let response = next.run(req).await;

    info!(
        request_id = %request_id.0,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

/// Converts a panicking handler into a plain 500 instead of a dropped
/// connection.
async fn recover_panics(req: Request, next: Next) -> Response {
    match std::panic::AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!("request handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

async fn enforce_timeout(
    State(limit): State<Duration>,
    req: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response(),
    }
}

/// Strips a trailing format extension (`/order/123.json` → `/order/123`)
/// from the final path segment.
async fn strip_url_format(mut req: Request, next: Next) -> Response {
    if let Some(stripped) = strip_format(req.uri().path()) {
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{stripped}?{query}"),
            None => stripped,
        };
        if let Ok(pq) = PathAndQuery::try_from(path_and_query) {
            let mut parts = req.uri().clone().into_parts();
            parts.path_and_query = Some(pq);
            if let Ok(uri) = Uri::from_parts(parts) {
                *req.uri_mut() = uri;
            }
        }
    }
    next.run(req).await
}

fn strip_format(path: &str) -> Option<String> {
    const FORMATS: &[&str] = &[".json", ".xml", ".html"];

    let (head, last) = path.rsplit_once('/')?;
    for format in FORMATS {
        if let Some(base) = last.strip_suffix(format) {
            if !base.is_empty() {
                return Some(format!("{head}/{base}"));
            }
        }
    }
    None
}

async fn record_metrics(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16();

    metrics.record_request(&method, &path, status, start.elapsed());
    if status >= 400 {
        metrics.record_error("http", &path);
    }
    response
}

/// Prometheus counters for the HTTP surface.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )
        .expect("Failed to create errors_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total
            .with_label_values(&[source, endpoint])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use model::{AdditionalData, Delivery, Item, Payment};
    use std::sync::Mutex;

    struct MockStorage {
        orders: Mutex<Vec<Order>>,
        fail: bool,
    }

    impl MockStorage {
        fn with_orders(orders: Vec<Order>) -> Arc<Self> {
            Arc::new(Self {
                orders: Mutex::new(orders),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                orders: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn contains(&self, order_uid: &str) -> bool {
            self.orders
                .lock()
                .unwrap()
                .iter()
                .any(|o| o.order_uid == order_uid)
        }
    }

    #[async_trait]
    impl OrderStorage for MockStorage {
        async fn save_order(&self, order: &Order) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::other(anyhow::anyhow!("backend down")));
            }
            self.orders.lock().unwrap().push(order.clone());
            Ok(())
        }

        async fn get_order(&self, order_uid: &str) -> Result<Order, StorageError> {
            if self.fail {
                return Err(StorageError::other(anyhow::anyhow!("backend down")));
            }
            self.orders
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.order_uid == order_uid)
                .cloned()
                .ok_or(StorageError::NoOrder)
        }
    }

    fn sample_order(uid: &str) -> Order {
        Order {
            order_uid: uid.to_string(),
            track_number: "WBILMTESTTRACK".to_string(),
            customer_id: "test".to_string(),
            delivery_service: "meest".to_string(),
            date_created: chrono::Utc::now(),
            items: vec![Item {
                chrt_id: 9934930,
                track_number: "WBILMTESTTRACK".to_string(),
                price: 453.0,
                rid: "ab4219087a764ae0btest".to_string(),
                name: "Mascaras".to_string(),
                sale: 30.0,
                size: "0".to_string(),
                total_price: 317.0,
                nm_id: 2389212,
                brand: "Vivienne Sabo".to_string(),
                status: 202,
            }],
            delivery: Delivery {
                name: "Test Testov".to_string(),
                phone: "+9720000000".to_string(),
                zip: "2639809".to_string(),
                city: "Kiryat Mozkin".to_string(),
                address: "Ploshad Mira 15".to_string(),
                region: "Kraiot".to_string(),
                email: "test@gmail.com".to_string(),
            },
            payment: Payment {
                transaction: uid.to_string(),
                request_id: String::new(),
                currency: "USD".to_string(),
                provider: "wbpay".to_string(),
                amount: 1817,
                payment_dt: 1637907727,
                bank: "alpha".to_string(),
                delivery_cost: 1500,
                goods_total: 317,
                custom_fee: 0,
            },
            additional: AdditionalData {
                entry: "WBIL".to_string(),
                locale: "en".to_string(),
                internal_signature: String::new(),
                shardkey: "9".to_string(),
                sm_id: 99,
                oof_shard: "1".to_string(),
            },
        }
    }

    fn as_storage(mock: &Arc<MockStorage>) -> Arc<dyn OrderStorage> {
        mock.clone()
    }

    #[test]
    fn error_envelope_shape() {
        let value =
            serde_json::to_value(OrderResponse::error("order not found")).unwrap();
        assert_eq!(value["status"], "Error");
        assert_eq!(value["error"], "order not found");
        assert!(value.get("order").is_none());
    }

    #[test]
    fn ok_envelope_shape() {
        let value = serde_json::to_value(OrderResponse::ok(sample_order("o1"))).unwrap();
        assert_eq!(value["status"], "OK");
        assert!(value.get("error").is_none());
        assert_eq!(value["order"]["order_uid"], "o1");
    }

    #[tokio::test]
    async fn resolves_from_cache_first() {
        let cache = MockStorage::with_orders(vec![sample_order("o1")]);
        let storage = MockStorage::failing();

        let response =
            resolve_order(&as_storage(&cache), &as_storage(&storage), "o1").await;

        assert_eq!(response.response.status, "OK");
        assert_eq!(response.order.unwrap().order_uid, "o1");
    }

    #[tokio::test]
    async fn store_hit_fills_the_cache_asynchronously() {
        let cache = MockStorage::with_orders(Vec::new());
        let storage = MockStorage::with_orders(vec![sample_order("o1")]);

        let response =
            resolve_order(&as_storage(&cache), &as_storage(&storage), "o1").await;
        assert_eq!(response.response.status, "OK");

        // The fill runs on a detached task; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.contains("o1"));
    }

    #[tokio::test]
    async fn both_misses_map_to_order_not_found() {
        let cache = MockStorage::with_orders(Vec::new());
        let storage = MockStorage::with_orders(Vec::new());

        let response =
            resolve_order(&as_storage(&cache), &as_storage(&storage), "missing").await;

        assert_eq!(response.response.status, "Error");
        assert_eq!(response.response.error.as_deref(), Some("order not found"));
    }

    #[tokio::test]
    async fn empty_uid_maps_to_its_own_error() {
        let cache = MockStorage::with_orders(Vec::new());
        let storage = MockStorage::with_orders(Vec::new());

        let response =
            resolve_order(&as_storage(&cache), &as_storage(&storage), "").await;

        assert_eq!(response.response.error.as_deref(), Some("order uid is empty"));
    }

    #[tokio::test]
    async fn backend_failure_maps_to_generic_error() {
        let cache = MockStorage::failing();
        let storage = MockStorage::with_orders(Vec::new());

        let response =
            resolve_order(&as_storage(&cache), &as_storage(&storage), "o1").await;

        assert_eq!(
            response.response.error.as_deref(),
            Some("failed to get order")
        );
    }

    #[test]
    fn strips_known_formats_only() {
        assert_eq!(
            strip_format("/order/abc.json").as_deref(),
            Some("/order/abc")
        );
        assert_eq!(strip_format("/page.html").as_deref(), Some("/page"));
        assert_eq!(strip_format("/order/abc"), None);
        assert_eq!(strip_format("/order/.json"), None);
        assert_eq!(strip_format("no-slash"), None);
    }
}
