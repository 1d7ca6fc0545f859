//! Axum JSON trigger surface for the price monitor.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pricewatch_core::{Alert, AlertPreferences, PriceHistoryRecord, RepriceSuggestion};
use pricewatch_sync::{
    monitor_from_config, Dashboard, DigestSweepSummary, MonitorConfig, PriceMonitor,
    ProbeReport, ProductCheckReport, SweepSummary, SyncError, UserCheckSummary,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-web";

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<PriceMonitor>,
}

impl AppState {
    pub fn new(monitor: Arc<PriceMonitor>) -> Self {
        Self { monitor }
    }
}

/// Error body shared by every route: `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::UserNotFound(_)
            | SyncError::ProductNotFound { .. }
            | SyncError::AlertNotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::CheckInProgress(_) => StatusCode::CONFLICT,
            SyncError::UnsupportedUrl(_)
            | SyncError::InvalidPreferences(_)
            | SyncError::Mail(_) => StatusCode::BAD_REQUEST,
            SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize, Default)]
struct HistoryParams {
    days: Option<i64>,
    competitor_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeParams {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sweep", post(sweep_handler))
        .route("/api/digest", post(digest_handler))
        .route("/api/users/{user_id}/check-now", post(check_user_handler))
        .route(
            "/api/users/{user_id}/products/{product_id}/check-now",
            post(check_product_handler),
        )
        .route(
            "/api/users/{user_id}/products/{product_id}/suggestion",
            get(suggestion_handler),
        )
        .route(
            "/api/users/{user_id}/products/{product_id}/history",
            get(history_handler),
        )
        .route("/api/users/{user_id}/dashboard", get(dashboard_handler))
        .route("/api/users/{user_id}/alerts", get(alerts_handler))
        .route("/api/users/{user_id}/alerts/test", post(test_email_handler))
        .route(
            "/api/users/{user_id}/alerts/{alert_id}/read",
            post(mark_read_handler),
        )
        .route(
            "/api/users/{user_id}/preferences",
            get(get_preferences_handler).put(put_preferences_handler),
        )
        .route("/api/diagnostics/fetch", get(probe_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving price monitor api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = MonitorConfig::from_env();
    let monitor = monitor_from_config(&config).await?;
    serve(AppState::new(Arc::new(monitor)), config.web_port).await
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.monitor.health_check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn sweep_handler(State(state): State<Arc<AppState>>) -> ApiResult<SweepSummary> {
    Ok(Json(state.monitor.run_full_sweep().await?))
}

async fn digest_handler(State(state): State<Arc<AppState>>) -> ApiResult<DigestSweepSummary> {
    Ok(Json(state.monitor.run_daily_digest().await?))
}

async fn check_user_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<UserCheckSummary> {
    Ok(Json(state.monitor.check_user_products(user_id).await?))
}

async fn check_product_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<ProductCheckReport> {
    Ok(Json(state.monitor.check_product(user_id, product_id).await?))
}

async fn suggestion_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, product_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<RepriceSuggestion> {
    Ok(Json(state.monitor.suggest(user_id, product_id).await?))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, product_id)): Path<(Uuid, Uuid)>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<PriceHistoryRecord>> {
    let rows = state
        .monitor
        .price_history(user_id, product_id, params.days, params.competitor_id)
        .await?;
    Ok(Json(rows))
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Dashboard> {
    Ok(Json(state.monitor.dashboard(user_id).await?))
}

async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Vec<Alert>> {
    Ok(Json(state.monitor.alerts(user_id).await?))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, alert_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Alert> {
    Ok(Json(state.monitor.mark_alert_read(user_id, alert_id).await?))
}

async fn test_email_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Ack> {
    state.monitor.send_test_email(user_id).await?;
    Ok(Json(Ack { ok: true }))
}

async fn get_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<AlertPreferences> {
    Ok(Json(state.monitor.preferences(user_id).await?))
}

async fn put_preferences_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    body: Result<Json<AlertPreferences>, JsonRejection>,
) -> ApiResult<AlertPreferences> {
    let Json(preferences) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    Ok(Json(state.monitor.update_preferences(user_id, preferences).await?))
}

async fn probe_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProbeParams>,
) -> ApiResult<ProbeReport> {
    let url = params
        .url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing url"))?;
    Ok(Json(state.monitor.probe(&url).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use pricewatch_adapters::OfflinePriceFetcher;
    use pricewatch_core::{Competitor, Product, User};
    use pricewatch_storage::{MemoryRecordStore, RecordStore};
    use pricewatch_sync::{AlertNotifier, NoDelay};
    use serde_json::Value;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        store: Arc<MemoryRecordStore>,
        user: User,
        product: Product,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryRecordStore::new());
        let user = User::new("seller@example.com");
        let mut product = Product::new(user.id, "Tripod");
        product.my_current_price = Some(100.0);
        product.profit_margin = Some(20.0);
        let cheapest = Competitor::new("mock://a?price=70", Some("A".into())).with_price(75.0);
        product.add_competitor(cheapest);
        product.add_competitor(Competitor::new("mock://b?price=90", None).with_price(90.0));
        store.save_user(&user).await.unwrap();
        store.save_product(&product).await.unwrap();

        let notifier = AlertNotifier::new(store.clone(), None, "noreply@example.com");
        let monitor = PriceMonitor::new(store.clone(), Arc::new(OfflinePriceFetcher), notifier)
            .with_pacer(Arc::new(NoDelay));
        Fixture {
            app: app(AppState::new(Arc::new(monitor))),
            store,
            user,
            product,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn healthz_reports_store_status() {
        let f = fixture().await;
        let (status, body) = call(&f.app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["users"], 1);
    }

    #[tokio::test]
    async fn suggestion_respects_margin_floor() {
        let f = fixture().await;
        let uri = format!("/api/users/{}/products/{}/suggestion", f.user.id, f.product.id);
        let (status, body) = call(&f.app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["strategy"], "match_lowest");
        assert_eq!(body["suggestion_price"], 80.0);
        assert_eq!(body["lowest_competitor_id"], f.product.competitors[0].id.to_string());
    }

    #[tokio::test]
    async fn check_now_updates_history_and_alerts() {
        let f = fixture().await;
        let uri = format!("/api/users/{}/products/{}/check-now", f.user.id, f.product.id);
        let (status, body) = call(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
        assert_eq!(body["alerts_triggered"], 1);

        let uri = format!("/api/users/{}/products/{}/history?days=7", f.user.id, f.product.id);
        let (status, body) = call(&f.app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let uri = format!(
            "/api/users/{}/products/{}/history?competitor_id={}",
            f.user.id, f.product.id, f.product.competitors[1].id
        );
        let (_, body) = call(&f.app, "GET", &uri, None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/api/users/{}/dashboard", f.user.id);
        let (_, dashboard) = call(&f.app, "GET", &uri, None).await;
        assert_eq!(dashboard["alerts_unread"], 1);
        assert_eq!(dashboard["products"][0]["competitors"][0]["current_price"], 70.0);

        let uri = format!("/api/users/{}/alerts", f.user.id);
        let (_, alerts) = call(&f.app, "GET", &uri, None).await;
        let alert_id = alerts[0]["id"].as_str().unwrap().to_string();
        assert_eq!(alerts[0]["kind"], "price_drop");

        let uri = format!("/api/users/{}/alerts/{alert_id}/read", f.user.id);
        let (status, body) = call(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_read"], true);
        assert_eq!(f.store.count_unread_alerts(f.user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scoped_and_full_runs_return_summaries() {
        let f = fixture().await;
        let uri = format!("/api/users/{}/check-now", f.user.id);
        let (status, body) = call(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["products_checked"], 1);
        assert_eq!(body["competitors_checked"], 2);

        let (status, body) = call(&f.app, "POST", "/api/sweep", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["products_total"], 1);
        assert_eq!(body["products_failed"].as_array().unwrap().len(), 0);

        let (status, _) = call(&f.app, "POST", "/api/digest", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_or_foreign_ids_are_not_found() {
        let f = fixture().await;
        let stranger = Uuid::new_v4();
        let uri = format!("/api/users/{stranger}/products/{}/check-now", f.product.id);
        let (status, body) = call(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let uri = format!("/api/users/{}/alerts/{}/read", f.user.id, Uuid::new_v4());
        let (status, _) = call(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&f.app, "GET", "/api/users/not-a-uuid/dashboard", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn busy_product_conflicts() {
        let store = Arc::new(MemoryRecordStore::new());
        let user = User::new("seller@example.com");
        let mut product = Product::new(user.id, "Tripod");
        product.add_competitor(Competitor::new("mock://a?price=1", None));
        store.save_user(&user).await.unwrap();
        store.save_product(&product).await.unwrap();
        let notifier = AlertNotifier::new(store.clone(), None, "noreply@example.com");
        let monitor = Arc::new(
            PriceMonitor::new(store, Arc::new(OfflinePriceFetcher), notifier)
                .with_pacer(Arc::new(NoDelay)),
        );
        let app = app(AppState::new(monitor.clone()));

        let _lease = monitor.guard().try_acquire(product.id).unwrap();
        let uri = format!("/api/users/{}/products/{}/check-now", user.id, product.id);
        let (status, _) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn preferences_are_validated() {
        let f = fixture().await;
        let uri = format!("/api/users/{}/preferences", f.user.id);
        let (status, body) = call(&f.app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["frequency"], "immediate");

        let (status, _) = call(
            &f.app,
            "PUT",
            &uri,
            Some(json!({ "email_enabled": true, "threshold_percent": -4, "frequency": "daily" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &f.app,
            "PUT",
            &uri,
            Some(json!({ "email_enabled": true, "threshold_percent": 4, "frequency": "weekly" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &f.app,
            "PUT",
            &uri,
            Some(json!({ "email_enabled": false, "threshold_percent": 2.5, "frequency": "daily" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["threshold_percent"], 2.5);
        let stored = f.store.get_user(f.user.id).await.unwrap().unwrap();
        assert!(!stored.alert_preferences.email_enabled);
    }

    #[tokio::test]
    async fn diagnostics_validate_listing_urls() {
        let f = fixture().await;
        let (status, _) = call(&f.app, "GET", "/api/diagnostics/fetch", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let foreign = "/api/diagnostics/fetch?url=https%3A%2F%2Fexample.com%2Fx";
        let (status, _) = call(&f.app, "GET", foreign, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mock = "/api/diagnostics/fetch?url=mock%3A%2F%2Fx%3Fprice%3D3.5";
        let (status, body) = call(&f.app, "GET", mock, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["price"], 3.5);
    }

    #[tokio::test]
    async fn test_email_without_transport_is_rejected() {
        let f = fixture().await;
        let uri = format!("/api/users/{}/alerts/test", f.user.id);
        let (status, body) = call(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "no mail transport configured");
    }
}
