use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use dmf_core::demo::demo_warehouse;
use dmf_core::{sql_api_warehouse, ActionReport, ConsoleView, DmfConsole, LoadError, UnfilteredReport};
use dmf_settings::{init_tracing, ConsoleSettings};
use dmf_store::Warehouse;
use dmf_types::{ActionKind, NaturalKey, ReconciledRow};

type ApiError = (StatusCode, String);

#[derive(Clone)]
struct AppState {
    console: Arc<DmfConsole>,
    /// One batch at a time; the caches assume a single writer.
    actions: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    config_table: String,
    nothing_configured: bool,
    pending: usize,
    applied: usize,
    rows: Vec<ReconciledRow>,
    ambiguous_keys: Vec<(NaturalKey, usize)>,
}

impl From<&ConsoleView> for StatusResponse {
    fn from(view: &ConsoleView) -> Self {
        Self {
            config_table: view.config_table.clone(),
            nothing_configured: view.is_empty(),
            pending: view.queue(ActionKind::Add).len(),
            applied: view.queue(ActionKind::Drop).len(),
            rows: view.rows().to_vec(),
            ambiguous_keys: view.ambiguous_keys.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelectionRequest {
    /// Rows to act on, in the order the calls should be made.
    keys: Vec<NaturalKey>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_path = std::env::var("DMF_SETTINGS").ok().map(PathBuf::from);
    let settings = ConsoleSettings::load(settings_path.as_deref())?;
    init_tracing(&settings.log_level, std::io::stdout)?;

    let use_demo = std::env::var("DMF_DEMO")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);
    let warehouse: Arc<dyn Warehouse> = if use_demo {
        tracing::info!("using seeded in-memory warehouse");
        demo_warehouse(&settings.config_table).await
    } else {
        sql_api_warehouse(&settings)?
    };
    let console = Arc::new(DmfConsole::new(warehouse, &settings)?);

    let app = app(AppState {
        console,
        actions: Arc::new(Mutex::new(())),
    });

    let addr: SocketAddr = settings.http_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, config_table = %settings.config_table, "DMF console listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/refresh", post(refresh))
        .route("/v1/queues/:action", get(queue))
        .route("/v1/actions/:action", post(run_action))
        .route("/v1/actions/:action/all", post(run_unfiltered))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn parse_action(raw: &str) -> Result<ActionKind, ApiError> {
    raw.parse().map_err(|e: dmf_types::ParseActionError| (StatusCode::NOT_FOUND, e.to_string()))
}

fn load_failed(e: LoadError) -> ApiError {
    (StatusCode::BAD_GATEWAY, e.to_string())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let view = state.console.view().await.map_err(load_failed)?;
    Ok(Json(StatusResponse::from(&view)))
}

async fn refresh(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let view = state.console.refresh().await.map_err(load_failed)?;
    Ok(Json(StatusResponse::from(&view)))
}

async fn queue(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<Vec<ReconciledRow>>, ApiError> {
    let action = parse_action(&action)?;
    let view = state.console.view().await.map_err(load_failed)?;
    Ok(Json(view.queue(action).into_iter().cloned().collect()))
}

async fn run_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(req): Json<SelectionRequest>,
) -> Result<Json<ActionReport>, ApiError> {
    let action = parse_action(&action)?;
    if req.keys.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "select at least one row".into()));
    }

    let _batch = state.actions.lock().await;
    let view = state.console.view().await.map_err(load_failed)?;
    let selection = view
        .select_keys(action, &req.keys)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    Ok(Json(state.console.run_action(action, &selection).await))
}

async fn run_unfiltered(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<UnfilteredReport>, ApiError> {
    let action = parse_action(&action)?;
    let _batch = state.actions.lock().await;
    Ok(Json(state.console.run_unfiltered(action).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use dmf_types::FilterCondition;
    use tower::ServiceExt;

    async fn demo_app() -> (Arc<dmf_store::InMemoryWarehouse>, Router) {
        let settings = ConsoleSettings::default();
        let wh = demo_warehouse(&settings.config_table).await;
        let console = DmfConsole::new(wh.clone(), &settings).unwrap();
        let app = app(AppState {
            console: Arc::new(console),
            actions: Arc::new(Mutex::new(())),
        });
        (wh, app)
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_lists_every_active_row() {
        let (_, app) = demo_app().await;
        let (code, body) = call(app, Request::get("/v1/status").body(Body::empty()).unwrap()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["nothing_configured"], false);
        assert_eq!(body["rows"].as_array().unwrap().len(), 5);
        assert_eq!(body["pending"], 3);
        assert_eq!(body["applied"], 2);
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let (_, app) = demo_app().await;
        let (code, _) = call(app, Request::get("/v1/queues/truncate").body(Body::empty()).unwrap()).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_by_key_reports_each_row() {
        let (wh, app) = demo_app().await;
        wh.fail_calls_matching(
            FilterCondition::new("ORDERS", "SNOWFLAKE.CORE.DUPLICATE_COUNT"),
            "denied",
        )
        .await;

        let body = serde_json::json!({
            "keys": [
                { "full_table_id": "DEMO.SALES.ORDERS", "dmf_short_name": "NULL_COUNT", "column_names": "CUSTOMER_ID" },
                { "full_table_id": "DEMO.SALES.ORDERS", "dmf_short_name": "DUPLICATE_COUNT", "column_names": "ORDER_ID" }
            ]
        });
        let (code, report) = call(app, post_json("/v1/actions/add", body)).await;
        assert_eq!(code, StatusCode::OK);

        let results = report["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0]["outcome"].get("Ok").is_some());
        assert!(results[1]["outcome"].get("Err").is_some());
        assert!(report["view"].is_object());
    }

    #[tokio::test]
    async fn selecting_row_outside_queue_is_rejected() {
        let (wh, app) = demo_app().await;
        let body = serde_json::json!({
            "keys": [{ "full_table_id": "DEMO.SALES.ORDERS", "dmf_short_name": "ROW_COUNT", "column_names": "" }]
        });
        let (code, _) = call(app, post_json("/v1/actions/add", body)).await;
        assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(wh.calls().await.is_empty());
    }

    #[tokio::test]
    async fn empty_selection_is_bad_request() {
        let (_, app) = demo_app().await;
        let (code, _) = call(app, post_json("/v1/actions/validate", serde_json::json!({ "keys": [] }))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }
}
