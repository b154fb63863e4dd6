//! REST API handlers for node management and subscriptions.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{ConfigHistory, PortAllocation, Store, StoreError};
use crate::engine::{EngineConfig, GenerateOptions, ValidationResult};
use crate::node::{CreateNodeRequest, NodeError, NodeService, NodeView, UpdateNodeRequest};
use crate::port::{PortError, PortMetrics};
use crate::subscribe::{self, Format};
use crate::sync::{NodeStatus, NodeSyncService};

const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub nodes: Arc<NodeService>,
    pub sync: Arc<NodeSyncService>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ProtocolInfo {
    pub protocol: String,
    pub required: Vec<&'static str>,
    pub optional: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct NodeConfigResponse {
    pub node_id: i64,
    pub validation: ValidationResult,
    pub config: EngineConfig,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: i64,
    pub released_ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub format: Option<String>,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e),
        _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn node_error(e: NodeError) -> ApiError {
    let status = match &e {
        NodeError::NotFound(_) => StatusCode::NOT_FOUND,
        NodeError::Param(_) | NodeError::Invalid(_) | NodeError::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        NodeError::Port(PortError::OutOfRange { .. }) => StatusCode::BAD_REQUEST,
        NodeError::Port(PortError::PortConflict { .. })
        | NodeError::Port(PortError::PortExhaustion { .. })
        | NodeError::Port(PortError::Unavailable { .. }) => StatusCode::CONFLICT,
        NodeError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

fn view(node: &crate::db::Node) -> Result<NodeView, ApiError> {
    NodeView::try_from(node).map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/protocols", get(list_protocols))
        .route("/v1/ports", get(list_ports))
        .route("/v1/ports/metrics", get(port_metrics))
        .route("/v1/ports/{port}/history", get(port_history))
        .route("/v1/nodes", get(list_nodes).post(create_node))
        .route(
            "/v1/nodes/{id}",
            get(get_node).patch(update_node).delete(delete_node),
        )
        .route("/v1/nodes/{id}/config", get(node_config))
        .route("/v1/nodes/{id}/history", get(node_history))
        .route("/v1/nodes/{id}/status", get(node_status))
        .route("/v1/config/validate", post(validate_config))
        .route("/v1/subscribe/{token}", get(subscribe))
        .with_state(Arc::new(state))
}

/// Health check endpoint (no auth required).
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_protocols(State(state): State<Arc<AppState>>) -> Json<Vec<ProtocolInfo>> {
    let registry = state.nodes.registry();
    let protocols = registry
        .supported_protocols()
        .into_iter()
        .filter_map(|name| {
            let adapter = registry.get(&name)?;
            Some(ProtocolInfo {
                protocol: name,
                required: adapter.required_params().to_vec(),
                optional: adapter.optional_params().to_vec(),
            })
        })
        .collect();
    Json(protocols)
}

async fn list_ports(State(state): State<Arc<AppState>>) -> Json<Vec<PortAllocation>> {
    Json(state.nodes.allocator().allocations().await)
}

async fn port_metrics(State(state): State<Arc<AppState>>) -> Json<PortMetrics> {
    Json(state.nodes.allocator().metrics().await)
}

async fn port_history(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<PortAllocation>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let history = state.store.port_history(port, limit).await.map_err(store_error)?;
    Ok(Json(history))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Result<Json<Vec<NodeView>>, ApiError> {
    let nodes = state.nodes.list_nodes().await.map_err(node_error)?;
    let views = nodes.iter().map(view).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(views))
}

async fn create_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<NodeView>), ApiError> {
    let node = state.nodes.create_node(request).await.map_err(node_error)?;
    info!(node_id = node.id, "Node created via API");
    Ok((StatusCode::CREATED, Json(view(&node)?)))
}

async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<NodeView>, ApiError> {
    let node = state.nodes.get_node(id).await.map_err(node_error)?;
    Ok(Json(view(&node)?))
}

async fn update_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateNodeRequest>,
) -> Result<Json<NodeView>, ApiError> {
    let node = state.nodes.update_node(id, request).await.map_err(node_error)?;
    Ok(Json(view(&node)?))
}

async fn delete_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let released_ports = state.nodes.delete_node(id).await.map_err(node_error)?;
    Ok(Json(DeleteResponse {
        deleted: id,
        released_ports,
    }))
}

async fn node_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<NodeConfigResponse>, ApiError> {
    let generated = state.nodes.node_config(id).await.map_err(node_error)?;
    Ok(Json(NodeConfigResponse {
        node_id: id,
        validation: generated.validation,
        config: generated.config,
    }))
}

async fn node_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ConfigHistory>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let history = state.nodes.config_history(id, limit).await.map_err(node_error)?;
    Ok(Json(history))
}

async fn node_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<NodeStatus>, ApiError> {
    let node = state.nodes.get_node(id).await.map_err(node_error)?;
    Ok(Json(state.sync.node_status(&node).await))
}

async fn validate_config(
    State(state): State<Arc<AppState>>,
    Json(document): Json<Value>,
) -> Json<ValidationResult> {
    Json(state.nodes.generator().validator().validate_json(&document))
}

/// Subscription endpoint. The token identifies the user.
async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .store
        .get_user_by_token(&token)
        .await
        .map_err(store_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown subscription token"))?;

    if !user.is_eligible(Utc::now()) {
        warn!(user_id = user.id, "Subscription fetch by ineligible user");
        return Err(api_error(StatusCode::FORBIDDEN, "subscription is not active"));
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let format = Format::select(query.format.as_deref(), user_agent);

    let nodes = state.store.list_nodes().await.map_err(store_error)?;
    let servers = subscribe::servers_for_user(&nodes, &user);
    let options = GenerateOptions::from(&state.config.generator);
    let rendered = subscribe::render(format, &servers, &user, &options)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    info!(user_id = user.id, format = %format, servers = servers.len(), "Served subscription");

    let headers = [
        (header::CONTENT_TYPE, rendered.content_type.to_string()),
        (
            HeaderName::from_static("subscription-userinfo"),
            subscribe::subscription_userinfo(&user),
        ),
        (
            HeaderName::from_static("profile-update-interval"),
            state.config.subscription.update_interval_hours.to_string(),
        ),
    ];
    Ok((headers, rendered.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::db::store::testing::temp_store;
    use crate::db::NewUser;
    use crate::port::{PortAllocator, PortHold, PortProbe};
    use crate::protocol::AdapterRegistry;
    use crate::sync::AgentClient;
    use axum::http::HeaderValue;
    use serde_json::json;
    use std::io;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FreeProbe;

    impl PortProbe for FreeProbe {
        fn acquire(&self, _port: u16) -> io::Result<PortHold> {
            Ok(PortHold::empty())
        }
    }

    async fn state() -> (Arc<AppState>, TempDir) {
        let (store, dir) = temp_store().await;
        let store = Arc::new(store);
        let config = Config::default();
        let range = PortConfig {
            start: 30000,
            end: 30001,
            ..Default::default()
        };
        let allocator = Arc::new(PortAllocator::new(range, store.clone(), Arc::new(FreeProbe)));
        let nodes = Arc::new(NodeService::new(
            store.clone(),
            allocator,
            Arc::new(AdapterRegistry::with_defaults()),
            GenerateOptions::default(),
        ));
        let agent = Arc::new(AgentClient::new(Duration::from_secs(1)).unwrap());
        let sync = Arc::new(NodeSyncService::new(store.clone(), agent, config.node.clone()));
        let state = AppState {
            config,
            store,
            nodes,
            sync,
        };
        (Arc::new(state), dir)
    }

    fn create_request(name: &str, params: Value) -> CreateNodeRequest {
        serde_json::from_value(json!({
            "name": name,
            "host": "node.example.com",
            "protocol": "trojan",
            "params": params,
            "group_ids": [1],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_fetch_node() {
        let (state, _dir) = state().await;
        let (status, Json(created)) = create_node(
            State(state.clone()),
            Json(create_request("t1", json!({"password": "pw"}))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.port, 30000);

        let Json(fetched) = get_node(State(state.clone()), Path(created.id)).await.unwrap();
        assert_eq!(fetched.name, "t1");
        assert_eq!(fetched.params["tls"]["enabled"], json!(true));

        let Json(config) = node_config(State(state), Path(created.id)).await.unwrap();
        assert!(config.validation.valid);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (state, _dir) = state().await;

        let (status, _) = create_node(State(state.clone()), Json(create_request("bad", json!({}))))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_node(State(state.clone()), Path(99)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        for name in ["a", "b"] {
            create_node(State(state.clone()), Json(create_request(name, json!({"password": "pw"}))))
                .await
                .unwrap();
        }
        let (status, Json(body)) = create_node(
            State(state.clone()),
            Json(create_request("c", json!({"password": "pw"}))),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.error.contains("no available ports in range 30000-30001"));
    }

    #[tokio::test]
    async fn test_subscription_access() {
        let (state, _dir) = state().await;
        create_node(State(state.clone()), Json(create_request("t1", json!({"password": "pw"}))))
            .await
            .unwrap();
        let new = NewUser {
            group_id: Some(1),
            ..Default::default()
        };
        let (token, user) = state.store.create_user(&new).await.unwrap();

        let err = subscribe(
            State(state.clone()),
            Path("nope".to_string()),
            Query(SubscribeQuery { format: None }),
            HeaderMap::new(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("ClashForAndroid/2.5"));
        let response = subscribe(
            State(state.clone()),
            Path(token.clone()),
            Query(SubscribeQuery { format: None }),
            headers,
        )
        .await
        .ok()
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/yaml"));
        assert!(response.headers().contains_key("subscription-userinfo"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("name: t1"), "{}", body);

        state.store.set_user_banned(user.id, true).await.unwrap();
        let err = subscribe(
            State(state),
            Path(token),
            Query(SubscribeQuery { format: None }),
            HeaderMap::new(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_validate_endpoint_reports_duplicates() {
        let (state, _dir) = state().await;
        let document = json!({
            "outbounds": [
                {"type": "direct", "tag": "proxy1"},
                {"type": "direct", "tag": "proxy1"}
            ]
        });
        let Json(result) = validate_config(State(state), Json(document)).await;
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.message.contains("outbounds[0]")));
    }
}
