use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use nodelease_common::{NodeError, TemplateConfig};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cloud::CloudRegistry;
use crate::lifecycle::NodeLifecycleManager;
use crate::logger::ActionLogger;
use crate::node::Node;
use crate::provisioning::{PendingNode, ProvisioningScheduler};
use crate::template::Template;

pub struct AppState {
    pub clouds: Arc<CloudRegistry>,
    pub scheduler: Arc<ProvisioningScheduler>,
    pub lifecycle: Arc<NodeLifecycleManager>,
    pub logger: Arc<ActionLogger>,
    pub cancel: CancellationToken,
}

pub struct ApiError(NodeError);

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NodeError::TemplateNotFound(_)
            | NodeError::InstanceNotFound(_)
            | NodeError::CloudNotFound(_)
            | NodeError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            NodeError::InvalidTemplate(_) | NodeError::InvalidLabelExpression(_) => StatusCode::BAD_REQUEST,
            NodeError::InvalidTransition { .. } | NodeError::NodeTerminated(_) => StatusCode::CONFLICT,
            NodeError::AuthenticationFailure(_) => StatusCode::BAD_GATEWAY,
            NodeError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/admin/nodes", get(list_nodes))
        .route("/admin/actions", get(list_actions))
        .route(
            "/admin/clouds/{cloud_id}/templates",
            get(list_templates).post(add_template),
        )
        .route("/admin/clouds/{cloud_id}/templates/{template_id}", get(get_template))
        .route("/admin/clouds/{cloud_id}/test", post(test_connection))
        .route("/admin/provision", post(provision))
        .route("/admin/attach", post(attach))
        .route("/admin/nodes/{node_id}/terminate", post(terminate_node))
        .route("/admin/nodes/{node_id}/busy", post(mark_busy))
        .route("/admin/nodes/{node_id}/idle", post(mark_idle))
        .with_state(state)
}

async fn root() -> &'static str {
    "Nodelease Orchestrator Online"
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut by_state: BTreeMap<&'static str, usize> = BTreeMap::new();
    for node in state.lifecycle.nodes().list().await {
        *by_state.entry(node.state().await.as_str()).or_default() += 1;
    }
    let clouds: Vec<_> = state
        .clouds
        .list()
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "provider": c.provider.provider_code(),
                "region": c.region,
                "instance_cap": c.instance_cap,
                "in_flight": c.in_flight(),
                "templates": c.templates.len(),
            })
        })
        .collect();

    Json(json!({
        "clouds": clouds,
        "nodes": by_state,
        "workers_available": state.scheduler.available_workers(),
    }))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut views = Vec::new();
    for node in state.lifecycle.nodes().list().await {
        views.push(node.view().await);
    }
    Json(views)
}

#[derive(Deserialize, Debug)]
struct ActionsQuery {
    limit: Option<usize>,
    node_id: Option<String>,
}

async fn list_actions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ActionsQuery>,
) -> impl IntoResponse {
    let entries = match q.node_id {
        Some(node_id) => state.logger.for_node(&node_id),
        None => state.logger.recent(q.limit.unwrap_or(100)),
    };
    Json(entries)
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
    Path(cloud_id): Path<String>,
) -> ApiResult<Json<Vec<Template>>> {
    let cloud = state.clouds.get(&cloud_id)?;
    Ok(Json(
        cloud
            .templates
            .list()
            .iter()
            .map(|t| t.as_ref().clone())
            .collect(),
    ))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path((cloud_id, template_id)): Path<(String, String)>,
) -> ApiResult<Json<Template>> {
    let cloud = state.clouds.get(&cloud_id)?;
    let template = cloud
        .templates
        .by_id(&template_id)
        .ok_or(NodeError::TemplateNotFound(template_id))?;
    Ok(Json(template.as_ref().clone()))
}

/// Image and flavor must resolve against the provider catalog before the
/// template is accepted.
async fn add_template(
    State(state): State<Arc<AppState>>,
    Path(cloud_id): Path<String>,
    Json(cfg): Json<TemplateConfig>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let cloud = state.clouds.get(&cloud_id)?;
    let template = Template::from_config(cfg)?;
    let (image_ref, flavor_ref) = cloud.validate_template(&template).await?;
    let template = cloud.templates.add(template)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "template": template.as_ref(),
            "image_ref": image_ref,
            "flavor_ref": flavor_ref,
        })),
    ))
}

async fn test_connection(
    State(state): State<Arc<AppState>>,
    Path(cloud_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cloud = state.clouds.get(&cloud_id)?;
    cloud.provider.authenticate().await?;
    Ok(Json(json!({ "ok": true, "cloud_id": cloud.id })))
}

#[derive(Deserialize, Debug)]
struct ProvisionRequest {
    cloud_id: Option<String>,
    label: Option<String>,
    template_id: Option<String>,
    count: Option<u32>,
}

fn pending_summary(pending: &[PendingNode]) -> serde_json::Value {
    json!({
        "accepted": pending.len(),
        "pending": pending
            .iter()
            .map(|p| json!({
                "cloud_id": p.cloud_id,
                "template_id": p.template_id,
                "executors": p.executors,
            }))
            .collect::<Vec<_>>(),
    })
}

/// Accepted units keep running after the response; their outcome shows up in
/// `/admin/nodes` and `/admin/actions`.
async fn provision(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let pending = match (&req.cloud_id, &req.template_id, &req.label) {
        (Some(cloud_id), Some(template_id), _) => state
            .scheduler
            .provision_template(cloud_id, template_id)
            .await?
            .into_iter()
            .collect::<Vec<_>>(),
        (Some(cloud_id), None, Some(label)) => {
            state
                .scheduler
                .provision(cloud_id, label, req.count.unwrap_or(1))
                .await?
        }
        (None, None, Some(label)) => {
            state
                .scheduler
                .provision_any(label, req.count.unwrap_or(1))
                .await?
        }
        _ => {
            return Err(NodeError::InvalidLabelExpression(
                "provide a label, or a cloud_id with a template_id".to_string(),
            )
            .into())
        }
    };
    Ok((StatusCode::ACCEPTED, Json(pending_summary(&pending))))
}

#[derive(Deserialize, Debug)]
struct AttachRequest {
    cloud_id: String,
    instance_id: String,
}

/// 201 for a newly attached instance, 200 when it already had a node.
async fn attach(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AttachRequest>,
) -> ApiResult<(StatusCode, Json<crate::node::NodeView>)> {
    let cloud = state.clouds.get(&req.cloud_id)?;
    let attached = state.lifecycle.attach(&cloud, &req.instance_id).await?;
    if !attached.inserted {
        return Ok((StatusCode::OK, Json(attached.node.view().await)));
    }

    let lifecycle = state.lifecycle.clone();
    let cancel = state.cancel.clone();
    let background = attached.node.clone();
    tokio::spawn(async move {
        if let Err(e) = lifecycle.activate(&background, &cancel).await {
            warn!(node = %background.id, error = %e, "[api] attached node failed to come online");
        }
    });

    Ok((StatusCode::CREATED, Json(attached.node.view().await)))
}

async fn find_node(state: &AppState, node_id: &str) -> ApiResult<Arc<Node>> {
    state
        .lifecycle
        .nodes()
        .get(node_id)
        .await
        .ok_or_else(|| NodeError::NodeNotFound(node_id.to_string()).into())
}

async fn terminate_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = find_node(&state, &node_id).await?;
    state.lifecycle.terminate(&node).await?;
    Ok(Json(json!({ "node_id": node.id, "state": node.state().await })))
}

async fn mark_busy(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = find_node(&state, &node_id).await?;
    node.mark_busy().await?;
    Ok(Json(json!({ "node_id": node.id, "state": node.state().await })))
}

async fn mark_idle(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = find_node(&state, &node_id).await?;
    node.mark_idle().await?;
    Ok(Json(json!({ "node_id": node.id, "state": node.state().await })))
}
