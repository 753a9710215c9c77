use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Path, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::{
    domain::{self, DomainError},
    store::{SnapshotId, Store, StoreError},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    // Serializes read-modify-write sequences issued through this process.
    pub edit_lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match &value {
            StoreError::SnapshotNotFound { id } => {
                ApiError::not_found(value.to_string()).with_detail("id", id.clone())
            }
            StoreError::LockTimeout { attempts, .. } => {
                let attempts = *attempts;
                ApiError::unavailable(value.to_string()).with_detail("attempts", attempts)
            }
            StoreError::Io(_) => ApiError::internal(value.to_string()),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        match value.code() {
            "conflict" => ApiError::conflict(value.to_string()),
            "not_found" => ApiError::not_found(value.to_string()),
            _ => ApiError::invalid_request(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AddIpRequest {
    ip: String,
}

#[derive(Debug, Serialize)]
struct VersionSummary {
    id: String,
    created_at: String,
}

impl From<&SnapshotId> for VersionSummary {
    fn from(value: &SnapshotId) -> Self {
        Self {
            id: value.as_str().to_string(),
            created_at: value
                .created_at()
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

#[derive(Debug, Serialize)]
struct VersionDetail {
    #[serde(flatten)]
    summary: VersionSummary,
    items: Vec<String>,
}

pub fn build_router(store: Store) -> Router {
    let app_state = AppState {
        store,
        edit_lock: Arc::new(Mutex::new(())),
    };

    let api = Router::new()
        .route("/health", get(health))
        .route("/ips", get(list_ips).post(add_ip).put(replace_ips))
        .route("/ips/:ip", delete(delete_ip))
        .route("/versions", get(list_versions))
        .route("/versions/:version_id", get(get_version))
        .route("/versions/:version_id/restore", post(restore_version))
        .fallback(fallback_not_found);

    Router::new()
        .nest("/api", api)
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

/// Runs a blocking store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("store task failed: {e}")))?
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
    }))
}

async fn list_ips(
    Extension(state): Extension<AppState>,
) -> Result<Json<Items<String>>, ApiError> {
    let store = state.store.clone();
    let items = blocking(move || Ok(store.allowlist.load())).await?;
    Ok(Json(Items { items }))
}

async fn add_ip(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<AddIpRequest>,
) -> Result<(StatusCode, Json<Items<String>>), ApiError> {
    let _edit = state.edit_lock.lock().await;
    let store = state.store.clone();
    // Edits read with `try_load` so an unreadable list is never saved back as empty.
    let items = blocking(move || {
        let mut items = store.allowlist.try_load()?;
        domain::add_ip(&mut items, &req.ip)?;
        store.allowlist.save(&items)?;
        Ok(items)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(Items { items })))
}

async fn replace_ips(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<Items<String>>,
) -> Result<Json<Items<String>>, ApiError> {
    let items = domain::validate_list(&req.items)?;
    let _edit = state.edit_lock.lock().await;
    let store = state.store.clone();
    let items = blocking(move || {
        store.allowlist.save(&items)?;
        Ok(items)
    })
    .await?;
    Ok(Json(Items { items }))
}

async fn delete_ip(
    Extension(state): Extension<AppState>,
    Path(ip): Path<String>,
) -> Result<StatusCode, ApiError> {
    let _edit = state.edit_lock.lock().await;
    let store = state.store.clone();
    blocking(move || {
        let mut items = store.allowlist.try_load()?;
        domain::remove_ip(&mut items, &ip)?;
        store.allowlist.save(&items)?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_versions(
    Extension(state): Extension<AppState>,
) -> Result<Json<Items<VersionSummary>>, ApiError> {
    let store = state.store.clone();
    let ids = blocking(move || Ok(store.snapshots.list()?)).await?;
    Ok(Json(Items {
        items: ids.iter().map(VersionSummary::from).collect(),
    }))
}

async fn get_version(
    Extension(state): Extension<AppState>,
    Path(version_id): Path<String>,
) -> Result<Json<VersionDetail>, ApiError> {
    let store = state.store.clone();
    let (id, items) = blocking(move || {
        let id = store.snapshots.get(&version_id)?;
        let items = store.snapshots.read(id.as_str())?;
        Ok((id, items))
    })
    .await?;
    Ok(Json(VersionDetail {
        summary: VersionSummary::from(&id),
        items,
    }))
}

async fn restore_version(
    Extension(state): Extension<AppState>,
    Path(version_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let _edit = state.edit_lock.lock().await;
    let store = state.store.clone();
    blocking(move || {
        store.snapshots.restore(&version_id)?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
