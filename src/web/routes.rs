//! HTTP handlers over the stats service

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{IfModifiedSince, LastModified},
    TypedHeader,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::events::{RefreshKind, RefreshRequest};
use crate::models::{Server, SourceCategory};
use crate::service::{AdvancedQuery, Cached};

fn default_server() -> Server {
    Server::CN
}

#[derive(Debug, Deserialize)]
pub struct MatrixParams {
    #[serde(default = "default_server")]
    pub server: Server,
    #[serde(default)]
    pub is_personal: bool,
    #[serde(default)]
    pub show_closed_zones: bool,
    #[serde(default, rename = "stageFilter")]
    pub stage_filter: Option<String>,
    #[serde(default, rename = "itemFilter")]
    pub item_filter: Option<String>,
    #[serde(default)]
    pub source_category: Option<SourceCategory>,
}

#[derive(Debug, Deserialize)]
pub struct PatternParams {
    #[serde(default = "default_server")]
    pub server: Server,
    #[serde(default)]
    pub is_personal: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServerParams {
    #[serde(default = "default_server")]
    pub server: Server,
}

#[derive(Debug, Deserialize)]
pub struct AdvancedBody {
    pub queries: Vec<AdvancedQuery>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeBody {
    pub name: String,
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub name: &'static str,
    /// Keys removed; a single-key purge reports 1 whether or not it existed.
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub kind: &'static str,
    pub server: Server,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> AppResult<T> {
    params.map(|Query(p)| p).map_err(|e| AppError::invalid(e.body_text()))
}

/// The id of an `Authorization: PenguinID <id>` header
fn penguin_id(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let id = value.strip_prefix("PenguinID ")?.trim();
    (!id.is_empty()).then_some(id)
}

async fn account_id(state: &AppState, headers: &HeaderMap, is_personal: bool) -> AppResult<Option<i32>> {
    if !is_personal {
        return Ok(None);
    }
    let penguin_id = penguin_id(headers).ok_or(AppError::Unauthorized)?;
    state.service.resolve_account(penguin_id).await.map(Some)
}

/// JSON body with `Last-Modified`, or 304 when the client copy is current.
fn cached_response<T: Serialize>(cached: Cached<T>, since: Option<TypedHeader<IfModifiedSince>>) -> Response {
    let Some(at) = cached.last_modified else {
        return Json(cached.value).into_response();
    };
    let at = SystemTime::from(at);
    if let Some(TypedHeader(since)) = since {
        if !since.is_modified(at) {
            return (StatusCode::NOT_MODIFIED, TypedHeader(LastModified::from(at))).into_response();
        }
    }
    (TypedHeader(LastModified::from(at)), Json(cached.value)).into_response()
}

pub async fn result_matrix(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    since: Option<TypedHeader<IfModifiedSince>>,
    params: Result<Query<MatrixParams>, QueryRejection>,
) -> AppResult<Response> {
    let params = query_params(params)?;
    let account_id = account_id(&state, &headers, params.is_personal).await?;
    let result = state
        .service
        .get_shim_max_accumulable_drop_matrix_results(
            params.server,
            params.show_closed_zones,
            params.source_category.unwrap_or(SourceCategory::All),
            account_id,
            params.stage_filter.as_deref(),
            params.item_filter.as_deref(),
        )
        .await?;
    Ok(cached_response(result, since))
}

pub async fn result_pattern(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    since: Option<TypedHeader<IfModifiedSince>>,
    params: Result<Query<PatternParams>, QueryRejection>,
) -> AppResult<Response> {
    let params = query_params(params)?;
    let account_id = account_id(&state, &headers, params.is_personal).await?;
    let result = state
        .service
        .get_shim_latest_pattern_matrix_results(params.server, account_id)
        .await?;
    Ok(cached_response(result, since))
}

pub async fn result_trends(
    State(state): State<Arc<AppState>>,
    since: Option<TypedHeader<IfModifiedSince>>,
    params: Result<Query<ServerParams>, QueryRejection>,
) -> AppResult<Response> {
    let params = query_params(params)?;
    let result = state.service.get_shim_trend(params.server).await?;
    Ok(cached_response(result, since))
}

pub async fn result_advanced(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<AdvancedBody>, JsonRejection>,
) -> AppResult<Response> {
    let Json(body) = body.map_err(|e| AppError::invalid(e.body_text()))?;
    let wants_personal = body.queries.iter().any(|q| q.is_personal);
    let account_id = match penguin_id(&headers) {
        Some(penguin_id) if wants_personal => Some(state.service.resolve_account(penguin_id).await?),
        _ => None,
    };
    let result = state.service.get_shim_advanced_results(&body.queries, account_id).await?;
    Ok(Json(result).into_response())
}

pub async fn site_stats(
    State(state): State<Arc<AppState>>,
    since: Option<TypedHeader<IfModifiedSince>>,
    params: Result<Query<ServerParams>, QueryRejection>,
) -> AppResult<Response> {
    let params = query_params(params)?;
    let result = state.service.get_shim_site_stats(params.server).await?;
    Ok(cached_response(result, since))
}

pub async fn health(State(state): State<Arc<AppState>>) -> AppResult<Json<HealthResponse>> {
    state
        .service
        .db()
        .ping()
        .await
        .map_err(|e| AppError::UpstreamUnavailable(format!("postgres: {}", e)))?;
    state
        .service
        .caches()
        .backend
        .ping()
        .await
        .map_err(|e| AppError::UpstreamUnavailable(format!("redis: {}", e)))?;
    Ok(Json(HealthResponse { status: "ok" }))
}

pub async fn admin_refresh(
    State(state): State<Arc<AppState>>,
    Path((kind, server)): Path<(String, String)>,
) -> AppResult<Json<RefreshResponse>> {
    let kind: RefreshKind = kind.parse().map_err(|e: crate::events::ParseRefreshKindError| AppError::invalid(e.to_string()))?;
    let server: Server = server.parse()?;

    if !state.refresh.publish(RefreshRequest { kind, server }) {
        return Err(AppError::UpstreamUnavailable("calculation worker is not running".to_string()));
    }
    info!(server = %server, kind = %kind, "Refresh request published");
    Ok(Json(RefreshResponse {
        kind: kind.as_str(),
        server,
        status: "accepted",
    }))
}

pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
    body: Result<Json<PurgeBody>, JsonRejection>,
) -> AppResult<Json<PurgeResponse>> {
    let Json(body) = body.map_err(|e| AppError::invalid(e.body_text()))?;
    let cache = state
        .service
        .caches()
        .find(&body.name)
        .ok_or_else(|| AppError::NotFound(format!("unknown cache '{}'", body.name)))?;

    let removed = match body.key.as_deref() {
        Some(key) => {
            cache.delete_key(key).await?;
            1
        }
        None => cache.clear().await?,
    };
    info!(cache = cache.name(), key = ?body.key, "Purged {} cache entries", removed);
    Ok(Json(PurgeResponse {
        name: cache.name(),
        removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::{TimeZone, Utc};

    #[test]
    fn penguin_id_is_read_from_authorization() {
        let mut headers = HeaderMap::new();
        assert_eq!(penguin_id(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("PenguinID 10042"));
        assert_eq!(penguin_id(&headers), Some("10042"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(penguin_id(&headers), None);
    }

    #[test]
    fn uncached_results_carry_no_last_modified() {
        let response = cached_response(Cached::fresh(vec![1, 2]), None);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("last-modified").is_none());
    }

    #[test]
    fn current_client_copy_gets_not_modified() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cached = || Cached {
            value: "x",
            last_modified: Some(at),
        };

        let fresh = cached_response(cached(), None);
        assert_eq!(fresh.status(), StatusCode::OK);
        assert_eq!(fresh.headers()["last-modified"], "Wed, 01 May 2024 12:00:00 GMT");

        let later = SystemTime::from(at + chrono::Duration::minutes(5));
        let since = TypedHeader(IfModifiedSince::from(later));
        assert_eq!(cached_response(cached(), Some(since)).status(), StatusCode::NOT_MODIFIED);

        let earlier = SystemTime::from(at - chrono::Duration::minutes(5));
        let since = TypedHeader(IfModifiedSince::from(earlier));
        assert_eq!(cached_response(cached(), Some(since)).status(), StatusCode::OK);
    }
}
