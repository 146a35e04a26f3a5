//! HTTP surface: result endpoints, site stats, health and admin triggers

mod middleware;
mod routes;

use anyhow::Result;
use axum::{
    http::header::LAST_MODIFIED,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::config::ServerConfig;
use crate::events::RefreshBus;
use crate::service::StatsService;

use middleware::AdminAuthLayer;

pub struct AppState {
    pub service: Arc<StatsService>,
    pub refresh: RefreshBus,
    pub admin_key: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/refresh/:kind/:server", post(routes::admin_refresh))
        .route("/cache/purge", post(routes::admin_purge))
        .layer(AdminAuthLayer::new(&state.admin_key));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([LAST_MODIFIED]);

    Router::new()
        .route("/result/matrix", get(routes::result_matrix))
        .route("/result/pattern", get(routes::result_pattern))
        .route("/result/trends", get(routes::result_trends))
        .route("/result/advanced", post(routes::result_advanced))
        .route("/stats", get(routes::site_stats))
        .route("/health", get(routes::health))
        .nest("/admin", admin)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` flips to true, then drain in-flight requests.
pub async fn start_server(config: &ServerConfig, state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.http_port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Web server draining connections");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RefreshKind, RefreshRequest};
    use crate::models::shim::ShimTrendQueryResult;
    use crate::models::{Item, Server, Stage};
    use crate::service::test_support;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn state() -> (Arc<AppState>, broadcast::Sender<RefreshRequest>) {
        let (tx, _) = broadcast::channel(8);
        let state = Arc::new(AppState {
            service: Arc::new(test_support::service()),
            refresh: RefreshBus::new(tx.clone()),
            admin_key: "secret".to_string(),
        });
        (state, tx)
    }

    async fn seed_game_data(state: &AppState) {
        let caches = state.service.caches();
        caches
            .stages
            .set(
                &caches.stages.key(&[]),
                &vec![Stage { stage_id: 1, ark_stage_id: "main_01-07".into(), zone_id: 1 }],
            )
            .await
            .unwrap();
        caches
            .items
            .set(&caches.items.key(&[]), &vec![Item { item_id: 10, ark_item_id: "30012".into() }])
            .await
            .unwrap();
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn sub_hour_interval_is_rejected() {
        let (state, _tx) = state();
        let request = post_json(
            "/result/advanced",
            serde_json::json!({"queries": [{
                "server": "CN",
                "stageId": "main_01-07",
                "itemIds": ["30012"],
                "start": 1_700_000_000_000i64,
                "interval": 30 * 60 * 1000
            }]}),
        );
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "INVALID_REQUEST");
        assert_eq!(body["message"], "interval length must be greater than 1 hour");
    }

    #[tokio::test]
    async fn oversized_intervals_are_rejected() {
        let (state, _tx) = state();
        seed_game_data(&state).await;
        let app = router(state);
        for interval in [i64::MAX, 9_000_000_000_000_000i64] {
            let request = post_json(
                "/result/advanced",
                serde_json::json!({"queries": [{
                    "server": "CN",
                    "stageId": "main_01-07",
                    "itemIds": ["30012"],
                    "start": 1_700_000_000_000i64,
                    "interval": interval
                }]}),
            );
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert_eq!(body["code"], "INVALID_REQUEST");
            assert_eq!(body["message"], "interval length must not exceed 3660 days");
        }
    }

    #[tokio::test]
    async fn too_many_advanced_queries_are_rejected() {
        let (state, _tx) = state();
        let query = serde_json::json!({"server": "CN", "stageId": "main_01-07", "start": 1_700_000_000_000i64});
        let request = post_json("/result/advanced", serde_json::json!({"queries": vec![query; 6]}));
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_server_is_invalid() {
        let (state, _tx) = state();
        let request = Request::builder().uri("/result/matrix?server=EU").body(Body::empty()).unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn personal_results_need_a_penguin_id() {
        let (state, _tx) = state();
        let request = Request::builder()
            .uri("/result/pattern?server=US&is_personal=true")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cached_trend_is_served_with_last_modified() {
        let (state, _tx) = state();
        seed_game_data(&state).await;
        let caches = state.service.caches();
        let key = caches.shim_trend.key(&["JP"]);
        let trend = ShimTrendQueryResult {
            interval: 86_400_000,
            trend: BTreeMap::new(),
        };
        caches.shim_trend.set(&key, &trend).await.unwrap();
        caches
            .last_modified
            .set(&key, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
            .await;

        let app = router(state.clone());
        let request = Request::builder().uri("/result/trends?server=JP").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["last-modified"], "Wed, 01 May 2024 12:00:00 GMT");
        assert_eq!(json_body(response).await["interval"], 86_400_000);

        let request = Request::builder()
            .uri("/result/trends?server=JP")
            .header("if-modified-since", "Wed, 01 May 2024 12:00:00 GMT")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn admin_routes_require_the_key() {
        let (state, _tx) = state();
        let app = router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/refresh/matrix/CN")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/refresh/matrix/CN")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_refresh_reaches_the_worker() {
        let (state, tx) = state();
        let app = router(state);

        let refresh = |path: &str| {
            Request::builder()
                .method("POST")
                .uri(path)
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(refresh("/admin/refresh/pattern/KR")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let mut rx = tx.subscribe();
        let response = app.clone().oneshot(refresh("/admin/refresh/pattern/KR")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            rx.recv().await.unwrap(),
            RefreshRequest {
                kind: RefreshKind::Pattern,
                server: Server::KR,
            }
        );

        let response = app.oneshot(refresh("/admin/refresh/everything/KR")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn purge_removes_named_entries() {
        let (state, _tx) = state();
        let caches = state.service.caches();
        let key = caches.shim_trend.key(&["CN"]);
        let trend = ShimTrendQueryResult {
            interval: 86_400_000,
            trend: BTreeMap::new(),
        };
        caches.shim_trend.set(&key, &trend).await.unwrap();

        let app = router(state.clone());
        let purge = |body: serde_json::Value| {
            let mut request = post_json("/admin/cache/purge", body);
            request
                .headers_mut()
                .insert("authorization", "Bearer secret".parse().unwrap());
            request
        };

        let response = app
            .clone()
            .oneshot(purge(serde_json::json!({"name": "shimTrend", "key": key})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.service.caches().shim_trend.get(&key).await.is_err());

        let response = app
            .oneshot(purge(serde_json::json!({"name": "noSuchCache"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
