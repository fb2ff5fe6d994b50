//! Thin HTTP/WebSocket adapter over [`SimulationManager`]. Handlers only
//! translate requests; all behaviour lives in the manager.

pub mod batteries;
pub mod error;
pub mod ws;

use axum::{
    http::{HeaderValue, Method, StatusCode},
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::ServerConfig, controller::SimulationManager};

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub manager: SimulationManager,
}

pub fn router(manager: SimulationManager, cfg: &ServerConfig) -> Router {
    let state = AppState { manager };

    let v1 = Router::new()
        .route("/health", get(batteries::health))
        .route("/scenarios", get(batteries::list_scenarios))
        .route(
            "/batteries",
            get(batteries::list_batteries).post(batteries::create_battery),
        )
        .route(
            "/batteries/:id",
            get(batteries::get_battery).delete(batteries::remove_battery),
        )
        .route("/batteries/:id/start", post(batteries::start_battery))
        .route("/batteries/:id/pause", post(batteries::pause_battery))
        .route("/batteries/:id/stop", post(batteries::stop_battery))
        .route("/batteries/:id/config", put(batteries::reconfigure_battery))
        .route(
            "/batteries/:id/scenario",
            post(batteries::apply_scenario).delete(batteries::clear_scenario),
        )
        .route("/scenario", post(batteries::apply_fleet_scenario))
        .route("/scenario/clear", post(batteries::clear_fleet_scenario))
        .route("/ws/telemetry", get(ws::telemetry_ws))
        .with_state(state);

    let mut router = Router::new().nest("/api/v1", v1);

    if cfg.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(HeaderValue::from_static("http://localhost:3000"))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([axum::http::header::CONTENT_TYPE]);
        router = router.layer(cors);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(256 * 1024))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(cfg.request_timeout_secs),
                )),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn app() -> Router {
        let manager = SimulationManager::new(
            Default::default(),
            Default::default(),
            Default::default(),
        );
        let cfg = ServerConfig {
            enable_cors: true,
            ..Default::default()
        };
        router(manager, &cfg)
    }

    #[tokio::test]
    async fn test_health_through_full_middleware_stack() {
        let res = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fleet_clear_accepts_empty_body() {
        let res = app()
            .oneshot(
                Request::post("/api/v1/scenario/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_battery_is_404() {
        let res = app()
            .oneshot(Request::get("/api/v1/batteries/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
