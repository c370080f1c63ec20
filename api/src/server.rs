use axum::routing::{get, post};
use axum::Router;
use consensus::NodeId;
use controller::ReconfigurationCoordinator;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::*;
use crate::{ApiError, ApiResult};

pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(
        config: crate::Config,
        entry: NodeId,
        coordinators: BTreeMap<NodeId, Arc<ReconfigurationCoordinator>>,
    ) -> ApiResult<Self> {
        if !coordinators.contains_key(&entry) {
            return Err(ApiError::InvalidRequest(format!(
                "Entry node {} has no coordinator",
                entry
            )));
        }

        let app_state = Arc::new(AppState {
            entry,
            coordinators,
            remove_timeout: Duration::from_millis(config.remove_timeout_ms),
        });

        Ok(Self { config, app_state })
    }

    pub async fn start(&self) -> ApiResult<()> {
        let addr = self.config.bind_address();
        tracing::info!("Starting API server on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> ApiResult<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/records", get(list_records).post(create_record))
            .route("/records/:name", get(get_record).delete(delete_record))
            .route("/records/:name/actives", get(get_actives))
            .route("/records/:name/demand", post(report_demand))
            .with_state(self.app_state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }
}
