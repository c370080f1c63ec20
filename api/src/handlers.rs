use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use consensus::NodeId;
use controller::{ReconfigurationCoordinator, RemoveOutcome};
use network::DemandReport;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    ActivesResponse, ApiError, ApiResult, CreateRecordRequest, DemandRequest, HealthResponse,
    RecordView, RemoveResponse,
};

pub struct AppState {
    /// Node whose view of liveness routes requests.
    pub entry: NodeId,
    pub coordinators: BTreeMap<NodeId, Arc<ReconfigurationCoordinator>>,
    pub remove_timeout: Duration,
}

impl AppState {
    fn entry(&self) -> ApiResult<&Arc<ReconfigurationCoordinator>> {
        self.coordinators.get(&self.entry).ok_or_else(|| {
            ApiError::InternalError(format!("No coordinator for entry node {}", self.entry))
        })
    }

    fn leader_of(
        &self,
        primaries: &BTreeSet<NodeId>,
    ) -> ApiResult<&Arc<ReconfigurationCoordinator>> {
        let leader = self.entry()?.leader_for(primaries).ok_or_else(|| {
            ApiError::ServiceUnavailable(format!("No reachable primary among {:?}", primaries))
        })?;
        self.coordinators
            .get(&leader)
            .ok_or_else(|| ApiError::InternalError(format!("No coordinator for node {}", leader)))
    }

    /// Leading primary of an existing record.
    async fn locate(&self, name: &str) -> ApiResult<&Arc<ReconfigurationCoordinator>> {
        for coordinator in self.coordinators.values() {
            if let Some(record) = coordinator.record(name).await? {
                return self.leader_of(record.primaries());
            }
        }
        Err(ApiError::NoSuchRecord(name.to_string()))
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let entry = state.entry()?;
    let reachable = state
        .coordinators
        .keys()
        .filter(|node| entry.liveness().is_reachable(**node))
        .count();

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.entry,
        nodes: state.coordinators.len(),
        reachable,
        timestamp: Utc::now(),
    }))
}

pub async fn list_records(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RecordView>>> {
    let mut views = BTreeMap::new();
    for coordinator in state.coordinators.values() {
        let records = coordinator
            .store()
            .scan_all()
            .await
            .map_err(controller::ControllerError::from)?;
        for record in records {
            let stage = coordinator.progress().stage(record.name()).map(|entry| entry.stage);
            views
                .entry(record.name().to_string())
                .or_insert_with(|| RecordView::from_record(&record, stage));
        }
    }
    Ok(Json(views.into_values().collect()))
}

pub async fn create_record(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRecordRequest>,
) -> ApiResult<Response> {
    if request.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest("Name must not be empty".to_string()));
    }

    let primaries = state.entry()?.primaries_for(&request.name);
    let coordinator = state.leader_of(&primaries)?;
    let outcome = coordinator.add_record(&request.name).await?;

    if !outcome.proposed {
        tracing::debug!("Add of {} did not produce a proposal", request.name);
    }
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

pub async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RecordView>> {
    let coordinator = state.locate(&name).await?;
    let record = coordinator
        .record(&name)
        .await?
        .ok_or_else(|| ApiError::NoSuchRecord(name.clone()))?;
    let stage = coordinator.progress().stage(&name).map(|entry| entry.stage);
    Ok(Json(RecordView::from_record(&record, stage)))
}

pub async fn get_actives(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ActivesResponse>> {
    let coordinator = state.locate(&name).await?;
    let record = coordinator
        .record(&name)
        .await?
        .ok_or_else(|| ApiError::NoSuchRecord(name.clone()))?;

    Ok(Json(ActivesResponse {
        name,
        actives: record.active_set().clone(),
        transition_id: record.active_transition_id(),
        running: record.is_active_running(),
    }))
}

pub async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let coordinator = state.locate(&name).await?;
    let receiver = coordinator.request_removal(&name).await?;

    let outcome = tokio::time::timeout(state.remove_timeout, receiver)
        .await
        .map_err(|_| ApiError::Timeout(format!("Removal of {} not acknowledged", name)))?
        .map_err(|_| ApiError::InternalError(format!("Removal of {} was abandoned", name)))?;

    tracing::info!("Remove request for {} finished: {:?}", name, outcome);
    match outcome {
        RemoveOutcome::Removed => Ok(Json(RemoveResponse { name, outcome }).into_response()),
        RemoveOutcome::AlreadyPending => {
            Ok((StatusCode::ACCEPTED, Json(RemoveResponse { name, outcome })).into_response())
        }
        RemoveOutcome::NotFound => Err(ApiError::NoSuchRecord(name)),
        RemoveOutcome::Unavailable => Err(ApiError::ServiceUnavailable(format!(
            "Primaries of {} could not agree on removal",
            name
        ))),
    }
}

/// Forwards a lookup-path demand report to every primary of the name.
pub async fn report_demand(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<DemandRequest>,
) -> ApiResult<StatusCode> {
    let report = DemandReport {
        name: name.clone(),
        reporter: request.reporter,
        lookups: request.lookups,
        updates: request.updates,
    };

    let mut recorded = 0;
    for coordinator in state.coordinators.values() {
        if coordinator.record_demand(&report).await? {
            recorded += 1;
        }
    }

    if recorded == 0 {
        return Err(ApiError::NoSuchRecord(name));
    }
    Ok(StatusCode::NO_CONTENT)
}
