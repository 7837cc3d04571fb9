//! API route definitions.

use axum::extract::{Path, State};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::{plot, ApiError, ApiJson, ApiQuery};
use crate::engine::VersionSelector;
use crate::error::Error;
use crate::health::HealthReport;
use crate::series::{DataPoint, SeriesId, TrainingDataset};
use crate::storage::ModelVersionRecord;

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/fit/{series_id}", post(fit))
        .route("/predict/{series_id}", post(predict))
        .route("/healthcheck", get(healthcheck))
        .route("/models/{series_id}/latest", get(latest_model))
        .route("/models/{series_id}/versions", get(list_versions))
        .route("/models/{series_id}/versions/{version}", get(model_version))
        .route("/models/{series_id}/data", get(training_data))
        .route("/plot/{series_id}", get(plot_training_data))
}

#[derive(Debug, Deserialize)]
pub struct TrainBody {
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub series_id: String,
    pub version: String,
    pub points_used: usize,
}

#[derive(Debug, Deserialize)]
pub struct PredictBody {
    pub timestamp: String,
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub anomaly: bool,
    pub model_version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    pub version: Option<String>,
}

impl VersionQuery {
    fn selector(&self) -> Result<VersionSelector, Error> {
        VersionSelector::parse(self.version.as_deref().unwrap_or(""))
    }
}

async fn fit(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
    ApiJson(body): ApiJson<TrainBody>,
) -> ApiResult<Json<TrainResponse>> {
    let series_id = SeriesId::parse(&series_id)?;
    let dataset = TrainingDataset::from_columns(&body.timestamps, &body.values)?;
    let outcome = state.engine.train(&series_id, dataset).await?;
    Ok(Json(TrainResponse {
        series_id: outcome.series_id,
        version: outcome.version.to_string(),
        points_used: outcome.points_used,
    }))
}

async fn predict(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
    ApiQuery(query): ApiQuery<VersionQuery>,
    ApiJson(body): ApiJson<PredictBody>,
) -> ApiResult<Json<PredictResponse>> {
    let series_id = SeriesId::parse(&series_id)?;
    let selector = query.selector()?;
    let point = DataPoint::from_wire(&body.timestamp, body.value)?;
    let prediction = state.engine.predict(&series_id, point, selector).await?;
    Ok(Json(PredictResponse {
        anomaly: prediction.anomaly,
        model_version: prediction.version.to_string(),
    }))
}

async fn healthcheck(State(state): State<AppState>) -> ApiResult<Json<HealthReport>> {
    Ok(Json(state.engine.health().await?))
}

async fn latest_model(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
) -> ApiResult<Json<ModelVersionRecord>> {
    let series_id = SeriesId::parse(&series_id)?;
    Ok(Json(state.engine.latest(&series_id).await?))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
) -> ApiResult<Json<Vec<ModelVersionRecord>>> {
    let series_id = SeriesId::parse(&series_id)?;
    let versions = state.engine.versions(&series_id).await?;
    if versions.is_empty() {
        return Err(Error::not_found(format!("no trained model for series '{series_id}'")).into());
    }
    Ok(Json(versions))
}

async fn model_version(
    State(state): State<AppState>,
    Path((series_id, version)): Path<(String, String)>,
) -> ApiResult<Json<ModelVersionRecord>> {
    let series_id = SeriesId::parse(&series_id)?;
    let selector = VersionSelector::parse(&version)?;
    Ok(Json(state.engine.resolve(&series_id, selector).await?))
}

async fn training_data(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
    ApiQuery(query): ApiQuery<VersionQuery>,
) -> ApiResult<Json<TrainingDataset>> {
    let series_id = SeriesId::parse(&series_id)?;
    let (_, dataset) = state.engine.training_data(&series_id, query.selector()?).await?;
    Ok(Json(dataset))
}

async fn plot_training_data(
    State(state): State<AppState>,
    Path(series_id): Path<String>,
    ApiQuery(query): ApiQuery<VersionQuery>,
) -> ApiResult<Html<String>> {
    let series_id = SeriesId::parse(&series_id)?;
    let (record, dataset) = state.engine.training_data(&series_id, query.selector()?).await?;
    Ok(Html(plot::render(&record, &dataset)?))
}
