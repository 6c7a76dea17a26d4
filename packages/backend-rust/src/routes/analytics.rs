//! 日汇总接口
//!
//! - `POST /daily/apply` 加法式累加一个客户端增量
//! - `GET /daily/:user_id/:date` 只读查看某天的汇总

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use study_analytics::{parse_day_key, ApplyDeltaRequest, ApplyDeltaResponse, DailyAggregate};

use crate::response::{AppError, SuccessResponse};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/daily/apply", post(apply_delta))
        .route("/daily/:user_id/:date", get(get_daily))
}

async fn apply_delta(
    State(state): State<AppState>,
    payload: Result<Json<ApplyDeltaRequest>, JsonRejection>,
) -> Result<Json<SuccessResponse<ApplyDeltaResponse>>, AppError> {
    let Json(request) = payload?;

    let response = state.store().apply_delta(&request).await.map_err(|err| {
        if err.is_client_error() {
            tracing::warn!(
                user_id = %request.user_id,
                client_id = %request.client_id,
                error = %err,
                "delta rejected"
            );
        }
        AppError::from(err)
    })?;

    Ok(SuccessResponse::ok(response))
}

async fn get_daily(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Result<Json<SuccessResponse<DailyAggregate>>, AppError> {
    let Path((user_id, raw_date)) = path?;
    let date = parse_day_key(&raw_date).map_err(|err| AppError::validation(err.to_string()))?;

    state
        .store()
        .get_daily(&user_id, date)
        .await?
        .map(SuccessResponse::ok)
        .ok_or_else(|| AppError::not_found("当日汇总不存在"))
}
