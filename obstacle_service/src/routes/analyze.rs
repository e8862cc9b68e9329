use crate::server::SharedState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use obstacle_schema::{AnalyzeRequest, Classification, ValidationError};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("Malformed request body: {0}")]
    Body(#[from] JsonRejection),
}

impl IntoResponse for AnalyzeError {
    fn into_response(self) -> Response {
        let status = match &self {
            AnalyzeError::Validation(_) => StatusCode::BAD_REQUEST,
            AnalyzeError::Body(rejection) => rejection.status(),
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[instrument(skip(state, payload))]
pub async fn analyze(
    State(state): State<SharedState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<Classification>, AnalyzeError> {
    let Json(request) = payload?;
    let images = request.images.len();

    let classification = state.analyzer.analyze(request.images).await.map_err(|e| {
        tracing::warn!("Rejected analysis request: {}", e);
        e
    })?;
    state.metrics.record_analysis("http");

    tracing::info!(
        images,
        tag = %classification.tag(),
        "Analysis request completed"
    );

    Ok(Json(classification))
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::{router, send, StubAnalysis};
    use axum::{body::Body, http::Request};
    use obstacle_schema::TaxonomyTag;
    use std::sync::Arc;

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/analyze")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_analyze_returns_classification() {
        let analysis = Arc::new(StubAnalysis::new(TaxonomyTag::Construction));
        let body = r#"{"images": [
            {"fileUrl": "http://img/1.jpg", "latitude": 37.5, "longitude": 127.0, "address": "a"},
            {"fileUrl": "http://img/2.jpg", "latitude": 37.5, "longitude": 127.0, "address": "a"}
        ]}"#;

        let (status, json) = send(router(analysis.clone()), post(body)).await;

        assert_eq!(status, 200);
        assert_eq!(
            json,
            serde_json::json!({"analysis_result": "Yes", "is_obstacle": true, "tag": "construction"})
        );
        let seen = analysis.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_slice()[1].file_url, "http://img/2.jpg");
    }

    #[tokio::test]
    async fn test_empty_image_list_is_a_bad_request() {
        let analysis = Arc::new(StubAnalysis::new(TaxonomyTag::Normal));

        let (status, json) = send(router(analysis.clone()), post(r#"{"images": []}"#)).await;

        assert_eq!(status, 400);
        assert!(json["detail"].as_str().unwrap().contains("empty"));
        assert!(analysis.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let analysis = Arc::new(StubAnalysis::new(TaxonomyTag::Normal));

        let (status, _) = send(router(analysis.clone()), post(r#"{"images": [{"fileUrl": 3}]}"#)).await;

        assert_eq!(status, 422);
        assert!(analysis.seen.lock().is_empty());
    }
}
