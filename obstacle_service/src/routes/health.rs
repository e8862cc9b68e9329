use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(Status {
        status: "UP".into(),
    })
}

#[derive(Serialize)]
pub struct Banner {
    message: &'static str,
}

pub async fn root() -> impl IntoResponse {
    Json(Banner {
        message: "Image AI Service is running.",
    })
}

#[derive(Serialize)]
pub struct Info {
    app: String,
    status: &'static str,
}

pub async fn info(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Info {
        app: state.app_name.clone(),
        status: "running",
    })
}
