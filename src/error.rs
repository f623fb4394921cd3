use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Style not found: {0}")]
    StyleNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tile out of bounds: z={z}, x={x}, y={y}")]
    TileOutOfBounds { z: u32, x: u32, y: u32 },

    #[error("Upstream source returned no data")]
    UpstreamEmpty,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    FatalConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RenderServerError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

impl IntoResponse for RenderServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RenderServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            RenderServerError::StyleNotFound(_)
            | RenderServerError::NotFound(_)
            | RenderServerError::TileOutOfBounds { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            RenderServerError::UpstreamEmpty | RenderServerError::Upstream(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            RenderServerError::Render(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            RenderServerError::FatalConfig(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            RenderServerError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "I/O error".to_string(),
            ),
            RenderServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, RenderServerError>;
