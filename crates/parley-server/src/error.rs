use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Store(store) => match store {
                StoreError::NotFound => (StatusCode::NOT_FOUND, store.to_string()),
                StoreError::NotParticipant | StoreError::NotAuthorized => {
                    (StatusCode::FORBIDDEN, store.to_string())
                }
                StoreError::SelfConversation
                | StoreError::InvalidGroup(_)
                | StoreError::AlreadyMember
                | StoreError::NotAMember
                | StoreError::LastAdmin
                | StoreError::NotAGroup
                | StoreError::InvalidContent(_) => (StatusCode::BAD_REQUEST, store.to_string()),
                // Persistence failures: never leak internals to clients.
                StoreError::Sqlite(_)
                | StoreError::Io(_)
                | StoreError::Migration(_)
                | StoreError::Uuid(_)
                | StoreError::ChronoParse(_)
                | StoreError::Json(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal storage error".to_string(),
                ),
            },
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
