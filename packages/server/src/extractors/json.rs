use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// JSON request body that ignores `Content-Type`.
///
/// The lookup endpoints take their body on `GET`, and clients routinely send
/// those without a content type. Parse failures become `AppError::Validation`
/// so clients always get a structured error body.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::Validation(e.body_text()))?;

        if bytes.is_empty() {
            return Err(AppError::Validation("Request body must be a JSON object".into()));
        }

        serde_json::from_slice(&bytes)
            .map(AppJson)
            .map_err(|e| AppError::Validation(format!("Invalid JSON body: {e}")))
    }
}
