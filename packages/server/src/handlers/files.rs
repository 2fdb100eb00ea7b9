use std::path::PathBuf;

use axum::Json;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{AppError, ErrorBody};
use crate::extractors::json::AppJson;
use crate::models::file::{FileRecordResponse, RefRequest, UpdateFileDetailsRequest};
use crate::state::AppState;
use crate::utils::filename::{
    content_disposition_value, encode_path_segments, validate_original_filename,
};

/// Allowance for multipart boundaries and the `ref` part on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Body limit for the upload route, derived from the configured file size cap.
pub fn upload_body_limit(max_upload_size: u64) -> DefaultBodyLimit {
    let max = usize::try_from(max_upload_size).unwrap_or(usize::MAX);
    DefaultBodyLimit::max(max.saturating_add(MULTIPART_OVERHEAD))
}

#[utoipa::path(
    post,
    path = "/api/files/",
    tag = "Files",
    operation_id = "uploadFile",
    summary = "Upload a file at a reference path",
    description = "Stores the `file` multipart part at the reference path given in the `ref` part. \
        The part's filename is recorded as the original filename. \
        An existing file at the same reference path is never replaced.",
    request_body(content_type = "multipart/form-data", description = "`file` and `ref` parts"),
    responses(
        (status = 201, description = "File stored", body = FileRecordResponse),
        (status = 400, description = "Empty file, missing part or invalid reference (VALIDATION_ERROR)", body = ErrorBody),
        (status = 409, description = "Reference path already taken (CONFLICT)", body = ErrorBody),
        (status = 413, description = "File exceeds the upload limit (PAYLOAD_TOO_LARGE)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut upload: Option<(PathBuf, Option<String>)> = None;
    let mut ref_path: Option<String> = None;

    let parsed = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::Validation(format!("Multipart error: {e}")))?
        {
            match field.name() {
                Some("file") => {
                    if upload.is_some() {
                        return Err(AppError::Validation("Duplicate 'file' field".into()));
                    }
                    let file_name = field.file_name().map(str::to_owned);
                    let temp_path = spool_field(field, state.storage.max_upload_size()).await?;
                    upload = Some((temp_path, file_name));
                }
                Some("ref") => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| AppError::Validation(format!("Failed to read 'ref': {e}")))?;
                    ref_path = Some(text);
                }
                _ => {}
            }
        }
        Ok::<_, AppError>(())
    }
    .await;

    let result = async {
        parsed?;
        let (temp_path, file_name) = upload
            .as_ref()
            .ok_or_else(|| AppError::Validation("Missing 'file' field".into()))?;
        let ref_path = ref_path
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| AppError::Validation("Missing 'ref' field".into()))?;

        let file = tokio::fs::File::open(temp_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to reopen temp file: {e}")))?;
        let record = state
            .storage
            .store(file, file_name.as_deref().unwrap_or_default(), ref_path)
            .await?;

        Ok::<_, AppError>((StatusCode::CREATED, Json(FileRecordResponse::from(record))))
    }
    .await;

    if let Some((temp_path, _)) = &upload {
        // Best effort.
        let _ = tokio::fs::remove_file(temp_path).await;
    }

    result
}

#[utoipa::path(
    get,
    path = "/api/files/image-url",
    tag = "Files",
    operation_id = "getImageUrl",
    summary = "Build the download URL for a reference path",
    request_body = RefRequest,
    responses(
        (status = 200, description = "Download URL", body = String, content_type = "text/plain"),
        (status = 400, description = "Malformed body (VALIDATION_ERROR)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, headers, req), fields(ref_path = %req.ref_path))]
pub async fn get_image_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<RefRequest>,
) -> Result<String, AppError> {
    let base = public_base_url(&state.config.server, &headers)?;
    Ok(file_url(&base, &req.ref_path))
}

#[utoipa::path(
    get,
    path = "/api/files/images/{ref_path}",
    tag = "Files",
    operation_id = "serveFile",
    summary = "Download a stored file",
    description = "The remainder of the URL after `/api/files/images/` is the reference path \
        and may contain `/`.",
    params(("ref_path" = String, Path, description = "Reference path of the file")),
    responses(
        (status = 200, description = "File content", content_type = "application/octet-stream"),
        (status = 400, description = "Invalid reference (VALIDATION_ERROR)", body = ErrorBody),
        (status = 404, description = "No such file (NOT_FOUND)", body = ErrorBody),
    ),
)]
#[instrument(skip(state))]
pub async fn serve_file(
    State(state): State<AppState>,
    Path(ref_path): Path<String>,
) -> Result<Response, AppError> {
    let resource = state.storage.load_as_resource(&ref_path).await?;
    let content_type = mime_guess::from_path(&resource.ref_path).first_or_octet_stream();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.to_string())
        .header(header::CONTENT_LENGTH, resource.len.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition_value(&resource.ref_path),
        )
        .body(Body::from_stream(ReaderStream::new(resource.file)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {e}")))
}

#[utoipa::path(
    get,
    path = "/api/files/image-url-list",
    tag = "Files",
    operation_id = "getImageUrlList",
    summary = "List download URLs for every file under a directory",
    description = "An empty `ref` lists the whole store.",
    request_body = RefRequest,
    responses(
        (status = 200, description = "Download URLs", body = Vec<String>),
        (status = 400, description = "Invalid reference (VALIDATION_ERROR)", body = ErrorBody),
        (status = 500, description = "Directory cannot be walked (INTERNAL_ERROR)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, headers, req), fields(ref_path = %req.ref_path))]
pub async fn get_image_url_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<RefRequest>,
) -> Result<Json<Vec<String>>, AppError> {
    let base = public_base_url(&state.config.server, &headers)?;
    let listing = state
        .storage
        .load_all_files_under_path(&req.ref_path)
        .await?;

    // The directory walk does blocking I/O.
    let paths = tokio::task::spawn_blocking(move || listing.collect::<Result<Vec<_>, _>>())
        .await
        .map_err(|e| AppError::Internal(format!("Listing task failed: {e}")))??;

    Ok(Json(paths.iter().map(|p| file_url(&base, p)).collect()))
}

#[utoipa::path(
    delete,
    path = "/api/files/",
    tag = "Files",
    operation_id = "deleteFile",
    summary = "Delete a stored file and its record",
    request_body = RefRequest,
    responses(
        (status = 204, description = "File deleted"),
        (status = 400, description = "Invalid reference (VALIDATION_ERROR)", body = ErrorBody),
        (status = 404, description = "No record for the reference path (NOT_FOUND)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, req), fields(ref_path = %req.ref_path))]
pub async fn delete_file(
    State(state): State<AppState>,
    AppJson(req): AppJson<RefRequest>,
) -> Result<StatusCode, AppError> {
    state.storage.delete_file(&req.ref_path).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/files/details/{stored_filename}",
    tag = "Files",
    operation_id = "getFileDetails",
    summary = "Get the record of a stored file",
    params(("stored_filename" = String, Path, description = "Last segment of the stored path")),
    responses(
        (status = 200, description = "File record", body = FileRecordResponse),
        (status = 404, description = "No record (NOT_FOUND)", body = ErrorBody),
    ),
)]
#[instrument(skip(state))]
pub async fn get_file_details(
    State(state): State<AppState>,
    Path(stored_filename): Path<String>,
) -> Result<Json<FileRecordResponse>, AppError> {
    let record = state.storage.get_file_details(&stored_filename).await?;
    Ok(Json(record.into()))
}

#[utoipa::path(
    patch,
    path = "/api/files/details/{stored_filename}",
    tag = "Files",
    operation_id = "updateFileDetails",
    summary = "Rename the original filename of a stored file",
    params(("stored_filename" = String, Path, description = "Last segment of the stored path")),
    request_body = UpdateFileDetailsRequest,
    responses(
        (status = 200, description = "Updated record", body = FileRecordResponse),
        (status = 400, description = "Invalid filename (VALIDATION_ERROR)", body = ErrorBody),
        (status = 404, description = "No record (NOT_FOUND)", body = ErrorBody),
    ),
)]
#[instrument(skip(state, req))]
pub async fn update_file_details(
    State(state): State<AppState>,
    Path(stored_filename): Path<String>,
    AppJson(req): AppJson<UpdateFileDetailsRequest>,
) -> Result<Json<FileRecordResponse>, AppError> {
    let original_filename = validate_original_filename(&req.original_filename)
        .map_err(|e| AppError::Validation(e.message().into()))?;

    let record = state
        .storage
        .update_file_details(&stored_filename, original_filename)
        .await?;
    Ok(Json(record.into()))
}

/// Stream a multipart field into a temp file and return its path.
///
/// The `ref` part may arrive after the file, so the bytes are parked on disk
/// until both are known.
async fn spool_field(
    mut field: axum::extract::multipart::Field<'_>,
    max_size: u64,
) -> Result<PathBuf, AppError> {
    let temp_path = std::env::temp_dir().join(format!("refstore-upload-{}", Uuid::new_v4()));

    let result = async {
        let mut temp_file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {e}")))?;

        let mut total_size: u64 = 0;

        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::Validation(format!("Upload read error: {e}")))?
        {
            total_size += chunk.len() as u64;
            if total_size > max_size {
                return Err(AppError::PayloadTooLarge(format!(
                    "File exceeds maximum size of {max_size} bytes"
                )));
            }
            temp_file
                .write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("Temp file write failed: {e}")))?;
        }

        temp_file
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("Temp file flush failed: {e}")))
    }
    .await;

    match result {
        Ok(()) => Ok(temp_path),
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(e)
        }
    }
}

/// Origin that download URLs are built on: the configured public URL, or the
/// scheme and `Host` of the current request.
fn public_base_url(server: &ServerConfig, headers: &HeaderMap) -> Result<String, AppError> {
    if let Some(public_url) = &server.public_url {
        return Ok(public_url.trim_end_matches('/').to_owned());
    }

    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Validation("Missing Host header".into()))?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .filter(|s| matches!(*s, "http" | "https"))
        .unwrap_or("http");

    Ok(format!("{scheme}://{host}"))
}

fn file_url(base: &str, ref_path: &str) -> String {
    format!("{base}/api/files/images/{}", encode_path_segments(ref_path))
}
