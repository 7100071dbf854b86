use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::errors::VistaSegError;
use crate::inference::InferenceOutcome;
use crate::packager::Payload;
use crate::session::{SessionId, SessionSnapshot};
use crate::traits::InferenceRunner;
use crate::{SegmentationService, UploadSummary};

pub const UPLOAD_FIELD: &str = "file";

type SharedService<R> = Arc<SegmentationService<R>>;

#[derive(Debug, Default, Deserialize)]
struct ClearParams {
    /// Forget the session and delete its directory instead of emptying it.
    #[serde(default)]
    remove: bool,
}

/// Error response: a status code plus a JSON body with the message, the
/// variant name and the tool log when there is one.
#[derive(Debug)]
pub struct AppError(VistaSegError);

impl From<VistaSegError> for AppError {
    fn from(err: VistaSegError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = self.0.kind(), "request failed");
        } else {
            tracing::warn!(error = %self.0, kind = self.0.kind(), "request rejected");
        }

        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "log": self.0.inference_log(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn status_for(err: &VistaSegError) -> StatusCode {
    match err {
        VistaSegError::Decode { .. }
        | VistaSegError::LabelMaskFormat { .. }
        | VistaSegError::Validation { .. } => StatusCode::BAD_REQUEST,
        VistaSegError::SessionNotFound { .. }
        | VistaSegError::MissingOutput { .. }
        | VistaSegError::VisualizationDisabled => StatusCode::NOT_FOUND,
        VistaSegError::InferenceInProgress { .. } | VistaSegError::InferenceCancelled => {
            StatusCode::CONFLICT
        }
        VistaSegError::InferenceFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        VistaSegError::InferenceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router<R: InferenceRunner + 'static>(
    service: SharedService<R>,
    max_upload_bytes: usize,
) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session::<R>))
        .route(
            "/api/sessions/:id",
            get(session_status::<R>).delete(clear_session::<R>),
        )
        .route("/api/sessions/:id/image", post(upload_image::<R>))
        .route("/api/sessions/:id/preview", get(preview::<R>))
        .route(
            "/api/sessions/:id/inference",
            post(run_inference::<R>).delete(cancel_inference::<R>),
        )
        .route("/api/sessions/:id/mask", get(download_mask::<R>))
        .route("/api/sessions/:id/metadata", get(download_metadata::<R>))
        .route(
            "/api/sessions/:id/visualization",
            get(download_visualization::<R>),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn create_session<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
) -> Result<impl IntoResponse, AppError> {
    let id = service.create_session()?;
    Ok((StatusCode::CREATED, Json(json!({ "session_id": id }))))
}

async fn session_status<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    Ok(Json(service.session_status(id.parse()?)?))
}

async fn clear_session<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
    Query(params): Query<ClearParams>,
) -> Result<StatusCode, AppError> {
    let id: SessionId = id.parse()?;
    if params.remove {
        blocking(&service, "session removal", move |s| s.remove_session(id)).await?;
    } else {
        blocking(&service, "session clear", move |s| s.clear_session(id)).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_image<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadSummary>, AppError> {
    let id: SessionId = id.parse()?;
    let invalid = |e: axum::extract::multipart::MultipartError| VistaSegError::Validation {
        field: UPLOAD_FIELD.to_string(),
        reason: e.body_text(),
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let raw = field.bytes().await.map_err(invalid)?;

        let summary = blocking(&service, "upload store", move |s| {
            s.store_upload(id, file_name.as_deref(), &raw)
        })
        .await?;
        return Ok(Json(summary));
    }

    Err(VistaSegError::Validation {
        field: UPLOAD_FIELD.to_string(),
        reason: "is missing from the multipart form".to_string(),
    }
    .into())
}

async fn preview<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id: SessionId = id.parse()?;
    let payload = blocking(&service, "preview", move |s| s.preview(id)).await?;
    Ok(([(header::CONTENT_TYPE, payload.mime)], payload.bytes).into_response())
}

async fn run_inference<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<Json<InferenceOutcome>, AppError> {
    Ok(Json(service.run_inference(id.parse()?).await?))
}

async fn cancel_inference<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let cancelled = service.cancel_inference(id.parse()?)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn download_mask<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id: SessionId = id.parse()?;
    let payload = blocking(&service, "mask download", move |s| s.mask_payload(id)).await?;
    Ok(attachment(payload))
}

async fn download_metadata<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id: SessionId = id.parse()?;
    let payload = blocking(&service, "metadata download", move |s| {
        s.metadata_payload(id)
    })
    .await?;
    Ok(attachment(payload))
}

async fn download_visualization<R: InferenceRunner + 'static>(
    State(service): State<SharedService<R>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id: SessionId = id.parse()?;
    let payload = blocking(&service, "visualization download", move |s| {
        s.visualization_payload(id)
    })
    .await?;
    Ok(attachment(payload))
}

/// Image decoding and encoding run off the async workers.
async fn blocking<R, T, F>(service: &SharedService<R>, operation: &str, f: F) -> Result<T, AppError>
where
    R: InferenceRunner + 'static,
    T: Send + 'static,
    F: FnOnce(&SegmentationService<R>) -> crate::Result<T> + Send + 'static,
{
    let service = Arc::clone(service);
    let joined = tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|source| VistaSegError::Task {
            operation: operation.to_string(),
            source,
        })?;
    Ok(joined?)
}

fn attachment(payload: Payload) -> Response {
    (
        [
            (header::CONTENT_TYPE, payload.mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&payload.file_name),
            ),
        ],
        payload.bytes,
    )
        .into_response()
}

/// ASCII `filename` for old clients plus the exact UTF-8 name as `filename*` (RFC 5987).
pub fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        header_safe_file_name(file_name),
        urlencoding::encode(file_name)
    )
}

/// Upload names are user input; keep the quoted header value printable ASCII.
fn header_safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}
