use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task;

use crate::pipeline::{self, PipelineError, RequestParams};
use crate::registry::ModelRegistry;

const MESH_MEDIA_TYPE: &str = "model/gltf-binary";
const MESH_DISPOSITION: &str = "attachment; filename=\"model.glb\"";

/// Shared handler state. The registry slot stays `None` only until startup
/// initialization hands one over; requests hitting it early get the fixed
/// not-initialized error.
#[derive(Clone, Default)]
pub struct AppState {
    registry: Option<Arc<ModelRegistry>>,
}

impl AppState {
    pub fn new(registry: Option<Arc<ModelRegistry>>) -> Self {
        Self { registry }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        // uploads are whole images; the 2 MB default is far too small
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state)
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": self.to_string()})),
        )
            .into_response()
    }
}

async fn generate(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, PipelineError> {
    let (bytes, params) = read_request(multipart).await?;
    let glb = run_pipeline(&state, bytes, params).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, MESH_MEDIA_TYPE),
            (header::CONTENT_DISPOSITION, MESH_DISPOSITION),
        ],
        glb,
    )
        .into_response())
}

/// Pull the uploaded image and form knobs out of the multipart body.
/// Malformed numeric fields fall back to their defaults.
async fn read_request(mut multipart: Multipart) -> Result<(Bytes, RequestParams), PipelineError> {
    let mut file = None;
    let mut params = RequestParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Processing(format!("reading multipart request: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file = Some(field.bytes().await.map_err(|e| {
                    PipelineError::Processing(format!("reading uploaded file: {e}"))
                })?);
            }
            "mc_resolution" => {
                if let Ok(text) = field.text().await {
                    if let Ok(value) = text.trim().parse() {
                        params.mc_resolution = value;
                    }
                }
            }
            "foreground_ratio" => {
                if let Ok(text) = field.text().await {
                    if let Ok(value) = text.trim().parse() {
                        params.foreground_ratio = value;
                    }
                }
            }
            "do_remove_background" => {
                if let Ok(text) = field.text().await {
                    params.remove_background = parse_bool(&text);
                }
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| {
        PipelineError::Processing("missing required multipart field: file".to_string())
    })?;
    Ok((file, params))
}

fn parse_bool(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

/// Run the blocking reconstruction off the dispatcher, then read the artifact
/// back and delete it; the temp file never outlives its request.
async fn run_pipeline(
    state: &AppState,
    bytes: Bytes,
    params: RequestParams,
) -> Result<Vec<u8>, PipelineError> {
    let registry = state.registry.clone().ok_or(PipelineError::Unavailable)?;
    let params = params.sanitized();

    let path = task::spawn_blocking(move || pipeline::reconstruct(&bytes, &params, &registry))
        .await
        .map_err(|e| PipelineError::Processing(format!("reconstruction task aborted: {e}")))??;

    let read = tokio::fs::read(&path).await;
    if let Err(e) = tokio::fs::remove_file(&path).await {
        log::warn!("failed to remove mesh artifact {}: {e}", path.display());
    }
    read.map_err(|e| PipelineError::Processing(format!("reading mesh artifact: {e}")))
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        model_loaded: state.registry.is_some(),
        device: state.registry.as_ref().map(|r| r.device().to_string()),
    })
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    model_loaded: bool,
    device: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockReconstructor;
    use image::{DynamicImage, RgbaImage};
    use std::io::Cursor;

    fn mock_state() -> AppState {
        AppState::new(Some(Arc::new(ModelRegistry::for_tests(Box::new(
            MockReconstructor,
        )))))
    }

    fn png_bytes(image: DynamicImage) -> Bytes {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        Bytes::from(bytes)
    }

    #[tokio::test]
    async fn request_before_initialization_is_unavailable() {
        let err = run_pipeline(
            &AppState::new(None),
            Bytes::from_static(b"ignored"),
            RequestParams::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::Unavailable));
        assert_eq!(err.to_string(), "Model not initialized");
    }

    #[tokio::test]
    async fn opaque_upload_returns_glb_bytes() {
        let image = DynamicImage::new_rgb8(512, 512);
        let params = RequestParams {
            mc_resolution: 64,
            remove_background: false,
            ..RequestParams::default()
        };

        let glb = run_pipeline(&mock_state(), png_bytes(image), params)
            .await
            .unwrap();
        assert!(!glb.is_empty());
        assert_eq!(&glb[0..4], b"glTF");
    }

    #[tokio::test]
    async fn transparent_upload_composites_and_reconstructs() {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(64, 64));
        let params = RequestParams {
            mc_resolution: 32,
            remove_background: false,
            ..RequestParams::default()
        };

        let glb = run_pipeline(&mock_state(), png_bytes(image), params)
            .await
            .unwrap();
        assert_eq!(&glb[0..4], b"glTF");
    }

    #[tokio::test]
    async fn corrupt_upload_is_a_processing_error() {
        let err = run_pipeline(
            &mock_state(),
            Bytes::from_static(b"definitely not an image"),
            RequestParams {
                remove_background: false,
                ..RequestParams::default()
            },
        )
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, PipelineError::Processing(_)));
        assert!(message.contains("decoding uploaded image"));
    }

    #[test]
    fn errors_surface_as_500_json() {
        let response = PipelineError::Unavailable.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response =
            PipelineError::Processing("extracting mesh: boom".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn form_booleans_parse_like_the_upstream_service() {
        assert!(parse_bool("true"));
        assert!(parse_bool("True"));
        assert!(parse_bool("1"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }
}
