//! HTTP transport
//!
//! Routes mirror the operator panel: uploads arrive as multipart fields,
//! device selection and gains as query parameters. Every route builds a
//! [`Request`] and runs it through the same [`Dispatcher`] as the line
//! protocol, on the blocking pool. Artifacts are downloadable under
//! `/output` and `/temp_plots`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, error, info};

use crate::control::dispatcher::Dispatcher;
use crate::control::protocol::{CaptureMode, Request, Response};
use crate::engine::ArtifactStore;
use crate::error::{EngineError, ErrorKind, Result};

type Reply = (StatusCode, Json<Response>);

/// Query parameters accepted by the device and gain routes
#[derive(Debug, Default, Deserialize)]
pub struct ControlParams {
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub volume: Option<f32>,
    pub gain: Option<f32>,
    pub start_live: Option<bool>,
}

/// Build the control-plane router
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let store = dispatcher.session().store().clone();
    let max_upload = dispatcher.session().config().server.max_upload_bytes();

    Router::new()
        .route("/api/prepare-ir", post(prepare_ir))
        .route("/api/ir/full/offline", post(capture_offline))
        .route("/api/ir/full/live", post(capture_live))
        .route("/api/deconvolve", post(deconvolve))
        .route("/api/plot/offline", get(fetch_plots))
        .route("/api/live/load-ir", post(load_live_ir))
        .route("/api/live/start", post(start_live))
        .route("/api/live/stop", post(stop_live))
        .route("/api/live/status", get(live_status))
        .route("/api/record/start", post(start_recording))
        .route("/api/record/stop", post(stop_recording))
        .route("/api/devices", get(list_devices))
        .route("/api/status", get(status))
        .route("/api/reset", post(reset))
        .route("/api/health", get(health))
        .route("/api/clear-temp", post(clear_temp))
        .nest_service("/output", ServeDir::new(store.output_dir()))
        .nest_service("/temp_plots", ServeDir::new(store.plot_dir()))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

/// Serve HTTP on `listen` until the process exits
pub async fn serve_http(dispatcher: Arc<Dispatcher>, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(address = %listener.local_addr()?, "HTTP control plane listening");

    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

async fn prepare_ir(State(dispatcher): State<Arc<Dispatcher>>, multipart: Option<Multipart>) -> Reply {
    let mut uploads = match Uploads::receive(&dispatcher, multipart).await {
        Ok(uploads) => uploads,
        Err(e) => return rejected(&e),
    };
    let ir = match uploads.require("ir") {
        Ok(path) => path,
        Err(e) => return rejected(&e),
    };
    dispatch(dispatcher, Request::PrepareIr { ir }).await
}

async fn capture_offline(State(dispatcher): State<Arc<Dispatcher>>, multipart: Option<Multipart>) -> Reply {
    let mut uploads = match Uploads::receive(&dispatcher, multipart).await {
        Ok(uploads) => uploads,
        Err(e) => return rejected(&e),
    };
    let request = Request::CaptureIr {
        mode: CaptureMode::Offline,
        probe: uploads.take("probe"),
        response: uploads.take("response"),
        input_device: None,
        output_device: None,
        start_live: false,
        volume: None,
    };
    dispatch(dispatcher, request).await
}

async fn capture_live(State(dispatcher): State<Arc<Dispatcher>>, Query(params): Query<ControlParams>) -> Reply {
    let request = Request::CaptureIr {
        mode: CaptureMode::Live,
        probe: None,
        response: None,
        input_device: params.input_device,
        output_device: params.output_device,
        start_live: params.start_live.unwrap_or(true),
        volume: params.volume,
    };
    dispatch(dispatcher, request).await
}

async fn deconvolve(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(params): Query<ControlParams>,
    multipart: Option<Multipart>,
) -> Reply {
    let mut uploads = match Uploads::receive(&dispatcher, multipart).await {
        Ok(uploads) => uploads,
        Err(e) => return rejected(&e),
    };
    let signal = match uploads.require("signal") {
        Ok(path) => path,
        Err(e) => return rejected(&e),
    };
    let request = Request::Deconvolve {
        signal: Some(signal),
        ir: uploads.take("ir"),
        gain: params.gain,
    };
    dispatch(dispatcher, request).await
}

async fn fetch_plots(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::FetchPlots).await
}

async fn load_live_ir(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(params): Query<ControlParams>,
    multipart: Option<Multipart>,
) -> Reply {
    let mut uploads = match Uploads::receive(&dispatcher, multipart).await {
        Ok(uploads) => uploads,
        Err(e) => return rejected(&e),
    };
    let ir = match uploads.require("ir") {
        Ok(path) => path,
        Err(e) => return rejected(&e),
    };
    let request = Request::StartLive {
        ir: Some(ir),
        input_device: params.input_device,
        output_device: params.output_device,
        volume: params.volume,
    };
    dispatch(dispatcher, request).await
}

async fn start_live(State(dispatcher): State<Arc<Dispatcher>>, Query(params): Query<ControlParams>) -> Reply {
    let request = Request::StartLive {
        ir: None,
        input_device: params.input_device,
        output_device: params.output_device,
        volume: params.volume,
    };
    dispatch(dispatcher, request).await
}

async fn stop_live(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::StopLive).await
}

async fn live_status(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::LiveStatus).await
}

async fn start_recording(State(dispatcher): State<Arc<Dispatcher>>, Query(params): Query<ControlParams>) -> Reply {
    let request = Request::StartRecording {
        input_device: params.input_device,
    };
    dispatch(dispatcher, request).await
}

async fn stop_recording(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::StopRecording).await
}

async fn list_devices(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::ListDevices).await
}

async fn status(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::Status).await
}

async fn reset(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::Reset).await
}

async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::Health).await
}

async fn clear_temp(State(dispatcher): State<Arc<Dispatcher>>) -> Reply {
    dispatch(dispatcher, Request::ClearTemp).await
}

/// Multipart file fields staged into the upload directory, keyed by field name
struct Uploads {
    files: HashMap<String, PathBuf>,
}

impl Uploads {
    async fn receive(dispatcher: &Dispatcher, multipart: Option<Multipart>) -> Result<Self> {
        let mut files = HashMap::new();
        let Some(mut multipart) = multipart else {
            return Ok(Self { files });
        };
        let store = dispatcher.session().store().clone();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| EngineError::invalid_input(format!("malformed multipart body: {}", e)))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let file_name = field.file_name().map(str::to_string);
            let body = field
                .bytes()
                .await
                .map_err(|e| EngineError::invalid_input(format!("failed to read field `{}`: {}", name, e)))?;
            if body.is_empty() {
                continue;
            }

            let store = store.clone();
            let staged = tokio::task::spawn_blocking(move || store.stage_bytes(file_name.as_deref(), &body))
                .await
                .map_err(|e| EngineError::internal(format!("upload staging panicked: {}", e)))??;
            debug!(field = %name, path = %staged.display(), "received upload");
            files.insert(name, staged);
        }

        Ok(Self { files })
    }

    fn take(&mut self, field: &str) -> Option<PathBuf> {
        self.files.remove(field)
    }

    fn require(&mut self, field: &str) -> Result<PathBuf> {
        self.take(field)
            .ok_or_else(|| EngineError::invalid_input(format!("missing multipart file field `{}`", field)))
    }
}

async fn dispatch(dispatcher: Arc<Dispatcher>, request: Request) -> Reply {
    let store = dispatcher.session().store().clone();
    let outcome = tokio::task::spawn_blocking(move || dispatcher.handle(request)).await;

    let mut response = match outcome {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "request handler panicked");
            Response::error(&EngineError::internal("request handler panicked"))
        }
    };
    response.links = artifact_links(&store, &response);

    (status_code(&response), Json(response))
}

fn rejected(error: &EngineError) -> Reply {
    let response = Response::error(error);
    (status_code(&response), Json(response))
}

/// HTTP status for a control-plane response
pub fn status_code(response: &Response) -> StatusCode {
    match response.kind {
        None => StatusCode::OK,
        Some(ErrorKind::InvalidInput) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::AlignmentFailed) | Some(ErrorKind::DegenerateIr) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::StateConflict) => StatusCode::CONFLICT,
        Some(ErrorKind::DeviceError) | Some(ErrorKind::AudioUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorKind::InternalFault) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn artifact_links(store: &ArtifactStore, response: &Response) -> Option<BTreeMap<String, String>> {
    let fields = [
        ("output_file", &response.output_file),
        ("time_plot", &response.time_plot),
        ("freq_plot", &response.freq_plot),
        ("ir_file", &response.ir_file),
        ("file", &response.file),
    ];

    let links: BTreeMap<String, String> = fields
        .into_iter()
        .filter_map(|(key, path)| {
            let url = artifact_url(store, path.as_deref()?)?;
            Some((key.to_string(), url))
        })
        .collect();

    (!links.is_empty()).then_some(links)
}

fn artifact_url(store: &ArtifactStore, path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let dir = path.parent()?;
    if dir == store.output_dir() {
        Some(format!("/output/{}", name))
    } else if dir == store.plot_dir() {
        Some(format!("/temp_plots/{}", name))
    } else {
        None
    }
}
