use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use salvo::catcher::Catcher;
use salvo::http::StatusCode;
use salvo::oapi::extract::JsonBody;
use salvo::prelude::*;
use slidecalc::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_BG_WIDTH: i64 = 2000;
const MAX_SLIDER_WIDTH: i64 = 500;
const SHOW_TIME_MS: u32 = 2000;

static RESOLVER: OnceLock<Resolver> = OnceLock::new();
static DEFAULT_METHOD: OnceLock<DetectionMethod> = OnceLock::new();

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Listen address. Supported formats:
    /// 1. Unix Socket: Starts with "/" (e.g., "/tmp/slidecalc.sock")
    /// 2. Port Number: Pure number (e.g., "8080" -> "0.0.0.0:8080")
    /// 3. TCP Address: IP:PORT (e.g., "127.0.0.1:8000")
    #[arg(long, env = "SERVER_ADDRESS", default_value = "0.0.0.0:8000")]
    address: String,

    /// Optional ONNX gap model that replaces the built-in slide matcher behind
    /// the "ocr" method.
    #[arg(long, env = "DET_MODEL_PATH")]
    det_path: Option<PathBuf>,

    #[arg(long, env = "IMAGE_DEFAULT_BIG_WIDTH")]
    default_bg_width: Option<u32>,

    #[arg(long, env = "IMAGE_DEFAULT_SMALL_WIDTH")]
    default_slider_width: Option<u32>,

    /// Seconds allowed for each image download.
    #[arg(long, env = "IMAGE_DOWNLOAD_TIMEOUT", default_value_t = 10)]
    fetch_timeout: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Paint fully transparent pixels white before detection.
    #[arg(long)]
    png_fix: bool,

    /// Edge-match correlation below this is reported as ambiguous.
    #[arg(long, default_value_t = 0.1)]
    min_score: f32,

    /// Used when a request names no method ("opencv" or "ocr").
    #[arg(long, default_value = "ocr")]
    default_method: DetectionMethod,
}

impl Args {
    fn resolver_config(&self) -> ResolverConfig {
        let mut config = ResolverConfig {
            default_bg_width: self.default_bg_width,
            default_slider_width: self.default_slider_width,
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            png_fix: self.png_fix,
            ..ResolverConfig::default()
        };
        config.edge_match.min_score = self.min_score;
        config
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct CalcRequest {
    /// URL, data URI or bare Base64.
    background_url: String,
    /// URL, data URI or bare Base64.
    slider_url: String,
    method: Option<String>,
    offset: Option<i64>,
    big_image_width: Option<i64>,
    small_image_width: Option<i64>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct ApiResponse<T> {
    code: u16,
    data: Option<T>,
    description: String,
    msg: Option<String>,
    #[serde(rename = "showTime")]
    show_time: u32,
    valid: bool,
}

impl<T> ApiResponse<T> {
    fn success(data: T, description: impl Into<String>) -> Self {
        Self {
            code: 200,
            data: Some(data),
            description: description.into(),
            msg: None,
            show_time: SHOW_TIME_MS,
            valid: true,
        }
    }

    fn failure(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            description: description.into(),
            msg: None,
            show_time: SHOW_TIME_MS,
            valid: false,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct EndpointInfo {
    path: String,
    method: String,
    description: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct ServiceInfo {
    service: String,
    version: String,
    endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct RecommendedSizes {
    big_image_width: u32,
    small_image_width: u32,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
struct StatusResponse {
    service_status: String,
    enabled_methods: Vec<String>,
    default_method: String,
    recognizer: String,
    model_digest: Option<String>,
    edge_min_score: f32,
}

/// Checks a request body and turns it into a resolver request, or a 400 description.
fn build_request(body: CalcRequest, default_method: DetectionMethod) -> Result<SliderCalcRequest, String> {
    let background = body.background_url.trim();
    let slider = body.slider_url.trim();
    if background.is_empty() {
        return Err("background_url must not be empty".into());
    }
    if slider.is_empty() {
        return Err("slider_url must not be empty".into());
    }

    let method = match body.method.as_deref() {
        None => default_method,
        Some(name) => name.parse::<DetectionMethod>()?,
    };

    check_width("big_image_width", body.big_image_width, MAX_BG_WIDTH)?;
    check_width("small_image_width", body.small_image_width, MAX_SLIDER_WIDTH)?;

    Ok(SliderCalcRequest::new(background, slider, method)
        .with_offset(body.offset.unwrap_or(0))
        .with_widths(body.big_image_width, body.small_image_width))
}

fn check_width(name: &str, width: Option<i64>, max: i64) -> Result<(), String> {
    match width {
        Some(w) if w <= 0 => Err(format!("{name} must be a positive integer, got {w}")),
        Some(w) if w > max => Err(format!("{name} must not exceed {max}, got {w}")),
        _ => Ok(()),
    }
}

fn failure_description(err: &SliderError) -> String {
    match err.status_code() {
        400 => format!("invalid input: {err}"),
        422 => format!("gap not found: {err}"),
        _ => format!("calculation failed: {err}"),
    }
}

fn resolver() -> anyhow::Result<&'static Resolver> {
    RESOLVER.get().context("resolver not initialized")
}

/// Calculate the slider drag distance for a background/slider image pair.
#[endpoint]
async fn calc(req: JsonBody<CalcRequest>, res: &mut Response) -> Json<ApiResponse<String>> {
    let default_method = DEFAULT_METHOD.get().copied().unwrap_or(DetectionMethod::ModelInference);
    let request = match build_request(req.into_inner(), default_method) {
        Ok(request) => request,
        Err(description) => {
            res.status_code(StatusCode::BAD_REQUEST);
            return Json(ApiResponse::failure(400, description));
        }
    };

    let resolver = match resolver() {
        Ok(r) => r,
        Err(e) => {
            error!("{e:#}");
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            return Json(ApiResponse::failure(500, format!("{e:#}")));
        }
    };

    match resolver.resolve(&request).await {
        Ok(distance) => Json(ApiResponse::success(distance.to_string(), "calculation succeeded")),
        Err(err) => {
            let code = err.status_code();
            warn!(method = %request.method, error = %err, "calculation failed");
            res.status_code(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
            Json(ApiResponse::failure(code, failure_description(&err)))
        }
    }
}

#[endpoint]
async fn health() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse { status: "healthy".into() }, "service is running"))
}

#[endpoint]
async fn index() -> Json<ApiResponse<ServiceInfo>> {
    let endpoint = |path: &str, method: &str, description: &str| EndpointInfo {
        path: path.into(),
        method: method.into(),
        description: description.into(),
    };
    Json(ApiResponse::success(
        ServiceInfo {
            service: "slider captcha distance service".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            endpoints: vec![
                endpoint("/api/calc", "POST", "calculate slider distance (URL, data URI or Base64 images)"),
                endpoint("/api/recommended-sizes", "GET", "suggested normalization widths"),
                endpoint("/status", "GET", "enabled detection methods"),
                endpoint("/health", "GET", "liveness check"),
            ],
        },
        "service is running",
    ))
}

#[endpoint]
async fn recommended_sizes() -> Json<ApiResponse<RecommendedSizes>> {
    Json(ApiResponse::success(
        RecommendedSizes {
            big_image_width: RECOMMENDED_BG_WIDTH,
            small_image_width: RECOMMENDED_SLIDER_WIDTH,
        },
        "recommended widths",
    ))
}

#[endpoint]
async fn service_status() -> Result<Json<ApiResponse<StatusResponse>>, StatusError> {
    let resolver = resolver().map_err(|e| {
        error!("{e:#}");
        StatusError::internal_server_error().brief(format!("{e:#}"))
    })?;
    let enabled_methods = [DetectionMethod::EdgeMatch, DetectionMethod::ModelInference]
        .into_iter()
        .map(|m| m.to_string())
        .collect();
    let default_method = DEFAULT_METHOD.get().copied().unwrap_or(DetectionMethod::ModelInference);

    Ok(Json(ApiResponse::success(
        StatusResponse {
            service_status: "running".into(),
            enabled_methods,
            default_method: default_method.to_string(),
            recognizer: resolver.recognizer_name().into(),
            model_digest: resolver.model_fingerprint(),
            edge_min_score: resolver.edge_params().min_score,
        },
        "success",
    )))
}

#[handler]
async fn request_timing(req: &mut Request, depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
    let started = Instant::now();
    ctrl.call_next(req, depot, res).await;
    let status_code = res.status_code.unwrap_or(StatusCode::OK).as_u16();
    info!(
        method = %req.method(),
        path = %req.uri().path(),
        status = status_code,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request finished"
    );
}

#[handler]
async fn custom_catcher(res: &mut Response, ctrl: &mut FlowCtrl) {
    // Handlers that already rendered an envelope keep it.
    if !res.body.is_none() {
        return;
    }
    if let Some(s_code) = res.status_code {
        let code = s_code.as_u16();
        let reason = s_code.canonical_reason().unwrap_or("Unknown Error");
        res.render(Json(ApiResponse::<()>::failure(code, reason)));
        ctrl.skip_rest();
    }
}

fn load_recognizer(path: &Path) -> anyhow::Result<Arc<dyn GapRecognizer>> {
    anyhow::ensure!(path.exists(), "gap model not found at {}", path.display());
    let recognizer = OnnxGapRecognizer::from_file(path)?;
    Ok(Arc::new(recognizer))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    salvo::http::request::set_global_secure_max_size(32 * 1024 * 1024);
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut resolver = Resolver::new(args.resolver_config()).context("building resolver")?;
    if let Some(path) = &args.det_path {
        let recognizer = load_recognizer(path).context("loading gap model")?;
        resolver = resolver.with_recognizer(recognizer);
    }
    info!(recognizer = resolver.recognizer_name(), default_method = %args.default_method, "resolver ready");
    RESOLVER
        .set(resolver)
        .map_err(|_| anyhow::anyhow!("resolver already initialized"))?;
    DEFAULT_METHOD
        .set(args.default_method)
        .map_err(|_| anyhow::anyhow!("default method already initialized"))?;

    let router = Router::new()
        .hoop(request_timing)
        .push(Router::with_path("api/calc").post(calc))
        .push(Router::with_path("api/recommended-sizes").get(recommended_sizes))
        .push(Router::with_path("health").get(health))
        .push(Router::with_path("status").get(service_status))
        .get(index);

    let doc = OpenApi::new("slidecalc", env!("CARGO_PKG_VERSION")).merge_router(&router);
    let router = router
        .unshift(doc.into_router("/api-doc/openapi.json"))
        .unshift(SwaggerUi::new("/api-doc/openapi.json").into_router("/docs"));

    let service = Service::new(router).catcher(Catcher::default().hoop(custom_catcher));
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    if args.address.starts_with('/') {
        let path = PathBuf::from(&args.address);
        info!(path = %path.display(), "listening on unix socket");
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let acceptor = salvo::conn::UnixListener::new(path).bind().await;
        let server = Server::new(acceptor);
        tokio::select! {
            _ = server.serve(service) => {},
            _ = tokio::signal::ctrl_c() => info!("shutting down (SIGINT)"),
            _ = terminate.recv() => info!("shutting down (SIGTERM)"),
        }
    } else {
        let addr = if args.address.parse::<u16>().is_ok() {
            format!("0.0.0.0:{}", args.address)
        } else {
            args.address.clone()
        };
        info!(%addr, "listening on tcp");
        let acceptor = TcpListener::new(addr).bind().await;
        let server = Server::new(acceptor);
        tokio::select! {
            _ = server.serve(service) => {},
            _ = tokio::signal::ctrl_c() => info!("shutting down (SIGINT)"),
            _ = terminate.recv() => info!("shutting down (SIGTERM)"),
        }
    }

    Ok(())
}
