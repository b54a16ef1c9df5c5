use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::{OriginalUri, State};
use axum::http::header::{CONTENT_TYPE, COOKIE, EXPIRES, HOST, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use offerpage_config::Config;
use offerpage_contracts::MergedResult;
use offerpage_kernel::{http_date, render_page, set_cookie_header};
use tracing::{error, info, warn};

pub mod orchestrator;
pub mod target;

pub use orchestrator::{handle_page, PageError, PageInputs, PageSettings};
pub use target::{OfferCall, OfferProvider, TargetClient, TargetError};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    let local = listener
        .local_addr()
        .map_err(|e| format!("bind failed: {e}"))?;
    info!("listening on {local}");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let provider = TargetClient::new(&cfg.target)?;
    build_app_with_provider(cfg, Arc::new(provider)).await
}

/// Builds the router around any offer provider; tests pass a mock here.
pub async fn build_app_with_provider(
    cfg: Config,
    provider: Arc<dyn OfferProvider>,
) -> Result<Router, String> {
    let state = AppState::new(cfg, provider).await?;
    Ok(Router::new()
        .route("/", get(page))
        .route("/healthz", get(healthz))
        .fallback(static_file)
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    settings: Arc<PageSettings>,
    template: Arc<str>,
    static_dir: Arc<PathBuf>,
    provider: Arc<dyn OfferProvider>,
}

impl AppState {
    async fn new(cfg: Config, provider: Arc<dyn OfferProvider>) -> Result<Self, String> {
        let template = tokio::fs::read_to_string(&cfg.server.template_path)
            .await
            .map_err(|e| format!("read template {} failed: {e}", cfg.server.template_path))?;
        let static_dir = PathBuf::from(&cfg.server.static_dir);
        if !static_dir.is_dir() {
            warn!(
                static_dir = %static_dir.display(),
                "static directory does not exist; static files will 404"
            );
        }
        Ok(Self {
            settings: Arc::new(PageSettings::from_config(&cfg)),
            template: Arc::from(template),
            static_dir: Arc::new(static_dir),
            provider,
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn page(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let original_url = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let inputs = PageInputs::new(
        host,
        original_url,
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    );

    match handle_page(state.provider.as_ref(), &state.settings, &inputs).await {
        Ok(merged) => render_success(&state.template, &state.settings.organization_id, &merged),
        Err(err) => render_failure(&err.to_string()),
    }
}

fn render_success(template: &str, organization_id: &str, merged: &MergedResult) -> Response {
    let now = Utc::now();
    let body = match render_page(template, organization_id, merged) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "page render failed");
            return render_failure(&e);
        }
    };
    let mut response = (StatusCode::OK, body).into_response();
    apply_page_headers(response.headers_mut(), now);
    if let Some(cookie) = &merged.target_cookie {
        match HeaderValue::from_str(&set_cookie_header(cookie, now)) {
            Ok(v) => {
                response.headers_mut().append(SET_COOKIE, v);
            }
            Err(e) => warn!(cookie = %cookie.name, error = %e, "dropping unencodable cookie"),
        }
    }
    response
}

fn render_failure(message: &str) -> Response {
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response();
    apply_page_headers(response.headers_mut(), Utc::now());
    response
}

fn apply_page_headers(headers: &mut HeaderMap, now: DateTime<Utc>) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    if let Ok(v) = HeaderValue::from_str(&http_date(now)) {
        headers.insert(EXPIRES, v);
    }
}

async fn static_file(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(path) = static_path(&state.static_dir, uri.path()) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            ([(CONTENT_TYPE, mime.to_string())], bytes).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Maps a request path under `root`, refusing anything that could escape it.
fn static_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if path == root || request_path.contains('\\') {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_path_rejects_traversal() {
        let root = Path::new("/srv/public");
        assert_eq!(
            static_path(root, "/js/VisitorAPI.js"),
            Some(PathBuf::from("/srv/public/js/VisitorAPI.js"))
        );
        assert_eq!(static_path(root, "/../secret"), None);
        assert_eq!(static_path(root, "/a/../../secret"), None);
        assert_eq!(static_path(root, "/"), None);
        assert_eq!(static_path(root, "/a\\..\\b"), None);
    }

    #[test]
    fn failure_response_has_page_headers_and_no_cookie() {
        let response = render_failure("target request timed out after 10000ms");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
        assert!(response.headers().contains_key(EXPIRES));
        assert!(!response.headers().contains_key(SET_COOKIE));
    }
}
