//! Background callback server for exfiltration and XSS-style challenges.

use crate::domain::model::CapturedRequest;
use crate::template::render_placeholders;
use crate::utils::error::{CtfError, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const DEFAULT_INDEX: &str = "ok";
/// Captured requests kept until the handle reads them.
pub const DEFAULT_CAPTURE_CAPACITY: usize = 1024;

#[derive(Clone)]
struct ServerState {
    index: Arc<String>,
    requests: mpsc::Sender<CapturedRequest>,
}

pub struct CallbackServer {
    bind: IpAddr,
    port: u16,
    index: String,
    capacity: usize,
}

impl CallbackServer {
    pub fn new(port: u16) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            index: DEFAULT_INDEX.to_string(),
            capacity: DEFAULT_CAPTURE_CAPACITY,
        }
    }

    /// Requests beyond `capacity` unread ones are answered but not queued.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// HTML served on `GET /`.
    pub fn with_index(mut self, html: impl Into<String>) -> Self {
        self.index = html.into();
        self
    }

    /// Renders `{{key}}` placeholders of the index page.
    pub fn with_index_template(self, template: &str, vars: &[(&str, &str)]) -> Self {
        let html = render_placeholders(template, vars);
        self.with_index(html)
    }

    /// Binds the listener, then serves in a background task.
    pub async fn spawn(self) -> Result<CallbackHandle> {
        let listener = tokio::net::TcpListener::bind((self.bind, self.port)).await?;
        let local_addr = listener.local_addr()?;
        let (request_tx, request_rx) = mpsc::channel(self.capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = ServerState {
            index: Arc::new(self.index),
            requests: request_tx,
        };
        let app = Router::new()
            .route("/", get(index).fallback(catch_all))
            .fallback(catch_all)
            .with_state(state);

        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        tracing::info!("🌐 Callback server listening on {}", local_addr);
        Ok(CallbackHandle {
            local_addr,
            requests: request_rx,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

pub struct CallbackHandle {
    local_addr: SocketAddr,
    requests: mpsc::Receiver<CapturedRequest>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl CallbackHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL reachable from this host. A wildcard bind maps to loopback.
    pub fn url(&self) -> String {
        let ip = if self.local_addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.local_addr.ip()
        };
        format!("http://{}/", SocketAddr::new(ip, self.local_addr.port()))
    }

    pub async fn next_request(&mut self, timeout: Duration) -> Result<CapturedRequest> {
        match tokio::time::timeout(timeout, self.requests.recv()).await {
            Ok(Some(request)) => Ok(request),
            Ok(None) => Err(CtfError::processing("callback server stopped")),
            Err(_) => Err(CtfError::timeout("waiting for a callback request")),
        }
    }

    /// Next captured request, or `None` once the server has stopped.
    pub async fn recv(&mut self) -> Option<CapturedRequest> {
        self.requests.recv().await
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.wait().await
    }

    /// Waits for the server task to finish.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| CtfError::processing(format!("callback server task failed: {}", e)))??;
        Ok(())
    }
}

fn capture(
    state: &ServerState,
    remote_addr: SocketAddr,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) {
    let request = CapturedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
        remote_addr: Some(remote_addr),
        received_at: Utc::now(),
    };

    tracing::info!(
        "📥 [{}][{}][{}]",
        remote_addr,
        request.method,
        uri
    );
    if !request.body.is_empty() {
        tracing::info!("📥 body: {}", request.body_text());
    }
    tracing::debug!("📥 headers: {:?}", request.headers);

    match state.requests.try_send(request) {
        Ok(()) => {}
        Err(TrySendError::Full(request)) => {
            tracing::warn!(
                "Capture queue full, dropping {} {}",
                request.method,
                request.path
            );
        }
        // 沒有人在收的時候直接丟掉
        Err(TrySendError::Closed(_)) => {}
    }
}

async fn index(
    State(state): State<ServerState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Html<String> {
    capture(&state, remote_addr, method, uri, headers, body);
    Html(state.index.as_str().to_string())
}

async fn catch_all(
    State(state): State<ServerState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    capture(&state, remote_addr, method, uri, headers, body);
    DEFAULT_INDEX
}
