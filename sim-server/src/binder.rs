//! Serves core route tables with axum.
//!
//! Handlers are blocking, so each request runs on tokio's blocking pool the
//! way the ESP-IDF httpd runs them on its own task.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method as HttpMethod, StatusCode, Uri};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router;
use moe_telemetry::error::ListenerError;
use moe_telemetry::http::{HttpBinder, HttpHandler, Listener, Method, Request, Response};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub struct AxumBinder {
    runtime: Handle,
}

impl AxumBinder {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

pub fn router(handler: Arc<dyn HttpHandler>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(
    State(handler): State<Arc<dyn HttpHandler>>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AxumResponse {
    let method = match method {
        HttpMethod::GET => Method::Get,
        HttpMethod::POST => Method::Post,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let path = uri.path().to_string();
    let routed = handler
        .routes()
        .iter()
        .any(|r| r.method == method && r.path == path);
    if !routed && !handler.captures_unmatched() {
        return convert(Response::not_found());
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let worker = handler.clone();
    let reply = tokio::task::spawn_blocking(move || {
        let mut body: &[u8] = &body;
        worker.handle(Request {
            method,
            path: &path,
            content_type: content_type.as_deref(),
            body: &mut body,
        })
    })
    .await;

    match reply {
        Ok(reply) => {
            let followup = reply.followup;
            tokio::task::spawn_blocking(move || handler.complete(followup));
            convert(reply.response)
        }
        Err(e) => {
            warn!("handler failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn convert(response: Response) -> AxumResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body.into_owned(),
    )
        .into_response()
}

struct AxumListener {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Listener for AxumListener {
    fn close(mut self: Box<Self>) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let deadline = Instant::now() + DRAIN_GRACE;
        while !self.task.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !self.task.is_finished() {
            debug!("port {}: dropping idle connections", self.port);
            self.task.abort();
        }
        info!("port {}: closed", self.port);
    }
}

impl HttpBinder for AxumBinder {
    fn bind(&self, port: u16, handler: Arc<dyn HttpHandler>) -> Result<Box<dyn Listener>, ListenerError> {
        let bind_error = |e: std::io::Error| ListenerError::Bind {
            port,
            reason: e.to_string(),
        };
        let socket = std::net::TcpListener::bind(("0.0.0.0", port)).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        let _guard = self.runtime.enter();
        let listener = tokio::net::TcpListener::from_std(socket).map_err(bind_error)?;
        let (tx, rx) = oneshot::channel();
        let app = router(handler);
        let task = self.runtime.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!("port {}: server error: {}", port, e);
            }
        });

        info!("listening on http://0.0.0.0:{}", port);
        Ok(Box::new(AxumListener {
            port,
            shutdown: Some(tx),
            task,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use moe_telemetry::http::{Followup, Reply, Route};
    use moe_telemetry::platform::RestartCause;
    use tower::ServiceExt;

    use super::*;

    const ROUTES: &[Route] = &[Route::get("/ping"), Route::post("/echo")];

    #[derive(Default)]
    struct Echo {
        captive: bool,
        completed: Mutex<Vec<Followup>>,
    }

    impl HttpHandler for Echo {
        fn routes(&self) -> &'static [Route] {
            ROUTES
        }

        fn captures_unmatched(&self) -> bool {
            self.captive
        }

        fn handle(&self, request: Request<'_>) -> Reply {
            match (request.method, request.path) {
                (Method::Get, "/ping") => Response::text(200, "pong").into(),
                (Method::Post, "/echo") => {
                    let mut body = Vec::new();
                    request.body.read_to_end(&mut body).unwrap();
                    let ct = request.content_type.unwrap_or("none").to_string();
                    body.extend_from_slice(format!("|{}", ct).as_bytes());
                    Reply::then_restart(
                        Response::new(201, "text/plain", body),
                        RestartCause::CredentialsSaved,
                    )
                }
                _ => Response::text(200, "captured").into(),
            }
        }

        fn complete(&self, followup: Followup) {
            self.completed.lock().unwrap().push(followup);
        }
    }

    async fn send(handler: Arc<Echo>, request: HttpRequest<Body>) -> (StatusCode, String) {
        let response = router(handler).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn routed_get() {
        let (status, body) = send(
            Arc::new(Echo::default()),
            HttpRequest::get("/ping").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn post_body_and_content_type_reach_handler() {
        let handler = Arc::new(Echo::default());
        let request = HttpRequest::post("/echo")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .unwrap();
        let (status, body) = send(handler.clone(), request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "hello|text/plain");

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.completed.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            handler.completed.lock().unwrap()[0],
            Followup::Restart(RestartCause::CredentialsSaved)
        );
    }

    #[tokio::test]
    async fn unmatched_is_404_unless_captured() {
        let (status, _) = send(
            Arc::new(Echo::default()),
            HttpRequest::get("/hotspot-detect.html").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let captive = Arc::new(Echo {
            captive: true,
            ..Echo::default()
        });
        let (status, body) = send(
            captive,
            HttpRequest::get("/hotspot-detect.html").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "captured");
    }

    #[tokio::test]
    async fn other_methods_are_refused() {
        let (status, _) = send(
            Arc::new(Echo::default()),
            HttpRequest::delete("/ping").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
