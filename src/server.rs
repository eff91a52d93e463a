use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::resolver_dispatcher::{ErrorCode, Response as ApiResponse, ResponseError};
use crate::{Caller, Gateway, Role, WireRequest};

/// Headers set by the identity collaborator in front of this server.
pub const ROLE_HEADER: &str = "x-caller-role";
pub const IDENTITY_HEADER: &str = "x-caller-id";

type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    let json = serde_json::to_string(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(json))
        .unwrap_or_else(|_| internal_server_error())
}

fn bad_request(message: String) -> Response<ResponseBody> {
    let failure =
        ApiResponse::failure(ResponseError::new(ErrorCode::BadRequest, message, Vec::new()));
    json_response(StatusCode::BAD_REQUEST, &failure.to_json())
}

fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<ResponseBody>, Infallible> {
    let caller = extract_caller(&req);

    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return Ok(bad_request(format!("Failed to read request body: {}", e))),
            };

            match serde_json::from_slice::<WireRequest>(&body_bytes) {
                Ok(request) => {
                    let response = gateway.process_request(request, caller).await;
                    json_response(StatusCode::OK, &response.to_json())
                }
                Err(e) => bad_request(format!("Invalid JSON request: {}", e)),
            }
        }

        (&Method::GET, "/schema") => json_response(StatusCode::OK, &gateway.schema().to_json()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(result)
}

/// Caller identity as asserted by upstream headers. Missing or unreadable
/// headers leave the caller anonymous.
fn extract_caller(req: &Request<Incoming>) -> Caller {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    Caller {
        id: header(IDENTITY_HEADER),
        role: header(ROLE_HEADER).map(Role::new),
    }
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

/// Accepts connections until `shutdown` resolves. Each connection is served
/// on its own task.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    tokio::pin!(shutdown);

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, gateway.clone()));

            match hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                Ok(_) => debug!(%remote, "connection closed"),
                Err(e) => error!(%remote, error = %e, "error processing connection"),
            }
        });
    }
}
