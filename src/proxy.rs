//! HTTP forwarder.
//!
//! Every request is sent to the configured upstream with the `Host` header
//! rewritten and hop-by-hop headers removed. Response bodies are buffered in
//! full and handed to the pipeline before anything is written back to the
//! client.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::headers::BodyOutcome;
use crate::pipeline::process_response;

type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Body type of every response written to the client.
pub type ReplyBody = BoxBody<Bytes, Infallible>;

/// One buffered chunk with no declared length. The server frames it chunked
/// instead of deriving a `Content-Length` from it.
struct UnsizedBody(Option<Bytes>);

impl Body for UnsizedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        Poll::Ready(self.0.take().map(|chunk| Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.0.is_none()
    }
}

/// Rebuilt bodies go out without a length; untouched bodies keep an exact one.
fn reply_body(body: Bytes, outcome: BodyOutcome) -> ReplyBody {
    match outcome {
        BodyOutcome::PassThrough => Full::new(body).boxed(),
        BodyOutcome::Transformed { .. } => UnsizedBody(Some(body)).boxed(),
    }
}

/// Connection-scoped headers that must not be relayed to the upstream.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Forwards requests to the upstream and runs responses through the pipeline.
#[derive(Clone)]
pub struct ProxyService {
    client: UpstreamClient,
    config: Arc<ProxyConfig>,
}

impl ProxyService {
    pub fn new(config: ProxyConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .build_http::<Full<Bytes>>();
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Never fails: forwarding errors become a 502 for this request only.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ReplyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.forward(req).await {
            Ok(res) => res,
            Err(e) => {
                error!(method = %method, uri = %uri, error = %e, "forwarding failed");
                bad_gateway()
            }
        }
    }

    async fn forward(&self, req: Request<Incoming>) -> ProxyResult<Response<ReplyBody>> {
        let target = self.target_uri(req.uri())?;
        let authority = self.config.upstream_authority();

        let (mut parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();

        debug!(method = %parts.method, target = %target, "forwarding request");

        parts.uri = target.clone();
        parts.headers = end_to_end_headers(&parts.headers);
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::InvalidUri(format!("{authority}: {e}")))?;
        parts.headers.insert(HOST, host);

        let upstream_res = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|e| ProxyError::Connection(format!("{target}: {e}")))?;

        let (mut parts, body) = upstream_res.into_parts();
        let body = body.collect().await?.to_bytes();

        let processed = process_response(&target.to_string(), &parts.headers, body, &self.config.trace);
        parts.headers = processed.headers;

        Ok(Response::from_parts(parts, reply_body(processed.body, processed.outcome)))
    }

    /// Upstream origin and base path joined with the client's path and query.
    fn target_uri(&self, incoming: &Uri) -> ProxyResult<Uri> {
        let upstream = &self.config.upstream;
        let base = upstream.path().trim_end_matches('/');
        let path_and_query = incoming
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{}{}{}", self.config.upstream_authority(), base, path_and_query)
            .parse()
            .map_err(|e| ProxyError::InvalidUri(format!("{path_and_query}: {e}")))
    }
}

fn bad_gateway() -> Response<ReplyBody> {
    let mut res = Response::new(Full::new(Bytes::from_static(b"Bad Gateway")).boxed());
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

/// Bind the configured address and serve until the future is dropped.
pub async fn serve(config: ProxyConfig) -> ProxyResult<()> {
    let listener = TcpListener::bind(config.listen).await?;
    serve_listener(listener, config).await
}

/// Accept loop over an already bound listener. One task per connection.
pub async fn serve_listener(listener: TcpListener, config: ProxyConfig) -> ProxyResult<()> {
    let service = ProxyService::new(config);
    info!(addr = %listener.local_addr()?, upstream = %service.config().upstream, "listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move { serve_connection(stream, peer, service).await });
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, peer: SocketAddr, service: ProxyService) {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, svc)
        .await
    {
        debug!(peer = %peer, error = %e, "connection closed with error");
    }
}
