use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use axum::http::{Request, Response};
use futures_core::Stream;
use http_body_util::BodyExt;
use reqwest::Client;
use tokio::time::timeout;

use crate::gate::Admission;
use crate::generation::GenerationLease;
use crate::proxy::error::ProxyError;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == CONNECTION
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// Forwards admitted requests to the generation they were bound to.
pub struct UpstreamClient {
    client: Client,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Send `req` to the admission's generation. The admission's lease moves
    /// into the response body, so the generation is not retired until the
    /// body has been fully streamed or dropped.
    pub async fn forward(
        &self,
        req: Request<Body>,
        admission: Admission,
    ) -> Result<Response<Body>, ProxyError> {
        let result = timeout(self.request_timeout, self.send(req, &admission)).await;

        let upstream_resp = match result {
            Ok(response) => response?,
            Err(_) => {
                return Err(ProxyError::RequestTimeout {
                    duration: self.request_timeout.as_secs(),
                })
            }
        };

        let mut response_builder = Response::builder().status(upstream_resp.status());
        for (name, value) in upstream_resp.headers() {
            if !is_hop_by_hop(name) {
                response_builder = response_builder.header(name, value);
            }
        }

        let stream = LeasedStream {
            inner: Box::pin(upstream_resp.bytes_stream()),
            _lease: admission.into_lease(),
        };
        Ok(response_builder.body(Body::from_stream(stream))?)
    }

    async fn send(
        &self,
        req: Request<Body>,
        admission: &Admission,
    ) -> Result<reqwest::Response, ProxyError> {
        let method = req.method().clone();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let upstream_uri = format!("{}{}", admission.artifact().base_url, path_and_query);
        let mut builder = self.client.request(method, upstream_uri);

        for (name, value) in req.headers() {
            if name != HOST && !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }

        let body_bytes = req
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::InvalidRequest(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        builder
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| ProxyError::ConnectionError {
                generation: admission.generation().id(),
                source: e,
            })
    }
}

/// Response body stream that keeps its generation leased until dropped.
struct LeasedStream {
    inner: ByteStream,
    _lease: GenerationLease,
}

impl Stream for LeasedStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
