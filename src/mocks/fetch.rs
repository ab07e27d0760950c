//! Host side of the network facade.
//!
//! The sandbox never touches a socket. Each `fetch()` call arrives here as a
//! [`FetchCall`] and is performed by a [`HostFetch`] under host policy.

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use url::Url;

use crate::bridge::{FetchCall, FetchRequest, FetchResponse};
use crate::config::FetchConfig;
use crate::sanitize::sanitize_error_message;

/// Performs fetches on behalf of sandboxes.
#[async_trait]
pub trait HostFetch: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, Error>;
}

/// [`HostFetch`] over HTTP with an origin allowlist.
pub struct HttpFetch {
    client: Client,
    config: FetchConfig,
}

impl HttpFetch {
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client, config })
    }

    fn check_origin(&self, url: &Url) -> Result<(), Error> {
        if !self.config.is_origin_allowed(url) {
            return Err(anyhow!(
                "origin '{}' is not in the allowlist",
                url.origin().ascii_serialization()
            ));
        }
        Ok(())
    }
}

fn parse_method(method: &str) -> Result<Method, Error> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        other => Err(anyhow!("unsupported HTTP method: {}", other)),
    }
}

/// Method and body for the next hop of a redirect.
fn redirect_method(status: StatusCode, method: Method, body: Option<Vec<u8>>) -> (Method, Option<Vec<u8>>) {
    match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => (method, body),
        StatusCode::SEE_OTHER if method != Method::HEAD => (Method::GET, None),
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if method == Method::POST => (Method::GET, None),
        _ => (method, body),
    }
}

#[async_trait]
impl HostFetch for HttpFetch {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, Error> {
        let mut url = Url::parse(&request.url).map_err(|e| anyhow!("invalid URL '{}': {}", request.url, e))?;
        self.check_origin(&url)?;
        let origin = url.origin();
        let mut method = parse_method(&request.method)?;
        let mut body = request.body;
        let mut redirects = 0;

        loop {
            let mut builder = self.client.request(method.clone(), url.clone());
            for (key, value) in &request.headers {
                builder = builder.header(key, value);
            }
            if let Some(bytes) = &body {
                builder = builder.body(bytes.clone());
            }

            let response = builder.send().await.map_err(|e| anyhow!("{}", e.without_url()))?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response.headers().get(reqwest::header::LOCATION) {
                    let location = location.to_str().map_err(|_| anyhow!("invalid redirect location"))?;
                    let next = url.join(location).map_err(|e| anyhow!("invalid redirect URL: {}", e))?;

                    if next.origin() != origin {
                        return Err(anyhow!(
                            "redirect to different origin '{}' is blocked",
                            next.origin().ascii_serialization()
                        ));
                    }
                    if redirects >= self.config.max_redirects {
                        return Err(anyhow!("too many redirects (max {})", self.config.max_redirects));
                    }
                    redirects += 1;
                    (method, body) = redirect_method(status, method, body);
                    url = next;
                    continue;
                }
            }

            let headers = response
                .headers()
                .iter()
                .filter_map(|(key, value)| value.to_str().ok().map(|v| (key.to_string(), v.to_string())))
                .collect();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| anyhow!("failed to read response body: {}", e.without_url()))?;

            return Ok(FetchResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                headers,
                url: url.to_string(),
                body: bytes.to_vec(),
            });
        }
    }
}

/// Serves fetch calls from one sandbox until it is disposed. Calls are served
/// concurrently and resolve in whatever order they complete. At most
/// `max_in_flight` are outstanding; calls beyond that are rejected.
pub(crate) async fn serve_fetches(
    deployment_id: String,
    fetcher: Arc<dyn HostFetch>,
    max_in_flight: usize,
    mut calls: mpsc::UnboundedReceiver<FetchCall>,
    mut disposed: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = disposed.wait_for(|d| *d) => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            call = calls.recv() => match call {
                Some(FetchCall { reply, .. }) if tasks.len() >= max_in_flight => {
                    tracing::warn!(deployment = %deployment_id, max_in_flight, "fetch rejected, too many in flight");
                    let _ = reply.send(Err(format!("too many fetches in flight (max {max_in_flight})")));
                }
                Some(FetchCall { request, reply }) => {
                    let fetcher = fetcher.clone();
                    let deployment_id = deployment_id.clone();
                    tasks.spawn(async move {
                        let url = request.url.clone();
                        let result = fetcher.fetch(request).await.map_err(|e| {
                            tracing::debug!(deployment = %deployment_id, url = %url, error = %e, "fetch failed");
                            sanitize_error_message(&e.to_string())
                        });
                        let _ = reply.send(result);
                    });
                }
                None => break,
            },
        }
    }
    tasks.abort_all();
}
