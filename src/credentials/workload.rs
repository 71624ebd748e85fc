//! Edge workload API client
//!
//! The workload API is the local proxy in front of the device's security
//! module. Two calls are used:
//!
//! - `POST /modules/{module}/genid/{generation}/sign` signs token material with the module key
//! - `GET /trust-bundle` returns the CA bundle the broker certificate chains to
//!
//! The runtime usually exposes it on a Unix domain socket (`unix://`), which
//! is spoken with a bare `hyper` HTTP/1 connection; `http(s)://` endpoints go
//! through `reqwest`.

use super::{CredentialError, SigningService};
use crate::config::ModuleIdentity;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const SIGN_ALGORITHM: &str = "HMACSHA256";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest error body echoed back in a [`CredentialError::Rejected`]
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    key_id: &'a str,
    algo: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct TrustBundleResponse {
    certificate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
enum Endpoint {
    Http { base: String, client: Client },
    Unix { socket_path: PathBuf },
}

/// Workload API client implementing [`SigningService`]
#[derive(Debug, Clone)]
pub struct WorkloadClient {
    endpoint: Endpoint,
    module_id: String,
    generation_id: String,
    api_version: String,
    key_id: String,
}

impl WorkloadClient {
    /// Build a client for the identity's workload endpoint
    pub fn new(identity: &ModuleIdentity, key_id: &str) -> Result<Self, CredentialError> {
        let url = Url::parse(&identity.workload_uri)
            .map_err(|e| CredentialError::UnsupportedUri(format!("{}: {e}", identity.workload_uri)))?;

        let endpoint = match url.scheme() {
            "unix" => Endpoint::Unix {
                socket_path: PathBuf::from(url.path()),
            },
            "http" | "https" => {
                let client = Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .user_agent(USER_AGENT)
                    .build()
                    .map_err(|e| CredentialError::Unreachable(e.to_string()))?;
                Endpoint::Http {
                    base: identity.workload_uri.trim_end_matches('/').to_string(),
                    client,
                }
            }
            other => {
                return Err(CredentialError::UnsupportedUri(format!(
                    "scheme '{other}' in {}",
                    identity.workload_uri
                )))
            }
        };

        Ok(Self {
            endpoint,
            module_id: identity.module_id.clone(),
            generation_id: identity.module_generation_id.clone(),
            api_version: identity.api_version.clone(),
            key_id: key_id.to_string(),
        })
    }

    /// Request path for signing, without the query string
    pub fn sign_path(&self) -> String {
        format!(
            "/modules/{}/genid/{}/sign",
            url_path_segment(&self.module_id),
            url_path_segment(&self.generation_id)
        )
    }

    /// Path plus the api-version query
    fn path_and_query(&self, path: &str) -> String {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("api-version", &self.api_version)
            .finish();
        format!("{path}?{query}")
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, CredentialError> {
        let path_and_query = self.path_and_query(path);
        debug!(target: "workload", ?method, path = %path, "Calling workload API");

        let (status, bytes) = match &self.endpoint {
            Endpoint::Http { base, client } => {
                send_http(client, method, &format!("{base}{path_and_query}"), body).await?
            }
            Endpoint::Unix { socket_path } => {
                send_unix(socket_path, method, &path_and_query, body).await?
            }
        };

        decode_response(status, &bytes)
    }
}

#[async_trait]
impl SigningService for WorkloadClient {
    async fn sign(&self, data: &str) -> Result<String, CredentialError> {
        let request = SignRequest {
            key_id: &self.key_id,
            algo: SIGN_ALGORITHM,
            data: BASE64.encode(data.as_bytes()),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| CredentialError::MalformedResponse(e.to_string()))?;

        let response: SignResponse = self
            .request(Method::Post, &self.sign_path(), Some(body))
            .await?;
        if response.digest.is_empty() {
            return Err(CredentialError::MalformedResponse(
                "empty digest in sign response".to_string(),
            ));
        }
        Ok(response.digest)
    }

    async fn trust_bundle(&self) -> Result<String, CredentialError> {
        let response: TrustBundleResponse =
            self.request(Method::Get, "/trust-bundle", None).await?;
        if response.certificate.trim().is_empty() {
            return Err(CredentialError::MalformedResponse(
                "empty certificate in trust bundle response".to_string(),
            ));
        }
        Ok(response.certificate)
    }
}

fn url_path_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

async fn send_http(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Vec<u8>>,
) -> Result<(u16, Vec<u8>), CredentialError> {
    let builder = match method {
        Method::Get => client.get(url),
        Method::Post => client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.unwrap_or_default()),
    };

    let response = builder
        .send()
        .await
        .map_err(|e| CredentialError::Unreachable(e.to_string()))?;
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| CredentialError::Unreachable(e.to_string()))?;
    Ok((status, bytes.to_vec()))
}

#[cfg(unix)]
async fn send_unix(
    socket_path: &std::path::Path,
    method: Method,
    path_and_query: &str,
    body: Option<Vec<u8>>,
) -> Result<(u16, Vec<u8>), CredentialError> {
    use hyper::header::{CONTENT_TYPE, HOST, USER_AGENT as USER_AGENT_HEADER};
    use hyper::{Body, Request};

    let unreachable =
        |e: &dyn std::fmt::Display| CredentialError::Unreachable(format!("{}: {e}", socket_path.display()));

    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .map_err(|e| unreachable(&e))?;
    let (mut sender, connection) = hyper::client::conn::handshake(stream)
        .await
        .map_err(|e| unreachable(&e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(target: "workload", "Workload connection closed: {}", e);
        }
    });

    let mut builder = Request::builder()
        .uri(path_and_query)
        .header(HOST, "localhost")
        .header(USER_AGENT_HEADER, USER_AGENT);
    builder = match method {
        Method::Get => builder.method(hyper::Method::GET),
        Method::Post => builder
            .method(hyper::Method::POST)
            .header(CONTENT_TYPE, "application/json"),
    };
    let request = builder
        .body(Body::from(body.unwrap_or_default()))
        .map_err(|e| unreachable(&e))?;

    let response = tokio::time::timeout(REQUEST_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| CredentialError::Unreachable(format!("{}: request timed out", socket_path.display())))?
        .map_err(|e| unreachable(&e))?;
    let status = response.status().as_u16();
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| unreachable(&e))?;
    Ok((status, bytes.to_vec()))
}

#[cfg(not(unix))]
async fn send_unix(
    socket_path: &std::path::Path,
    _method: Method,
    _path_and_query: &str,
    _body: Option<Vec<u8>>,
) -> Result<(u16, Vec<u8>), CredentialError> {
    Err(CredentialError::UnsupportedUri(format!(
        "unix socket {} on a platform without Unix sockets",
        socket_path.display()
    )))
}

/// Map an HTTP status and body onto a typed response or a credential error
fn decode_response<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, CredentialError> {
    if !(200..300).contains(&status) {
        let mut message = String::from_utf8_lossy(body).trim().to_string();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push_str("...");
        }
        return Err(CredentialError::Rejected { status, message });
    }

    serde_json::from_slice(body).map_err(|e| CredentialError::MalformedResponse(e.to_string()))
}
