//! Shared helpers for route handlers
//!
//! JSON responses, the `{ error, code }` error body, body parsing and query
//! string handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::error;

use crate::ledger::PageRequest;
use crate::types::{Result, UplineError};

pub type FullBody = Full<Bytes>;

/// Largest JSON body accepted by any endpoint
pub const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<FullBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("Cache-Control", "no-store")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

pub fn error_response(status: StatusCode, error: &str, code: &str) -> Response<FullBody> {
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        },
    )
}

/// Map a service error to its status and body; server-side failures are logged
pub fn error_from(err: UplineError) -> Response<FullBody> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(code = err.code(), "Request failed: {}", err);
    }
    error_response(status, &err.to_string(), err.code())
}

/// 200 (or `status`) with the value, or the mapped error
pub fn respond<T: Serialize>(status: StatusCode, result: Result<T>) -> Response<FullBody> {
    match result {
        Ok(body) => json_response(status, &body),
        Err(e) => error_from(e),
    }
}

pub fn success_response(message: impl Into<String>) -> Response<FullBody> {
    json_response(
        StatusCode::OK,
        &SuccessResponse {
            success: true,
            message: message.into(),
        },
    )
}

pub fn preflight_response() -> Response<FullBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "Authorization, Content-Type")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
        .header("Access-Control-Max-Age", "3600")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub fn not_found_response(path: &str) -> Response<FullBody> {
    error_response(
        StatusCode::NOT_FOUND,
        &format!("No route for {path}"),
        "NOT_FOUND",
    )
}

pub fn method_not_allowed() -> Response<FullBody> {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed",
        "METHOD_NOT_ALLOWED",
    )
}

pub fn get_auth_header(req: &Request<Incoming>) -> Option<&str> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Read and decode a JSON body, refusing anything over [`MAX_BODY_BYTES`]
pub async fn parse_json_body<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| UplineError::BadRequest(format!("Failed to read body: {e}")))?
        .to_bytes();
    decode_json(&body)
}

pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| UplineError::BadRequest(format!("Invalid JSON: {e}")))
}

/// The `{id}` in `/{id}` or `/{id}/{suffix}` under a stripped prefix
pub fn path_id<'a>(subpath: &'a str, suffix: Option<&str>) -> Option<&'a str> {
    let rest = subpath.strip_prefix('/')?;
    let id = match suffix {
        Some(suffix) => rest.strip_suffix(suffix)?.strip_suffix('/')?,
        None => rest,
    };
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Decoded query string
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    params: HashMap<String, String>,
}

impl QueryParams {
    pub fn from_query_string(query: Option<&str>) -> Self {
        let mut params = HashMap::new();
        if let Some(q) = query {
            for pair in q.split('&') {
                if let Some((key, value)) = pair.split_once('=') {
                    let value = urlencoding::decode(&value.replace('+', " "))
                        .map(|v| v.into_owned())
                        .unwrap_or_default();
                    params.insert(key.to_string(), value);
                }
            }
        }
        Self { params }
    }

    /// First non-empty value under any of `keys`
    pub fn get(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.params.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    pub fn parse<T: FromStr>(&self, keys: &[&str]) -> Option<T> {
        self.get(keys).and_then(|v| v.parse().ok())
    }

    /// `page`/`limit`, defaulting to 1 and 20 and clamped by `PageRequest`
    pub fn page(&self) -> PageRequest {
        PageRequest::new(
            self.parse(&["page"]).unwrap_or(1),
            self.parse(&["limit"]).unwrap_or(20),
        )
    }
}
