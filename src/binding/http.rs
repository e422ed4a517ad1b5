//! HTTP binding.
//!
//! One catch-all route accepts every method and path, translates the
//! HTTP request into a [`RawRequest`], hands it to the CSE, and maps the
//! response status code back onto HTTP. Method mapping: GET retrieves,
//! POST with a `ty` content-type parameter creates (without one it is a
//! NOTIFY), PUT updates, DELETE deletes. PATCH is tolerated as DELETE
//! for HTTP/1.0 peers that cannot send DELETE.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use log::{debug, warn};
use std::sync::Arc;

use crate::cse::{Cse, CseResponse};
use crate::request::{Operation, RawRequest};

use super::headers;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the axum router serving the oneM2M HTTP binding.
pub fn router(cse: Arc<Cse>) -> Router {
    Router::new().fallback(handle).with_state(cse)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(cse: Arc<Cse>) -> std::io::Result<()> {
    let addr = format!("{}:{}", cse.config.http_interface, cse.config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    debug!("HTTP binding listening on {addr}");
    axum::serve(listener, router(cse)).await
}

async fn handle(State(cse): State<Arc<Cse>>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let content_type = request
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let operation = match method.as_str() {
        "GET" => Operation::Retrieve,
        "POST" => {
            if content_type.as_deref().is_some_and(|ct| ct.contains("ty=")) {
                Operation::Create
            } else {
                Operation::Notify
            }
        }
        "PUT" => Operation::Update,
        "DELETE" | "PATCH" => Operation::Delete,
        _ => {
            return plain_status(StatusCode::METHOD_NOT_ALLOWED);
        }
    };

    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let query: Vec<(String, String)> = uri
        .query()
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default();

    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(bytes.to_vec()),
        Err(err) => {
            warn!("could not read request body: {err}");
            return plain_status(StatusCode::BAD_REQUEST);
        }
    };

    let mut path = uri.path().to_string();
    let root = cse.config.http_root.trim_end_matches('/');
    if !root.is_empty() {
        path = path
            .strip_prefix(root)
            .map(str::to_string)
            .unwrap_or(path);
    }
    let path = path.trim_start_matches('/').to_string();

    let raw = RawRequest {
        operation,
        path,
        headers,
        query,
        body,
        content_type,
    };
    let response = cse.handle_raw_request(raw).await;
    into_http(response)
}

fn into_http(response: CseResponse) -> Response {
    let status =
        StatusCode::from_u16(response.rsc.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder()
        .status(status)
        .header(headers::RESPONSE_STATUS, response.rsc.numeric().to_string());
    if let Some(rqi) = &response.rqi {
        builder = builder.header(headers::REQUEST_ID, rqi);
    }
    if let Some(rvi) = &response.rvi {
        builder = builder.header(headers::RELEASE_VERSION, rvi);
    }
    if let Some(vsi) = &response.vsi {
        builder = builder.header(headers::VENDOR_INFO, vsi);
    }
    let body = match &response.pc {
        Some(pc) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(pc.to_string())
        }
        None => Body::empty(),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn plain_status(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseStatusCode;

    #[test]
    fn response_mapping_carries_rsc_header() {
        let response = into_http(CseResponse {
            rsc: ResponseStatusCode::Created,
            rqi: Some("r1".into()),
            rvi: Some("3".into()),
            vsi: None,
            pc: Some(serde_json::json!({"m2m:cnt": {}})),
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response
                .headers()
                .get(headers::RESPONSE_STATUS)
                .unwrap()
                .to_str()
                .unwrap(),
            "2001"
        );
        assert_eq!(
            response
                .headers()
                .get(headers::REQUEST_ID)
                .unwrap()
                .to_str()
                .unwrap(),
            "r1"
        );
    }
}
