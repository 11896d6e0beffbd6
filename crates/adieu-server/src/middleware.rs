//! `X-Matrix` request authentication for federation endpoints.
//!
//! Every federation request carries an `Authorization` header of the form
//! `X-Matrix origin="b.org",destination="a.org",key="ed25519:1",sig="..."`.
//! The signature covers the canonical JSON of `{method, uri, origin,
//! destination, content}`; it is checked through the server's key ring and
//! the authenticated origin is handed to handlers as [`FederationOrigin`].
//! A body that is not JSON cannot be covered by a signature and is refused
//! before any key lookup.

use crate::AppState;
use adieu_federation::VerifyJsonRequest;
use adieu_types::canonical::canonical_json;
use adieu_types::signing::{sign_json, ServerSigningKey, SignatureError};
use adieu_types::{now_millis, OwnedServerName, ServerName};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Largest request body accepted on federation endpoints.
pub const MAX_FEDERATION_BODY_BYTES: usize = 1024 * 1024;

/// The server that signed the current request.
#[derive(Clone, Debug)]
pub struct FederationOrigin(pub OwnedServerName);

/// Parsed `X-Matrix` authorization parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMatrix {
    pub origin: OwnedServerName,
    pub destination: Option<OwnedServerName>,
    pub key: String,
    pub sig: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    Missing,
    #[error("Malformed X-Matrix authorization: {0}")]
    Malformed(String),
    #[error("Request is addressed to {0}, not this server")]
    WrongDestination(String),
    #[error("Request body is too large or unreadable")]
    Body,
    #[error("Request body is not valid JSON: {0}")]
    NotJson(String),
    #[error("Invalid request signature: {0}")]
    BadSignature(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, errcode) = match &self {
            AuthError::Missing => (StatusCode::UNAUTHORIZED, "M_MISSING_TOKEN"),
            AuthError::Malformed(_)
            | AuthError::WrongDestination(_)
            | AuthError::BadSignature(_) => (StatusCode::UNAUTHORIZED, "M_UNAUTHORIZED"),
            AuthError::Body => (StatusCode::PAYLOAD_TOO_LARGE, "M_TOO_LARGE"),
            AuthError::NotJson(_) => (StatusCode::BAD_REQUEST, "M_NOT_JSON"),
            AuthError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN"),
        };
        (
            status,
            Json(json!({ "errcode": errcode, "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Parses the value of an `Authorization: X-Matrix ...` header.
pub fn parse_x_matrix(header: &str) -> Result<XMatrix, AuthError> {
    let params = header
        .strip_prefix("X-Matrix ")
        .ok_or_else(|| AuthError::Malformed("scheme is not X-Matrix".to_string()))?;

    let (mut origin, mut destination, mut key, mut sig) = (None, None, None, None);
    for pair in params.split(',') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match name.trim() {
            "origin" => origin = Some(value),
            "destination" => destination = Some(value),
            "key" => key = Some(value),
            "sig" => sig = Some(value),
            _ => {}
        }
    }

    let origin = origin.ok_or_else(|| AuthError::Malformed("missing origin".to_string()))?;
    let origin = ServerName::parse(origin)
        .map_err(|e| AuthError::Malformed(format!("origin: {e}")))?;
    let destination = destination
        .map(ServerName::parse)
        .transpose()
        .map_err(|e| AuthError::Malformed(format!("destination: {e}")))?;
    let key = key.ok_or_else(|| AuthError::Malformed("missing key".to_string()))?;
    let sig = sig.ok_or_else(|| AuthError::Malformed("missing sig".to_string()))?;

    Ok(XMatrix {
        origin,
        destination,
        key,
        sig,
    })
}

/// The JSON object a federation request signature covers.
pub fn request_object(
    method: &str,
    uri: &str,
    origin: &ServerName,
    destination: &ServerName,
    content: Option<&Value>,
) -> Value {
    let mut obj = Map::new();
    obj.insert("method".to_string(), json!(method));
    obj.insert("uri".to_string(), json!(uri));
    obj.insert("origin".to_string(), json!(origin.as_str()));
    obj.insert("destination".to_string(), json!(destination.as_str()));
    if let Some(content) = content {
        obj.insert("content".to_string(), content.clone());
    }
    Value::Object(obj)
}

/// Builds the `Authorization` header value for an outbound request.
pub fn sign_request(
    method: &str,
    uri: &str,
    origin: &ServerName,
    destination: &ServerName,
    content: Option<&Value>,
    key: &ServerSigningKey,
) -> Result<String, SignatureError> {
    let mut object = request_object(method, uri, origin, destination, content);
    sign_json(origin, key, &mut object)?;
    let key_id = key.key_id();
    let sig = object["signatures"][origin.as_str()][key_id]
        .as_str()
        .ok_or_else(|| SignatureError::MissingSignature {
            server: origin.to_string(),
            key_id: key_id.to_string(),
        })?;
    Ok(format!(
        "X-Matrix origin=\"{origin}\",destination=\"{destination}\",key=\"{key_id}\",sig=\"{sig}\""
    ))
}

/// Middleware that authenticates federation requests.
pub async fn federation_auth(req: Request<Body>, next: Next) -> Result<Response, AuthError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(AuthError::Internal)?
        .clone();

    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed("header is not ASCII".to_string()))?;
    let auth = parse_x_matrix(header)?;

    if let Some(destination) = &auth.destination {
        if destination != &state.server_name {
            return Err(AuthError::WrongDestination(destination.to_string()));
        }
    }

    let method = req.method().as_str().to_string();
    let uri = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_FEDERATION_BODY_BYTES)
        .await
        .map_err(|_| AuthError::Body)?;
    let content: Option<Value> = if bytes.is_empty() {
        None
    } else {
        let value = serde_json::from_slice(&bytes).map_err(|e| {
            tracing::info!(origin = %auth.origin, %uri, error = %e, "rejected non-JSON federation body");
            AuthError::NotJson(e.to_string())
        })?;
        Some(value)
    };

    let mut object = request_object(
        &method,
        &uri,
        &auth.origin,
        &state.server_name,
        content.as_ref(),
    );
    object["signatures"] = json!({ auth.origin.as_str(): { auth.key.as_str(): auth.sig } });
    let message = canonical_json(&object).map_err(|e| AuthError::BadSignature(e.to_string()))?;

    let results = state
        .verifier
        .verify_json(&[VerifyJsonRequest {
            server_name: auth.origin.clone(),
            message,
            at_ts: now_millis(),
            strict_validity: true,
        }])
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "key ring failed during request authentication");
            AuthError::Internal
        })?;
    if let Some(reason) = results.into_iter().next().and_then(|r| r.error) {
        tracing::info!(origin = %auth.origin, %uri, %reason, "rejected federation request");
        return Err(AuthError::BadSignature(reason));
    }

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(FederationOrigin(auth.origin));
    Ok(next.run(req).await)
}
