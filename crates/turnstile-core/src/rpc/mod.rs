//! Edge validation of JSON-RPC request bodies.
//!
//! Raw bytes come in, a typed [`RpcCall`] comes out. All downstream code
//! (dispatcher, aggregator) operates on the typed value; nothing after this
//! module re-inspects the raw JSON.
//!
//! The validator is deliberately fail-open: a panic inside validation is
//! caught and the request is passed through to the dispatcher untyped rather
//! than surfacing a 5xx. Rejections, by contrast, are definitive and are
//! returned to the client as HTTP 200 with a JSON-RPC error body.

use serde_json::Value;
use std::{panic::AssertUnwindSafe, sync::Arc};

use crate::types::{blocked_namespace, codes, JsonRpcResponse, RpcCall, RpcRequest, JSONRPC_VERSION};

/// A definitive admission rejection, carrying the id to echo.
#[derive(Debug, Clone)]
pub struct RpcReject {
    pub code: i32,
    pub message: String,
    pub id: Arc<Value>,
}

impl RpcReject {
    fn new(code: i32, message: impl Into<String>, id: Arc<Value>) -> Self {
        Self { code, message: message.into(), id }
    }

    fn with_null_id(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message, Arc::new(Value::Null))
    }

    /// Converts the rejection into the JSON-RPC error body sent to the client.
    #[must_use]
    pub fn into_response(self) -> JsonRpcResponse {
        JsonRpcResponse::error(self.code, self.message, self.id)
    }
}

/// Outcome of validating a request body.
#[derive(Debug)]
pub enum Verdict {
    /// Structurally valid; forward the original body upstream.
    Pass(RpcCall),
    /// Definitive rejection; answer with a JSON-RPC error.
    Reject(RpcReject),
    /// The validator itself failed; forward untyped rather than 5xx.
    Bypass,
}

/// Validates a POST body, catching validator panics.
///
/// This is the only entry point the HTTP layer should use. A crash inside
/// validation must never become a client-visible server error, so panics
/// collapse into [`Verdict::Bypass`].
#[must_use]
pub fn validate_or_bypass(body: &[u8]) -> Verdict {
    match std::panic::catch_unwind(AssertUnwindSafe(|| validate(body))) {
        Ok(Ok(call)) => Verdict::Pass(call),
        Ok(Err(reject)) => Verdict::Reject(reject),
        Err(_) => {
            tracing::error!("request validator panicked; passing request through");
            Verdict::Bypass
        }
    }
}

/// Validates a request body into a typed [`RpcCall`].
///
/// # Errors
///
/// Returns [`RpcReject`] with:
/// - `-32700` for unparseable JSON, or a body that is neither an object nor
///   an array (including `null`);
/// - `-32600` for an empty batch or a request object missing `jsonrpc`,
///   `method`, or `id` (an explicit `"id": null` counts as present);
/// - `-32601` when a method falls in a blocked namespace.
pub fn validate(body: &[u8]) -> Result<RpcCall, RpcReject> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| RpcReject::with_null_id(codes::PARSE_ERROR, "Parse error"))?;

    match value {
        Value::Object(obj) => {
            let request = validate_object(&obj, None)?;
            Ok(RpcCall::Single(request))
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(RpcReject::with_null_id(codes::INVALID_REQUEST, "Invalid Request: empty batch"));
            }
            let mut batch = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let Value::Object(obj) = item else {
                    return Err(RpcReject::with_null_id(
                        codes::INVALID_REQUEST,
                        format!("Invalid Request at index {index}: not an object"),
                    ));
                };
                batch.push(validate_object(obj, Some(index))?);
            }
            Ok(RpcCall::Batch(batch))
        }
        _ => Err(RpcReject::with_null_id(codes::PARSE_ERROR, "Parse error")),
    }
}

/// Validates one request object. `index` is set for batch members and is
/// included in error messages.
fn validate_object(
    obj: &serde_json::Map<String, Value>,
    index: Option<usize>,
) -> Result<RpcRequest, RpcReject> {
    // The id echoed in errors: whatever the object carries, else null.
    let echo_id = Arc::new(obj.get("id").cloned().unwrap_or(Value::Null));

    let version_ok = obj.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION);
    if !version_ok {
        return Err(RpcReject::new(
            codes::INVALID_REQUEST,
            at_index("Invalid Request: jsonrpc must be \"2.0\"", index),
            echo_id,
        ));
    }

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => {
            return Err(RpcReject::new(
                codes::INVALID_REQUEST,
                at_index("Invalid Request: missing method", index),
                echo_id,
            ));
        }
    };

    // `"id": null` is a present id; an absent key is not.
    if !obj.contains_key("id") {
        return Err(RpcReject::new(
            codes::INVALID_REQUEST,
            at_index("Invalid Request: missing id", index),
            echo_id,
        ));
    }

    if let Some(namespace) = blocked_namespace(&method) {
        return Err(RpcReject::new(
            codes::METHOD_NOT_FOUND,
            format!("Method namespace '{namespace}' is blocked"),
            echo_id,
        ));
    }

    Ok(RpcRequest {
        jsonrpc: crate::types::JSONRPC_VERSION_COW,
        method,
        params: obj.get("params").cloned(),
        id: echo_id,
    })
}

fn at_index(message: &str, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{message} (batch index {i})"),
        None => message.to_string(),
    }
}
