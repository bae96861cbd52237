//! JSON-RPC wire types shared across the request plane.
//!
//! # Type Categories
//!
//! ## Protocol Types
//! - [`RpcRequest`], [`RpcCall`]: validated inbound requests (single or batch)
//! - [`JsonRpcResponse`], [`JsonRpcError`]: outbound response bodies
//!
//! ## Namespace Filtering
//! - [`BLOCKED_NAMESPACES`]: method prefixes that are never forwarded upstream
//! - [`blocked_namespace`]: prefix lookup used by the validator
//!
//! # Performance Notes
//!
//! Request ids are held behind `Arc<serde_json::Value>` so echoing an id into
//! an error response is a pointer copy, not a deep clone of arbitrary JSON.

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, sync::Arc};

/// JSON-RPC protocol version constant to avoid repeated allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version - zero allocation for static usage.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Standard JSON-RPC 2.0 error codes used on the admission path.
pub mod codes {
    /// Invalid JSON, or a body that is not a request object or batch array.
    pub const PARSE_ERROR: i32 = -32700;
    /// Structurally invalid JSON-RPC request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method missing or its namespace is blocked.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Request denied by the rate limiter.
    pub const RATE_LIMITED: i32 = -32005;
    /// Server-defined admission denial (blacklisted client).
    pub const FORBIDDEN: i32 = -32000;
}

/// Method namespaces that are never forwarded upstream.
///
/// These cover node administration, key management, and consensus-internal
/// surfaces that a public RPC endpoint must not expose.
pub const BLOCKED_NAMESPACES: &[&str] =
    &["admin_", "personal_", "debug_", "miner_", "engine_", "clique_", "les_"];

/// Returns the blocked namespace (without the trailing underscore) that
/// `method` belongs to, if any.
#[must_use]
pub fn blocked_namespace(method: &str) -> Option<&'static str> {
    BLOCKED_NAMESPACES
        .iter()
        .find(|prefix| method.starts_with(**prefix))
        .map(|prefix| prefix.trim_end_matches('_'))
}

/// A single validated JSON-RPC 2.0 request.
///
/// Instances are only produced by the validator in [`crate::rpc`]; by the
/// time a value of this type exists, version, method, and id presence have
/// already been checked.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: Arc<serde_json::Value>,
}

impl RpcRequest {
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }
}

/// A validated inbound call: either a single request or a batch.
#[derive(Debug, Clone)]
pub enum RpcCall {
    Single(RpcRequest),
    Batch(Vec<RpcRequest>),
}

impl RpcCall {
    /// Number of individual requests carried by this call.
    ///
    /// This is the amount credited to the aggregator when the call is served
    /// by the primary upstream.
    #[must_use]
    pub fn request_count(&self) -> usize {
        match self {
            RpcCall::Single(_) => 1,
            RpcCall::Batch(batch) => batch.len(),
        }
    }

    /// The id to echo in a call-level error response.
    ///
    /// Batches echo `null` because a single error body stands in for the
    /// whole batch.
    #[must_use]
    pub fn error_id(&self) -> Arc<serde_json::Value> {
        match self {
            RpcCall::Single(req) => Arc::clone(&req.id),
            RpcCall::Batch(_) => Arc::new(serde_json::Value::Null),
        }
    }

    /// Iterates over the method names in this call.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            RpcCall::Single(req) => std::slice::from_ref(req),
            RpcCall::Batch(batch) => batch.as_slice(),
        };
        slice.iter().map(|req| req.method.as_str())
    }
}

/// JSON-RPC 2.0 response body.
///
/// Contains either a `result` or an `error`, never both. The proxy only
/// constructs these for admission errors; successful upstream bodies are
/// relayed verbatim without re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Arc<serde_json::Value>,
}

impl JsonRpcResponse {
    /// Creates an error response with zero allocation for the version string.
    #[must_use]
    pub fn error(code: i32, message: String, id: Arc<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
        }
    }

    /// Creates an error response carrying extra machine-readable data.
    #[must_use]
    pub fn error_with_data(
        code: i32,
        message: String,
        data: serde_json::Value,
        id: Arc<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message, data: Some(data) }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
