//! Network collaborator contract.
//!
//! The runtime never performs I/O itself. A host supplies a [`NetworkClient`]
//! that executes [`ApiRequest`]s and reports exactly one [`ApiResponse`]
//! through the completion callback.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP-style method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }

    /// Methods that carry a request body
    pub fn has_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared cancellation flag handed to the network client.
///
/// Clones observe the same flag; aborting is idempotent.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// A single call for the network collaborator
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    /// Body for methods that carry one; ignored for GET/HEAD
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub signal: AbortSignal,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            payload: Value::Null,
            headers: BTreeMap::new(),
            timeout: Duration::from_millis(5000),
            signal: AbortSignal::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Normalized outcome of a network call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    /// HTTP status, 0 when the call never produced one (abort, timeout, transport error)
    pub status: u16,
    pub data: Value,
    pub status_text: String,
}

impl ApiResponse {
    pub fn success(status: u16, data: Value) -> Self {
        Self {
            ok: true,
            status,
            data,
            status_text: "OK".to_string(),
        }
    }

    pub fn failure(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            data: Value::Object(Default::default()),
            status_text: status_text.into(),
        }
    }

    /// 401/403 equivalents
    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// Completion callback for a network call
pub type ResponseCallback = Box<dyn FnOnce(ApiResponse) + Send + 'static>;

/// External network capability.
///
/// Implementations must call `done` exactly once, may call it synchronously,
/// and should stop work once `request.signal` is aborted.
pub trait NetworkClient: Send + Sync {
    fn call(&self, request: ApiRequest, done: ResponseCallback);
}

impl<T: NetworkClient + ?Sized> NetworkClient for Arc<T> {
    fn call(&self, request: ApiRequest, done: ResponseCallback) {
        (**self).call(request, done)
    }
}
