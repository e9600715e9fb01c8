//! Application events published on the [`EventBus`](super::event_bus::EventBus).
//!
//! The bus dispatches by event *name*; [`AppEvent::name`] yields the wire
//! names listed in [`names`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::net::ApiResponse;

/// Wire names of the built-in events
pub mod names {
    pub const APP_READY: &str = "app_ready";
    pub const LOGGED_IN: &str = "logged_in";
    pub const LOG_OUT: &str = "log_out";
    pub const LOGGED_OUT: &str = "logged_out";
    pub const VIEW_IN_DOM: &str = "view_in_dom";
    pub const VIEW_RENDERED: &str = "view_rendered";
    pub const VIEW_LOAD_FAILED: &str = "view_load_failed";
    pub const REQUEST_DONE: &str = "request_done";
    pub const REQUEST_FAIL: &str = "request_fail";
}

/// Authenticated user record, opaque apart from its session token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRecord(pub Map<String, Value>);

impl UserRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.0.get("token").and_then(Value::as_str).filter(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    AppReady,
    LoggedIn(Option<UserRecord>),
    LoggedOut(Option<UserRecord>),
    /// Request to clear the session
    LogOut,
    ViewRendered(String),
    ViewInDom(String),
    /// `view` is the module that could not be obtained
    ViewLoadFailed { id: String, view: String },
    RequestDone { response: ApiResponse, data: Value },
    RequestFail { response: ApiResponse, status_text: String },
    /// Host-defined event
    Custom { name: String, payload: Value },
}

impl AppEvent {
    pub fn name(&self) -> &str {
        match self {
            AppEvent::AppReady => names::APP_READY,
            AppEvent::LoggedIn(_) => names::LOGGED_IN,
            AppEvent::LoggedOut(_) => names::LOGGED_OUT,
            AppEvent::LogOut => names::LOG_OUT,
            AppEvent::ViewRendered(_) => names::VIEW_RENDERED,
            AppEvent::ViewInDom(_) => names::VIEW_IN_DOM,
            AppEvent::ViewLoadFailed { .. } => names::VIEW_LOAD_FAILED,
            AppEvent::RequestDone { .. } => names::REQUEST_DONE,
            AppEvent::RequestFail { .. } => names::REQUEST_FAIL,
            AppEvent::Custom { name, .. } => name,
        }
    }

    pub fn custom(name: impl Into<String>, payload: Value) -> Self {
        AppEvent::Custom {
            name: name.into(),
            payload,
        }
    }
}
