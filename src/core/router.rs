//! Hash-style router: maps location strings to handlers.
//!
//! Patterns are literal segments plus `:name` parameters, e.g.
//! `products/:category`. Locations are normalized before matching: leading
//! `#` and `/` and trailing `/` are stripped and the query string is split
//! off at `?`.
//!
//! Route state (`current`/`previous`) changes as one step, only once a route
//! (or the not-found fallback) matched and its filters passed, right before
//! the handler runs. A rejected navigation leaves the state untouched.
//!
//! No lock is held while filters or handlers run; both may navigate again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use log::{debug, info, trace};
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Parameters handed to a route handler.
///
/// `RouteParams::default()` is the canonical empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteParams {
    pub data: BTreeMap<String, String>,
    pub query_string: String,
}

impl RouteParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.query_string.is_empty()
    }

    /// Decoded `key=value` pairs of the query string, in order
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query_string
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (
                    percent_decode_str(k).decode_utf8_lossy().into_owned(),
                    percent_decode_str(v).decode_utf8_lossy().into_owned(),
                )
            })
            .collect()
    }
}

pub type RouteHandler = Arc<dyn Fn(&RouteParams) + Send + Sync>;

/// Navigation gate. Returning false aborts the navigation; the filter
/// is responsible for any redirect.
pub type Filter = Arc<dyn Fn() -> bool + Send + Sync>;

/// What a navigate/resolve call ended in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// Handler of the matched pattern ran
    Dispatched(String),
    /// Not-found fallback ran (or none is installed)
    NotFound,
    /// Empty location; sent to the default route
    Redirected,
    /// A filter returned false
    Rejected,
}

#[derive(Debug)]
pub enum RouterError {
    InvalidPattern { pattern: String, source: regex::Error },
    DuplicateParam { pattern: String, name: String },
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::InvalidPattern { pattern, source } => {
                write!(f, "Invalid route pattern '{}': {}", pattern, source)
            }
            RouterError::DuplicateParam { pattern, name } => {
                write!(f, "Route pattern '{}' repeats parameter ':{}'", pattern, name)
            }
        }
    }
}

impl std::error::Error for RouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouterError::InvalidPattern { source, .. } => Some(source),
            RouterError::DuplicateParam { .. } => None,
        }
    }
}

/// Escapes that stay encoded when a location is decoded, so an encoded `/`
/// or `?` cannot change how the location splits
const RESERVED: &[u8] = b";/?:@&=+$,#";

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Percent-decode `location` except for escapes of reserved characters
pub fn decode_location(location: &str) -> String {
    let bytes = location.as_bytes();
    let mut out = String::with_capacity(location.len());
    let mut chunk = 0;
    let mut i = 0;
    while i + 2 < bytes.len() {
        let escaped = match (bytes[i], hex(bytes[i + 1]), hex(bytes[i + 2])) {
            (b'%', Some(hi), Some(lo)) => Some(hi * 16 + lo),
            _ => None,
        };
        match escaped {
            Some(c) if RESERVED.contains(&c) => {
                out.push_str(&percent_decode_str(&location[chunk..i]).decode_utf8_lossy());
                out.push_str(&location[i..i + 3]);
                i += 3;
                chunk = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&percent_decode_str(&location[chunk..]).decode_utf8_lossy());
    out
}

/// Split a location into (path, query) with `#`, `/` trimmed
pub fn normalize(location: &str) -> (String, String) {
    let (path, query) = location.split_once('?').unwrap_or((location, ""));
    let path = path.trim_start_matches(['#', '/']).trim_end_matches('/');
    (path.to_string(), query.to_string())
}

struct Route {
    pattern: String,
    regex: Regex,
    params: Vec<String>,
    filtered: bool,
    handler: RouteHandler,
}

impl Route {
    fn compile(pattern: &str, filtered: bool, handler: RouteHandler) -> Result<Self, RouterError> {
        let (path, _) = normalize(pattern);
        let mut params: Vec<String> = Vec::new();
        let mut parts = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match segment.strip_prefix(':') {
                Some(name) => {
                    if params.iter().any(|p| p == name) {
                        return Err(RouterError::DuplicateParam {
                            pattern: pattern.to_string(),
                            name: name.to_string(),
                        });
                    }
                    params.push(name.to_string());
                    parts.push("([^/]+)".to_string());
                }
                None => parts.push(regex::escape(segment)),
            }
        }
        let regex = Regex::new(&format!("^{}$", parts.join("/"))).map_err(|source| {
            RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            pattern: path,
            regex,
            params,
            filtered,
            handler,
        })
    }

    fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    caps.get(i + 1)
                        .map(|m| (name.clone(), percent_decode_str(m.as_str()).decode_utf8_lossy().into_owned()))
                })
                .collect(),
        )
    }
}

struct Inner {
    routes: Vec<Route>,
    not_found: Option<RouteHandler>,
    filters: Vec<Filter>,
    default_route: String,
    current: String,
    previous: Option<String>,
}

/// Matched dispatch target, resolved under the read lock
struct Target {
    pattern: Option<String>,
    filtered: bool,
    handler: Option<RouteHandler>,
    params: RouteParams,
}

/// Route table + navigation state.
///
/// Cloning yields another handle to the same router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RwLock<Inner>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Router")
            .field("routes", &inner.routes.len())
            .field("filters", &inner.filters.len())
            .field("current", &inner.current)
            .field("previous", &inner.previous)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new("home")
    }
}

impl Router {
    /// `default_route` is both the initial state and the empty-location target
    pub fn new(default_route: &str) -> Self {
        let (default_route, _) = normalize(default_route);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                routes: Vec::new(),
                not_found: None,
                filters: Vec::new(),
                current: default_route.clone(),
                default_route,
                previous: None,
            })),
        }
    }

    /// Register `handler` for `pattern`. Filtered routes run the filter chain first.
    pub fn on<F>(&self, pattern: &str, filtered: bool, handler: F) -> Result<(), RouterError>
    where
        F: Fn(&RouteParams) + Send + Sync + 'static,
    {
        let route = Route::compile(pattern, filtered, Arc::new(handler))?;
        trace!("Router: route '{}' (filtered: {})", route.pattern, filtered);
        self.inner.write().unwrap_or_else(|e| e.into_inner()).routes.push(route);
        Ok(())
    }

    /// Fallback for non-empty locations no pattern matches
    pub fn not_found<F>(&self, handler: F)
    where
        F: Fn(&RouteParams) + Send + Sync + 'static,
    {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).not_found = Some(Arc::new(handler));
    }

    /// Append to the filter chain
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).filters.push(Arc::new(filter));
    }

    /// Programmatic navigation to a route id or path
    pub fn navigate(&self, target: &str) -> NavigationOutcome {
        debug!("Router: navigate '{}'", target);
        self.dispatch(target)
    }

    /// Dispatch a location received from the host
    pub fn resolve(&self, location: &str) -> NavigationOutcome {
        debug!("Router: resolve '{}'", location);
        self.dispatch(location)
    }

    /// Startup dispatch of the current (percent-encoded) location
    pub fn init(&self, location: Option<&str>) -> NavigationOutcome {
        let decoded = location.map(decode_location).unwrap_or_default();
        info!("Router: init at '{}'", decoded);
        if decoded.is_empty() {
            let default_route = self.default_route();
            self.navigate(&default_route)
        } else {
            self.resolve(&decoded)
        }
    }

    fn dispatch(&self, location: &str) -> NavigationOutcome {
        let (path, query_string) = normalize(location);
        let target = match self.lookup(&path, query_string) {
            Some(t) => t,
            None => {
                let default_route = self.default_route();
                if default_route.is_empty() {
                    return NavigationOutcome::NotFound;
                }
                debug!("Router: empty location, redirect to '{}'", default_route);
                self.navigate(&default_route);
                return NavigationOutcome::Redirected;
            }
        };

        if target.filtered && !self.run_filters() {
            debug!("Router: '{}' rejected by filter", path);
            return NavigationOutcome::Rejected;
        }

        self.commit(&path);
        if let Some(handler) = target.handler {
            handler(&target.params);
        }
        match target.pattern {
            Some(p) => NavigationOutcome::Dispatched(p),
            None => NavigationOutcome::NotFound,
        }
    }

    /// First matching route, else the not-found target. None for an empty unmatched path.
    fn lookup(&self, path: &str, query_string: String) -> Option<Target> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for route in &inner.routes {
            if let Some(data) = route.matches(path) {
                trace!("Router: '{}' matched '{}'", path, route.pattern);
                return Some(Target {
                    pattern: Some(route.pattern.clone()),
                    filtered: route.filtered,
                    handler: Some(Arc::clone(&route.handler)),
                    params: RouteParams { data, query_string },
                });
            }
        }
        if path.is_empty() {
            return None;
        }
        debug!("Router: no route for '{}'", path);
        Some(Target {
            pattern: None,
            filtered: false,
            handler: inner.not_found.clone(),
            params: RouteParams {
                data: BTreeMap::new(),
                query_string,
            },
        })
    }

    /// Run the chain in order; stops at the first false
    fn run_filters(&self) -> bool {
        let filters = self.inner.read().unwrap_or_else(|e| e.into_inner()).filters.clone();
        filters.iter().all(|f| f())
    }

    fn commit(&self, path: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut inner.current, path.to_string());
        trace!("Router: '{}' -> '{}'", previous, path);
        inner.previous = Some(previous);
    }

    /// Number of installed filters
    pub fn filter_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).filters.len()
    }

    pub fn current_route(&self) -> String {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).current.clone()
    }

    pub fn previous_route(&self) -> Option<String> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).previous.clone()
    }

    pub fn default_route(&self) -> String {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).default_route.clone()
    }

    /// Registered patterns in registration order
    pub fn patterns(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .routes
            .iter()
            .map(|r| r.pattern.clone())
            .collect()
    }
}
