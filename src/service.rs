//! API service layer over the host's [`NetworkClient`].
//!
//! Every call goes through one pipeline:
//! - `v=<app version>` appended to the URL, JSON content type, CSRF header
//! - a per-call timeout timer; first of response/timeout wins, the loser is ignored
//! - 401/403 publishes `log_out` and resolves as "Unauthorized"
//! - otherwise `request_done` / `request_fail` is published and the caller notified
//!
//! Timeouts fire from [`ApiService::tick`], polled by the host loop.
//! [`ApiService`] is itself a [`NetworkClient`], which is how the
//! de-duplication layer sits on top of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::assets::append_version;
use crate::core::cache::BoundedCache;
use crate::core::clock::Clock;
use crate::core::dedup::{CacheOutcome, ErrorFn, RequestDeduplicator, SuccessFn};
use crate::core::event_bus::EventBus;
use crate::core::events::AppEvent;
use crate::core::net::{AbortSignal, ApiRequest, ApiResponse, Method, NetworkClient, ResponseCallback};
use crate::core::timers::{TimerId, TimerQueue};

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";
pub const CSRF_HEADER: &str = "X-CSRF-TOKEN";

/// Status text of a call that never produced a response
pub const UNREACHABLE_TEXT: &str = "Unable to process your request, please try again.";
pub const UNAUTHORIZED_TEXT: &str = "Unauthorized";

/// Default endpoint table, relative to the API root
const DEFAULT_APIS: [(&str, &str); 8] = [
    ("APP_VERSION", "/app/version/{{version}}"),
    ("USER_LOGIN", "/auth/login"),
    ("USERS", "/users"),
    ("USER", "/users/{{id}}"),
    ("PRODUCTS", "/products"),
    ("PRODUCTS_BY_CATEGORY", "/products/category/{{category}}"),
    ("PRODUCT", "/products/{{id}}"),
    ("PRODUCT_CATEGORIES", "/products/categories"),
];

/// Substitute `{{key}}` placeholders, consuming the keys that were used.
///
/// Keys left in `vars` are the ones the template did not reference.
pub fn replace_vars(template: &str, vars: &mut Map<String, Value>) -> String {
    let mut url = template.to_string();
    let keys: Vec<String> = vars.keys().cloned().collect();
    for key in keys {
        let find = format!("{{{{{}}}}}", key);
        if !url.contains(&find) {
            continue;
        }
        if let Some(value) = vars.remove(&key) {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            url = url.replacen(&find, &text, 1);
        }
    }
    url
}

/// In-flight call awaiting response or timeout
struct Flight {
    method: Method,
    url: String,
    signal: AbortSignal,
    timer: TimerId,
    done: ResponseCallback,
}

#[derive(Default)]
struct Pending {
    flights: HashMap<Uuid, Flight>,
    timers: TimerQueue<Uuid>,
}

struct Inner {
    client: Arc<dyn NetworkClient>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    cache: BoundedCache,
    app_version: String,
    timeout: RwLock<Duration>,
    csrf_token: RwLock<Option<String>>,
    apis: RwLock<IndexMap<String, String>>,
    pending: Mutex<Pending>,
}

/// Shared API service handle
#[derive(Clone)]
pub struct ApiService {
    inner: Arc<Inner>,
}

impl fmt::Debug for ApiService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiService")
            .field("app_version", &self.inner.app_version)
            .field("timeout", &self.timeout())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ApiService {
    pub fn new(
        client: Arc<dyn NetworkClient>,
        bus: EventBus,
        cache: BoundedCache,
        clock: Arc<dyn Clock>,
        api_path: &str,
        app_version: &str,
    ) -> Self {
        let apis = DEFAULT_APIS
            .iter()
            .map(|(k, v)| (k.to_string(), format!("{}{}", api_path, v)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                client,
                bus,
                clock,
                cache,
                app_version: app_version.to_string(),
                timeout: RwLock::new(Duration::from_millis(5000)),
                csrf_token: RwLock::new(None),
                apis: RwLock::new(apis),
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    /// Default timeout for calls issued from now on
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.write().unwrap_or_else(|e| e.into_inner()) = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.inner.timeout.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_csrf_token(&self, token: Option<String>) {
        *self.inner.csrf_token.write().unwrap_or_else(|e| e.into_inner()) = token.filter(|t| !t.is_empty());
    }

    /// Add or replace an endpoint template
    pub fn register_api(&self, key: &str, template: &str) {
        self.inner
            .apis
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), template.to_string());
    }

    /// Endpoint URL for `key` with `{{var}}` placeholders filled from `vars`
    pub fn api(&self, key: &str, vars: &mut Map<String, Value>) -> Option<String> {
        let apis = self.inner.apis.read().unwrap_or_else(|e| e.into_inner());
        apis.get(key).map(|t| replace_vars(t, vars))
    }

    /// Number of calls awaiting a response
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).flights.len()
    }

    pub fn get<S, E>(&self, url: &str, on_success: S, on_error: E)
    where
        S: FnOnce(Value, ApiResponse) + Send + 'static,
        E: FnOnce(String, ApiResponse) + Send + 'static,
    {
        self.send(Method::Get, url, Value::Null, on_success, on_error)
    }

    pub fn post<S, E>(&self, url: &str, payload: Value, on_success: S, on_error: E)
    where
        S: FnOnce(Value, ApiResponse) + Send + 'static,
        E: FnOnce(String, ApiResponse) + Send + 'static,
    {
        self.send(Method::Post, url, payload, on_success, on_error)
    }

    pub fn put<S, E>(&self, url: &str, payload: Value, on_success: S, on_error: E)
    where
        S: FnOnce(Value, ApiResponse) + Send + 'static,
        E: FnOnce(String, ApiResponse) + Send + 'static,
    {
        self.send(Method::Put, url, payload, on_success, on_error)
    }

    pub fn delete<S, E>(&self, url: &str, payload: Value, on_success: S, on_error: E)
    where
        S: FnOnce(Value, ApiResponse) + Send + 'static,
        E: FnOnce(String, ApiResponse) + Send + 'static,
    {
        self.send(Method::Delete, url, payload, on_success, on_error)
    }

    pub fn head<S, E>(&self, url: &str, on_success: S, on_error: E)
    where
        S: FnOnce(Value, ApiResponse) + Send + 'static,
        E: FnOnce(String, ApiResponse) + Send + 'static,
    {
        self.send(Method::Head, url, Value::Null, on_success, on_error)
    }

    /// Issue a call and route the outcome to one of the continuations
    pub fn send<S, E>(&self, method: Method, url: &str, payload: Value, on_success: S, on_error: E)
    where
        S: FnOnce(Value, ApiResponse) + Send + 'static,
        E: FnOnce(String, ApiResponse) + Send + 'static,
    {
        let request = ApiRequest::new(method, url)
            .with_payload(payload)
            .with_timeout(self.timeout());
        self.call(
            request,
            Box::new(move |response| {
                if response.ok {
                    let data = response.data.clone();
                    on_success(data, response);
                } else {
                    let text = response.status_text.clone();
                    on_error(text, response);
                }
            }),
        );
    }

    /// De-duplicated call whose response is cached under `key`
    pub fn cache_request(
        &self,
        key: &str,
        method: Method,
        url: &str,
        payload: Value,
        on_success: Option<SuccessFn>,
        on_error: Option<ErrorFn>,
    ) -> CacheOutcome {
        let request = ApiRequest::new(method, url)
            .with_payload(payload)
            .with_timeout(self.timeout());
        self.deduplicator().cache_request(key, request, on_success, on_error)
    }

    /// Drop the cached response for `key`
    pub fn remove_from_cache(&self, key: &str) {
        self.deduplicator().remove_from_cache(key);
    }

    fn deduplicator(&self) -> RequestDeduplicator {
        RequestDeduplicator::new(self.inner.cache.clone(), Arc::new(self.clone()))
    }

    /// Abort calls whose timeout elapsed. Returns how many timed out.
    pub fn tick(&self) -> usize {
        let now = self.inner.clock.now();
        let expired: Vec<(Uuid, Flight)> = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let due = pending.timers.due(now);
            due.into_iter()
                .filter_map(|(_, id)| pending.flights.remove(&id).map(|f| (id, f)))
                .collect()
        };

        let count = expired.len();
        for (id, flight) in expired {
            warn!("request {} {} ({}) timed out", flight.method, flight.url, id);
            flight.signal.abort();
            self.finish(flight.done, ApiResponse::failure(0, UNREACHABLE_TEXT));
        }
        count
    }

    /// Response arrived for `id`; ignored if the timeout already won
    fn settle(&self, id: Uuid, response: ApiResponse) {
        let flight = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let flight = pending.flights.remove(&id);
            if let Some(f) = &flight {
                pending.timers.cancel(f.timer);
            }
            flight
        };
        match flight {
            Some(flight) => {
                trace!("request {} {} -> {}", flight.method, flight.url, response.status);
                self.finish(flight.done, response);
            }
            None => trace!("late response for {} ignored", id),
        }
    }

    /// Normalize, publish and deliver a response
    fn finish(&self, done: ResponseCallback, mut response: ApiResponse) {
        if response.is_auth_failure() {
            debug!("request unauthorized ({}), logging out", response.status);
            self.inner.bus.emit(AppEvent::LogOut);
            done(ApiResponse {
                ok: false,
                status: response.status,
                data: json!([]),
                status_text: UNAUTHORIZED_TEXT.to_string(),
            });
            return;
        }

        if response.ok {
            self.inner.bus.emit(AppEvent::RequestDone {
                response: response.clone(),
                data: response.data.clone(),
            });
        } else {
            if response.status_text.is_empty() {
                response.status_text = UNREACHABLE_TEXT.to_string();
            }
            self.inner.bus.emit(AppEvent::RequestFail {
                response: response.clone(),
                status_text: response.status_text.clone(),
            });
        }
        done(response);
    }
}

impl NetworkClient for ApiService {
    fn call(&self, mut request: ApiRequest, done: ResponseCallback) {
        request.url = append_version(&request.url, &self.inner.app_version);
        request.headers.insert("Content-Type".into(), CONTENT_TYPE_JSON.into());
        if let Some(token) = self.inner.csrf_token.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            request.headers.insert(CSRF_HEADER.into(), token.clone());
        }
        if !request.method.has_body() {
            request.payload = Value::Null;
        }

        let id = Uuid::new_v4();
        {
            let now = self.inner.clock.now();
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let timer = pending.timers.schedule(id, now, request.timeout);
            pending.flights.insert(
                id,
                Flight {
                    method: request.method,
                    url: request.url.clone(),
                    signal: request.signal.clone(),
                    timer,
                    done,
                },
            );
        }

        debug!("request {} {} ({})", request.method, request.url, id);
        let service = self.clone();
        self.inner
            .client
            .call(request, Box::new(move |response| service.settle(id, response)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::event_bus::handler;
    use crate::core::events::names;
    use crate::core::net::testing::ParkedClient;

    struct Fixture {
        service: ApiService,
        client: ParkedClient,
        clock: ManualClock,
        events: Arc<Mutex<Vec<String>>>,
    }

    fn setup() -> Fixture {
        let client = ParkedClient::new();
        let clock = ManualClock::new();
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        for name in [names::LOG_OUT, names::REQUEST_DONE, names::REQUEST_FAIL] {
            let e = Arc::clone(&events);
            bus.subscribe(
                name,
                &handler(move |ev| {
                    e.lock().unwrap().push(ev.name().to_string());
                    Ok(())
                }),
            );
        }
        let cache = BoundedCache::new(Arc::new(clock.clone()));
        let service = ApiService::new(
            Arc::new(client.clone()),
            bus,
            cache,
            Arc::new(clock.clone()),
            "https://api.test",
            "1.2",
        );
        Fixture {
            service,
            client,
            clock,
            events,
        }
    }

    type Outcome = Arc<Mutex<Vec<Result<Value, (String, u16)>>>>;

    fn recorder() -> (
        Outcome,
        impl FnOnce(Value, ApiResponse) + Send + 'static,
        impl FnOnce(String, ApiResponse) + Send + 'static,
    ) {
        let out: Outcome = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&out), Arc::clone(&out));
        (
            out,
            move |data: Value, _: ApiResponse| a.lock().unwrap().push(Ok(data)),
            move |text: String, resp: ApiResponse| b.lock().unwrap().push(Err((text, resp.status))),
        )
    }

    #[test]
    fn test_request_decoration() {
        let f = setup();
        f.service.set_csrf_token(Some("tok".into()));
        f.service.get("/products", |_, _| {}, |_, _| {});
        f.service.post("/users?x=1", json!({"a": 1}), |_, _| {}, |_, _| {});

        let get = f.client.request(0);
        assert_eq!(get.url, "/products?v=1.2");
        assert_eq!(get.headers.get("Content-Type").map(String::as_str), Some(CONTENT_TYPE_JSON));
        assert_eq!(get.headers.get(CSRF_HEADER).map(String::as_str), Some("tok"));
        assert_eq!(get.payload, Value::Null);

        let post = f.client.request(1);
        assert_eq!(post.url, "/users?x=1&v=1.2");
        assert_eq!(post.payload, json!({"a": 1}));
    }

    #[test]
    fn test_success_publishes_request_done() {
        let f = setup();
        let (out, ok, err) = recorder();
        f.service.get("/p", ok, err);
        f.client.complete(0, ApiResponse::success(200, json!({"id": 1})));

        assert_eq!(*out.lock().unwrap(), vec![Ok(json!({"id": 1}))]);
        assert_eq!(*f.events.lock().unwrap(), vec!["request_done"]);
        assert_eq!(f.service.in_flight(), 0);
    }

    #[test]
    fn test_failure_publishes_request_fail() {
        let f = setup();
        let (out, ok, err) = recorder();
        f.service.get("/p", ok, err);
        f.client.complete(0, ApiResponse::failure(500, ""));

        assert_eq!(*out.lock().unwrap(), vec![Err((UNREACHABLE_TEXT.to_string(), 500))]);
        assert_eq!(*f.events.lock().unwrap(), vec!["request_fail"]);
    }

    #[test]
    fn test_unauthorized_forces_logout() {
        let f = setup();
        let (out, ok, err) = recorder();
        f.service.get("/me", ok, err);
        f.client.complete(0, ApiResponse::failure(403, "Forbidden"));

        assert_eq!(*out.lock().unwrap(), vec![Err((UNAUTHORIZED_TEXT.to_string(), 403))]);
        // No request_done/request_fail for auth failures
        assert_eq!(*f.events.lock().unwrap(), vec!["log_out"]);
    }

    #[test]
    fn test_timeout_wins_and_late_response_ignored() {
        let f = setup();
        let (out, ok, err) = recorder();
        f.service.get("/slow", ok, err);

        f.clock.advance(4999);
        assert_eq!(f.service.tick(), 0);
        f.clock.advance(1);
        assert_eq!(f.service.tick(), 1);
        assert!(f.client.request(0).signal.is_aborted());
        assert_eq!(*out.lock().unwrap(), vec![Err((UNREACHABLE_TEXT.to_string(), 0))]);

        f.client.complete(0, ApiResponse::success(200, json!(1)));
        assert_eq!(out.lock().unwrap().len(), 1);
        assert_eq!(*f.events.lock().unwrap(), vec!["request_fail"]);
    }

    #[test]
    fn test_set_timeout_on_shared_service() {
        let f = setup();
        let shared = f.service.clone();
        shared.set_timeout(Duration::from_millis(100));
        assert_eq!(f.service.timeout(), Duration::from_millis(100));

        f.service.get("/slow", |_, _| {}, |_, _| {});
        assert_eq!(f.client.request(0).timeout, Duration::from_millis(100));
        f.clock.advance(100);
        assert_eq!(f.service.tick(), 1);
    }

    #[test]
    fn test_response_cancels_timeout() {
        let f = setup();
        f.service.get("/fast", |_, _| {}, |_, _| {});
        f.client.complete(0, ApiResponse::success(200, json!(null)));
        f.clock.advance(10_000);
        assert_eq!(f.service.tick(), 0);
        assert!(!f.client.request(0).signal.is_aborted());
    }

    #[test]
    fn test_api_templating() {
        let f = setup();
        let mut vars = Map::new();
        vars.insert("category".into(), json!("men's clothing"));
        vars.insert("page".into(), json!(2));
        let url = f.service.api("PRODUCTS_BY_CATEGORY", &mut vars).unwrap();
        assert_eq!(url, "https://api.test/products/category/men's clothing");
        // Unused vars stay behind
        assert_eq!(vars.keys().collect::<Vec<_>>(), vec!["page"]);

        let mut vars = Map::new();
        vars.insert("id".into(), json!(7));
        assert_eq!(f.service.api("PRODUCT", &mut vars).unwrap(), "https://api.test/products/7");
        assert!(f.service.api("NOPE", &mut Map::new()).is_none());
    }

    #[test]
    fn test_cache_request_dedups_through_pipeline() {
        let f = setup();
        assert_eq!(
            f.service.cache_request("cats", Method::Get, "/cats", Value::Null, None, None),
            CacheOutcome::Dispatched
        );
        assert_eq!(
            f.service.cache_request("cats", Method::Get, "/cats", Value::Null, None, None),
            CacheOutcome::Suppressed
        );
        assert_eq!(f.client.call_count(), 1);
        assert_eq!(f.client.request(0).url, "/cats?v=1.2");

        f.client.complete(0, ApiResponse::success(200, json!(["a"])));
        assert_eq!(
            f.service.cache_request("cats", Method::Get, "/cats", Value::Null, None, None),
            CacheOutcome::Hit
        );

        f.service.remove_from_cache("cats");
        assert_eq!(
            f.service.cache_request("cats", Method::Get, "/cats", Value::Null, None, None),
            CacheOutcome::Dispatched
        );
    }
}
