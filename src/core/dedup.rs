//! Cache-backed request de-duplication.
//!
//! Concurrent calls for the same key collapse into one network call:
//! - data already cached: success fires immediately, no call
//! - a call for the key is in flight: nothing fires, the caller is dropped
//! - otherwise the entry is marked `processing` and the call is issued
//!
//! After the call the entry is in exactly one terminal state: populated
//! (success) or absent (failure, so the next call retries).

use std::sync::Arc;

use log::{debug, trace};
use serde_json::{json, Map, Value};

use super::cache::BoundedCache;
use super::net::{ApiRequest, ApiResponse, NetworkClient};

/// Metadata flag marking an in-flight request
pub const PROCESSING: &str = "processing";

/// Success continuation: receives the response data
pub type SuccessFn = Box<dyn FnOnce(Value) + Send + 'static>;

/// Error continuation: receives the failed response (status text included)
pub type ErrorFn = Box<dyn FnOnce(ApiResponse) + Send + 'static>;

/// What `cache_request` did with a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from cache; success already invoked
    Hit,
    /// Same key already in flight; neither continuation will fire
    Suppressed,
    /// Network call issued
    Dispatched,
}

enum Decision {
    Hit(Value),
    Suppressed,
    Dispatch,
}

/// Wraps a [`NetworkClient`] with cache-backed de-duplication
#[derive(Clone)]
pub struct RequestDeduplicator {
    cache: BoundedCache,
    client: Arc<dyn NetworkClient>,
}

impl RequestDeduplicator {
    pub fn new(cache: BoundedCache, client: Arc<dyn NetworkClient>) -> Self {
        Self { cache, client }
    }

    /// Issue `request` unless its `key` is cached or already in flight.
    pub fn cache_request(
        &self,
        key: &str,
        request: ApiRequest,
        on_success: Option<SuccessFn>,
        on_error: Option<ErrorFn>,
    ) -> CacheOutcome {
        let mut meta = Map::new();
        meta.insert("url".into(), json!(request.url));
        meta.insert(PROCESSING.into(), json!(true));

        let (_, inserted) = self.cache.get_or_insert(key, meta);
        let decision = if inserted {
            Decision::Dispatch
        } else {
            self.decide(key, &request.url)
        };

        match decision {
            Decision::Hit(data) => {
                trace!("dedup - cache hit ({})", key);
                if let Some(cb) = on_success {
                    cb(data);
                }
                return CacheOutcome::Hit;
            }
            Decision::Suppressed => {
                debug!("dedup - duplicate request suppressed ({})", key);
                return CacheOutcome::Suppressed;
            }
            Decision::Dispatch => {}
        }

        debug!("dedup - dispatching {} {} ({})", request.method, request.url, key);
        let cache = self.cache.clone();
        let key = key.to_string();
        self.client.call(
            request,
            Box::new(move |response: ApiResponse| {
                if response.ok {
                    let data = response.data.clone();
                    let stored = cache.update(&key, |entry| {
                        entry.data = Some(data);
                        entry.metadata.insert(PROCESSING.into(), json!(false));
                    });
                    if !stored {
                        trace!("dedup - entry ({}) gone before response", key);
                    }
                    if let Some(cb) = on_success {
                        cb(response.data);
                    }
                } else {
                    // Failures are never cached so the next call retries
                    cache.remove(&key);
                    if let Some(cb) = on_error {
                        cb(response);
                    }
                }
            }),
        );
        CacheOutcome::Dispatched
    }

    /// Decide for an existing entry, marking it in flight when we take it
    fn decide(&self, key: &str, url: &str) -> Decision {
        let mut decision = Decision::Dispatch;
        let found = self.cache.update(key, |entry| {
            // A null body counts as nothing cached
            if let Some(data) = entry.data.as_ref().filter(|d| !d.is_null()) {
                decision = Decision::Hit(data.clone());
            } else if entry.meta_bool(PROCESSING) {
                decision = Decision::Suppressed;
            } else {
                entry.metadata.insert(PROCESSING.into(), json!(true));
                entry.metadata.insert("url".into(), json!(url));
            }
        });
        if !found {
            // Expired between lookup and update: start over with a fresh placeholder
            let mut meta = Map::new();
            meta.insert("url".into(), json!(url));
            meta.insert(PROCESSING.into(), json!(true));
            self.cache.add(key, None, Some(meta), None);
        }
        decision
    }

    /// Drop the cached response for `key`
    pub fn remove_from_cache(&self, key: &str) {
        self.cache.empty(Some(key));
    }

    pub fn cache(&self) -> &BoundedCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::net::testing::ParkedClient;
    use crate::core::net::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn setup() -> (RequestDeduplicator, ParkedClient) {
        let client = ParkedClient::new();
        let cache = BoundedCache::new(Arc::new(ManualClock::new()));
        (RequestDeduplicator::new(cache, Arc::new(client.clone())), client)
    }

    fn get(url: &str) -> ApiRequest {
        ApiRequest::new(Method::Get, url)
    }

    #[test]
    fn test_concurrent_duplicates_make_one_call() {
        let (dedup, client) = setup();
        let successes = Arc::new(AtomicUsize::new(0));

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let s = Arc::clone(&successes);
            outcomes.push(dedup.cache_request(
                "products",
                get("/products"),
                Some(Box::new(move |_: Value| {
                    s.fetch_add(1, Ordering::SeqCst);
                })),
                None,
            ));
        }

        assert_eq!(client.call_count(), 1);
        assert_eq!(outcomes[0], CacheOutcome::Dispatched);
        assert!(outcomes[1..].iter().all(|o| *o == CacheOutcome::Suppressed));

        client.complete(0, ApiResponse::success(200, json!(["a", "b"])));
        // Only the dispatching caller's continuation fires
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        let entry = dedup.cache().get("products").unwrap();
        assert_eq!(entry.data, Some(json!(["a", "b"])));
        assert!(!entry.meta_bool(PROCESSING));
    }

    #[test]
    fn test_cached_data_served_without_call() {
        let (dedup, client) = setup();
        dedup.cache_request("k", get("/k"), None, None);
        client.complete(0, ApiResponse::success(200, json!({"n": 1})));

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let outcome = dedup.cache_request(
            "k",
            get("/k"),
            Some(Box::new(move |data: Value| {
                *s.lock().unwrap() = Some(data);
            })),
            None,
        );

        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(client.call_count(), 1);
        assert_eq!(*seen.lock().unwrap(), Some(json!({"n": 1})));
    }

    #[test]
    fn test_null_body_is_not_served_from_cache() {
        let (dedup, client) = setup();
        dedup.cache_request("k", get("/k"), None, None);
        client.complete(0, ApiResponse::success(200, Value::Null));

        assert_eq!(dedup.cache_request("k", get("/k"), None, None), CacheOutcome::Dispatched);
        assert_eq!(client.call_count(), 2);
        assert_eq!(dedup.cache_request("k", get("/k"), None, None), CacheOutcome::Suppressed);
    }

    #[test]
    fn test_failure_removes_entry_and_retries() {
        let (dedup, client) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        dedup.cache_request(
            "k",
            get("/k"),
            None,
            Some(Box::new(move |resp: ApiResponse| {
                e.lock().unwrap().push(resp.status_text);
            })),
        );
        client.complete(0, ApiResponse::failure(500, "Server Error"));

        assert!(!dedup.cache().contains("k"));
        assert_eq!(*errors.lock().unwrap(), vec!["Server Error".to_string()]);

        // Next call goes to the network again
        assert_eq!(dedup.cache_request("k", get("/k"), None, None), CacheOutcome::Dispatched);
        assert_eq!(client.call_count(), 2);
    }

    #[test]
    fn test_existing_placeholder_is_taken() {
        let (dedup, client) = setup();
        // Someone else left an empty, idle entry under the key
        dedup.cache().add("k", None, None, None);

        assert_eq!(dedup.cache_request("k", get("/k"), None, None), CacheOutcome::Dispatched);
        assert!(dedup.cache().get("k").unwrap().meta_bool(PROCESSING));
        assert_eq!(dedup.cache_request("k", get("/k"), None, None), CacheOutcome::Suppressed);
        assert_eq!(client.call_count(), 1);

        dedup.remove_from_cache("k");
        assert!(!dedup.cache().contains("k"));
    }
}
