//! Lazy asset loader - loads named resource groups and signals once all resolved.
//!
//! Usage:
//! ```ignore
//! let groups = AssetGroups::new()
//!     .script("js/file.js")
//!     .template("tpl/event.tpl", "event-view")
//!     .style("css/file.css");
//! loader.load(groups, |report| { /* every asset resolved */ });
//! ```
//!
//! Completion model:
//! - the total is counted before any fetch starts
//! - every asset resolves exactly once (success or failure)
//! - `on_complete` fires exactly once, when resolved == total
//!
//! Assets whose versioned key is already loaded (per category) resolve
//! immediately without a fetch but still count toward the total.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

/// Asset category. Loaded-sets are tracked per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    #[serde(alias = "js")]
    Script,
    #[serde(alias = "css")]
    Style,
    #[serde(alias = "tmpl")]
    Template,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssetKind::Script => "js",
            AssetKind::Style => "css",
            AssetKind::Template => "tmpl",
        })
    }
}

/// One requested asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub src: String,
    /// Element id a template is mounted under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl AssetDescriptor {
    pub fn new(src: impl Into<String>) -> Self {
        Self { src: src.into(), id: None }
    }
}

/// Category -> ordered descriptors, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetGroups(pub IndexMap<AssetKind, Vec<AssetDescriptor>>);

impl AssetGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, kind: AssetKind, descriptor: AssetDescriptor) -> Self {
        self.0.entry(kind).or_default().push(descriptor);
        self
    }

    pub fn script(self, src: impl Into<String>) -> Self {
        self.add(AssetKind::Script, AssetDescriptor::new(src))
    }

    pub fn style(self, src: impl Into<String>) -> Self {
        self.add(AssetKind::Style, AssetDescriptor::new(src))
    }

    pub fn template(self, src: impl Into<String>, id: impl Into<String>) -> Self {
        self.add(
            AssetKind::Template,
            AssetDescriptor {
                src: src.into(),
                id: Some(id.into()),
            },
        )
    }

    /// Total number of requested assets
    pub fn count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Append the cache-busting version token to a URL
pub fn append_version(url: &str, version: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}v={}", url, sep, version)
}

/// A fetch handed to the [`AssetFetcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub kind: AssetKind,
    /// Versioned URL; also the loaded-set key
    pub url: String,
    pub id: Option<String>,
}

/// Asset fetch errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    NotFound(String),
    Failed(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound(url) => write!(f, "Asset not found: {}", url),
            FetchError::Failed(e) => write!(f, "Asset fetch failed: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

/// Per-asset completion signal
pub type FetchCallback = Box<dyn FnOnce(Result<(), FetchError>) + Send + 'static>;

/// External resource-fetch capability.
///
/// Implementations must invoke `done` exactly once, on success or failure.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, request: AssetRequest, done: FetchCallback);
}

impl<T: AssetFetcher + ?Sized> AssetFetcher for Arc<T> {
    fn fetch(&self, request: AssetRequest, done: FetchCallback) {
        (**self).fetch(request, done)
    }
}

/// Summary handed to the completion callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub total: usize,
    /// Versioned URLs that failed to load
    pub failed: Vec<String>,
}

impl LoadReport {
    pub fn all_loaded(&self) -> bool {
        self.failed.is_empty()
    }
}

type CompleteFn = Box<dyn FnOnce(LoadReport) + Send + 'static>;

/// Resolution counter for one `load()` call
struct Batch {
    total: usize,
    resolved: AtomicUsize,
    failed: Mutex<Vec<String>>,
    on_complete: Mutex<Option<CompleteFn>>,
}

impl Batch {
    fn resolve(&self) {
        let n = self.resolved.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("assets resolved {}/{}", n, self.total);
        if n != self.total {
            return;
        }
        let done = self.on_complete.lock().unwrap_or_else(|e| e.into_inner()).take();
        let failed = std::mem::take(&mut *self.failed.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(done) = done {
            done(LoadReport {
                total: self.total,
                failed,
            });
        }
    }
}

/// Memoizing asset loader.
///
/// Cloning yields another handle to the same loaded-sets.
#[derive(Clone)]
pub struct AssetLoader {
    fetcher: Arc<dyn AssetFetcher>,
    loaded: Arc<Mutex<HashMap<AssetKind, HashSet<String>>>>,
    version: String,
}

impl fmt::Debug for AssetLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetLoader")
            .field("version", &self.version)
            .field("loaded", &self.loaded_count())
            .finish()
    }
}

impl AssetLoader {
    /// `version` is the application version used as cache-busting token
    pub fn new(fetcher: Arc<dyn AssetFetcher>, version: impl Into<String>) -> Self {
        Self {
            fetcher,
            loaded: Arc::new(Mutex::new(HashMap::new())),
            version: version.into(),
        }
    }

    /// Load every asset in `groups`; `on_complete` fires once all have resolved.
    ///
    /// Empty groups complete synchronously.
    pub fn load<F>(&self, groups: &AssetGroups, on_complete: F)
    where
        F: FnOnce(LoadReport) + Send + 'static,
    {
        let total = groups.count();
        if total == 0 {
            on_complete(LoadReport::default());
            return;
        }

        debug!("Loading {} asset(s)", total);
        let batch = Arc::new(Batch {
            total,
            resolved: AtomicUsize::new(0),
            failed: Mutex::new(Vec::new()),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });

        for (kind, descriptors) in &groups.0 {
            for descriptor in descriptors {
                let url = append_version(&descriptor.src, &self.version);

                // Only load once!
                if self.is_loaded(*kind, &url) {
                    trace!("{} already loaded: {}", kind, url);
                    batch.resolve();
                    continue;
                }

                let request = AssetRequest {
                    kind: *kind,
                    url: url.clone(),
                    id: descriptor.id.clone(),
                };
                let loaded = Arc::clone(&self.loaded);
                let batch = Arc::clone(&batch);
                let kind = *kind;
                self.fetcher.fetch(
                    request,
                    Box::new(move |result| {
                        match result {
                            Ok(()) => {
                                loaded
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .entry(kind)
                                    .or_default()
                                    .insert(url);
                            }
                            Err(e) => {
                                warn!("{}", e);
                                batch.failed.lock().unwrap_or_else(|e| e.into_inner()).push(url);
                            }
                        }
                        batch.resolve();
                    }),
                );
            }
        }
    }

    /// Whether the versioned `url` is recorded as loaded for `kind`
    pub fn is_loaded(&self, kind: AssetKind, url: &str) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .is_some_and(|set| set.contains(url))
    }

    /// Same as [`is_loaded`](Self::is_loaded) for an unversioned source path
    pub fn is_src_loaded(&self, kind: AssetKind, src: &str) -> bool {
        self.is_loaded(kind, &append_version(src, &self.version))
    }

    /// Total loaded assets across categories
    pub fn loaded_count(&self) -> usize {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fetcher that parks requests until the test resolves them.

    use super::*;

    #[derive(Default, Clone)]
    pub struct ParkedFetcher {
        pending: Arc<Mutex<Vec<(AssetRequest, Option<FetchCallback>)>>>,
    }

    impl ParkedFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fetch_count(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        pub fn urls(&self) -> Vec<String> {
            self.pending.lock().unwrap().iter().map(|(r, _)| r.url.clone()).collect()
        }

        pub fn resolve(&self, index: usize, result: Result<(), FetchError>) {
            let done = self.pending.lock().unwrap()[index].1.take();
            if let Some(done) = done {
                done(result);
            }
        }
    }

    impl AssetFetcher for ParkedFetcher {
        fn fetch(&self, request: AssetRequest, done: FetchCallback) {
            self.pending.lock().unwrap().push((request, Some(done)));
        }
    }

    /// Resolves every fetch synchronously with success
    pub struct InstantFetcher;

    impl AssetFetcher for InstantFetcher {
        fn fetch(&self, _request: AssetRequest, done: FetchCallback) {
            done(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{InstantFetcher, ParkedFetcher};
    use super::*;

    fn completion_counter() -> (Arc<Mutex<Vec<LoadReport>>>, impl FnOnce(LoadReport) + Send + 'static) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&reports);
        (reports, move |report| r.lock().unwrap().push(report))
    }

    #[test]
    fn test_completes_once_after_all_resolve_any_order() {
        let fetcher = ParkedFetcher::new();
        let loader = AssetLoader::new(Arc::new(fetcher.clone()), "1.0");
        let groups = AssetGroups::new().script("a.js").script("b.js").style("c.css");

        let (reports, done) = completion_counter();
        loader.load(&groups, done);
        assert_eq!(fetcher.fetch_count(), 3);

        fetcher.resolve(2, Ok(()));
        fetcher.resolve(0, Ok(()));
        assert!(reports.lock().unwrap().is_empty());

        fetcher.resolve(1, Ok(()));
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total, 3);
        assert!(reports[0].all_loaded());
    }

    #[test]
    fn test_reload_short_circuits_but_counts() {
        let fetcher = ParkedFetcher::new();
        let loader = AssetLoader::new(Arc::new(fetcher.clone()), "1.0");

        loader.load(&AssetGroups::new().script("a.js"), |_| {});
        fetcher.resolve(0, Ok(()));
        assert!(loader.is_src_loaded(AssetKind::Script, "a.js"));

        // a.js already loaded: only d.js is fetched, completion waits for it
        let (reports, done) = completion_counter();
        loader.load(&AssetGroups::new().script("a.js").script("d.js"), done);
        assert_eq!(fetcher.fetch_count(), 2);
        assert!(reports.lock().unwrap().is_empty());

        fetcher.resolve(1, Ok(()));
        assert_eq!(reports.lock().unwrap()[0].total, 2);
    }

    #[test]
    fn test_failures_count_as_resolved() {
        let fetcher = ParkedFetcher::new();
        let loader = AssetLoader::new(Arc::new(fetcher.clone()), "7");
        let (reports, done) = completion_counter();
        loader.load(&AssetGroups::new().style("x.css").style("y.css"), done);

        fetcher.resolve(0, Err(FetchError::NotFound("x.css?v=7".into())));
        fetcher.resolve(1, Ok(()));

        let reports = reports.lock().unwrap();
        assert_eq!(reports[0].failed, vec!["x.css?v=7".to_string()]);
        // Failed assets are not memoized
        assert!(!loader.is_src_loaded(AssetKind::Style, "x.css"));
        assert!(loader.is_src_loaded(AssetKind::Style, "y.css"));
    }

    #[test]
    fn test_loaded_sets_are_per_category() {
        let loader = AssetLoader::new(Arc::new(InstantFetcher), "2");
        loader.load(&AssetGroups::new().script("shared"), |_| {});

        assert!(loader.is_src_loaded(AssetKind::Script, "shared"));
        assert!(!loader.is_src_loaded(AssetKind::Style, "shared"));
        assert!(!loader.is_src_loaded(AssetKind::Script, "other"));
    }

    #[test]
    fn test_versioned_keys() {
        let fetcher = ParkedFetcher::new();
        let loader = AssetLoader::new(Arc::new(fetcher.clone()), "3.1");
        loader.load(&AssetGroups::new().template("tpl/home.html", "home-tpl").script("a.js?x=1"), |_| {});
        assert_eq!(fetcher.urls(), vec!["tpl/home.html?v=3.1", "a.js?x=1&v=3.1"]);
    }

    #[test]
    fn test_empty_groups_complete_immediately() {
        let loader = AssetLoader::new(Arc::new(ParkedFetcher::new()), "1");
        let (reports, done) = completion_counter();
        loader.load(&AssetGroups::new(), done);
        assert_eq!(reports.lock().unwrap().len(), 1);
        assert_eq!(reports.lock().unwrap()[0].total, 0);
    }

    #[test]
    fn test_groups_from_json() {
        let groups: AssetGroups =
            serde_json::from_str(r#"{"css": [{"src": "assets/css/views/home.css"}]}"#).unwrap();
        assert_eq!(groups.count(), 1);
        assert!(groups.0.contains_key(&AssetKind::Style));
    }
}
