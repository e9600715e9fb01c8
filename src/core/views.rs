//! View registry - keeps live view instances warm across navigations.
//!
//! Views are shared as [`ViewHandle`]s. Lifecycle hooks are trait methods
//! with no-op defaults, so a view implements only what it needs.
//!
//! Hooks always run with the registry lock released. A view that is busy
//! (its own lock held further up the stack, e.g. it navigates from inside
//! `render`) has its hook skipped instead of deadlocking.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, TryLockError};

use indexmap::IndexMap;
use log::{debug, trace};

use super::router::RouteParams;

/// A renderable view with optional lifecycle hooks
pub trait View: Send {
    fn render(&mut self, params: &RouteParams);

    /// Release resources; called once before the registry drops the view
    fn dispose(&mut self) {}

    /// Exit action, called when another view becomes current
    fn on_view_hidden(&mut self) {}

    fn on_view_shown(&mut self) {}

    /// Whether the view is currently mounted in the host document
    fn is_attached(&self) -> bool {
        false
    }
}

pub type ViewHandle = Arc<Mutex<dyn View>>;

/// Wrap a concrete view into a [`ViewHandle`]
pub fn view_handle<V: View + 'static>(view: V) -> ViewHandle {
    Arc::new(Mutex::new(view))
}

/// Run `f` on the view unless it is locked further up the stack
pub(crate) fn with_view<R>(view: &ViewHandle, f: impl FnOnce(&mut dyn View) -> R) -> Option<R> {
    match view.try_lock() {
        Ok(mut v) => Some(f(&mut *v)),
        Err(TryLockError::Poisoned(e)) => Some(f(&mut *e.into_inner())),
        Err(TryLockError::WouldBlock) => {
            trace!("ViewRegistry: view busy, hook skipped");
            None
        }
    }
}

#[derive(Default)]
struct Inner {
    views: IndexMap<String, ViewHandle>,
    current: Option<ViewHandle>,
    do_not_cache: HashSet<String>,
}

/// Registry of live views plus the current-view pointer.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct ViewRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for ViewRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ViewRegistry")
            .field("views", &inner.views.keys().collect::<Vec<_>>())
            .field("has_current", &inner.current.is_some())
            .finish()
    }
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose `cleanup()` disposes the given ids
    pub fn with_do_not_cache<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        registry.set_do_not_cache(ids);
        registry
    }

    /// Replace the deny-list of views that are never kept warm
    pub fn set_do_not_cache<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().do_not_cache = ids.into_iter().map(Into::into).collect();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `view` under `id`, silently replacing any previous one
    pub fn register(&self, id: &str, view: ViewHandle) {
        if self.lock().views.insert(id.to_string(), view).is_some() {
            trace!("ViewRegistry: replaced view '{}'", id);
        }
    }

    pub fn get_view(&self, id: &str) -> Option<ViewHandle> {
        self.lock().views.get(id).cloned()
    }

    /// Make `view` current, calling the outgoing view's `on_view_hidden` first
    pub fn set_current_view(&self, view: ViewHandle) {
        let outgoing = self.lock().current.take();
        if let Some(old) = outgoing {
            with_view(&old, |v| v.on_view_hidden());
        }
        self.lock().current = Some(view);
    }

    pub fn current_view(&self) -> Option<ViewHandle> {
        self.lock().current.clone()
    }

    /// Dispose and remove the view under `id`; unknown ids are ignored
    pub fn dispose(&self, id: &str) {
        let removed = self.lock().views.shift_remove(id);
        if let Some(view) = removed {
            debug!("ViewRegistry: dispose '{}'", id);
            with_view(&view, |v| v.dispose());
        }
    }

    /// Dispose every registered view
    pub fn dispose_all(&self) {
        let drained: Vec<(String, ViewHandle)> = self.lock().views.drain(..).collect();
        for (id, view) in drained {
            debug!("ViewRegistry: dispose '{}'", id);
            with_view(&view, |v| v.dispose());
        }
    }

    /// Dispose everything and forget the current view
    pub fn reset(&self) {
        self.dispose_all();
        self.lock().current = None;
    }

    /// Dispose deny-listed views, only while a current view is attached
    pub fn cleanup(&self) {
        let current = match self.current_view() {
            Some(v) => v,
            None => return,
        };
        // A busy current view is mid-render, so it is live
        if !with_view(&current, |v| v.is_attached()).unwrap_or(true) {
            return;
        }

        let doomed: Vec<String> = {
            let inner = self.lock();
            inner
                .views
                .keys()
                .filter(|id| inner.do_not_cache.contains(*id))
                .cloned()
                .collect()
        };
        for id in doomed {
            self.dispose(&id);
        }
    }

    /// Number of live views
    pub fn count(&self) -> usize {
        self.lock().views.len()
    }

    /// Registered ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.lock().views.keys().cloned().collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingView;
    use super::*;

    struct Bare;

    impl View for Bare {
        fn render(&mut self, _params: &RouteParams) {}
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_register_replace_and_count() {
        let reg = ViewRegistry::new();
        let l = log();
        reg.register("home", view_handle(RecordingView::new("a", &l)));
        reg.register("home", view_handle(RecordingView::new("b", &l)));
        reg.register("login", view_handle(Bare));

        assert_eq!(reg.count(), 2);
        assert!(reg.get_view("home").is_some());
        assert!(reg.get_view("nope").is_none());
        // Replacement is silent: no dispose of the old view
        assert!(l.lock().unwrap().is_empty());
    }

    #[test]
    fn test_set_current_hides_outgoing() {
        let reg = ViewRegistry::new();
        let l = log();
        let a = view_handle(RecordingView::new("a", &l));
        let b = view_handle(RecordingView::new("b", &l));

        reg.set_current_view(a.clone());
        assert!(l.lock().unwrap().is_empty());

        reg.set_current_view(b.clone());
        assert_eq!(*l.lock().unwrap(), vec!["a:hidden"]);
        assert!(Arc::ptr_eq(&reg.current_view().unwrap(), &b));
    }

    #[test]
    fn test_dispose() {
        let reg = ViewRegistry::new();
        let l = log();
        reg.register("a", view_handle(RecordingView::new("a", &l)));
        reg.register("bare", view_handle(Bare));

        reg.dispose("a");
        reg.dispose("a");
        reg.dispose("missing");
        assert_eq!(*l.lock().unwrap(), vec!["a:dispose"]);

        reg.dispose_all();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn test_cleanup_disposes_only_deny_listed() {
        let reg = ViewRegistry::with_do_not_cache(["login"]);
        let l = log();
        let home = view_handle(RecordingView::new("home", &l));
        reg.register("home", home.clone());
        reg.register("login", view_handle(RecordingView::new("login", &l)));

        // No current view: nothing happens
        reg.cleanup();
        assert_eq!(reg.count(), 2);

        reg.set_current_view(home);
        reg.cleanup();
        assert_eq!(reg.ids(), vec!["home"]);
        assert_eq!(*l.lock().unwrap(), vec!["login:dispose"]);
    }

    #[test]
    fn test_cleanup_requires_attached_current() {
        let reg = ViewRegistry::with_do_not_cache(["login"]);
        let l = log();
        let mut detached = RecordingView::new("home", &l);
        detached.attached = false;
        reg.register("login", view_handle(RecordingView::new("login", &l)));
        reg.set_current_view(view_handle(detached));

        reg.cleanup();
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn test_reset() {
        let reg = ViewRegistry::new();
        let l = log();
        let a = view_handle(RecordingView::new("a", &l));
        reg.register("a", a.clone());
        reg.set_current_view(a);

        reg.reset();
        assert_eq!(reg.count(), 0);
        assert!(reg.current_view().is_none());
        assert_eq!(*l.lock().unwrap(), vec!["a:dispose"]);
    }

    #[test]
    fn test_busy_view_hook_skipped() {
        let reg = ViewRegistry::new();
        let l = log();
        let a = view_handle(RecordingView::new("a", &l));
        reg.set_current_view(a.clone());

        let _held = a.lock().unwrap();
        reg.set_current_view(view_handle(Bare));
        assert!(l.lock().unwrap().is_empty());
    }
}
