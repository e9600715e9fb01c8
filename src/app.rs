//! Application wiring.
//!
//! Owns one instance of each engine component, hands clones to the parts
//! that need them, and reacts to the app-level events:
//! - `logged_in` / `log_out` / `logged_out` session flow
//! - `view_load_failed` falls back to the not-found view
//! - `view_rendered` counts page views
//!
//! Event handlers hold a `Weak` to the application, so dropping the last
//! [`Application`] handle tears the graph down.

use std::sync::{Arc, Mutex, RwLock, Weak};

use indexmap::IndexMap;
use log::{debug, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::controller::{default_routes, ReloadHook, RouteController, ViewFactory};
use crate::core::assets::{AssetFetcher, AssetLoader};
use crate::core::cache::BoundedCache;
use crate::core::clock::Clock;
use crate::core::event_bus::{handler, EventBus};
use crate::core::events::{names, AppEvent, UserRecord};
use crate::core::net::NetworkClient;
use crate::core::router::{NavigationOutcome, Router, RouterError};
use crate::core::views::ViewRegistry;
use crate::service::ApiService;
use crate::storage::Storage;

/// Storage key of the authenticated user record
pub const USER_KEY: &str = "user";

/// Capabilities the host supplies
pub struct Host {
    pub network: Arc<dyn NetworkClient>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub factory: Arc<dyn ViewFactory>,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub reload: Option<ReloadHook>,
}

struct Inner {
    config: RuntimeConfig,
    bus: EventBus,
    cache: BoundedCache,
    service: ApiService,
    assets: AssetLoader,
    views: ViewRegistry,
    router: Router,
    storage: Arc<dyn Storage>,
    user: RwLock<Option<UserRecord>>,
    ready: RwLock<bool>,
    /// Route id -> visits, in first-visit order
    page_views: Mutex<IndexMap<String, u64>>,
}

/// The application. Cloning yields another handle to the same instance.
#[derive(Clone)]
pub struct Application {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("router", &self.inner.router)
            .field("views", &self.inner.views)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Application {
    pub fn new(config: RuntimeConfig, host: Host) -> Result<Self, RouterError> {
        let bus = EventBus::new();
        let cache = BoundedCache::with_limits(Arc::clone(&host.clock), config.cache_limit_kb, config.cache_ttl());
        let service = ApiService::new(
            host.network,
            bus.clone(),
            cache.clone(),
            Arc::clone(&host.clock),
            &config.api_path,
            &config.app_version,
        );
        service.set_timeout(config.request_timeout());
        let assets = AssetLoader::new(host.fetcher, config.app_version.clone());
        let views = ViewRegistry::with_do_not_cache(config.do_not_cache.iter().cloned());
        let router = Router::new(&config.default_route);

        let mut controller = RouteController::new(views.clone(), assets.clone(), bus.clone(), host.factory);
        if let Some(reload) = host.reload {
            controller = controller.with_reload(reload);
        }
        controller.install(&router, default_routes())?;

        let app = Self {
            inner: Arc::new(Inner {
                config,
                bus,
                cache,
                service,
                assets,
                views,
                router,
                storage: host.storage,
                user: RwLock::new(None),
                ready: RwLock::new(false),
                page_views: Mutex::new(IndexMap::new()),
            }),
        };
        app.subscribe_events();
        app.install_auth_filter();
        Ok(app)
    }

    /// Gate filtered routes on a logged-in user; no user means logout
    fn install_auth_filter(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.router.add_filter(move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let app = Application { inner };
            if app.user().is_none() {
                debug!("auth filter: no user");
                app.logout();
                return false;
            }
            true
        });
    }

    /// Subscribe `f` to `name` with a weak handle to the app
    fn on<F>(&self, name: &str, f: F)
    where
        F: Fn(&Application, &AppEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.bus.subscribe(
            name,
            &handler(move |event| match weak.upgrade() {
                Some(inner) => f(&Application { inner }, event),
                None => Ok(()),
            }),
        );
    }

    fn subscribe_events(&self) {
        self.on(names::APP_READY, |app, _| {
            *app.inner.ready.write().unwrap_or_else(|e| e.into_inner()) = true;
            info!("app ready");
            Ok(())
        });

        self.on(names::LOGGED_IN, |app, event| {
            if let AppEvent::LoggedIn(Some(user)) = event {
                app.store_user(user.clone())?;
            }
            Ok(())
        });

        self.on(names::LOGGED_OUT, |_, _| {
            debug!("logged out");
            Ok(())
        });

        self.on(names::REQUEST_DONE, |_, event| {
            if let AppEvent::RequestDone { response, .. } = event {
                trace!("request done ({})", response.status);
            }
            Ok(())
        });

        self.on(names::REQUEST_FAIL, |_, event| {
            if let AppEvent::RequestFail { response, status_text } = event {
                debug!("request failed ({}): {}", response.status, status_text);
            }
            Ok(())
        });

        self.on(names::VIEW_LOAD_FAILED, |app, event| {
            if let AppEvent::ViewLoadFailed { id, view } = event {
                warn!("view '{}' ({}) failed to load", id, view);
                if *id != app.inner.config.not_found_route {
                    app.inner.router.navigate(&app.inner.config.not_found_route);
                }
            }
            Ok(())
        });

        self.on(names::VIEW_RENDERED, |app, event| {
            if let AppEvent::ViewRendered(id) = event {
                app.set_page_viewed(id);
            }
            Ok(())
        });

        self.on(names::LOG_OUT, |app, _| {
            app.logout();
            Ok(())
        });
    }

    fn store_user(&self, user: UserRecord) -> anyhow::Result<()> {
        let value = serde_json::to_value(&user)?;
        self.inner
            .storage
            .set(USER_KEY, value, Some(self.inner.config.user_ttl_minutes), false);
        *self.inner.user.write().unwrap_or_else(|e| e.into_inner()) = Some(user);
        Ok(())
    }

    /// Restore the session and dispatch `location`
    pub fn init(&self, location: Option<&str>) -> NavigationOutcome {
        let restored = self
            .inner
            .storage
            .get(USER_KEY)
            .and_then(|v| serde_json::from_value::<UserRecord>(v).ok())
            .filter(|u| !u.is_empty());
        let has_token = restored.as_ref().is_some_and(|u| u.token().is_some());
        *self.inner.user.write().unwrap_or_else(|e| e.into_inner()) = restored;
        if has_token {
            self.inner.bus.emit(AppEvent::LoggedIn(None));
        }

        let outcome = self.inner.router.init(location);
        self.inner.bus.emit(AppEvent::AppReady);
        outcome
    }

    /// Start a session for `user`
    pub fn login(&self, user: UserRecord) {
        self.inner.bus.emit(AppEvent::LoggedIn(Some(user)));
    }

    /// Drop all session state and return to the login route
    pub fn logout(&self) {
        info!("logout");
        self.inner.cache.empty(None);
        self.inner.views.dispose_all();
        *self.inner.user.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.storage.remove(USER_KEY);
        self.inner.router.navigate(&self.inner.config.login_route);
        self.inner.bus.emit(AppEvent::LoggedOut(None));
    }

    fn set_page_viewed(&self, page: &str) {
        let mut views = self.inner.page_views.lock().unwrap_or_else(|e| e.into_inner());
        *views.entry(page.to_string()).or_insert(0) += 1;
    }

    /// Visits per page, in first-visit order
    pub fn page_views(&self) -> Vec<(String, u64)> {
        self.inner
            .page_views
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn navigate(&self, target: &str) -> NavigationOutcome {
        self.inner.router.navigate(target)
    }

    /// Fire due cache expiries and request timeouts. Returns how many fired.
    pub fn tick(&self) -> usize {
        let expired = self.inner.cache.tick().len();
        let timed_out = self.inner.service.tick();
        if expired + timed_out > 0 {
            trace!("tick: {} cache expiries, {} timeouts", expired, timed_out);
        }
        expired + timed_out
    }

    pub fn user(&self) -> Option<UserRecord> {
        self.inner.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_app_ready(&self) -> bool {
        *self.inner.ready.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.inner.views
    }

    pub fn cache(&self) -> &BoundedCache {
        &self.inner.cache
    }

    pub fn service(&self) -> &ApiService {
        &self.inner.service
    }

    pub fn assets(&self) -> &AssetLoader {
        &self.inner.assets
    }
}
