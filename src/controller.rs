//! Route controller - the actions bound to router patterns.
//!
//! A view action runs:
//! 1. `views.cleanup()`
//! 2. load the route's asset manifest
//! 3. on completion reuse the registered view or build one through the [`ViewFactory`]
//! 4. make it current, render it with the route params, publish `view_rendered`
//!
//! When the view cannot be built, `view_load_failed` is published instead.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::core::assets::{AssetGroups, AssetLoader};
use crate::core::event_bus::EventBus;
use crate::core::events::AppEvent;
use crate::core::router::{RouteParams, Router, RouterError};
use crate::core::views::{with_view, ViewHandle, ViewRegistry};

/// Id of the view shown for unknown locations
pub const PAGE_NOT_FOUND: &str = "pagenotfound";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewLoadError {
    UnknownModule(String),
    Failed { module: String, reason: String },
}

impl fmt::Display for ViewLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewLoadError::UnknownModule(m) => write!(f, "Module ({}) not found.", m),
            ViewLoadError::Failed { module, reason } => {
                write!(f, "Module ({}) failed to load: {}", module, reason)
            }
        }
    }
}

impl std::error::Error for ViewLoadError {}

/// Builds view instances by module name
pub trait ViewFactory: Send + Sync {
    fn create(&self, module: &str) -> Result<ViewHandle, ViewLoadError>;
}

impl<T: ViewFactory + ?Sized> ViewFactory for Arc<T> {
    fn create(&self, module: &str) -> Result<ViewHandle, ViewLoadError> {
        (**self).create(module)
    }
}

/// A route that shows a view
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRoute {
    /// Registry key of the view
    pub id: String,
    /// Module the factory builds the view from
    pub module: String,
    pub assets: AssetGroups,
}

impl ViewRoute {
    pub fn new(id: &str, module: &str) -> Self {
        Self {
            id: id.to_string(),
            module: module.to_string(),
            assets: AssetGroups::new(),
        }
    }

    pub fn with_style(mut self, src: &str) -> Self {
        self.assets = self.assets.style(src);
        self
    }

    pub fn with_assets(mut self, assets: AssetGroups) -> Self {
        self.assets = assets;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    View(ViewRoute),
    /// Publish `log_out`
    Logout,
    /// Only run the view cleanup
    Ignore,
    /// Ask the host to reload
    Refresh,
}

/// One row of the route table
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub pattern: String,
    /// Whether the filter chain gates this route
    pub filtered: bool,
    pub action: RouteAction,
}

impl RouteSpec {
    fn new(pattern: &str, filtered: bool, action: RouteAction) -> Self {
        Self {
            pattern: pattern.to_string(),
            filtered,
            action,
        }
    }
}

fn css(name: &str) -> String {
    format!("assets/css/views/{}.css", name)
}

/// The not-found view route
pub fn page_not_found() -> ViewRoute {
    ViewRoute::new(PAGE_NOT_FOUND, "PageNotFoundView")
}

/// Default route table. Empty locations go to the router's default route.
pub fn default_routes() -> Vec<RouteSpec> {
    let home = ViewRoute::new("home", "HomeView").with_style(&css("home"));
    let products = ViewRoute::new("products", "ProductsView").with_style(&css("products"));
    vec![
        RouteSpec::new("home", true, RouteAction::View(home)),
        RouteSpec::new("ignore", false, RouteAction::Ignore),
        RouteSpec::new(
            "login",
            false,
            RouteAction::View(ViewRoute::new("login", "LoginView").with_style(&css("login"))),
        ),
        RouteSpec::new("logout", false, RouteAction::Logout),
        RouteSpec::new("products", true, RouteAction::View(products.clone())),
        RouteSpec::new("products/:category", true, RouteAction::View(products)),
        RouteSpec::new(
            "product/:id",
            true,
            RouteAction::View(ViewRoute::new("product", "ProductView").with_style(&css("product"))),
        ),
        RouteSpec::new(
            "contact-us",
            false,
            RouteAction::View(ViewRoute::new("contact_us", "ContactUsView").with_style(&css("contact_us"))),
        ),
        RouteSpec::new("refresh", false, RouteAction::Refresh),
        RouteSpec::new(PAGE_NOT_FOUND, false, RouteAction::View(page_not_found())),
        RouteSpec::new(
            "my-account",
            true,
            RouteAction::View(ViewRoute::new("my_account", "MyAccountView").with_style(&css("my_account"))),
        ),
    ]
}

pub type ReloadHook = Arc<dyn Fn() + Send + Sync>;

/// Executes route actions against the view registry and asset loader
#[derive(Clone)]
pub struct RouteController {
    views: ViewRegistry,
    assets: AssetLoader,
    bus: EventBus,
    factory: Arc<dyn ViewFactory>,
    reload: Option<ReloadHook>,
}

impl fmt::Debug for RouteController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteController")
            .field("views", &self.views)
            .field("assets", &self.assets)
            .finish()
    }
}

impl RouteController {
    pub fn new(views: ViewRegistry, assets: AssetLoader, bus: EventBus, factory: Arc<dyn ViewFactory>) -> Self {
        Self {
            views,
            assets,
            bus,
            factory,
            reload: None,
        }
    }

    /// Hook run by the `refresh` route
    pub fn with_reload(mut self, reload: ReloadHook) -> Self {
        self.reload = Some(reload);
        self
    }

    /// Bind every row of `routes` plus the not-found view to `router`
    pub fn install(&self, router: &Router, routes: Vec<RouteSpec>) -> Result<(), RouterError> {
        for spec in routes {
            let ctl = self.clone();
            let action = spec.action;
            router.on(&spec.pattern, spec.filtered, move |params| ctl.run(&action, params))?;
        }
        let ctl = self.clone();
        let not_found = page_not_found();
        router.not_found(move |params| ctl.goto(&not_found, params.clone()));
        Ok(())
    }

    pub fn run(&self, action: &RouteAction, params: &RouteParams) {
        match action {
            RouteAction::View(route) => self.goto(route, params.clone()),
            RouteAction::Logout => self.bus.emit(AppEvent::LogOut),
            RouteAction::Ignore => self.views.cleanup(),
            RouteAction::Refresh => match &self.reload {
                Some(reload) => reload(),
                None => info!("refresh requested, no reload hook installed"),
            },
        }
    }

    /// Show the view of `route`, loading its assets first
    pub fn goto(&self, route: &ViewRoute, params: RouteParams) {
        debug!("goto '{}' ({})", route.id, route.module);
        self.views.cleanup();

        let ctl = self.clone();
        let target = route.clone();
        self.assets.load(&route.assets, move |report| {
            if !report.all_loaded() {
                warn!("'{}': {} of {} asset(s) failed", target.id, report.failed.len(), report.total);
            }
            ctl.activate(&target, &params);
        });
    }

    /// Assets are in: fetch or build the view, make it current, render it
    fn activate(&self, route: &ViewRoute, params: &RouteParams) {
        let view = match self.views.get_view(&route.id) {
            Some(v) => v,
            None => match self.factory.create(&route.module) {
                Ok(v) => {
                    self.views.register(&route.id, Arc::clone(&v));
                    v
                }
                Err(e) => {
                    warn!("{}", e);
                    self.bus.emit(AppEvent::ViewLoadFailed {
                        id: route.id.clone(),
                        view: route.module.clone(),
                    });
                    return;
                }
            },
        };

        self.views.set_current_view(Arc::clone(&view));
        let attached = with_view(&view, |v| {
            v.render(params);
            v.on_view_shown();
            v.is_attached()
        });
        let Some(attached) = attached else {
            // The view navigated to itself from inside its own render
            warn!("'{}' is already rendering", route.id);
            return;
        };
        self.bus.emit(AppEvent::ViewRendered(route.id.clone()));
        if attached {
            self.bus.emit(AppEvent::ViewInDom(route.id.clone()));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::views::testing::RecordingView;
    use crate::core::views::view_handle;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Builds [`RecordingView`]s for every module except the broken ones
    pub struct RecordingFactory {
        pub log: Arc<Mutex<Vec<String>>>,
        pub broken: HashSet<String>,
        pub created: Mutex<Vec<String>>,
    }

    impl RecordingFactory {
        pub fn new(log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                log: Arc::clone(log),
                broken: HashSet::new(),
                created: Mutex::new(Vec::new()),
            }
        }

        pub fn broken(mut self, module: &str) -> Self {
            self.broken.insert(module.to_string());
            self
        }
    }

    impl ViewFactory for RecordingFactory {
        fn create(&self, module: &str) -> Result<ViewHandle, ViewLoadError> {
            if self.broken.contains(module) {
                return Err(ViewLoadError::UnknownModule(module.to_string()));
            }
            self.created.lock().unwrap().push(module.to_string());
            Ok(view_handle(RecordingView::new(module, &self.log)))
        }
    }
}
