//! Core engine modules - events, caches, assets, views, routing
//!
//! These modules form the navigation engine, independent of any host.

pub mod assets;
pub mod cache;
pub mod clock;
pub mod dedup;
pub mod event_bus;
pub mod events;
pub mod net;
pub mod router;
pub mod timers;
pub mod views;

// Re-exports for convenience
pub use assets::{AssetFetcher, AssetGroups, AssetKind, AssetLoader, LoadReport};
pub use cache::{BoundedCache, CacheEntry, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::{CacheOutcome, RequestDeduplicator};
pub use event_bus::{handler, DispatchError, EventBus, Handler};
pub use events::{AppEvent, UserRecord};
pub use net::{ApiRequest, ApiResponse, Method, NetworkClient};
pub use router::{NavigationOutcome, RouteParams, Router, RouterError};
pub use timers::{TimerId, TimerQueue};
pub use views::{view_handle, View, ViewHandle, ViewRegistry};
