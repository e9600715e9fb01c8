//! NAVRT - client-side navigation and view-lifecycle runtime
//!
//! Re-exports all modules for use by binary targets.

// Core engine (events, caches, assets, views, routing)
pub mod core;

// App modules
pub mod app;
pub mod cli;
pub mod config;
pub mod controller;
pub mod host;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use app::{Application, Host};
pub use controller::{RouteController, ViewFactory, ViewLoadError, ViewRoute};
pub use core::cache::BoundedCache;
pub use core::event_bus::{handler, EventBus};
pub use core::events::{AppEvent, UserRecord};
pub use core::router::{NavigationOutcome, RouteParams, Router};
pub use core::views::{View, ViewRegistry};
pub use service::ApiService;
pub use storage::{MemoryStorage, Storage};
