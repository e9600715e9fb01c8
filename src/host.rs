//! In-process collaborators for the command-line host.
//!
//! Views print what they render, assets resolve against an optional
//! directory, and the network is offline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::controller::{ViewFactory, ViewLoadError};
use crate::core::assets::{AssetFetcher, AssetRequest, FetchCallback, FetchError};
use crate::core::net::{ApiRequest, ApiResponse, NetworkClient, ResponseCallback};
use crate::core::router::RouteParams;
use crate::core::views::{view_handle, View, ViewHandle};

/// Modules the console factory knows how to build
pub const MODULES: [&str; 7] = [
    "HomeView",
    "LoginView",
    "ProductsView",
    "ProductView",
    "ContactUsView",
    "PageNotFoundView",
    "MyAccountView",
];

/// View that writes each render to a shared transcript
pub struct ConsoleView {
    module: String,
    renders: usize,
    transcript: Arc<Mutex<Vec<String>>>,
}

impl View for ConsoleView {
    fn render(&mut self, params: &RouteParams) {
        self.renders += 1;
        let line = if params.is_empty() {
            format!("render {} (#{})", self.module, self.renders)
        } else {
            format!(
                "render {} (#{}) data={:?} query={:?}",
                self.module, self.renders, params.data, params.query_string
            )
        };
        info!("{}", line);
        self.transcript.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }

    fn dispose(&mut self) {
        debug!("dispose {}", self.module);
    }

    fn on_view_hidden(&mut self) {
        debug!("hide {}", self.module);
    }

    fn is_attached(&self) -> bool {
        self.renders > 0
    }
}

/// Builds [`ConsoleView`]s for the known modules
pub struct ConsoleFactory {
    broken: HashSet<String>,
    transcript: Arc<Mutex<Vec<String>>>,
}

impl ConsoleFactory {
    pub fn new(broken: impl IntoIterator<Item = String>) -> Self {
        Self {
            broken: broken.into_iter().collect(),
            transcript: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Render lines written so far, drained
    pub fn take_transcript(&self) -> Vec<String> {
        std::mem::take(&mut *self.transcript.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl ViewFactory for ConsoleFactory {
    fn create(&self, module: &str) -> Result<ViewHandle, ViewLoadError> {
        if !MODULES.contains(&module) {
            return Err(ViewLoadError::UnknownModule(module.to_string()));
        }
        if self.broken.contains(module) {
            return Err(ViewLoadError::Failed {
                module: module.to_string(),
                reason: "marked broken".to_string(),
            });
        }
        Ok(view_handle(ConsoleView {
            module: module.to_string(),
            renders: 0,
            transcript: Arc::clone(&self.transcript),
        }))
    }
}

/// Resolves assets synchronously, checking files under `root` if set
pub struct LocalFetcher {
    root: Option<PathBuf>,
}

impl LocalFetcher {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

impl AssetFetcher for LocalFetcher {
    fn fetch(&self, request: AssetRequest, done: FetchCallback) {
        let result = match &self.root {
            None => Ok(()),
            Some(root) => {
                // The version token is not part of the file name
                let path = request.url.split('?').next().unwrap_or(&request.url);
                if root.join(path).is_file() {
                    Ok(())
                } else {
                    Err(FetchError::NotFound(request.url.clone()))
                }
            }
        };
        done(result);
    }
}

/// Network client with no network: every call fails with status 0
pub struct OfflineClient;

impl NetworkClient for OfflineClient {
    fn call(&self, request: ApiRequest, done: ResponseCallback) {
        debug!("offline: {} {}", request.method, request.url);
        done(ApiResponse::failure(0, "offline"));
    }
}
