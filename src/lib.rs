pub mod auth;
pub mod config;
pub mod error;
pub mod registry;
pub mod sync;
pub mod tasks;
pub mod validate;

use std::sync::Arc;

use auth::AuthService;
use config::ServerConfig;
use registry::ChannelRegistry;
use sync::broadcaster::SyncBroadcaster;
use tasks::query::QueryEngine;
use tasks::TaskStore;

/// Shared application state passed to every connection handler and
/// background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub store: Arc<TaskStore>,
    pub broadcaster: Arc<SyncBroadcaster>,
    pub query: Arc<QueryEngine>,
    pub auth: Arc<dyn AuthService>,
    pub registry: Arc<dyn ChannelRegistry>,
}
