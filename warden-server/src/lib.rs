pub mod actuator;
pub mod chat;
pub mod config;
pub mod error;
pub mod state_machine;
pub mod submit;
pub mod sweep;

use std::sync::Arc;

use crate::chat::{ChatGateway, PermissionOracle};
use crate::config::SettingsMap;
use crate::state_machine::repository::MemberRepository;

pub use error::WardenError;

/// Service version, baked in at compile time.
pub fn get_service_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Shared state for request handlers and the sweep loop.
pub struct AppState {
    pub gateway: Arc<dyn ChatGateway>,
    pub repository: Arc<dyn MemberRepository>,
    pub oracle: Arc<dyn PermissionOracle>,
    pub settings: Arc<SettingsMap>,
}
