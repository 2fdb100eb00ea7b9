use std::sync::Arc;

use crate::config::AppConfig;
use crate::files::StorageService;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub storage: Arc<StorageService>,
}
