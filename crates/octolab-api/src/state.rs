use std::sync::Arc;

use octolab_config::Settings;
use octolab_domain::RecipeLookup;
use octolab_driver::DriverRegistry;
use octolab_store::LabStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LabStore>,
    pub drivers: Arc<DriverRegistry>,
    pub recipes: Arc<dyn RecipeLookup>,
    pub settings: Arc<Settings>,
}
