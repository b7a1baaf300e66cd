use std::collections::HashMap;
use std::sync::Arc;

use octolab_domain::Runtime;

use crate::driver::RuntimeDriver;
use crate::error::DriverError;

/// Dispatches driver calls to the [`RuntimeDriver`] implementation registered
/// for a lab's [`Runtime`] (spec §4.2). A lab's `runtime` field is fixed at
/// creation and never changes, so this lookup never needs to fall back to a
/// default the way a multi-cloud registry would.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<Runtime, Arc<dyn RuntimeDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: HashMap::new() }
    }

    /// Registers a driver for a runtime kind. Returns `&mut self` for chaining.
    pub fn register(&mut self, runtime: Runtime, driver: Arc<dyn RuntimeDriver>) -> &mut Self {
        self.drivers.insert(runtime, driver);
        self
    }

    /// Resolves the driver for `runtime`.
    /// Returns [`DriverError::DriverNotConfigured`] if none is registered.
    pub fn for_runtime(&self, runtime: Runtime) -> Result<Arc<dyn RuntimeDriver>, DriverError> {
        self.drivers
            .get(&runtime)
            .cloned()
            .ok_or(DriverError::DriverNotConfigured(runtime))
    }

    /// Runtimes with a registered driver — used by `doctor` to report what
    /// this process can actually provision.
    pub fn active_runtimes(&self) -> Vec<Runtime> {
        self.drivers.keys().copied().collect()
    }
}
