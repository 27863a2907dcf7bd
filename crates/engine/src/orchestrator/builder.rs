//! Orchestrator builder
//!
//! Without overrides the builder wires the live system: the catalog named
//! by the config (or an in-memory one), `/dev/veeamsnap` and sysfs.

use snapagent_core::{Catalog, DeviceDirectory, Result};
use snapagent_devices::SysfsDirectory;
use snapagent_kernel::{ControlChannel, VeeamsnapControl};
use snapagent_storage::CatalogStore;
use std::sync::Arc;

use super::Orchestrator;
use crate::config::AgentConfig;

/// Builder for [`Orchestrator`]
///
/// ```ignore
/// use snapagent_engine::{AgentConfig, Orchestrator};
///
/// // Live system
/// let agent = Orchestrator::builder().config(AgentConfig::from_file(path)?).build()?;
///
/// // Tests
/// let agent = Orchestrator::builder()
///     .kernel(Arc::new(SimulatedKernel::new()))
///     .directory(Arc::new(StaticDirectory::new()))
///     .build()?;
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: AgentConfig,
    catalog: Option<(Arc<dyn Catalog>, bool)>,
    kernel: Option<Arc<dyn ControlChannel>>,
    directory: Option<Arc<dyn DeviceDirectory>>,
}

impl OrchestratorBuilder {
    /// Builder with the default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an opened catalog store
    pub fn catalog_store(mut self, store: CatalogStore) -> Self {
        let fresh = store.is_fresh();
        self.catalog = Some((Arc::new(store), fresh));
        self
    }

    /// Use any catalog; `fresh` marks one created by this process
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>, fresh: bool) -> Self {
        self.catalog = Some((catalog, fresh));
        self
    }

    /// Use a kernel channel other than `/dev/veeamsnap`
    pub fn kernel(mut self, kernel: Arc<dyn ControlChannel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Use a device directory other than sysfs
    pub fn directory(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Validate the config and assemble the orchestrator
    ///
    /// Nothing runs yet; call [`Orchestrator::initialize`] and
    /// [`Orchestrator::start`].
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let (catalog, fresh) = match self.catalog {
            Some(catalog) => catalog,
            None => {
                let store = match &self.config.catalog_path {
                    Some(path) => CatalogStore::open(path)?,
                    None => CatalogStore::ephemeral(),
                };
                let fresh = store.is_fresh();
                (Arc::new(store) as Arc<dyn Catalog>, fresh)
            }
        };
        let kernel = self
            .kernel
            .unwrap_or_else(|| Arc::new(VeeamsnapControl::new()) as Arc<dyn ControlChannel>);
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(SysfsDirectory::new()) as Arc<dyn DeviceDirectory>);
        Ok(Orchestrator::assemble(
            self.config,
            catalog,
            fresh,
            kernel,
            directory,
        ))
    }
}
