use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::FutureExt as _;
use indexmap::IndexMap;
use snafu::ResultExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Span};
use warden_config::GenericConfiguration;
use warden_error::{panic_to_error, GenericError};

use crate::{
    error::{FactoryResolution, KernelError, ModuleBoot},
    module::{Module, ModuleType, Stage},
};

/// A module factory.
///
/// Factories are called exactly once, during startup, to create the module they are registered for.
pub type ModuleFactory =
    Box<dyn FnOnce(&FactoryContext<'_>) -> Result<Box<dyn Module>, GenericError> + Send + 'static>;

/// A named set of module factories, in registration order.
pub type ModuleFactories = IndexMap<String, ModuleFactory>;

/// A callback producing additional module factories at startup.
///
/// Used when the set of modules to run is only known once configuration is available.
pub type ModuleFactoryCallback =
    Box<dyn FnOnce(&GenericConfiguration, &Span) -> Result<ModuleFactories, GenericError> + Send + 'static>;

/// Context available to module factories.
pub struct FactoryContext<'a> {
    root: &'a CancellationToken,
    config: &'a GenericConfiguration,
    span: &'a Span,
}

impl FactoryContext<'_> {
    /// Returns the kernel's root cancellation token.
    ///
    /// The root token is cancelled once the kernel has finished running, whether it stopped normally or not. Modules
    /// that spawn work outside of `run` can derive from it to ensure that work does not outlive the kernel.
    pub fn root_token(&self) -> &CancellationToken {
        self.root
    }

    /// Returns the configuration.
    pub fn config(&self) -> &GenericConfiguration {
        self.config
    }

    /// Returns the kernel span.
    pub fn span(&self) -> &Span {
        self.span
    }
}

/// Registration-time overrides for a module.
///
/// Overrides take precedence over whatever the module itself declares.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ModuleOptions {
    module_type: Option<ModuleType>,
    stage: Option<Stage>,
}

impl ModuleOptions {
    /// Overrides the stage of the module.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Overrides the type of the module.
    pub fn with_type(mut self, module_type: ModuleType) -> Self {
        self.module_type = Some(module_type);
        self
    }

    /// Returns the overridden module type, if any.
    pub fn module_type(&self) -> Option<ModuleType> {
        self.module_type
    }

    /// Returns the overridden stage, if any.
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }
}

struct ModuleDescriptor {
    name: String,
    factory: ModuleFactory,
    options: ModuleOptions,
}

/// A module which has been created and successfully booted.
pub(crate) struct BootedModule {
    pub name: String,
    pub module: Box<dyn Module>,
    pub options: ModuleOptions,
}

/// Registered modules and module factory callbacks.
#[derive(Default)]
pub(crate) struct ModuleRegistry {
    descriptors: Vec<ModuleDescriptor>,
    callbacks: Vec<ModuleFactoryCallback>,
}

impl ModuleRegistry {
    pub fn add(&mut self, name: String, factory: ModuleFactory, options: ModuleOptions) {
        self.descriptors.push(ModuleDescriptor { name, factory, options });
    }

    pub fn add_callback(&mut self, callback: ModuleFactoryCallback) {
        self.callbacks.push(callback);
    }

    /// Resolves every module factory callback, appending the factories they produce after the statically registered
    /// ones.
    ///
    /// Callbacks are invoked in registration order. The first callback that fails, or panics, stops resolution.
    ///
    /// # Errors
    ///
    /// If any callback fails, an error is returned.
    pub fn resolve_callbacks(&mut self, config: &GenericConfiguration, span: &Span) -> Result<(), KernelError> {
        for (index, callback) in std::mem::take(&mut self.callbacks).into_iter().enumerate() {
            let factories = catch_unwind(AssertUnwindSafe(|| callback(config, span)))
                .unwrap_or_else(|payload| Err(panic_to_error(payload)))
                .context(FactoryResolution { index })?;

            debug!(index, modules = factories.len(), "Resolved module factory callback.");

            for (name, factory) in factories {
                self.add(name, factory, ModuleOptions::default());
            }
        }

        Ok(())
    }

    /// Creates and boots every registered module, in registration order.
    ///
    /// # Errors
    ///
    /// If any factory fails, or any module fails to boot, an error is returned and no further modules are created.
    /// Modules that were already booted are dropped.
    pub async fn boot_all(
        self, root: &CancellationToken, config: &GenericConfiguration, span: &Span,
    ) -> Result<Vec<BootedModule>, KernelError> {
        let context = FactoryContext { root, config, span };
        let mut booted = Vec::with_capacity(self.descriptors.len());

        for ModuleDescriptor { name, factory, options } in self.descriptors {
            let mut module = catch_unwind(AssertUnwindSafe(|| factory(&context)))
                .unwrap_or_else(|payload| Err(panic_to_error(payload)))
                .context(ModuleBoot {
                    module_name: name.as_str(),
                })?;

            let module_span = debug_span!(parent: span, "module", module_name = %name);
            AssertUnwindSafe(module.boot(config, &module_span))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panic_to_error(payload)))
                .context(ModuleBoot {
                    module_name: name.as_str(),
                })?;

            debug!(module_name = %name, "Booted module.");

            booted.push(BootedModule { name, module, options });
        }

        Ok(booted)
    }
}
