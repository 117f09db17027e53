//! Module lifecycle kernel.
//!
//! A [`Kernel`] owns a set of [`Module`]s, and runs them from startup to shutdown.
//!
//! # Modules
//!
//! Modules are registered with a factory, or produced at startup by a module factory callback. All modules are created
//! and booted sequentially, in registration order, and then run concurrently, each on its own task. If any module fails
//! to be created or booted, no module is run.
//!
//! Every module has a [`ModuleType`] and a [`Stage`]:
//!
//! - the type decides whether the module finishing causes the kernel to stop
//! - the stage decides when the module is told to stop, relative to other modules
//!
//! # Stopping
//!
//! The kernel stops when asked to through a [`KernelHandle`], when the process receives SIGINT or SIGTERM, when an
//! essential module finishes, or when every essential and foreground module has finished. Whatever triggers it first
//! is reported as the reason.
//!
//! Stages are stopped from the highest to the lowest: every module in a stage has returned before any module in a lower
//! stage is told to stop. If modules take longer than the kill timeout to return, the kernel gives up, and invokes its
//! force-exit callback.
#![deny(missing_docs)]

mod error;
pub use self::error::KernelError;

mod kernel;
pub use self::kernel::{Kernel, KernelConfiguration, KernelHandle, KernelOutcome, KernelState};

mod module;
pub use self::module::{Module, ModuleType, Stage};

mod registry;
pub use self::registry::{FactoryContext, ModuleFactories, ModuleFactory, ModuleFactoryCallback, ModuleOptions};

mod shutdown;
pub use self::shutdown::{ModuleShutdown, ShutdownHandle};

mod stage;
mod supervisor;
