//! High-level application primitives.
//!
//! This crate provides what is necessary for bootstrapping an application: loading configuration, initializing
//! logging, and running the application's modules on a kernel.
#![deny(missing_docs)]

mod application;
pub use self::application::{Application, ApplicationBuilder};

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
    pub use super::{Application, ApplicationBuilder};
}
