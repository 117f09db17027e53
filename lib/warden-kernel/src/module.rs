use std::fmt;

use async_trait::async_trait;
use tracing::Span;
use warden_config::GenericConfiguration;
use warden_error::GenericError;

use crate::shutdown::ModuleShutdown;

/// Module type.
///
/// The type of a module decides whether or not it takes part in deciding when the kernel should stop on its own.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ModuleType {
    /// The kernel is meaningless without this module.
    ///
    /// When an essential module stops, for any reason, the kernel stops.
    Essential,

    /// A module doing the "real work" of the process.
    ///
    /// Once every essential and foreground module has stopped, the kernel stops.
    #[default]
    Foreground,

    /// A housekeeping module.
    ///
    /// Background modules run until they are told to stop, and never cause the kernel to stop by finishing.
    Background,
}

impl ModuleType {
    /// Returns `true` if modules of this type keep the kernel alive.
    pub const fn keeps_kernel_alive(&self) -> bool {
        matches!(self, Self::Essential | Self::Foreground)
    }

    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Self::Essential => "essential",
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Module stage.
///
/// Stages group modules by dependency depth: a higher stage depends on the stages below it. Modules in higher stages
/// are always stopped, and have returned, before any module in a lower stage is told to stop.
///
/// Any integer is a valid stage. The associated constants cover the common layering of a service.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Stage(i32);

impl Stage {
    /// Infrastructure everything else depends on.
    pub const ESSENTIAL: Stage = Stage(0);

    /// Services used by the application.
    pub const SERVICE: Stage = Stage(1);

    /// Application modules. This is the default stage.
    pub const APPLICATION: Stage = Stage(2);

    /// Creates a new `Stage` from the given value.
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Returns the numeric value of the stage.
    pub const fn as_i32(&self) -> i32 {
        self.0
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::APPLICATION
    }
}

impl From<i32> for Stage {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work run by the kernel.
///
/// # Lifecycle
///
/// Every module is created by its factory and then booted, sequentially, before any module starts running. Once all
/// modules have booted, every module is run concurrently on its own task. A module is considered finished when `run`
/// returns, whether it returns successfully, with an error, or by panicking.
///
/// `run` receives a [`ModuleShutdown`] that is triggered when the module's stage is being stopped. Long-running modules
/// are expected to return as soon as reasonably possible after that.
///
/// # Capabilities
///
/// Modules can optionally declare their [`ModuleType`] and [`Stage`]. When a module doesn't declare them, it defaults to
/// [`ModuleType::Foreground`] and [`Stage::APPLICATION`]. Either can also be overridden at registration time, which
/// takes precedence over what the module declares.
#[async_trait]
pub trait Module: Send {
    /// Boots the module.
    ///
    /// `span` is scoped to this module, and should be used as the parent of any spans or events emitted while the module
    /// is running.
    ///
    /// # Errors
    ///
    /// If the module cannot be booted, an error is returned, and the kernel aborts startup.
    async fn boot(&mut self, config: &GenericConfiguration, span: &Span) -> Result<(), GenericError>;

    /// Runs the module.
    ///
    /// # Errors
    ///
    /// If the module fails while running, an error is returned. Errors are logged by the kernel, and the module is treated
    /// as finished.
    async fn run(&mut self, shutdown: ModuleShutdown) -> Result<(), GenericError>;

    /// Returns the type of the module, if it declares one.
    fn module_type(&self) -> Option<ModuleType> {
        None
    }

    /// Returns the stage of the module, if it declares one.
    fn stage(&self) -> Option<Stage> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ordering() {
        let mut stages = vec![Stage::APPLICATION, Stage::new(777), Stage::ESSENTIAL, Stage::new(-3), Stage::SERVICE];
        stages.sort();

        assert_eq!(
            stages,
            vec![Stage::new(-3), Stage::ESSENTIAL, Stage::SERVICE, Stage::APPLICATION, Stage::new(777)]
        );
        assert_eq!(Stage::default(), Stage::APPLICATION);
    }

    #[test]
    fn module_type_defaults() {
        assert_eq!(ModuleType::default(), ModuleType::Foreground);
        assert!(ModuleType::Essential.keeps_kernel_alive());
        assert!(ModuleType::Foreground.keeps_kernel_alive());
        assert!(!ModuleType::Background.keeps_kernel_alive());
        assert_eq!(ModuleType::Background.to_string(), "background");
    }
}
