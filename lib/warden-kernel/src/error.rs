use snafu::Snafu;
use warden_error::GenericError;

use crate::module::Stage;

/// Kernel errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum KernelError {
    /// A module factory callback failed to produce its set of module factories.
    #[snafu(display("Module factory callback #{} failed: {}", index, source))]
    FactoryResolution {
        /// Registration index of the failing callback.
        index: usize,

        /// The underlying error.
        source: GenericError,
    },

    /// A module could not be created or booted.
    #[snafu(display("Module '{}' failed to boot: {}", module_name, source))]
    ModuleBoot {
        /// Name of the module.
        module_name: String,

        /// The underlying error.
        source: GenericError,
    },

    /// A module failed while running.
    #[snafu(display("Module '{}' failed during execution of stage {}: {}", module_name, stage, source))]
    ModuleRun {
        /// Name of the module.
        module_name: String,

        /// Stage the module was running in.
        stage: Stage,

        /// The underlying error.
        source: GenericError,
    },
}

#[cfg(test)]
mod tests {
    use warden_error::generic_error;

    use super::*;

    #[test]
    fn run_failure_names_module_and_stage() {
        let error = KernelError::ModuleRun {
            module_name: "worker".to_string(),
            stage: Stage::APPLICATION,
            source: generic_error!("panicked: boom"),
        };

        assert_eq!(
            error.to_string(),
            "Module 'worker' failed during execution of stage 2: panicked: boom"
        );
    }
}
