use std::collections::BTreeMap;

use crate::{
    module::{Module, ModuleType, Stage},
    registry::BootedModule,
};

/// A booted module with its effective stage and type.
pub(crate) struct ClassifiedModule {
    pub name: String,
    pub stage: Stage,
    pub module_type: ModuleType,
    pub module: Box<dyn Module>,
}

/// Modules of a single stage, partitioned by type.
#[derive(Default)]
pub(crate) struct StageModules {
    essential: Vec<ClassifiedModule>,
    foreground: Vec<ClassifiedModule>,
    background: Vec<ClassifiedModule>,
}

impl StageModules {
    fn push(&mut self, module: ClassifiedModule) {
        match module.module_type {
            ModuleType::Essential => self.essential.push(module),
            ModuleType::Foreground => self.foreground.push(module),
            ModuleType::Background => self.background.push(module),
        }
    }

    pub fn count(&self, module_type: ModuleType) -> usize {
        match module_type {
            ModuleType::Essential => self.essential.len(),
            ModuleType::Foreground => self.foreground.len(),
            ModuleType::Background => self.background.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.essential.len() + self.foreground.len() + self.background.len()
    }

    pub fn into_modules(self) -> impl Iterator<Item = ClassifiedModule> {
        self.essential
            .into_iter()
            .chain(self.foreground)
            .chain(self.background)
    }
}

/// Booted modules grouped by stage, ordered from the lowest stage to the highest.
#[derive(Default)]
pub(crate) struct StageMap {
    stages: BTreeMap<Stage, StageModules>,
}

impl StageMap {
    /// Classifies booted modules by their effective stage and type.
    ///
    /// Registration overrides take precedence over what a module declares, and anything left undeclared falls back to
    /// the defaults: `Foreground` and `Stage::APPLICATION`.
    pub fn classify(modules: Vec<BootedModule>) -> Self {
        let mut map = Self::default();

        for BootedModule { name, module, options } in modules {
            let module_type = options.module_type().or_else(|| module.module_type()).unwrap_or_default();
            let stage = options.stage().or_else(|| module.stage()).unwrap_or_default();

            map.stages.entry(stage).or_default().push(ClassifiedModule {
                name,
                stage,
                module_type,
                module,
            });
        }

        map
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stage, &StageModules)> {
        self.stages.iter()
    }

    pub fn into_stages(self) -> impl Iterator<Item = (Stage, StageModules)> {
        self.stages.into_iter()
    }
}
