use std::path::PathBuf;
use std::rc::Rc;

use crate::backend::batch::pbs::Pbs;
use crate::backend::batch::slurm::Slurm;
use crate::backend::batch::{PbsLrms, SlurmLrms};
use crate::backend::noop::NoOpLrms;
use crate::backend::shellcmd::ShellcmdLrms;
use crate::backend::{AuthHook, Authenticated, Lrms, LrmsRef, wrap_boxed_lrms, wrap_lrms};
use crate::common::error::GridError;
use crate::config::{GridConfig, ResourceConfig};
use crate::{Map, Result};

pub type LrmsConstructor = fn(&ResourceConfig) -> Result<Box<dyn Lrms>>;

/// Maps the `type` of a resource stanza to the backend that implements it.
pub struct LrmsRegistry {
    constructors: Map<String, LrmsConstructor>,
    auth: Map<String, AuthHook>,
}

impl Default for LrmsRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LrmsRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: Map::new(),
            auth: Map::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("noop", create_noop);
        registry.register("shellcmd", create_shellcmd);
        registry.register("pbs", create_pbs);
        registry.register("slurm", create_slurm);
        registry.register_auth("none", Rc::new(|| -> anyhow::Result<()> { Ok(()) }));
        registry
    }

    pub fn register(&mut self, kind: &str, constructor: LrmsConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    /// Hooks are looked up by the name of the `[auth.<name>]` section first,
    /// then by its `type`.
    pub fn register_auth(&mut self, name: &str, hook: AuthHook) {
        self.auth.insert(name.to_string(), hook);
    }

    fn auth_hook(&self, config: &GridConfig, name: &str) -> Result<AuthHook> {
        if let Some(hook) = self.auth.get(name) {
            return Ok(hook.clone());
        }
        config
            .auth
            .get(name)
            .and_then(|section| self.auth.get(&section.kind))
            .cloned()
            .ok_or_else(|| GridError::Config(format!("no authentication hook for `{name}`")))
    }

    pub fn build(&self, config: &GridConfig) -> Result<Vec<LrmsRef>> {
        let mut resources = Vec::new();
        for (name, resource) in &config.resource {
            if !resource.enabled {
                log::info!("Resource {name} is disabled, skipping it");
                continue;
            }
            let constructor = self.constructors.get(&resource.kind).ok_or_else(|| {
                GridError::Config(format!(
                    "resource {name} has unknown type `{}`",
                    resource.kind
                ))
            })?;
            let lrms = constructor(resource)?;
            let lrms = match &resource.auth {
                Some(auth) => {
                    let hook = self.auth_hook(config, auth)?;
                    wrap_lrms(Authenticated::from_boxed(lrms, hook))
                }
                None => wrap_boxed_lrms(lrms),
            };
            log::debug!("Created resource {name} of type {}", resource.kind);
            resources.push(lrms);
        }
        if resources.is_empty() {
            return Err(GridError::NoResources(
                "no enabled resource in the configuration".to_string(),
            ));
        }
        Ok(resources)
    }
}

fn default_spooldir(resource: &ResourceConfig) -> PathBuf {
    resource
        .spooldir()
        .unwrap_or_else(|| std::env::temp_dir().join("gridflow").join(&resource.name))
}

fn required_spooldir(resource: &ResourceConfig) -> Result<PathBuf> {
    resource.spooldir().ok_or_else(|| {
        GridError::Config(format!(
            "resource {} needs a `spooldir` on a filesystem shared with the compute nodes",
            resource.name
        ))
    })
}

fn create_noop(resource: &ResourceConfig) -> Result<Box<dyn Lrms>> {
    let seed = resource.extra_u64("seed")?;
    Ok(Box::new(NoOpLrms::new(resource.limits(), seed)))
}

fn create_shellcmd(resource: &ResourceConfig) -> Result<Box<dyn Lrms>> {
    Ok(Box::new(ShellcmdLrms::new(
        resource.limits(),
        default_spooldir(resource),
    )?))
}

fn create_pbs(resource: &ResourceConfig) -> Result<Box<dyn Lrms>> {
    Ok(Box::new(PbsLrms::new(
        resource.limits(),
        required_spooldir(resource)?,
        Pbs,
    )?))
}

fn create_slurm(resource: &ResourceConfig) -> Result<Box<dyn Lrms>> {
    Ok(Box::new(SlurmLrms::new(
        resource.limits(),
        required_spooldir(resource)?,
        Slurm,
    )?))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::backend::registry::LrmsRegistry;
    use crate::common::error::GridError;
    use crate::config::GridConfig;
    use crate::run::JobInfo;
    use crate::task::JobSpec;

    fn config(extra: &str) -> GridConfig {
        GridConfig::parse(&format!(
            r#"
[resource.sim]
type = "noop"
architecture = "x86_64"
max_cores = 8
max_cores_per_job = 2
max_memory_per_core = 2
max_walltime = "1h"
seed = 42
{extra}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_build_noop_resource() {
        let resources = LrmsRegistry::with_defaults().build(&config("")).unwrap();
        assert_eq!(resources.len(), 1);
        let lrms = resources[0].get();
        assert_eq!(lrms.name(), "sim");
        assert_eq!(lrms.limits().max_cores, 8);
    }

    #[test]
    fn test_unknown_type() {
        let config = config(
            r#"
[resource.grid]
type = "arc"
architecture = "x86_64"
max_cores = 8
max_cores_per_job = 2
max_memory_per_core = 2
max_walltime = "1h"
"#,
        );
        let result = LrmsRegistry::with_defaults().build(&config);
        assert!(matches!(result, Err(GridError::Config(_))));
    }

    #[test]
    fn test_disabled_resources_are_skipped() {
        let config = config("enabled = false");
        let result = LrmsRegistry::with_defaults().build(&config);
        assert!(matches!(result, Err(GridError::NoResources(_))));
    }

    #[test]
    fn test_auth_hook_by_section_type() {
        let config = config("auth = \"mine\"\n[auth.mine]\ntype = \"token\"");
        assert!(matches!(
            LrmsRegistry::with_defaults().build(&config),
            Err(GridError::Config(_))
        ));

        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut registry = LrmsRegistry::with_defaults();
        registry.register_auth(
            "token",
            Rc::new(move || -> anyhow::Result<()> {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        );
        let resources = registry.build(&config).unwrap();
        resources[0]
            .get_mut()
            .submit_job(&JobSpec::new(["true"]), &mut JobInfo::default())
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_batch_backends_need_spooldir() {
        let config = GridConfig::parse(
            r#"
[resource.cluster]
type = "pbs"
architecture = "x86_64"
max_cores = 8
max_cores_per_job = 2
max_memory_per_core = 2
max_walltime = "1h"
"#,
        )
        .unwrap();
        assert!(matches!(
            LrmsRegistry::with_defaults().build(&config),
            Err(GridError::Config(_))
        ));
    }
}
