//! Resource configuration file.
//!
//! ```toml
//! [resource.localhost]
//! type = "shellcmd"
//! architecture = "x86_64"
//! max_cores = 4
//! max_cores_per_job = 2
//! max_memory_per_core = 2
//! max_walltime = "8h"
//! spooldir = "/tmp/gridflow"
//!
//! [resource.cluster]
//! type = "slurm"
//! architecture = ["x86_64", "i686"]
//! max_cores = 512
//! max_cores_per_job = 64
//! max_memory_per_core = "4GB"
//! max_walltime = 86400
//! auth = "kerberos"
//!
//! [auth.kerberos]
//! type = "kinit"
//!
//! [engine]
//! max_in_flight = 100
//! free_on_terminated = true
//! ```
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{Architecture, ResourceLimits};
use crate::engine::EngineConfig;
use crate::common::error::GridError;
use crate::{Map, Result, Set};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub resource: BTreeMap<String, ResourceConfig>,
    #[serde(default)]
    pub auth: BTreeMap<String, AuthConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Filled in from the stanza name.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "deserialize_architectures")]
    pub architecture: Vec<Architecture>,
    pub max_cores: u32,
    pub max_cores_per_job: u32,
    #[serde(deserialize_with = "deserialize_memory")]
    pub max_memory_per_core: u64,
    #[serde(deserialize_with = "deserialize_walltime")]
    pub max_walltime: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub auth: Option<String>,
    /// Backend specific keys.
    #[serde(flatten)]
    pub extra: Map<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, toml::Value>,
}

fn default_enabled() -> bool {
    true
}

impl GridConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            GridError::Config(format!(
                "cannot read configuration file {}: {error}",
                path.display()
            ))
        })?;
        Self::parse(&text).map_err(|error| match error {
            GridError::Config(message) => {
                GridError::Config(format!("{}: {message}", path.display()))
            }
            error => error,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config: GridConfig = toml::from_str(text)?;
        for (name, resource) in config.resource.iter_mut() {
            resource.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for resource in self.resource.values() {
            resource.limits().validate()?;
            if let Some(auth) = &resource.auth {
                if !self.auth.contains_key(auth) {
                    return Err(GridError::Config(format!(
                        "resource {} refers to undefined auth section `{auth}`",
                        resource.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn enabled_resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.resource.values().filter(|resource| resource.enabled)
    }
}

impl ResourceConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            name: self.name.clone(),
            architecture: self.architecture.iter().copied().collect::<Set<_>>(),
            max_cores: self.max_cores,
            max_cores_per_job: self.max_cores_per_job,
            max_memory_per_core: self.max_memory_per_core,
            max_walltime: self.max_walltime,
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|value| value.as_str())
    }

    pub fn extra_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(value)) if *value >= 0 => Ok(Some(*value as u64)),
            Some(value) => Err(GridError::Config(format!(
                "resource {}: `{key}` must be a non-negative integer, got {value}",
                self.name
            ))),
        }
    }

    pub fn spooldir(&self) -> Option<PathBuf> {
        self.extra_str("spooldir").map(PathBuf::from)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn deserialize_architectures<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Architecture>, D::Error> {
    let names = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => value.split(',').map(str::to_string).collect(),
        OneOrMany::Many(values) => values,
    };
    let mut architectures = Vec::new();
    for name in names.iter().filter(|name| !name.trim().is_empty()) {
        let arch = name
            .parse::<Architecture>()
            .map_err(serde::de::Error::custom)?;
        if !architectures.contains(&arch) {
            architectures.push(arch);
        }
    }
    Ok(architectures)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn deserialize_walltime<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(seconds) => Ok(Duration::from_secs(seconds)),
        NumberOrText::Text(text) => {
            humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
        }
    }
}

/// GB, either as a plain number or with an `MB`/`GB`/`TB` suffix.
fn deserialize_memory<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u64, D::Error> {
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(gb) => Ok(gb),
        NumberOrText::Text(text) => parse_memory(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_memory(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid memory amount `{text}`"))?;
    match unit.trim().to_uppercase().as_str() {
        "" | "G" | "GB" | "GIB" => Ok(number),
        "M" | "MB" | "MIB" => Ok(number.div_ceil(1024)),
        "T" | "TB" | "TIB" => Ok(number * 1024),
        other => Err(format!("unknown memory unit `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::backend::Architecture;
    use crate::common::error::GridError;
    use crate::config::{GridConfig, parse_memory};

    const CONFIG: &str = r#"
[resource.localhost]
type = "shellcmd"
architecture = "x86_64"
max_cores = 4
max_cores_per_job = 2
max_memory_per_core = 2
max_walltime = "2h 30m"
spooldir = "/tmp/gridflow"

[resource.cluster]
type = "slurm"
architecture = ["x86_64", "i686"]
max_cores = 512
max_cores_per_job = 64
max_memory_per_core = "4GB"
max_walltime = 86400
auth = "kerberos"
enabled = false

[auth.kerberos]
type = "kinit"
"#;

    #[test]
    fn test_parse_config() {
        let config = GridConfig::parse(CONFIG).unwrap();
        assert_eq!(config.resource.len(), 2);

        let local = &config.resource["localhost"];
        assert_eq!(local.name, "localhost");
        assert_eq!(local.kind, "shellcmd");
        assert_eq!(local.architecture, vec![Architecture::X86_64]);
        assert_eq!(local.max_walltime, Duration::from_secs(9000));
        assert_eq!(local.extra_str("spooldir"), Some("/tmp/gridflow"));
        assert!(local.enabled);

        let cluster = &config.resource["cluster"];
        assert_eq!(
            cluster.architecture,
            vec![Architecture::X86_64, Architecture::X86_32]
        );
        assert_eq!(cluster.max_memory_per_core, 4);
        assert_eq!(cluster.max_walltime, Duration::from_secs(86400));
        assert_eq!(cluster.auth.as_deref(), Some("kerberos"));
        assert_eq!(config.auth["kerberos"].kind, "kinit");

        let enabled: Vec<_> = config.enabled_resources().map(|r| r.name.as_str()).collect();
        assert_eq!(enabled, vec!["localhost"]);
        assert_eq!(config.engine.max_in_flight, 0);
    }

    #[test]
    fn test_engine_section() {
        let config = GridConfig::parse("[engine]\nmax_in_flight = 8\nforget_terminated = true").unwrap();
        assert!(config.resource.is_empty());
        assert_eq!(config.engine.max_in_flight, 8);
        assert!(config.engine.forget_terminated);
        assert!(!config.engine.free_on_terminated);
    }

    #[test]
    fn test_comma_separated_architectures() {
        let config = GridConfig::parse(
            r#"
[resource.r]
type = "noop"
architecture = "amd64, i386"
max_cores = 2
max_cores_per_job = 1
max_memory_per_core = 1
max_walltime = 60
"#,
        )
        .unwrap();
        let limits = config.resource["r"].limits();
        assert!(limits.architecture.contains(&Architecture::X86_64));
        assert!(limits.architecture.contains(&Architecture::X86_32));
    }

    #[test]
    fn test_invalid_configs() {
        let missing_arch = r#"
[resource.r]
type = "noop"
max_cores = 2
max_cores_per_job = 1
max_memory_per_core = 1
max_walltime = 60
"#;
        assert!(matches!(
            GridConfig::parse(missing_arch),
            Err(GridError::Config(_))
        ));

        let too_many_cores = r#"
[resource.r]
type = "noop"
architecture = "x86_64"
max_cores = 2
max_cores_per_job = 4
max_memory_per_core = 1
max_walltime = 60
"#;
        assert!(matches!(
            GridConfig::parse(too_many_cores),
            Err(GridError::Config(_))
        ));

        let unknown_auth = r#"
[resource.r]
type = "noop"
architecture = "x86_64"
max_cores = 2
max_cores_per_job = 1
max_memory_per_core = 1
max_walltime = 60
auth = "missing"
"#;
        assert!(matches!(
            GridConfig::parse(unknown_auth),
            Err(GridError::Config(_))
        ));

        assert!(matches!(
            GridConfig::parse("[resource.r]\ntype = 1"),
            Err(GridError::Config(_))
        ));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gridflow.toml");
        std::fs::write(&path, "[resource.r]\ntype = \"noop\"").unwrap();
        let error = GridConfig::load(&path).unwrap_err();
        assert!(error.to_string().contains("gridflow.toml"));

        let error = GridConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(error, GridError::Config(_)));
    }

    #[test]
    fn test_memory_units() {
        assert_eq!(parse_memory("2").unwrap(), 2);
        assert_eq!(parse_memory("2 GB").unwrap(), 2);
        assert_eq!(parse_memory("1536MB").unwrap(), 2);
        assert_eq!(parse_memory("1TB").unwrap(), 1024);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("3 PB").is_err());
    }
}
