use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;

// --- Error Type ---
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] io::Error),

    #[error("Invalid JSON config: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Unsupported config format '{0}', expected .json or .toml")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// --- Enums for Choices ---
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartitionScheme {
    #[default]
    Uniform,
    QuadTree,
}

// --- Configuration Sections ---

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DomainSettings {
    #[serde(default = "default_domain_size")]
    pub size: Vec<i64>,
    #[serde(default)]
    pub toroidal: bool,
}

fn default_domain_size() -> Vec<i64> { vec![64, 64] }

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            size: default_domain_size(),
            toroidal: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct PartitionSettings {
    #[serde(default)]
    pub scheme: PartitionScheme,
    /// Blocks per dimension for the uniform scheme; balanced when absent.
    #[serde(default)]
    pub dims: Option<Vec<usize>>,
    /// Split points applied in order for the quadtree scheme.
    #[serde(default)]
    pub split_points: Vec<Vec<i64>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct HaloSettings {
    #[serde(default = "default_halo_depth")]
    pub depth: i64,
}

fn default_halo_depth() -> i64 { 1 }

impl Default for HaloSettings {
    fn default() -> Self {
        Self { depth: default_halo_depth() }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BalancerSettings {
    /// Idle steps between balancing rounds, `null` to disable.
    #[serde(default = "default_balance_interval")]
    pub interval: Option<usize>,
    #[serde(default = "default_balance_threshold")]
    pub threshold: f64,
    #[serde(default = "default_balance_window")]
    pub window: usize,
    /// Cells moved per action; the halo depth when absent.
    #[serde(default)]
    pub offset: Option<i64>,
}

fn default_balance_interval() -> Option<usize> { Some(10) }
fn default_balance_threshold() -> f64 { 1.0 }
fn default_balance_window() -> usize { 10 }

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            interval: default_balance_interval(),
            threshold: default_balance_threshold(),
            window: default_balance_window(),
            offset: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MigrationSettings {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_max_rounds() -> usize { 16 }

impl Default for MigrationSettings {
    fn default() -> Self {
        Self { max_rounds: default_max_rounds() }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TransportSettings {
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

fn default_stall_timeout_ms() -> u64 { 30_000 }

impl Default for TransportSettings {
    fn default() -> Self {
        Self { stall_timeout_ms: default_stall_timeout_ms() }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_walkers_per_rank")]
    pub walkers_per_rank: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Bucket edge for walker neighborhood queries.
    #[serde(default = "default_discretization")]
    pub discretization: f64,
    #[serde(default = "default_diffusion_rate")]
    pub diffusion_rate: f64,
    /// Largest walker step per axis.
    #[serde(default = "default_walker_speed")]
    pub walker_speed: f64,
}

fn default_steps() -> usize { 100 }
fn default_walkers_per_rank() -> usize { 32 }
fn default_seed() -> u64 { 42 }
fn default_discretization() -> f64 { 4.0 }
fn default_diffusion_rate() -> f64 { 0.1 }
fn default_walker_speed() -> f64 { 1.5 }

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            walkers_per_rank: default_walkers_per_rank(),
            seed: default_seed(),
            discretization: default_discretization(),
            diffusion_rate: default_diffusion_rate(),
            walker_speed: default_walker_speed(),
        }
    }
}

// --- Top-Level Config Struct ---

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default)]
    pub domain: DomainSettings,
    #[serde(default)]
    pub partition: PartitionSettings,
    #[serde(default)]
    pub halo: HaloSettings,
    #[serde(default)]
    pub balancer: BalancerSettings,
    #[serde(default)]
    pub migration: MigrationSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

fn default_processes() -> usize { 4 }

impl Default for Config {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            domain: DomainSettings::default(),
            partition: PartitionSettings::default(),
            halo: HaloSettings::default(),
            balancer: BalancerSettings::default(),
            migration: MigrationSettings::default(),
            transport: TransportSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

impl Config {
    pub fn num_dims(&self) -> usize {
        self.domain.size.len()
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.stall_timeout_ms)
    }

    /// Cells moved per balancing action in each dimension.
    pub fn balance_offsets(&self) -> Vec<i64> {
        let offset = self.balancer.offset.unwrap_or(self.halo.depth).max(1);
        vec![offset; self.num_dims()]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nd = self.num_dims();
        if self.processes == 0 {
            return Err(invalid("processes must be positive"));
        }
        if nd == 0 || self.domain.size.iter().any(|&s| s <= 0) {
            return Err(invalid(format!(
                "domain size {:?} must list a positive extent per dimension",
                self.domain.size
            )));
        }
        if self.halo.depth < 0 || self.domain.size.iter().any(|&s| self.halo.depth >= s) {
            return Err(invalid(format!(
                "halo depth {} must be non-negative and smaller than the domain",
                self.halo.depth
            )));
        }

        match self.partition.scheme {
            PartitionScheme::Uniform => {
                if let Some(dims) = &self.partition.dims {
                    if dims.len() != nd {
                        return Err(invalid(format!(
                            "partition dims {:?} do not match {} domain dimensions",
                            dims, nd
                        )));
                    }
                    if dims.iter().product::<usize>() != self.processes {
                        return Err(invalid(format!(
                            "partition dims {:?} do not hold {} processes",
                            dims, self.processes
                        )));
                    }
                }
            }
            PartitionScheme::QuadTree => {
                let children = 1usize << nd;
                if nd > 1 && self.processes % (children - 1) != 1 {
                    return Err(invalid(format!(
                        "{} processes cannot form a {}-dimensional quad tree",
                        self.processes, nd
                    )));
                }
                if let Some(point) = self.partition.split_points.iter().find(|p| p.len() != nd) {
                    return Err(invalid(format!(
                        "split point {:?} does not have {} coordinates",
                        point, nd
                    )));
                }
            }
        }

        if self.balancer.threshold < 0.0 || self.balancer.window == 0 {
            return Err(invalid("balancer threshold must be non-negative and window positive"));
        }
        // Cells handed over by one action must stay inside the old owner's halo
        if let Some(offset) = self.balancer.offset {
            if offset < 1 || offset > self.halo.depth {
                return Err(invalid(format!(
                    "balancer offset {} must lie in 1..={} (the halo depth)",
                    offset, self.halo.depth
                )));
            }
        }
        if self.migration.max_rounds == 0 {
            return Err(invalid("migration max_rounds must be positive"));
        }
        if self.transport.stall_timeout_ms == 0 {
            return Err(invalid("transport stall_timeout_ms must be positive"));
        }
        let sim = &self.simulation;
        if sim.discretization <= 0.0 || sim.walker_speed < 0.0 {
            return Err(invalid("simulation discretization must be positive and walker speed non-negative"));
        }
        if !(0.0..=1.0 / (2.0 * nd as f64)).contains(&sim.diffusion_rate) {
            return Err(invalid(format!(
                "diffusion rate {} is unstable in {} dimensions",
                sim.diffusion_rate, nd
            )));
        }
        Ok(())
    }
}

// --- Loading Function ---

/// Reads a JSON or TOML config, chosen by file extension, and validates it.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let config: Config = match extension.as_str() {
        "json" => serde_json::from_str(&content)?,
        "toml" => toml::from_str(&content)?,
        other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use std::io::Write;

    fn json_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn load_valid_json() {
        let file = json_file(
            r#"{
              "processes": 6,
              "domain": { "size": [60, 40], "toroidal": true },
              "partition": { "scheme": "uniform", "dims": [3, 2] },
              "halo": { "depth": 2 },
              "balancer": { "interval": null }
            }"#,
        );
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.processes, 6);
        assert_eq!(config.domain.size, vec![60, 40]);
        assert!(config.domain.toroidal);
        assert_eq!(config.partition.dims, Some(vec![3, 2]));
        assert_eq!(config.balancer.interval, None);
        assert_eq!(config.balance_offsets(), vec![2, 2]);
        assert_eq!(config.simulation, SimulationSettings::default());
        assert_eq!(config.stall_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn load_valid_toml() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("run.toml");
        file.write_str(
            r#"
processes = 7

[domain]
size = [100, 100]

[partition]
scheme = "quadtree"
split_points = [[40, 60], [10, 80]]

[simulation]
steps = 12
"#,
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.partition.scheme, PartitionScheme::QuadTree);
        assert_eq!(config.partition.split_points.len(), 2);
        assert_eq!(config.simulation.steps, 12);
        assert_eq!(config.halo, HaloSettings::default());
        assert_eq!(config.balancer.interval, Some(10));
    }

    #[test]
    fn reject_unknown_extension() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("run.yaml");
        file.write_str("processes: 4").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
        assert!(matches!(
            load_config(&dir.path().join("missing.json")),
            Err(ConfigError::FileRead(_))
        ));
    }

    #[test]
    fn reject_parse_errors() {
        let file = json_file(r#"{ "processes": "four" }"#);
        assert!(matches!(load_config(file.path()), Err(ConfigError::JsonParse(_))));

        let dir = assert_fs::TempDir::new().unwrap();
        let toml = dir.child("bad.toml");
        toml.write_str("processes = [").unwrap();
        assert!(matches!(load_config(toml.path()), Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn validation_rules() {
        let cases: Vec<(&str, fn(&mut Config))> = vec![
            ("no processes", |c| c.processes = 0),
            ("empty extent", |c| c.domain.size = vec![64, 0]),
            ("deep halo", |c| c.halo.depth = 64),
            ("dims rank", |c| c.partition.dims = Some(vec![4])),
            ("dims product", |c| c.partition.dims = Some(vec![3, 2])),
            ("quadtree count", |c| {
                c.partition.scheme = PartitionScheme::QuadTree;
                c.processes = 6;
            }),
            ("wide offset", |c| c.balancer.offset = Some(2)),
            ("unstable diffusion", |c| c.simulation.diffusion_rate = 0.3),
            ("zero rounds", |c| c.migration.max_rounds = 0),
        ];
        for (name, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Validation(_))),
                "{} should be rejected",
                name
            );
        }
        assert!(Config::default().validate().is_ok());

        let mut quad = Config::default();
        quad.partition.scheme = PartitionScheme::QuadTree;
        quad.processes = 7;
        assert!(quad.validate().is_ok());
    }
}
