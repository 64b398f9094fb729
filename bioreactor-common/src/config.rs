use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::run_params::RunParams;
use std::path::Path;

// Flow-map window settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowMapConfig {
    /// Physical time (s) during which one flow snapshot stays valid.
    pub time_per_flowmap: f64,
    #[serde(default = "default_policy")]
    pub policy: TransitionPolicyKind,
    #[serde(default)]
    pub two_phase: bool,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPolicyKind {
    Discontinuous,
    Interpolated,
}

fn default_policy() -> TransitionPolicyKind {
    TransitionPolicyKind::Discontinuous
}

// Configuration for timing
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    pub delta_time: f64,
    pub final_time: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ParticlesConfig {
    pub total: u64,
    #[serde(default)]
    pub seed: u64,
}

/// Share policy used to split the particle population across ranks.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LoadBalancerConfig {
    Uniform,
    HostWeighted { alpha: f64 },
    Custom { ratios: Vec<f64> },
    Bounded { n_max: u64 },
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        LoadBalancerConfig::Uniform
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ParallelConfig {
    #[serde(default = "default_ranks")]
    pub ranks: u32,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
}

fn default_ranks() -> u32 {
    1
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig { ranks: default_ranks(), load_balancer: LoadBalancerConfig::Uniform }
    }
}

// Parameters of the synthetic flow-field generator
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SourceConfig {
    pub n_compartments: usize,
    pub n_flowmap: usize,
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_mean_flow")]
    pub mean_flow: f64,
    #[serde(default = "default_mean_volume")]
    pub mean_volume: f64,
}

fn default_max_neighbors() -> usize {
    4
}

fn default_mean_flow() -> f64 {
    1e-3
}

fn default_mean_volume() -> f64 {
    1e-2
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    #[serde(default)]
    pub save_stats: bool,
}

// Main run configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RunConfig {
    pub flowmap: FlowMapConfig,
    pub timing: TimingConfig,
    pub particles: ParticlesConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    pub source: SourceConfig,
    pub output: OutputConfig,
}

impl RunConfig {
    /// Loads the run configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| {
                anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e)
            })?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration held in memory.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.timing.delta_time > 0.0) {
            anyhow::bail!("delta_time must be positive.");
        }
        if !(self.timing.final_time > 0.0) {
            anyhow::bail!("final_time must be positive.");
        }
        if !(self.flowmap.time_per_flowmap > 0.0) {
            anyhow::bail!("time_per_flowmap must be positive.");
        }
        if self.parallel.ranks == 0 {
            anyhow::bail!("parallel.ranks must be greater than 0.");
        }
        if self.source.n_compartments == 0 || self.source.n_flowmap == 0 {
            anyhow::bail!("source must describe at least one compartment and one flow map.");
        }
        Ok(())
    }

    /// Converts the configuration into the parameters used at run time.
    pub fn get_run_params(&self) -> RunParams {
        let delta_time = self.timing.delta_time;
        // A snapshot is held for at least one step, even if dt exceeds its window.
        let n_per_flowmap = ((self.flowmap.time_per_flowmap / delta_time).round() as u64).max(1);
        let n_timestep = (self.timing.final_time / delta_time).ceil() as u64;

        RunParams {
            delta_time,
            final_time: self.timing.final_time,
            n_flowmap: self.source.n_flowmap,
            n_per_flowmap,
            n_timestep,
            two_phase: self.flowmap.two_phase,
            policy: self.flowmap.policy,
            total_particles: self.particles.total,
            ranks: self.parallel.ranks,
            seed: self.particles.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [flowmap]
        time_per_flowmap = 0.5
        two_phase = true

        [timing]
        delta_time = 0.1
        final_time = 4.0

        [particles]
        total = 1000

        [parallel]
        ranks = 4
        [parallel.load_balancer]
        policy = "host_weighted"
        alpha = 0.5

        [source]
        n_compartments = 20
        n_flowmap = 4

        [output]
        base_filename = "run"
    "#;

    #[test]
    fn parses_and_derives_run_params() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.parallel.load_balancer, LoadBalancerConfig::HostWeighted { alpha: 0.5 });
        assert_eq!(config.flowmap.policy, TransitionPolicyKind::Discontinuous);

        let params = config.get_run_params();
        assert_eq!(params.n_per_flowmap, 5);
        assert_eq!(params.n_timestep, 40);
        assert_eq!(params.n_flowmap, 4);
        assert!(params.two_phase);
    }

    #[test]
    fn custom_ratios_deserialize() {
        let text = SAMPLE.replace(
            "policy = \"host_weighted\"\n        alpha = 0.5",
            "policy = \"custom\"\n        ratios = [0.5, 0.25, 0.125, 0.125]",
        );
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert_eq!(
            config.parallel.load_balancer,
            LoadBalancerConfig::Custom { ratios: vec![0.5, 0.25, 0.125, 0.125] }
        );
    }

    #[test]
    fn rejects_non_positive_time_step() {
        let text = SAMPLE.replace("delta_time = 0.1", "delta_time = 0.0");
        assert!(RunConfig::from_toml_str(&text).is_err());
    }
}
