//! Configuration persistence for the slotserve server.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/slotserve/config.toml, or `--config PATH`)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use slotserve_core::admission::{AdmissionConfig, RateLimit};
use slotserve_core::backend::{ContextParams, ModelParams};
use slotserve_core::lora::{AdapterRegistryConfig, AdapterSpec};
use slotserve_core::slots::SlotPoolConfig;
use slotserve_core::worker::{default_worker_count, WorkerPoolConfig};

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the GGUF model file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Explicit path to the llama.cpp shared library.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llama_library: Option<PathBuf>,

    /// Host to bind to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port to listen on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Number of execution slots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots: Option<usize>,

    /// Number of worker threads. 0 picks a default from the CPU count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Requests queued for a worker before new ones are rejected with 503.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,

    /// Context window per slot in tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<usize>,

    /// Maximum tokens per evaluation call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Engine threads per slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Layers offloaded to the GPU.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_gpu: Option<i32>,

    /// Memory-map the model file. Forced off when adapters are configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmap: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlock: Option<bool>,

    /// Load startup adapters with scale 0 instead of applying them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_init_without_apply: Option<bool>,

    /// Upper bound on loaded adapters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_adapters: Option<usize>,

    /// Global burst size. Unset disables the global limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_capacity: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_second: Option<f64>,

    /// Per-client burst size. Unset disables per-client limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_rate_limit_capacity: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_rate_limit_per_second: Option<f64>,

    /// Default log level when `RUST_LOG` is not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Adapters loaded at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora: Option<Vec<AdapterSpec>>,
}

impl ServerConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("slotserve").join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if there is none.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &ServerConfig) {
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.llama_library.is_some() {
            self.llama_library = other.llama_library.clone();
        }
        if other.host.is_some() {
            self.host = other.host.clone();
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.slots.is_some() {
            self.slots = other.slots;
        }
        if other.workers.is_some() {
            self.workers = other.workers;
        }
        if other.queue_depth.is_some() {
            self.queue_depth = other.queue_depth;
        }
        if other.ctx_size.is_some() {
            self.ctx_size = other.ctx_size;
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.threads.is_some() {
            self.threads = other.threads;
        }
        if other.gpu_layers.is_some() {
            self.gpu_layers = other.gpu_layers;
        }
        if other.main_gpu.is_some() {
            self.main_gpu = other.main_gpu;
        }
        if other.mmap.is_some() {
            self.mmap = other.mmap;
        }
        if other.mlock.is_some() {
            self.mlock = other.mlock;
        }
        if other.lora_init_without_apply.is_some() {
            self.lora_init_without_apply = other.lora_init_without_apply;
        }
        if other.max_adapters.is_some() {
            self.max_adapters = other.max_adapters;
        }
        if other.rate_limit_capacity.is_some() {
            self.rate_limit_capacity = other.rate_limit_capacity;
        }
        if other.rate_limit_per_second.is_some() {
            self.rate_limit_per_second = other.rate_limit_per_second;
        }
        if other.client_rate_limit_capacity.is_some() {
            self.client_rate_limit_capacity = other.client_rate_limit_capacity;
        }
        if other.client_rate_limit_per_second.is_some() {
            self.client_rate_limit_per_second = other.client_rate_limit_per_second;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
        if other.lora.is_some() {
            self.lora = other.lora.clone();
        }
    }

    /// Fill in defaults and validate.
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let model = self.model.clone().ok_or(ConfigError::MissingModel)?;
        let adapters = self.lora.clone().unwrap_or_default();
        let defaults = ContextParams::default();

        let workers = match self.workers {
            Some(0) | None => default_worker_count(),
            Some(n) => n,
        };

        Ok(Settings {
            model,
            llama_library: self.llama_library.clone(),
            host: self.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8080),
            model_params: ModelParams {
                gpu_layers: self.gpu_layers.unwrap_or(0),
                main_gpu: self.main_gpu.unwrap_or(0),
                // Adapters are applied on top of the weights, which needs a
                // private copy.
                use_mmap: self.mmap.unwrap_or(true) && adapters.is_empty(),
                use_mlock: self.mlock.unwrap_or(false),
            },
            pool: SlotPoolConfig {
                num_slots: self.slots.unwrap_or(1).max(1),
                context: ContextParams {
                    n_ctx: self.ctx_size.unwrap_or(defaults.n_ctx),
                    n_batch: self.batch_size.unwrap_or(defaults.n_batch),
                    n_threads: self.threads,
                },
            },
            workers: WorkerPoolConfig {
                workers,
                queue_depth: self.queue_depth.unwrap_or(workers * 4),
            },
            admission: AdmissionConfig {
                global: rate_limit(self.rate_limit_capacity, self.rate_limit_per_second),
                per_client: rate_limit(
                    self.client_rate_limit_capacity,
                    self.client_rate_limit_per_second,
                ),
                max_clients: 0,
            },
            registry: AdapterRegistryConfig {
                max_adapters: self
                    .max_adapters
                    .unwrap_or(AdapterRegistryConfig::default().max_adapters),
            },
            adapters,
            apply_adapters: !self.lora_init_without_apply.unwrap_or(false),
            log_level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// A limit is enabled by its capacity; the rate defaults to the capacity
/// per second.
fn rate_limit(capacity: Option<u32>, per_second: Option<f64>) -> Option<RateLimit> {
    capacity.filter(|&c| c > 0).map(|capacity| RateLimit {
        capacity,
        refill_per_second: per_second.unwrap_or(f64::from(capacity)),
    })
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: PathBuf,
    pub llama_library: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub model_params: ModelParams,
    pub pool: SlotPoolConfig,
    pub workers: WorkerPoolConfig,
    pub admission: AdmissionConfig,
    pub registry: AdapterRegistryConfig,
    pub adapters: Vec<AdapterSpec>,
    pub apply_adapters: bool,
    pub log_level: String,
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
    /// Neither the CLI nor the config file named a model.
    MissingModel,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
            ConfigError::MissingModel => write!(f, "No model given, pass --model or set it in the config file"),
        }
    }
}

impl std::error::Error for ConfigError {}
