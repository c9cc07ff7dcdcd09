//! Configuration — CLI flags, environment variables, config file.

use clap::Parser;
use std::fs;
use std::path::Path;

/// Invokerd — warm container pool for serverless function execution
#[derive(Parser, Debug)]
#[command(name = "invokerd", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(long, default_value = "invokerd.conf")]
    pub config: String,

    /// Invoker instance number (part of container names)
    #[arg(long)]
    pub instance: Option<u32>,

    /// Docker engine endpoint ("localhost" = local socket)
    #[arg(long)]
    pub docker_endpoint: Option<String>,

    /// Tag appended to stock runtime images
    #[arg(long)]
    pub image_tag: Option<String>,

    /// Registry prefix for stock runtime images
    #[arg(long)]
    pub registry: Option<String>,

    /// Network containers are attached to
    #[arg(long)]
    pub network: Option<String>,

    /// Edge host announced to containers via EDGE_HOST
    #[arg(long)]
    pub edge_host: Option<String>,

    /// Platform version announced to containers via WHISK_VERSION
    #[arg(long)]
    pub whisk_version: Option<String>,

    /// Memory limit per container, in MB
    #[arg(long)]
    pub memory_mb: Option<u64>,

    /// Seconds a container may sit idle before the GC removes it
    #[arg(long)]
    pub gc_threshold: Option<f64>,

    /// Seconds between GC sweeps
    #[arg(long)]
    pub gc_frequency: Option<f64>,

    /// Max warm (idle) containers kept in reserve
    #[arg(long)]
    pub max_idle: Option<usize>,

    /// Max live containers, counting ones still starting
    #[arg(long)]
    pub max_active: Option<usize>,

    /// Directory container logs are persisted to at teardown
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Keep containers whose init failed in the warm set
    #[arg(long)]
    pub reuse_after_failed_init: bool,

    /// HTTP port for admin API (health, metrics, status)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub invoker_instance: u32,
    pub docker_endpoint: String,
    pub docker_image_tag: String,
    pub docker_registry: String,
    pub container_network: String,
    pub edge_host: String,
    pub whisk_version: String,
    pub container_memory_mb: u64,
    pub gc_threshold: f64,
    pub gc_frequency: f64,
    pub max_idle: usize,
    pub max_active: usize,
    pub log_dir: String,
    pub reuse_after_failed_init: bool,
    pub admin_port: Option<u16>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            invoker_instance: 0,
            docker_endpoint: "localhost".into(),
            docker_image_tag: "latest".into(),
            docker_registry: String::new(),
            container_network: "bridge".into(),
            edge_host: "localhost".into(),
            whisk_version: env!("CARGO_PKG_VERSION").into(),
            container_memory_mb: 256,
            gc_threshold: 600.0,
            gc_frequency: 1.0,
            max_idle: 10,
            max_active: 4,
            log_dir: "/logs".into(),
            reuse_after_failed_init: false,
            admin_port: None,
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Load configuration: defaults → config file → env vars → CLI flags.
    pub fn load() -> Self {
        let cli = Cli::parse();
        let mut config = Config::default();

        // 1. Config file
        let config_path = Path::new(&cli.config);
        if config_path.exists()
            && let Ok(content) = fs::read_to_string(config_path)
        {
            apply_config_file(&mut config, &content);
        }

        // 2. Environment variables
        apply_env(&mut config);

        // 3. CLI flags (highest priority)
        if let Some(v) = cli.instance {
            config.invoker_instance = v;
        }
        if let Some(v) = cli.docker_endpoint {
            config.docker_endpoint = v;
        }
        if let Some(v) = cli.image_tag {
            config.docker_image_tag = v;
        }
        if let Some(v) = cli.registry {
            config.docker_registry = v;
        }
        if let Some(v) = cli.network {
            config.container_network = v;
        }
        if let Some(v) = cli.edge_host {
            config.edge_host = v;
        }
        if let Some(v) = cli.whisk_version {
            config.whisk_version = v;
        }
        if let Some(v) = cli.memory_mb {
            config.container_memory_mb = v;
        }
        if let Some(v) = cli.gc_threshold {
            config.gc_threshold = v.max(0.0);
        }
        if let Some(v) = cli.gc_frequency {
            config.gc_frequency = v;
        }
        if let Some(v) = cli.max_idle {
            config.max_idle = v;
        }
        if let Some(v) = cli.max_active {
            config.max_active = v;
        }
        if let Some(v) = cli.log_dir {
            config.log_dir = v;
        }
        if cli.reuse_after_failed_init {
            config.reuse_after_failed_init = true;
        }
        if let Some(v) = cli.admin_port {
            config.admin_port = Some(v);
        }
        if let Some(v) = cli.log_level {
            config.log_level = v;
        }

        config
    }

    /// Validate configuration. Returns an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.gc_frequency <= 0.0 {
            return Err("gc_frequency must be > 0".into());
        }
        if self.gc_threshold < 0.0 {
            return Err("gc_threshold must be >= 0".into());
        }
        if self.container_memory_mb == 0 {
            return Err("container_memory_mb must be > 0".into());
        }
        if self.log_dir.is_empty() {
            return Err("log_dir must not be empty".into());
        }
        Ok(())
    }
}

fn apply_config_file(config: &mut Config, content: &str) {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(eq_pos) = trimmed.find('=') else {
            continue;
        };

        let key = trimmed[..eq_pos].trim();
        let mut value = trimmed[eq_pos + 1..].trim().to_string();

        // Strip quotes
        if (value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\''))
        {
            value = value[1..value.len() - 1].to_string();
        }

        match key {
            "invoker_instance" | "instance" => {
                if let Ok(v) = value.parse() {
                    config.invoker_instance = v;
                }
            }
            "docker_endpoint" | "endpoint" => config.docker_endpoint = value,
            "docker_image_tag" | "image_tag" => config.docker_image_tag = value,
            "docker_registry" | "registry" => config.docker_registry = value,
            "container_network" | "network" => config.container_network = value,
            "edge_host" => config.edge_host = value,
            "whisk_version" => config.whisk_version = value,
            "container_memory_mb" | "memory_mb" => {
                if let Ok(v) = value.parse() {
                    config.container_memory_mb = v;
                }
            }
            "gc_threshold" => {
                if let Ok(v) = value.parse::<f64>() {
                    config.gc_threshold = v.max(0.0);
                }
            }
            "gc_frequency" => {
                if let Ok(v) = value.parse() {
                    config.gc_frequency = v;
                }
            }
            "max_idle" => {
                if let Ok(v) = value.parse() {
                    config.max_idle = v;
                }
            }
            "max_active" => {
                if let Ok(v) = value.parse() {
                    config.max_active = v;
                }
            }
            "log_dir" => config.log_dir = value,
            "reuse_after_failed_init" => {
                config.reuse_after_failed_init = matches!(value.as_str(), "true" | "1" | "yes");
            }
            "admin_port" => {
                if let Ok(v) = value.parse() {
                    config.admin_port = Some(v);
                }
            }
            "log_level" => config.log_level = value,
            _ => {}
        }
    }
}

fn apply_env(config: &mut Config) {
    if let Ok(v) = std::env::var("INVOKERD_INSTANCE")
        && let Ok(n) = v.parse()
    {
        config.invoker_instance = n;
    }
    if let Ok(v) = std::env::var("INVOKERD_DOCKER_ENDPOINT") {
        config.docker_endpoint = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_IMAGE_TAG") {
        config.docker_image_tag = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_REGISTRY") {
        config.docker_registry = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_NETWORK") {
        config.container_network = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_EDGE_HOST") {
        config.edge_host = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_WHISK_VERSION") {
        config.whisk_version = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_MEMORY_MB")
        && let Ok(n) = v.parse()
    {
        config.container_memory_mb = n;
    }
    if let Ok(v) = std::env::var("INVOKERD_GC_THRESHOLD")
        && let Ok(n) = v.parse::<f64>()
    {
        config.gc_threshold = n.max(0.0);
    }
    if let Ok(v) = std::env::var("INVOKERD_GC_FREQUENCY")
        && let Ok(n) = v.parse()
    {
        config.gc_frequency = n;
    }
    if let Ok(v) = std::env::var("INVOKERD_MAX_IDLE")
        && let Ok(n) = v.parse()
    {
        config.max_idle = n;
    }
    if let Ok(v) = std::env::var("INVOKERD_MAX_ACTIVE")
        && let Ok(n) = v.parse()
    {
        config.max_active = n;
    }
    if let Ok(v) = std::env::var("INVOKERD_LOG_DIR") {
        config.log_dir = v;
    }
    if let Ok(v) = std::env::var("INVOKERD_REUSE_AFTER_FAILED_INIT") {
        config.reuse_after_failed_init = matches!(v.as_str(), "true" | "1" | "yes");
    }
    if let Ok(v) = std::env::var("INVOKERD_ADMIN_PORT")
        && let Ok(p) = v.parse()
    {
        config.admin_port = Some(p);
    }
    if let Ok(v) = std::env::var("INVOKERD_LOG_LEVEL") {
        config.log_level = v;
    }
}
