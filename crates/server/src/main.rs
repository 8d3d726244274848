use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use slotserve_core::admission::Admission;
use slotserve_core::lora::{AdapterRegistry, AdapterSpec};
use slotserve_core::native::LlamaBackend;
use slotserve_core::slots::SlotPool;
use slotserve_core::worker::WorkerPool;

use slotserve_server::api::{self, AppState};
use slotserve_server::config::{ServerConfig, Settings};
use slotserve_server::logging;
use slotserve_server::shutdown::{self, shutdown_signal};

#[derive(Parser)]
#[command(name = "slotserve-server", about = "Slot-scheduled LLM inference server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Config file to read instead of ~/.config/slotserve/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the merged configuration back to the config file
    #[arg(long)]
    save_config: bool,

    /// Path to the GGUF model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Path to libllama (defaults to SLOTSERVE_LLAMA_SO_PATH, then the system search path)
    #[arg(long)]
    llama_library: Option<PathBuf>,

    /// Host to bind to [default: 127.0.0.1]
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on [default: 8080]
    #[arg(long)]
    port: Option<u16>,

    /// Number of execution slots, each with its own context and prefix cache [default: 1]
    #[arg(short = 's', long)]
    slots: Option<usize>,

    /// Worker threads [default: CPU count + 4]
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Requests queued for a worker before new ones get 503 [default: 4 per worker]
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Context size per slot in tokens
    #[arg(short = 'c', long)]
    ctx_size: Option<usize>,

    /// Maximum tokens per evaluation call
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Engine threads per slot
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Layers to offload to the GPU
    #[arg(long, visible_alias = "ngl")]
    gpu_layers: Option<i32>,

    /// GPU for scratch and small tensors
    #[arg(long)]
    main_gpu: Option<i32>,

    /// Read the model instead of memory-mapping it
    #[arg(long)]
    no_mmap: bool,

    /// Lock the model in RAM
    #[arg(long)]
    mlock: bool,

    /// LoRA adapter to load at startup with scale 1.0 (repeatable, implies --no-mmap)
    #[arg(long = "lora", value_name = "PATH")]
    lora: Vec<PathBuf>,

    /// LoRA adapter with an explicit scale (repeatable, implies --no-mmap)
    #[arg(long = "lora-scaled", num_args = 2, value_names = ["PATH", "SCALE"])]
    lora_scaled: Vec<String>,

    /// Load startup adapters without applying them
    #[arg(long)]
    lora_init_without_apply: bool,

    /// Maximum number of loaded adapters [default: 8]
    #[arg(long)]
    max_adapters: Option<usize>,

    /// Global request burst size (enables the global rate limit)
    #[arg(long)]
    rate_limit_capacity: Option<u32>,

    /// Global sustained requests per second
    #[arg(long)]
    rate_limit_per_second: Option<f64>,

    /// Per-client request burst size (enables per-client rate limits)
    #[arg(long)]
    client_rate_limit_capacity: Option<u32>,

    /// Per-client sustained requests per second
    #[arg(long)]
    client_rate_limit_per_second: Option<f64>,

    /// Log level when RUST_LOG is not set [default: info]
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds to wait for in-flight sessions on shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,
}

impl ServeArgs {
    /// Flags given on the command line, as a config layer.
    fn to_config(&self) -> anyhow::Result<ServerConfig> {
        let mut adapters: Vec<AdapterSpec> = self
            .lora
            .iter()
            .map(|path| AdapterSpec::new(path, 1.0))
            .collect();
        for pair in self.lora_scaled.chunks(2) {
            let [path, scale] = pair else {
                anyhow::bail!("--lora-scaled takes a path and a scale");
            };
            let scale: f32 = scale
                .parse()
                .with_context(|| format!("invalid scale '{scale}' for --lora-scaled {path}"))?;
            adapters.push(AdapterSpec::new(path, scale));
        }

        Ok(ServerConfig {
            model: self.model.clone(),
            llama_library: self.llama_library.clone(),
            host: self.host.clone(),
            port: self.port,
            slots: self.slots,
            workers: self.workers,
            queue_depth: self.queue_depth,
            ctx_size: self.ctx_size,
            batch_size: self.batch_size,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
            main_gpu: self.main_gpu,
            mmap: self.no_mmap.then_some(false),
            mlock: self.mlock.then_some(true),
            lora_init_without_apply: self.lora_init_without_apply.then_some(true),
            max_adapters: self.max_adapters,
            rate_limit_capacity: self.rate_limit_capacity,
            rate_limit_per_second: self.rate_limit_per_second,
            client_rate_limit_capacity: self.client_rate_limit_capacity,
            client_rate_limit_per_second: self.client_rate_limit_per_second,
            log_level: self.log_level.clone(),
            lora: (!adapters.is_empty()).then_some(adapters),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let mut config = match &args.config {
                Some(path) => ServerConfig::load_from(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?,
                None => {
                    if let Some(path) = ServerConfig::default_path().filter(|p| p.exists()) {
                        eprintln!("Loaded config from: {}", path.display());
                    }
                    ServerConfig::load()
                }
            };
            config.merge(&args.to_config()?);

            if args.save_config {
                let path = match &args.config {
                    Some(path) => {
                        config.save_to(path)?;
                        path.clone()
                    }
                    None => config.save()?,
                };
                eprintln!("Saved config to: {}", path.display());
            }

            let settings = config.resolve()?;
            run_server(settings, Duration::from_secs(args.shutdown_timeout)).await
        }
    }
}

async fn run_server(settings: Settings, shutdown_timeout: Duration) -> anyhow::Result<()> {
    logging::init(&settings.log_level)?;

    let Settings {
        model,
        llama_library,
        host,
        port,
        model_params,
        pool: pool_config,
        workers: worker_config,
        admission,
        registry: registry_config,
        adapters,
        apply_adapters,
        log_level: _,
    } = settings;

    // Model loading and context creation block for a long time.
    let (backend, pool, registry) = tokio::task::spawn_blocking(move || {
        let backend = Arc::new(
            LlamaBackend::load(llama_library.as_deref(), &model, &model_params)
                .with_context(|| format!("failed to load model {}", model.display()))?,
        );
        let pool = Arc::new(
            SlotPool::start(Arc::clone(&backend), &pool_config)
                .context("failed to start slot pool")?,
        );
        let registry = Arc::new(AdapterRegistry::new(
            Arc::clone(&backend),
            Arc::clone(&pool),
            &registry_config,
        ));
        registry
            .load_startup(&adapters, apply_adapters)
            .context("failed to load startup adapters")?;
        anyhow::Ok((backend, pool, registry))
    })
    .await??;

    let workers = Arc::new(WorkerPool::start(&worker_config).context("failed to start workers")?);
    tracing::info!(
        slots = pool.len(),
        workers = workers.workers(),
        queue_depth = worker_config.queue_depth,
        adapters = registry.len(),
        "server ready"
    );

    let state = AppState::new(
        backend,
        Arc::clone(&pool),
        registry,
        Arc::new(Admission::new(&admission)),
        Arc::clone(&workers),
    );
    let app = api::create_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Serving on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!(
        timeout_secs = shutdown_timeout.as_secs(),
        "stopped accepting connections, draining workers"
    );
    shutdown::drain(pool, workers, shutdown_timeout).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
