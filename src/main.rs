use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use invokerd::admin::{self, AdminState};
use invokerd::config::Config;
use invokerd::docker::DockerBackend;
use invokerd::metrics::Metrics;
use invokerd::pool::Pool;

const BANNER: &str = r#"
  ╔══════════════════════════════════════════════════╗
  ║               I N V O K E R D  v0.4              ║
  ║      Warm container pool for function calls      ║
  ║                    [ Rust ]                      ║
  ╚══════════════════════════════════════════════════╝
"#;

#[tokio::main]
async fn main() {
    let config = Config::load();

    // Set up tracing with the configured log level
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    eprintln!("{BANNER}");

    if let Err(e) = config.validate() {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        warn!(dir = %config.log_dir, error = %e, "could not create log directory");
    }

    let backend = match DockerBackend::connect(&config.docker_endpoint) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(Metrics::new());
    let config = Arc::new(config);
    let pool = Arc::new(Pool::new(backend, Arc::clone(&config), Arc::clone(&metrics)));

    info!(
        endpoint = %config.docker_endpoint,
        network = %config.container_network,
        max_active = config.max_active,
        max_idle = config.max_idle,
        gc_threshold = config.gc_threshold,
        "invokerd starting"
    );

    // Reclaim containers left over from an earlier run before serving.
    match pool.kill_stragglers().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "removed stragglers"),
        Err(e) => warn!(error = %e, "straggler cleanup failed"),
    }

    tokio::spawn(Arc::clone(&pool).gc_loop());

    if let Some(port) = config.admin_port {
        let state = AdminState {
            metrics: Arc::clone(&metrics),
            pool: Arc::clone(&pool),
        };
        tokio::spawn(admin::serve(state, port));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutting down");
}
