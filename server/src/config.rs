use clap::Parser;

/// Tally server configuration.
///
/// Parse once at startup; pass `&ServerConfig` through. Every knob can be set
/// by flag or environment variable; defaults suit local development.
#[derive(Parser, Debug, Clone)]
pub struct ServerConfig {
    /// SQLite database URL for the job store.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://tally.db")]
    pub database_url: String,

    /// HTTP bind address for the submission API.
    #[arg(long, env = "HTTP_BIND", default_value = "127.0.0.1:8080")]
    pub http_bind: String,

    /// Store connection pool size. The engine serializes writers, so a small
    /// pool is enough.
    #[arg(long, env = "STORE_POOL_SIZE", default_value_t = 5)]
    pub store_pool_size: u32,

    /// Number of workers launched by the supervisor.
    #[arg(long, env = "WORKER_COUNT", default_value_t = 1)]
    pub worker_count: usize,

    /// Duration of a claim before the reaper may reclaim it, in seconds.
    #[arg(long, env = "LEASE_SECONDS", default_value_t = 30)]
    pub lease_seconds: u64,

    /// Seconds between reaper scans.
    #[arg(long, env = "REAPER_INTERVAL", default_value_t = 5)]
    pub reaper_interval_seconds: u64,

    /// Max rows processed per reaper scan.
    #[arg(long, env = "BATCH", default_value_t = 100)]
    pub reaper_batch: i64,

    /// Retry cap before a job is marked failed.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: i64,

    /// Delay before the supervisor relaunches a crashed task, in milliseconds.
    #[arg(long, env = "RESTART_BACKOFF_MS", default_value_t = 1000)]
    pub restart_backoff_ms: u64,

    /// Max seconds to wait for in-flight work to drain at shutdown.
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace_seconds: u64,

    /// Upload size limit in bytes.
    #[arg(long, env = "MAX_TEXT_BYTES", default_value_t = 1_048_576)]
    pub max_text_bytes: usize,

    /// Probability in [0, 1] of injecting a transform error. Testing knob.
    #[arg(long, env = "FAULT_RATE", default_value_t = 0.0)]
    pub fault_rate: f64,

    /// Artificial delay before completion, in milliseconds.
    #[arg(long, env = "WORK_DELAY_MS", default_value_t = 2000)]
    pub work_delay_ms: u64,

    /// Capacity of the in-memory scheduling queue.
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,
}

impl ServerConfig {
    /// Parse config from environment only (no CLI parsing); the single fake
    /// argv element keeps clap away from the server subcommand flags.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self::parse_from(["tally-server"]);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.fault_rate),
            "FAULT_RATE must be within [0, 1], got {}",
            self.fault_rate
        );
        anyhow::ensure!(self.worker_count >= 1, "WORKER_COUNT must be at least 1");
        anyhow::ensure!(self.max_retries >= 1, "MAX_RETRIES must be at least 1");
        anyhow::ensure!(self.lease_seconds >= 1, "LEASE_SECONDS must be at least 1");
        anyhow::ensure!(self.queue_capacity >= 1, "QUEUE_CAPACITY must be at least 1");
        Ok(())
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds as i64)
    }

    pub fn work_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.work_delay_ms)
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn restart_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_seconds)
    }
}
