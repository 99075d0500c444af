use anyhow::{Context, Result};
use clap::Parser;
use incr_serve::streaming::FileRegistry;
use incr_serve::transport::{Connection, Passthrough};
use incr_serve::{ServeConfig, Server};
use std::os::fd::RawFd;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "incr-serve")]
#[command(about = "Serve files block by block to an incremental reader", long_about = None)]
#[command(version)]
struct Cli {
    /// Already-open duplex stream socket connected to the peer
    #[arg(long, env = "INCR_SERVE_CONNECTION_FD")]
    connection_fd: RawFd,

    /// Descriptor receiving non-protocol bytes read from the connection
    #[arg(long, env = "INCR_SERVE_OUTPUT_FD", default_value_t = 1)]
    output_fd: RawFd,

    /// TOML file with serve settings
    #[arg(long, env = "INCR_SERVE_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for the peer when there is nothing to prefetch
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Blocks sent per prefetch tick
    #[arg(long)]
    prefetch_blocks: Option<usize>,

    /// Blocks queued after each served miss
    #[arg(long)]
    lookahead_blocks: Option<usize>,

    /// Write final statistics as JSON to this path
    #[arg(long)]
    stats_json: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Files to serve; ids are assigned in this order starting at 0
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Cli {
    fn serve_config(&self) -> Result<ServeConfig> {
        let mut config = match &self.config {
            Some(path) => ServeConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ServeConfig::default(),
        };
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout_ms = ms;
        }
        if let Some(blocks) = self.prefetch_blocks {
            config.prefetch_blocks_per_tick = blocks;
        }
        if let Some(blocks) = self.lookahead_blocks {
            config.lookahead_blocks = blocks;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "incr_serve=info",
        1 => "incr_serve=debug",
        _ => "incr_serve=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.serve_config()?;
    let files = FileRegistry::open(&cli.files).context("Failed to open input files")?;
    for file in files.iter() {
        tracing::debug!(
            file_id = file.id,
            path = %file.path.display(),
            size = file.size,
            blocks = file.block_count(),
            "Registered file"
        );
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    let stats = runtime.block_on(async {
        let conn = Connection::from_fd(cli.connection_fd)?;
        let passthrough = Passthrough::from_fd(cli.output_fd)?;
        let server = Server::new(files, conn.reader, conn.writer, passthrough, config);
        server.serve().await.context("Serving failed")
    })?;

    stats.log_summary();

    if let Some(path) = &cli.stats_json {
        let json = serde_json::to_string_pretty(&stats)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write stats to {}", path.display()))?;
    }

    Ok(())
}
