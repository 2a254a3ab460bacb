//! Operator probe for a compute node's remote services.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use nimbus::pool::PoolStats;
use nimbus::{ComputeContext, Config, PerfStats, PAGE_SIZE};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "nimbus-probe",
    version,
    about = "Checks the page and log services a compute node depends on"
)]
struct Cli {
    #[arg(long, short, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "NIMBUS_PAGE_SERVICE_URL", help = "Override the page service URL")]
    page_service: Option<String>,

    #[arg(long, env = "NIMBUS_LOG_SERVICE_ADDR", help = "Override the log service address")]
    log_service: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as TOML.
    ShowConfig,
    /// Warm the pool and report its statistics.
    Status,
    /// Create a scratch table timeline, write, read back, append and delete it.
    Exercise {
        #[arg(long, default_value = "nimbus_probe")]
        table: String,
        #[arg(long, default_value_t = 8)]
        appends: u32,
        #[arg(long, help = "Keep the timeline instead of deleting it")]
        keep: bool,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(url) = cli.page_service {
        config.page_service_url = url;
    }
    if let Some(addr) = cli.log_service {
        config.log_service_addr = addr;
    }
    config.validate()?;

    match cli.command {
        Command::ShowConfig => {
            print!("{}", config.to_toml_string()?);
        }
        Command::Status => {
            let ctx = ComputeContext::start(config)?;
            let stats = ctx.shutdown();
            emit_stats(cli.format, &stats, &ctx.perf_stats());
        }
        Command::Exercise {
            table,
            appends,
            keep,
        } => {
            let ctx = ComputeContext::start(config)?;
            let outcome = exercise(&ctx, &table, appends, keep);
            let stats = ctx.shutdown();
            emit_stats(cli.format, &stats, &ctx.perf_stats());
            outcome?;
        }
    }
    Ok(())
}

fn exercise(ctx: &ComputeContext, table: &str, appends: u32, keep: bool) -> nimbus::Result<()> {
    let timeline = ctx.create_table_timeline(table)?;
    let session = ctx.open_table(table)?;
    let image = vec![0x5A; PAGE_SIZE];
    let written = session.write_page(0, &image)?;
    let read_back = session.read_page(0)?;
    if read_back[..] != image[..] {
        return Err(nimbus::NimbusError::Protocol(
            "page read back differs from the page written".into(),
        ));
    }
    let mut tickets = Vec::with_capacity(appends as usize);
    for i in 0..appends {
        tickets.push(session.append_async(format!("probe row {i}").into_bytes())?);
    }
    let mut last = written;
    for ticket in tickets {
        last = ticket.wait()?;
    }
    session.close()?;
    println!("timeline {timeline}: page lsn {written}, last append lsn {last}");
    if !keep {
        ctx.delete_table_timeline(table)?;
    }
    Ok(())
}

fn emit_stats(format: OutputFormat, pool: &PoolStats, perf: &PerfStats) {
    match format {
        OutputFormat::Text => {
            println!(
                "page pool: {} total, {} idle, {} requests, hit rate {:.2}",
                pool.page_total, pool.page_available, pool.page_requests, pool.page_hit_rate
            );
            println!(
                "log pool:  {} total, {} idle, {} requests, hit rate {:.2}",
                pool.log_total, pool.log_available, pool.log_requests, pool.log_hit_rate
            );
            println!(
                "requests: {} ({} cache hits, {} network calls, {} ms)",
                perf.total_requests, perf.cache_hits, perf.network_calls, perf.total_latency_ms
            );
        }
        OutputFormat::Json => {
            let value = json!({
                "pool": {
                    "page_total": pool.page_total,
                    "page_available": pool.page_available,
                    "page_requests": pool.page_requests,
                    "page_hit_rate": pool.page_hit_rate,
                    "log_total": pool.log_total,
                    "log_available": pool.log_available,
                    "log_requests": pool.log_requests,
                    "log_hit_rate": pool.log_hit_rate,
                },
                "perf": {
                    "total_requests": perf.total_requests,
                    "cache_hits": perf.cache_hits,
                    "network_calls": perf.network_calls,
                    "total_latency_ms": perf.total_latency_ms,
                },
            });
            println!("{value:#}");
        }
    }
}
