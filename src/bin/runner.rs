//! runner CLI: serve a worker pool, submit commands, control pools.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use runner_rs::broker::{Broker, PostgresBroker};
use runner_rs::client::{Client, DEFAULT_MAX_IN_FLIGHT};
use runner_rs::config::Config;
use runner_rs::pool::Pool;
use runner_rs::protocol::{Channels, WorkItem};
use runner_rs::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "runner", about = "Run shell commands on pools of workers")]
struct Cli {
    /// Work queue to serve or submit to
    #[arg(short = 'w', long, global = true)]
    work_queue: Option<String>,
    /// Enable debug logs
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool until stopped
    Serve {
        /// Number of workers (default: available parallelism)
        #[arg(short = 'j', long)]
        num_procs: Option<usize>,
    },
    /// Submit a command to the queue
    Submit {
        /// Environment for the command, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,
        /// Do not wait for results
        #[arg(long)]
        no_wait: bool,
        /// Number of times to submit the command
        #[arg(short = 'n', long, default_value_t = 1)]
        num_jobs: usize,
        /// Command and arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Stop every pool serving the queue
    Stop,
    /// List registered pools
    Servers,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let Some(queue) = cli.work_queue.filter(|q| !q.is_empty()) else {
        bail!("must specify a work queue (-w)");
    };
    let config = Config::from_env()?;
    let _guard = telemetry(&config, cli.verbose, &cli.command)?;

    match cli.command {
        Command::Serve { num_procs } => cmd_serve(&config, &queue, num_procs).await,
        Command::Submit {
            env,
            cwd,
            no_wait,
            num_jobs,
            command,
        } => cmd_submit(&config, &queue, env, cwd, no_wait, num_jobs, command).await,
        Command::Stop => {
            let broker = connect(&config, &queue, 2).await?;
            Client::new(Arc::clone(&broker), &queue).stop_pools().await?;
            broker.close().await;
            Ok(())
        }
        Command::Servers => {
            let broker = connect(&config, &queue, 2).await?;
            for server in broker.members(&Channels::new(&queue).servers()).await? {
                println!("{server}");
            }
            broker.close().await;
            Ok(())
        }
    }
}

fn telemetry(config: &Config, verbose: bool, command: &Command) -> anyhow::Result<TelemetryGuard> {
    // Only the long-running pool exports telemetry.
    let endpoint = match command {
        Command::Serve { .. } => config.otel_endpoint.clone(),
        _ => None,
    };
    let default_level = if verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    Ok(init_telemetry(TelemetryConfig {
        endpoint,
        service_name: "runner".to_string(),
        default_level,
    })?)
}

async fn connect(
    config: &Config,
    queue: &str,
    max_connections: u32,
) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = PostgresBroker::connect(
        config.database_url.expose_secret(),
        config.postgres(max_connections),
    )
    .await
    .context("connecting to database")?;
    broker.migrate().await?;
    broker.create_queue(queue).await?;
    Ok(Arc::new(broker))
}

async fn cmd_serve(config: &Config, queue: &str, num_procs: Option<usize>) -> anyhow::Result<()> {
    let max = cpus() * 3;
    let workers = num_procs.unwrap_or_else(cpus);
    if workers == 0 || workers > max {
        bail!("invalid number of workers {workers}, must be between 1 and {max}");
    }

    let connections = u32::try_from(workers + 4).context("too many workers")?;
    let broker = connect(config, queue, connections).await?;
    let pool = Pool::new(broker, queue, workers)?;
    match pool.register().await {
        Ok(server) => info!(%server, "registered"),
        Err(e) => warn!("failed to register server: {e}"),
    }

    pool.start().await?;

    let stopper = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, stopping");
        stopper.stop();
    });

    pool.wait().await;
    Ok(())
}

async fn cmd_submit(
    config: &Config,
    queue: &str,
    env: Vec<(String, String)>,
    cwd: Option<String>,
    no_wait: bool,
    num_jobs: usize,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("must specify a command");
    };
    let mut item = WorkItem::new(program.as_str()).args(args.iter().cloned());
    for (key, value) in env {
        item = item.env(key, value);
    }
    if let Some(dir) = cwd {
        item = item.working_dir(dir);
    }

    // One listener connection per in-flight result, plus headroom for queries.
    let in_flight = num_jobs.clamp(1, DEFAULT_MAX_IN_FLIGHT);
    let connections = u32::try_from(in_flight + 4).context("too many jobs")?;
    let broker = connect(config, queue, connections).await?;
    let client = Client::new(Arc::clone(&broker), queue);

    if no_wait {
        let item = item.publish_result(false);
        for _ in 0..num_jobs {
            client.submit(&item).await?;
        }
    } else {
        let mut pending = client.submit_many(vec![item; num_jobs]).await?;
        while let Some(result) = pending.next().await {
            let result = result?;
            if result.exit_code == 0 {
                println!("{}", result.stdout.trim());
            } else {
                println!("{}", result.stderr.trim());
                if let Some(error) = result.error_message {
                    eprintln!("error: {error}");
                }
            }
        }
    }

    broker.close().await;
    Ok(())
}
