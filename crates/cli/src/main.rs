mod cli;
mod demo;
mod shutdown;

use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use jobq_core::settings;
use jobq_engine::{
    QueueEvent, SpawnMode, spawned_as_worker, start_queue, worker_main,
};

use crate::cli::Cli;
use crate::demo::ChainExecutor;
use crate::shutdown::{ShutdownSignal, spawn_ctrl_c_handler};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("JOBQ_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let executor = Arc::new(ChainExecutor);
    if spawned_as_worker() {
        // Worker subprocess: stdout belongs to the message channel from
        // here on; anything human-readable goes to stderr via tracing.
        return worker_main(executor).await;
    }

    let cli = Cli::parse();
    let settings = match settings::load_settings() {
        Ok(Some(settings)) => settings,
        Ok(None) => Default::default(),
        Err(err) => {
            eprintln!("warning: failed to read settings file: {err:#}");
            Default::default()
        }
    };

    let spawn = if cli.process_workers {
        SpawnMode::Subprocess {
            program: std::env::current_exe()?,
            args: Vec::new(),
        }
    } else {
        SpawnMode::InProcess(executor)
    };
    let cfg = cli.queue_config(&settings, spawn);
    if cfg.workers == 0 {
        anyhow::bail!("--workers must be >= 1");
    }

    println!(
        "jobq {} workers={}{}",
        env!("CARGO_PKG_VERSION"),
        cfg.workers,
        if cli.process_workers { " (subprocess)" } else { "" },
    );

    let handle = start_queue(cfg);
    let mut events = handle.subscribe();
    let mut shutdown_rx = spawn_ctrl_c_handler();

    let mut outstanding: HashSet<String> = cli.queries.iter().cloned().collect();
    for query in &cli.queries {
        handle.submit(query.clone()).await?;
    }

    let mut immediate_exit = false;
    while !outstanding.is_empty() {
        tokio::select! {
            signal = shutdown_rx.recv() => match signal {
                Some(ShutdownSignal::Graceful) => {
                    eprintln!("Stop requested — draining in-flight jobs (press CTRL+C again to exit immediately).");
                    handle.request_stop();
                }
                Some(ShutdownSignal::Immediate) => {
                    eprintln!("Stop requested again — exiting immediately.");
                    immediate_exit = true;
                    break;
                }
                None => {}
            },
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    QueueEvent::JobFinished { job } => {
                        match (&job.result, &job.error) {
                            (Some(result), _) => println!("{}: {result}", job.query),
                            (None, Some(error)) => println!("{}: failed ({error})", job.query),
                            _ => println!("{}: {}", job.query, job.status),
                        }
                        outstanding.remove(&job.query);
                    }
                    QueueEvent::Warning { message } => eprintln!("warning: {message}"),
                    QueueEvent::Stopped => break,
                    _ => {}
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    if !cli.no_report {
        print!("{}", handle.report());
    }
    handle.shutdown().await?;
    Ok(())
}
