//! workerpipe - supervised worker processes fed over ZeroMQ

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::Level;

use cli::{Cli, Commands, InternalCommand, WorkerLogArgs};
use workerpipe::balancer::{
    BalancedWorkerSpec, BrokerPorts, BrokerTimeouts, LoadBalancer, LoadBalancerManager,
};
use workerpipe::config::{BalancerConfig, PipelineConfig, WorkerLogging};
use workerpipe::demo::probe::{ProbeJob, ProbeRequest, ProbeResult};
use workerpipe::demo::scan::{ScanBatch, ScanJob, partition};
use workerpipe::demo::stat::{StatJob, StatRequest, StatResult};
use workerpipe::ipc::{DAEMON_WORKER_ID, WorkerId};
use workerpipe::logfwd::{LogCollector, LogPublisher};
use workerpipe::logging::{self, LogConfig};
use workerpipe::pipeline::{
    JsonDecoder, PublishPullPipelineManager, PushPullDaemonManager, SinkEndpoint, SinkEvent,
    Terminating,
};
use workerpipe::process::{SharedRegistry, WorkerProgram};
use workerpipe::worker::{
    BalancedPorts, DaemonPorts, PipelinePorts, run_balanced_worker, run_daemon_worker,
    run_pipeline_worker,
};

/// How often driver loops wake up to check for interrupts and dead workers.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `probe` waits for the broker to exit before killing it.
const BROKER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Scan(args) => {
            init_driver_logging(&cli);
            cmd_scan(args)
        }
        Commands::Stat(args) => {
            init_driver_logging(&cli);
            cmd_stat(args)
        }
        Commands::Probe(args) => {
            init_driver_logging(&cli);
            cmd_probe(args)
        }
        Commands::Internal(command) => run_internal(command),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_driver_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    logging::init(
        LogConfig::default()
            .with_level(level)
            .with_format(cli.log_format)
            .with_env_overrides(),
    );
}

/// Install a Ctrl+C handler and return the flag it sets.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping workers...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;
    Ok(flag)
}

/// This executable, running one of the hidden `internal` subcommands.
fn worker_program(args: &[&str]) -> Result<WorkerProgram> {
    let program = WorkerProgram::current_exe().context("Cannot locate the workerpipe binary")?;
    Ok(program.with_args(std::iter::once("internal").chain(args.iter().copied())))
}

/// Start a log collector if worker logs should be forwarded.
fn start_collector(forward_logs: bool) -> Result<Option<LogCollector>> {
    if !forward_logs {
        return Ok(None);
    }
    let collector = LogCollector::start().context("Failed to start log collector")?;
    Ok(Some(collector))
}

fn worker_logging(collector: Option<&LogCollector>) -> WorkerLogging {
    WorkerLogging::inherit(collector.map(LogCollector::port))
}

fn cmd_scan(args: &cli::ScanArgs) -> Result<()> {
    let interrupted = interrupt_flag()?;
    let collector = start_collector(args.driver.forward_logs)?;
    let config = PipelineConfig::default()
        .with_logging(worker_logging(collector.as_ref()))
        .with_env_overrides();

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut manager = PublishPullPipelineManager::new(
        "Scan",
        worker_program(&["scan-worker"])?,
        &config,
        JsonDecoder::<ScanBatch>::new(),
        tx,
    )?;

    let assignments = partition(&args.directories, args.driver.workers);
    for (n, arguments) in assignments.iter().enumerate() {
        let worker_id = WorkerId::new(n as u32 + 1);
        manager
            .start_worker(worker_id, arguments)
            .with_context(|| format!("Failed to start scan worker {}", worker_id))?;
    }
    tracing::info!(workers = assignments.len(), "Scan workers started");

    let mut totals: BTreeMap<WorkerId, (usize, u64)> = BTreeMap::new();
    let mut finished = 0;
    let mut stopping = false;
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(SinkEvent::Data { worker_id, data }) => {
                if args.driver.json {
                    println!(
                        "{}",
                        json!({ "worker": worker_id, "files": data.files.len(), "bytes": data.bytes })
                    );
                }
                let entry = totals.entry(worker_id).or_default();
                entry.0 += data.files.len();
                entry.1 += data.bytes;
            }
            Ok(SinkEvent::WorkerFinished(worker_id)) => {
                tracing::debug!(worker_id = %worker_id, "Scan worker finished");
                finished += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let crashed = || {
            let alive = manager.pipeline().processes().registry().lock().alive_workers();
            if alive.is_empty() {
                tracing::error!("Scan workers exited without finishing");
            }
            alive.is_empty()
        };
        if !stopping
            && (finished == assignments.len() || interrupted.load(Ordering::SeqCst) || crashed())
        {
            stopping = true;
            manager.stop()?;
        }
    }
    manager.join_sink().context("Scan sink failed")?;
    drop(collector);

    let files: usize = totals.values().map(|(files, _)| files).sum();
    let bytes: u64 = totals.values().map(|(_, bytes)| bytes).sum();
    if args.driver.json {
        println!("{}", json!({ "files": files, "bytes": bytes }));
    } else {
        for (worker_id, (files, bytes)) in &totals {
            println!("  worker {}: {} files, {} bytes", worker_id, files, bytes);
        }
        println!(
            "{} {} files ({} bytes)",
            "Scanned".if_supports_color(Stdout, |text| text.green()),
            files,
            bytes
        );
    }
    Ok(())
}

fn cmd_stat(args: &cli::StatArgs) -> Result<()> {
    let interrupted = interrupt_flag()?;
    let collector = start_collector(args.driver.forward_logs)?;
    let config = PipelineConfig::default()
        .with_logging(worker_logging(collector.as_ref()))
        .with_env_overrides();

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut manager = PushPullDaemonManager::new(
        "Stat",
        worker_program(&["stat-daemon"])?,
        &config,
        JsonDecoder::<StatResult>::new(),
        tx,
    )?;
    manager.start();
    manager.send_start()?;
    for path in &args.paths {
        manager.send_message_to_worker(&StatRequest { path: path.clone() })?;
    }

    let mut received = 0;
    while received < args.paths.len() {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(SinkEvent::Data { data, .. }) => {
                received += 1;
                print_stat(&data, args.driver.json);
            }
            Ok(SinkEvent::WorkerFinished(_)) => {}
            Err(RecvTimeoutError::Timeout) => {
                if interrupted.load(Ordering::SeqCst) {
                    break;
                }
                if !manager.pipeline().processes().process_alive(DAEMON_WORKER_ID) {
                    tracing::error!("Stat daemon exited before answering every request");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    manager.stop()?;
    manager.join_sink().context("Stat sink failed")?;
    drop(collector);

    if received < args.paths.len() {
        anyhow::bail!("received {} of {} results", received, args.paths.len());
    }
    Ok(())
}

fn print_stat(result: &StatResult, json: bool) {
    if json {
        println!("{}", json!(result));
        return;
    }
    match (&result.error, result.size) {
        (Some(error), _) => println!(
            "{}: {}",
            result.path.display(),
            error.if_supports_color(Stdout, |text| text.red())
        ),
        (None, Some(size)) => println!(
            "{}: {} {} bytes",
            result.path.display(),
            if result.is_dir { "directory" } else { "file" },
            size
        ),
        (None, None) => println!("{}", result.path.display()),
    }
}

fn cmd_probe(args: &cli::ProbeArgs) -> Result<()> {
    let interrupted = interrupt_flag()?;
    let collector = start_collector(args.driver.forward_logs)?;

    let context = zmq::Context::new();
    let (tx, rx) = crossbeam_channel::unbounded();
    let endpoint = SinkEndpoint::bind(&context)?;
    let sink_port = endpoint.port();
    let mut sink = endpoint.spawn(
        "probe",
        SharedRegistry::new(),
        Terminating::default(),
        JsonDecoder::<ProbeResult>::new(),
        tx,
    )?;

    let config = BalancerConfig::default()
        .with_worker_count(args.driver.workers)
        .with_logging(worker_logging(collector.as_ref()))
        .with_env_overrides();
    let mut balancer = LoadBalancerManager::new(
        "Probe load balancer",
        worker_program(&["balancer", "--job", "probe"])?,
        sink_port,
        &config,
    )?;
    balancer
        .start_load_balancer()
        .context("Failed to start load balancer")?;
    let requests = balancer.requests()?;
    for path in &args.files {
        requests.send_request(&ProbeRequest { path: path.clone() })?;
    }

    let received = collect_probe_results(&rx, args, &interrupted, &balancer);

    balancer.stop()?;
    if !balancer.wait(BROKER_EXIT_TIMEOUT) {
        tracing::warn!("Load balancer did not exit, terminating it");
        balancer.forcefully_terminate();
    }
    sink.terminate()?;
    sink.join().context("Probe sink failed")?;
    drop(collector);

    if received < args.files.len() {
        anyhow::bail!("received {} of {} results", received, args.files.len());
    }
    Ok(())
}

fn collect_probe_results(
    rx: &Receiver<SinkEvent<ProbeResult>>,
    args: &cli::ProbeArgs,
    interrupted: &AtomicBool,
    balancer: &LoadBalancerManager,
) -> usize {
    let mut received = 0;
    while received < args.files.len() {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(SinkEvent::Data { worker_id, data }) => {
                received += 1;
                if args.driver.json {
                    println!("{}", json!({ "worker": worker_id, "result": data }));
                } else {
                    println!(
                        "{}: {} [{}]",
                        data.path.display(),
                        data.kind.if_supports_color(Stdout, |text| text.cyan()),
                        data.magic.as_deref().or(data.error.as_deref()).unwrap_or("")
                    );
                }
            }
            Ok(SinkEvent::WorkerFinished(_)) => {}
            Err(RecvTimeoutError::Timeout) => {
                if interrupted.load(Ordering::SeqCst) {
                    break;
                }
                if !balancer.is_running() {
                    tracing::error!("Load balancer exited before answering every request");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    received
}

fn run_internal(command: &InternalCommand) -> Result<()> {
    match command {
        InternalCommand::ScanWorker(args) => {
            let ports = PipelinePorts {
                receive: args.receive,
                send: args.send,
                controller: args.controller,
                sync: args.syncclient,
                worker_id: args.filter,
            };
            with_worker_logging(&format!("scan-worker-{}", args.filter), args.logging, || {
                run_pipeline_worker(ports, &mut ScanJob::new())
            })
        }
        InternalCommand::StatDaemon(args) => {
            let ports = DaemonPorts {
                receive: args.receive,
                send: args.send,
            };
            with_worker_logging("stat-daemon", args.logging, || {
                run_daemon_worker(ports, &mut StatJob::default())
            })
        }
        InternalCommand::Balancer(args) => {
            let ports = BrokerPorts {
                receive: args.receive,
                send: args.send,
                controller: args.controller,
            };
            let config = BalancerConfig::default().with_env_overrides();
            let timeouts = BrokerTimeouts {
                stop: config.stop_timeout,
                exit_grace: config.exit_grace,
                terminate: config.terminate_timeout,
            };
            let spec = match args.job {
                cli::BalancedJobKind::Probe => BalancedWorkerSpec {
                    worker_type: "Probe".to_string(),
                    program: worker_program(&["probe-worker"])?,
                    logging: WorkerLogging {
                        log_port: args.logging.log_port,
                        verbosity: args.logging.log_level,
                    },
                },
            };
            with_worker_logging("load-balancer", args.logging, || {
                LoadBalancer::connect(ports, spec, timeouts)?.run()
            })
        }
        InternalCommand::ProbeWorker(args) => {
            let ports = BalancedPorts {
                request: args.request,
                send: args.send,
                worker_id: args.identity,
            };
            with_worker_logging(&format!("probe-worker-{}", args.identity), args.logging, || {
                run_balanced_worker(ports, &mut ProbeJob)
            })
        }
    }
}

/// Set up worker logging, run the worker and withdraw from the collector.
fn with_worker_logging<F>(name: &str, logging: WorkerLogArgs, run: F) -> Result<()>
where
    F: FnOnce() -> workerpipe::Result<()>,
{
    let publisher = match logging.log_port {
        Some(port) => Some(
            LogPublisher::connect(name, port)
                .with_context(|| format!("{} cannot reach the log collector", name))?,
        ),
        None => None,
    };
    logging::init_worker(logging.log_level, publisher.clone());

    let result = run();
    if let Err(e) = &result {
        tracing::error!(worker = name, error = %e, "Worker failed");
    }
    if let Some(publisher) = publisher
        && let Err(e) = publisher.disconnect()
    {
        eprintln!("{}: cannot disconnect from log collector: {}", name, e);
    }
    result.with_context(|| format!("{} failed", name))
}
