//! Command-line interface definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use workerpipe::config::default_worker_count;
use workerpipe::ipc::WorkerId;
use workerpipe::logging::{DEFAULT_VERBOSITY, LogFormat};

/// Run work across supervised worker processes.
#[derive(Parser, Debug)]
#[command(name = "workerpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_parser = parse_log_format, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Count files under directories with a pool of scan workers.
    Scan(ScanArgs),

    /// Report file metadata from a stat daemon.
    Stat(StatArgs),

    /// Identify file types with a load balanced pool of probe workers.
    Probe(ProbeArgs),

    /// Worker entry points, started by the commands above.
    #[command(hide = true, subcommand)]
    Internal(InternalCommand),
}

/// Options shared by the demo commands.
#[derive(Args, Debug, Clone)]
pub struct DriverArgs {
    /// Number of worker processes.
    #[arg(short, long, env = "WORKERPIPE_WORKERS", default_value_t = default_worker_count())]
    pub workers: usize,

    /// Print results as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// Forward worker logs to this process.
    #[arg(long)]
    pub forward_logs: bool,
}

#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Directories to scan.
    #[arg(required = true)]
    pub directories: Vec<PathBuf>,

    #[command(flatten)]
    pub driver: DriverArgs,
}

#[derive(Parser, Debug)]
pub struct StatArgs {
    /// Paths to stat.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub driver: DriverArgs,
}

#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Files to probe.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub driver: DriverArgs,
}

/// Hidden worker entry points.
#[derive(Subcommand, Debug)]
pub enum InternalCommand {
    /// Scan worker in a publish/pull pipeline.
    ScanWorker(PipelineWorkerArgs),

    /// Stat daemon behind a push/pull manager.
    StatDaemon(DaemonArgs),

    /// Load balancer broker.
    Balancer(BalancerArgs),

    /// Probe worker behind a load balancer.
    ProbeWorker(BalancedWorkerArgs),
}

/// Logging options every worker receives.
#[derive(Args, Debug, Clone, Copy)]
pub struct WorkerLogArgs {
    /// Info port of the log collector.
    #[arg(long)]
    pub log_port: Option<u16>,

    /// Verbosity: 0 error, 1 warn, 2 info, 3 debug, 4 trace.
    #[arg(long, env = "WORKERPIPE_LOG_LEVEL", default_value_t = DEFAULT_VERBOSITY,
          value_parser = clap::value_parser!(u8).range(0..=4))]
    pub log_level: u8,
}

#[derive(Args, Debug)]
pub struct PipelineWorkerArgs {
    /// Port of the work publisher.
    #[arg(long)]
    pub receive: u16,

    /// Port of the sink.
    #[arg(long)]
    pub send: u16,

    /// Port of the control publisher.
    #[arg(long)]
    pub controller: u16,

    /// Port of the synchronization service.
    #[arg(long)]
    pub syncclient: u16,

    /// This worker's id.
    #[arg(long)]
    pub filter: WorkerId,

    #[command(flatten)]
    pub logging: WorkerLogArgs,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Port work is pushed from.
    #[arg(long)]
    pub receive: u16,

    /// Port of the sink.
    #[arg(long)]
    pub send: u16,

    #[command(flatten)]
    pub logging: WorkerLogArgs,
}

/// Jobs a broker can balance.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancedJobKind {
    Probe,
}

#[derive(Args, Debug)]
pub struct BalancerArgs {
    /// Job the broker's workers run.
    #[arg(long, value_enum)]
    pub job: BalancedJobKind,

    /// Port of the manager's requester.
    #[arg(long)]
    pub receive: u16,

    /// Port of the sink workers report to.
    #[arg(long)]
    pub send: u16,

    /// Port of the manager's controller.
    #[arg(long)]
    pub controller: u16,

    #[command(flatten)]
    pub logging: WorkerLogArgs,
}

#[derive(Args, Debug)]
pub struct BalancedWorkerArgs {
    /// Port of the broker's backend.
    #[arg(long)]
    pub request: u16,

    /// Port of the sink.
    #[arg(long)]
    pub send: u16,

    /// This worker's id.
    #[arg(long)]
    pub identity: WorkerId,

    #[command(flatten)]
    pub logging: WorkerLogArgs,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_pipeline_worker() {
        let cli = Cli::try_parse_from([
            "workerpipe",
            "internal",
            "scan-worker",
            "--receive",
            "1",
            "--send",
            "2",
            "--controller",
            "3",
            "--syncclient",
            "4",
            "--filter",
            "5",
            "--log-level",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Internal(InternalCommand::ScanWorker(args)) => {
                assert_eq!(args.filter, WorkerId::new(5));
                assert_eq!(args.syncclient, 4);
                assert_eq!(args.logging.log_level, 3);
                assert_eq!(args.logging.log_port, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_log_level_range() {
        let result = Cli::try_parse_from([
            "workerpipe",
            "internal",
            "stat-daemon",
            "--receive",
            "1",
            "--send",
            "2",
            "--log-level",
            "9",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_balancer() {
        let cli = Cli::try_parse_from([
            "workerpipe",
            "internal",
            "balancer",
            "--job",
            "probe",
            "--receive",
            "1",
            "--send",
            "2",
            "--controller",
            "3",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Internal(InternalCommand::Balancer(BalancerArgs {
                job: BalancedJobKind::Probe,
                ..
            }))
        ));
    }

    #[test]
    fn test_probe_requires_files() {
        assert!(Cli::try_parse_from(["workerpipe", "probe"]).is_err());
        let cli = Cli::try_parse_from(["workerpipe", "probe", "a", "--workers", "3"]).unwrap();
        match cli.command {
            Commands::Probe(args) => assert_eq!(args.driver.workers, 3),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
