use crate::gov::rpc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::{env, fmt};

#[derive(Debug, Parser)]
#[command(name = "govctl", version, about = "govmaster control client")]
pub struct GovctlArgs {
    /// Unix socket path to the govmaster daemon
    #[arg(short = 's', long = "sock")]
    pub sock: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Liveness check
    Ping,
    /// Daemon status: admission verdicts, counts, latest metrics (default)
    Status,
    /// Latest metrics sample, or the last n history rows
    Metrics {
        /// Number of history rows; omit for the latest sample only
        #[arg(short = 'n')]
        n: Option<usize>,
    },
    /// Show the effective governor policy
    Policy,
    /// Update the governor policy from a JSON body (same field names)
    PolicyUpdate { json: String },
    /// Diagnostics of the last supervision tick
    Diagnostics,
    /// Apply a per-PID policy message (JSON payload, <= 512 bytes)
    Apply { json: String },
    /// Submit a shell command as a supervised job
    Run {
        /// The command; quoting is preserved as a single shell string
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Show one job, or the most recent jobs
    JobStatus { id: Option<String> },
    /// Show captured output of a job
    Tail { id: String },
    /// Cancel a pending or running job
    Cancel { id: String },
    /// Show recent daemon events ("what happened")
    Events {
        /// Number of events to show
        #[arg(short = 'n', default_value_t = 200)]
        n: usize,
    },
    /// Print server build info (requires daemon socket)
    ServerVersion,
    /// Print local build info
    Version,
}

fn resolve_sock(args: &GovctlArgs) -> anyhow::Result<PathBuf> {
    if let Some(sock) = args.sock.clone() {
        return Ok(sock);
    }
    if let Ok(v) = env::var("GOVCTL_SOCK") {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }

    anyhow::bail!("{}", MissingSockHelp);
}

struct MissingSockHelp;

impl fmt::Display for MissingSockHelp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no govmaster socket specified")?;
        writeln!(f)?;
        writeln!(f, "govctl does not read the govmaster config file.")?;
        writeln!(f, "You must provide the daemon unix socket path via one of:")?;
        writeln!(f, "  - govctl --sock /path/to/govmaster.sock <command>")?;
        writeln!(f, "  - govctl -s /path/to/govmaster.sock <command>")?;
        writeln!(f, "  - export GOVCTL_SOCK=/path/to/govmaster.sock")?;
        writeln!(f)?;
        writeln!(f, "Examples:")?;
        writeln!(f, "  govctl --sock /tmp/govmaster.sock status")?;
        writeln!(f, "  GOVCTL_SOCK=/tmp/govmaster.sock govctl run sleep 30")?;
        Ok(())
    }
}

/// Render a Cmd as its request line on the wire.
pub fn request_line(cmd: &Cmd) -> String {
    match cmd {
        Cmd::Ping => "ping".to_string(),
        Cmd::Status => "status".to_string(),
        Cmd::Metrics { n: None } => "metrics latest".to_string(),
        Cmd::Metrics { n: Some(n) } => format!("metrics tail {n}"),
        Cmd::Policy => "governor/policy".to_string(),
        Cmd::PolicyUpdate { json } => format!("governor/policy_update {json}"),
        Cmd::Diagnostics => "governor/diagnostics".to_string(),
        Cmd::Apply { json } => format!("gov/apply {json}"),
        Cmd::Run { command } => format!("job run {}", command.join(" ")),
        Cmd::JobStatus { id: None } => "job status".to_string(),
        Cmd::JobStatus { id: Some(id) } => format!("job status {id}"),
        Cmd::Tail { id } => format!("job tail {id}"),
        Cmd::Cancel { id } => format!("job cancel {id}"),
        Cmd::Events { n } => format!("events {n}"),
        Cmd::ServerVersion => "server-version".to_string(),
        Cmd::Version => unreachable!("handled before socket resolution"),
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = GovctlArgs::parse();
    let cmd = args.cmd.as_ref().unwrap_or(&Cmd::Status);

    if matches!(cmd, Cmd::Version) {
        println!("{}", crate::gov::build_info::banner());
        return Ok(());
    }

    if let Cmd::Apply { json } = cmd {
        // Fail oversized payloads locally; the daemon would reject them too.
        anyhow::ensure!(
            json.len() <= crate::gov::rule::MAX_PAYLOAD_SIZE,
            "payload exceeds {} bytes",
            crate::gov::rule::MAX_PAYLOAD_SIZE
        );
        anyhow::ensure!(
            !json.contains('\n'),
            "payload must be a single line"
        );
    }

    let sock = resolve_sock(&args)?;
    let resp = rpc::client_call(&sock, &request_line(cmd))?;
    print!("{resp}");
    if !resp.ends_with('\n') {
        println!();
    }
    Ok(())
}
