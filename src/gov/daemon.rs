use crate::gov::build_info;
use crate::gov::cgroup::CgroupDriver;
use crate::gov::config::MasterConfig;
use crate::gov::governor::{GovernorPolicy, PolicyFile, PolicyUpdateBody};
use crate::gov::job::{ProcfsInspector, ShellSpawner};
use crate::gov::metrics::{MetricsHistory, MetricsSampler, SystemMetrics};
use crate::gov::process_governor::{GovEvent, ProcessGovernor};
use crate::gov::rule::{parse_gov_apply, AckCode};
use crate::gov::runner::JobRunner;
use anyhow::Context as _;
use chrono::Local;
use nix::unistd::{chown, geteuid, Gid, Uid};
use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{
    AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader as TokioBufReader,
};
use tokio::net::UnixListener as TokioUnixListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time as tokio_time;
use users::{get_group_by_name, get_user_by_name};

const MAX_EVENTS: usize = 2000;
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_REQUEST_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    Clean,
    Interrupted,
}

impl DaemonExit {
    pub fn code(&self) -> i32 {
        match self {
            DaemonExit::Clean => 0,
            // Conventional exit status for SIGINT-driven shutdown.
            DaemonExit::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    pub job: Option<String>,
    pub message: String,
}

pub(crate) fn gov_event(
    events: &Mutex<VecDeque<EventEntry>>,
    component: &str,
    job: Option<&str>,
    msg: impl AsRef<str>,
) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string();
    let line = match job {
        Some(j) => format!("{ts} [{component}] job={j} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    let mut q = events.lock().unwrap_or_else(|p| p.into_inner());
    q.push_back(EventEntry {
        ts,
        component: component.to_string(),
        job: job.map(|s| s.to_string()),
        message: msg.as_ref().to_string(),
    });
    while q.len() > MAX_EVENTS {
        q.pop_front();
    }
}

pub struct DaemonState {
    pub cfg: MasterConfig,
    runner: Mutex<JobRunner>,
    process_governor: Mutex<ProcessGovernor>,
    latest_metrics: Mutex<SystemMetrics>,
    history: MetricsHistory,
    policy_file: PolicyFile,
    events: Arc<Mutex<VecDeque<EventEntry>>>,
    shutting_down: Arc<AtomicBool>,
    /// Monotonic epoch for every now_ms the supervision core sees.
    started: Instant,
}

impl DaemonState {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn event(&self, component: &str, job: Option<&str>, msg: impl AsRef<str>) {
        gov_event(&self.events, component, job, msg);
    }
}

/// Claim the control socket path before binding. A path that still accepts
/// connections belongs to a live daemon and is left alone; anything else at
/// the path is debris from an unclean exit and gets swept.
fn claim_socket_path(sock: &Path) -> anyhow::Result<()> {
    match sock.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir)
                .with_context(|| format!("create socket directory {}", dir.display()))?;
        }
        _ => {}
    }

    match std::os::unix::net::UnixStream::connect(sock) {
        Ok(_) => anyhow::bail!(
            "control socket {} is in use by a running govmaster",
            sock.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            // Connection refused (or not a socket at all): no one owns it.
            fs::remove_file(sock)
                .with_context(|| format!("sweep stale socket {}", sock.display()))?;
            Ok(())
        }
    }
}

fn apply_socket_settings(cfg: &MasterConfig) -> anyhow::Result<()> {
    let mode = fs::Permissions::from_mode(cfg.sock_mode);
    fs::set_permissions(&cfg.sock, mode)
        .with_context(|| format!("chmod socket {}", cfg.sock.display()))?;

    // Ownership changes need privileges; skip silently otherwise.
    if !geteuid().is_root() {
        return Ok(());
    }
    let uid = match cfg.sock_owner.as_deref() {
        Some(name) => Some(Uid::from_raw(
            get_user_by_name(name)
                .ok_or_else(|| anyhow::anyhow!("unknown socket owner: {name}"))?
                .uid(),
        )),
        None => None,
    };
    let gid = match cfg.sock_group.as_deref() {
        Some(name) => Some(Gid::from_raw(
            get_group_by_name(name)
                .ok_or_else(|| anyhow::anyhow!("unknown socket group: {name}"))?
                .gid(),
        )),
        None => None,
    };
    chown(&cfg.sock, uid, gid).with_context(|| format!("chown socket {}", cfg.sock.display()))?;
    Ok(())
}

fn start_signal_listener(flag: Arc<AtomicBool>, last_signal: Arc<AtomicI32>) {
    tokio::spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => {
                last_signal.store(libc::SIGTERM, Ordering::Relaxed);
                flag.store(true, Ordering::Relaxed);
            }
            _ = int.recv() => {
                last_signal.store(libc::SIGINT, Ordering::Relaxed);
                flag.store(true, Ordering::Relaxed);
            }
        }
    });
}

fn start_metrics_sampler(state: Arc<DaemonState>) {
    tokio::spawn(async move {
        let mut sampler = MetricsSampler::new();
        let mut interval = tokio_time::interval(METRICS_SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            if state.shutting_down.load(Ordering::Relaxed) {
                break;
            }
            let sample = sampler.sample();
            *state
                .latest_metrics
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = sample;
            if let Err(e) = state.history.append(&sample) {
                state.event("metrics", None, format!("history append failed: {e:#}"));
            }
        }
    });
}

fn start_ticker(state: Arc<DaemonState>) {
    tokio::spawn(async move {
        let mut interval =
            tokio_time::interval(Duration::from_millis(state.cfg.tick_interval_ms));
        loop {
            interval.tick().await;
            if state.shutting_down.load(Ordering::Relaxed) {
                break;
            }
            let metrics = *state
                .latest_metrics
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let now = state.now_ms();
            let mut runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
            runner.tick(now, &metrics);
        }
    });
}

pub async fn run_daemon_async(cfg: MasterConfig) -> anyhow::Result<DaemonExit> {
    fs::create_dir_all(&cfg.state_directory).with_context(|| {
        format!("create state directory {}", cfg.state_directory.display())
    })?;

    let events: Arc<Mutex<VecDeque<EventEntry>>> = Arc::new(Mutex::new(VecDeque::new()));

    let policy_file = PolicyFile::new(cfg.policy_file_path());
    let governor_policy = policy_file.load();

    let cgroup = CgroupDriver::new(cfg.cgroup_root.clone(), &cfg.cgroup_name);
    gov_event(
        &events,
        "cgroup",
        None,
        format!(
            "cgroup2 available={} caps={:#05b} base={}",
            cgroup.is_available(),
            cgroup.capability().0,
            cgroup.base_path().display()
        ),
    );

    // Fatal when the epoll fd cannot be created; nothing is partially started.
    let mut process_governor = ProcessGovernor::new(cgroup).context("start process governor")?;
    {
        let events = Arc::clone(&events);
        process_governor.set_event_callback(Box::new(move |ev: &GovEvent| {
            let msg = if ev.errno != 0 {
                format!("{} pid={} errno={}", ev.event.as_str(), ev.pid, ev.errno)
            } else if ev.applied.0 != 0 {
                format!(
                    "{} pid={} applied={:#010b}",
                    ev.event.as_str(),
                    ev.pid,
                    ev.applied.0
                )
            } else {
                format!("{} pid={}", ev.event.as_str(), ev.pid)
            };
            gov_event(&events, "gov", None, msg);
        }));
    }
    process_governor.start();

    let runner = JobRunner::new(
        cfg.resource_policy(),
        governor_policy,
        Box::new(ShellSpawner::new()),
        Box::new(ProcfsInspector),
    );

    let sock = cfg.sock.clone();
    claim_socket_path(&sock)?;
    let listener = TokioUnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;
    apply_socket_settings(&cfg)?;

    let shutting_down = Arc::new(AtomicBool::new(false));
    let last_signal = Arc::new(AtomicI32::new(0));

    let state = Arc::new(DaemonState {
        history: MetricsHistory::new(
            cfg.state_directory.clone(),
            MetricsHistory::DEFAULT_MAX_FILE_SIZE,
            MetricsHistory::DEFAULT_MAX_FILES,
        ),
        cfg,
        runner: Mutex::new(runner),
        process_governor: Mutex::new(process_governor),
        latest_metrics: Mutex::new(SystemMetrics::default()),
        policy_file,
        events: Arc::clone(&events),
        shutting_down: Arc::clone(&shutting_down),
        started: Instant::now(),
    });

    state.event(
        "boot",
        None,
        format!(
            "build_time={} build_host={} version={}",
            build_info::build_time_raw(),
            build_info::build_host(),
            build_info::version()
        ),
    );

    start_signal_listener(Arc::clone(&shutting_down), Arc::clone(&last_signal));
    start_metrics_sampler(Arc::clone(&state));
    start_ticker(Arc::clone(&state));

    state.event("rpc", None, format!("listening sock={}", sock.display()));

    // Async accept loop.
    while !shutting_down.load(Ordering::Relaxed) {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let st = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection_async(st, stream).await {
                                eprintln!("rpc error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        eprintln!("accept error: {e}");
                        tokio_time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = tokio_time::sleep(Duration::from_millis(200)) => {
                // periodic wake so we can observe shutting_down without relying on accept.
            }
        }
    }

    state.event("shutdown", None, "signal received; draining jobs");
    graceful_shutdown(&state);
    let _ = fs::remove_file(&sock);

    if last_signal.load(Ordering::Relaxed) == libc::SIGINT {
        Ok(DaemonExit::Interrupted)
    } else {
        Ok(DaemonExit::Clean)
    }
}

fn graceful_shutdown(state: &Arc<DaemonState>) {
    let now = state.now_ms();
    {
        let mut runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
        // Best-effort: signal whatever is still running, then flush terminal
        // transitions and release pipe fds.
        let running: Vec<String> = runner
            .recent_jobs(usize::MAX)
            .iter()
            .filter(|j| j.status == crate::gov::job::JobStatus::Running)
            .map(|j| j.id.clone())
            .collect();
        for id in running {
            runner.cancel(&id, now);
        }
        runner.drain(now);
    }
    state
        .process_governor
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .stop();
    state.event("shutdown", None, "done");
}

async fn handle_connection_async(
    state: Arc<DaemonState>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut reader = TokioBufReader::new(stream).take(MAX_REQUEST_BYTES as u64);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }

    let response = dispatch(&state, line.trim());
    let mut stream = reader.into_inner().into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Route one request line to its handler and render the text response.
pub(crate) fn dispatch(state: &Arc<DaemonState>, request: &str) -> String {
    let (cmd, rest) = match request.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (request, ""),
    };

    match (cmd, rest) {
        ("ping", "") => "pong\n".to_string(),
        ("status", "") => do_status(state),
        ("metrics", "latest") => do_metrics_latest(state),
        ("metrics", tail) if tail.starts_with("tail") => {
            let n = tail
                .strip_prefix("tail")
                .and_then(|s| s.trim().parse::<usize>().ok());
            match n {
                Some(n) => do_metrics_tail(state, n),
                None => "error\nusage: metrics tail <n>\n".to_string(),
            }
        }
        ("governor/policy", "") => do_governor_policy(state),
        ("governor/policy_update", body) if !body.is_empty() => {
            do_policy_update(state, body)
        }
        ("governor/diagnostics", "") => do_diagnostics(state),
        ("gov/apply", payload) if !payload.is_empty() => do_gov_apply(state, payload),
        ("job", args) => do_job(state, args),
        ("events", n) => {
            let n = if n.is_empty() {
                Some(200)
            } else {
                n.parse::<usize>().ok()
            };
            match n {
                Some(n) => do_events(state, n),
                None => "error\nusage: events <n>\n".to_string(),
            }
        }
        ("server-version", "") => format!("{}\n", build_info::banner()),
        _ => "error\nunknown_command\n".to_string(),
    }
}

fn do_status(state: &Arc<DaemonState>) -> String {
    let metrics = *state
        .latest_metrics
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    let runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    let d = runner.diagnostics();
    let mut out = String::new();
    out.push_str(&format!("version: {}\n", build_info::version()));
    out.push_str(&format!("cpu: {}\n", crate::gov::appliers::host_cpu_count()));
    out.push_str(&format!("mem_total: {}\n", metrics.mem.total));
    out.push_str(&format!("mem_free: {}\n", metrics.mem.free));
    out.push_str(&format!("running_jobs: {}\n", runner.running_count()));
    out.push_str(&format!("queued_jobs: {}\n", runner.queued_count()));
    out.push_str(&format!("rejected_jobs: {}\n", runner.rejected_jobs()));
    out.push_str(&format!("blocked_reason: {}\n", d.block_reason.as_str()));
    out.push_str(&format!("retry_after_ms: {}\n", d.retry_after_ms));
    out.push_str(&format!("cpu_pct: {:.2}\n", metrics.cpu_usage_percent));
    out.push_str(&format!("mem_pct: {:.2}\n", metrics.mem_usage_percent()));
    out
}

fn do_metrics_latest(state: &Arc<DaemonState>) -> String {
    let m = *state
        .latest_metrics
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    format!(
        "ts: {}\ncpu_pct: {:.2}\nmem_total: {}\nmem_free: {}\nmem_available: {}\n",
        m.timestamp, m.cpu_usage_percent, m.mem.total, m.mem.free, m.mem.available
    )
}

fn do_metrics_tail(state: &Arc<DaemonState>, n: usize) -> String {
    let rows = state.history.tail(n);
    let mut out = String::new();
    for m in rows {
        out.push_str(&format!(
            "{},{:.2},{},{}\n",
            m.timestamp, m.cpu_usage_percent, m.mem.total, m.mem.free
        ));
    }
    if out.is_empty() {
        out.push_str("(no samples)\n");
    }
    out
}

fn format_policy(policy: &GovernorPolicy) -> String {
    format!(
        "max_running_jobs: {}\nmax_queue_depth: {}\ncpu_high_watermark_pct: {}\n\
         mem_high_watermark_pct: {}\ncooldown_ms: {}\nmin_start_gap_ms: {}\n",
        policy.max_running_jobs,
        policy.max_queue_depth,
        policy.cpu_high_watermark_pct,
        policy.mem_high_watermark_pct,
        policy.cooldown_ms,
        policy.min_start_gap_ms
    )
}

fn do_governor_policy(state: &Arc<DaemonState>) -> String {
    let runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    format_policy(runner.governor_policy())
}

fn do_policy_update(state: &Arc<DaemonState>, body: &str) -> String {
    // Unknown fields reject the whole update, same strictness as the
    // per-PID message parser.
    let parsed: PolicyUpdateBody = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            return format!("error\nvalidation_failed\nbody: {e}\n");
        }
    };

    let mut runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    let next = parsed.overlay(runner.governor_policy());
    let result = runner.update_governor_policy(next);
    if !result.success {
        let mut out = String::from("error\nvalidation_failed\n");
        for e in &result.errors {
            out.push_str(&format!("{}: {}\n", e.field, e.message));
        }
        return out;
    }
    drop(runner);

    if let Err(e) = state.policy_file.save(&result.effective_policy) {
        state.event("policy", None, format!("persist failed: {e:#}"));
    } else {
        state.event("policy", None, "governor policy updated and persisted");
    }

    format!("policy_updated\n{}", format_policy(&result.effective_policy))
}

fn do_diagnostics(state: &Arc<DaemonState>) -> String {
    let runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    let d = runner.diagnostics();
    format!(
        "now_ms: {}\ndecision: {}\nblock_reason: {}\nretry_after_ms: {}\n\
         running_count: {}\nqueued_count: {}\njobs_started_this_tick: {}\n\
         jobs_scanned_this_tick: {}\nscan_cursor_position: {}\n",
        d.now_ms,
        d.decision.as_str(),
        d.block_reason.as_str(),
        d.retry_after_ms,
        d.running_count,
        d.queued_count,
        d.jobs_started_this_tick,
        d.jobs_scanned_this_tick,
        d.scan_cursor_position
    )
}

fn do_gov_apply(state: &Arc<DaemonState>, payload: &str) -> String {
    let parsed = parse_gov_apply(payload);
    if !parsed.ok {
        return format!("{}\n{}\n", parsed.ack.as_str(), parsed.detail);
    }

    // Synchronous liveness pre-check so the submitter gets PROCESS_DEAD
    // instead of a queued message that can only fail.
    if fs::metadata(format!("/proc/{}", parsed.msg.pid)).is_err() {
        return format!("{}\n", AckCode::NackProcessDead.as_str());
    }

    let pid = parsed.msg.pid;
    let accepted = state
        .process_governor
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .enqueue(parsed.msg);
    if !accepted {
        return format!("{}\n", AckCode::NackQueueFull.as_str());
    }
    state.event("gov", None, format!("enqueued policy message pid={pid}"));
    format!("{}\n", AckCode::Ack.as_str())
}

fn do_job(state: &Arc<DaemonState>, args: &str) -> String {
    let (sub, rest) = match args.split_once(' ') {
        Some((s, r)) => (s, r.trim()),
        None => (args, ""),
    };
    match (sub, rest) {
        ("run", command) if !command.is_empty() => do_job_run(state, command),
        ("status", id) => do_job_status(state, id),
        ("tail", id) if !id.is_empty() => do_job_tail(state, id),
        ("cancel", id) if !id.is_empty() => do_job_cancel(state, id),
        _ => "error\nusage: job run <cmd> | job status [id] | job tail <id> | job cancel <id>\n"
            .to_string(),
    }
}

fn do_job_run(state: &Arc<DaemonState>, command: &str) -> String {
    let metrics = *state
        .latest_metrics
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    let now = state.now_ms();
    let mut runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    match runner.try_submit(
        command,
        state.cfg.job_limits(),
        now,
        metrics.cpu_usage_percent,
        metrics.mem_usage_percent(),
    ) {
        Ok(id) => {
            drop(runner);
            state.event("job", Some(&id), format!("submitted: {command}"));
            format!("id: {id}\nstatus: PENDING\n")
        }
        Err(verdict) => {
            drop(runner);
            state.event(
                "job",
                None,
                format!("submission rejected: {}", verdict.reason.as_str()),
            );
            format!(
                "error\nrejected\nreason: {}\nretry_after_ms: {}\n",
                verdict.reason.as_str(),
                verdict.retry_after_ms
            )
        }
    }
}

fn do_job_status(state: &Arc<DaemonState>, id: &str) -> String {
    let runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    if id.is_empty() {
        let jobs = runner.recent_jobs(10);
        if jobs.is_empty() {
            return "(no jobs)\n".to_string();
        }
        let mut out = String::new();
        for job in jobs {
            out.push_str(&format!(
                "{} {} exit_code={}\n",
                job.id,
                job.status.as_str(),
                job.exit_code
            ));
        }
        return out;
    }

    let Some(job) = runner.get_job(id) else {
        return "error\nno such job\n".to_string();
    };
    format!(
        "id: {}\nstatus: {}\nexit_code: {}\ncommand: {}\ncreated_at_ms: {}\n\
         started_at_ms: {}\nfinished_at_ms: {}\npgid: {}\nbytes_written: {}\nlog_truncated: {}\n",
        job.id,
        job.status.as_str(),
        job.exit_code,
        job.command,
        job.created_at_ms,
        job.started_at_ms,
        job.finished_at_ms,
        job.pgid,
        job.bytes_written,
        job.log_truncated
    )
}

/// Clip over-long physical lines for transport; the byte cap is the job's
/// `max_output_line_bytes`.
fn clip_lines(buf: &[u8], max_line: usize) -> String {
    let text = String::from_utf8_lossy(buf);
    let mut out = String::new();
    for line in text.lines() {
        if line.len() > max_line {
            let mut end = max_line;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            out.push_str(&line[..end]);
            out.push_str("...[clipped]");
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn do_job_tail(state: &Arc<DaemonState>, id: &str) -> String {
    let runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    let Some(job) = runner.get_job(id) else {
        return "error\nno such job\n".to_string();
    };
    let max_line = job.limits.max_output_line_bytes as usize;
    let mut out = format!(
        "id: {}\nstatus: {}\nexit_code: {}\n",
        job.id,
        job.status.as_str(),
        job.exit_code
    );
    if job.log_truncated {
        out.push_str("log_truncated: true\n");
    }
    out.push_str("output:\n");
    out.push_str(&clip_lines(&job.output, max_line));
    out.push_str("error:\n");
    out.push_str(&clip_lines(&job.error, max_line));
    out
}

fn do_job_cancel(state: &Arc<DaemonState>, id: &str) -> String {
    let now = state.now_ms();
    let mut runner = state.runner.lock().unwrap_or_else(|p| p.into_inner());
    let ok = runner.cancel(id, now);
    drop(runner);
    if ok {
        state.event("job", Some(id), "cancelled");
        format!("id: {id}\nstatus: CANCELLED\n")
    } else {
        "error\nnot cancellable (unknown id or already terminal)\n".to_string()
    }
}

fn do_events(state: &Arc<DaemonState>, n: usize) -> String {
    let q = state.events.lock().unwrap_or_else(|p| p.into_inner());
    let start = q.len().saturating_sub(n);
    let mut out = String::new();
    for e in q.iter().skip(start) {
        match &e.job {
            Some(j) => out.push_str(&format!("{} [{}] job={} {}\n", e.ts, e.component, j, e.message)),
            None => out.push_str(&format!("{} [{}] {}\n", e.ts, e.component, e.message)),
        }
    }
    if out.is_empty() {
        out.push_str("(no events)\n");
    }
    out
}
