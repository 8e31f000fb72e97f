//! Keeps the supervisor container and critical host services away from the oom killer.
//!
//! Startup protects the supervisor container exactly once; failing to do so is fatal.
//! Afterwards the host services are re-protected every [`ENFORCEMENT_INTERVAL`],
//! since a restarted service comes back with the kernel default score.

use crate::container::{ContainerResolver, ContainerTarget, ResolveError};
use crate::oom_score::{OomScoreAdjuster, OomScoreError};
use crate::proc::ProcessTable;
use lazy_static::lazy_static;
use log::{info, warn};
use nix::unistd::Pid;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

lazy_static! {
    static ref PASSES: IntCounter = register_int_counter!(
        "hostguard_enforcement_passes",
        "How many times the host services have been protected"
    )
    .unwrap();
    static ref ADJUSTMENTS: IntCounterVec = register_int_counter_vec!(
        "hostguard_oom_adjustments",
        "Outcome of oom score adjustments per target",
        &["target", "result"],
    )
    .unwrap();
}

/// Name of our own container
pub const SUPERVISOR_CONTAINER: &str = "resin_supervisor";
/// Score of the supervisor container. Not -1000 so the kernel can still kill us as a last resort.
pub const SUPERVISOR_OOM_SCORE: i32 = -800;
/// Host services that must survive memory pressure, if they are running at all
pub const PROTECTED_SERVICES: [&str; 2] = ["openvpn", "connmand"];
/// Score of the protected host services
pub const SERVICE_OOM_SCORE: i32 = -1000;
/// How often the host services are re-protected
pub const ENFORCEMENT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// What to adjust
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A container, resolved to its main process through its runtime
    Container(ContainerTarget),
    /// Every host process with this command name
    Process(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Container(container) => write!(f, "container {}", container.name),
            Target::Process(name) => write!(f, "process {name}"),
        }
    }
}

/// A single desired oom score adjustment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentRequest {
    /// Process or container to adjust
    pub target: Target,
    /// Desired `oom_score_adj`
    pub score: i32,
    /// Failing this request fails the whole pass
    pub must_succeed: bool,
}

impl AdjustmentRequest {
    /// The mandatory self protection of the supervisor container
    pub fn supervisor(container: &ContainerTarget) -> Self {
        Self {
            target: Target::Container(container.clone()),
            score: SUPERVISOR_OOM_SCORE,
            must_succeed: true,
        }
    }

    /// Best-effort protection of a host service
    pub fn service(name: &str) -> Self {
        Self {
            target: Target::Process(name.to_string()),
            score: SERVICE_OOM_SCORE,
            must_succeed: false,
        }
    }
}

/// Errors while enforcing oom scores
#[derive(Debug, thiserror::Error)]
pub enum EnforceError {
    /// Container could not be resolved to a host pid
    #[error("failed to resolve container: {0}")]
    Resolve(#[from] ResolveError),
    /// Score could not be written
    #[error("failed to adjust oom score: {0}")]
    Adjust(#[from] OomScoreError),
    /// The process table root could not be read
    #[error("cannot scan process table at {}: {source}", .path.display())]
    ProcessTable {
        /// Root of the process table
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// A mandatory process target had no running process
    #[error("no running {0}")]
    NotRunning(String),
    /// The blocking part of a pass panicked or was cancelled
    #[error("enforcement pass aborted: {0}")]
    Aborted(#[from] JoinError),
}

/// Read-only state shared by the startup and every periodic pass
#[derive(Debug)]
pub struct EnforcementSession {
    /// Host process table
    pub process_table: ProcessTable,
    /// Writer for the same process table
    pub adjuster: OomScoreAdjuster,
    /// Our own container and the runtime managing it
    pub supervisor: ContainerTarget,
}

impl EnforcementSession {
    /// Returns a session for the process table mounted at `host_proc`
    pub fn new(host_proc: &Path, supervisor: ContainerTarget) -> Self {
        Self {
            process_table: ProcessTable::new(host_proc),
            adjuster: OomScoreAdjuster::new(host_proc),
            supervisor,
        }
    }

    /// Requests of the startup pass: the supervisor first, then the services
    pub fn bootstrap_requests(&self) -> Vec<AdjustmentRequest> {
        let mut requests = vec![AdjustmentRequest::supervisor(&self.supervisor)];
        requests.extend(service_requests());
        requests
    }
}

/// Requests of every periodic pass
pub fn service_requests() -> Vec<AdjustmentRequest> {
    PROTECTED_SERVICES
        .iter()
        .map(|s| AdjustmentRequest::service(s))
        .collect()
}

/// Outcome of one target in a pass
#[derive(Debug, Default)]
pub struct TargetOutcome {
    /// Container or process name
    pub name: String,
    /// Processes that got their score written
    pub adjusted: Vec<Pid>,
    /// Failures, one per process or one for the whole target
    pub errors: Vec<EnforceError>,
}

impl TargetOutcome {
    fn new(name: &str) -> Self {
        TargetOutcome {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// No process of this name was running
    pub fn is_missing(&self) -> bool {
        self.adjusted.is_empty() && self.errors.is_empty()
    }

    fn record_failure(&mut self, err: EnforceError) {
        warn!("Cannot protect {}: {}", self.name, err);
        ADJUSTMENTS.with_label_values(&[self.name.as_str(), "failed"]).inc();
        self.errors.push(err);
    }

    fn record_adjusted(&mut self, pid: Pid, score: i32) {
        info!("Set oom_score_adj of {} ({}) to {}", self.name, pid, score);
        ADJUSTMENTS.with_label_values(&[self.name.as_str(), "ok"]).inc();
        self.adjusted.push(pid);
    }
}

/// Outcome of one pass
#[derive(Debug, Default)]
pub struct PassReport {
    /// One entry per requested target, in request order
    pub targets: Vec<TargetOutcome>,
}

impl PassReport {
    /// Outcome of the target `name`
    pub fn target(&self, name: &str) -> Option<&TargetOutcome> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Number of processes adjusted in this pass
    pub fn adjusted(&self) -> usize {
        self.targets.iter().map(|t| t.adjusted.len()).sum()
    }
}

// When adding states also update the transitions logged below
#[derive(PartialEq, Debug, Clone, Copy)]
enum StateType {
    Bootstrapping,
    SteadyState,
    Stopped,
}

fn log_transition(from: StateType, to: StateType) {
    info!("state changed: {:?} -> {:?}", from, to)
}

// blocking, run it on the blocking pool
fn protect_processes(session: &EnforcementSession, name: &str, score: i32) -> TargetOutcome {
    let mut outcome = TargetOutcome::new(name);
    let procs = match session.process_table.find_by_name(name) {
        Ok(procs) => procs,
        Err(source) => {
            outcome.record_failure(EnforceError::ProcessTable {
                path: session.process_table.root().to_owned(),
                source,
            });
            return outcome;
        }
    };
    // pids come from the scan above only, never from a previous pass
    for p in procs {
        match session.adjuster.apply(p.pid, score) {
            Ok(()) => outcome.record_adjusted(p.pid, score),
            Err(e) => outcome.record_failure(e.into()),
        }
    }
    if outcome.is_missing() {
        warn!("No {} process found, skip oom protection", name);
        ADJUSTMENTS.with_label_values(&[name, "missing"]).inc();
    }
    outcome
}

async fn protect_container<R: ContainerResolver>(
    session: &Arc<EnforcementSession>,
    resolver: &R,
    container: &ContainerTarget,
    score: i32,
) -> Result<TargetOutcome, JoinError> {
    let mut outcome = TargetOutcome::new(&container.name);
    let process = match resolver.resolve(container).await {
        Ok(process) => process,
        Err(e) => {
            outcome.record_failure(e.into());
            return Ok(outcome);
        }
    };
    let writer = Arc::clone(session);
    match task::spawn_blocking(move || writer.adjuster.apply(process.pid, score)).await? {
        Ok(()) => outcome.record_adjusted(process.pid, score),
        Err(e) => outcome.record_failure(e.into()),
    }
    Ok(outcome)
}

/// Applies `requests` in order.
///
/// Failures of optional requests end up in the report and never stop the remaining ones.
/// The first failing mandatory request ends the pass with its error.
pub async fn run_pass<R: ContainerResolver>(
    session: &Arc<EnforcementSession>,
    resolver: &R,
    requests: &[AdjustmentRequest],
) -> Result<PassReport, EnforceError> {
    let mut report = PassReport::default();
    for req in requests {
        let mut outcome = match &req.target {
            Target::Container(container) => {
                protect_container(session, resolver, container, req.score).await?
            }
            Target::Process(name) => {
                let (session, name, score) = (Arc::clone(session), name.clone(), req.score);
                task::spawn_blocking(move || protect_processes(&session, &name, score)).await?
            }
        };
        if req.must_succeed {
            if !outcome.errors.is_empty() {
                return Err(outcome.errors.swap_remove(0));
            }
            if outcome.is_missing() {
                return Err(EnforceError::NotRunning(req.target.to_string()));
            }
        }
        report.targets.push(outcome);
    }
    PASSES.inc();
    Ok(report)
}

// resolves once `true` was sent or the sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Enforcer in its bootstrapping state
#[derive(Debug)]
pub struct Enforcer<R> {
    session: Arc<EnforcementSession>,
    resolver: R,
    interval: Duration,
}

impl<R: ContainerResolver> Enforcer<R> {
    /// Returns a new enforcer for the given session
    pub fn new(session: EnforcementSession, resolver: R) -> Self {
        Self {
            session: Arc::new(session),
            resolver,
            interval: ENFORCEMENT_INTERVAL,
        }
    }

    /// Protects the supervisor container, then the host services once.
    ///
    /// Only the supervisor is mandatory, errors from the services are logged.
    pub async fn bootstrap(self) -> Result<PeriodicEnforcer<R>, EnforceError> {
        info!(
            "Changing oom_score_adj of {} to {}",
            self.session.supervisor.name, SUPERVISOR_OOM_SCORE
        );
        let requests = self.session.bootstrap_requests();
        let report = run_pass(&self.session, &self.resolver, &requests).await?;
        info!(
            "Changing oom_score_adj of {} to {} every {}s, {} processes adjusted so far",
            PROTECTED_SERVICES.join(" and "),
            SERVICE_OOM_SCORE,
            self.interval.as_secs(),
            report.adjusted()
        );

        Ok(PeriodicEnforcer {
            session: self.session,
            resolver: self.resolver,
            interval: self.interval,
            passes: Arc::new(AtomicU64::new(1)),
        })
    }
}

/// Enforcer after a successful bootstrap, ready to re-protect the services periodically
#[derive(Debug)]
pub struct PeriodicEnforcer<R> {
    session: Arc<EnforcementSession>,
    resolver: R,
    interval: Duration,
    passes: Arc<AtomicU64>,
}

impl<R: ContainerResolver + Send + Sync + 'static> PeriodicEnforcer<R> {
    /// Starts the periodic task. It stops once `true` is sent on `shutdown` or the sender is dropped.
    ///
    /// A pass still running at that point is abandoned.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> EnforcementTask {
        log_transition(StateType::Bootstrapping, StateType::SteadyState);
        let passes = Arc::clone(&self.passes);
        // first tick one period after bootstrap, which already ran a pass
        let start = Instant::now() + self.interval;
        let handle = tokio::spawn(self.run(start, shutdown));
        EnforcementTask { handle, passes }
    }

    async fn run(self, start: Instant, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(start, self.interval);
        // a stalled pass must not be followed by a burst of catch-up passes
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let requests = service_requests();

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            // passes are serialized: the next tick is only awaited after this one finished
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => {
                    // the blocking write keeps going on its own, nobody waits for it
                    warn!("Abandoning the running oom protection pass");
                    break;
                }
                res = run_pass(&self.session, &self.resolver, &requests) => match res {
                    Ok(report) => {
                        self.passes.fetch_add(1, Ordering::AcqRel);
                        info!(
                            "Periodic oom protection done, {} processes adjusted",
                            report.adjusted()
                        );
                    }
                    Err(e) => warn!("Periodic oom protection failed: {}", e),
                }
            }
        }
        log_transition(StateType::SteadyState, StateType::Stopped);
    }
}

/// Handle on the running periodic task
#[derive(Debug)]
pub struct EnforcementTask {
    handle: JoinHandle<()>,
    passes: Arc<AtomicU64>,
}

impl EnforcementTask {
    /// Number of completed service passes, including the one from bootstrap
    pub fn completed_passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Waits for the task to stop
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }
}
