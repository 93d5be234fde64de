use crate::cfk::asyncutil::tasks;
use crate::cfk::controller::{self, Ctrl};
use crate::cfk::logger::{LogSink, Stream};
use crate::cfk::proxy::ProxyStartPayload;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub const DEFAULT_STARTWAIT: Duration = Duration::from_millis(1000);
pub const DEFAULT_STOPWAIT: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_RETRIES: u32 = 8;
const BASE_BACKOFF_DELAY: Duration = Duration::from_millis(300);
const RESTART_POLL_MAX_TRIES: u32 = 150;

/// How to run a service: a shell string (via `/bin/sh -c`) or an argv vector
/// executed directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CmdSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CmdSpec {
    pub fn render(&self) -> String {
        match self {
            CmdSpec::Shell(s) => s.clone(),
            CmdSpec::Argv(v) => v.join(" "),
        }
    }

    pub fn exec_argv(&self) -> anyhow::Result<Vec<String>> {
        match self {
            CmdSpec::Shell(s) => {
                anyhow::ensure!(!s.trim().is_empty(), "cmd is empty");
                Ok(vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()])
            }
            CmdSpec::Argv(v) => {
                anyhow::ensure!(!v.is_empty(), "cmd is empty");
                Ok(v.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Backoff,
    Fatal,
    Fail,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Backoff => "backoff",
            State::Fatal => "fatal",
            State::Fail => "fail",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, State::Starting | State::Running | State::Stopping)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured attributes of a service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub cmd: Option<CmdSpec>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub priority: Option<i32>,
    pub desc: Option<String>,
    pub tags: BTreeSet<String>,
    pub tie_stdin_to: Option<String>,
    pub ignore_stdout: bool,
    pub ignore_stderr: bool,
    pub startwait: Duration,
    pub stopwait: Duration,
    pub respawn_on_fail: bool,
    pub respawn_on_stop: bool,
    pub respawn_max_retries: u32,
    pub no_new_session: bool,
    pub proxy: Option<String>,
}

impl ServiceSpec {
    pub fn new(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            cmd: None,
            env: BTreeMap::new(),
            cwd: None,
            user: None,
            group: None,
            priority: None,
            desc: None,
            tags: BTreeSet::new(),
            tie_stdin_to: None,
            ignore_stdout: false,
            ignore_stderr: false,
            startwait: DEFAULT_STARTWAIT,
            stopwait: DEFAULT_STOPWAIT,
            respawn_on_fail: true,
            respawn_on_stop: false,
            respawn_max_retries: DEFAULT_MAX_RETRIES,
            no_new_session: false,
            proxy: None,
        }
    }

    /// Typed setter table for `service <name> <attr>=<value>`. An empty value
    /// resets the attribute to its default.
    pub fn set_attr(&mut self, attr: &str, value: &str) -> anyhow::Result<()> {
        use crate::cfk::command::{parse_bool, parse_cmd_value};
        match attr {
            "cmd" => {
                self.cmd = if value.is_empty() {
                    None
                } else {
                    Some(parse_cmd_value(value)?)
                };
            }
            "env" => {
                if value.is_empty() {
                    self.env.clear();
                } else {
                    let (k, v) = value
                        .split_once('=')
                        .ok_or_else(|| anyhow::anyhow!("env expects NAME=VALUE, got: {value}"))?;
                    anyhow::ensure!(!k.is_empty(), "env variable name is empty");
                    self.env.insert(k.to_string(), v.to_string());
                }
            }
            "cwd" => {
                self.cwd = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "user" => self.user = non_empty(value),
            "group" => self.group = non_empty(value),
            "priority" => {
                self.priority = if value.is_empty() {
                    None
                } else {
                    Some(
                        value
                            .parse::<i32>()
                            .map_err(|_| anyhow::anyhow!("invalid priority: {value}"))?,
                    )
                };
            }
            "desc" => {
                anyhow::ensure!(
                    !value.contains('\n'),
                    "desc must be a single line"
                );
                self.desc = non_empty(value);
            }
            "tags" => {
                self.tags = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "tie_stdin_to" => self.tie_stdin_to = non_empty(value),
            "ignore_stdout" => self.ignore_stdout = !value.is_empty() && parse_bool(value)?,
            "ignore_stderr" => self.ignore_stderr = !value.is_empty() && parse_bool(value)?,
            "startwait_secs" => self.startwait = parse_secs(value, DEFAULT_STARTWAIT)?,
            "stopwait_secs" => self.stopwait = parse_secs(value, DEFAULT_STOPWAIT)?,
            "respawn_on_fail" => {
                self.respawn_on_fail = value.is_empty() || parse_bool(value)?;
            }
            "respawn_on_stop" => {
                self.respawn_on_stop = !value.is_empty() && parse_bool(value)?;
            }
            "respawn_max_retries" => {
                self.respawn_max_retries = if value.is_empty() {
                    DEFAULT_MAX_RETRIES
                } else {
                    value
                        .parse::<u32>()
                        .map_err(|_| anyhow::anyhow!("invalid respawn_max_retries: {value}"))?
                };
            }
            "no_new_session" => {
                self.no_new_session = !value.is_empty() && parse_bool(value)?;
            }
            other => anyhow::bail!("invalid property: {other}"),
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_secs(value: &str, default: Duration) -> anyhow::Result<Duration> {
    if value.is_empty() {
        return Ok(default);
    }
    let secs: f64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {value}"))?;
    anyhow::ensure!(secs > 0.0, "duration must be positive: {value}");
    Ok(Duration::from_secs_f64(secs))
}

/// Point-in-time snapshot published by the actor after every transition.
/// Everything `status`/`desc`/`pids` report comes from here, so queries never
/// wait on the actor.
#[derive(Debug, Clone)]
pub struct ServiceView {
    pub name: String,
    pub state: State,
    pub pid: Option<i32>,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub fail_reason: Option<String>,
    pub backoff_retry: u32,
    pub running_cmd: Option<String>,
    pub cmd_text: Option<String>,
    pub desc: Option<String>,
    pub tags: BTreeSet<String>,
    pub proxy: Option<String>,
}

impl ServiceView {
    pub fn is_up(&self) -> bool {
        self.state.is_up()
    }
}

pub enum ServiceCmd {
    Start {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Stop {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Restart {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Set {
        attr: String,
        value: String,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    SetProxy {
        proxy: Option<String>,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    /// External notice that the child is gone without a wait status (e.g. its
    /// proxy went away).
    HasStopped {
        reason: String,
    },
    ChildExited {
        epoch: u64,
        status: Option<std::process::ExitStatus>,
    },
    ProxyStarted {
        pid: i32,
    },
    ProxyStopped {
        wait_status: i32,
    },
    Destroy {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to a service actor. Cloning shares the command channel and the
/// published view.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceCmd>,
    view: Arc<Mutex<ServiceView>>,
}

impl ServiceHandle {
    pub fn view(&self) -> ServiceView {
        self.view.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn name(&self) -> String {
        self.view().name
    }

    pub fn is_up(&self) -> bool {
        self.view().is_up()
    }

    async fn call<F>(&self, make: F) -> anyhow::Result<()>
    where
        F: FnOnce(oneshot::Sender<anyhow::Result<()>>) -> ServiceCmd,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| anyhow::anyhow!("service is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("service is gone"))?
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.call(|resp| ServiceCmd::Start { resp }).await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.call(|resp| ServiceCmd::Stop { resp }).await
    }

    pub async fn restart(&self) -> anyhow::Result<()> {
        self.call(|resp| ServiceCmd::Restart { resp }).await
    }

    pub async fn set_attr(&self, attr: &str, value: &str) -> anyhow::Result<()> {
        let attr = attr.to_string();
        let value = value.to_string();
        self.call(move |resp| ServiceCmd::Set { attr, value, resp })
            .await
    }

    pub async fn set_proxy(&self, proxy: Option<String>) -> anyhow::Result<()> {
        self.call(move |resp| ServiceCmd::SetProxy { proxy, resp })
            .await
    }

    pub async fn destroy(&self) -> anyhow::Result<()> {
        self.call(|resp| ServiceCmd::Destroy { resp }).await
    }

    /// Bring the service down (if needed) and end its actor. Resolves once the
    /// actor has exited.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ServiceCmd::Shutdown { resp: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn notify_has_stopped(&self, reason: &str) {
        let _ = self.tx.send(ServiceCmd::HasStopped {
            reason: reason.to_string(),
        });
    }

    pub fn notify_proxy_started(&self, pid: i32) {
        let _ = self.tx.send(ServiceCmd::ProxyStarted { pid });
    }

    pub fn notify_proxy_stopped(&self, wait_status: i32) {
        let _ = self.tx.send(ServiceCmd::ProxyStopped { wait_status });
    }
}

/// Create the actor task for a new service and return its handle.
pub fn spawn_service(name: &str, ctrl: Ctrl, sink: LogSink) -> ServiceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let view = Arc::new(Mutex::new(ServiceView {
        name: name.to_string(),
        state: State::Stopped,
        pid: None,
        start_time: None,
        stop_time: None,
        fail_reason: None,
        backoff_retry: 0,
        running_cmd: None,
        cmd_text: None,
        desc: None,
        tags: BTreeSet::new(),
        proxy: None,
    }));
    let handle = ServiceHandle {
        tx: tx.clone(),
        view: Arc::clone(&view),
    };
    let actor = ServiceActor {
        spec: ServiceSpec::new(name),
        ctrl,
        sink,
        tx_self: tx,
        view,
        state: State::Stopped,
        pid: None,
        start_time: None,
        stop_time: None,
        exit_status: None,
        fail_reason: None,
        backoff_retry: 0,
        wants_down: false,
        normal_exit: false,
        running_cmd: None,
        epoch: 0,
        startwait_at: None,
        stopwait_at: None,
        backoff_at: None,
        restart_poll_at: None,
        restart_tries: 0,
        restart_resp: None,
        on_stop: Vec::new(),
        shutdown_resp: None,
        stop_loop: false,
    };
    tasks().spawn(actor.run(rx));
    handle
}

struct ServiceActor {
    spec: ServiceSpec,
    ctrl: Ctrl,
    sink: LogSink,
    tx_self: mpsc::UnboundedSender<ServiceCmd>,
    view: Arc<Mutex<ServiceView>>,

    state: State,
    pid: Option<i32>,
    start_time: Option<i64>,
    stop_time: Option<i64>,
    exit_status: Option<i32>,
    fail_reason: Option<String>,
    backoff_retry: u32,
    wants_down: bool,
    normal_exit: bool,
    // The command of the current run (attributes may change while up).
    running_cmd: Option<String>,

    // Each spawn bumps the epoch; exit events from an older spawn are stale.
    epoch: u64,

    startwait_at: Option<Instant>,
    stopwait_at: Option<Instant>,
    backoff_at: Option<Instant>,
    restart_poll_at: Option<Instant>,
    restart_tries: u32,
    restart_resp: Option<oneshot::Sender<anyhow::Result<()>>>,

    on_stop: Vec<oneshot::Sender<anyhow::Result<()>>>,
    shutdown_resp: Option<oneshot::Sender<()>>,
    stop_loop: bool,
}

enum Wake {
    Cmd(ServiceCmd),
    Timer,
    Closed,
}

impl ServiceActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ServiceCmd>) {
        self.publish();
        loop {
            let wake = match self.next_deadline() {
                Some(at) => {
                    tokio::select! {
                        c = rx.recv() => match c {
                            Some(c) => Wake::Cmd(c),
                            None => Wake::Closed,
                        },
                        _ = tokio::time::sleep_until(at) => Wake::Timer,
                    }
                }
                None => match rx.recv().await {
                    Some(c) => Wake::Cmd(c),
                    None => Wake::Closed,
                },
            };

            match wake {
                Wake::Cmd(cmd) => self.handle_cmd(cmd).await,
                Wake::Timer => self.handle_timers().await,
                Wake::Closed => break,
            }

            self.publish();
            if self.stop_loop {
                break;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.startwait_at,
            self.stopwait_at,
            self.backoff_at,
            self.restart_poll_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn is_up(&self) -> bool {
        self.state.is_up()
    }

    fn now_epoch_secs() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn publish(&self) {
        let mut v = self.view.lock().unwrap_or_else(|p| p.into_inner());
        v.state = self.state;
        v.pid = self.pid;
        v.start_time = self.start_time;
        v.stop_time = self.stop_time;
        v.fail_reason = self.fail_reason.clone();
        v.backoff_retry = self.backoff_retry;
        v.cmd_text = self.spec.cmd.as_ref().map(|c| c.render());
        v.running_cmd = if self.is_up() {
            self.running_cmd.clone()
        } else {
            None
        };
        v.desc = self.spec.desc.clone();
        v.tags = self.spec.tags.clone();
        v.proxy = self.spec.proxy.clone();
    }

    fn event(&self, msg: impl AsRef<str>) {
        self.sink.event("service", Some(&self.spec.name), msg);
    }

    async fn handle_cmd(&mut self, cmd: ServiceCmd) {
        match cmd {
            ServiceCmd::Start { resp } => {
                let r = self.do_start(false).await;
                let _ = resp.send(r);
            }
            ServiceCmd::Stop { resp } => {
                if !self.is_up() && self.state != State::Backoff {
                    let _ = resp.send(Err(anyhow::anyhow!(
                        "service {} is already down",
                        self.spec.name
                    )));
                } else {
                    self.do_stop(Some(resp));
                }
            }
            ServiceCmd::Restart { resp } => {
                if self.state != State::Running {
                    let _ = resp.send(Err(anyhow::anyhow!(
                        "service {} is not running",
                        self.spec.name
                    )));
                } else {
                    self.event("restart=begin");
                    self.restart_resp = Some(resp);
                    self.restart_tries = 0;
                    self.do_stop(None);
                    self.restart_poll_at = Some(Instant::now() + self.restart_poll_period());
                }
            }
            ServiceCmd::Set { attr, value, resp } => {
                let _ = resp.send(self.spec.set_attr(&attr, &value));
            }
            ServiceCmd::SetProxy { proxy, resp } => {
                if self.is_up() {
                    let _ = resp.send(Err(anyhow::anyhow!(
                        "service {} is up; cannot change its proxy",
                        self.spec.name
                    )));
                } else {
                    self.spec.proxy = proxy;
                    let _ = resp.send(Ok(()));
                }
            }
            ServiceCmd::HasStopped { reason } => {
                if self.is_up() {
                    self.event(format!("external_stop reason={reason:?}"));
                    self.clear_run_timers();
                    self.epoch = self.epoch.wrapping_add(1);
                    self.pid = None;
                    self.to_fail(reason).await;
                }
            }
            ServiceCmd::ChildExited { epoch, status } => {
                if epoch == self.epoch {
                    self.handle_exit(status).await;
                }
            }
            ServiceCmd::ProxyStarted { pid } => {
                // The startwait check ignores itself once a pid is assigned,
                // so whichever of (status message, timer) lands first wins.
                if self.state == State::Starting && self.pid.is_none() {
                    self.pid = Some(pid);
                    self.startwait_at = Some(Instant::now() + self.spec.startwait);
                    self.event(format!("proxy_started pid={pid}"));
                }
            }
            ServiceCmd::ProxyStopped { wait_status } => {
                if self.is_up() {
                    let status = std::process::ExitStatus::from_raw(wait_status);
                    self.handle_exit(Some(status)).await;
                }
            }
            ServiceCmd::Destroy { resp } => {
                if self.is_up() || self.state == State::Backoff {
                    let _ = resp.send(Err(anyhow::anyhow!(
                        "service {} is not down; stop it first",
                        self.spec.name
                    )));
                } else {
                    let _ = resp.send(Ok(()));
                    self.stop_loop = true;
                }
            }
            ServiceCmd::Shutdown { resp } => {
                if self.is_up() || self.state == State::Backoff {
                    self.shutdown_resp = Some(resp);
                    self.do_stop(None);
                } else {
                    let _ = resp.send(());
                    self.stop_loop = true;
                }
            }
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if take_expired(&mut self.startwait_at, now) {
            self.on_startwait().await;
        }
        if take_expired(&mut self.stopwait_at, now) {
            self.on_stopwait();
        }
        if take_expired(&mut self.backoff_at, now) {
            if self.state == State::Backoff {
                self.event(format!(
                    "backoff_retry attempt={} max={}",
                    self.backoff_retry + 1,
                    self.spec.respawn_max_retries
                ));
                if let Err(e) = self.do_start(true).await {
                    self.event(format!("backoff_start_error err={e:#}"));
                }
            }
        }
        if take_expired(&mut self.restart_poll_at, now) {
            self.on_restart_poll().await;
        }
    }

    async fn on_startwait(&mut self) {
        if self.state != State::Starting {
            return;
        }
        if self.pid.is_some() {
            self.state = State::Running;
            self.backoff_retry = 0;
            self.event("state=running");
        } else if self.spec.proxy.is_some() {
            // Keep waiting for the proxy's status message.
            self.event("startwait elapsed without a pid; increase startwait_secs");
        } else {
            self.fail_reason = Some("internal error: no pid after spawn".to_string());
            self.state = State::Fail;
            self.event("state=fail reason=no_pid_after_spawn");
        }
    }

    fn on_stopwait(&mut self) {
        if self.state != State::Stopping {
            return;
        }
        match self.pid {
            Some(pid) => {
                self.event(format!("stopwait elapsed; sending SIGKILL pid={pid}"));
                self.deliver_signal(pid, nix::sys::signal::Signal::SIGKILL);
                // The stop command is considered complete; the exit that
                // follows is classified like any other.
                self.resolve_on_stop();
            }
            None => {
                // Proxied stop where the child never materialized.
                self.state = State::Stopped;
                self.stop_time = Some(Self::now_epoch_secs());
                self.resolve_on_stop();
                self.check_shutdown();
            }
        }
    }

    async fn on_restart_poll(&mut self) {
        if self.is_up() {
            self.restart_tries += 1;
            if self.restart_tries >= RESTART_POLL_MAX_TRIES {
                if let Some(resp) = self.restart_resp.take() {
                    let _ = resp.send(Err(anyhow::anyhow!(
                        "service {} never went down for restart",
                        self.spec.name
                    )));
                }
            } else {
                self.restart_poll_at = Some(Instant::now() + self.restart_poll_period());
            }
            return;
        }
        let r = self.do_start(false).await;
        if let Some(resp) = self.restart_resp.take() {
            let _ = resp.send(r);
        }
    }

    fn restart_poll_period(&self) -> Duration {
        // One tenth of the stop grace period, so the restart start happens
        // promptly after the service reaches down.
        self.spec.stopwait / 10
    }

    fn clear_run_timers(&mut self) {
        self.startwait_at = None;
        self.stopwait_at = None;
    }

    fn resolve_on_stop(&mut self) {
        for tx in self.on_stop.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    async fn do_start(&mut self, from_backoff: bool) -> anyhow::Result<()> {
        if self.is_up() {
            anyhow::bail!("service {} is already up", self.spec.name);
        }
        let cmd = self
            .spec
            .cmd
            .clone()
            .ok_or_else(|| anyhow::anyhow!("service {} has no cmd", self.spec.name))?;

        if !from_backoff {
            self.backoff_retry = 0;
        }
        self.wants_down = false;
        self.normal_exit = false;
        self.fail_reason = None;
        self.exit_status = None;
        self.backoff_at = None;
        self.state = State::Starting;
        self.start_time = Some(Self::now_epoch_secs());
        self.stop_time = None;
        self.running_cmd = Some(cmd.render());
        self.publish();

        let r = if self.spec.proxy.is_some() {
            self.start_via_proxy(cmd).await
        } else {
            self.spawn_child(cmd)
        };
        match r {
            Ok(()) => {
                self.startwait_at = Some(Instant::now() + self.spec.startwait);
                self.event(format!(
                    "state=starting pid={}",
                    self.pid.map(|p| p.to_string()).unwrap_or_default()
                ));
                Ok(())
            }
            Err(e) => {
                self.state = State::Fail;
                self.fail_reason = Some(format!("{e:#}"));
                self.stop_time = Some(Self::now_epoch_secs());
                self.event(format!("state=fail reason=spawn err={e:#}"));
                Err(e)
            }
        }
    }

    async fn start_via_proxy(&mut self, cmd: CmdSpec) -> anyhow::Result<()> {
        let proxy_name = self.spec.proxy.clone().unwrap_or_default();
        let proxy = controller::proxy_handle(&self.ctrl, &proxy_name)
            .ok_or_else(|| anyhow::anyhow!("unknown proxy: {proxy_name}"))?;
        let payload = ProxyStartPayload {
            name: self.spec.name.clone(),
            cmd,
            env: self.child_env(),
            cwd: self.spec.cwd.clone(),
            ignore_stdout: self.spec.ignore_stdout,
            ignore_stderr: self.spec.ignore_stderr,
            tie_stdin_to: self.spec.tie_stdin_to.clone(),
            no_new_session: self.spec.no_new_session,
        };
        // The pid stays empty until the proxy reports `started`.
        proxy.start_service(payload).await
    }

    fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = self.spec.env.clone();
        env.insert("CONTROL_FREAK_ENABLED".to_string(), "1".to_string());
        env.insert(
            "CONTROL_FREAK_SERVICE".to_string(),
            self.spec.name.clone(),
        );
        let home = controller::home(&self.ctrl);
        env.insert(
            "CONTROL_FREAK_HOME".to_string(),
            home.display().to_string(),
        );
        env
    }

    fn spawn_child(&mut self, cmd: CmdSpec) -> anyhow::Result<()> {
        let argv = cmd.exec_argv()?;
        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.kill_on_drop(false);

        if let Some(cwd) = self.spec.cwd.as_ref() {
            anyhow::ensure!(
                cwd.is_dir(),
                "cwd {} does not exist (refuse to start {})",
                cwd.display(),
                self.spec.name
            );
            command.current_dir(cwd);
        }

        for (k, v) in self.child_env() {
            command.env(k, v);
        }

        // stdin: /dev/null unless tied to a registered bound socket.
        match self.spec.tie_stdin_to.as_deref() {
            Some(sock) => {
                let fd = controller::socket_dup_for_child(&self.ctrl, sock)?;
                command.stdin(Stdio::from(fd));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        command.stdout(if self.spec.ignore_stdout {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        command.stderr(if self.spec.ignore_stderr {
            Stdio::null()
        } else {
            Stdio::piped()
        });

        if let Some(user) = self.spec.user.as_deref() {
            let u = users::get_user_by_name(user)
                .ok_or_else(|| anyhow::anyhow!("unknown user: {user}"))?;
            command.uid(u.uid());
        }
        if let Some(group) = self.spec.group.as_deref() {
            let g = users::get_group_by_name(group)
                .ok_or_else(|| anyhow::anyhow!("unknown group: {group}"))?;
            command.gid(g.gid());
        }

        let no_new_session = self.spec.no_new_session;
        unsafe {
            command.pre_exec(move || {
                if !no_new_session {
                    // Own session so the supervisor can signal the whole group.
                    if libc::setsid() < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                // The supervisor traps these; children get defaults back.
                for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM, libc::SIGUSR1, libc::SIGPIPE] {
                    libc::signal(sig, libc::SIG_DFL);
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            anyhow::anyhow!(
                "spawn {} argv={} failed: kind={:?} os_error={:?} err={}",
                self.spec.name,
                argv.join(" "),
                e.kind(),
                e.raw_os_error(),
                e
            )
        })?;

        let pid = child.id().map(|p| p as i32);
        self.pid = pid;
        self.epoch = self.epoch.wrapping_add(1);

        if let Some(out) = child.stdout.take() {
            spawn_stdio_pump(
                self.spec.name.clone(),
                Stream::Out,
                out,
                self.sink.clone(),
            );
        }
        if let Some(err) = child.stderr.take() {
            spawn_stdio_pump(
                self.spec.name.clone(),
                Stream::Err,
                err,
                self.sink.clone(),
            );
        }

        // Exactly one exit event per spawn, tagged with its epoch.
        let tx = self.tx_self.clone();
        let epoch = self.epoch;
        tasks().spawn(async move {
            let status = child.wait().await.ok();
            let _ = tx.send(ServiceCmd::ChildExited { epoch, status });
        });
        Ok(())
    }

    fn do_stop(&mut self, resp: Option<oneshot::Sender<anyhow::Result<()>>>) {
        if self.state == State::Backoff {
            // A stop during backoff just parks the service.
            self.backoff_at = None;
            self.backoff_retry = 0;
            self.wants_down = true;
            self.state = State::Stopped;
            self.stop_time = Some(Self::now_epoch_secs());
            self.event("state=stopped reason=stop_during_backoff");
            if let Some(r) = resp {
                let _ = r.send(Ok(()));
            }
            self.resolve_on_stop();
            self.check_shutdown();
            return;
        }

        self.wants_down = true;
        if let Some(r) = resp {
            self.on_stop.push(r);
        }
        self.state = State::Stopping;
        self.stopwait_at = Some(Instant::now() + self.spec.stopwait);

        if self.spec.proxy.is_some() {
            if let Some(proxy) = self
                .spec
                .proxy
                .as_deref()
                .and_then(|p| controller::proxy_handle(&self.ctrl, p))
            {
                proxy.stop_service(&self.spec.name);
            }
            self.event("stop=requested via=proxy");
        } else if let Some(pid) = self.pid {
            self.deliver_signal(pid, nix::sys::signal::Signal::SIGTERM);
            self.event(format!("stop=requested sig=TERM pid={pid}"));
        }
    }

    /// Deliver a signal to the child. When the child got its own session the
    /// whole process group is addressed; the group id is always computed from
    /// the child's pid so the supervisor can never signal itself.
    fn deliver_signal(&self, pid: i32, sig: nix::sys::signal::Signal) {
        use nix::sys::signal::{kill, killpg};
        use nix::unistd::{getpgid, Pid};

        let child = Pid::from_raw(pid);
        if !self.spec.no_new_session {
            let own = getpgid(None).ok();
            match getpgid(Some(child)) {
                Ok(pgrp) if Some(pgrp) != own => {
                    if let Err(e) = killpg(pgrp, sig) {
                        self.event(format!("signal_error target=pgrp pgrp={pgrp} err={e}"));
                    }
                    return;
                }
                _ => {}
            }
        }
        if let Err(e) = kill(child, sig) {
            self.event(format!("signal_error target=pid pid={pid} err={e}"));
        }
    }

    async fn handle_exit(&mut self, status: Option<std::process::ExitStatus>) {
        let exit = match status {
            Some(s) => classify_exit(s),
            None => ExitKind {
                normal: false,
                reason: Some("wait failed".to_string()),
                raw: -1,
            },
        };

        self.clear_run_timers();
        self.pid = None;
        self.exit_status = Some(exit.raw);
        self.stop_time = Some(Self::now_epoch_secs());
        self.event(format!(
            "exit state={} normal={} reason={:?}",
            self.state.as_str(),
            exit.normal,
            exit.reason
        ));

        let state = self.state;
        match state {
            State::Starting | State::Running | State::Stopping => {
                if exit.normal {
                    self.to_stopped().await;
                } else if !self.spec.respawn_on_fail || self.wants_down {
                    self.to_fail(exit.reason_or_default()).await;
                } else if state == State::Starting {
                    // Startup failure: exponential backoff with a cap.
                    if self.backoff_retry + 1 >= self.spec.respawn_max_retries {
                        self.backoff_retry += 1;
                        self.to_fatal().await;
                    } else {
                        self.backoff_retry += 1;
                        let delay = backoff_delay(self.backoff_retry);
                        self.state = State::Backoff;
                        self.backoff_at = Some(Instant::now() + delay);
                        self.event(format!(
                            "state=backoff retry={} delay_ms={}",
                            self.backoff_retry,
                            delay.as_millis()
                        ));
                        self.notify_proxy_exit();
                    }
                } else {
                    // Failure while running: respawn immediately.
                    self.to_fail(exit.reason_or_default()).await;
                    if let Err(e) = self.do_start(false).await {
                        self.event(format!("respawn_error err={e:#}"));
                    }
                }
            }
            _ => {
                // Stale exit after the state machine already moved on.
            }
        }
    }

    async fn to_stopped(&mut self) {
        self.state = State::Stopped;
        self.normal_exit = true;
        self.event("state=stopped");
        self.resolve_on_stop();
        self.notify_proxy_exit();
        if self.check_shutdown() {
            return;
        }
        if self.spec.respawn_on_stop && !self.wants_down && self.normal_exit {
            self.event("respawn_on_stop");
            if let Err(e) = self.do_start(false).await {
                self.event(format!("respawn_error err={e:#}"));
            }
        }
    }

    async fn to_fail(&mut self, reason: String) {
        self.state = State::Fail;
        self.fail_reason = Some(reason);
        self.event(format!(
            "state=fail reason={:?} wait_status={}",
            self.fail_reason.as_deref().unwrap_or(""),
            self.exit_status
                .map(|s| s.to_string())
                .unwrap_or_default()
        ));
        self.resolve_on_stop();
        self.notify_proxy_exit();
        self.check_shutdown();
    }

    async fn to_fatal(&mut self) {
        self.state = State::Fatal;
        self.event(format!(
            "state=fatal retries={}",
            self.backoff_retry
        ));
        self.resolve_on_stop();
        self.notify_proxy_exit();
        self.check_shutdown();
    }

    fn notify_proxy_exit(&self) {
        if let Some(proxy) = self
            .spec
            .proxy
            .as_deref()
            .and_then(|p| controller::proxy_handle(&self.ctrl, p))
        {
            proxy.note_service_exit(&self.spec.name);
        }
    }

    fn check_shutdown(&mut self) -> bool {
        if let Some(resp) = self.shutdown_resp.take() {
            let _ = resp.send(());
            self.stop_loop = true;
            return true;
        }
        false
    }
}

fn take_expired(slot: &mut Option<Instant>, now: Instant) -> bool {
    match slot {
        Some(at) if *at <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}

fn spawn_stdio_pump(
    name: String,
    stream: Stream,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    sink: LogSink,
) {
    tasks().spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.emit_stream(&name, stream, &line);
        }
    });
}

pub struct ExitKind {
    pub normal: bool,
    pub reason: Option<String>,
    pub raw: i32,
}

impl ExitKind {
    fn reason_or_default(&self) -> String {
        self.reason.clone().unwrap_or_else(|| "unknown".to_string())
    }
}

/// Classify a wait status. Exit 0 and death by SIGTERM are "normal";
/// everything else is abnormal with a human-readable reason.
pub fn classify_exit(status: std::process::ExitStatus) -> ExitKind {
    let raw = status.into_raw();
    let code = status.code();
    let signal = status.signal();

    let normal = code == Some(0) || signal == Some(libc::SIGTERM);
    if normal {
        return ExitKind {
            normal: true,
            reason: None,
            raw,
        };
    }

    let mut parts: Vec<String> = Vec::new();
    if let Some(c) = code {
        if c != 0 {
            parts.push(format!("Exited with error {c}"));
        }
    }
    if let Some(s) = signal {
        parts.push(format!("Received signal {s}"));
    }
    if parts.is_empty() {
        parts.push(format!("Exited with status {raw}"));
    }
    ExitKind {
        normal: false,
        reason: Some(parts.join(" - ")),
        raw,
    }
}

/// Delay before backoff attempt n: BASE * uniform[1, 2n-1]. Randomized so a
/// herd of failing services does not retry in lockstep.
pub fn backoff_delay(attempt: u32) -> Duration {
    let upper = (2 * attempt.max(1)) - 1;
    let factor = rand::thread_rng().gen_range(1..=upper.max(1));
    BASE_BACKOFF_DELAY * factor
}
