use crate::cfk::asyncutil::tasks;
use crate::cfk::controller::{self, Ctrl};
use crate::cfk::logger::{LogSink, Stream};
use crate::cfk::service::CmdSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Grace given to a proxy host between SIGTERM and forcing the supervisor
/// bookkeeping to "down".
const PROXY_STOP_GRACE: Duration = Duration::from_secs(3);

/// Well-known descriptor numbers inside the proxy host.
pub const COMMAND_FD: RawFd = 3;
pub const STATUS_FD: RawFd = 4;
pub const LOG_FD: RawFd = 5;
/// First descriptor used for inherited listening sockets.
pub const FIRST_SOCK_FD: RawFd = 6;

pub const ENV_COMMAND_FD: &str = "_CFK_COMMAND_FD";
pub const ENV_STATUS_FD: &str = "_CFK_STATUS_FD";
pub const ENV_LOG_FD: &str = "_CFK_LOG_FD";
pub const ENV_SOCK_PREFIX: &str = "_CFK_SOCK_";

/// Everything the host needs to fork one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStartPayload {
    pub name: String,
    pub cmd: CmdSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub ignore_stdout: bool,
    #[serde(default)]
    pub ignore_stderr: bool,
    #[serde(default)]
    pub tie_stdin_to: Option<String>,
    #[serde(default)]
    pub no_new_session: bool,
}

/// Supervisor -> host, one JSON object per line on the command pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ProxyCommand {
    Start(ProxyStartPayload),
    Stop { name: String },
}

/// Host -> supervisor, one JSON object per line on the status pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProxyStatus {
    Started { name: String, pid: i32 },
    Stopped { name: String, wait_status: i32 },
}

/// One `<stream>:<svcname-or-"-">:<payload>` line from the log pipe.
pub fn parse_log_line(line: &str) -> Option<(Stream, Option<&str>, &str)> {
    let (stream, rest) = line.split_once(':')?;
    let stream = match stream {
        "out" => Stream::Out,
        "err" => Stream::Err,
        _ => return None,
    };
    let (name, payload) = rest.split_once(':')?;
    let name = if name == "-" { None } else { Some(name) };
    Some((stream, name, payload))
}

#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub name: String,
    pub cmd: Option<CmdSpec>,
    pub env: BTreeMap<String, String>,
    pub auto: bool,
}

impl ProxySpec {
    pub fn new(name: &str) -> ProxySpec {
        ProxySpec {
            name: name.to_string(),
            cmd: None,
            env: BTreeMap::new(),
            auto: true,
        }
    }

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
            "auto" => {
                self.auto = value.is_empty() || parse_bool(value)?;
            }
            other => anyhow::bail!("invalid property: {other}"),
        }
        Ok(())
    }
}

/// Snapshot for `proxystatus` and the `proxy_as_text` status field.
#[derive(Debug, Clone)]
pub struct ProxyView {
    pub name: String,
    pub up: bool,
    pub pid: Option<i32>,
    pub services: BTreeSet<String>,
}

pub enum ProxyCmd {
    Set {
        attr: String,
        value: String,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    AddService {
        name: String,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    RemoveService {
        name: String,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    StartService {
        payload: ProxyStartPayload,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    StopService {
        name: String,
    },
    NoteServiceExit {
        name: String,
    },
    Up {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    Down {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    HostExited {
        epoch: u64,
        status: Option<std::process::ExitStatus>,
    },
    StatusLine {
        epoch: u64,
        line: String,
    },
    LogLine {
        epoch: u64,
        line: String,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::UnboundedSender<ProxyCmd>,
    view: Arc<Mutex<ProxyView>>,
}

impl ProxyHandle {
    pub fn view(&self) -> ProxyView {
        self.view.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_up(&self) -> bool {
        self.view().up
    }

    async fn call<F>(&self, make: F) -> anyhow::Result<()>
    where
        F: FnOnce(oneshot::Sender<anyhow::Result<()>>) -> ProxyCmd,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| anyhow::anyhow!("proxy is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("proxy is gone"))?
    }

    pub async fn set_attr(&self, attr: &str, value: &str) -> anyhow::Result<()> {
        let attr = attr.to_string();
        let value = value.to_string();
        self.call(move |resp| ProxyCmd::Set { attr, value, resp })
            .await
    }

    pub async fn start_service(&self, payload: ProxyStartPayload) -> anyhow::Result<()> {
        self.call(move |resp| ProxyCmd::StartService { payload, resp })
            .await
    }

    pub fn stop_service(&self, name: &str) {
        let _ = self.tx.send(ProxyCmd::StopService {
            name: name.to_string(),
        });
    }

    pub fn note_service_exit(&self, name: &str) {
        let _ = self.tx.send(ProxyCmd::NoteServiceExit {
            name: name.to_string(),
        });
    }

    pub async fn add_service(&self, name: &str) -> anyhow::Result<()> {
        let name = name.to_string();
        self.call(move |resp| ProxyCmd::AddService { name, resp })
            .await
    }

    pub async fn remove_service(&self, name: &str) -> anyhow::Result<()> {
        let name = name.to_string();
        self.call(move |resp| ProxyCmd::RemoveService { name, resp })
            .await
    }

    pub async fn up(&self) -> anyhow::Result<()> {
        self.call(|resp| ProxyCmd::Up { resp }).await
    }

    pub async fn down(&self) -> anyhow::Result<()> {
        self.call(|resp| ProxyCmd::Down { resp }).await
    }

    /// Stop the host (if running) and end the actor. Resolves once down.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ProxyCmd::Shutdown { resp: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

pub fn spawn_proxy(name: &str, ctrl: Ctrl, sink: LogSink) -> ProxyHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let view = Arc::new(Mutex::new(ProxyView {
        name: name.to_string(),
        up: false,
        pid: None,
        services: BTreeSet::new(),
    }));
    let handle = ProxyHandle {
        tx: tx.clone(),
        view: Arc::clone(&view),
    };
    let actor = ProxyActor {
        spec: ProxySpec::new(name),
        ctrl,
        sink,
        tx_self: tx,
        view,
        services: BTreeSet::new(),
        host: None,
        epoch: 0,
        stopping: false,
        force_down_at: None,
        shutdown_resp: None,
        stop_loop: false,
    };
    tasks().spawn(actor.run(rx));
    handle
}

struct HostRuntime {
    pid: i32,
    // None once the orderly shutdown closed the pipe.
    command_w: Option<OwnedFd>,
}

struct ProxyActor {
    spec: ProxySpec,
    ctrl: Ctrl,
    sink: LogSink,
    tx_self: mpsc::UnboundedSender<ProxyCmd>,
    view: Arc<Mutex<ProxyView>>,

    services: BTreeSet<String>,
    host: Option<HostRuntime>,
    // Bumped per host spawn; status/log/exit events from an older host are stale.
    epoch: u64,
    stopping: bool,
    force_down_at: Option<Instant>,
    shutdown_resp: Option<oneshot::Sender<()>>,
    stop_loop: bool,
}

impl ProxyActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProxyCmd>) {
        self.publish();
        loop {
            let cmd_opt = if let Some(at) = self.force_down_at {
                tokio::select! {
                    c = rx.recv() => c,
                    _ = tokio::time::sleep_until(at) => {
                        self.force_down_at = None;
                        self.force_host_down();
                        self.publish();
                        if self.stop_loop {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            let Some(cmd) = cmd_opt else { break };
            self.handle_cmd(cmd).await;
            self.publish();
            if self.stop_loop {
                break;
            }
        }
    }

    fn publish(&self) {
        let mut v = self.view.lock().unwrap_or_else(|p| p.into_inner());
        v.up = self.host.is_some();
        v.pid = self.host.as_ref().map(|h| h.pid);
        v.services = self.services.clone();
    }

    fn event(&self, msg: impl AsRef<str>) {
        self.sink.event("proxy", Some(&self.spec.name), msg);
    }

    async fn handle_cmd(&mut self, cmd: ProxyCmd) {
        match cmd {
            ProxyCmd::Set { attr, value, resp } => {
                let _ = resp.send(self.spec.set_attr(&attr, &value));
            }
            ProxyCmd::AddService { name, resp } => {
                self.services.insert(name);
                let _ = resp.send(Ok(()));
            }
            ProxyCmd::RemoveService { name, resp } => {
                self.services.remove(&name);
                let _ = resp.send(Ok(()));
            }
            ProxyCmd::StartService { payload, resp } => {
                let r = self.do_start_service(payload);
                let _ = resp.send(r);
            }
            ProxyCmd::StopService { name } => {
                if self.host.is_some() && !self.write_command(&ProxyCommand::Stop { name }) {
                    self.begin_host_shutdown();
                }
            }
            ProxyCmd::NoteServiceExit { name } => {
                self.event(format!("service_exit svc={name}"));
                if self.spec.auto && self.host.is_some() && !self.stopping {
                    let any_up = self
                        .services
                        .iter()
                        .filter_map(|s| controller::service_handle(&self.ctrl, s))
                        .any(|h| h.is_up());
                    if !any_up {
                        self.event("auto_down reason=no_service_up");
                        self.begin_host_shutdown();
                    }
                }
            }
            ProxyCmd::Up { resp } => {
                let r = if self.host.is_some() {
                    Ok(())
                } else {
                    self.spawn_host()
                };
                let _ = resp.send(r);
            }
            ProxyCmd::Down { resp } => {
                if self.host.is_some() {
                    self.begin_host_shutdown();
                }
                let _ = resp.send(Ok(()));
            }
            ProxyCmd::HostExited { epoch, status } => {
                if epoch == self.epoch && self.host.is_some() {
                    let text = status
                        .map(|s| format!("{s}"))
                        .unwrap_or_else(|| "unknown".to_string());
                    self.event(format!("host_exit status={text}"));
                    self.host = None;
                    self.stopping = false;
                    self.force_down_at = None;
                    self.fail_bound_services();
                    self.check_shutdown();
                }
            }
            ProxyCmd::StatusLine { epoch, line } => {
                if epoch == self.epoch {
                    self.handle_status_line(&line);
                }
            }
            ProxyCmd::LogLine { epoch, line } => {
                if epoch == self.epoch {
                    self.handle_log_line(&line);
                }
            }
            ProxyCmd::Shutdown { resp } => {
                if self.host.is_some() {
                    self.shutdown_resp = Some(resp);
                    if !self.stopping {
                        self.begin_host_shutdown();
                    }
                } else {
                    let _ = resp.send(());
                    self.stop_loop = true;
                }
            }
        }
    }

    fn do_start_service(&mut self, payload: ProxyStartPayload) -> anyhow::Result<()> {
        if self.host.is_none() {
            if self.spec.auto {
                self.spawn_host()?;
            } else {
                anyhow::bail!("proxy {} is not up", self.spec.name);
            }
        }
        self.services.insert(payload.name.clone());
        if !self.write_command(&ProxyCommand::Start(payload)) {
            self.begin_host_shutdown();
            anyhow::bail!("proxy {} command pipe is broken", self.spec.name);
        }
        Ok(())
    }

    /// Returns false on a pipe I/O error; the caller shuts the proxy down.
    fn write_command(&self, cmd: &ProxyCommand) -> bool {
        let Some(fd) = self.host.as_ref().and_then(|h| h.command_w.as_ref()) else {
            return true;
        };
        let mut line = match serde_json::to_string(cmd) {
            Ok(l) => l,
            Err(e) => {
                self.event(format!("encode_error err={e}"));
                return true;
            }
        };
        line.push('\n');
        if let Err(e) = write_all_fd(fd.as_raw_fd(), line.as_bytes()) {
            self.event(format!("command_pipe_error err={e}"));
            return false;
        }
        true
    }

    fn spawn_host(&mut self) -> anyhow::Result<()> {
        let cmd = self
            .spec
            .cmd
            .clone()
            .ok_or_else(|| anyhow::anyhow!("proxy {} has no cmd", self.spec.name))?;
        let argv = cmd.exec_argv()?;

        // Three pipes: command (we write), status and log (host writes).
        let (cmd_r, cmd_w) = make_pipe()?;
        let (status_r, status_w) = make_pipe()?;
        let (log_r, log_w) = make_pipe()?;

        // Child-side descriptors land at well-known numbers. The parent-side
        // copies are cloexec-dup'ed above the target range so the dup2 calls
        // in pre_exec can never collide; dup2 itself clears close-on-exec.
        let mut keep_alive: Vec<OwnedFd> = Vec::new();
        let mut mappings: Vec<(RawFd, RawFd)> = Vec::new();
        for (fd, target) in [
            (cmd_r, COMMAND_FD),
            (status_w, STATUS_FD),
            (log_w, LOG_FD),
        ] {
            let high = dup_cloexec_above(fd.as_raw_fd(), FIRST_SOCK_FD + 64)?;
            mappings.push((high.as_raw_fd(), target));
            keep_alive.push(high);
        }

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]);
        for (k, v) in &self.spec.env {
            command.env(k, v);
        }
        command.env(ENV_COMMAND_FD, COMMAND_FD.to_string());
        command.env(ENV_STATUS_FD, STATUS_FD.to_string());
        command.env(ENV_LOG_FD, LOG_FD.to_string());

        // Registered bound sockets are inherited too, announced by name.
        let mut next_fd = FIRST_SOCK_FD;
        for (name, fd) in controller::bound_socket_fds(&self.ctrl) {
            let high = dup_cloexec_above(fd, FIRST_SOCK_FD + 64)?;
            mappings.push((high.as_raw_fd(), next_fd));
            keep_alive.push(high);
            command.env(format!("{ENV_SOCK_PREFIX}{name}"), next_fd.to_string());
            next_fd += 1;
        }

        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());

        let pre_exec_mappings = mappings.clone();
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                for (src, target) in &pre_exec_mappings {
                    if libc::dup2(*src, *target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn proxy {} failed: {e}", self.spec.name))?;
        drop(keep_alive);

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        self.epoch = self.epoch.wrapping_add(1);
        let epoch = self.epoch;
        self.host = Some(HostRuntime {
            pid,
            command_w: Some(cmd_w),
        });
        self.stopping = false;
        self.event(format!("host_started pid={pid}"));

        let tx = self.tx_self.clone();
        tasks().spawn(async move {
            let status = child.wait().await.ok();
            let _ = tx.send(ProxyCmd::HostExited { epoch, status });
        });

        spawn_pipe_line_reader(status_r, self.tx_self.clone(), epoch, true);
        spawn_pipe_line_reader(log_r, self.tx_self.clone(), epoch, false);
        Ok(())
    }

    /// Orderly host shutdown: ask it to stop every service, close the command
    /// pipe, SIGTERM it, and arm the bounded "did it really stop?" timer.
    fn begin_host_shutdown(&mut self) {
        if self.host.is_none() {
            return;
        }
        self.stopping = true;
        for name in self.services.clone() {
            self.write_command(&ProxyCommand::Stop { name });
        }
        // Closing the command pipe tells the host no more work is coming.
        let pid = match self.host.as_mut() {
            Some(host) => {
                host.command_w = None;
                host.pid
            }
            None => return,
        };
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
        self.force_down_at = Some(Instant::now() + PROXY_STOP_GRACE);
        self.event(format!("host_stop_requested pid={pid}"));
    }

    /// The grace timer expired: force the bookkeeping to "down".
    fn force_host_down(&mut self) {
        let Some(host) = self.host.take() else {
            return;
        };
        self.event(format!("host_forced_down pid={}", host.pid));
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(host.pid),
            nix::sys::signal::Signal::SIGKILL,
        );
        self.stopping = false;
        self.fail_bound_services();
        self.check_shutdown();
    }

    fn fail_bound_services(&self) {
        for name in &self.services {
            if let Some(h) = controller::service_handle(&self.ctrl, name) {
                h.notify_has_stopped("proxy stopped");
            }
        }
    }

    fn check_shutdown(&mut self) {
        if let Some(resp) = self.shutdown_resp.take() {
            let _ = resp.send(());
            self.stop_loop = true;
        }
    }

    fn handle_status_line(&mut self, line: &str) {
        let parsed: Result<ProxyStatus, _> = serde_json::from_str(line.trim());
        match parsed {
            Ok(ProxyStatus::Started { name, pid }) => {
                self.event(format!("status=started svc={name} pid={pid}"));
                if let Some(h) = controller::service_handle(&self.ctrl, &name) {
                    h.notify_proxy_started(pid);
                }
            }
            Ok(ProxyStatus::Stopped { name, wait_status }) => {
                self.event(format!("status=stopped svc={name} wait_status={wait_status}"));
                if let Some(h) = controller::service_handle(&self.ctrl, &name) {
                    h.notify_proxy_stopped(wait_status);
                }
            }
            Err(e) => {
                self.event(format!("status_parse_error line={line:?} err={e}"));
            }
        }
    }

    fn handle_log_line(&self, line: &str) {
        match parse_log_line(line) {
            Some((stream, name, payload)) => {
                let name = name.unwrap_or(&self.spec.name);
                self.sink.emit_stream(name, stream, payload);
            }
            None => {
                self.event(format!("log_parse_error line={line:?}"));
            }
        }
    }
}

fn make_pipe() -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if r < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// `F_DUPFD_CLOEXEC` above `min`: stays closed-on-exec in this process, and
/// high enough that child-side `dup2` targets can never collide with it.
fn dup_cloexec_above(fd: RawFd, min: RawFd) -> anyhow::Result<OwnedFd> {
    let copy = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) };
    if copy < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(copy) })
}

fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Read a pipe line by line until EOF, forwarding each line to the actor.
fn spawn_pipe_line_reader(
    fd: OwnedFd,
    tx: mpsc::UnboundedSender<ProxyCmd>,
    epoch: u64,
    is_status: bool,
) {
    tasks().spawn(async move {
        if set_nonblocking(fd.as_raw_fd()).is_err() {
            return;
        }
        let afd = match AsyncFd::new(fd) {
            Ok(a) => a,
            Err(_) => return,
        };
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        'outer: loop {
            let n = match read_from_asyncfd(&afd, &mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf[..n]);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                let msg = if is_status {
                    ProxyCmd::StatusLine { epoch, line }
                } else {
                    ProxyCmd::LogLine { epoch, line }
                };
                if tx.send(msg).is_err() {
                    break 'outer;
                }
            }
        }
    });
}

async fn read_from_asyncfd(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> anyhow::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        let r = guard.try_io(|inner| {
            // SAFETY: fd is a valid pipe fd; buf is valid.
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let e = std::io::Error::last_os_error();
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
                }
                return Err(e);
            }
            Ok(n as usize)
        });
        match r {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(anyhow::anyhow!("read failed: {e}")),
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfk::controller::Controller;

    #[test]
    fn command_wire_round_trip() {
        let cmd = ProxyCommand::Start(ProxyStartPayload {
            name: "web".to_string(),
            cmd: CmdSpec::Shell("sleep 1".to_string()),
            env: BTreeMap::new(),
            cwd: None,
            ignore_stdout: false,
            ignore_stderr: true,
            tie_stdin_to: Some("sock1".to_string()),
            no_new_session: false,
        });
        let line = serde_json::to_string(&cmd).unwrap();
        assert!(line.contains(r#""command":"start""#));
        let back: ProxyCommand = serde_json::from_str(&line).unwrap();
        match back {
            ProxyCommand::Start(p) => {
                assert_eq!(p.name, "web");
                assert!(p.ignore_stderr);
            }
            _ => panic!("wrong variant"),
        }

        let stop = serde_json::to_string(&ProxyCommand::Stop {
            name: "web".to_string(),
        })
        .unwrap();
        assert!(stop.contains(r#""command":"stop""#));
    }

    #[test]
    fn status_wire_round_trip() {
        let s = serde_json::to_string(&ProxyStatus::Started {
            name: "a".to_string(),
            pid: 42,
        })
        .unwrap();
        assert!(s.contains(r#""status":"started""#));
        let back: ProxyStatus = serde_json::from_str(&s).unwrap();
        assert!(matches!(back, ProxyStatus::Started { pid: 42, .. }));
    }

    #[test]
    fn log_line_parsing() {
        let (stream, name, payload) = parse_log_line("out:svc1:hello world").unwrap();
        assert_eq!(stream, Stream::Out);
        assert_eq!(name, Some("svc1"));
        assert_eq!(payload, "hello world");

        let (_, name, payload) = parse_log_line("err:-:host noise").unwrap();
        assert_eq!(name, None);
        assert_eq!(payload, "host noise");

        assert!(parse_log_line("nope").is_none());
        assert!(parse_log_line("warn:svc:line").is_none());
    }

    #[tokio::test]
    async fn host_pipes_carry_status_and_logs() {
        let sink = LogSink::start();
        let mut tap = sink.tap();
        sink.flush().await;
        let ctrl = Controller::new_shared(
            std::env::temp_dir().join("cfk-proxy-test"),
            sink.clone(),
        );
        let h = spawn_proxy("p1", ctrl, sink.clone());
        // A stand-in host: report a started service, log one line, then wait
        // for the command pipe to close.
        h.set_attr(
            "cmd",
            r#"echo '{"status":"started","name":"ghost","pid":99999}' >&4; echo 'out:ghost:hi from host' >&5; cat <&3 >/dev/null"#,
        )
        .await
        .unwrap();
        h.up().await.unwrap();
        assert!(h.is_up());

        // The log pipe line surfaces through the sink.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            tokio::select! {
                line = tap.recv() => {
                    let line = line.expect("sink closed");
                    if line.contains("ghost hi from host") {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => panic!("log line never arrived"),
            }
        }

        h.down().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.is_up() {
            assert!(Instant::now() < deadline, "proxy never went down");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
