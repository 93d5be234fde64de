use clap::Parser;
use controlfreak::cfk::proxy::{
    ProxyCommand, ProxyStartPayload, ProxyStatus, COMMAND_FD, ENV_COMMAND_FD, ENV_LOG_FD,
    ENV_SOCK_PREFIX, ENV_STATUS_FD, LOG_FD, STATUS_FD,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Entries for pids whose exit was observed before the fork registered them
/// age out after this long.
const BLACKLIST_AGE: Duration = Duration::from_secs(5);

/// Proxy host: the common parent of a family of services. Reads `start`/`stop`
/// commands on the command pipe, forks and execs services, relays their stdio
/// to the log pipe and their lifecycle to the status pipe.
#[derive(Debug, Parser)]
#[command(name = "cfk-proxy", version, about = "controlfreak proxy host")]
struct Args {
    /// File loaded into memory before any service is forked, so every child
    /// shares the pages.
    #[arg(long = "preload")]
    preload: Option<PathBuf>,
}

struct Host {
    // pid -> service name for every live child.
    children: Mutex<HashMap<i32, String>>,
    // Exits seen before the matching fork returned (reaper raced the spawn).
    blacklist: Mutex<HashMap<i32, (i32, Instant)>>,
    status_w: Mutex<File>,
    log_w: Mutex<File>,
}

impl Host {
    fn write_status(&self, status: &ProxyStatus) {
        if let Ok(line) = serde_json::to_string(status) {
            let mut w = self.status_w.lock().unwrap_or_else(|p| p.into_inner());
            let _ = writeln!(w, "{line}");
            let _ = w.flush();
        }
    }

    fn write_log(&self, stream: &str, name: &str, payload: &str) {
        let mut w = self.log_w.lock().unwrap_or_else(|p| p.into_inner());
        let _ = writeln!(w, "{stream}:{name}:{payload}");
        let _ = w.flush();
    }

    fn host_log(&self, payload: &str) {
        self.write_log("err", "-", payload);
    }
}

fn fd_from_env(var: &str, default: RawFd) -> RawFd {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<RawFd>().ok())
        .unwrap_or(default)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the preloaded image resident for the lifetime of the host; every
    // forked service shares these pages.
    let _preload: Option<Vec<u8>> = match args.preload.as_deref() {
        Some(p) => Some(
            std::fs::read(p)
                .map_err(|e| anyhow::anyhow!("preload {}: {e}", p.display()))?,
        ),
        None => None,
    };

    let command_fd = fd_from_env(ENV_COMMAND_FD, COMMAND_FD);
    let status_fd = fd_from_env(ENV_STATUS_FD, STATUS_FD);
    let log_fd = fd_from_env(ENV_LOG_FD, LOG_FD);

    // SAFETY: the supervisor hands us these descriptors per the wire contract.
    let command_r = unsafe { File::from_raw_fd(command_fd) };
    let host = Arc::new(Host {
        children: Mutex::new(HashMap::new()),
        blacklist: Mutex::new(HashMap::new()),
        status_w: Mutex::new(unsafe { File::from_raw_fd(status_fd) }),
        log_w: Mutex::new(unsafe { File::from_raw_fd(log_fd) }),
    });

    // Shutdown is driven by command-pipe EOF; the supervisor escalates to
    // SIGKILL if we hang. Ignoring TERM keeps a group-signaled stop of a
    // no_new_session service from taking the host down with it.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    spawn_reaper(Arc::clone(&host));

    let reader = BufReader::new(command_r);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProxyCommand>(&line) {
            Ok(ProxyCommand::Start(payload)) => start_service(&host, payload),
            Ok(ProxyCommand::Stop { name }) => stop_service(&host, &name),
            Err(e) => host.host_log(&format!("bad command line {line:?}: {e}")),
        }
    }

    // Command pipe closed: stop whatever is left, give the reaper a moment to
    // report, then leave.
    let pids: Vec<i32> = {
        let children = host.children.lock().unwrap_or_else(|p| p.into_inner());
        children.keys().copied().collect()
    };
    for pid in pids {
        signal_service_group(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let empty = host
            .children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty();
        if empty {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

/// Reap all children, forwarding each exit to the status pipe. An exit for an
/// unknown pid goes on the blacklist so the racing `start` registration can
/// reconcile it.
fn spawn_reaper(host: Arc<Host>) {
    std::thread::spawn(move || loop {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    deliver_exit(&host, pid.as_raw(), code << 8);
                }
                Ok(WaitStatus::Signaled(pid, sig, _core)) => {
                    deliver_exit(&host, pid.as_raw(), sig as i32);
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        sweep_blacklist(&host);
        std::thread::sleep(Duration::from_millis(100));
    });
}

fn deliver_exit(host: &Arc<Host>, pid: i32, wait_status: i32) {
    let name = {
        let mut children = host.children.lock().unwrap_or_else(|p| p.into_inner());
        children.remove(&pid)
    };
    match name {
        Some(name) => {
            host.write_status(&ProxyStatus::Stopped { name, wait_status });
        }
        None => {
            let mut bl = host.blacklist.lock().unwrap_or_else(|p| p.into_inner());
            bl.insert(pid, (wait_status, Instant::now()));
        }
    }
}

fn sweep_blacklist(host: &Arc<Host>) {
    let mut bl = host.blacklist.lock().unwrap_or_else(|p| p.into_inner());
    let now = Instant::now();
    bl.retain(|_, (_, seen)| now.duration_since(*seen) < BLACKLIST_AGE);
}

fn start_service(host: &Arc<Host>, payload: ProxyStartPayload) {
    let name = payload.name.clone();
    match spawn_service_child(host, &payload) {
        Ok(pid) => {
            host.write_status(&ProxyStatus::Started {
                name: name.clone(),
                pid,
            });
            // Did the reaper already see this pid die?
            let raced = {
                let mut bl = host.blacklist.lock().unwrap_or_else(|p| p.into_inner());
                bl.remove(&pid)
            };
            if let Some((wait_status, _)) = raced {
                host.children
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&pid);
                host.write_status(&ProxyStatus::Stopped { name, wait_status });
            }
        }
        Err(e) => {
            host.host_log(&format!("spawn {name} failed: {e:#}"));
            // No pid ever existed; report an abnormal synthetic status so the
            // supervisor applies its startup-failure policy.
            host.write_status(&ProxyStatus::Stopped {
                name,
                wait_status: 127 << 8,
            });
        }
    }
}

fn spawn_service_child(host: &Arc<Host>, payload: &ProxyStartPayload) -> anyhow::Result<i32> {
    let argv = payload.cmd.exec_argv()?;
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    for (k, v) in &payload.env {
        command.env(k, v);
    }
    if let Some(cwd) = payload.cwd.as_ref() {
        anyhow::ensure!(
            cwd.is_dir(),
            "cwd {} does not exist (refuse to start {})",
            cwd.display(),
            payload.name
        );
        command.current_dir(cwd);
    }

    match payload.tie_stdin_to.as_deref() {
        Some(sock) => {
            let var = format!("{ENV_SOCK_PREFIX}{sock}");
            let fd: RawFd = std::env::var(&var)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| anyhow::anyhow!("socket {sock} was not inherited ({var} unset)"))?;
            let copy = unsafe { libc::dup(fd) };
            anyhow::ensure!(copy >= 0, "dup inherited socket {sock} failed");
            command.stdin(unsafe { Stdio::from_raw_fd(copy) });
        }
        None => {
            command.stdin(Stdio::null());
        }
    }
    command.stdout(if payload.ignore_stdout {
        Stdio::null()
    } else {
        Stdio::piped()
    });
    command.stderr(if payload.ignore_stderr {
        Stdio::null()
    } else {
        Stdio::piped()
    });

    let no_new_session = payload.no_new_session;
    unsafe {
        command.pre_exec(move || {
            if !no_new_session {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            // The host ignores TERM; children must not inherit that.
            for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM, libc::SIGPIPE] {
                libc::signal(sig, libc::SIG_DFL);
            }
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| anyhow::anyhow!("spawn argv={:?}: {e}", argv))?;
    let pid = child.id() as i32;

    host.children
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(pid, payload.name.clone());

    if let Some(out) = child.stdout.take() {
        spawn_stdio_pump(Arc::clone(host), payload.name.clone(), "out", out);
    }
    if let Some(err) = child.stderr.take() {
        spawn_stdio_pump(Arc::clone(host), payload.name.clone(), "err", err);
    }
    // The reaper owns wait(); dropping the Child handle is fine because the
    // pid stays registered in `children`.
    drop(child);
    Ok(pid)
}

fn spawn_stdio_pump<R: std::io::Read + Send + 'static>(
    host: Arc<Host>,
    name: String,
    stream: &'static str,
    pipe: R,
) {
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            match line {
                Ok(l) => host.write_log(stream, &name, &l),
                Err(_) => break,
            }
        }
    });
}

fn stop_service(host: &Arc<Host>, name: &str) {
    let pid = {
        let children = host.children.lock().unwrap_or_else(|p| p.into_inner());
        children
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(pid, _)| *pid)
    };
    match pid {
        Some(pid) => signal_service_group(pid, libc::SIGTERM),
        None => host.host_log(&format!("stop for unknown service {name}")),
    }
}

/// SIGTERM the service's process group; fall back to the pid alone when the
/// child shares the host's group (no_new_session).
fn signal_service_group(pid: i32, sig: libc::c_int) {
    unsafe {
        let own = libc::getpgid(0);
        let pgid = libc::getpgid(pid);
        if pgid >= 0 && pgid != own {
            if libc::killpg(pgid, sig) == 0 {
                return;
            }
        }
        libc::kill(pid, sig);
    }
}
