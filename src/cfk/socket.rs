use anyhow::Context as _;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

/// A named listening socket owned by the supervisor. Services inherit the
/// bound descriptor (`tie_stdin_to`), and proxy hosts get every bound socket
/// announced via `_CFK_SOCK_<name>` environment variables.
#[derive(Debug, Clone)]
pub struct SocketSpec {
    pub name: String,
    pub host: String,
    pub service: String,
    pub nonblocking: bool,
    pub listen_qsize: i32,
}

impl SocketSpec {
    pub fn new(name: &str) -> SocketSpec {
        SocketSpec {
            name: name.to_string(),
            host: "localhost".to_string(),
            service: String::new(),
            nonblocking: false,
            listen_qsize: 128,
        }
    }
}

#[derive(Debug)]
pub struct SocketRecord {
    pub spec: SocketSpec,
    fd: Option<OwnedFd>,
    bound_addr: Option<String>,
    unix_path: Option<PathBuf>,
}

impl SocketRecord {
    pub fn new(name: &str) -> SocketRecord {
        SocketRecord {
            spec: SocketSpec::new(name),
            fd: None,
            bound_addr: None,
            unix_path: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.fd.is_some()
    }

    pub fn bound_addr(&self) -> Option<&str> {
        self.bound_addr.as_deref()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    /// Apply one `socket <name> <attr>=<value>` assignment. Attribute changes
    /// on a bound socket are kept and take effect at the next bind.
    pub fn set_attr(&mut self, attr: &str, value: &str) -> anyhow::Result<()> {
        match attr {
            "host" => {
                self.spec.host = if value.is_empty() {
                    "localhost".to_string()
                } else {
                    value.to_string()
                };
                Ok(())
            }
            "service" => {
                self.spec.service = value.to_string();
                Ok(())
            }
            "nonblocking" => {
                self.spec.nonblocking = crate::cfk::command::parse_bool(value)?;
                Ok(())
            }
            "listen_qsize" => {
                self.spec.listen_qsize = if value.is_empty() {
                    128
                } else {
                    value
                        .parse::<i32>()
                        .map_err(|_| anyhow::anyhow!("invalid listen_qsize: {value}"))?
                };
                Ok(())
            }
            other => anyhow::bail!("invalid property: socket {other}"),
        }
    }

    /// Create, bind and mark listening. Rejected when already bound; a failed
    /// bind leaves the socket unbound.
    pub fn bind(&mut self) -> anyhow::Result<String> {
        anyhow::ensure!(
            !self.is_bound(),
            "socket {} is already bound",
            self.spec.name
        );
        anyhow::ensure!(
            !self.spec.service.is_empty(),
            "socket {} has no service (port or path)",
            self.spec.name
        );

        let (fd, addr, unix_path) = if self.spec.service.contains('/') {
            let path = PathBuf::from(&self.spec.service);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("remove stale socket path {}", path.display()))?;
            }
            let l = UnixListener::bind(&path)
                .with_context(|| format!("bind unix socket {}", path.display()))?;
            let addr = path.display().to_string();
            (OwnedFd::from(l), addr, Some(path))
        } else {
            let spec_addr = format!("{}:{}", self.spec.host, self.spec.service);
            let l = TcpListener::bind(&spec_addr)
                .with_context(|| format!("bind tcp socket {spec_addr}"))?;
            // Wildcard-port binds report the kernel-assigned address.
            let addr = l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or(spec_addr);
            (OwnedFd::from(l), addr, None)
        };

        // std listeners come up with a default backlog; reassert with the
        // configured queue size (listen on a listening socket adjusts it).
        let r = unsafe { libc::listen(fd.as_raw_fd(), self.spec.listen_qsize) };
        if r < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("listen on socket {}", self.spec.name));
        }

        if self.spec.nonblocking {
            set_nonblocking(fd.as_raw_fd())?;
        }

        self.fd = Some(fd);
        self.bound_addr = Some(addr.clone());
        self.unix_path = unix_path;
        Ok(addr)
    }

    /// Close the descriptor. Children that already inherited it keep theirs.
    pub fn unbind(&mut self) {
        self.fd = None;
        self.bound_addr = None;
        if let Some(p) = self.unix_path.take() {
            let _ = std::fs::remove_file(p);
        }
    }

    /// Duplicate the bound descriptor for handing to a child. `dup` yields a
    /// descriptor without the close-on-exec flag, so the copy survives exec.
    pub fn dup_for_child(&self) -> anyhow::Result<OwnedFd> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("socket {} is not bound", self.spec.name))?;
        let copy = unsafe { libc::dup(fd.as_raw_fd()) };
        if copy < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("dup socket {}", self.spec.name));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(copy) })
    }
}

fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error()).context("fcntl F_GETFL");
    }
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if r < 0 {
        return Err(std::io::Error::last_os_error()).context("fcntl F_SETFL O_NONBLOCK");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_wildcard_port_reports_real_address() {
        let mut s = SocketRecord::new("web");
        s.set_attr("host", "127.0.0.1").unwrap();
        s.set_attr("service", "0").unwrap();
        let addr = s.bind().unwrap();
        assert!(addr.starts_with("127.0.0.1:"));
        assert!(!addr.ends_with(":0"));
        assert!(s.is_bound());
    }

    #[test]
    fn second_bind_is_rejected() {
        let mut s = SocketRecord::new("dup");
        s.set_attr("host", "127.0.0.1").unwrap();
        s.set_attr("service", "0").unwrap();
        s.bind().unwrap();
        let err = s.bind().unwrap_err().to_string();
        assert!(err.contains("already bound"), "err: {err}");
    }

    #[test]
    fn failed_bind_leaves_socket_unbound() {
        let mut s = SocketRecord::new("bad");
        s.set_attr("host", "definitely-not-a-real-host.invalid").unwrap();
        s.set_attr("service", "80").unwrap();
        assert!(s.bind().is_err());
        assert!(!s.is_bound());
    }

    #[test]
    fn dup_for_child_clears_cloexec() {
        let mut s = SocketRecord::new("inh");
        s.set_attr("host", "127.0.0.1").unwrap();
        s.set_attr("service", "0").unwrap();
        s.bind().unwrap();
        let copy = s.dup_for_child().unwrap();
        let flags = unsafe { libc::fcntl(copy.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0);
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn unix_bind_and_unbind_removes_path() {
        let path = std::env::temp_dir().join(format!("cfk-sock-test-{}", std::process::id()));
        let mut s = SocketRecord::new("usock");
        s.set_attr("service", path.display().to_string().as_str()).unwrap();
        let addr = s.bind().unwrap();
        assert_eq!(addr, path.display().to_string());
        assert!(path.exists());
        s.unbind();
        assert!(!path.exists());
    }
}
