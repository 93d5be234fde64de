use crate::cfk::asyncutil::tasks;
use crate::cfk::command;
use crate::cfk::controller::{self, Ctrl};
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};

enum Endpoint {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

/// Bind the admin endpoint and start accepting clients. The endpoint exists
/// in a stopped state until this is called (config lines may still adjust
/// it). Returns the actually bound address, which matters for wildcard-port
/// requests.
pub async fn start(ctrl: &Ctrl) -> anyhow::Result<String> {
    let (listen, full, home) = {
        let st = ctrl.lock().unwrap_or_else(|p| p.into_inner());
        anyhow::ensure!(!st.console.started, "console is already started");
        (st.console.listen.clone(), st.console.full, st.home.clone())
    };

    let spec = listen.unwrap_or_else(|| home.join("sock").display().to_string());
    let spec = spec.strip_prefix("unix:").map(str::to_string).unwrap_or(spec);

    let (endpoint, bound) = if spec.contains('/') {
        let path = PathBuf::from(&spec);
        prepare_unix_socket(&path)?;
        let l = UnixListener::bind(&path)
            .with_context(|| format!("bind console socket {}", path.display()))?;
        let addr = path.display().to_string();
        (Endpoint::Unix(l, path), addr)
    } else {
        let l = TcpListener::bind(&spec)
            .await
            .with_context(|| format!("bind console address {spec}"))?;
        let addr = l.local_addr().map(|a| a.to_string()).unwrap_or(spec);
        (Endpoint::Tcp(l), addr)
    };

    {
        let mut st = ctrl.lock().unwrap_or_else(|p| p.into_inner());
        st.console.started = true;
    }
    let sink = controller::sink(ctrl);
    sink.event("console", None, format!("listening addr={bound} full={full}"));

    let ctrl2 = ctrl.clone();
    let shutdown = controller::shutdown_signal(ctrl);
    tasks().spawn(async move {
        accept_loop(ctrl2, endpoint, full, shutdown).await;
    });
    Ok(bound)
}

/// Probe an existing socket file: refuse to start when another daemon is
/// accepting on it, remove it when stale.
fn prepare_unix_socket(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create console directory {}", parent.display()))?;
    }
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => anyhow::bail!(
                "another supervisor is already listening on {}",
                path.display()
            ),
            Err(_) => {
                std::fs::remove_file(path)
                    .with_context(|| format!("remove stale socket {}", path.display()))?;
            }
        }
    }
    Ok(())
}

async fn accept_loop(
    ctrl: Ctrl,
    endpoint: Endpoint,
    full: bool,
    shutdown: controller::ShutdownSignal,
) {
    let sink = controller::sink(&ctrl);
    loop {
        match &endpoint {
            Endpoint::Unix(l, _) => {
                tokio::select! {
                    r = l.accept() => match r {
                        Ok((stream, _)) => {
                            let ctrl = ctrl.clone();
                            tasks().spawn(async move {
                                let _ = serve_client(ctrl, stream, full).await;
                            });
                        }
                        Err(e) => {
                            sink.event("console", None, format!("accept_error err={e}"));
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        }
                    },
                    _ = shutdown.wait() => break,
                }
            }
            Endpoint::Tcp(l) => {
                tokio::select! {
                    r = l.accept() => match r {
                        Ok((stream, _)) => {
                            let ctrl = ctrl.clone();
                            tasks().spawn(async move {
                                let _ = serve_client(ctrl, stream, full).await;
                            });
                        }
                        Err(e) => {
                            sink.event("console", None, format!("accept_error err={e}"));
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        }
                    },
                    _ = shutdown.wait() => break,
                }
            }
        }
    }
    if let Endpoint::Unix(_, path) = endpoint {
        let _ = std::fs::remove_file(path);
    }
}

/// One client connection: CRLF-terminated command lines in, response lines
/// plus an `OK`/`ERROR:` terminator out. `exit` drains and closes.
async fn serve_client<S>(ctrl: Ctrl, stream: S, full: bool) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (r, mut w) = tokio::io::split(stream);
    let mut lines = BufReader::new(r).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.trim() == "exit" {
            w.flush().await?;
            break;
        }
        let reply = match command::dispatch(&ctrl, line, full, false).await {
            Ok(out) => {
                let mut buf = String::new();
                for l in out {
                    buf.push_str(&l);
                    buf.push_str("\r\n");
                }
                buf.push_str("OK\r\n");
                buf
            }
            Err(e) => format!("ERROR: {e:#}\r\n"),
        };
        w.write_all(reply.as_bytes()).await?;
        w.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfk::controller::Controller;
    use crate::cfk::logger::LogSink;
    use tokio::net::TcpStream;

    fn test_ctrl(name: &str) -> Ctrl {
        Controller::new_shared(
            std::env::temp_dir().join(format!("cfk-console-{name}-{}", std::process::id())),
            LogSink::start(),
        )
    }

    async fn roundtrip(stream: &mut TcpStream, line: &str) -> Vec<String> {
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = Vec::new();
        let (r, _) = stream.split();
        let mut lines = BufReader::new(r).lines();
        while let Some(l) = lines.next_line().await.unwrap() {
            let l = l.trim_end_matches('\r').to_string();
            let done = l == "OK" || l.starts_with("ERROR:");
            out.push(l);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn wildcard_tcp_reports_bound_port() {
        let ctrl = test_ctrl("wild");
        command::dispatch(&ctrl, "console listen=127.0.0.1:0", true, false)
            .await
            .unwrap();
        let addr = start(&ctrl).await.unwrap();
        assert!(addr.starts_with("127.0.0.1:"));
        assert!(!addr.ends_with(":0"));
    }

    #[tokio::test]
    async fn crlf_protocol_ok_and_error() {
        let ctrl = test_ctrl("proto");
        command::dispatch(&ctrl, "console listen=127.0.0.1:0", true, false)
            .await
            .unwrap();
        let addr = start(&ctrl).await.unwrap();
        let mut stream = TcpStream::connect(&addr).await.unwrap();

        let out = roundtrip(&mut stream, "command version").await;
        assert_eq!(out.last().map(String::as_str), Some("OK"));
        assert!(out[0].contains("controlfreak"));

        let out = roundtrip(&mut stream, "command nonsense").await;
        assert!(out[0].starts_with("ERROR: unknown command verb"));

        // `exit` closes the connection cleanly.
        stream.write_all(b"exit\r\n").await.unwrap();
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt as _;
        let n = stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn non_full_console_is_unprivileged() {
        let ctrl = test_ctrl("restr");
        command::dispatch(&ctrl, "console listen=127.0.0.1:0", true, false)
            .await
            .unwrap();
        command::dispatch(&ctrl, "console full=off", true, false)
            .await
            .unwrap();
        let addr = start(&ctrl).await.unwrap();
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let out = roundtrip(&mut stream, "service a cmd=sleep 1").await;
        assert!(out[0].starts_with("ERROR: insufficient privileges"), "{out:?}");
        let out = roundtrip(&mut stream, "command list").await;
        assert_eq!(out.last().map(String::as_str), Some("OK"));
    }

    #[tokio::test]
    async fn console_settings_freeze_after_start() {
        let ctrl = test_ctrl("frozen");
        command::dispatch(&ctrl, "console listen=127.0.0.1:0", true, false)
            .await
            .unwrap();
        start(&ctrl).await.unwrap();
        let err = command::dispatch(&ctrl, "console full=off", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already started"));
        let err = start(&ctrl).await.unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[tokio::test]
    async fn unix_socket_console() {
        let ctrl = test_ctrl("unix");
        let addr = start(&ctrl).await.unwrap();
        assert!(addr.ends_with("/sock"));
        let mut stream = tokio::net::UnixStream::connect(&addr).await.unwrap();
        stream.write_all(b"command list\r\n").await.unwrap();
        let (r, _) = stream.split();
        let mut lines = BufReader::new(r).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first.trim_end_matches('\r'), "OK");
    }
}
