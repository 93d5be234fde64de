use crate::cfk::asyncutil::tasks;
use anyhow::Context as _;
use chrono::Local;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Severity of a sink line. Child stdout maps to `Info`, stderr to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Level> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => anyhow::bail!("invalid log level: {other}"),
        }
    }
}

/// Which child stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Out,
    Err,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Out => "out",
            Stream::Err => "err",
        }
    }

    pub fn default_level(&self) -> Level {
        match self {
            Stream::Out => Level::Info,
            Stream::Err => Level::Error,
        }
    }
}

enum SinkMsg {
    Line { level: Level, text: String },
    SetPath(Option<PathBuf>),
    SetLevel(Level),
    Reopen,
    Tap(mpsc::UnboundedSender<String>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the log sink. Cheap to clone; every send is non-blocking so the
/// core never stalls on slow log output.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<SinkMsg>,
}

impl LogSink {
    /// Spawn the writer task. Output goes to stderr until a path is set.
    pub fn start() -> LogSink {
        let (tx, rx) = mpsc::unbounded_channel();
        tasks().spawn(writer_task(rx));
        LogSink { tx }
    }

    /// One captured line of child output.
    pub fn emit(&self, level: Level, name: &str, stream: Stream, line: &str) {
        let _ = stream; // the level already encodes the stream mapping
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
        let text = format!("{ts} [{}] {name} {line}", level.as_str());
        let _ = self.tx.send(SinkMsg::Line { level, text });
    }

    /// Captured child output with the default stream mapping (out=info, err=error).
    pub fn emit_stream(&self, name: &str, stream: Stream, line: &str) {
        self.emit(stream.default_level(), name, stream, line);
    }

    /// Daemon diagnostics, key=value style.
    pub fn event(&self, component: &str, name: Option<&str>, msg: impl AsRef<str>) {
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
        let text = match name {
            Some(n) => format!("{ts} [{component}] svc={n} {}", msg.as_ref()),
            None => format!("{ts} [{component}] {}", msg.as_ref()),
        };
        let _ = self.tx.send(SinkMsg::Line {
            level: Level::Debug,
            text,
        });
    }

    pub fn set_level(&self, level: Level) {
        let _ = self.tx.send(SinkMsg::SetLevel(level));
    }

    pub fn set_path(&self, path: Option<PathBuf>) {
        let _ = self.tx.send(SinkMsg::SetPath(path));
    }

    /// Reopen the output file (USR1 / log rotation handoff).
    pub fn reopen(&self) {
        let _ = self.tx.send(SinkMsg::Reopen);
    }

    /// Mirror every formatted line into `tx` (used by tests).
    pub fn tap(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(SinkMsg::Tap(tx));
        rx
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SinkMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Apply one `logger <attr>=<value>` assignment.
    pub fn set_attr(&self, attr: &str, value: &str) -> anyhow::Result<()> {
        match attr {
            "path" => {
                if value.is_empty() {
                    self.set_path(None);
                } else {
                    self.set_path(Some(PathBuf::from(value)));
                }
                Ok(())
            }
            "level" => {
                let lvl: Level = value.parse()?;
                self.set_level(lvl);
                Ok(())
            }
            other => anyhow::bail!("invalid property: logger {other}"),
        }
    }
}

async fn open_append(path: &PathBuf) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log file {}", path.display()))
}

async fn writer_task(mut rx: mpsc::UnboundedReceiver<SinkMsg>) {
    let mut path: Option<PathBuf> = None;
    let mut file: Option<tokio::fs::File> = None;
    let mut threshold = Level::Debug;
    let mut tap: Option<mpsc::UnboundedSender<String>> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMsg::Line { level, text } => {
                if level < threshold {
                    continue;
                }
                if let Some(t) = tap.as_ref() {
                    let _ = t.send(text.clone());
                }
                match file.as_mut() {
                    Some(f) => {
                        if f.write_all(text.as_bytes()).await.is_err()
                            || f.write_all(b"\n").await.is_err()
                        {
                            // Fall back to stderr rather than dropping the line.
                            eprintln!("{text}");
                        }
                    }
                    None => eprintln!("{text}"),
                }
            }
            SinkMsg::SetPath(p) => {
                path = p;
                file = match path.as_ref() {
                    Some(p) => open_append(p).await.ok(),
                    None => None,
                };
            }
            SinkMsg::SetLevel(l) => threshold = l,
            SinkMsg::Reopen => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush().await;
                }
                file = match path.as_ref() {
                    Some(p) => open_append(p).await.ok(),
                    None => None,
                };
            }
            SinkMsg::Tap(t) => tap = Some(t),
            SinkMsg::Flush(done) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush().await;
                }
                let _ = done.send(());
            }
        }
    }
}
