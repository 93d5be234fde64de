use crate::cfk::config;
use crate::cfk::console;
use crate::cfk::controller::{self, Controller};
use crate::cfk::logger::LogSink;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Parser)]
#[command(name = "cfkd", version, about = "controlfreak process supervisor")]
pub struct Args {
    /// Config file: one admin command per line
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Directory substituted for ${BASE} in config lines
    #[arg(short = 'b', long = "base")]
    pub base: Option<String>,

    /// Supervisor home (admin socket lives at <home>/sock)
    #[arg(long = "home")]
    pub home: Option<PathBuf>,
}

pub fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".controlfreak")
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let home = args.home.clone().unwrap_or_else(default_home);
    std::fs::create_dir_all(&home)
        .map_err(|e| anyhow::anyhow!("create home {}: {e}", home.display()))?;

    let sink = LogSink::start();
    let ctrl = Controller::new_shared(home, sink.clone());
    {
        let mut st = ctrl.lock().unwrap_or_else(|p| p.into_inner());
        st.config_path = args.config.clone();
        st.base = args.base.clone();
    }

    sink.event("boot", None, crate::cfk::build_info::banner());

    if let Some(path) = args.config.as_deref() {
        config::load_file(&ctrl, path, args.base.as_deref()).await?;
    }

    let bound = console::start(&ctrl).await?;
    sink.event("boot", None, format!("console addr={bound}"));

    let shutdown = controller::shutdown_signal(&ctrl);
    spawn_signal_listeners(&ctrl, sink.clone());

    shutdown.wait().await;
    sink.event("shutdown", None, "requested");
    controller::shutdown_all(&ctrl).await;
    sink.flush().await;
    Ok(())
}

fn spawn_signal_listeners(ctrl: &controller::Ctrl, sink: LogSink) {
    use crate::cfk::asyncutil::tasks;

    let shutdown = controller::shutdown_signal(ctrl);
    tasks().spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = hup.recv() => {}
            _ = int.recv() => {}
            _ = term.recv() => {}
        }
        shutdown.request();
    });

    // USR1 asks the sink to reopen its output (rotation handoff).
    tasks().spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            if usr1.recv().await.is_none() {
                break;
            }
            sink.reopen();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_home_is_under_home_dir() {
        let h = default_home();
        assert!(h.ends_with(".controlfreak"));
    }

    #[test]
    fn args_parse() {
        let a = Args::parse_from(["cfkd", "-c", "/etc/cfk.conf", "-b", "/srv"]);
        assert_eq!(a.config.as_deref(), Some(std::path::Path::new("/etc/cfk.conf")));
        assert_eq!(a.base.as_deref(), Some("/srv"));
        assert!(a.home.is_none());
    }
}
