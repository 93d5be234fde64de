use crate::cfk::command;
use crate::cfk::controller::{self, Ctrl};
use anyhow::Context as _;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

// `command reload_config` re-enters the dispatcher through here; the boxed
// future keeps the async call cycle finitely sized.
fn dispatch_config_line<'a>(
    ctrl: &'a Ctrl,
    line: &'a str,
) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + 'a>> {
    Box::pin(command::dispatch(ctrl, line, true, true))
}

/// Apply a config file: one admin command per line, `#` comments, blank lines
/// ignored. `logger` lines are applied before anything else so the sink is
/// configured before services and sockets start producing output.
pub async fn load_file(ctrl: &Ctrl, path: &Path, base: Option<&str>) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    apply_text(ctrl, &raw, base)
        .await
        .with_context(|| format!("apply config {}", path.display()))
}

pub async fn apply_text(ctrl: &Ctrl, text: &str, base: Option<&str>) -> anyhow::Result<()> {
    let lines: Vec<String> = text
        .lines()
        .map(|l| match base {
            Some(b) => l.replace("${BASE}", b),
            None => l.to_string(),
        })
        .collect();

    let is_logger_line = |l: &str| l.trim_start().starts_with("logger ");

    for (idx, line) in lines.iter().enumerate().filter(|(_, l)| is_logger_line(l)) {
        dispatch_config_line(ctrl, line)
            .await
            .with_context(|| format!("line {}: {line}", idx + 1))?;
    }
    for (idx, line) in lines.iter().enumerate().filter(|(_, l)| !is_logger_line(l)) {
        dispatch_config_line(ctrl, line)
            .await
            .with_context(|| format!("line {}: {line}", idx + 1))?;
    }
    Ok(())
}

/// Re-apply the config file the daemon was started with.
pub async fn reload(ctrl: &Ctrl) -> anyhow::Result<()> {
    let (path, base) = {
        let st = ctrl.lock().unwrap_or_else(|p| p.into_inner());
        (st.config_path.clone(), st.base.clone())
    };
    let path = path.ok_or_else(|| anyhow::anyhow!("no config file to reload"))?;
    controller::sink(ctrl).event("config", None, format!("reload path={}", path.display()));
    load_file(ctrl, &path, base.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfk::controller::Controller;
    use crate::cfk::logger::LogSink;

    fn test_ctrl() -> Ctrl {
        Controller::new_shared(std::env::temp_dir().join("cfk-cfg-test"), LogSink::start())
    }

    #[tokio::test]
    async fn comments_blanks_and_base_substitution() {
        let ctrl = test_ctrl();
        let text = r#"
# a comment line

service db cmd=${BASE}/bin/run-db
service db tags=storage
"#;
        apply_text(&ctrl, text, Some("/srv/app")).await.unwrap();
        let v = controller::service_handle(&ctrl, "db").unwrap().view();
        assert_eq!(v.cmd_text.as_deref(), Some("/srv/app/bin/run-db"));
    }

    #[tokio::test]
    async fn logger_lines_apply_first() {
        let ctrl = test_ctrl();
        // The logger line comes last in the file but must not be rejected by
        // anything the earlier lines did; ordering is observable through the
        // absence of an error and the sink accepting the level.
        let text = "service a cmd=sleep 1\nlogger level=warn\n";
        apply_text(&ctrl, text, None).await.unwrap();
    }

    #[tokio::test]
    async fn bad_line_reports_line_number() {
        let ctrl = test_ctrl();
        let err = apply_text(&ctrl, "\nservice x nope=1\n", None)
            .await
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("line 2"), "err: {chain}");
        assert!(chain.contains("invalid property"), "err: {chain}");
    }

    #[tokio::test]
    async fn reload_without_config_path_errors() {
        let ctrl = test_ctrl();
        assert!(reload(&ctrl).await.is_err());
    }

    #[tokio::test]
    async fn reload_reapplies_file() {
        let ctrl = test_ctrl();
        let dir = std::env::temp_dir().join(format!("cfk-cfg-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfk.conf");
        std::fs::write(&path, "service r cmd=sleep 1\n").unwrap();
        {
            let mut st = ctrl.lock().unwrap();
            st.config_path = Some(path.clone());
        }
        reload(&ctrl).await.unwrap();
        assert!(controller::service_handle(&ctrl, "r").is_some());
        std::fs::write(&path, "service r desc=second pass\n").unwrap();
        reload(&ctrl).await.unwrap();
        let v = controller::service_handle(&ctrl, "r").unwrap().view();
        assert_eq!(v.desc.as_deref(), Some("second pass"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
