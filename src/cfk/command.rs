use crate::cfk::build_info;
use crate::cfk::config;
use crate::cfk::controller::{self, Ctrl};
use crate::cfk::service::CmdSpec;

/// Accepted spellings for boolean attribute values.
pub fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "enabled" | "yes" => Ok(true),
        "0" | "false" | "off" | "disabled" | "no" => Ok(false),
        other => anyhow::bail!("invalid boolean: {other}"),
    }
}

/// A `[…]` right-hand side is a structured argv list (JSON array of strings);
/// anything else is a shell command string.
pub fn parse_cmd_value(value: &str) -> anyhow::Result<CmdSpec> {
    let v = value.trim();
    if v.starts_with('[') {
        let argv: Vec<String> = serde_json::from_str(v)
            .map_err(|e| anyhow::anyhow!("invalid command list {v:?}: {e}"))?;
        anyhow::ensure!(!argv.is_empty(), "command list is empty");
        Ok(CmdSpec::Argv(argv))
    } else {
        Ok(CmdSpec::Shell(v.to_string()))
    }
}

/// Strip one layer of matching single or double quotes.
pub fn unquote(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2 {
        let b = v.as_bytes();
        if (b[0] == b'"' && b[v.len() - 1] == b'"')
            || (b[0] == b'\'' && b[v.len() - 1] == b'\'')
        {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/// `# …` comments plus surrounding whitespace.
fn normalize(line: &str) -> &str {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    line.trim()
}

fn split_assignment(rest: &str) -> anyhow::Result<(&str, &str)> {
    let rest = rest.trim();
    let (attr, value) = rest
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected <attr>=<value>, got: {rest}"))?;
    let attr = attr.trim();
    anyhow::ensure!(
        !attr.is_empty() && !attr.contains(char::is_whitespace),
        "invalid attribute name: {attr:?}"
    );
    Ok((attr, unquote(value)))
}

fn require_priv(has_priv: bool, verb: &str) -> anyhow::Result<()> {
    anyhow::ensure!(has_priv, "insufficient privileges for {verb}");
    Ok(())
}

/// Dispatch one admin line. Returns the response lines (the caller appends
/// the `OK` terminator); errors become `ERROR: <reason>`.
pub async fn dispatch(
    ctrl: &Ctrl,
    line: &str,
    has_priv: bool,
    ignore_void: bool,
) -> anyhow::Result<Vec<String>> {
    let line = normalize(line);
    if line.is_empty() {
        if ignore_void {
            return Ok(vec![]);
        }
        anyhow::bail!("command is void");
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    match verb {
        "service" => {
            require_priv(has_priv, "service")?;
            let (name, assignment) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow::anyhow!("service requires <name> <attr>=<value>"))?;
            let (attr, value) = split_assignment(assignment)?;
            let svc = controller::find_or_create_service(ctrl, name)?;
            svc.set_attr(attr, value).await?;
            Ok(vec![])
        }
        "socket" => {
            require_priv(has_priv, "socket")?;
            let (name, assignment) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow::anyhow!("socket requires <name> <attr>=<value>"))?;
            let (attr, value) = split_assignment(assignment)?;
            controller::socket_set_attr(ctrl, name, attr, value)?;
            Ok(vec![])
        }
        "proxy" => {
            require_priv(has_priv, "proxy")?;
            let (name, tail) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow::anyhow!("proxy requires <name> <attr>=<value>"))?;
            let tail = tail.trim();
            if let Some(svc_part) = tail.strip_prefix("service ") {
                // `proxy <name> service <svc> [<attr>=<value>]` attaches a
                // service to this proxy.
                let svc_part = svc_part.trim();
                let (svc_name, assignment) = match svc_part.split_once(char::is_whitespace) {
                    Some((n, a)) => (n, Some(a)),
                    None => (svc_part, None),
                };
                let svc = controller::attach_service_to_proxy(ctrl, name, svc_name).await?;
                if let Some(assignment) = assignment {
                    let (attr, value) = split_assignment(assignment)?;
                    svc.set_attr(attr, value).await?;
                }
                Ok(vec![])
            } else {
                let (attr, value) = split_assignment(tail)?;
                let proxy = controller::find_or_create_proxy(ctrl, name)?;
                proxy.set_attr(attr, value).await?;
                Ok(vec![])
            }
        }
        "console" => {
            require_priv(has_priv, "console")?;
            let (attr, value) = split_assignment(rest)?;
            let mut st = ctrl.lock().unwrap_or_else(|p| p.into_inner());
            anyhow::ensure!(
                !st.console.started,
                "console is already started"
            );
            match attr {
                "listen" => {
                    st.console.listen = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    };
                }
                "full" => {
                    st.console.full = value.is_empty() || parse_bool(value)?;
                }
                other => anyhow::bail!("invalid property: console {other}"),
            }
            Ok(vec![])
        }
        "logger" => {
            require_priv(has_priv, "logger")?;
            let (attr, value) = split_assignment(rest)?;
            let sink = controller::sink(ctrl);
            sink.set_attr(attr, value)?;
            Ok(vec![])
        }
        "command" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            anyhow::ensure!(!args.is_empty(), "command requires a verb");
            run_command(ctrl, &args).await
        }
        other => anyhow::bail!("unknown command: {other}"),
    }
}

async fn run_command(ctrl: &Ctrl, args: &[&str]) -> anyhow::Result<Vec<String>> {
    let (verb, rest) = (args[0], &args[1..]);
    match verb {
        "start" | "stop" | "restart" | "up" | "down" => {
            let services = controller::services_from_selector(ctrl, rest)?;
            anyhow::ensure!(!services.is_empty(), "no matching service");
            let mut errors: Vec<String> = Vec::new();
            for svc in services {
                let name = svc.name();
                let r = match verb {
                    "start" => svc.start().await,
                    "stop" => svc.stop().await,
                    "restart" => svc.restart().await,
                    // `up` and `down` are the idempotent variants.
                    "up" => match svc.start().await {
                        Err(e) if e.to_string().contains("already up") => Ok(()),
                        r => r,
                    },
                    "down" => match svc.stop().await {
                        Err(e) if e.to_string().contains("already down") => Ok(()),
                        r => r,
                    },
                    _ => unreachable!(),
                };
                if let Err(e) = r {
                    errors.push(format!("{name}: {e:#}"));
                }
            }
            if errors.is_empty() {
                Ok(vec![])
            } else {
                anyhow::bail!("{}", errors.join("; "));
            }
        }
        "destroy" => {
            let services = controller::services_from_selector(ctrl, rest)?;
            anyhow::ensure!(!services.is_empty(), "no matching service");
            let mut errors: Vec<String> = Vec::new();
            for svc in services {
                let name = svc.name();
                if let Err(e) = controller::destroy_service(ctrl, &name).await {
                    errors.push(format!("{name}: {e:#}"));
                }
            }
            if errors.is_empty() {
                Ok(vec![])
            } else {
                anyhow::bail!("{}", errors.join("; "));
            }
        }
        "proxyup" | "proxydown" => {
            anyhow::ensure!(rest.len() == 1, "{verb} requires a proxy name");
            let proxy = controller::proxy_handle(ctrl, rest[0])
                .ok_or_else(|| anyhow::anyhow!("unknown proxy: {}", rest[0]))?;
            if verb == "proxyup" {
                proxy.up().await?;
            } else {
                proxy.down().await?;
            }
            Ok(vec![])
        }
        "list" => {
            anyhow::ensure!(rest.is_empty(), "list takes no argument");
            Ok(controller::service_views(ctrl)
                .into_iter()
                .map(|v| v.name)
                .collect())
        }
        "status" => {
            let views = selected_views(ctrl, rest)?;
            Ok(views
                .into_iter()
                .map(|v| {
                    let proxy = controller::proxy_as_text(ctrl, &v);
                    format!(
                        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        v.name,
                        v.state.as_str(),
                        v.pid.map(|p| p.to_string()).unwrap_or_default(),
                        v.start_time.map(|t| t.to_string()).unwrap_or_default(),
                        v.stop_time.map(|t| t.to_string()).unwrap_or_default(),
                        proxy,
                        v.fail_reason.as_deref().unwrap_or(""),
                        v.running_cmd.as_deref().unwrap_or(""),
                    )
                })
                .collect())
        }
        "desc" => {
            let views = selected_views(ctrl, rest)?;
            Ok(views
                .into_iter()
                .map(|v| {
                    let proxy = controller::proxy_as_text(ctrl, &v);
                    let tags: Vec<&str> = v.tags.iter().map(String::as_str).collect();
                    format!(
                        "{}\t{}\t{}\t{}\t{}",
                        v.name,
                        tags.join(","),
                        v.desc.as_deref().unwrap_or(""),
                        proxy,
                        v.cmd_text.as_deref().unwrap_or(""),
                    )
                })
                .collect())
        }
        "pids" => {
            let views = selected_views(ctrl, rest)?;
            Ok(views
                .into_iter()
                .map(|v| {
                    format!(
                        "{}\t{}",
                        v.name,
                        v.pid.map(|p| p.to_string()).unwrap_or_default()
                    )
                })
                .collect())
        }
        "proxystatus" => {
            anyhow::ensure!(rest.is_empty(), "proxystatus takes no argument");
            Ok(controller::proxy_views(ctrl)
                .into_iter()
                .map(|v| {
                    format!(
                        "{}\t{}\t{}",
                        v.name,
                        if v.up { "up" } else { "down" },
                        v.pid.map(|p| p.to_string()).unwrap_or_default()
                    )
                })
                .collect())
        }
        "bind" => {
            anyhow::ensure!(rest.len() == 1, "bind requires a socket name");
            let addr = controller::socket_bind(ctrl, rest[0])?;
            Ok(vec![format!("bound {addr}")])
        }
        "version" => Ok(vec![build_info::banner()]),
        "shutdown" => {
            anyhow::ensure!(rest.is_empty(), "shutdown takes no argument");
            controller::shutdown_signal(ctrl).request();
            Ok(vec![])
        }
        "reload_config" => {
            anyhow::ensure!(rest.is_empty(), "reload_config takes no argument");
            config::reload(ctrl).await?;
            Ok(vec![])
        }
        other => anyhow::bail!("unknown command verb: {other}"),
    }
}

fn selected_views(
    ctrl: &Ctrl,
    rest: &[&str],
) -> anyhow::Result<Vec<crate::cfk::service::ServiceView>> {
    if rest.is_empty() {
        return Ok(controller::service_views(ctrl));
    }
    let services = controller::services_from_selector(ctrl, rest)?;
    Ok(services.into_iter().map(|h| h.view()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfk::controller::Controller;
    use crate::cfk::logger::LogSink;

    fn test_ctrl() -> Ctrl {
        Controller::new_shared(std::env::temp_dir().join("cfk-cmd-test"), LogSink::start())
    }

    #[test]
    fn bool_spellings() {
        for t in ["1", "true", "on", "enabled", "yes", "ON", "Yes"] {
            assert!(parse_bool(t).unwrap(), "{t}");
        }
        for f in ["0", "false", "off", "disabled", "no"] {
            assert!(!parse_bool(f).unwrap(), "{f}");
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn unquote_strips_matching_pairs_only() {
        assert_eq!(unquote(r#""a b""#), "a b");
        assert_eq!(unquote("'a b'"), "a b");
        assert_eq!(unquote(r#""a b'"#), r#""a b'"#);
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote("\"\""), "");
    }

    #[test]
    fn cmd_value_shell_or_argv() {
        assert_eq!(
            parse_cmd_value("sleep 1").unwrap(),
            CmdSpec::Shell("sleep 1".to_string())
        );
        assert_eq!(
            parse_cmd_value(r#"["/bin/a", "b"]"#).unwrap(),
            CmdSpec::Argv(vec!["/bin/a".into(), "b".into()])
        );
        assert!(parse_cmd_value("[not json").is_err());
        assert!(parse_cmd_value("[]").is_err());
    }

    #[tokio::test]
    async fn void_lines_and_comments() {
        let ctrl = test_ctrl();
        assert!(dispatch(&ctrl, "", true, true).await.unwrap().is_empty());
        assert!(dispatch(&ctrl, "  # just a comment", true, true)
            .await
            .unwrap()
            .is_empty());
        let err = dispatch(&ctrl, "   ", true, false).await.unwrap_err();
        assert!(err.to_string().contains("command is void"));
    }

    #[tokio::test]
    async fn privileges_are_enforced() {
        let ctrl = test_ctrl();
        for line in [
            "service a cmd=sleep 1",
            "socket s host=127.0.0.1",
            "proxy p auto=off",
            "console full=off",
            "logger level=info",
        ] {
            let err = dispatch(&ctrl, line, false, false).await.unwrap_err();
            assert!(
                err.to_string().contains("insufficient privileges"),
                "line {line:?}: {err}"
            );
        }
        // `command` verbs are not configuration mutations.
        dispatch(&ctrl, "command list", false, false).await.unwrap();
    }

    #[tokio::test]
    async fn service_assignment_creates_and_sets() {
        let ctrl = test_ctrl();
        dispatch(&ctrl, "service web cmd=sleep 10 # trailing", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "service web desc=\"my web thing\"", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "service web tags=www,edge", true, false)
            .await
            .unwrap();
        let v = controller::service_handle(&ctrl, "web").unwrap().view();
        assert_eq!(v.cmd_text.as_deref(), Some("sleep 10"));
        assert_eq!(v.desc.as_deref(), Some("my web thing"));
        assert!(v.tags.contains("www"));

        let err = dispatch(&ctrl, "service web nope=1", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid property"));
        let err = dispatch(&ctrl, "service bad.name cmd=x", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid service name"));
    }

    #[tokio::test]
    async fn unknown_verbs_are_rejected() {
        let ctrl = test_ctrl();
        let err = dispatch(&ctrl, "frobnicate all", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown command"));
        let err = dispatch(&ctrl, "command frobnicate", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown command verb"));
    }

    #[tokio::test]
    async fn status_layout_is_tab_separated() {
        let ctrl = test_ctrl();
        dispatch(&ctrl, "service a cmd=sleep 1", true, false)
            .await
            .unwrap();
        let lines = dispatch(&ctrl, "command status service a", true, false)
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
        let cols: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(cols.len(), 8);
        assert_eq!(cols[0], "a");
        assert_eq!(cols[1], "stopped");
        assert_eq!(cols[2], "");
    }

    #[tokio::test]
    async fn desc_layout_is_tab_separated() {
        let ctrl = test_ctrl();
        dispatch(&ctrl, "service a cmd=sleep 1", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "service a tags=x,y", true, false)
            .await
            .unwrap();
        let lines = dispatch(&ctrl, "command desc", true, false).await.unwrap();
        let cols: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(cols.len(), 5);
        assert_eq!(cols[0], "a");
        assert_eq!(cols[1], "x,y");
        assert_eq!(cols[4], "sleep 1");
    }

    #[tokio::test]
    async fn lifecycle_through_dispatcher() {
        let ctrl = test_ctrl();
        dispatch(&ctrl, "service s cmd=[\"/bin/sleep\", \"30\"]", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "service s startwait_secs=0.05", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "command start service s", true, false)
            .await
            .unwrap();
        let err = dispatch(&ctrl, "command start service s", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already up"));
        // `up` is the idempotent variant.
        dispatch(&ctrl, "command up service s", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "command stop service s", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "command down service s", true, false)
            .await
            .unwrap();
        let lines = dispatch(&ctrl, "command pids service s", true, false)
            .await
            .unwrap();
        assert_eq!(lines[0], "s\t");
        dispatch(&ctrl, "command destroy service s", true, false)
            .await
            .unwrap();
        assert!(controller::service_handle(&ctrl, "s").is_none());
    }

    #[tokio::test]
    async fn bind_and_proxystatus() {
        let ctrl = test_ctrl();
        dispatch(&ctrl, "socket web host=127.0.0.1", true, false)
            .await
            .unwrap();
        dispatch(&ctrl, "socket web service=0", true, false)
            .await
            .unwrap();
        let lines = dispatch(&ctrl, "command bind web", true, false)
            .await
            .unwrap();
        assert!(lines[0].starts_with("bound 127.0.0.1:"));
        let err = dispatch(&ctrl, "command bind web", true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already bound"));

        dispatch(&ctrl, "proxy p auto=off", true, false).await.unwrap();
        let lines = dispatch(&ctrl, "command proxystatus", true, false)
            .await
            .unwrap();
        assert_eq!(lines, vec!["p\tdown\t".to_string()]);
    }

    #[tokio::test]
    async fn version_reports_banner() {
        let ctrl = test_ctrl();
        let lines = dispatch(&ctrl, "command version", true, false)
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("controlfreak"));
    }

    #[tokio::test]
    async fn shutdown_requests_the_latch() {
        let ctrl = test_ctrl();
        dispatch(&ctrl, "command shutdown", true, false)
            .await
            .unwrap();
        assert!(controller::shutdown_signal(&ctrl).is_requested());
    }
}
