use crate::cfk::logger::LogSink;
use crate::cfk::proxy::{self, ProxyHandle, ProxyView};
use crate::cfk::service::{self, ServiceHandle, ServiceView};
use crate::cfk::socket::SocketRecord;
use std::collections::HashMap;
use std::os::unix::io::{OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Process-wide shutdown latch. Signals and the `shutdown` admin command both
/// land here; the daemon main loop waits on it.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    notify: Notify,
    requested: AtomicBool,
}

impl ShutdownSignal {
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            // Created-before-check so a request between the check and the
            // await still wakes us.
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Admin endpoint settings, mutated by `console <attr>=<value>` before the
/// endpoint starts.
#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    /// `unix:/path`, `/path`, or `host:port`. None means `<home>/sock`.
    pub listen: Option<String>,
    /// Full endpoints dispatch with privileges.
    pub full: bool,
    pub started: bool,
}

impl ConsoleSettings {
    fn new() -> ConsoleSettings {
        ConsoleSettings {
            listen: None,
            full: true,
            started: false,
        }
    }
}

/// The singleton owning every registry. Always used behind `Ctrl`; lock, copy
/// out what you need, and drop the guard before any await.
pub struct Controller {
    pub home: PathBuf,
    pub base: Option<String>,
    pub config_path: Option<PathBuf>,
    pub sink: LogSink,
    pub console: ConsoleSettings,
    pub shutdown: ShutdownSignal,
    services: HashMap<String, ServiceHandle>,
    proxies: HashMap<String, ProxyHandle>,
    sockets: HashMap<String, SocketRecord>,
}

pub type Ctrl = Arc<Mutex<Controller>>;

impl Controller {
    pub fn new_shared(home: PathBuf, sink: LogSink) -> Ctrl {
        Arc::new(Mutex::new(Controller {
            home,
            base: None,
            config_path: None,
            sink,
            console: ConsoleSettings::new(),
            shutdown: ShutdownSignal::default(),
            services: HashMap::new(),
            proxies: HashMap::new(),
            sockets: HashMap::new(),
        }))
    }
}

fn lock(ctrl: &Ctrl) -> std::sync::MutexGuard<'_, Controller> {
    ctrl.lock().unwrap_or_else(|p| p.into_inner())
}

/// Service, socket and proxy names: alphanumeric plus `_` and `-`, and never
/// the bare `-` (it means "no name" in the proxy log pipe).
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "-"
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn home(ctrl: &Ctrl) -> PathBuf {
    lock(ctrl).home.clone()
}

pub fn sink(ctrl: &Ctrl) -> LogSink {
    lock(ctrl).sink.clone()
}

pub fn shutdown_signal(ctrl: &Ctrl) -> ShutdownSignal {
    lock(ctrl).shutdown.clone()
}

pub fn service_handle(ctrl: &Ctrl, name: &str) -> Option<ServiceHandle> {
    lock(ctrl).services.get(name).cloned()
}

pub fn proxy_handle(ctrl: &Ctrl, name: &str) -> Option<ProxyHandle> {
    lock(ctrl).proxies.get(name).cloned()
}

/// First mention of a service name creates it (in `stopped`). The lock spans
/// check and insert so concurrent admin connections cannot double-create.
pub fn find_or_create_service(ctrl: &Ctrl, name: &str) -> anyhow::Result<ServiceHandle> {
    anyhow::ensure!(valid_name(name), "invalid service name: {name}");
    let mut st = lock(ctrl);
    if let Some(h) = st.services.get(name) {
        return Ok(h.clone());
    }
    let h = service::spawn_service(name, Arc::clone(ctrl), st.sink.clone());
    st.services.insert(name.to_string(), h.clone());
    Ok(h)
}

pub fn find_or_create_proxy(ctrl: &Ctrl, name: &str) -> anyhow::Result<ProxyHandle> {
    anyhow::ensure!(valid_name(name), "invalid proxy name: {name}");
    let mut st = lock(ctrl);
    if let Some(h) = st.proxies.get(name) {
        return Ok(h.clone());
    }
    let h = proxy::spawn_proxy(name, Arc::clone(ctrl), st.sink.clone());
    st.proxies.insert(name.to_string(), h.clone());
    Ok(h)
}

/// Attach a (freshly created if needed) service to a proxy.
pub async fn attach_service_to_proxy(
    ctrl: &Ctrl,
    proxy_name: &str,
    service_name: &str,
) -> anyhow::Result<ServiceHandle> {
    let proxy = find_or_create_proxy(ctrl, proxy_name)?;
    let svc = find_or_create_service(ctrl, service_name)?;
    svc.set_proxy(Some(proxy_name.to_string())).await?;
    proxy.add_service(service_name).await?;
    Ok(svc)
}

/// Remove a service from the registry. The caller must have driven it down
/// (ServiceHandle::destroy errors otherwise).
pub async fn destroy_service(ctrl: &Ctrl, name: &str) -> anyhow::Result<()> {
    let Some(h) = service_handle(ctrl, name) else {
        anyhow::bail!("unknown service: {name}");
    };
    let proxy_name = h.view().proxy;
    h.destroy().await?;
    lock(ctrl).services.remove(name);
    if let Some(p) = proxy_name.as_deref().and_then(|p| proxy_handle(ctrl, p)) {
        let _ = p.remove_service(name).await;
    }
    Ok(())
}

pub fn service_views(ctrl: &Ctrl) -> Vec<ServiceView> {
    let mut v: Vec<ServiceView> = lock(ctrl).services.values().map(|h| h.view()).collect();
    v.sort_by(|a, b| a.name.cmp(&b.name));
    v
}

pub fn proxy_views(ctrl: &Ctrl) -> Vec<ProxyView> {
    let mut v: Vec<ProxyView> = lock(ctrl).proxies.values().map(|h| h.view()).collect();
    v.sort_by(|a, b| a.name.cmp(&b.name));
    v
}

/// The proxy column of `status`/`desc`: the proxy name, with a trailing `!`
/// when the proxy is not running. Empty when the service has no proxy.
pub fn proxy_as_text(ctrl: &Ctrl, view: &ServiceView) -> String {
    match view.proxy.as_deref() {
        None => String::new(),
        Some(p) => match proxy_handle(ctrl, p) {
            Some(h) if h.is_up() => p.to_string(),
            _ => format!("{p}!"),
        },
    }
}

/// Resolve a `<selector>`: `service <name>`, `tag <tag>`, or `all`.
pub fn services_from_selector(ctrl: &Ctrl, args: &[&str]) -> anyhow::Result<Vec<ServiceHandle>> {
    match args {
        ["all"] => {
            let st = lock(ctrl);
            let mut v: Vec<(String, ServiceHandle)> = st
                .services
                .iter()
                .map(|(n, h)| (n.clone(), h.clone()))
                .collect();
            drop(st);
            v.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(v.into_iter().map(|(_, h)| h).collect())
        }
        ["all", ..] => anyhow::bail!("selector all takes no argument"),
        ["service", name] => match service_handle(ctrl, name) {
            Some(h) => Ok(vec![h]),
            None => anyhow::bail!("unknown service: {name}"),
        },
        ["service"] => anyhow::bail!("selector service requires a name"),
        ["service", ..] => anyhow::bail!("selector service takes exactly one name"),
        ["tag", tag] => {
            let st = lock(ctrl);
            let mut v: Vec<(String, ServiceHandle)> = st
                .services
                .iter()
                .filter(|(_, h)| h.view().tags.contains(*tag))
                .map(|(n, h)| (n.clone(), h.clone()))
                .collect();
            drop(st);
            v.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(v.into_iter().map(|(_, h)| h).collect())
        }
        ["tag"] => anyhow::bail!("selector tag requires a tag"),
        ["tag", ..] => anyhow::bail!("selector tag takes exactly one tag"),
        [] => anyhow::bail!("missing selector (service <name>, tag <tag>, or all)"),
        [other, ..] => anyhow::bail!("unknown selector: {other}"),
    }
}

// ---- socket registry access ----

pub fn find_or_create_socket(ctrl: &Ctrl, name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(valid_name(name), "invalid socket name: {name}");
    let mut st = lock(ctrl);
    st.sockets
        .entry(name.to_string())
        .or_insert_with(|| SocketRecord::new(name));
    Ok(())
}

pub fn socket_set_attr(ctrl: &Ctrl, name: &str, attr: &str, value: &str) -> anyhow::Result<()> {
    find_or_create_socket(ctrl, name)?;
    let mut st = lock(ctrl);
    let rec = st
        .sockets
        .get_mut(name)
        .ok_or_else(|| anyhow::anyhow!("unknown socket: {name}"))?;
    rec.set_attr(attr, value)
}

pub fn socket_bind(ctrl: &Ctrl, name: &str) -> anyhow::Result<String> {
    let mut st = lock(ctrl);
    let rec = st
        .sockets
        .get_mut(name)
        .ok_or_else(|| anyhow::anyhow!("unknown socket: {name}"))?;
    rec.bind()
}

pub fn socket_dup_for_child(ctrl: &Ctrl, name: &str) -> anyhow::Result<OwnedFd> {
    let st = lock(ctrl);
    let rec = st
        .sockets
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("unknown socket: {name}"))?;
    rec.dup_for_child()
}

/// Name and raw descriptor of every bound socket (for proxy inheritance).
pub fn bound_socket_fds(ctrl: &Ctrl) -> Vec<(String, RawFd)> {
    let st = lock(ctrl);
    let mut v: Vec<(String, RawFd)> = st
        .sockets
        .iter()
        .filter_map(|(n, r)| r.raw_fd().map(|fd| (n.clone(), fd)))
        .collect();
    v.sort();
    v
}

/// Stop everything in order: services, then proxies, then sockets. Services
/// in one wave so a slow stopwait on one does not serialize the rest.
pub async fn shutdown_all(ctrl: &Ctrl) {
    use crate::cfk::asyncutil::tasks;

    let sink = sink(ctrl);
    sink.event("shutdown", None, "begin");

    let services: Vec<ServiceHandle> = lock(ctrl).services.values().cloned().collect();
    let mut joins = Vec::new();
    for h in services {
        joins.push(tasks().spawn(async move { h.shutdown().await }));
    }
    for j in joins {
        let _ = j.await;
    }

    let proxies: Vec<ProxyHandle> = lock(ctrl).proxies.values().cloned().collect();
    let mut joins = Vec::new();
    for p in proxies {
        joins.push(tasks().spawn(async move { p.shutdown().await }));
    }
    for j in joins {
        let _ = j.await;
    }

    {
        let mut st = lock(ctrl);
        st.services.clear();
        st.proxies.clear();
        for rec in st.sockets.values_mut() {
            rec.unbind();
        }
        st.sockets.clear();
    }
    sink.event("shutdown", None, "done");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctrl() -> Ctrl {
        Controller::new_shared(std::env::temp_dir().join("cfk-ctrl-test"), LogSink::start())
    }

    #[test]
    fn name_validation() {
        assert!(valid_name("web-1_a"));
        assert!(!valid_name("-"));
        assert!(!valid_name(""));
        assert!(!valid_name("has space"));
        assert!(!valid_name("dots.bad"));
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let ctrl = test_ctrl();
        find_or_create_service(&ctrl, "a").unwrap();
        find_or_create_service(&ctrl, "a").unwrap();
        assert_eq!(service_views(&ctrl).len(), 1);
        assert!(find_or_create_service(&ctrl, "-").is_err());
    }

    #[tokio::test]
    async fn selector_resolution_and_errors() {
        let ctrl = test_ctrl();
        let a = find_or_create_service(&ctrl, "a").unwrap();
        find_or_create_service(&ctrl, "b").unwrap();
        a.set_attr("tags", "web").await.unwrap();

        assert_eq!(services_from_selector(&ctrl, &["all"]).unwrap().len(), 2);
        assert_eq!(
            services_from_selector(&ctrl, &["service", "a"]).unwrap().len(),
            1
        );
        assert_eq!(
            services_from_selector(&ctrl, &["tag", "web"]).unwrap().len(),
            1
        );
        assert_eq!(services_from_selector(&ctrl, &["tag", "nope"]).unwrap().len(), 0);

        for bad in [
            vec!["service"],
            vec!["service", "a", "b"],
            vec!["tag"],
            vec!["frobnicate", "x"],
            vec![],
        ] {
            assert!(services_from_selector(&ctrl, &bad).is_err(), "args {bad:?}");
        }
        let err = services_from_selector(&ctrl, &["service", "zz"])
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown service"), "err: {err}");
    }

    #[tokio::test]
    async fn attach_binds_service_and_proxy() {
        let ctrl = test_ctrl();
        let svc = attach_service_to_proxy(&ctrl, "p", "s").await.unwrap();
        assert_eq!(svc.view().proxy.as_deref(), Some("p"));
        let pv = proxy_views(&ctrl);
        assert_eq!(pv.len(), 1);
        assert!(pv[0].services.contains("s"));
        // Proxy is down, so the status column flags it.
        assert_eq!(proxy_as_text(&ctrl, &svc.view()), "p!");
    }

    #[tokio::test]
    async fn destroy_removes_from_registry() {
        let ctrl = test_ctrl();
        find_or_create_service(&ctrl, "gone").unwrap();
        destroy_service(&ctrl, "gone").await.unwrap();
        assert!(service_handle(&ctrl, "gone").is_none());
        assert!(destroy_service(&ctrl, "gone").await.is_err());
    }
}
