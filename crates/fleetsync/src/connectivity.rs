//! Connectivity monitoring.
//!
//! A two-state machine fed by periodic reachability probes. State is
//! published on a `watch` channel that the sync engine reads; transitions
//! are edge-triggered so a flapping probe does not start a sync storm.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;

/// Whether the remote store is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No route to the remote store.
    Offline,
    /// The remote store answered the last probe.
    Online,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Signal emitted on a connectivity edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    /// Offline → Online: drain the buffer now.
    SyncNow,
    /// Online → Offline: abandon any in-flight batch.
    Suspend,
}

/// Edge-triggered connectivity tracker.
///
/// Starts `Offline`. Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor in the `Offline` state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectivityState::Offline);
        Self { state }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Feed one probe result. Returns a signal only when the state changes.
    pub fn observe(&self, reachable: bool) -> Option<ConnectivitySignal> {
        let next = if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if !changed {
            return None;
        }
        info!(state = %next, "Connectivity changed");
        Some(match next {
            ConnectivityState::Online => ConnectivitySignal::SyncNow,
            ConnectivityState::Offline => ConnectivitySignal::Suspend,
        })
    }

    /// Probe every `interval` until cancelled, forwarding edge signals.
    ///
    /// A probe that does not answer within `probe_timeout` counts as
    /// unreachable. Returns when `cancel` fires or the signal receiver is gone.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature matches other supervised tasks.
    pub async fn run(
        &self,
        probe: &dyn ConnectivityProbe,
        interval: Duration,
        probe_timeout: Duration,
        signals: &mpsc::Sender<ConnectivitySignal>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let reachable = tokio::time::timeout(probe_timeout, probe.probe())
                .await
                .unwrap_or(false);
            debug!(probe = probe.name(), reachable, "Connectivity probe");

            if let Some(signal) = self.observe(reachable) {
                if signals.send(signal).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// A reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the remote looks reachable right now.
    async fn probe(&self) -> bool;
}

/// Probe that opens a TCP connection to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    /// Probe `address` (`host:port`).
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Derive `host:port` from an `http(s)://` endpoint URL.
    #[must_use]
    pub fn address_for_endpoint(endpoint: &str) -> Option<String> {
        let (scheme, rest) = endpoint.split_once("://")?;
        let default_port = match scheme {
            "https" => 443,
            "http" => 80,
            _ => return None,
        };
        let authority = rest.split(['/', '?', '#']).next()?;
        let host_port = authority.rsplit('@').next()?;
        if host_port.is_empty() {
            return None;
        }
        let has_port = if host_port.starts_with('[') {
            host_port.contains("]:")
        } else {
            host_port.contains(':')
        };
        Some(if has_port {
            host_port.to_string()
        } else {
            format!("{host_port}:{default_port}")
        })
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn probe(&self) -> bool {
        tokio::net::TcpStream::connect(&self.address).await.is_ok()
    }
}

/// Probe that checks the kernel link state of a network interface, e.g. the
/// `ppp0` or `wwan0` interface of a cellular modem.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct InterfaceProbe {
    root: std::path::PathBuf,
    interface: String,
}

#[cfg(target_os = "linux")]
impl InterfaceProbe {
    /// Watch `interface` under `/sys/class/net`.
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_root(fleetsync_linux::NET_ROOT, interface)
    }

    /// Watch `interface` under a custom sysfs root.
    #[must_use]
    pub fn with_root(root: impl Into<std::path::PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            interface: interface.into(),
        }
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl ConnectivityProbe for InterfaceProbe {
    fn name(&self) -> &'static str {
        "interface"
    }

    async fn probe(&self) -> bool {
        fleetsync_linux::interface_is_up(&self.root, &self.interface)
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::ScriptedProbe;
    use super::*;

    #[test]
    fn test_starts_offline() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        assert_eq!(monitor.observe(false), None);
    }

    #[test]
    fn test_edge_triggered_signals() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.observe(true), Some(ConnectivitySignal::SyncNow));
        assert_eq!(monitor.observe(true), None);
        assert_eq!(monitor.observe(true), None);
        assert_eq!(monitor.observe(false), Some(ConnectivitySignal::Suspend));
        assert_eq!(monitor.observe(false), None);
        assert_eq!(monitor.observe(true), Some(ConnectivitySignal::SyncNow));
    }

    #[test]
    fn test_watch_reflects_state() {
        let monitor = ConnectivityMonitor::new();
        let rx = monitor.subscribe();
        monitor.observe(true);
        assert_eq!(*rx.borrow(), ConnectivityState::Online);
        monitor.observe(false);
        assert_eq!(*rx.borrow(), ConnectivityState::Offline);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectivityState::Online.to_string(), "online");
        assert_eq!(ConnectivityState::Offline.to_string(), "offline");
    }

    #[test]
    fn test_address_for_endpoint() {
        assert_eq!(
            TcpProbe::address_for_endpoint("https://ingest.example.com/vehicles/x"),
            Some("ingest.example.com:443".to_string())
        );
        assert_eq!(
            TcpProbe::address_for_endpoint("http://10.0.0.5:8080/ingest"),
            Some("10.0.0.5:8080".to_string())
        );
        assert_eq!(
            TcpProbe::address_for_endpoint("https://user:pw@host.example"),
            Some("host.example:443".to_string())
        );
        assert_eq!(
            TcpProbe::address_for_endpoint("https://[::1]/x"),
            Some("[::1]:443".to_string())
        );
        assert_eq!(TcpProbe::address_for_endpoint("ftp://host"), None);
        assert_eq!(TcpProbe::address_for_endpoint("not a url"), None);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(TcpProbe::new(address.clone()).probe().await);

        drop(listener);
        assert!(!TcpProbe::new(address).probe().await);
    }

    #[tokio::test]
    async fn test_run_forwards_edges_until_cancelled() {
        let monitor = ConnectivityMonitor::new();
        let probe = ScriptedProbe::new([false, true, true, false]);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let run = monitor.run(
            &probe,
            Duration::from_millis(5),
            Duration::from_secs(1),
            &tx,
            &cancel,
        );
        let check = async {
            assert_eq!(rx.recv().await, Some(ConnectivitySignal::SyncNow));
            assert_eq!(rx.recv().await, Some(ConnectivitySignal::Suspend));
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, check);
        assert!(result.is_ok());
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }

    #[derive(Debug)]
    struct HangingProbe;

    #[async_trait]
    impl ConnectivityProbe for HangingProbe {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn probe(&self) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_offline() {
        let monitor = ConnectivityMonitor::new();
        monitor.observe(true);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let run = monitor.run(
            &HangingProbe,
            Duration::from_millis(5),
            Duration::from_millis(20),
            &tx,
            &cancel,
        );
        let check = async {
            assert_eq!(rx.recv().await, Some(ConnectivitySignal::Suspend));
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, check);
        assert!(result.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_interface_probe() {
        let dir = tempfile::tempdir().unwrap();
        let iface = dir.path().join("wwan0");
        std::fs::create_dir_all(&iface).unwrap();
        std::fs::write(iface.join("operstate"), "up\n").unwrap();

        let probe = InterfaceProbe::with_root(dir.path(), "wwan0");
        assert!(probe.probe().await);

        std::fs::write(iface.join("operstate"), "down\n").unwrap();
        assert!(!probe.probe().await);
        assert!(!InterfaceProbe::with_root(dir.path(), "ppp0").probe().await);
    }
}
