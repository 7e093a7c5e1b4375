//! The connect/disconnect/status state machine.
//!
//! Every sub-step of `start` flushes the session record as soon as it
//! succeeds, so a crash or interrupt leaves a partial record that the next
//! `start` resumes from and `stop` can tear down. State is always
//! re-derived from live facts, never from a cached flag.

use crate::daemon::{DaemonClient, DaemonError};
use crate::dns;
use crate::routing::{RouteInspector, RoutingError};
use crate::selector::{self, Node, SelectError, SelectionMode};
use crate::session::{ServiceRole, Session};
use crate::settings::Settings;
use crate::storage::{config_dir, JsonFile, StoreError};
use crate::supervisor::{self, SupervisorError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const PROXY_CORE_BIN: &str = "v2ray";
const TUN_ADAPTER_BIN: &str = "tun2socks";
const DNS_FORWARDER_BIN: &str = "cloudflared";

/// Scratch file the proxy-core configuration is written to on every connect.
const PROXY_CONFIG_FILE: &str = "proxy-config.json";

const DNS_VERIFY_ATTEMPTS: u32 = 30;
const DNS_VERIFY_INTERVAL: Duration = Duration::from_secs(1);

const EXTERNAL_ADDRESS_URL: &str = "https://api.ipify.org/";

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("Could not resolve {host}: {source}")]
    ResolveFailed {
        host: String,
        source: std::io::Error,
    },
    #[error("{host} resolved to {address}; the DNS resolver looks hijacked")]
    DnsHijack { host: String, address: Ipv4Addr },
    #[error("Tunnel established but DNS verification timed out")]
    DnsVerifyTimeout,
    #[error("Failed to write proxy configuration: {0}")]
    ConfigWrite(std::io::Error),
}

/// The individual liveness signals behind `is_active`, surfaced so the
/// front end can report granular status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// At least one supervised helper unit reports active.
    pub service_active: bool,
    /// The recorded address is present on the live tunnel interface.
    pub iface_addr_present: bool,
    /// The tunnel interface is administratively up.
    pub iface_up: bool,
    /// A default route through the tunnel interface exists.
    pub default_route: bool,
    /// The daemon reports the DNS-redirect firewall rule installed.
    pub dns_rule: bool,
    /// The externally-observed address equals the recorded node address.
    pub exit_address_match: bool,
}

impl StatusReport {
    /// Lenient union policy: one positive signal is enough to report
    /// "connected", so benign transient inconsistency does not flap the
    /// status to "disconnected".
    pub fn is_active(&self) -> bool {
        self.service_active
            || self.iface_addr_present
            || self.iface_up
            || self.default_route
            || self.dns_rule
            || self.exit_address_match
    }
}

/// Top-level orchestrator. Holds the only in-memory handle to the session
/// record for this process.
pub struct Connection {
    settings: Settings,
    session: Session,
    session_path: PathBuf,
    config_path: PathBuf,
}

impl Connection {
    /// Load settings and the recorded session from the config directory.
    pub fn open() -> Result<Self, ConnectionError> {
        let settings = Settings::load()?;
        let session = Session::load()?;
        let session_path = Session::path()?;
        let config_path = config_dir()?.join(PROXY_CONFIG_FILE);
        Ok(Self {
            settings,
            session,
            session_path,
            config_path,
        })
    }

    /// Build a connection over explicit paths and settings. Used by tests.
    pub fn with_state(
        settings: Settings,
        session: Session,
        session_path: PathBuf,
        config_path: PathBuf,
    ) -> Self {
        Self {
            settings,
            session,
            session_path,
            config_path,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        self.session.save_to(&self.session_path)?;
        Ok(())
    }

    /// Resolve the exit node's host, rejecting loopback answers: a node
    /// that "resolves" to 127.0.0.1 means the resolver is lying to us.
    fn resolve_node_address(host: &str) -> Result<Ipv4Addr, ConnectionError> {
        let address = if let Ok(literal) = host.parse::<Ipv4Addr>() {
            literal
        } else {
            let addrs = format!("{host}:0")
                .to_socket_addrs()
                .map_err(|source| ConnectionError::ResolveFailed {
                    host: host.to_string(),
                    source,
                })?;
            addrs
                .into_iter()
                .find_map(|a| match a.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .ok_or_else(|| ConnectionError::ResolveFailed {
                    host: host.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no IPv4 address",
                    ),
                })?
        };

        if address.is_loopback() {
            return Err(ConnectionError::DnsHijack {
                host: host.to_string(),
                address,
            });
        }
        Ok(address)
    }

    /// Launch a helper service unless its recorded unit is still active,
    /// and flush the new handle immediately.
    fn ensure_service(
        &mut self,
        role: ServiceRole,
        argv: Vec<String>,
    ) -> Result<(), ConnectionError> {
        if let Some(unit) = self.session.unit(role) {
            if supervisor::is_active(unit) {
                debug!("{} already running as {}", role.as_str(), unit);
                return Ok(());
            }
        }
        let unit = supervisor::run(&argv)?;
        info!("{} running as {}", role.as_str(), unit);
        self.session.set_unit(role, Some(unit));
        self.flush()
    }

    /// Query the local forwarder until it answers the node's hostname with
    /// the node's address. Bounded: gives up after a fixed number of
    /// attempts instead of spinning forever.
    async fn verify_dns(&self, host: &str, expected: Ipv4Addr) -> Result<(), ConnectionError> {
        self.verify_dns_with(host, expected, DNS_VERIFY_ATTEMPTS, DNS_VERIFY_INTERVAL)
            .await
    }

    async fn verify_dns_with(
        &self,
        host: &str,
        expected: Ipv4Addr,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), ConnectionError> {
        let server = SocketAddr::from(([127, 0, 0, 1], self.settings.dns_port));
        for attempt in 1..=attempts {
            match dns::query_a(host, server, interval) {
                Ok(answer) if answer == expected => {
                    info!("DNS-leak protection verified after {} attempt(s)", attempt);
                    return Ok(());
                }
                Ok(answer) => {
                    debug!("Forwarder answered {} for {}, want {}", answer, host, expected)
                }
                Err(e) => debug!("DNS verification attempt {}: {}", attempt, e),
            }
            // Sleep only between attempts; the caller learns about the
            // timeout as soon as the last attempt fails.
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(ConnectionError::DnsVerifyTimeout)
    }

    /// Provision the tunnel end to end. Safe to re-run: completed steps are
    /// detected from the session record and live state, and skipped.
    pub async fn start(
        &mut self,
        nodes: Vec<Node>,
        mode: SelectionMode,
    ) -> Result<(), ConnectionError> {
        let (node, config) =
            selector::probe_and_select(nodes, self.settings.socks_port, mode).await?;
        info!("Selected exit node {} ({} ms)", node.name, node.latency_ms);

        let rendered = serde_json::to_vec_pretty(&config).map_err(StoreError::Parse)?;
        std::fs::write(&self.config_path, rendered).map_err(ConnectionError::ConfigWrite)?;

        let address = Self::resolve_node_address(&node.host)?;
        debug!("{} resolved to {}", node.host, address);

        let (ifindex, ifaddr) = RouteInspector::allocate_interface(
            self.session.ifindex,
            self.session.ifaddr.as_deref(),
        )?;
        let (metric, gateway) = RouteInspector::discover_default_gateway(ifindex)?;
        debug!(
            "Using tun{} {} over gateway {} at metric {}",
            ifindex, ifaddr, gateway, metric
        );

        self.provision(&node.host, address, ifindex, ifaddr, metric, gateway)
            .await
    }

    /// Everything between "facts known" and "connected": the daemon call
    /// burst, helper launches and DNS-leak verification, in strict order.
    /// Nothing is launched and nothing is persisted until the daemon
    /// connection is established.
    async fn provision(
        &mut self,
        host: &str,
        address: Ipv4Addr,
        ifindex: u32,
        ifaddr: String,
        metric: u32,
        gateway: Ipv4Addr,
    ) -> Result<(), ConnectionError> {
        let mut daemon = DaemonClient::connect(self.settings.daemon_port).await?;

        if self.session.node_address != Some(address) {
            // Traffic to the node itself must keep egressing via the
            // original gateway, or the tunnel would loop through itself.
            daemon
                .add_node_route(address, gateway, metric.saturating_sub(1))
                .await?;

            // A proxy core still running under the previous node serves a
            // stale configuration.
            if let Some(unit) = self.session.unit(ServiceRole::ProxyCore) {
                if supervisor::is_active(unit) {
                    supervisor::stop(unit);
                }
                self.session.set_unit(ServiceRole::ProxyCore, None);
            }

            self.session.node_address = Some(address);
            self.session.default_gateway_address = Some(gateway);
            self.session.default_gateway_metric = Some(metric);
            self.flush()?;
        }

        daemon.add_iface(ifindex, &ifaddr).await?;
        self.session.ifindex = Some(ifindex);
        self.session.ifaddr = Some(ifaddr);
        self.flush()?;

        self.ensure_service(
            ServiceRole::TunAdapter,
            vec![
                TUN_ADAPTER_BIN.to_string(),
                "-device".to_string(),
                format!("tun://tun{ifindex}"),
                "-proxy".to_string(),
                format!("socks5://127.0.0.1:{}", self.settings.socks_port),
            ],
        )?;

        daemon.set_iface_up(ifindex).await?;
        daemon.add_default_route(metric, ifindex).await?;

        self.ensure_service(
            ServiceRole::ProxyCore,
            vec![
                PROXY_CORE_BIN.to_string(),
                "-config".to_string(),
                self.config_path.display().to_string(),
            ],
        )?;

        self.ensure_service(
            ServiceRole::DnsForwarder,
            vec![
                DNS_FORWARDER_BIN.to_string(),
                "proxy-dns".to_string(),
                "--port".to_string(),
                self.settings.dns_port.to_string(),
            ],
        )?;

        self.verify_dns(host, address).await?;

        daemon.add_dns_rule(self.settings.dns_port).await?;
        info!("Connected to {} via tun{}", address, ifindex);
        Ok(())
    }

    /// Tear down everything the session records. Individual failures are
    /// logged and skipped so teardown is as thorough as possible.
    pub async fn stop(&mut self) -> Result<(), ConnectionError> {
        // A partial record still obligates daemon cleanup: a crash between
        // the node-route and interface steps leaves a session with a node
        // address but no ifindex, and the installed host route must not
        // outlive it.
        let had_record = !self.session.is_empty();

        for role in ServiceRole::ALL {
            if let Some(unit) = self.session.unit(role) {
                if supervisor::is_active(unit) {
                    supervisor::stop(unit);
                }
            }
            self.session.set_unit(role, None);
        }
        self.flush()?;

        if had_record {
            let mut daemon = DaemonClient::connect(self.settings.daemon_port).await?;

            if let Some(ifindex) = self.session.ifindex {
                if let Err(e) = daemon.delete_iface(ifindex).await {
                    warn!("Could not remove tun{}: {}", ifindex, e);
                }
            }
            if let (Some(node), Some(gateway)) = (
                self.session.node_address,
                self.session.default_gateway_address,
            ) {
                if let Err(e) = daemon.delete_node_route(node, gateway).await {
                    warn!("Could not remove the node host route: {}", e);
                }
            }
            if let Err(e) = daemon.delete_dns_rule(self.settings.dns_port).await {
                warn!("Could not remove the DNS rule: {}", e);
            }
        }

        self.session.clear_network();
        self.flush()?;
        info!("Session torn down");
        Ok(())
    }

    /// Re-derive liveness from independent signals instead of trusting a
    /// cached flag.
    pub async fn status(&self) -> Result<StatusReport, ConnectionError> {
        let mut report = StatusReport::default();

        report.service_active = ServiceRole::ALL
            .iter()
            .any(|&role| self.session.unit(role).is_some_and(supervisor::is_active));

        if self.session.is_empty() {
            return Ok(report);
        }

        if let (Some(ifindex), Some(ifaddr)) =
            (self.session.ifindex, self.session.ifaddr.as_deref())
        {
            report.iface_addr_present = RouteInspector::interface_has_address(ifindex, ifaddr);
            report.iface_up = RouteInspector::interface_is_up(ifindex);
            report.default_route = self.session.node_address.is_some()
                && RouteInspector::default_route_via_tun(ifindex);
        }

        let mut daemon = DaemonClient::connect(self.settings.daemon_port).await?;
        report.dns_rule = daemon.iptables_rule_exists(self.settings.dns_port).await?;

        if let Some(node) = self.session.node_address {
            report.exit_address_match =
                external_address().await.as_deref() == Some(node.to_string().as_str());
        }

        Ok(report)
    }

    pub async fn is_active(&self) -> Result<bool, ConnectionError> {
        Ok(self.status().await?.is_active())
    }
}

/// The host's externally-observed address, `None` when the lookup fails.
pub async fn external_address() -> Option<String> {
    let response = reqwest::get(EXTERNAL_ADDRESS_URL).await.ok()?;
    response.text().await.ok().map(|s| s.trim().to_string())
}
