//! Durable session record for the provisioned tunnel.
//!
//! The session file is the sole source of truth for idempotent
//! connect/disconnect: every field is written as soon as the corresponding
//! provisioning step succeeds, so a crash mid-connect leaves a partial
//! record that the next invocation resumes from or tears down.

use crate::storage::JsonFile;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// The three supervised helper services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    ProxyCore,
    TunAdapter,
    DnsForwarder,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 3] = [
        ServiceRole::ProxyCore,
        ServiceRole::TunAdapter,
        ServiceRole::DnsForwarder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::ProxyCore => "proxy-core",
            ServiceRole::TunAdapter => "tun-adapter",
            ServiceRole::DnsForwarder => "dns-forwarder",
        }
    }
}

/// Durable record of an active (or partially provisioned) tunnel.
///
/// A unit handle is present only while that service is believed running;
/// `ifindex`/`ifaddr` are present only while a tunnel interface has been
/// provisioned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Tunnel device ordinal (`tun<N>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,
    /// Tunnel interface address in CIDR notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifaddr: Option<String>,
    /// Resolved address of the chosen exit node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_address: Option<Ipv4Addr>,
    /// Gateway of the pre-existing default route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_gateway_address: Option<Ipv4Addr>,
    /// Metric the tunnel default route was installed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_gateway_metric: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_core: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun_adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_forwarder: Option<String>,
}

impl JsonFile for Session {
    const FILE_NAME: &'static str = "session.json";
}

impl Session {
    /// Supervisor unit handle recorded for a service role.
    pub fn unit(&self, role: ServiceRole) -> Option<&str> {
        match role {
            ServiceRole::ProxyCore => self.proxy_core.as_deref(),
            ServiceRole::TunAdapter => self.tun_adapter.as_deref(),
            ServiceRole::DnsForwarder => self.dns_forwarder.as_deref(),
        }
    }

    pub fn set_unit(&mut self, role: ServiceRole, unit: Option<String>) {
        match role {
            ServiceRole::ProxyCore => self.proxy_core = unit,
            ServiceRole::TunAdapter => self.tun_adapter = unit,
            ServiceRole::DnsForwarder => self.dns_forwarder = unit,
        }
    }

    /// True when no provisioning step has been recorded at all.
    pub fn is_empty(&self) -> bool {
        *self == Session::default()
    }

    /// Forget the interface, node and gateway facts after teardown.
    pub fn clear_network(&mut self) {
        self.ifindex = None;
        self.ifaddr = None;
        self.node_address = None;
        self.default_gateway_address = None;
        self.default_gateway_metric = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_session() {
        let session = Session::default();
        assert!(session.is_empty());
        for role in ServiceRole::ALL {
            assert!(session.unit(role).is_none());
        }
    }

    #[test]
    fn test_set_and_get_unit() {
        let mut session = Session::default();
        session.set_unit(ServiceRole::ProxyCore, Some("run-u100.service".into()));

        assert_eq!(session.unit(ServiceRole::ProxyCore), Some("run-u100.service"));
        assert_eq!(session.unit(ServiceRole::TunAdapter), None);
        assert!(!session.is_empty());
    }

    #[test]
    fn test_clear_network_keeps_units() {
        let mut session = Session {
            ifindex: Some(2),
            ifaddr: Some("10.0.0.2/24".into()),
            node_address: Some("203.0.113.7".parse().unwrap()),
            default_gateway_address: Some("192.168.1.1".parse().unwrap()),
            default_gateway_metric: Some(99),
            dns_forwarder: Some("run-u7.service".into()),
            ..Session::default()
        };

        session.clear_network();

        assert!(session.ifindex.is_none());
        assert!(session.ifaddr.is_none());
        assert!(session.node_address.is_none());
        assert!(session.default_gateway_address.is_none());
        assert!(session.default_gateway_metric.is_none());
        assert_eq!(session.unit(ServiceRole::DnsForwarder), Some("run-u7.service"));
    }

    #[test]
    fn test_partial_record_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        let mut session = Session::default();
        session.ifindex = Some(1);
        session.ifaddr = Some("10.0.1.2/24".into());
        session.save_to(&path).unwrap();

        let loaded = Session::load_from(&path).unwrap();
        assert_eq!(loaded.ifindex, Some(1));
        assert_eq!(loaded.ifaddr.as_deref(), Some("10.0.1.2/24"));
        assert!(loaded.node_address.is_none());
    }

    #[test]
    fn test_absent_fields_not_serialized() {
        let mut session = Session::default();
        session.ifindex = Some(0);

        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("ifindex"));
        assert!(!json.contains("proxy_core"));
        assert!(!json.contains("node_address"));
    }

    #[test]
    fn test_role_names() {
        assert_eq!(ServiceRole::ProxyCore.as_str(), "proxy-core");
        assert_eq!(ServiceRole::TunAdapter.as_str(), "tun-adapter");
        assert_eq!(ServiceRole::DnsForwarder.as_str(), "dns-forwarder");
    }
}
