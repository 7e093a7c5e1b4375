//! Live interface and route inspection via the `ip` tool.
//!
//! Allocates a free `tun<N>` slot and a free private /24 subnet for the
//! tunnel, and discovers the pre-existing default gateway so the tunnel
//! route can be installed with a strictly lower metric. Parsing is kept in
//! pure functions over the captured command output.

use std::net::Ipv4Addr;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Private address blocks scanned for a free tunnel subnet, in priority order.
const PRIVATE_BLOCKS: [(Ipv4Addr, u8); 5] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
];

/// Metric assumed when no default route carries an explicit one.
const FALLBACK_METRIC: u32 = 3;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Failed to run `ip {args}`: {source}")]
    CommandFailed {
        args: String,
        source: std::io::Error,
    },
    #[error("`ip {args}` exited with an error: {stderr}")]
    CommandError { args: String, stderr: String },
    #[error("No free /24 subnet left in the private address blocks")]
    NoFreeSubnet,
    #[error("No default gateway found in the routing table")]
    NoGateway,
}

/// Inspects live network state through the `ip` tool.
pub struct RouteInspector;

impl RouteInspector {
    fn ip_output(args: &[&str]) -> Result<String, RoutingError> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| RoutingError::CommandFailed {
                args: args.join(" "),
                source: e,
            })?;
        if !output.status.success() {
            return Err(RoutingError::CommandError {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Allocate a tunnel interface slot and address.
    ///
    /// A previously-recorded index/address pair is returned unchanged when
    /// it still matches live state, so repeated connects are stable.
    pub fn allocate_interface(
        hint_index: Option<u32>,
        hint_addr: Option<&str>,
    ) -> Result<(u32, String), RoutingError> {
        let output = Self::ip_output(&["address"])?;
        allocate_from_output(&output, hint_index, hint_addr)
    }

    /// Metric and gateway of the best pre-existing default route, excluding
    /// any route already bound to `tun<exclude_index>`. The returned metric
    /// is the live minimum minus one so the tunnel route wins selection.
    pub fn discover_default_gateway(
        exclude_index: u32,
    ) -> Result<(u32, Ipv4Addr), RoutingError> {
        let output = Self::ip_output(&["route"])?;
        gateway_from_output(&output, exclude_index)
    }

    /// Whether `tun<index>` currently carries `addr`. Inspection failures
    /// count as "not present".
    pub fn interface_has_address(index: u32, addr: &str) -> bool {
        let name = format!("tun{index}");
        match Self::ip_output(&["address", "show", &name]) {
            Ok(output) => output_has_cidr(&output, addr),
            Err(e) => {
                debug!("Could not inspect {}: {}", name, e);
                false
            }
        }
    }

    /// Whether `tun<index>` is administratively up.
    pub fn interface_is_up(index: u32) -> bool {
        let name = format!("tun{index}");
        match Self::ip_output(&["link", "show", &name]) {
            Ok(output) => output.contains("state UP"),
            Err(e) => {
                debug!("Could not inspect {}: {}", name, e);
                false
            }
        }
    }

    /// Whether a default route through `tun<index>` is installed.
    pub fn default_route_via_tun(index: u32) -> bool {
        match Self::ip_output(&["route"]) {
            Ok(output) => output_has_default_dev(&output, index),
            Err(e) => {
                debug!("Could not list routes: {}", e);
                false
            }
        }
    }
}

/// One interface section of `ip address` output: name and its IPv4 CIDRs.
fn parse_interfaces(output: &str) -> Vec<(String, Vec<String>)> {
    let mut interfaces: Vec<(String, Vec<String>)> = Vec::new();
    for line in output.lines() {
        if line.starts_with(|c: char| c.is_ascii_digit()) {
            // Section header: "5: tun0: <POINTOPOINT,UP> mtu 1500 ..."
            let mut parts = line.splitn(3, ':');
            let ordinal = parts.next().unwrap_or_default();
            if let (Ok(_), Some(name)) = (ordinal.trim().parse::<u32>(), parts.next()) {
                let name = name.trim().split('@').next().unwrap_or_default();
                interfaces.push((name.to_string(), Vec::new()));
            }
        } else {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("inet ") {
                if let (Some(cidr), Some(section)) =
                    (rest.split_whitespace().next(), interfaces.last_mut())
                {
                    section.1.push(cidr.to_string());
                }
            }
        }
    }
    interfaces
}

/// Ordinals of all live `tun<N>` interfaces.
fn tun_ordinals(output: &str) -> Vec<u32> {
    parse_interfaces(output)
        .iter()
        .filter_map(|(name, _)| name.strip_prefix("tun")?.parse().ok())
        .collect()
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    Some((addr, prefix))
}

fn network_of(addr: Ipv4Addr, prefix: u8) -> u32 {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    u32::from(addr) & mask
}

/// All IPv4 networks currently assigned on the host, as (network, prefix).
fn live_networks(output: &str) -> Vec<(u32, u8)> {
    parse_interfaces(output)
        .iter()
        .flat_map(|(_, cidrs)| cidrs.iter())
        .filter_map(|cidr| {
            let (addr, prefix) = parse_cidr(cidr)?;
            Some((network_of(addr, prefix), prefix))
        })
        .collect()
}

fn ranges_overlap(net_a: u32, prefix_a: u8, net_b: u32, prefix_b: u8) -> bool {
    let shorter = prefix_a.min(prefix_b);
    let mask = if shorter == 0 {
        0
    } else {
        u32::MAX << (32 - shorter)
    };
    (net_a & mask) == (net_b & mask)
}

fn output_has_cidr(output: &str, addr: &str) -> bool {
    parse_interfaces(output)
        .iter()
        .any(|(_, cidrs)| cidrs.iter().any(|c| c == addr))
}

fn output_has_default_dev(output: &str, index: u32) -> bool {
    let name = format!("tun{index}");
    output.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.first() == Some(&"default") && token_after(&tokens, "dev") == Some(name.as_str())
    })
}

fn token_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|&t| t == key)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

/// Pick an interface index and address given `ip address` output.
pub fn allocate_from_output(
    output: &str,
    hint_index: Option<u32>,
    hint_addr: Option<&str>,
) -> Result<(u32, String), RoutingError> {
    if let (Some(index), Some(addr)) = (hint_index, hint_addr) {
        let name = format!("tun{index}");
        let live = parse_interfaces(output);
        let matches = live
            .iter()
            .any(|(n, cidrs)| n == &name && cidrs.iter().any(|c| c == addr));
        if matches {
            debug!("Reusing recorded interface {} {}", name, addr);
            return Ok((index, addr.to_string()));
        }
    }

    let index = tun_ordinals(output).iter().max().map_or(0, |m| m + 1);
    let live = live_networks(output);

    for (block, prefix) in PRIVATE_BLOCKS {
        let base = u32::from(block);
        let subnets = 1u32 << (24 - prefix);
        for i in 0..subnets {
            let net = base + (i << 8);
            let in_use = live
                .iter()
                .any(|&(l_net, l_prefix)| ranges_overlap(net, 24, l_net, l_prefix));
            if !in_use {
                // Second host address of the subnet, the first is left for
                // the daemon to assign as the peer.
                let addr = Ipv4Addr::from(net + 2);
                return Ok((index, format!("{addr}/24")));
            }
        }
    }

    Err(RoutingError::NoFreeSubnet)
}

/// Extract the best default gateway and metric from `ip route` output,
/// ignoring routes bound to `tun<exclude_index>`.
pub fn gateway_from_output(
    output: &str,
    exclude_index: u32,
) -> Result<(u32, Ipv4Addr), RoutingError> {
    let exclude = format!("tun{exclude_index}");
    let mut defaults: Vec<(Option<u32>, Option<Ipv4Addr>)> = Vec::new();

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        if token_after(&tokens, "dev") == Some(exclude.as_str()) {
            continue;
        }
        let metric = token_after(&tokens, "metric").and_then(|m| m.parse().ok());
        let via = token_after(&tokens, "via").and_then(|v| v.parse().ok());
        defaults.push((metric, via));
    }

    let explicit: Vec<u32> = defaults.iter().filter_map(|(m, _)| *m).collect();
    let (metric, gateway) = match explicit.iter().min() {
        Some(&min) => {
            let gateway = defaults
                .iter()
                .find_map(|&(m, via)| if m == Some(min) { via } else { None });
            (min, gateway)
        }
        None => (FALLBACK_METRIC, defaults.iter().find_map(|&(_, via)| via)),
    };

    let gateway = gateway.ok_or(RoutingError::NoGateway)?;
    Ok((metric.saturating_sub(1), gateway))
}
