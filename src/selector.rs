//! Exit-node latency probing and selection.
//!
//! Every candidate is probed concurrently with a single-packet ping; the
//! probes are joined before any selection happens, so the choice is always
//! made over complete results. Unreachable nodes carry the latency
//! sentinel 0 and are filtered out together with noise-floor readings.

use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::io::{BufRead, Write};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("No exit node responded to latency probing")]
    NoReachableNodes,
    #[error("Invalid menu selection: {0}")]
    InvalidSelection(String),
    #[error("Failed to read menu selection: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Lowest measured latency.
    Best,
    /// Uniformly random reachable node.
    Random,
    /// Interactive ranked menu.
    Menu,
}

fn default_node_port() -> u16 {
    443
}

fn default_security() -> String {
    "auto".to_string()
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_network() -> String {
    "ws".to_string()
}

/// An exit-node candidate, reconstructed from the backend node list on
/// every connect and never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub name: String,
    pub host: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(default = "default_security")]
    pub security: String,
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default = "default_network")]
    pub network: String,
    pub user_id: String,
    /// Probe round-trip in whole milliseconds; 0 means unreachable.
    #[serde(skip)]
    pub latency_ms: u32,
}

/// Round-trip time of a single-packet ping against `host`, 0 on any failure.
async fn probe(host: String) -> u32 {
    let output = tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", "1", &host])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            parse_ping_time(&String::from_utf8_lossy(&output.stdout)).unwrap_or(0)
        }
        Ok(_) => 0,
        Err(e) => {
            debug!("Probe of {} failed: {}", host, e);
            0
        }
    }
}

/// Extract the `time=` field from ping output, rounded to whole ms.
fn parse_ping_time(output: &str) -> Option<u32> {
    let rest = &output[output.find("time=")? + 5..];
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(value.round() as u32)
}

/// Probe all candidates concurrently and fill in their latencies.
/// Returns only once every probe has completed.
pub async fn probe_all(nodes: &mut [Node]) {
    let mut probes = JoinSet::new();
    for (index, node) in nodes.iter().enumerate() {
        let host = node.host.clone();
        probes.spawn(async move { (index, probe(host).await) });
    }
    while let Some(result) = probes.join_next().await {
        match result {
            Ok((index, latency_ms)) => nodes[index].latency_ms = latency_ms,
            Err(e) => warn!("Probe task failed: {}", e),
        }
    }
}

/// Drop unreachable and noise-floor candidates, sort ascending by latency.
fn rank(nodes: Vec<Node>) -> Vec<Node> {
    let mut candidates: Vec<Node> = nodes.into_iter().filter(|n| n.latency_ms > 1).collect();
    candidates.sort_by_key(|n| n.latency_ms);
    candidates
}

fn pick(candidates: &[Node], mode: SelectionMode) -> Result<usize, SelectError> {
    match mode {
        SelectionMode::Best => Ok(0),
        SelectionMode::Random => Ok(rand::thread_rng().gen_range(0..candidates.len())),
        SelectionMode::Menu => {
            let stdin = std::io::stdin();
            let mut input = String::new();
            print_menu(&mut std::io::stderr(), candidates)?;
            stdin.lock().read_line(&mut input)?;
            parse_menu_choice(input.trim(), candidates.len())
        }
    }
}

fn print_menu<W: Write>(out: &mut W, candidates: &[Node]) -> std::io::Result<()> {
    let width = candidates.iter().map(|n| n.name.len()).max().unwrap_or(0) + 2;
    for (i, node) in candidates.iter().enumerate() {
        writeln!(out, "{i:>3}  {:<width$}{} ms", node.name, node.latency_ms)?;
    }
    write!(out, "Select a node: ")?;
    out.flush()
}

fn parse_menu_choice(input: &str, len: usize) -> Result<usize, SelectError> {
    match input.parse::<usize>() {
        Ok(index) if index < len => Ok(index),
        _ => Err(SelectError::InvalidSelection(input.to_string())),
    }
}

/// Probe every candidate, pick one per `mode`, and return it together with
/// the filled proxy-core configuration.
pub async fn probe_and_select(
    mut nodes: Vec<Node>,
    socks_port: u16,
    mode: SelectionMode,
) -> Result<(Node, serde_json::Value), SelectError> {
    probe_all(&mut nodes).await;

    let mut candidates = rank(nodes);
    if candidates.is_empty() {
        return Err(SelectError::NoReachableNodes);
    }

    let index = pick(&candidates, mode)?;
    let node = candidates.swap_remove(index);
    let config = proxy_config(&node, socks_port);
    Ok((node, config))
}

/// Proxy-core configuration for the chosen node: one vmess outbound over
/// websocket plus the local SOCKS inbound. Consumed opaquely by the
/// proxy-core executable.
pub fn proxy_config(node: &Node, socks_port: u16) -> serde_json::Value {
    json!({
        "outbounds": [
            {
                "protocol": "vmess",
                "sendThrough": "0.0.0.0",
                "settings": {
                    "vnext": [
                        {
                            "address": node.host,
                            "port": node.port,
                            "users": [
                                {
                                    "alterId": 0,
                                    "id": node.user_id,
                                    "level": 0,
                                    "security": node.security,
                                }
                            ],
                        }
                    ]
                },
                "streamSettings": {
                    "network": node.network,
                    "security": "tls",
                    "sockopt": { "mark": 1 },
                    "tlsSettings": { "allowInsecure": false, "serverName": "" },
                    "wsSettings": {
                        "headers": { "Host": node.host },
                        "path": node.path,
                    },
                },
                "tag": "outBound_PROXY",
            }
        ],
        "inbounds": [
            {
                "protocol": "socks",
                "listen": "127.0.0.1",
                "port": socks_port,
            }
        ],
    })
}
