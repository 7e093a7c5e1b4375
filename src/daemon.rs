//! RPC client for the privileged network daemon.
//!
//! The daemon performs the actual interface, route and firewall mutations;
//! this client only issues commands and reports results. Framing is
//! length-prefixed JSON:
//! - 4-byte big-endian length prefix
//! - JSON payload (max 1MB)
//!
//! One connection spans one connect or disconnect call burst and is closed
//! on every exit path. A socket that cannot be opened is reported as
//! "daemon unreachable", distinct from a command the daemon rejected.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timeout for a single connect, write or read on the daemon socket.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands issued to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DaemonRequest {
    GetIfindexAndIfaddr,
    AddIface { ifindex: u32, ifaddr: String },
    DeleteIface { ifindex: u32 },
    SetIfaceUp { ifindex: u32 },
    AddNodeRoute {
        node_address: Ipv4Addr,
        gateway: Ipv4Addr,
        metric: u32,
    },
    DeleteNodeRoute {
        node_address: Ipv4Addr,
        gateway: Ipv4Addr,
    },
    AddDefaultRoute { metric: u32, ifindex: u32 },
    AddDnsRule { dns_port: u16 },
    DeleteDnsRule { dns_port: u16 },
    IptablesRuleExists { dns_port: u16 },
    GetNodeAddress,
}

impl DaemonRequest {
    pub fn command(&self) -> &'static str {
        match self {
            DaemonRequest::GetIfindexAndIfaddr => "get_ifindex_and_ifaddr",
            DaemonRequest::AddIface { .. } => "add_iface",
            DaemonRequest::DeleteIface { .. } => "delete_iface",
            DaemonRequest::SetIfaceUp { .. } => "set_iface_up",
            DaemonRequest::AddNodeRoute { .. } => "add_node_route",
            DaemonRequest::DeleteNodeRoute { .. } => "delete_node_route",
            DaemonRequest::AddDefaultRoute { .. } => "add_default_route",
            DaemonRequest::AddDnsRule { .. } => "add_dns_rule",
            DaemonRequest::DeleteDnsRule { .. } => "delete_dns_rule",
            DaemonRequest::IptablesRuleExists { .. } => "iptables_rule_exists",
            DaemonRequest::GetNodeAddress => "get_node_address",
        }
    }
}

/// Command-specific results from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DaemonResponse {
    Done,
    IfaceState {
        ifindex: Option<u32>,
        ifaddr: Option<String>,
    },
    Exists { exists: bool },
    Address { address: Option<Ipv4Addr> },
    Error { message: String },
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Daemon unreachable at {addr}: {source}")]
    Unreachable { addr: String, source: io::Error },
    #[error("Daemon rejected {command}: {message}")]
    Rejected {
        command: &'static str,
        message: String,
    },
    #[error("Daemon protocol error: {0}")]
    Protocol(#[from] io::Error),
    #[error("Unexpected daemon response to {command}")]
    UnexpectedResponse { command: &'static str },
}

/// Read a length-prefixed JSON message from an async reader
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON parse error: {}", e),
        )
    })
}

/// Write a length-prefixed JSON message to an async writer
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON serialize error: {}", e),
        )
    })?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Message too large: {} bytes (max {})",
                json.len(),
                MAX_MESSAGE_SIZE
            ),
        ));
    }

    let len_buf = (json.len() as u32).to_be_bytes();
    writer.write_all(&len_buf).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

/// Request/response client over the daemon's loopback socket.
pub struct DaemonClient {
    stream: TcpStream,
}

impl DaemonClient {
    /// Open the per-call-burst connection to the daemon.
    pub async fn connect(port: u16) -> Result<Self, DaemonError> {
        let addr = format!("127.0.0.1:{port}");
        match timeout(RPC_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                debug!("Connected to daemon at {}", addr);
                Ok(Self { stream })
            }
            Ok(Err(source)) => Err(DaemonError::Unreachable { addr, source }),
            Err(_) => Err(DaemonError::Unreachable {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "Connect timeout"),
            }),
        }
    }

    /// Send one command and wait for its result. A daemon-reported error
    /// becomes `DaemonError::Rejected` and is fatal to the current step.
    pub async fn commit(&mut self, request: DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        let command = request.command();
        debug!("Sending daemon request: {:?}", request);

        match timeout(RPC_TIMEOUT, write_message(&mut self.stream, &request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DaemonError::Protocol(e)),
            Err(_) => {
                return Err(DaemonError::Protocol(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Write timeout",
                )))
            }
        }

        let response: DaemonResponse =
            match timeout(RPC_TIMEOUT, read_message(&mut self.stream)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(DaemonError::Protocol(e)),
                Err(_) => {
                    return Err(DaemonError::Protocol(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "Read timeout",
                    )))
                }
            };
        debug!("Received daemon response: {:?}", response);

        match response {
            DaemonResponse::Error { message } => Err(DaemonError::Rejected { command, message }),
            other => Ok(other),
        }
    }

    async fn commit_done(&mut self, request: DaemonRequest) -> Result<(), DaemonError> {
        let command = request.command();
        match self.commit(request).await? {
            DaemonResponse::Done => Ok(()),
            _ => Err(DaemonError::UnexpectedResponse { command }),
        }
    }

    /// Interface state as the daemon sees it.
    pub async fn iface_state(&mut self) -> Result<(Option<u32>, Option<String>), DaemonError> {
        match self.commit(DaemonRequest::GetIfindexAndIfaddr).await? {
            DaemonResponse::IfaceState { ifindex, ifaddr } => Ok((ifindex, ifaddr)),
            _ => Err(DaemonError::UnexpectedResponse {
                command: "get_ifindex_and_ifaddr",
            }),
        }
    }

    pub async fn add_iface(&mut self, ifindex: u32, ifaddr: &str) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::AddIface {
            ifindex,
            ifaddr: ifaddr.to_string(),
        })
        .await
    }

    pub async fn delete_iface(&mut self, ifindex: u32) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::DeleteIface { ifindex }).await
    }

    pub async fn set_iface_up(&mut self, ifindex: u32) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::SetIfaceUp { ifindex }).await
    }

    /// Host route to the exit node via the original gateway, so traffic to
    /// the node itself never enters the tunnel.
    pub async fn add_node_route(
        &mut self,
        node_address: Ipv4Addr,
        gateway: Ipv4Addr,
        metric: u32,
    ) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::AddNodeRoute {
            node_address,
            gateway,
            metric,
        })
        .await
    }

    pub async fn delete_node_route(
        &mut self,
        node_address: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::DeleteNodeRoute {
            node_address,
            gateway,
        })
        .await
    }

    pub async fn add_default_route(&mut self, metric: u32, ifindex: u32) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::AddDefaultRoute { metric, ifindex })
            .await
    }

    pub async fn add_dns_rule(&mut self, dns_port: u16) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::AddDnsRule { dns_port }).await
    }

    pub async fn delete_dns_rule(&mut self, dns_port: u16) -> Result<(), DaemonError> {
        self.commit_done(DaemonRequest::DeleteDnsRule { dns_port })
            .await
    }

    pub async fn iptables_rule_exists(&mut self, dns_port: u16) -> Result<bool, DaemonError> {
        match self.commit(DaemonRequest::IptablesRuleExists { dns_port }).await? {
            DaemonResponse::Exists { exists } => Ok(exists),
            _ => Err(DaemonError::UnexpectedResponse {
                command: "iptables_rule_exists",
            }),
        }
    }

    /// Exit-node address recorded by the daemon, if any.
    pub async fn node_address(&mut self) -> Result<Option<Ipv4Addr>, DaemonError> {
        match self.commit(DaemonRequest::GetNodeAddress).await? {
            DaemonResponse::Address { address } => Ok(address),
            _ => Err(DaemonError::UnexpectedResponse {
                command: "get_node_address",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_request_serialization() {
        let req = DaemonRequest::AddIface {
            ifindex: 2,
            ifaddr: "10.0.0.2/24".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("add_iface"));
        assert!(json.contains("10.0.0.2/24"));

        let parsed: DaemonRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_command_names_match_wire_vocabulary() {
        let requests = [
            DaemonRequest::GetIfindexAndIfaddr,
            DaemonRequest::SetIfaceUp { ifindex: 0 },
            DaemonRequest::IptablesRuleExists { dns_port: 5053 },
            DaemonRequest::GetNodeAddress,
        ];
        for request in requests {
            let json = serde_json::to_string(&request).unwrap();
            assert!(json.contains(request.command()), "{json}");
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = DaemonResponse::Exists { exists: true };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("exists"));

        let resp = DaemonResponse::Error {
            message: "permission denied".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_framing_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let request = DaemonRequest::AddDnsRule { dns_port: 5053 };
        write_message(&mut client, &request).await.unwrap();

        let received: DaemonRequest = read_message(&mut server).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Hand-write a frame claiming an absurd length.
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let result: io::Result<DaemonRequest> = read_message(&mut server).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = DaemonClient::connect(port).await;
        assert!(matches!(result, Err(DaemonError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_commit_against_mock_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: DaemonRequest = read_message(&mut stream).await.unwrap();
            let response = match request {
                DaemonRequest::SetIfaceUp { ifindex: 0 } => DaemonResponse::Done,
                _ => DaemonResponse::Error {
                    message: "unexpected command".to_string(),
                },
            };
            write_message(&mut stream, &response).await.unwrap();
        });

        let mut client = DaemonClient::connect(port).await.unwrap();
        client.set_iface_up(0).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_queries_against_mock_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let request: DaemonRequest = read_message(&mut stream).await.unwrap();
            assert_eq!(request, DaemonRequest::GetIfindexAndIfaddr);
            let response = DaemonResponse::IfaceState {
                ifindex: Some(2),
                ifaddr: Some("10.0.2.2/24".to_string()),
            };
            write_message(&mut stream, &response).await.unwrap();

            let request: DaemonRequest = read_message(&mut stream).await.unwrap();
            assert_eq!(request, DaemonRequest::GetNodeAddress);
            let response = DaemonResponse::Address {
                address: Some("203.0.113.9".parse().unwrap()),
            };
            write_message(&mut stream, &response).await.unwrap();
        });

        let mut client = DaemonClient::connect(port).await.unwrap();

        let (ifindex, ifaddr) = client.iface_state().await.unwrap();
        assert_eq!(ifindex, Some(2));
        assert_eq!(ifaddr.as_deref(), Some("10.0.2.2/24"));

        let address = client.node_address().await.unwrap();
        assert_eq!(address, Some("203.0.113.9".parse().unwrap()));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _: DaemonRequest = read_message(&mut stream).await.unwrap();
            let response = DaemonResponse::Error {
                message: "iptables: permission denied".to_string(),
            };
            write_message(&mut stream, &response).await.unwrap();
        });

        let mut client = DaemonClient::connect(port).await.unwrap();
        let result = client.add_dns_rule(5053).await;
        match result {
            Err(DaemonError::Rejected { command, message }) => {
                assert_eq!(command, "add_dns_rule");
                assert!(message.contains("permission denied"));
            }
            other => panic!("Expected Rejected, got {other:?}"),
        }
        server.await.unwrap();
    }
}
