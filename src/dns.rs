//! Minimal DNS client used to verify the local forwarder.
//!
//! Sends a single A-record query over UDP and parses the first answer.
//! This is how connect confirms that DNS-leak protection is actually in
//! place before declaring success.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Build a minimal DNS A record query packet
pub fn build_query(hostname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    // Transaction ID (random-ish)
    let id: u16 = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        & 0xFFFF) as u16;
    packet.extend_from_slice(&id.to_be_bytes());

    // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);

    // QDCOUNT = 1 (one question)
    packet.extend_from_slice(&[0x00, 0x01]);

    // ANCOUNT, NSCOUNT, ARCOUNT = 0
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    // Question section: hostname as DNS labels
    for label in hostname.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);

    // QTYPE = A, QCLASS = IN
    packet.extend_from_slice(&[0x00, 0x01]);
    packet.extend_from_slice(&[0x00, 0x01]);

    packet
}

/// Send an A query for `hostname` to `server` and parse the response.
pub fn query_a(
    hostname: &str,
    server: SocketAddr,
    read_timeout: Duration,
) -> Result<Ipv4Addr, String> {
    let query = build_query(hostname);

    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| format!("bind failed: {}", e))?;
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| format!("set timeout failed: {}", e))?;

    socket
        .send_to(&query, server)
        .map_err(|e| format!("send failed: {}", e))?;

    let mut response = [0u8; 512];
    let (len, _) = socket
        .recv_from(&mut response)
        .map_err(|e| format!("recv failed: {}", e))?;

    parse_a_response(&response[..len])
}

/// Parse the first A answer out of a DNS response.
fn parse_a_response(response: &[u8]) -> Result<Ipv4Addr, String> {
    let len = response.len();
    if len < 12 {
        return Err("response too short".to_string());
    }

    // RCODE in lower 4 bits of byte 3
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(format!("DNS error code: {}", rcode));
    }

    let ancount = u16::from_be_bytes([response[6], response[7]]);
    if ancount == 0 {
        return Err("no answers in response".to_string());
    }

    // Skip question name (labels or a compression pointer)
    let mut pos = 12;
    while pos < len {
        let byte = response[pos];
        if byte == 0 {
            pos += 1;
            break;
        } else if byte & 0xC0 == 0xC0 {
            if pos + 1 >= len {
                return Err("truncated pointer in question".to_string());
            }
            pos += 2;
            break;
        } else {
            let label_len = byte as usize;
            if pos + 1 + label_len > len {
                return Err("truncated label in question".to_string());
            }
            pos += 1 + label_len;
        }
    }

    // Skip QTYPE (2) and QCLASS (2)
    if pos + 4 > len {
        return Err("question section truncated".to_string());
    }
    pos += 4;

    // Skip answer name (might be pointer)
    while pos < len {
        let byte = response[pos];
        if byte == 0 {
            pos += 1;
            break;
        } else if byte & 0xC0 == 0xC0 {
            if pos + 1 >= len {
                return Err("truncated pointer in answer".to_string());
            }
            pos += 2;
            break;
        } else {
            let label_len = byte as usize;
            if pos + 1 + label_len > len {
                return Err("truncated label in answer".to_string());
            }
            pos += 1 + label_len;
        }
    }

    // TYPE(2) + CLASS(2) + TTL(4) + RDLENGTH(2)
    if pos + 10 > len {
        return Err("answer section truncated".to_string());
    }

    let atype = u16::from_be_bytes([response[pos], response[pos + 1]]);
    pos += 2;

    // Skip CLASS and TTL
    pos += 6;

    let rdlength = u16::from_be_bytes([response[pos], response[pos + 1]]) as usize;
    pos += 2;

    if atype == 1 && rdlength == 4 {
        if pos + 4 > len {
            return Err("A record data truncated".to_string());
        }
        return Ok(Ipv4Addr::new(
            response[pos],
            response[pos + 1],
            response[pos + 2],
            response[pos + 3],
        ));
    }

    Err(format!(
        "unexpected answer type: {} length: {}",
        atype, rdlength
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query() {
        let query = build_query("example.com");

        assert!(query.len() >= 12, "Query should have at least 12 byte header");

        // Flags at bytes 2-3 should be 0x01 0x00 (standard query, RD=1)
        assert_eq!(query[2], 0x01);
        assert_eq!(query[3], 0x00);

        // QDCOUNT should be 1
        assert_eq!(query[4], 0x00);
        assert_eq!(query[5], 0x01);

        // After 12-byte header: 7, 'e','x','a','m','p','l','e', 3, 'c','o','m', 0
        assert_eq!(query[12], 7);
        assert_eq!(query[20], 3);
    }

    /// Response with one A answer for the question, using a name pointer.
    fn answer_packet(address: [u8; 4]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&[0x12, 0x34]); // id
        packet.extend_from_slice(&[0x81, 0x80]); // response, RD/RA, rcode 0
        packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        packet.extend_from_slice(&[0x00, 0x01]); // ANCOUNT
        packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // NS/AR
        // Question: example.com A IN
        for label in ["example", "com"] {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        // Answer: pointer to offset 12, A IN, TTL 60, RDLENGTH 4
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]);
        packet.extend_from_slice(&[0x00, 0x04]);
        packet.extend_from_slice(&address);
        packet
    }

    #[test]
    fn test_parse_a_response() {
        let packet = answer_packet([203, 0, 113, 9]);
        let address = parse_a_response(&packet).unwrap();
        assert_eq!(address, Ipv4Addr::new(203, 0, 113, 9));
    }

    #[test]
    fn test_parse_error_rcode() {
        let mut packet = answer_packet([203, 0, 113, 9]);
        packet[3] = 0x83; // NXDOMAIN
        assert!(parse_a_response(&packet).unwrap_err().contains("error code: 3"));
    }

    #[test]
    fn test_parse_no_answers() {
        let mut packet = answer_packet([203, 0, 113, 9]);
        packet[7] = 0; // ANCOUNT = 0
        assert!(parse_a_response(&packet).unwrap_err().contains("no answers"));
    }

    #[test]
    fn test_parse_truncated() {
        let packet = answer_packet([203, 0, 113, 9]);
        assert!(parse_a_response(&packet[..20]).is_err());
    }

    #[test]
    fn test_query_against_local_responder() {
        // A scratch UDP socket stands in for the forwarder.
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = responder.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (_, peer) = responder.recv_from(&mut buf).unwrap();
            responder
                .send_to(&answer_packet([198, 51, 100, 7]), peer)
                .unwrap();
        });

        let address = query_a("example.com", server, Duration::from_secs(2)).unwrap();
        assert_eq!(address, Ipv4Addr::new(198, 51, 100, 7));
        handle.join().unwrap();
    }

    #[test]
    fn test_query_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = silent.local_addr().unwrap();

        let result = query_a("example.com", server, Duration::from_millis(100));
        assert!(result.unwrap_err().contains("recv failed"));
    }
}
