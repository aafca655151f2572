//! RFC 1928 message framing, no-auth method only (§4.3, §6.2).

use peer::Peer;

pub const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const REPLY_SUCCESS: u8 = 0x00;

/// Length of the client's no-auth greeting: `05 01 00`.
pub const GREETING_LEN: usize = 3;
/// Length of the server's method-selection reply: `05 00`.
pub const METHOD_SELECTION_LEN: usize = 2;
/// Length of a CONNECT request for an IPv4 target.
pub const CONNECT_REQUEST_LEN: usize = 10;
/// Length of the server's CONNECT reply for an IPv4 bound address.
pub const CONNECT_REPLY_LEN: usize = 10;

pub fn encode_greeting() -> [u8; GREETING_LEN] {
    [VERSION, 0x01, METHOD_NO_AUTH]
}

/// Validates a method-selection reply. `Ok(())` only if the server
/// accepted the no-auth method we offered.
pub fn parse_method_selection(buf: &[u8]) -> Result<(), String> {
    debug_assert_eq!(buf.len(), METHOD_SELECTION_LEN);
    if buf[0] != VERSION {
        return Err(format!("unexpected socks version {:#x}", buf[0]));
    }
    if buf[1] != METHOD_NO_AUTH {
        return Err(format!("server rejected no-auth method (selected {:#x})", buf[1]));
    }
    Ok(())
}

pub fn encode_connect_request(target: Peer) -> [u8; CONNECT_REQUEST_LEN] {
    let mut buf = [0u8; CONNECT_REQUEST_LEN];
    buf[0] = VERSION;
    buf[1] = CMD_CONNECT;
    buf[2] = 0x00; // reserved
    buf[3] = ATYP_IPV4;
    buf[4..8].copy_from_slice(&target.ip().octets());
    buf[8..10].copy_from_slice(&target.port().to_be_bytes());
    buf
}

/// Validates a CONNECT reply. `Ok(())` only if the proxy reports
/// success; any other reply code (or a non-IPv4 bound-address type) is
/// a `ProxyError` per §4.3.
pub fn parse_connect_reply(buf: &[u8]) -> Result<(), String> {
    debug_assert_eq!(buf.len(), CONNECT_REPLY_LEN);
    if buf[0] != VERSION {
        return Err(format!("unexpected socks version {:#x}", buf[0]));
    }
    if buf[1] != REPLY_SUCCESS {
        return Err(format!("socks5 connect failed, reply code {:#x}", buf[1]));
    }
    if buf[3] != ATYP_IPV4 {
        return Err(format!("unexpected address type {:#x} in connect reply", buf[3]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_matches_wire_format() {
        assert_eq!(encode_greeting(), [0x05, 0x01, 0x00]);
    }

    #[test]
    fn accepts_successful_method_selection() {
        assert!(parse_method_selection(&[0x05, 0x00]).is_ok());
    }

    #[test]
    fn rejects_auth_required_method_selection() {
        assert!(parse_method_selection(&[0x05, 0x02]).is_err());
    }

    #[test]
    fn connect_request_encodes_ip_and_port_big_endian() {
        let target: Peer = "10.1.2.3:8080".parse().unwrap();
        let req = encode_connect_request(target);
        assert_eq!(req, [0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3, 0x1f, 0x90]);
    }

    #[test]
    fn accepts_successful_connect_reply() {
        let reply = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert!(parse_connect_reply(&reply).is_ok());
    }

    #[test]
    fn rejects_failed_connect_reply() {
        let reply = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert!(parse_connect_reply(&reply).is_err());
    }
}
