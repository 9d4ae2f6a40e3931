//! SOCKS5 wire messages

use super::*;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Method selection request: `{ ver, nmethods, methods[nmethods] }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub ver: u8,
    pub nmethods: u8,
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// The one request this proxy ever sends: NOAUTH only.
    pub fn noauth() -> Self {
        Self {
            ver: SOCKS_VERSION,
            nmethods: 1,
            methods: vec![NO_AUTH],
        }
    }

    /// Parse from a whole buffer. The `nmethods` field is taken at face
    /// value; callers that need an exact-length frame additionally check
    /// `data.len() == 2 + nmethods`.
    pub fn parse(data: &[u8]) -> Result<Self, SocksError> {
        if data.len() < 3 {
            return Err(SocksError::Truncated("method request"));
        }
        Ok(Self {
            ver: data[0],
            nmethods: data[1],
            methods: data[2..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![SOCKS_VERSION, self.nmethods];
        buf.extend_from_slice(&self.methods);
        buf
    }
}

/// Method selection reply: `{ ver, method }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodReply {
    pub ver: u8,
    pub method: u8,
}

impl MethodReply {
    pub fn noauth() -> Self {
        Self {
            ver: SOCKS_VERSION,
            method: NO_AUTH,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SocksError> {
        if data.len() < 2 {
            return Err(SocksError::Truncated("method reply"));
        }
        Ok(Self {
            ver: data[0],
            method: data[1],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![SOCKS_VERSION, self.method]
    }
}

/// Request and reply share one wire shape:
/// `{ ver, cmd_or_rep, rsv, atyp, addr, port }`.
///
/// For domains `addr` keeps the leading length byte, so `encode` can write
/// it back untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub ver: u8,
    pub cmd_or_rep: u8,
    pub rsv: u8,
    pub atyp: u8,
    pub addr: Vec<u8>,
    pub port: u16,
}

pub type Request = Message;
pub type Reply = Message;

impl Message {
    /// Build a reply echoing the request's address, or a bare one when the
    /// request never parsed.
    pub fn reply_to(req: Option<&Request>, rep: u8) -> Reply {
        let mut reply = Self {
            ver: SOCKS_VERSION,
            cmd_or_rep: rep,
            rsv: 0,
            atyp: 0,
            addr: Vec::new(),
            port: 0,
        };
        if let Some(req) = req {
            reply.atyp = req.atyp;
            reply.addr = req.addr.clone();
            reply.port = req.port;
        }
        reply
    }

    pub fn parse(data: &[u8]) -> Result<Self, SocksError> {
        if data.len() < 7 {
            return Err(SocksError::Truncated("message"));
        }

        let atyp = data[3];
        let addr_len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => data[4] as usize + 1,
            other => return Err(SocksError::InvalidAddressType(other)),
        };

        if data.len() < 4 + addr_len + 2 {
            return Err(SocksError::Truncated("message address and port"));
        }

        Ok(Self {
            ver: data[0],
            cmd_or_rep: data[1],
            rsv: data[2],
            atyp,
            addr: data[4..4 + addr_len].to_vec(),
            port: u16::from_be_bytes([data[4 + addr_len], data[4 + addr_len + 1]]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.addr.len());
        buf.push(SOCKS_VERSION);
        buf.push(self.cmd_or_rep);
        buf.push(self.rsv);
        buf.push(self.atyp);
        buf.extend_from_slice(&self.addr);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn domain(&self) -> Option<String> {
        if self.atyp != ATYP_DOMAIN {
            return None;
        }
        Some(String::from_utf8_lossy(&self.addr[1..]).into_owned())
    }

    /// Render `host:port` for the dialer: dotted IPv4, bracketed IPv6, or
    /// the literal domain handed to the resolver.
    pub fn address(&self) -> String {
        let host = match self.atyp {
            ATYP_IPV4 => {
                Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3]).to_string()
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.addr);
                format!("[{}]", Ipv6Addr::from(octets))
            }
            _ => self.domain().unwrap_or_default(),
        };
        format!("{}:{}", host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_request_roundtrip() {
        let request = MethodRequest::noauth();
        let encoded = request.encode();
        assert_eq!(encoded, vec![0x05, 0x01, 0x00]);

        let parsed = MethodRequest::parse(&encoded).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(encoded.len(), 2 + parsed.nmethods as usize);
    }

    #[test]
    fn test_method_request_too_short() {
        assert!(matches!(
            MethodRequest::parse(&[0x05, 0x01]),
            Err(SocksError::Truncated(_))
        ));
    }

    #[test]
    fn test_connect_request_ipv4() {
        // CONNECT 127.0.0.1:80
        let data = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let req = Message::parse(&data).unwrap();

        assert_eq!(req.cmd_or_rep, CMD_CONNECT);
        assert_eq!(req.atyp, ATYP_IPV4);
        assert_eq!(req.port, 80);
        assert_eq!(req.address(), "127.0.0.1:80");
        assert_eq!(req.encode(), data);
    }

    #[test]
    fn test_connect_request_domain() {
        let mut data = vec![0x05, 0x01, 0x00, 0x03, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());

        let req = Message::parse(&data).unwrap();
        assert_eq!(req.domain().as_deref(), Some("example.com"));
        assert_eq!(req.address(), "example.com:443");
        assert_eq!(req.encode(), data);
    }

    #[test]
    fn test_connect_request_ipv6_brackets() {
        let mut data = vec![0x05, 0x01, 0x00, 0x04];
        data.extend_from_slice(&[0; 15]);
        data.push(1); // ::1
        data.extend_from_slice(&8080u16.to_be_bytes());

        let req = Message::parse(&data).unwrap();
        assert_eq!(req.address(), "[::1]:8080");
    }

    #[test]
    fn test_message_rejects_bad_address_type() {
        let data = [0x05, 0x01, 0x00, 0x02, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Message::parse(&data),
            Err(SocksError::InvalidAddressType(0x02))
        ));
    }

    #[test]
    fn test_message_truncated_domain() {
        // Claims a 20-byte domain but carries 3.
        let data = [0x05, 0x01, 0x00, 0x03, 20, b'a', b'b', b'c'];
        assert!(matches!(
            Message::parse(&data),
            Err(SocksError::Truncated(_))
        ));
    }

    #[test]
    fn test_reply_echoes_request_address() {
        let data = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let req = Message::parse(&data).unwrap();

        let reply = Message::reply_to(Some(&req), REP_SUCCEEDED);
        assert_eq!(
            reply.encode(),
            vec![0x05, 0x00, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50]
        );

        // No parsed request: a bare failure reply.
        let bare = Message::reply_to(None, REP_CONNECTION_REFUSED);
        assert_eq!(bare.encode(), vec![0x05, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }
}
