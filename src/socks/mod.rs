//! SOCKS5 message codec (RFC 1928 subset)
//!
//! Covers method negotiation plus the CONNECT/BIND/UDP-ASSOCIATE
//! request/reply shape with IPv4, IPv6 and domain addresses, NOAUTH only.
//! Parsers work on whole buffers and enforce exact-length contracts; they
//! never guess on a malformed address.

mod message;

pub use message::{Message, MethodReply, MethodRequest, Reply, Request};

use thiserror::Error;

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

// Authentication methods.
pub const NO_AUTH: u8 = 0x00;
pub const NO_ACCEPTABLE: u8 = 0xFF;

// Address types.
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// Commands.
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// Reply codes.
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Codec errors
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("{0} needs more data")]
    Truncated(&'static str),

    #[error("invalid address type {0:#04x}")]
    InvalidAddressType(u8),
}
