//! Bitcoin P2P message framing and the payloads a header-only peer speaks.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use pulse_consensus::constants::{
    MAX_ADDR_RESULTS, MAX_HEADERS_RESULTS, MAX_LOCATOR_HASHES, NODE_NETWORK, PROTOCOL_VERSION,
};
use pulse_consensus::BlockHash;
use pulse_primitives::encoding::{Decoder, Encoder};
use pulse_primitives::hash::checksum;
use pulse_primitives::BlockHeader;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const USER_AGENT: &str = concat!("/pulse:", env!("CARGO_PKG_VERSION"), "/");

const FRAME_HEADER_SIZE: usize = 24;

/// Failure reading a frame: transport errors close a session quietly,
/// protocol errors get the peer banned.
#[derive(Debug)]
pub enum FrameError {
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(message) => write!(f, "{message}"),
            FrameError::Protocol(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Frames a command + payload: magic, null-padded command, length, checksum.
pub fn build_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, String> {
    let cmd = command.as_bytes();
    if cmd.len() > 12 {
        return Err("command too long".to_string());
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; 12];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(payload));
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<usize, String> {
    let frame = build_frame(magic, command, payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|err| err.to_string())?;
    Ok(frame.len())
}

/// Reads one frame, checking magic, size cap and payload checksum.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
    max_payload: usize,
) -> Result<(String, Vec<u8>), FrameError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| FrameError::Io(err.to_string()))?;
    if header[..4] != magic {
        return Err(FrameError::Protocol("invalid network magic".to_string()));
    }
    let command = header[4..16]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    if !command.bytes().all(|byte| byte.is_ascii_graphic()) {
        return Err(FrameError::Protocol("non-ascii command".to_string()));
    }
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > max_payload {
        return Err(FrameError::Protocol(format!(
            "payload of {length} bytes exceeds message cap"
        )));
    }
    let expected_checksum = [header[20], header[21], header[22], header[23]];
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| FrameError::Io(err.to_string()))?;
    if checksum(&payload) != expected_checksum {
        return Err(FrameError::Protocol(
            "invalid payload checksum".to_string(),
        ));
    }
    Ok((command, payload))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

pub fn build_version(start_height: i32, nonce: u64, timestamp: i64) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_i32_le(PROTOCOL_VERSION);
    encoder.put_u64_le(NODE_NETWORK);
    encoder.put_i64_le(timestamp);
    put_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    put_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    encoder.put_u64_le(nonce);
    encoder.put_var_str(USER_AGENT);
    encoder.put_i32_le(start_height);
    // Header-only peer: no transaction relay.
    encoder.put_u8(0);
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionPayload, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.get_i32_le().map_err(|err| err.to_string())?;
    let services = decoder.get_u64_le().map_err(|err| err.to_string())?;
    let timestamp = decoder.get_i64_le().map_err(|err| err.to_string())?;
    skip_net_addr(&mut decoder)?;
    skip_net_addr(&mut decoder)?;
    let nonce = decoder.get_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.get_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.get_i32_le().map_err(|err| err.to_string())?;
    // The relay flag is optional for old peers.
    let relay = if decoder.is_empty() {
        true
    } else {
        decoder.get_u8().map_err(|err| err.to_string())? != 0
    };
    Ok(VersionPayload {
        version,
        services,
        timestamp,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

pub fn build_ping(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

pub fn parse_ping(payload: &[u8]) -> Result<u64, String> {
    let mut decoder = Decoder::new(payload);
    let nonce = decoder.get_u64_le().map_err(|err| err.to_string())?;
    decoder.finish().map_err(|err| err.to_string())?;
    Ok(nonce)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetHeadersRequest {
    pub locator: Vec<BlockHash>,
    pub stop: BlockHash,
}

pub fn build_getheaders(locator: &[BlockHash], stop: &BlockHash) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_i32_le(PROTOCOL_VERSION);
    encoder.put_compact_size(locator.len() as u64);
    for hash in locator {
        encoder.put_hash(hash);
    }
    encoder.put_hash(stop);
    encoder.into_inner()
}

pub fn parse_getheaders(payload: &[u8]) -> Result<GetHeadersRequest, String> {
    let mut decoder = Decoder::new(payload);
    let _protocol_version = decoder.get_i32_le().map_err(|err| err.to_string())?;
    let count = decoder.get_compact_size().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "locator count too large".to_string())?;
    if count > MAX_LOCATOR_HASHES {
        return Err("locator count too large".to_string());
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.get_hash().map_err(|err| err.to_string())?);
    }
    let stop = decoder.get_hash().map_err(|err| err.to_string())?;
    decoder.finish().map_err(|err| err.to_string())?;
    Ok(GetHeadersRequest { locator, stop })
}

/// Encodes a `headers` payload; each entry carries a zero tx count.
pub fn build_headers(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_compact_size(headers.len() as u64);
    for header in headers {
        header.encode_into(&mut encoder);
        encoder.put_compact_size(0);
    }
    encoder.into_inner()
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.get_compact_size().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "header count too large".to_string())?;
    if count > MAX_HEADERS_RESULTS {
        return Err("header count too large".to_string());
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::decode_from(&mut decoder).map_err(|err| err.to_string())?;
        let _tx_count = decoder.get_compact_size().map_err(|err| err.to_string())?;
        headers.push(header);
    }
    decoder.finish().map_err(|err| err.to_string())?;
    Ok(headers)
}

pub fn build_addr(addrs: &[SocketAddr], now: u32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_compact_size(addrs.len() as u64);
    for addr in addrs {
        encoder.put_u32_le(now);
        encoder.put_u64_le(NODE_NETWORK);
        let ip_bytes = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped().octets(),
            IpAddr::V6(ip6) => ip6.octets(),
        };
        encoder.put_bytes(&ip_bytes);
        encoder.put_bytes(&addr.port().to_be_bytes());
    }
    encoder.into_inner()
}

pub fn parse_addr(payload: &[u8]) -> Result<Vec<SocketAddr>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.get_compact_size().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "addr count too large".to_string())?;
    if count > MAX_ADDR_RESULTS {
        return Err("addr count too large".to_string());
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let _time = decoder.get_u32_le().map_err(|err| err.to_string())?;
        let _services = decoder.get_u64_le().map_err(|err| err.to_string())?;
        let ip_bytes = decoder.get_fixed::<16>().map_err(|err| err.to_string())?;
        let port_bytes = decoder.get_fixed::<2>().map_err(|err| err.to_string())?;
        let port = u16::from_be_bytes(port_bytes);
        if port == 0 {
            continue;
        }
        let ip6 = Ipv6Addr::from(ip_bytes);
        let ip = if let Some(ip4) = ip6.to_ipv4_mapped() {
            IpAddr::V4(ip4)
        } else {
            IpAddr::V6(ip6)
        };
        if ip.is_unspecified() || ip.is_loopback() {
            continue;
        }
        addrs.push(SocketAddr::new(ip, port));
    }
    Ok(addrs)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<BlockHash>,
}

pub fn build_reject(message: &str, code: u8, reason: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_var_str(message);
    encoder.put_u8(code);
    encoder.put_var_str(reason);
    encoder.into_inner()
}

pub fn parse_reject(payload: &[u8]) -> Result<RejectMessage, String> {
    let mut decoder = Decoder::new(payload);
    let message = decoder.get_var_str().map_err(|err| err.to_string())?;
    let code = decoder.get_u8().map_err(|err| err.to_string())?;
    let reason = decoder.get_var_str().map_err(|err| err.to_string())?;
    let data = match decoder.remaining() {
        32 => Some(decoder.get_hash().map_err(|err| err.to_string())?),
        _ => None,
    };
    Ok(RejectMessage {
        message,
        code,
        reason,
        data,
    })
}

fn put_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.put_u64_le(services);
    encoder.put_bytes(&ip);
    encoder.put_bytes(&port.to_be_bytes());
}

fn skip_net_addr(decoder: &mut Decoder<'_>) -> Result<(), String> {
    decoder.get_u64_le().map_err(|err| err.to_string())?;
    decoder.get_fixed::<16>().map_err(|err| err.to_string())?;
    decoder.get_fixed::<2>().map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_consensus::params::{network_params, Network};

    fn sample_hash(tag: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        BlockHash::from_bytes(bytes)
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let magic = network_params(Network::Mainnet).magic;
        let frame = build_frame(magic, "ping", &build_ping(7)).expect("frame");
        let mut cursor = frame.as_slice();
        let (command, payload) = read_frame(&mut cursor, magic, 1024).await.expect("read");
        assert_eq!(command, "ping");
        assert_eq!(parse_ping(&payload).expect("nonce"), 7);
    }

    #[tokio::test]
    async fn frame_rejects_wrong_magic() {
        let frame = build_frame(*b"ABCD", "verack", &[]).expect("frame");
        let mut cursor = frame.as_slice();
        assert!(read_frame(&mut cursor, *b"DCBA", 1024).await.is_err());
    }

    #[tokio::test]
    async fn frame_rejects_oversized_payload() {
        let magic = network_params(Network::Regtest).magic;
        let frame = build_frame(magic, "headers", &[0u8; 128]).expect("frame");
        let mut cursor = frame.as_slice();
        assert!(read_frame(&mut cursor, magic, 64).await.is_err());
    }

    #[tokio::test]
    async fn frame_rejects_corrupt_checksum() {
        let magic = network_params(Network::Regtest).magic;
        let mut frame = build_frame(magic, "ping", &build_ping(1)).expect("frame");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut cursor = frame.as_slice();
        assert!(read_frame(&mut cursor, magic, 1024).await.is_err());
    }

    #[test]
    fn version_round_trip() {
        let payload = build_version(123_456, 42, 1_700_000_000);
        let version = parse_version(&payload).expect("parse");
        assert_eq!(version.version, PROTOCOL_VERSION);
        assert_eq!(version.start_height, 123_456);
        assert_eq!(version.nonce, 42);
        assert_eq!(version.user_agent, USER_AGENT);
        assert!(!version.relay);
    }

    #[test]
    fn getheaders_round_trip() {
        let locator = vec![sample_hash(1), sample_hash(2), sample_hash(3)];
        let stop = sample_hash(9);
        let payload = build_getheaders(&locator, &stop);
        let request = parse_getheaders(&payload).expect("parse");
        assert_eq!(request.locator, locator);
        assert_eq!(request.stop, stop);
    }

    #[test]
    fn headers_round_trip() {
        let params = network_params(Network::Regtest);
        let genesis = BlockHeader::genesis(&params);
        let mut second = genesis;
        second.prev_hash = genesis.hash();
        second.time += 600;

        let payload = build_headers(&[genesis, second]);
        let parsed = parse_headers(&payload).expect("parse");
        assert_eq!(parsed, vec![genesis, second]);
    }

    #[test]
    fn headers_count_capped() {
        let mut encoder = Encoder::new();
        encoder.put_compact_size(MAX_HEADERS_RESULTS as u64 + 1);
        assert!(parse_headers(&encoder.into_inner()).is_err());
    }

    #[test]
    fn addr_round_trip_skips_unusable_entries() {
        let good: SocketAddr = "203.0.113.5:8333".parse().expect("addr");
        let loopback: SocketAddr = "127.0.0.1:8333".parse().expect("addr");
        let payload = build_addr(&[good, loopback], 1_700_000_000);
        let parsed = parse_addr(&payload).expect("parse");
        assert_eq!(parsed, vec![good]);
    }

    #[test]
    fn reject_round_trip() {
        let payload = build_reject("headers", 0x10, "invalid");
        let reject = parse_reject(&payload).expect("parse");
        assert_eq!(reject.message, "headers");
        assert_eq!(reject.code, 0x10);
        assert_eq!(reject.reason, "invalid");
        assert_eq!(reject.data, None);
    }
}
