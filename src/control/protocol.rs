//! # Wire protocol of the control socket.
//!
//! Frames are `[type:u8][payload-len:u16 little-endian][payload]`, with the
//! payload capped at [`MAX_PAYLOAD_SIZE`]. Strings are length-prefixed with
//! a `u16`; all multi-byte integers are little-endian. The codes below are
//! the external contract and must not be renumbered.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::service::types::{ServiceState, ServiceType};

/// Control protocol version reported by QUERY_VERSION.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame payload.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

// ---- Command codes (client to server) ----

pub const CMD_QUERY_VERSION: u8 = 0;
pub const CMD_FIND_SERVICE: u8 = 1;
pub const CMD_LOAD_SERVICE: u8 = 2;
pub const CMD_START_SERVICE: u8 = 3;
pub const CMD_STOP_SERVICE: u8 = 4;
pub const CMD_UNPIN_SERVICE: u8 = 7;
pub const CMD_LIST_SERVICES: u8 = 8;
pub const CMD_BOOT_TIME: u8 = 9;
pub const CMD_SHUTDOWN: u8 = 10;
pub const CMD_SERVICE_STATUS: u8 = 18;
pub const CMD_SET_TRIGGER: u8 = 19;
pub const CMD_SIGNAL: u8 = 21;
pub const CMD_CLOSE_HANDLE: u8 = 23;
pub const CMD_RELOAD_SERVICE: u8 = 24;
pub const CMD_CAT_LOG: u8 = 26;

// ---- Reply codes (server to client) ----

pub const RPLY_ACK: u8 = 50;
pub const RPLY_NAK: u8 = 51;
pub const RPLY_BAD_REQ: u8 = 52;
pub const RPLY_CP_VERSION: u8 = 58;
pub const RPLY_SERVICE_RECORD: u8 = 59;
pub const RPLY_NO_SERVICE: u8 = 60;
pub const RPLY_ALREADY_SS: u8 = 61;
pub const RPLY_SVC_INFO: u8 = 62;
pub const RPLY_LIST_DONE: u8 = 63;
pub const RPLY_BOOT_TIME: u8 = 64;
pub const RPLY_SVC_LOG: u8 = 66;
pub const RPLY_SHUTTING_DOWN: u8 = 69;
pub const RPLY_SERVICE_STATUS: u8 = 70;
pub const RPLY_SIGNAL_NO_PID: u8 = 74;
pub const RPLY_SIGNAL_BAD_SIG: u8 = 75;
pub const RPLY_SIGNAL_ERR: u8 = 76;

// ---- Info codes (server to client, unsolicited) ----

pub const INFO_SERVICE_EVENT: u8 = 100;

// ---- Status flag bits ----

pub const STATUS_FLAG_HAS_PID: u8 = 1 << 0;
pub const STATUS_FLAG_MARKED_ACTIVE: u8 = 1 << 1;
pub const STATUS_FLAG_WAITING_DEPS: u8 = 1 << 2;
pub const STATUS_FLAG_HAS_CONSOLE: u8 = 1 << 3;

/// CATLOG request flag: clear the buffer after reading.
pub const CATLOG_FLAG_CLEAR: u8 = 1 << 0;

/// Malformed frame or payload.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated payload: need {need}, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("payload too large: {0}")]
    TooLarge(usize),
    #[error("invalid field value")]
    InvalidValue,
}

// ---- Framing ----

/// Writes one frame.
pub async fn write_packet<W>(w: &mut W, pkt_type: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            ProtocolError::TooLarge(payload.len()),
        ));
    }
    let mut hdr = [0u8; 3];
    hdr[0] = pkt_type;
    hdr[1..3].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    w.write_all(&hdr).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await
}

/// Reads one frame.
pub async fn read_packet<R>(r: &mut R) -> io::Result<(u8, Vec<u8>)>
where
    R: AsyncReadExt + Unpin,
{
    let mut hdr = [0u8; 3];
    r.read_exact(&mut hdr).await?;
    let pkt_type = hdr[0];
    let len = u16::from_le_bytes([hdr[1], hdr[2]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::TooLarge(len),
        ));
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }
    Ok((pkt_type, payload))
}

// ---- Field codecs ----

fn need(data: &[u8], n: usize) -> Result<(), ProtocolError> {
    if data.len() < n {
        Err(ProtocolError::Truncated {
            need: n,
            have: data.len(),
        })
    } else {
        Ok(())
    }
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u64(data: &[u8]) -> u64 {
    u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ])
}

/// Encodes a name as `[len:u16][bytes]`.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + name.len());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf
}

/// Decodes a name, returning it and the bytes consumed.
pub fn decode_name(data: &[u8]) -> Result<(String, usize), ProtocolError> {
    need(data, 2)?;
    let len = read_u16(data) as usize;
    need(data, 2 + len)?;
    let name = String::from_utf8(data[2..2 + len].to_vec())
        .map_err(|_| ProtocolError::InvalidValue)?;
    Ok((name, 2 + len))
}

pub fn encode_handle(handle: u32) -> Vec<u8> {
    handle.to_le_bytes().to_vec()
}

pub fn decode_handle(data: &[u8]) -> Result<u32, ProtocolError> {
    need(data, 4)?;
    Ok(read_u32(data))
}

/// FIND/LOAD reply payload: state, handle, target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRecordReply {
    pub state: ServiceState,
    pub handle: u32,
    pub target_state: ServiceState,
}

pub fn encode_service_record(reply: ServiceRecordReply) -> Vec<u8> {
    let mut buf = vec![0u8; 6];
    buf[0] = reply.state as u8;
    buf[1..5].copy_from_slice(&reply.handle.to_le_bytes());
    buf[5] = reply.target_state as u8;
    buf
}

pub fn decode_service_record(data: &[u8]) -> Result<ServiceRecordReply, ProtocolError> {
    need(data, 6)?;
    Ok(ServiceRecordReply {
        state: ServiceState::from_u8(data[0]).ok_or(ProtocolError::InvalidValue)?,
        handle: read_u32(&data[1..]),
        target_state: ServiceState::from_u8(data[5]).ok_or(ProtocolError::InvalidValue)?,
    })
}

/// SERVICE_STATUS reply payload (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatusInfo {
    pub state: ServiceState,
    pub target_state: ServiceState,
    pub svc_type: ServiceType,
    pub flags: u8,
    pub pid: i32,
    pub exit_status: i32,
}

pub fn encode_service_status(info: &ServiceStatusInfo) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[0] = info.state as u8;
    buf[1] = info.target_state as u8;
    buf[2] = info.svc_type as u8;
    buf[3] = info.flags;
    buf[4..8].copy_from_slice(&info.pid.to_le_bytes());
    buf[8..12].copy_from_slice(&info.exit_status.to_le_bytes());
    buf
}

pub fn decode_service_status(data: &[u8]) -> Result<ServiceStatusInfo, ProtocolError> {
    need(data, 12)?;
    Ok(ServiceStatusInfo {
        state: ServiceState::from_u8(data[0]).ok_or(ProtocolError::InvalidValue)?,
        target_state: ServiceState::from_u8(data[1]).ok_or(ProtocolError::InvalidValue)?,
        svc_type: ServiceType::from_u8(data[2]).ok_or(ProtocolError::InvalidValue)?,
        flags: data[3],
        pid: read_u32(&data[4..]) as i32,
        exit_status: read_u32(&data[8..]) as i32,
    })
}

/// One LIST_SERVICES entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvcInfoEntry {
    pub name: String,
    pub state: ServiceState,
    pub target_state: ServiceState,
    pub svc_type: ServiceType,
    pub flags: u8,
    pub pid: i32,
}

pub fn encode_svc_info(entry: &SvcInfoEntry) -> Vec<u8> {
    let mut buf = encode_name(&entry.name);
    buf.push(entry.state as u8);
    buf.push(entry.target_state as u8);
    buf.push(entry.svc_type as u8);
    buf.push(entry.flags);
    buf.extend_from_slice(&entry.pid.to_le_bytes());
    buf
}

pub fn decode_svc_info(data: &[u8]) -> Result<(SvcInfoEntry, usize), ProtocolError> {
    let (name, n) = decode_name(data)?;
    need(data, n + 8)?;
    let entry = SvcInfoEntry {
        name,
        state: ServiceState::from_u8(data[n]).ok_or(ProtocolError::InvalidValue)?,
        target_state: ServiceState::from_u8(data[n + 1]).ok_or(ProtocolError::InvalidValue)?,
        svc_type: ServiceType::from_u8(data[n + 2]).ok_or(ProtocolError::InvalidValue)?,
        flags: data[n + 3],
        pid: read_u32(&data[n + 4..]) as i32,
    };
    Ok((entry, n + 8))
}

// ---- Boot timing ----

/// Per-service boot timing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTimeEntry {
    pub name: String,
    /// Startup duration in nanoseconds, 0 when never started.
    pub startup_ns: i64,
    pub state: ServiceState,
    pub svc_type: ServiceType,
    pub pid: i32,
}

/// BOOT_TIME reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootTimeInfo {
    pub kernel_uptime_ns: i64,
    pub boot_start_ns: i64,
    /// Zero while the boot service has not yet reached STARTED.
    pub boot_ready_ns: i64,
    pub boot_svc_name: String,
    pub services: Vec<BootTimeEntry>,
}

impl Default for BootTimeEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            startup_ns: 0,
            state: ServiceState::Stopped,
            svc_type: ServiceType::Internal,
            pid: 0,
        }
    }
}

pub fn encode_boot_time(info: &BootTimeInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(info.kernel_uptime_ns as u64).to_le_bytes());
    buf.extend_from_slice(&(info.boot_start_ns as u64).to_le_bytes());
    buf.extend_from_slice(&(info.boot_ready_ns as u64).to_le_bytes());
    buf.extend_from_slice(&encode_name(&info.boot_svc_name));
    buf.extend_from_slice(&(info.services.len() as u16).to_le_bytes());
    for svc in &info.services {
        buf.extend_from_slice(&encode_name(&svc.name));
        buf.extend_from_slice(&(svc.startup_ns as u64).to_le_bytes());
        buf.push(svc.state as u8);
        buf.push(svc.svc_type as u8);
        buf.extend_from_slice(&svc.pid.to_le_bytes());
    }
    buf
}

pub fn decode_boot_time(data: &[u8]) -> Result<BootTimeInfo, ProtocolError> {
    need(data, 24)?;
    let mut info = BootTimeInfo {
        kernel_uptime_ns: read_u64(data) as i64,
        boot_start_ns: read_u64(&data[8..]) as i64,
        boot_ready_ns: read_u64(&data[16..]) as i64,
        ..Default::default()
    };
    let mut off = 24;

    let (name, n) = decode_name(&data[off..])?;
    info.boot_svc_name = name;
    off += n;

    need(data, off + 2)?;
    let count = read_u16(&data[off..]) as usize;
    off += 2;

    for _ in 0..count {
        let (name, n) = decode_name(&data[off..])?;
        off += n;
        need(data, off + 14)?;
        info.services.push(BootTimeEntry {
            name,
            startup_ns: read_u64(&data[off..]) as i64,
            state: ServiceState::from_u8(data[off + 8]).ok_or(ProtocolError::InvalidValue)?,
            svc_type: ServiceType::from_u8(data[off + 9]).ok_or(ProtocolError::InvalidValue)?,
            pid: read_u32(&data[off + 10..]) as i32,
        });
        off += 14;
    }

    Ok(info)
}

// ---- Catlog ----

/// Encodes a CATLOG request: `[handle:u32][flags:u8]`.
pub fn encode_catlog_request(handle: u32, clear: bool) -> Vec<u8> {
    let mut buf = encode_handle(handle);
    buf.push(if clear { CATLOG_FLAG_CLEAR } else { 0 });
    buf
}

/// Decodes a CATLOG request, returning (flags, handle).
pub fn decode_catlog_request(data: &[u8]) -> Result<(u8, u32), ProtocolError> {
    need(data, 5)?;
    Ok((data[4], read_u32(data)))
}

/// Encodes an SVC_LOG reply: `[flags:u8][bytes]`.
pub fn encode_svc_log(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(0);
    buf.extend_from_slice(data);
    buf
}

/// Decodes an SVC_LOG reply, returning (flags, bytes).
pub fn decode_svc_log(data: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    need(data, 1)?;
    Ok((data[0], &data[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_round_trip() {
        let mut writer = std::io::Cursor::new(Vec::new());
        write_packet(&mut writer, CMD_FIND_SERVICE, b"payload")
            .await
            .unwrap();
        let mut reader = std::io::Cursor::new(writer.into_inner());
        let (cmd, payload) = read_packet(&mut reader).await.unwrap();
        assert_eq!(cmd, CMD_FIND_SERVICE);
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn empty_payload_round_trip() {
        let mut writer = std::io::Cursor::new(Vec::new());
        write_packet(&mut writer, RPLY_ACK, &[]).await.unwrap();
        let mut reader = std::io::Cursor::new(writer.into_inner());
        let (cmd, payload) = read_packet(&mut reader).await.unwrap();
        assert_eq!(cmd, RPLY_ACK);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let mut writer = std::io::Cursor::new(Vec::new());
        let big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(write_packet(&mut writer, RPLY_ACK, &big).await.is_err());
    }

    #[test]
    fn name_round_trip() {
        let encoded = encode_name("network");
        let (name, n) = decode_name(&encoded).unwrap();
        assert_eq!(name, "network");
        assert_eq!(n, encoded.len());
    }

    #[test]
    fn service_record_round_trip() {
        let reply = ServiceRecordReply {
            state: ServiceState::Starting,
            handle: 0xDEAD_BEEF,
            target_state: ServiceState::Started,
        };
        assert_eq!(
            decode_service_record(&encode_service_record(reply)).unwrap(),
            reply
        );
    }

    #[test]
    fn service_status_round_trip() {
        let info = ServiceStatusInfo {
            state: ServiceState::Started,
            target_state: ServiceState::Started,
            svc_type: ServiceType::Process,
            flags: STATUS_FLAG_HAS_PID | STATUS_FLAG_MARKED_ACTIVE,
            pid: 4321,
            exit_status: -1,
        };
        assert_eq!(
            decode_service_status(&encode_service_status(&info)).unwrap(),
            info
        );
    }

    #[test]
    fn svc_info_round_trip() {
        let entry = SvcInfoEntry {
            name: "my-daemon".to_string(),
            state: ServiceState::Stopping,
            target_state: ServiceState::Stopped,
            svc_type: ServiceType::BgProcess,
            flags: STATUS_FLAG_HAS_CONSOLE,
            pid: 99,
        };
        let (decoded, n) = decode_svc_info(&encode_svc_info(&entry)).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(n, encode_svc_info(&entry).len());
    }

    #[test]
    fn boot_time_round_trip() {
        let info = BootTimeInfo {
            kernel_uptime_ns: 5_000_000_000,
            boot_start_ns: 1_700_000_000_000_000_000,
            boot_ready_ns: 1_700_000_000_500_000_000,
            boot_svc_name: "boot".to_string(),
            services: vec![
                BootTimeEntry {
                    name: "hello".to_string(),
                    startup_ns: 234_000_000,
                    state: ServiceState::Started,
                    svc_type: ServiceType::Scripted,
                    pid: 0,
                },
                BootTimeEntry {
                    name: "ticker".to_string(),
                    startup_ns: 456_000_000,
                    state: ServiceState::Started,
                    svc_type: ServiceType::Process,
                    pid: 129,
                },
            ],
        };
        assert_eq!(decode_boot_time(&encode_boot_time(&info)).unwrap(), info);
    }

    #[test]
    fn boot_time_empty_round_trip() {
        let info = BootTimeInfo {
            kernel_uptime_ns: 2_000_000_000,
            boot_start_ns: 12345,
            boot_ready_ns: 0,
            boot_svc_name: "boot".to_string(),
            services: Vec::new(),
        };
        let decoded = decode_boot_time(&encode_boot_time(&info)).unwrap();
        assert_eq!(decoded.boot_ready_ns, 0);
        assert!(decoded.services.is_empty());
    }

    #[test]
    fn catlog_round_trip() {
        let (flags, handle) = decode_catlog_request(&encode_catlog_request(42, true)).unwrap();
        assert_eq!(handle, 42);
        assert_ne!(flags & CATLOG_FLAG_CLEAR, 0);

        let (flags, handle) = decode_catlog_request(&encode_catlog_request(7, false)).unwrap();
        assert_eq!(handle, 7);
        assert_eq!(flags & CATLOG_FLAG_CLEAR, 0);

        let reply = encode_svc_log(b"log line\n");
        let (rflags, data) = decode_svc_log(&reply).unwrap();
        assert_eq!(rflags, 0);
        assert_eq!(data, b"log line\n");

        let empty = encode_svc_log(b"");
        let (_, data) = decode_svc_log(&empty).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn truncated_fields_rejected() {
        assert!(decode_name(&[5, 0, b'a']).is_err());
        assert!(decode_handle(&[1, 2]).is_err());
        assert!(decode_service_status(&[0u8; 5]).is_err());
        assert!(decode_boot_time(&[0u8; 10]).is_err());
    }
}
