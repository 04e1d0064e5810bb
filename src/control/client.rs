//! Client-side helpers for talking to a running supervisor.
//!
//! Used by the `slinitctl` binary; also convenient for integration tests.

use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::net::UnixStream;

use crate::control::protocol::{self as proto, ProtocolError};
use crate::service::types::ShutdownType;

/// Errors surfaced to CLI users.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("service '{0}' not found")]
    NoService(String),
    #[error("request refused")]
    Refused,
    #[error("system is shutting down")]
    ShuttingDown,
    #[error("service has no running process")]
    NoPid,
    #[error("invalid signal")]
    BadSignal,
    #[error("failed to send signal: {0}")]
    SignalFailed(String),
    #[error("unexpected reply: {0}")]
    Unexpected(u8),
}

/// Outcome of a start or stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStopOutcome {
    /// The request was accepted.
    Applied,
    /// The service was already in the requested state.
    AlreadyInState,
}

/// A control-socket client holding one connection.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connects to the supervisor's control socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self { stream })
    }

    async fn round_trip(&mut self, cmd: u8, payload: &[u8]) -> Result<(u8, Vec<u8>), ClientError> {
        proto::write_packet(&mut self.stream, cmd, payload).await?;
        Ok(proto::read_packet(&mut self.stream).await?)
    }

    /// Queries the protocol version.
    pub async fn query_version(&mut self) -> Result<u16, ClientError> {
        let (rply, payload) = self.round_trip(proto::CMD_QUERY_VERSION, &[]).await?;
        match rply {
            proto::RPLY_CP_VERSION if payload.len() >= 2 => {
                Ok(u16::from_le_bytes([payload[0], payload[1]]))
            }
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Loads a service by name, returning its handle.
    pub async fn load_service(&mut self, name: &str) -> Result<u32, ClientError> {
        let (rply, payload) = self
            .round_trip(proto::CMD_LOAD_SERVICE, &proto::encode_name(name))
            .await?;
        match rply {
            proto::RPLY_SERVICE_RECORD => Ok(proto::decode_service_record(&payload)?.handle),
            proto::RPLY_NO_SERVICE => Err(ClientError::NoService(name.to_string())),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn start_service(&mut self, handle: u32) -> Result<StartStopOutcome, ClientError> {
        let (rply, _) = self
            .round_trip(proto::CMD_START_SERVICE, &proto::encode_handle(handle))
            .await?;
        match rply {
            proto::RPLY_ACK => Ok(StartStopOutcome::Applied),
            proto::RPLY_ALREADY_SS => Ok(StartStopOutcome::AlreadyInState),
            proto::RPLY_SHUTTING_DOWN => Err(ClientError::ShuttingDown),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn stop_service(&mut self, handle: u32) -> Result<StartStopOutcome, ClientError> {
        let (rply, _) = self
            .round_trip(proto::CMD_STOP_SERVICE, &proto::encode_handle(handle))
            .await?;
        match rply {
            proto::RPLY_ACK => Ok(StartStopOutcome::Applied),
            proto::RPLY_ALREADY_SS => Ok(StartStopOutcome::AlreadyInState),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn unpin_service(&mut self, handle: u32) -> Result<(), ClientError> {
        let (rply, _) = self
            .round_trip(proto::CMD_UNPIN_SERVICE, &proto::encode_handle(handle))
            .await?;
        match rply {
            proto::RPLY_ACK => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn service_status(
        &mut self,
        handle: u32,
    ) -> Result<proto::ServiceStatusInfo, ClientError> {
        let (rply, payload) = self
            .round_trip(proto::CMD_SERVICE_STATUS, &proto::encode_handle(handle))
            .await?;
        match rply {
            proto::RPLY_SERVICE_STATUS => Ok(proto::decode_service_status(&payload)?),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Lists all services.
    pub async fn list_services(&mut self) -> Result<Vec<proto::SvcInfoEntry>, ClientError> {
        proto::write_packet(&mut self.stream, proto::CMD_LIST_SERVICES, &[]).await?;
        let mut entries = Vec::new();
        loop {
            let (rply, payload) = proto::read_packet(&mut self.stream).await?;
            match rply {
                proto::RPLY_LIST_DONE => return Ok(entries),
                proto::RPLY_SVC_INFO => {
                    let (entry, _) = proto::decode_svc_info(&payload)?;
                    entries.push(entry);
                }
                other => return Err(ClientError::Unexpected(other)),
            }
        }
    }

    pub async fn set_trigger(&mut self, handle: u32, value: bool) -> Result<(), ClientError> {
        let mut payload = proto::encode_handle(handle);
        payload.push(u8::from(value));
        let (rply, _) = self.round_trip(proto::CMD_SET_TRIGGER, &payload).await?;
        match rply {
            proto::RPLY_ACK => Ok(()),
            proto::RPLY_NAK => Err(ClientError::Refused),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn signal(&mut self, handle: u32, signum: i32) -> Result<(), ClientError> {
        let mut payload = proto::encode_handle(handle);
        payload.extend_from_slice(&(signum as u32).to_le_bytes());
        let (rply, reply_payload) = self.round_trip(proto::CMD_SIGNAL, &payload).await?;
        match rply {
            proto::RPLY_ACK => Ok(()),
            proto::RPLY_SIGNAL_NO_PID => Err(ClientError::NoPid),
            proto::RPLY_SIGNAL_BAD_SIG => Err(ClientError::BadSignal),
            proto::RPLY_SIGNAL_ERR => Err(ClientError::SignalFailed(
                String::from_utf8_lossy(&reply_payload).into_owned(),
            )),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn shutdown(&mut self, shutdown_type: ShutdownType) -> Result<(), ClientError> {
        let (rply, _) = self
            .round_trip(proto::CMD_SHUTDOWN, &[shutdown_type as u8])
            .await?;
        match rply {
            proto::RPLY_ACK => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn reload_service(&mut self, handle: u32) -> Result<(), ClientError> {
        let (rply, _) = self
            .round_trip(proto::CMD_RELOAD_SERVICE, &proto::encode_handle(handle))
            .await?;
        match rply {
            proto::RPLY_ACK => Ok(()),
            proto::RPLY_NAK => Err(ClientError::Refused),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Fetches the buffered output of a service; `None` means the service
    /// does not buffer its output.
    pub async fn catlog(
        &mut self,
        handle: u32,
        clear: bool,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let (rply, payload) = self
            .round_trip(proto::CMD_CAT_LOG, &proto::encode_catlog_request(handle, clear))
            .await?;
        match rply {
            proto::RPLY_SVC_LOG => {
                let (_, data) = proto::decode_svc_log(&payload)?;
                Ok(Some(data.to_vec()))
            }
            proto::RPLY_NAK => Ok(None),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn boot_time(&mut self) -> Result<proto::BootTimeInfo, ClientError> {
        let (rply, payload) = self.round_trip(proto::CMD_BOOT_TIME, &[]).await?;
        match rply {
            proto::RPLY_BOOT_TIME => Ok(proto::decode_boot_time(&payload)?),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn close_handle(&mut self, handle: u32) -> Result<(), ClientError> {
        let (rply, _) = self
            .round_trip(proto::CMD_CLOSE_HANDLE, &proto::encode_handle(handle))
            .await?;
        match rply {
            proto::RPLY_ACK => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }
}
