//! One control connection: frame dispatch and the per-connection handle
//! table.
//!
//! Handles are allocated monotonically from 1 (0 is reserved) and dedup to
//! the same value for repeated FIND/LOAD of one service. The table dies
//! with the connection.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::protocol::{self as proto};
use crate::service::set::ServiceId;
use crate::service::types::{ServiceState, ShutdownType};
use crate::supervisor::Supervisor;

pub(crate) struct Connection {
    sup: Arc<Supervisor>,
    stream: UnixStream,
    handles: HashMap<u32, ServiceId>,
    next_handle: u32,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(sup: Arc<Supervisor>, stream: UnixStream, cancel: CancellationToken) -> Self {
        Self {
            sup,
            stream,
            handles: HashMap::new(),
            next_handle: 1,
            cancel,
        }
    }

    fn alloc_handle(&mut self, id: ServiceId) -> u32 {
        if let Some((&handle, _)) = self.handles.iter().find(|&(_, &svc)| svc == id) {
            return handle;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, id);
        handle
    }

    fn lookup(&self, handle: u32) -> Option<ServiceId> {
        self.handles.get(&handle).copied()
    }

    pub(crate) async fn serve(mut self) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = proto::read_packet(&mut self.stream) => frame,
            };

            let (cmd, payload) = match frame {
                Ok(f) => f,
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        debug!(error = %e, "control connection read error");
                    }
                    return;
                }
            };

            if let Err(e) = self.dispatch(cmd, &payload).await {
                debug!(error = %e, "control connection write error");
                return;
            }
        }
    }

    async fn dispatch(&mut self, cmd: u8, payload: &[u8]) -> io::Result<()> {
        match cmd {
            proto::CMD_QUERY_VERSION => self.handle_query_version().await,
            proto::CMD_FIND_SERVICE => self.handle_find_service(payload, false).await,
            proto::CMD_LOAD_SERVICE => self.handle_find_service(payload, true).await,
            proto::CMD_START_SERVICE => self.handle_start_service(payload).await,
            proto::CMD_STOP_SERVICE => self.handle_stop_service(payload).await,
            proto::CMD_UNPIN_SERVICE => self.handle_unpin_service(payload).await,
            proto::CMD_LIST_SERVICES => self.handle_list_services().await,
            proto::CMD_SERVICE_STATUS => self.handle_service_status(payload).await,
            proto::CMD_SET_TRIGGER => self.handle_set_trigger(payload).await,
            proto::CMD_SIGNAL => self.handle_signal(payload).await,
            proto::CMD_SHUTDOWN => self.handle_shutdown(payload).await,
            proto::CMD_RELOAD_SERVICE => self.handle_reload_service(payload).await,
            proto::CMD_CAT_LOG => self.handle_catlog(payload).await,
            proto::CMD_BOOT_TIME => self.handle_boot_time().await,
            proto::CMD_CLOSE_HANDLE => self.handle_close_handle(payload).await,
            _ => self.reply(proto::RPLY_BAD_REQ, &[]).await,
        }
    }

    async fn reply(&mut self, rply: u8, payload: &[u8]) -> io::Result<()> {
        proto::write_packet(&mut self.stream, rply, payload).await
    }

    // ---- Handlers ----

    async fn handle_query_version(&mut self) -> io::Result<()> {
        let payload = proto::PROTOCOL_VERSION.to_le_bytes();
        self.reply(proto::RPLY_CP_VERSION, &payload).await
    }

    async fn handle_find_service(&mut self, payload: &[u8], load: bool) -> io::Result<()> {
        let name = match proto::decode_name(payload) {
            Ok((name, _)) => name,
            Err(_) => return self.reply(proto::RPLY_BAD_REQ, &[]).await,
        };

        let found = self.sup.with_set(|set| {
            let id = if load {
                match set.load_service(&name) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(service = %name, error = %e, "service load failed");
                        None
                    }
                }
            } else {
                set.find_service(&name, false)
            };
            id.map(|id| (id, set.rec(id).state, set.rec(id).desired))
        });

        match found {
            None => self.reply(proto::RPLY_NO_SERVICE, &[]).await,
            Some((id, state, target)) => {
                let handle = self.alloc_handle(id);
                let reply = proto::encode_service_record(proto::ServiceRecordReply {
                    state,
                    handle,
                    target_state: target,
                });
                self.reply(proto::RPLY_SERVICE_RECORD, &reply).await
            }
        }
    }

    async fn handle_start_service(&mut self, payload: &[u8]) -> io::Result<()> {
        let Some(id) = self.handle_from(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        enum Outcome {
            ShuttingDown,
            Already,
            Ok,
        }
        let outcome = self.sup.with_set(|set| {
            if set.is_shutting_down() {
                Outcome::ShuttingDown
            } else if set.rec(id).state == ServiceState::Started {
                Outcome::Already
            } else {
                set.start_service(id);
                Outcome::Ok
            }
        });

        match outcome {
            Outcome::ShuttingDown => self.reply(proto::RPLY_SHUTTING_DOWN, &[]).await,
            Outcome::Already => self.reply(proto::RPLY_ALREADY_SS, &[]).await,
            Outcome::Ok => self.reply(proto::RPLY_ACK, &[]).await,
        }
    }

    async fn handle_stop_service(&mut self, payload: &[u8]) -> io::Result<()> {
        let Some(id) = self.handle_from(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        let already = self.sup.with_set(|set| {
            if set.rec(id).state == ServiceState::Stopped {
                true
            } else {
                set.stop_service(id);
                false
            }
        });

        if already {
            self.reply(proto::RPLY_ALREADY_SS, &[]).await
        } else {
            self.reply(proto::RPLY_ACK, &[]).await
        }
    }

    async fn handle_unpin_service(&mut self, payload: &[u8]) -> io::Result<()> {
        let Some(id) = self.handle_from(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        self.sup.with_set(|set| {
            set.unpin(id);
            set.process_queues();
        });
        self.reply(proto::RPLY_ACK, &[]).await
    }

    async fn handle_list_services(&mut self) -> io::Result<()> {
        let entries = self.sup.with_set(|set| {
            set.all_services()
                .into_iter()
                .map(|id| svc_info_entry(set, id))
                .collect::<Vec<_>>()
        });

        for entry in entries {
            self.reply(proto::RPLY_SVC_INFO, &proto::encode_svc_info(&entry))
                .await?;
        }
        self.reply(proto::RPLY_LIST_DONE, &[]).await
    }

    async fn handle_service_status(&mut self, payload: &[u8]) -> io::Result<()> {
        let Some(id) = self.handle_from(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        let status = self.sup.with_set(|set| proto::ServiceStatusInfo {
            state: set.rec(id).state,
            target_state: set.rec(id).desired,
            svc_type: set.service_type(id),
            flags: status_flags(set, id),
            pid: set.pid_of(id),
            exit_status: set.exit_status_of(id).exit_code(),
        });

        self.reply(
            proto::RPLY_SERVICE_STATUS,
            &proto::encode_service_status(&status),
        )
        .await
    }

    async fn handle_set_trigger(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() < 5 {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        }
        let handle = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let value = payload[4] != 0;

        let Some(id) = self.lookup(handle) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        let accepted = self.sup.with_set(|set| {
            let accepted = set.set_trigger(id, value);
            if accepted {
                set.process_queues();
            }
            accepted
        });

        if accepted {
            self.reply(proto::RPLY_ACK, &[]).await
        } else {
            self.reply(proto::RPLY_NAK, &[]).await
        }
    }

    async fn handle_signal(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() < 8 {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        }
        let handle = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let signum = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);

        let Some(id) = self.lookup(handle) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        let pid = self.sup.with_set(|set| set.pid_of(id));
        if pid <= 0 {
            return self.reply(proto::RPLY_SIGNAL_NO_PID, &[]).await;
        }

        let Ok(sig) = Signal::try_from(signum as i32) else {
            return self.reply(proto::RPLY_SIGNAL_BAD_SIG, &[]).await;
        };

        match kill(Pid::from_raw(pid), sig) {
            Ok(()) => self.reply(proto::RPLY_ACK, &[]).await,
            Err(e) => {
                let msg = e.to_string();
                self.reply(proto::RPLY_SIGNAL_ERR, msg.as_bytes()).await
            }
        }
    }

    async fn handle_shutdown(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.is_empty() {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        }
        let Some(shutdown_type) = ShutdownType::from_u8(payload[0]) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        self.sup.request_shutdown(shutdown_type);
        self.reply(proto::RPLY_ACK, &[]).await
    }

    async fn handle_reload_service(&mut self, payload: &[u8]) -> io::Result<()> {
        let Some(id) = self.handle_from(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        let result = self.sup.with_set(|set| {
            let result = set.reload_service(id);
            set.process_queues();
            result
        });

        match result {
            Ok(()) => self.reply(proto::RPLY_ACK, &[]).await,
            Err(e) => {
                warn!(error = %e, "service reload refused");
                self.reply(proto::RPLY_NAK, &[]).await
            }
        }
    }

    async fn handle_catlog(&mut self, payload: &[u8]) -> io::Result<()> {
        let Ok((flags, handle)) = proto::decode_catlog_request(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };
        let Some(id) = self.lookup(handle) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };

        let buffer = self.sup.with_set(|set| {
            if set.log_type_of(id) != crate::LogType::Buffer {
                return None;
            }
            set.log_buffer_of(id)
        });

        match buffer {
            None => self.reply(proto::RPLY_NAK, &[]).await,
            Some(buf) => {
                let data = if flags & proto::CATLOG_FLAG_CLEAR != 0 {
                    buf.snapshot_and_clear()
                } else {
                    buf.snapshot()
                };
                self.reply(proto::RPLY_SVC_LOG, &proto::encode_svc_log(&data))
                    .await
            }
        }
    }

    async fn handle_boot_time(&mut self) -> io::Result<()> {
        let info = self.sup.with_set(|set| {
            let services = set
                .all_services()
                .into_iter()
                .map(|id| proto::BootTimeEntry {
                    name: set.rec(id).name.clone(),
                    startup_ns: set.rec(id).startup_duration().as_nanos() as i64,
                    state: set.rec(id).state,
                    svc_type: set.service_type(id),
                    pid: set.pid_of(id).max(0),
                })
                .collect();
            proto::BootTimeInfo {
                kernel_uptime_ns: set.kernel_uptime().as_nanos() as i64,
                boot_start_ns: set.boot_start_time().map(unix_nanos).unwrap_or(0),
                boot_ready_ns: set.boot_ready_time().map(unix_nanos).unwrap_or(0),
                boot_svc_name: set.boot_service_name().to_string(),
                services,
            }
        });

        self.reply(proto::RPLY_BOOT_TIME, &proto::encode_boot_time(&info))
            .await
    }

    async fn handle_close_handle(&mut self, payload: &[u8]) -> io::Result<()> {
        let Ok(handle) = proto::decode_handle(payload) else {
            return self.reply(proto::RPLY_BAD_REQ, &[]).await;
        };
        self.handles.remove(&handle);
        self.reply(proto::RPLY_ACK, &[]).await
    }

    fn handle_from(&self, payload: &[u8]) -> Option<ServiceId> {
        let handle = proto::decode_handle(payload).ok()?;
        self.lookup(handle)
    }
}

fn unix_nanos(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn status_flags(set: &crate::ServiceSet, id: ServiceId) -> u8 {
    let mut flags = 0u8;
    if set.pid_of(id) > 0 {
        flags |= proto::STATUS_FLAG_HAS_PID;
    }
    if set.rec(id).is_marked_active() {
        flags |= proto::STATUS_FLAG_MARKED_ACTIVE;
    }
    if set.rec(id).waiting_for_deps {
        flags |= proto::STATUS_FLAG_WAITING_DEPS;
    }
    if set.rec(id).have_console {
        flags |= proto::STATUS_FLAG_HAS_CONSOLE;
    }
    flags
}

pub(crate) fn svc_info_entry(set: &crate::ServiceSet, id: ServiceId) -> proto::SvcInfoEntry {
    proto::SvcInfoEntry {
        name: set.rec(id).name.clone(),
        state: set.rec(id).state,
        target_state: set.rec(id).desired,
        svc_type: set.service_type(id),
        flags: status_flags(set, id),
        pid: set.pid_of(id),
    }
}
