//! The control socket server.
//!
//! Binds a Unix stream socket (mode 0600, stale path removed first) and
//! accepts connections until stopped; each connection is served by its own
//! task.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::control::connection::Connection;
use crate::supervisor::Supervisor;

pub struct Server {
    sup: Arc<Supervisor>,
    sock_path: PathBuf,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(sup: Arc<Supervisor>, sock_path: impl AsRef<Path>) -> Self {
        Self {
            sup,
            sock_path: sock_path.as_ref().to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.sock_path
    }

    /// Binds the socket and spawns the accept loop.
    pub fn start(&self) -> io::Result<()> {
        // A stale socket from a previous run would make bind fail.
        match std::fs::remove_file(&self.sock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&self.sock_path)?;

        // Owner-only: the control protocol is full administrative access.
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.sock_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %self.sock_path.display(), "control socket listening");

        let sup = Arc::clone(&self.sup);
        let cancel = self.cancel.clone();
        tokio::spawn(accept_loop(listener, sup, cancel));
        Ok(())
    }

    /// Stops accepting, cancels live connections, removes the socket file.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.sock_path);
        info!("control socket stopped");
    }
}

async fn accept_loop(listener: UnixListener, sup: Arc<Supervisor>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                debug!("accepted control connection");
                let conn = Connection::new(Arc::clone(&sup), stream, cancel.child_token());
                tokio::spawn(conn.serve());
            }
            Err(e) => {
                error!(error = %e, "control socket accept error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::{self as proto};
    use crate::service::ServiceKind;
    use crate::ServiceState;
    use tokio::net::UnixStream;

    async fn test_server() -> (Arc<Supervisor>, Server, PathBuf, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("control.sock");
        let (sup, _rx) = Supervisor::new(Vec::new());
        let server = Server::new(Arc::clone(&sup), &sock);
        server.start().unwrap();
        (sup, server, sock, dir)
    }

    async fn load_handle(stream: &mut UnixStream, name: &str) -> u32 {
        proto::write_packet(stream, proto::CMD_LOAD_SERVICE, &proto::encode_name(name))
            .await
            .unwrap();
        let (rply, payload) = proto::read_packet(stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_SERVICE_RECORD);
        proto::decode_service_record(&payload).unwrap().handle
    }

    #[tokio::test]
    async fn query_version() {
        let (_sup, server, sock, _dir) = test_server().await;
        let mut stream = UnixStream::connect(&sock).await.unwrap();

        proto::write_packet(&mut stream, proto::CMD_QUERY_VERSION, &[])
            .await
            .unwrap();
        let (rply, payload) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_CP_VERSION);
        assert_eq!(
            u16::from_le_bytes([payload[0], payload[1]]),
            proto::PROTOCOL_VERSION
        );
        server.stop();
    }

    #[tokio::test]
    async fn find_unknown_service() {
        let (_sup, server, sock, _dir) = test_server().await;
        let mut stream = UnixStream::connect(&sock).await.unwrap();

        proto::write_packet(
            &mut stream,
            proto::CMD_FIND_SERVICE,
            &proto::encode_name("ghost"),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_NO_SERVICE);
        server.stop();
    }

    #[tokio::test]
    async fn start_stop_cycle_with_idempotent_replies() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("svc", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let handle = load_handle(&mut stream, "svc").await;

        // Start: ACK, then ALREADY on repeat.
        proto::write_packet(
            &mut stream,
            proto::CMD_START_SERVICE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ACK);
        sup.with_set(|set| {
            let id = set.find_service("svc", false).unwrap();
            assert_eq!(set.rec(id).state, ServiceState::Started);
        });

        proto::write_packet(
            &mut stream,
            proto::CMD_START_SERVICE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ALREADY_SS);

        // Stop: ACK, then ALREADY on repeat.
        proto::write_packet(
            &mut stream,
            proto::CMD_STOP_SERVICE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ACK);

        proto::write_packet(
            &mut stream,
            proto::CMD_STOP_SERVICE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ALREADY_SS);
        server.stop();
    }

    #[tokio::test]
    async fn repeated_load_reuses_handle() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("svc", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let h1 = load_handle(&mut stream, "svc").await;
        let h2 = load_handle(&mut stream, "svc").await;
        assert_eq!(h1, h2);
        server.stop();
    }

    #[tokio::test]
    async fn list_services_streams_entries() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("one", ServiceKind::Internal);
            set.add_service("two", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        proto::write_packet(&mut stream, proto::CMD_LIST_SERVICES, &[])
            .await
            .unwrap();

        let mut names = Vec::new();
        loop {
            let (rply, payload) = proto::read_packet(&mut stream).await.unwrap();
            if rply == proto::RPLY_LIST_DONE {
                break;
            }
            assert_eq!(rply, proto::RPLY_SVC_INFO);
            let (entry, _) = proto::decode_svc_info(&payload).unwrap();
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
        server.stop();
    }

    #[tokio::test]
    async fn set_trigger_nak_for_wrong_variant() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("plain", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let handle = load_handle(&mut stream, "plain").await;

        let mut payload = proto::encode_handle(handle);
        payload.push(1);
        proto::write_packet(&mut stream, proto::CMD_SET_TRIGGER, &payload)
            .await
            .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_NAK);
        server.stop();
    }

    #[tokio::test]
    async fn trigger_completes_start() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("trig", ServiceKind::Triggered { is_triggered: false });
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let handle = load_handle(&mut stream, "trig").await;

        proto::write_packet(
            &mut stream,
            proto::CMD_START_SERVICE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ACK);
        sup.with_set(|set| {
            let id = set.find_service("trig", false).unwrap();
            assert_eq!(set.rec(id).state, ServiceState::Starting);
        });

        let mut payload = proto::encode_handle(handle);
        payload.push(1);
        proto::write_packet(&mut stream, proto::CMD_SET_TRIGGER, &payload)
            .await
            .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ACK);
        sup.with_set(|set| {
            let id = set.find_service("trig", false).unwrap();
            assert_eq!(set.rec(id).state, ServiceState::Started);
        });
        server.stop();
    }

    #[tokio::test]
    async fn shutdown_command_reaches_event_loop() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("control.sock");
        let (sup, mut shutdown_rx) = Supervisor::new(Vec::new());
        let server = Server::new(Arc::clone(&sup), &sock);
        server.start().unwrap();

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        proto::write_packet(
            &mut stream,
            proto::CMD_SHUTDOWN,
            &[crate::ShutdownType::Poweroff as u8],
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ACK);

        assert_eq!(shutdown_rx.recv().await, Some(crate::ShutdownType::Poweroff));
        server.stop();
    }

    #[tokio::test]
    async fn unknown_command_is_bad_request() {
        let (_sup, server, sock, _dir) = test_server().await;
        let mut stream = UnixStream::connect(&sock).await.unwrap();
        proto::write_packet(&mut stream, 200, &[]).await.unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_BAD_REQ);
        // The connection stays usable afterwards.
        proto::write_packet(&mut stream, proto::CMD_QUERY_VERSION, &[])
            .await
            .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_CP_VERSION);
        server.stop();
    }

    #[tokio::test]
    async fn catlog_nak_without_buffer() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("svc", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let handle = load_handle(&mut stream, "svc").await;

        proto::write_packet(
            &mut stream,
            proto::CMD_CAT_LOG,
            &proto::encode_catlog_request(handle, false),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_NAK);
        server.stop();
    }

    #[tokio::test]
    async fn catlog_returns_and_clears_buffer() {
        use crate::service::{ProcessConfig, ProcessPayload};

        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            let mut payload = ProcessPayload::new(ProcessConfig {
                log_type: crate::LogType::Buffer,
                ..Default::default()
            });
            let buf = crate::service::logbuffer::LogBuffer::new(4096);
            buf.append(b"test output line 1\ntest output line 2\n");
            payload.log_buffer = Some(buf);
            set.add_service("buffered", ServiceKind::Process(Box::new(payload)));
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let handle = load_handle(&mut stream, "buffered").await;

        // Read with clear.
        proto::write_packet(
            &mut stream,
            proto::CMD_CAT_LOG,
            &proto::encode_catlog_request(handle, true),
        )
        .await
        .unwrap();
        let (rply, payload) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_SVC_LOG);
        let (_, data) = proto::decode_svc_log(&payload).unwrap();
        assert_eq!(data, b"test output line 1\ntest output line 2\n");

        // Second read: buffer is now empty.
        proto::write_packet(
            &mut stream,
            proto::CMD_CAT_LOG,
            &proto::encode_catlog_request(handle, false),
        )
        .await
        .unwrap();
        let (rply, payload) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_SVC_LOG);
        let (_, data) = proto::decode_svc_log(&payload).unwrap();
        assert!(data.is_empty());
        server.stop();
    }

    #[tokio::test]
    async fn boot_time_reports_timing() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.set_boot_start_time(std::time::SystemTime::now());
            set.set_boot_service_name("boot");
            set.set_kernel_uptime(std::time::Duration::from_secs(2));
            set.add_service("boot", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        proto::write_packet(&mut stream, proto::CMD_BOOT_TIME, &[])
            .await
            .unwrap();
        let (rply, payload) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_BOOT_TIME);
        let info = proto::decode_boot_time(&payload).unwrap();
        assert_eq!(info.boot_svc_name, "boot");
        assert_eq!(info.kernel_uptime_ns, 2_000_000_000);
        assert_eq!(info.boot_ready_ns, 0);
        assert_eq!(info.services.len(), 1);
        server.stop();
    }

    #[tokio::test]
    async fn close_handle_invalidates() {
        let (sup, server, sock, _dir) = test_server().await;
        sup.with_set(|set| {
            set.add_service("svc", ServiceKind::Internal);
        });

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        let handle = load_handle(&mut stream, "svc").await;

        proto::write_packet(
            &mut stream,
            proto::CMD_CLOSE_HANDLE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_ACK);

        proto::write_packet(
            &mut stream,
            proto::CMD_START_SERVICE,
            &proto::encode_handle(handle),
        )
        .await
        .unwrap();
        let (rply, _) = proto::read_packet(&mut stream).await.unwrap();
        assert_eq!(rply, proto::RPLY_BAD_REQ);
        server.stop();
    }
}
