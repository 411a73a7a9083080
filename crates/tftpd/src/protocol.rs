//! TFTP protocol state machine
//!
//! Interprets one inbound packet against the session it arrived on and
//! produces the outbound packet and state transition. Sessions that reach
//! a terminal point are handed back to the scheduler as an [`Exit`], the
//! state machine never reclaims them itself.
//!
//! A read transfer moves through
//!
//! ```text
//! Init -> Sending -> WaitAck -(ACK n)-> Sending -> WaitAck ... (short block)
//!      -> CloseWait/WaitAck -(ACK last)-> exit
//! ```
//!
//! and a rejected request through `Init -> SendingError -> ErrorWait/WaitAck`.

use bytes::BytesMut;
use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::buffer::Datagram;
use crate::codec::{DATA_MAX_SIZE, ErrorCode, Packet, Request, RequestKind, encode_data, encode_error};
use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::fs::{FileStatus, file_status, resolve_path, status_from_io};
use crate::session::{
    ExitReason, Session, SessionId, SessionKind, SessionState, SessionTable, TransferInfo,
};
use crate::stats::Stats;
use crate::transport;

/// Transfer parameters the state machine consults
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory requested names resolve under
    pub root_dir: PathBuf,
    pub max_file_size: u64,
    pub initial_interval: Duration,
    pub max_retransmits: u32,
}

impl Settings {
    pub fn from_config(config: &TftpConfig) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            max_file_size: config.max_file_size_bytes,
            initial_interval: config.session.initial_retransmit(),
            max_retransmits: config.session.max_retransmits,
        }
    }
}

/// Server state handed to every protocol operation
pub struct Context<'a> {
    pub table: &'a mut SessionTable,
    pub stats: &'a mut Stats,
    pub audit: &'a AuditLogger,
    pub settings: &'a Settings,
}

/// A session that reached a terminal point and must be joined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub id: SessionId,
    pub reason: ExitReason,
}

impl Exit {
    fn normal(id: SessionId) -> Self {
        Self {
            id,
            reason: ExitReason::Normal,
        }
    }

    fn error(id: SessionId) -> Self {
        Self {
            id,
            reason: ExitReason::Error,
        }
    }
}

/// Feed one received datagram to the session that owns its socket
pub fn input(ctx: &mut Context<'_>, id: SessionId, datagram: Datagram) -> Option<Exit> {
    let peer = datagram.peer_addr();

    let packet = match Packet::decode(datagram.payload()) {
        Ok(packet) => packet,
        Err(e) => {
            // no reply: nothing in the datagram has been validated
            debug!("Dropping datagram from {}: {}", peer, e);
            ctx.stats.transport.dropped += 1;
            ctx.audit.protocol_violation(peer, &e.to_string());
            return None;
        }
    };

    let Some(kind) = ctx.table.get(id).map(|session| session.kind) else {
        warn!("Datagram for unknown session {}", id);
        return None;
    };

    match packet {
        Packet::Request {
            kind: RequestKind::Read,
            request,
        } => {
            if kind != SessionKind::Portal {
                debug!("Session {}: RRQ on a transfer socket dropped", id);
                ctx.stats.transport.dropped += 1;
                return None;
            }
            info!(
                "Read request for \"{}\" from {} on {}",
                request.display_name(),
                peer,
                datagram.local_addr()
            );
            rrq_input(ctx, datagram.local_addr(), peer, request)
        }
        Packet::Request {
            kind: RequestKind::Write,
            request,
        } => {
            debug!("WRQ for \"{}\" from {} ignored", request.display_name(), peer);
            ctx.stats.transport.dropped += 1;
            ctx.audit.protocol_violation(peer, "write requests are not supported");
            None
        }
        Packet::Ack { block } => ack_input(ctx, id, block),
        Packet::Data { block, .. } => {
            debug!("Session {}: DATA block {} from {} ignored", id, block, peer);
            ctx.stats.transport.dropped += 1;
            None
        }
        Packet::Error { code, message } => error_input(ctx, id, kind, code, &message),
    }
}

/// Admit or reject a read request arriving on the portal.
///
/// The transfer gets its own socket and session. A rejection is still a
/// live session: it waits in ErrorWait for an optional acknowledgment.
fn rrq_input(
    ctx: &mut Context<'_>,
    local: SocketAddr,
    peer: SocketAddr,
    request: Request,
) -> Option<Exit> {
    let correlation_id = AuditLogger::generate_correlation_id();
    let filename = request.display_name().into_owned();
    ctx.audit
        .read_request(peer, &filename, &request.display_mode(), &correlation_id);

    let socket = match transport::open_transfer(Some(local), peer) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Cannot start transfer for {}: {}", peer, e);
            ctx.stats.transport.errors += 1;
            return None;
        }
    };

    let id = match ctx
        .table
        .insert(SessionKind::Read, socket, Some(peer), ctx.settings.initial_interval)
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Read request from {} dropped: {}", peer, e);
            ctx.audit.resource_exhaustion(
                "sessions",
                &ctx.table.len().to_string(),
                &ctx.table.capacity().to_string(),
            );
            return None;
        }
    };

    if let Some(session) = ctx.table.get_mut(id) {
        session.transfer = Some(TransferInfo {
            filename: filename.clone(),
            correlation_id: correlation_id.clone(),
            started: Instant::now(),
            bytes_sent: 0,
        });
    }

    match admit(ctx.settings, &request) {
        Ok((file, size)) => start_transfer(ctx, id, file, size),
        Err((code, reason)) => {
            info!(
                "Session {}: read request for \"{}\" rejected: {}",
                id, filename, reason
            );
            ctx.stats.transfer.rejected += 1;
            ctx.audit
                .read_denied(peer, &filename, reason, code.code(), &correlation_id);
            match error_output(ctx, id, code) {
                Ok(()) => None,
                Err(e) => {
                    warn!("Session {}: cannot send error: {}", id, e);
                    Some(Exit::error(id))
                }
            }
        }
    }
}

/// Send the first block of an admitted file; the RRQ counts as its ACK 0
fn start_transfer(ctx: &mut Context<'_>, id: SessionId, file: File, size: u64) -> Option<Exit> {
    if let Some(session) = ctx.table.get_mut(id) {
        session.file = Some(file);
    }
    if let Err(e) = data_output(ctx, id) {
        warn!("Session {}: cannot start transfer: {}", id, e);
        return Some(Exit::error(id));
    }

    let session = ctx.table.get(id)?;
    // the first read failed and an ERROR went out instead
    if session.kind == SessionKind::ErrorWait {
        return None;
    }
    ctx.stats.transfer.accepted += 1;
    if let (Some(transfer), Some(peer)) = (session.transfer.as_ref(), session.peer()) {
        info!("Session {}: request for \"{}\" accepted", id, transfer.filename);
        ctx.audit
            .transfer_started(peer, &transfer.filename, size, &transfer.correlation_id);
    }
    None
}

/// Validate mode and target, then open the file.
///
/// Returns the open file and its size, or the error code to send.
fn admit(
    settings: &Settings,
    request: &Request,
) -> std::result::Result<(File, u64), (ErrorCode, &'static str)> {
    if !request.is_octet() {
        return Err((ErrorCode::IllegalOperation, "unsupported transfer mode"));
    }

    let path = resolve_path(&settings.root_dir, &request.filename)
        .ok_or((ErrorCode::AccessViolation, "path outside root directory"))?;

    let status = file_status(&path, settings.max_file_size);
    if status != FileStatus::Ok {
        return Err((rejection_code(status), status.describe()));
    }

    let file = File::open(&path).map_err(|e| {
        let status = status_from_io(&e);
        (rejection_code(status), status.describe())
    })?;
    let size = file.metadata().map(|meta| meta.len()).unwrap_or(0);
    Ok((file, size))
}

/// RFC 1350 error code for a refused file
pub fn rejection_code(status: FileStatus) -> ErrorCode {
    match status {
        FileStatus::Ok | FileStatus::Unknown => ErrorCode::NotDefined,
        FileStatus::NotFound => ErrorCode::FileNotFound,
        FileStatus::AccessDenied => ErrorCode::AccessViolation,
        FileStatus::TooBig | FileStatus::NotRegular => ErrorCode::IllegalOperation,
    }
}

/// Match an acknowledgment against the outstanding block.
///
/// Anything but an exact match is ignored without resending, so duplicate
/// ACKs cannot multiply DATA packets.
fn ack_input(ctx: &mut Context<'_>, id: SessionId, block: u16) -> Option<Exit> {
    let session = ctx.table.get(id)?;
    if session.state() != SessionState::WaitAck {
        debug!("Session {}: ACK {} while not waiting for one", id, block);
        return None;
    }
    if session.block != block {
        debug!(
            "Session {}: block number mismatch, expect {}, received {}",
            id, session.block, block
        );
        return None;
    }

    match session.kind {
        SessionKind::Read => {
            let Some(next) = session.block.checked_add(1) else {
                warn!("Session {}: file outgrew the block number space", id);
                fail_transfer(ctx, id, "file outgrew the block number space");
                return error_output(ctx, id, ErrorCode::IllegalOperation)
                    .err()
                    .map(|_| Exit::error(id));
            };
            if let Some(session) = ctx.table.get_mut(id) {
                session.block = next;
            }
            match data_output(ctx, id) {
                Ok(()) => None,
                Err(e) => {
                    warn!("Session {}: cannot send block {}: {}", id, next, e);
                    Some(Exit::error(id))
                }
            }
        }
        SessionKind::CloseWait => {
            complete_transfer(ctx, id);
            Some(Exit::normal(id))
        }
        SessionKind::ErrorWait => Some(Exit::error(id)),
        SessionKind::Portal | SessionKind::Write => {
            warn!("Session {}: ACK on {:?} session", id, session.kind);
            None
        }
    }
}

/// A client ERROR ends its transfer; the portal ignores them
fn error_input(
    ctx: &mut Context<'_>,
    id: SessionId,
    kind: SessionKind,
    code: u16,
    message: &str,
) -> Option<Exit> {
    match kind {
        SessionKind::Portal => {
            debug!("ERROR {} on portal ignored", code);
            ctx.stats.transport.dropped += 1;
            None
        }
        SessionKind::ErrorWait => Some(Exit::error(id)),
        SessionKind::Read | SessionKind::CloseWait | SessionKind::Write => {
            info!("Session {}: client aborted with error {}: {}", id, code, message);
            fail_transfer(ctx, id, &format!("client error {}: {}", code, message));
            Some(Exit::error(id))
        }
    }
}

/// Read the next block, send it and wait for its ACK.
///
/// A short block marks the session CloseWait. A failed send still leaves the
/// session waiting so the retransmission timer retries it.
pub fn data_output(ctx: &mut Context<'_>, id: SessionId) -> Result<()> {
    ctx.table.set_state(id, SessionState::Sending, Instant::now())?;

    let session = ctx.table.get_mut(id).ok_or(TftpError::UnknownSession(id))?;
    let mut block = [0u8; DATA_MAX_SIZE];
    let read = match session.file.as_mut() {
        Some(file) => read_block(file, &mut block),
        None => Err(io::Error::other("no file open")),
    };

    let len = match read {
        Ok(len) => len,
        Err(e) => {
            warn!("Session {}: read failed at block {}: {}", id, session.block, e);
            fail_transfer(ctx, id, &format!("read error: {}", e));
            return error_output(ctx, id, ErrorCode::NotDefined);
        }
    };

    let packet = encode_data(session.block, &block[..len], DATA_MAX_SIZE);
    session.retransmit.store(&packet)?;
    if len < DATA_MAX_SIZE {
        debug!("Session {}: final block {} ({} bytes)", id, session.block, len);
        session.kind = SessionKind::CloseWait;
    }
    if let Some(transfer) = session.transfer.as_mut() {
        transfer.bytes_sent += len as u64;
    }

    transmit(session, packet, ctx.stats);
    ctx.table.set_state(id, SessionState::WaitAck, Instant::now())
}

/// Send an ERROR with the fixed message for `code` and wait for an optional ACK
pub fn error_output(ctx: &mut Context<'_>, id: SessionId, code: ErrorCode) -> Result<()> {
    debug!("Session {}: sending error {}", id, code);
    ctx.table
        .set_state(id, SessionState::SendingError, Instant::now())?;

    let session = ctx.table.get_mut(id).ok_or(TftpError::UnknownSession(id))?;
    session.kind = SessionKind::ErrorWait;
    session.file = None;

    let packet = encode_error(code);
    // kept so the buffer mirrors WaitAck; never resent
    session.retransmit.store(&packet)?;
    transmit(session, packet, ctx.stats);
    ctx.table.set_state(id, SessionState::WaitAck, Instant::now())
}

/// Handle a session whose retransmission interval ran out
pub fn retransmit(ctx: &mut Context<'_>, id: SessionId, now: Instant) -> Option<Exit> {
    let max_retransmits = ctx.settings.max_retransmits;
    let session = ctx.table.get_mut(id)?;

    // RFC 1350: an error packet is never retransmitted
    if session.kind == SessionKind::ErrorWait {
        return Some(Exit::error(id));
    }
    if session.state() != SessionState::WaitAck {
        warn!("Session {}: retransmit while in {:?}", id, session.state());
        return None;
    }
    if session.attempts() >= max_retransmits {
        warn!(
            "Session {}: timeout after {} retransmissions of block {}",
            id,
            session.attempts(),
            session.block
        );
        ctx.stats.transfer.timeouts += 1;
        fail_transfer(ctx, id, "timeout");
        return Some(Exit::error(id));
    }

    let packet = BytesMut::from(session.retransmit.as_slice());
    transmit(session, packet, ctx.stats);
    session.back_off(now);
    ctx.stats.transfer.retransmits += 1;
    debug!(
        "Session {}: block {} retransmitted ({} of {}), next in {:?}",
        id,
        session.block,
        session.attempts(),
        max_retransmits,
        session.interval()
    );
    None
}

/// Fill `buf` unless the file ends first
fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn transmit(session: &Session, packet: BytesMut, stats: &mut Stats) {
    let (Some(peer), Ok(local)) = (session.peer(), session.socket().local_addr()) else {
        warn!("Session {}: socket has no peer", session.id());
        stats.transport.errors += 1;
        return;
    };

    match transport::send(session.socket(), Datagram::outbound(packet, local, peer)) {
        Ok(_) => stats.transport.datagrams_out += 1,
        Err(e) => {
            warn!("Session {}: {}", session.id(), e);
            stats.transport.errors += 1;
        }
    }
}

fn complete_transfer(ctx: &mut Context<'_>, id: SessionId) {
    let Some(session) = ctx.table.get(id) else {
        return;
    };
    ctx.stats.transfer.completed += 1;
    if let (Some(transfer), Some(peer)) = (session.transfer.as_ref(), session.peer()) {
        let elapsed = transfer.started.elapsed();
        info!(
            "Session {}: \"{}\" sent to {} ({} bytes, {} blocks, {:?})",
            id, transfer.filename, peer, transfer.bytes_sent, session.block, elapsed
        );
        ctx.audit.transfer_completed(
            peer,
            &transfer.filename,
            transfer.bytes_sent,
            session.block,
            elapsed.as_millis() as u64,
            &transfer.correlation_id,
        );
    }
}

fn fail_transfer(ctx: &mut Context<'_>, id: SessionId, error: &str) {
    let Some(session) = ctx.table.get(id) else {
        return;
    };
    ctx.stats.transfer.failed += 1;
    if let (Some(transfer), Some(peer)) = (session.transfer.as_ref(), session.peer()) {
        ctx.audit.transfer_failed(
            peer,
            &transfer.filename,
            error,
            session.block.saturating_sub(1),
            &transfer.correlation_id,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_ack;
    use bytes::Bytes;
    use tokio::net::UdpSocket;

    struct Fixture {
        table: SessionTable,
        stats: Stats,
        audit: AuditLogger,
        settings: Settings,
        client: UdpSocket,
        id: SessionId,
    }

    impl Fixture {
        /// A read session connected to a local client socket
        async fn new(root: PathBuf) -> Self {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let peer = client.local_addr().unwrap();
            let socket = transport::open_transfer(None, peer).unwrap();
            client.connect(socket.local_addr().unwrap()).await.unwrap();

            let settings = Settings {
                root_dir: root,
                max_file_size: crate::codec::FILE_MAX_SIZE,
                initial_interval: Duration::from_millis(500),
                max_retransmits: 5,
            };
            let mut table = SessionTable::new(4);
            let id = table
                .insert(SessionKind::Read, socket, Some(peer), settings.initial_interval)
                .unwrap();

            Self {
                table,
                stats: Stats::new(),
                audit: AuditLogger::new(false),
                settings,
                client,
                id,
            }
        }

        fn ctx(&mut self) -> Context<'_> {
            Context {
                table: &mut self.table,
                stats: &mut self.stats,
                audit: &self.audit,
                settings: &self.settings,
            }
        }

        fn open(&mut self, contents: &[u8]) {
            let path = self.settings.root_dir.join("file");
            std::fs::write(&path, contents).unwrap();
            self.table.get_mut(self.id).unwrap().file = Some(File::open(path).unwrap());
        }

        async fn recv(&self) -> Vec<u8> {
            let mut buf = [0u8; 1024];
            let len = tokio::time::timeout(Duration::from_secs(2), self.client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            buf[..len].to_vec()
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_protocol_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn rejection_codes_follow_file_status() {
        assert_eq!(rejection_code(FileStatus::NotFound).code(), 1);
        assert_eq!(rejection_code(FileStatus::AccessDenied).code(), 2);
        assert_eq!(rejection_code(FileStatus::TooBig).code(), 4);
        assert_eq!(rejection_code(FileStatus::NotRegular).code(), 4);
        assert_eq!(rejection_code(FileStatus::Unknown).code(), 0);
    }

    #[test]
    fn admission_checks_mode_before_file() {
        let root = temp_dir("admit");
        std::fs::write(root.join("boot"), b"x").unwrap();
        let settings = Settings {
            root_dir: root,
            max_file_size: crate::codec::FILE_MAX_SIZE,
            initial_interval: Duration::from_millis(500),
            max_retransmits: 5,
        };

        let request = |filename: &str, mode: &[u8]| Request {
            filename: Bytes::copy_from_slice(filename.as_bytes()),
            mode: Bytes::copy_from_slice(mode),
        };

        assert!(admit(&settings, &request("boot", b"OCTET")).is_ok());
        assert_eq!(
            admit(&settings, &request("boot", b"netascii")).unwrap_err().0,
            ErrorCode::IllegalOperation
        );
        assert_eq!(
            admit(&settings, &request("missing", b"octet")).unwrap_err().0,
            ErrorCode::FileNotFound
        );
        assert_eq!(
            admit(&settings, &request("../boot", b"octet")).unwrap_err().0,
            ErrorCode::AccessViolation
        );
        assert_eq!(
            admit(&settings, &request("boot", b"\xff\xfe")).unwrap_err().0,
            ErrorCode::IllegalOperation
        );
    }

    #[tokio::test]
    async fn short_block_marks_close_wait_and_final_ack_exits() {
        let mut fx = Fixture::new(temp_dir("short")).await;
        fx.open(b"hello");
        let id = fx.id;

        data_output(&mut fx.ctx(), id).unwrap();
        assert_eq!(fx.recv().await, b"\x00\x03\x00\x01hello");

        let session = fx.table.get(id).unwrap();
        assert_eq!(session.kind, SessionKind::CloseWait);
        assert_eq!(session.state(), SessionState::WaitAck);
        assert_eq!(session.retransmit.as_slice(), b"\x00\x03\x00\x01hello");
        assert!(fx.table.is_waiting(id));

        // stale ack is ignored, matching ack closes
        assert_eq!(ack_input(&mut fx.ctx(), id, 0), None);
        assert_eq!(ack_input(&mut fx.ctx(), id, 1), Some(Exit::normal(id)));
        assert_eq!(fx.stats.transfer.completed, 1);
    }

    #[tokio::test]
    async fn full_block_is_followed_by_next_block_on_ack() {
        let mut fx = Fixture::new(temp_dir("full")).await;
        fx.open(&[7u8; DATA_MAX_SIZE]);
        let id = fx.id;

        data_output(&mut fx.ctx(), id).unwrap();
        assert_eq!(fx.recv().await.len(), 4 + DATA_MAX_SIZE);
        assert_eq!(fx.table.get(id).unwrap().kind, SessionKind::Read);

        assert_eq!(ack_input(&mut fx.ctx(), id, 1), None);
        assert_eq!(fx.recv().await, b"\x00\x03\x00\x02");
        let session = fx.table.get(id).unwrap();
        assert_eq!(session.block, 2);
        assert_eq!(session.kind, SessionKind::CloseWait);

        // duplicate of the first ack sends nothing
        assert_eq!(ack_input(&mut fx.ctx(), id, 1), None);
        assert_eq!(fx.stats.transport.datagrams_out, 2);
    }

    #[tokio::test]
    async fn retransmission_resends_exact_bytes_then_times_out() {
        let mut fx = Fixture::new(temp_dir("retrans")).await;
        fx.open(b"abc");
        let id = fx.id;

        data_output(&mut fx.ctx(), id).unwrap();
        let first = fx.recv().await;

        let now = Instant::now();
        for attempt in 1..=5 {
            assert_eq!(retransmit(&mut fx.ctx(), id, now), None);
            assert_eq!(fx.recv().await, first);
            let session = fx.table.get(id).unwrap();
            assert_eq!(session.attempts(), attempt);
            assert_eq!(session.interval(), Duration::from_millis(500) * 2u32.pow(attempt));
        }

        assert_eq!(retransmit(&mut fx.ctx(), id, now), Some(Exit::error(id)));
        assert_eq!(fx.stats.transfer.retransmits, 5);
        assert_eq!(fx.stats.transfer.timeouts, 1);
    }

    #[tokio::test]
    async fn error_is_sent_once_and_never_retransmitted() {
        let mut fx = Fixture::new(temp_dir("error")).await;
        let id = fx.id;

        error_output(&mut fx.ctx(), id, ErrorCode::FileNotFound).unwrap();
        assert_eq!(fx.recv().await, b"\x00\x05\x00\x01File not found\x00");

        let session = fx.table.get(id).unwrap();
        assert_eq!(session.kind, SessionKind::ErrorWait);
        assert_eq!(session.state(), SessionState::WaitAck);

        assert_eq!(retransmit(&mut fx.ctx(), id, Instant::now()), Some(Exit::error(id)));
        assert_eq!(fx.stats.transport.datagrams_out, 1);
    }

    #[tokio::test]
    async fn stray_ack_on_error_session_is_ignored() {
        let mut fx = Fixture::new(temp_dir("stray")).await;
        let id = fx.id;
        error_output(&mut fx.ctx(), id, ErrorCode::FileNotFound).unwrap();

        assert_eq!(ack_input(&mut fx.ctx(), id, 9), None);
        assert!(fx.table.is_waiting(id));
        assert_eq!(ack_input(&mut fx.ctx(), id, 1), Some(Exit::error(id)));
    }

    #[tokio::test]
    async fn retransmission_backs_off_when_the_peer_is_gone() {
        let mut fx = Fixture::new(temp_dir("gone")).await;
        fx.open(b"abc");
        let id = fx.id;

        data_output(&mut fx.ctx(), id).unwrap();
        fx.recv().await;

        // ICMP port unreachable makes later sends on the connected socket fail
        let gone = fx.client.local_addr().unwrap();
        fx.client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(fx.client.local_addr().unwrap(), gone);

        let now = Instant::now();
        for attempt in 1..=5 {
            assert_eq!(retransmit(&mut fx.ctx(), id, now), None);
            let session = fx.table.get(id).unwrap();
            assert_eq!(session.attempts(), attempt);
            assert_eq!(session.interval(), Duration::from_millis(500) * 2u32.pow(attempt));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fx.stats.transport.errors >= 1);

        assert_eq!(retransmit(&mut fx.ctx(), id, now), Some(Exit::error(id)));
        assert_eq!(fx.stats.transfer.retransmits, 5);
        assert_eq!(fx.stats.transfer.timeouts, 1);
    }

    #[tokio::test]
    async fn unreadable_first_block_is_not_counted_as_accepted() {
        let root = temp_dir("unreadable");
        let mut fx = Fixture::new(root.clone()).await;
        let id = fx.id;
        let peer = fx.client.local_addr().unwrap();
        fx.table.get_mut(id).unwrap().transfer = Some(TransferInfo {
            filename: "boot".to_string(),
            correlation_id: AuditLogger::generate_correlation_id(),
            started: Instant::now(),
            bytes_sent: 0,
        });
        assert_eq!(fx.table.get(id).unwrap().peer(), Some(peer));

        // reading a directory handle fails with EISDIR
        let dir = File::open(&root).unwrap();
        assert_eq!(start_transfer(&mut fx.ctx(), id, dir, 0), None);
        assert_eq!(fx.recv().await, b"\x00\x05\x00\x00Unknown error\x00");

        assert_eq!(fx.table.get(id).unwrap().kind, SessionKind::ErrorWait);
        assert_eq!(fx.stats.transfer.accepted, 0);
        assert_eq!(fx.stats.transfer.failed, 1);
    }

    #[tokio::test]
    async fn readable_first_block_is_counted_as_accepted() {
        let root = temp_dir("readable");
        std::fs::write(root.join("boot"), b"kernel").unwrap();
        let mut fx = Fixture::new(root.clone()).await;
        let id = fx.id;

        let file = File::open(root.join("boot")).unwrap();
        assert_eq!(start_transfer(&mut fx.ctx(), id, file, 6), None);
        assert_eq!(fx.recv().await, b"\x00\x03\x00\x01kernel");
        assert_eq!(fx.stats.transfer.accepted, 1);
        assert_eq!(fx.stats.transfer.failed, 0);
    }

    #[tokio::test]
    async fn client_error_aborts_transfer() {
        let mut fx = Fixture::new(temp_dir("abort")).await;
        fx.open(&[1u8; 2048]);
        let id = fx.id;
        data_output(&mut fx.ctx(), id).unwrap();

        let peer = fx.client.local_addr().unwrap();
        let local = fx.table.get(id).unwrap().socket().local_addr().unwrap();
        let mut datagram = Datagram::for_receive(local);
        let abort = crate::codec::encode_error(ErrorCode::NotDefined);
        datagram.payload_mut()[..abort.len()].copy_from_slice(&abort);
        datagram.truncate_received(abort.len(), peer);

        assert_eq!(input(&mut fx.ctx(), id, datagram), Some(Exit::error(id)));
        assert_eq!(fx.stats.transfer.failed, 1);
    }

    #[tokio::test]
    async fn short_datagrams_are_dropped() {
        let mut fx = Fixture::new(temp_dir("drop")).await;
        let id = fx.id;
        let peer = fx.client.local_addr().unwrap();
        let local = fx.table.get(id).unwrap().socket().local_addr().unwrap();

        let ack = encode_ack(1);
        let mut datagram = Datagram::for_receive(local);
        datagram.payload_mut()[..3].copy_from_slice(&ack[..3]);
        datagram.truncate_received(3, peer);

        assert_eq!(input(&mut fx.ctx(), id, datagram), None);
        assert_eq!(fx.stats.transport.dropped, 1);
        assert_eq!(fx.table.get(id).unwrap().state(), SessionState::Init);
    }
}
