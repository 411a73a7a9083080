//! Sessions and the session table
//!
//! A session is one TFTP exchange bound to one UDP socket: the portal that
//! listens on the service port, a read transfer, or the short wait after a
//! final block or an error. The table is a fixed-capacity arena addressed by
//! slot; a [`SessionId`] pairs the slot with a serial number so an id held
//! past its session's reclamation never resolves to the slot's next tenant.

use bytes::BytesMut;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Result, TftpError};

/// Capacity of the per-session copy of the last packet sent.
/// Must hold a full DATA packet (4 + 512) and any ERROR packet.
pub const RETRANSMIT_CAPACITY: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    serial: u64,
    slot: usize,
}

impl SessionId {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Listens on the service port and spawns read sessions
    Portal,
    Read,
    /// Write transfers are not served; kept for completeness of the model
    Write,
    /// Final block sent, waiting for its acknowledgment
    CloseWait,
    /// Error packet sent, waiting for an optional acknowledgment
    ErrorWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Portal,
    WaitAck,
    Sending,
    SendingError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Error,
}

/// Exact bytes of the last packet sent, resent verbatim on timeout
#[derive(Debug)]
pub struct RetransmitBuffer {
    bytes: BytesMut,
}

impl RetransmitBuffer {
    fn new() -> Self {
        Self {
            bytes: BytesMut::with_capacity(RETRANSMIT_CAPACITY),
        }
    }

    pub fn store(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() > RETRANSMIT_CAPACITY {
            return Err(TftpError::RetransmitOverflow {
                size: packet.len(),
                capacity: RETRANSMIT_CAPACITY,
            });
        }
        self.bytes.clear();
        self.bytes.extend_from_slice(packet);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Bookkeeping for the audit trail of one read transfer
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub filename: String,
    pub correlation_id: String,
    pub started: Instant,
    pub bytes_sent: u64,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    pub kind: SessionKind,
    state: SessionState,
    /// Block currently outstanding (or about to be sent)
    pub block: u16,
    pub file: Option<File>,
    pub retransmit: RetransmitBuffer,
    initial_interval: Duration,
    interval: Duration,
    attempts: u32,
    last_send: Instant,
    pub transfer: Option<TransferInfo>,
}

impl Session {
    fn new(
        id: SessionId,
        kind: SessionKind,
        socket: UdpSocket,
        peer: Option<SocketAddr>,
        initial_interval: Duration,
    ) -> Self {
        Self {
            id,
            socket,
            peer,
            kind,
            state: SessionState::Init,
            block: if kind == SessionKind::Read { 1 } else { 0 },
            file: None,
            retransmit: RetransmitBuffer::new(),
            initial_interval,
            interval: initial_interval,
            attempts: 0,
            last_send: Instant::now(),
            transfer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_send(&self) -> Instant {
        self.last_send
    }

    /// Restart the retransmission clock without counting a retry
    pub fn reset_timer(&mut self, now: Instant) {
        self.last_send = now;
    }

    /// Account for one retransmission: double the interval, count the try
    pub fn back_off(&mut self, now: Instant) {
        self.interval = self.interval.saturating_mul(2);
        self.attempts += 1;
        self.last_send = now;
    }

    /// Entering WaitAck starts the timer. Any other state drops the
    /// retransmission copy and rewinds interval and attempt counter.
    fn enter(&mut self, state: SessionState, now: Instant) {
        if state == SessionState::WaitAck {
            self.last_send = now;
        } else {
            self.interval = self.initial_interval;
            self.attempts = 0;
            self.retransmit.clear();
        }
        debug!("Session {} state {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    /// Release the socket and any open file
    fn close(self) {
        crate::transport::close(self.socket);
        drop(self.file);
    }
}

/// Ordered set of sessions currently waiting for an acknowledgment
#[derive(Debug, Default)]
pub struct WaitList {
    ids: BTreeSet<SessionId>,
}

impl WaitList {
    pub fn insert(&mut self, id: SessionId) -> bool {
        self.ids.insert(id)
    }

    pub fn remove(&mut self, id: SessionId) -> bool {
        self.ids.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn to_vec(&self) -> Vec<SessionId> {
        self.ids.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Option<Session>>,
    live: usize,
    /// Highest occupied slot; bounds the readiness scan
    max_live_slot: Option<usize>,
    wait: WaitList,
    next_serial: u64,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            live: 0,
            max_live_slot: None,
            wait: WaitList::default(),
            next_serial: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Register a new session in the lowest free slot.
    ///
    /// When the table is full the socket is closed and `TableFull` returned.
    pub fn insert(
        &mut self,
        kind: SessionKind,
        socket: UdpSocket,
        peer: Option<SocketAddr>,
        initial_interval: Duration,
    ) -> Result<SessionId> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            crate::transport::close(socket);
            return Err(TftpError::TableFull {
                capacity: self.capacity(),
            });
        };

        let id = SessionId {
            serial: self.next_serial,
            slot,
        };
        self.next_serial += 1;
        self.slots[slot] = Some(Session::new(id, kind, socket, peer, initial_interval));
        self.live += 1;
        if self.max_live_slot.is_none_or(|max| slot > max) {
            self.max_live_slot = Some(slot);
        }
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.slots
            .get(id.slot)?
            .as_ref()
            .filter(|session| session.id == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots
            .get_mut(id.slot)?
            .as_mut()
            .filter(|session| session.id == id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    /// Move a session to `state`, keeping the wait list in step
    pub fn set_state(&mut self, id: SessionId, state: SessionState, now: Instant) -> Result<()> {
        let session = self.get_mut(id).ok_or(TftpError::UnknownSession(id))?;
        session.enter(state, now);
        if state == SessionState::WaitAck {
            self.wait.insert(id);
        } else {
            self.wait.remove(id);
        }
        Ok(())
    }

    /// Unregister a session, closing its socket and file
    pub fn reclaim(&mut self, id: SessionId) -> Result<()> {
        if !self.contains(id) {
            return Err(TftpError::UnknownSession(id));
        }
        self.wait.remove(id);
        let session = self.slots[id.slot].take().ok_or(TftpError::UnknownSession(id))?;
        self.live -= 1;
        if self.max_live_slot == Some(id.slot) {
            self.max_live_slot = self.slots.iter().rposition(Option::is_some);
        }
        session.close();
        Ok(())
    }

    /// Sessions currently waiting for an acknowledgment
    pub fn waiting(&self) -> Vec<SessionId> {
        self.wait.to_vec()
    }

    pub fn is_waiting(&self, id: SessionId) -> bool {
        self.wait.contains(id)
    }

    /// Live sessions in slot order
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        let end = self.max_live_slot.map_or(0, |max| max + 1);
        self.slots[..end].iter().flatten()
    }
}
