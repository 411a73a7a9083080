//! Session scheduler
//!
//! One loop on one thread. Each pass waits for any session socket to become
//! readable, bounded by the poll interval while some session waits for an
//! acknowledgment, drains every readable socket into the protocol state
//! machine, then runs the retransmission pass. The readiness wait is the
//! only suspension point.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::task::Poll;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::protocol::{self, Context, Exit, Settings};
use crate::session::{ExitReason, SessionId, SessionKind, SessionState, SessionTable};
use crate::stats::Stats;
use crate::timer;
use crate::transport;

#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Ready(Vec<SessionId>),
    TimedOut,
}

pub struct Scheduler {
    settings: Settings,
    bind_host: Option<String>,
    port: u16,
    poll_interval: Duration,
    table: SessionTable,
    stats: Stats,
    audit: AuditLogger,
    portal: Option<SessionId>,
}

impl Scheduler {
    /// Build an empty scheduler; no socket is opened yet
    pub fn init(config: &TftpConfig) -> Self {
        Self {
            settings: Settings::from_config(config),
            bind_host: config.bind_host.clone(),
            port: config.port,
            poll_interval: config.session.poll_interval(),
            table: SessionTable::new(config.session.max_sessions),
            stats: Stats::new(),
            audit: AuditLogger::new(config.logging.audit_enabled),
            portal: None,
        }
    }

    /// Bind the service port and register the portal session.
    ///
    /// Must be called from within the runtime that will drive `run`.
    pub fn open_portal(&mut self) -> Result<SocketAddr> {
        let socket = transport::open_portal(self.bind_host.as_deref(), self.port)?;
        let local = socket.local_addr()?;

        let id = self.table.insert(
            SessionKind::Portal,
            socket,
            None,
            self.settings.initial_interval,
        )?;
        self.table
            .set_state(id, SessionState::Portal, Instant::now())?;
        self.portal = Some(id);

        info!("TFTP server listening on {}", local);
        self.audit.server_started(
            local,
            &self.settings.root_dir.display().to_string(),
            self.table.capacity(),
        );
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let portal = self.table.get(self.portal?)?;
        portal.socket().local_addr().ok()
    }

    /// Directory names resolve under; `/` once the process is chrooted
    pub fn set_root_dir(&mut self, root_dir: PathBuf) {
        self.settings.root_dir = root_dir;
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Serve until no session is left.
    ///
    /// The portal never exits on its own, so this only returns
    /// `TftpError::NoSessions`, which is fatal for the process.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.table.is_empty() {
                error!("No sessions left, scheduler stopping");
                self.stats.report(0);
                return Err(TftpError::NoSessions);
            }

            let waiting = !self.table.waiting().is_empty();
            let timeout = if waiting {
                Some(self.poll_interval)
            } else {
                self.stats.report(self.table.len());
                None
            };

            match self.wait_ready(timeout).await {
                Readiness::TimedOut if !waiting => {
                    error!("Timer expired with no session waiting for an ACK");
                }
                Readiness::TimedOut => self.retransmit_due(),
                Readiness::Ready(ready) => {
                    for id in ready {
                        self.dispatch(id);
                    }
                    self.retransmit_due();
                }
            }
        }
    }

    /// Wait until at least one live socket is readable, or `timeout` passes
    async fn wait_ready(&self, timeout: Option<Duration>) -> Readiness {
        let table = &self.table;
        let ready = poll_fn(|cx| {
            let ready: Vec<SessionId> = table
                .sessions()
                .filter(|session| session.socket().poll_recv_ready(cx).is_ready())
                .map(|session| session.id())
                .collect();

            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        });

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                Ok(ready) => Readiness::Ready(ready),
                Err(_) => Readiness::TimedOut,
            },
            None => Readiness::Ready(ready.await),
        }
    }

    /// Receive one datagram on a readable session and run it through the
    /// protocol
    fn dispatch(&mut self, id: SessionId) {
        // joined earlier in this pass
        let Some(session) = self.table.get(id) else {
            return;
        };

        let datagram = match transport::receive(session.socket()) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return,
            Err(e) => {
                // ICMP unreachable from a vanished client lands here
                debug!("Session {}: {}", id, e);
                self.stats.transport.errors += 1;
                return;
            }
        };
        self.stats.transport.datagrams_in += 1;

        let exit = protocol::input(&mut self.context(), id, datagram);
        if let Some(Exit { id, reason }) = exit {
            self.join(id, reason);
        }
    }

    fn retransmit_due(&mut self) {
        let now = Instant::now();
        let due = timer::due_sessions(&mut self.table, now, &mut self.stats.timer);

        for id in due {
            let exit = protocol::retransmit(&mut self.context(), id, now);
            if let Some(Exit { id, reason }) = exit {
                self.join(id, reason);
            }
        }
    }

    /// Reclaim a session: socket, file and slot are released together
    pub fn join(&mut self, id: SessionId, reason: ExitReason) {
        if self.portal == Some(id) {
            error!("Portal session {} exited ({:?})", id, reason);
            self.portal = None;
        }

        match self.table.reclaim(id) {
            Ok(()) => debug!("Session {} joined ({:?})", id, reason),
            Err(e) => warn!("Cannot join session {}: {}", id, e),
        }
    }

    fn context(&mut self) -> Context<'_> {
        Context {
            table: &mut self.table,
            stats: &mut self.stats,
            audit: &self.audit,
            settings: &self.settings,
        }
    }
}
