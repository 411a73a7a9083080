// Server counters
//
// Owned by the scheduler and only touched from its thread, so plain integers
// suffice. `report` logs a summary whenever the loop goes idle.
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub accepted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub retransmits: u64,
    pub timeouts: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub dropped: u64,
    pub errors: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimerStats {
    /// Sessions found due for retransmission
    pub expired: u64,
    /// Timestamps reset after the clock went backwards
    pub reset: u64,
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub transfer: TransferStats,
    pub transport: TransportStats,
    pub timer: TimerStats,
    reported: Option<(TransferStats, TransportStats, TimerStats)>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when any counter moved since the last report
    pub fn changed(&self) -> bool {
        match &self.reported {
            Some((transfer, transport, timer)) => {
                *transfer != self.transfer || *transport != self.transport || *timer != self.timer
            }
            None => true,
        }
    }

    pub fn report(&mut self, live_sessions: usize) {
        if !self.changed() {
            return;
        }

        info!("=== TFTP Statistics ===");
        info!(
            "Transfers: accepted={}, rejected={}, completed={}, failed={}, retransmits={}, timeouts={}",
            self.transfer.accepted,
            self.transfer.rejected,
            self.transfer.completed,
            self.transfer.failed,
            self.transfer.retransmits,
            self.transfer.timeouts,
        );
        info!(
            "UDP: in={}, out={}, dropped={}, errors={}",
            self.transport.datagrams_in,
            self.transport.datagrams_out,
            self.transport.dropped,
            self.transport.errors,
        );
        info!(
            "Timer: expired={}, reset={}; live sessions={}",
            self.timer.expired, self.timer.reset, live_sessions,
        );

        self.reported = Some((
            self.transfer.clone(),
            self.transport.clone(),
            self.timer.clone(),
        ));
    }
}
