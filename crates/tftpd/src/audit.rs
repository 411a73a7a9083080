use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{Level, event};

pub const SERVICE_NAME: &str = "tftpd";

/// Audit event types
///
/// One JSON object per event, emitted through `tracing` under the
/// `audit_event` field so a log shipper can pick them out of the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Portal socket bound, scheduler about to run
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
        max_sessions: usize,
    },

    /// File read request received
    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
    },

    /// File read request denied
    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
        error_code: u16,
    },

    /// First DATA block sent
    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        file_size: u64,
    },

    /// Final block acknowledged
    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks_sent: u16,
        duration_ms: u64,
        /// Transfer throughput in bytes per second
        throughput_bps: u64,
    },

    /// Transfer abandoned (timeout, read error)
    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        blocks_sent: u16,
    },

    /// Malformed or unexpected packet
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    /// Session table or buffer limit reached
    ResourceExhaustion {
        #[serde(flatten)]
        common: CommonFields,
        resource_type: String,
        current_value: String,
        threshold: String,
    },
}

/// Common fields present in all audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Ties together the events of one transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: SERVICE_NAME.to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: Option<&str>) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = correlation_id.map(str::to_string);
        fields
    }
}

impl AuditEvent {
    /// Emit this event as structured tracing output
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::ResourceExhaustion { common, .. } => common,
        }
    }
}

/// Audit logger for TFTP operations; a disabled logger drops every event
#[derive(Debug, Clone, Copy)]
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Correlation id shared by every event of one transfer
    pub fn generate_correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn emit(&self, event: AuditEvent) {
        if self.enabled {
            event.log();
        }
    }

    pub fn server_started(&self, bind_addr: SocketAddr, root_dir: &str, max_sessions: usize) {
        self.emit(AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
            max_sessions,
        });
    }

    pub fn read_request(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        correlation_id: &str,
    ) {
        self.emit(AuditEvent::ReadRequest {
            common: CommonFields::with_correlation("info", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
        });
    }

    pub fn read_denied(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        reason: &str,
        error_code: u16,
        correlation_id: &str,
    ) {
        self.emit(AuditEvent::ReadDenied {
            common: CommonFields::with_correlation("warn", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
            error_code,
        });
    }

    pub fn transfer_started(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        file_size: u64,
        correlation_id: &str,
    ) {
        self.emit(AuditEvent::TransferStarted {
            common: CommonFields::with_correlation("info", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            file_size,
        });
    }

    pub fn transfer_completed(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks_sent: u16,
        duration_ms: u64,
        correlation_id: &str,
    ) {
        let throughput_bps = if duration_ms > 0 {
            (bytes_transferred * 1000) / duration_ms
        } else {
            0
        };

        self.emit(AuditEvent::TransferCompleted {
            common: CommonFields::with_correlation("info", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks_sent,
            duration_ms,
            throughput_bps,
        });
    }

    pub fn transfer_failed(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
        blocks_sent: u16,
        correlation_id: &str,
    ) {
        self.emit(AuditEvent::TransferFailed {
            common: CommonFields::with_correlation("error", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            blocks_sent,
        });
    }

    pub fn protocol_violation(&self, client_addr: SocketAddr, violation: &str) {
        self.emit(AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        });
    }

    pub fn resource_exhaustion(&self, resource_type: &str, current_value: &str, threshold: &str) {
        self.emit(AuditEvent::ResourceExhaustion {
            common: CommonFields::new("error"),
            resource_type: resource_type.to_string(),
            current_value: current_value.to_string(),
            threshold: threshold.to_string(),
        });
    }
}
