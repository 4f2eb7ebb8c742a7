//! Service engine configuration.

use crate::{pdu::DEFAULT_MAX_PDU_LENGTH, uids};

/// Tunables for one upper-layer connection.
#[derive(Clone, Debug)]
pub struct ServiceOptions {
    /// Outbound PDUs buffered before submitters wait; the backpressure
    /// bound on sender memory.
    pub max_pdus_in_queue: usize,
    /// PDU body cap while streaming command bytes.
    pub max_command_buffer: usize,
    /// PDU body cap while streaming dataset bytes.
    pub max_data_buffer: usize,
    /// Maximum P-DATA-TF body length advertised to the peer.
    pub max_receive_pdu_length: u32,
    /// Reject inbound PDUs above the advertised maximum instead of
    /// tolerating them up to the absolute cap.
    pub strict_pdu_length: bool,
    /// Adopt the remote AE title as the connection's log identity once the
    /// handshake reveals it.
    pub use_remote_ae_for_log_name: bool,
    /// Log every inbound and outbound data PDU at debug level.
    pub log_data_pdus: bool,
    /// Log DIMSE message traffic at debug level.
    pub log_dimse: bool,
    /// Initial log identity, before any handshake.
    pub log_name: String,
    /// Implementation class UID advertised in user information.
    pub implementation_class_uid: String,
    /// Implementation version name advertised in user information.
    pub implementation_version_name: String,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_pdus_in_queue: 16,
            max_command_buffer: 1024 * 1024,
            max_data_buffer: 1024 * 1024,
            max_receive_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            strict_pdu_length: false,
            use_remote_ae_for_log_name: false,
            log_data_pdus: false,
            log_dimse: false,
            log_name: "dimse".to_string(),
            implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: uids::IMPLEMENTATION_VERSION_NAME.to_string(),
        }
    }
}
