//! Error types for the QDIO engine

use crate::channel::ChannelError;
use crate::lifecycle::IrqState;
use thiserror::Error;

/// QDIO error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QdioError {
    /// Device signalled busy past the patience window
    #[error("device busy after {retries} retries")]
    Busy {
        /// Doorbell attempts made before giving up
        retries: u32,
    },

    /// Queue storage could not be allocated
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Non-zero completion code from a doorbell
    #[error("I/O error: {op} returned cc={cc}")]
    Io {
        /// Doorbell that failed
        op: &'static str,
        /// Condition code
        cc: u8,
    },

    /// Caller passed arguments the engine cannot honor
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not legal in the current lifecycle state
    #[error("{op} not allowed in state {state:?}")]
    InvalidState {
        /// Requested operation
        op: &'static str,
        /// State at the time of the request
        state: IrqState,
    },

    /// Subchannel stopped or failed; only shutdown/free remain
    #[error("subchannel is dead (state {0:?})")]
    SubchannelDead(IrqState),

    /// Device did not answer a control operation in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Collaborator bus layer failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Coarse classification of [`QdioError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Try again later
    Transient,
    /// Allocation failed
    Resource,
    /// Device reported a protocol failure
    Protocol,
    /// Subchannel is unusable until shutdown/free
    Dead,
    /// Programming mistake on the caller's side
    Usage,
}

impl QdioError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            QdioError::Busy { .. } | QdioError::Timeout(_) => ErrorKind::Transient,
            QdioError::OutOfMemory(_) => ErrorKind::Resource,
            QdioError::Io { .. } | QdioError::Channel(_) => ErrorKind::Protocol,
            QdioError::SubchannelDead(_) => ErrorKind::Dead,
            QdioError::InvalidArgument(_) | QdioError::InvalidState { .. } => ErrorKind::Usage,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Resource)
    }
}

/// Result type for the QDIO engine
pub type QdioResult<T> = Result<T, QdioError>;

bitflags::bitflags! {
    /// Error bits handed to queue handlers alongside a buffer range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ErrorFlags: u32 {
        /// Activation failed or the device dropped the connection
        const ACTIVATE = 0x0001;
        /// Batch state extraction failed
        const GET_BUF_STATE = 0x0002;
        /// Batch state update failed
        const SET_BUF_STATE = 0x0004;
        /// Device marked the buffers as failed
        const SLSB_STATE = 0x0100;
        /// Output target had no free buffer
        const TARGET_FULL = 0x0200;
    }
}

impl ErrorFlags {
    /// Errors after which the subchannel cannot continue
    pub fn is_fatal(&self) -> bool {
        self.intersects(Self::ACTIVATE | Self::GET_BUF_STATE | Self::SET_BUF_STATE)
    }

    /// Expected back-pressure rather than a failure
    pub fn is_soft(&self) -> bool {
        self.contains(Self::TARGET_FULL)
    }
}

impl serde::Serialize for ErrorFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}
