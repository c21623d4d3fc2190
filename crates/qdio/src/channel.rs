//! Channel Subsystem Interface
//!
//! The privileged operations the engine needs from the layer below it:
//! doorbells, batched state access, control operations and interrupt
//! routing. [`crate::sim::SimChannel`] implements it in software.

use std::fmt;
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::alloc::PooledPage;
use crate::queue::Direction;
use crate::slsb::Slsb;

/// Batch completion: fully or partially done
pub const CCQ_DONE: u8 = 0;
/// Batch completion: done, stopped at a state change
pub const CCQ_DONE_PARTIAL_STATE: u8 = 32;
/// Batch completion: interrupted with progress
pub const CCQ_PARTIAL: u8 = 96;
/// Batch completion: interrupted without progress
pub const CCQ_NO_PROGRESS: u8 = 97;

/// Doorbell function codes
pub const SIGA_WRITE: u8 = 0x00;
/// Read function code
pub const SIGA_READ: u8 = 0x01;
/// Sync function code
pub const SIGA_SYNC: u8 = 0x02;
/// Write-multiple function code
pub const SIGA_WRITE_MULTIPLE: u8 = 0x03;

/// Token identifying one subchannel towards the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubchannelToken(pub u64);

impl fmt::Display for SubchannelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

bitflags::bitflags! {
    /// Capability bits reported for an established subchannel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// Input buffers must be re-armed with a doorbell
        const SIGA_INPUT_NEEDED = 0x40;
        /// Output buffers must be announced with a doorbell
        const SIGA_OUTPUT_NEEDED = 0x20;
        /// State ring needs explicit synchronization
        const SIGA_SYNC_NEEDED = 0x10;
        /// Device syncs on adapter interrupts
        const AUTO_SYNC_ON_THININT = 0x08;
        /// Device syncs on output interrupts
        const AUTO_SYNC_ON_OUT_PCI = 0x04;
        /// Batched state access available
        const QEBSM_AVAILABLE = 0x02;
        /// Batched state access enabled
        const QEBSM_ENABLED = 0x01;
    }
}

impl Capabilities {
    /// Batched state access usable
    pub fn fast_path(&self) -> bool {
        self.contains(Self::QEBSM_AVAILABLE | Self::QEBSM_ENABLED)
    }

    pub(crate) fn need_siga_in(&self) -> bool {
        self.contains(Self::SIGA_INPUT_NEEDED)
    }

    pub(crate) fn need_siga_out(&self) -> bool {
        self.contains(Self::SIGA_OUTPUT_NEEDED)
    }

    pub(crate) fn need_siga_sync(&self) -> bool {
        self.contains(Self::SIGA_SYNC_NEEDED)
    }

    pub(crate) fn need_siga_sync_out_after_pci(&self) -> bool {
        !self.contains(Self::AUTO_SYNC_ON_OUT_PCI)
    }
}

/// Doorbell request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Doorbell {
    /// Make the software view of the state rings consistent
    Sync {
        /// Input queues to sync
        input_mask: u32,
        /// Output queues to sync
        output_mask: u32,
    },
    /// Input buffers are available again
    NotifyInput {
        /// Input queues
        mask: u32,
    },
    /// New output buffers are ready
    NotifyOutput {
        /// Output queues
        mask: u32,
        /// Write-many variant for multi-buffer submissions
        multiple: bool,
    },
}

impl Doorbell {
    /// Function code sent to the device
    pub fn function_code(&self) -> u8 {
        match self {
            Doorbell::Sync { .. } => SIGA_SYNC,
            Doorbell::NotifyInput { .. } => SIGA_READ,
            Doorbell::NotifyOutput { multiple: false, .. } => SIGA_WRITE,
            Doorbell::NotifyOutput { multiple: true, .. } => SIGA_WRITE_MULTIPLE,
        }
    }

    /// Name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Doorbell::Sync { .. } => "sync",
            Doorbell::NotifyInput { .. } => "notify-input",
            Doorbell::NotifyOutput { .. } => "notify-output",
        }
    }
}

/// Doorbell completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// 2-bit condition code
    pub cc: u8,
    /// Device queue momentarily full
    pub busy: bool,
}

impl Completion {
    /// Accepted
    pub const OK: Completion = Completion { cc: 0, busy: false };
}

/// Batched state operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    /// Extract a run of equal states
    Extract {
        /// Queue direction
        direction: Direction,
        /// Queue number
        queue: usize,
        /// First slot
        start: usize,
        /// Maximum slots
        count: usize,
        /// Let the device acknowledge primed input slots
        auto_ack: bool,
    },
    /// Set slots to a state
    Set {
        /// Queue direction
        direction: Direction,
        /// Queue number
        queue: usize,
        /// First slot
        start: usize,
        /// Slots to set
        count: usize,
        /// New state
        state: Slsb,
    },
}

/// Batched state completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    /// Completion qualifier
    pub ccq: u8,
    /// Slots not processed
    pub remaining: usize,
    /// State of the extracted run (extract only)
    pub state: Slsb,
}

/// Queue registration handed over with the establish request
#[derive(Clone)]
pub struct QueueRecord {
    /// Queue direction
    pub direction: Direction,
    /// Queue number
    pub nr: usize,
    /// Shared ring page
    pub page: Arc<PooledPage>,
    /// Buffer descriptors, one per slot
    pub buffers: Arc<[crate::ring::Sbal]>,
}

impl fmt::Debug for QueueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRecord")
            .field("direction", &self.direction)
            .field("nr", &self.nr)
            .field("page", &format_args!("{:#x}", self.page.addr()))
            .finish()
    }
}

/// Control operation started on a subchannel
#[derive(Debug, Clone)]
pub enum ControlOp {
    /// Install the queues with the device
    Establish {
        /// Queue descriptors
        queues: Vec<QueueRecord>,
    },
    /// Start data transfer
    Activate,
    /// Stop the subchannel gracefully
    Halt,
    /// Stop the subchannel, discarding outstanding work
    Clear,
}

impl ControlOp {
    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ControlOp::Establish { .. } => "establish",
            ControlOp::Activate => "activate",
            ControlOp::Halt => "halt",
            ControlOp::Clear => "clear",
        }
    }
}

/// Status reported with a control interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    /// Operation completed
    Ok,
    /// Operation failed with channel/device status
    Failed {
        /// Channel status
        cstat: u8,
        /// Device status
        dstat: u8,
    },
}

/// Interrupt delivered by the bus layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Status for the outstanding control operation
    Control(ControlStatus),
    /// Adapter interrupt: new data or completions on some queue
    Data,
}

/// Receiver of interrupts for one subchannel
pub trait InterruptSink: Send + Sync {
    /// Handle an interrupt; must stay short
    fn deliver(&self, irq: Interrupt);
}

/// Bus layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Subchannel not known to the bus layer
    #[error("unknown subchannel {0}")]
    UnknownSubchannel(SubchannelToken),

    /// Control operation could not be started
    #[error("{op} rejected: {reason}")]
    Rejected {
        /// Operation name
        op: &'static str,
        /// Reason
        reason: String,
    },

    /// Another control operation is still running
    #[error("control operation in progress")]
    Busy,
}

/// Privileged channel operations
pub trait ChannelIo: Send + Sync {
    /// Ring a doorbell
    fn doorbell(&self, token: SubchannelToken, op: Doorbell) -> Completion;

    /// Extract or set a batch of buffer states
    fn batch_state_op(&self, token: SubchannelToken, op: BatchOp) -> BatchResult;

    /// Start a control operation; completion arrives as an interrupt
    fn start_control(&self, token: SubchannelToken, op: ControlOp) -> Result<(), ChannelError>;

    /// Query subchannel capabilities
    fn capabilities(&self, token: SubchannelToken) -> Result<Capabilities, ChannelError>;

    /// Route interrupts for `token` to `sink`, or stop routing with `None`
    fn set_interrupt_sink(&self, token: SubchannelToken, sink: Option<Weak<dyn InterruptSink>>);
}
