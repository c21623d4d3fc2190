//! Buffer State Bytes
//!
//! Each ring slot carries one state byte shared between program and device.
//!
//! ```text
//!   bit 7   bit 6   bit 5   bits 3..0
//! ┌───────┬───────┬───────┬───┬─────────┐
//! │ PROG  │  CU   │ OUT   │ 0 │  state  │
//! └───────┴───────┴───────┴───┴─────────┘
//! ```
//!
//! The owner bits decide who may touch the slot next: program-owned slots
//! are the driver's to consume, CU-owned slots belong to the device.

use crate::queue::Direction;

const OWNER_PROG: u8 = 0x80;
const OWNER_CU: u8 = 0x40;
const TYPE_OUTPUT: u8 = 0x20;
const STATE_MASK: u8 = 0x0f;

const VAL_NOT_INIT: u8 = 0x00;
const VAL_EMPTY: u8 = 0x01;
const VAL_PRIMED: u8 = 0x02;
const VAL_PENDING: u8 = 0x03;
const VAL_HALTED: u8 = 0x0e;
const VAL_ERROR: u8 = 0x0f;

/// Raw state byte of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Slsb(pub u8);

impl Slsb {
    /// Input slot not in use
    pub const INPUT_NOT_INIT: Slsb = Slsb(OWNER_PROG | VAL_NOT_INIT);
    /// Input slot held back as acknowledgment
    pub const INPUT_ACK: Slsb = Slsb(OWNER_PROG | VAL_EMPTY);
    /// Input slot owned by the device, waiting for data
    pub const CU_INPUT_EMPTY: Slsb = Slsb(OWNER_CU | VAL_EMPTY);
    /// Input slot filled by the device
    pub const INPUT_PRIMED: Slsb = Slsb(OWNER_PROG | VAL_PRIMED);
    /// Input slot halted
    pub const INPUT_HALTED: Slsb = Slsb(OWNER_PROG | VAL_HALTED);
    /// Input slot failed
    pub const INPUT_ERROR: Slsb = Slsb(OWNER_PROG | VAL_ERROR);

    /// Output slot not in use
    pub const OUTPUT_NOT_INIT: Slsb = Slsb(OWNER_PROG | TYPE_OUTPUT | VAL_NOT_INIT);
    /// Output slot consumed by the device
    pub const OUTPUT_EMPTY: Slsb = Slsb(OWNER_PROG | TYPE_OUTPUT | VAL_EMPTY);
    /// Output slot submitted, device has not processed it yet
    pub const CU_OUTPUT_PENDING: Slsb = Slsb(OWNER_CU | TYPE_OUTPUT | VAL_PENDING);
    /// Output slot halted
    pub const OUTPUT_HALTED: Slsb = Slsb(OWNER_PROG | TYPE_OUTPUT | VAL_HALTED);
    /// Output slot failed
    pub const OUTPUT_ERROR: Slsb = Slsb(OWNER_PROG | TYPE_OUTPUT | VAL_ERROR);

    /// Device owns this slot
    #[inline(always)]
    pub fn is_device_owned(self) -> bool {
        self.0 & OWNER_CU != 0
    }

    /// Program owns this slot
    #[inline(always)]
    pub fn is_program_owned(self) -> bool {
        self.0 & OWNER_PROG != 0
    }

    /// Queue direction encoded in the byte
    #[inline]
    pub fn direction(self) -> Direction {
        if self.0 & TYPE_OUTPUT != 0 {
            Direction::Output
        } else {
            Direction::Input
        }
    }

    /// Decode into the logical state, `None` for bytes no side should write
    pub fn state(self) -> Option<BufferState> {
        let out = self.0 & TYPE_OUTPUT != 0;
        let state = match (self.0 & STATE_MASK, out) {
            (VAL_NOT_INIT, _) => BufferState::NotInit,
            (VAL_EMPTY, false) if self.is_program_owned() => BufferState::Ack,
            (VAL_EMPTY, _) => BufferState::Empty,
            (VAL_PRIMED, _) => BufferState::Primed,
            (VAL_PENDING, _) => BufferState::Pending,
            (VAL_HALTED, _) => BufferState::Halted,
            (VAL_ERROR, _) => BufferState::Error,
            _ => return None,
        };
        if self.is_device_owned() == self.is_program_owned() {
            return None;
        }
        Some(state)
    }

    /// Program-owned "not in use" byte for a queue direction
    pub fn not_init(direction: Direction) -> Slsb {
        match direction {
            Direction::Input => Slsb::INPUT_NOT_INIT,
            Direction::Output => Slsb::OUTPUT_NOT_INIT,
        }
    }
}

/// Logical buffer state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Not in use
    NotInit,
    /// Input: device delivered data
    Primed,
    /// Input: acknowledged, retained for batching
    Ack,
    /// Output: consumed by the device. Input: waiting for the device
    Empty,
    /// Device marked the buffer failed
    Error,
    /// Output: submitted, not yet processed by the device
    Pending,
    /// Halted
    Halted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_bits() {
        assert!(Slsb::CU_INPUT_EMPTY.is_device_owned());
        assert!(Slsb::CU_OUTPUT_PENDING.is_device_owned());
        assert!(Slsb::INPUT_PRIMED.is_program_owned());
        assert!(Slsb::OUTPUT_EMPTY.is_program_owned());
    }

    #[test]
    fn test_encodings() {
        assert_eq!(Slsb::INPUT_NOT_INIT.0, 0x80);
        assert_eq!(Slsb::INPUT_ACK.0, 0x81);
        assert_eq!(Slsb::CU_INPUT_EMPTY.0, 0x41);
        assert_eq!(Slsb::INPUT_PRIMED.0, 0x82);
        assert_eq!(Slsb::OUTPUT_NOT_INIT.0, 0xa0);
        assert_eq!(Slsb::OUTPUT_EMPTY.0, 0xa1);
        assert_eq!(Slsb::CU_OUTPUT_PENDING.0, 0x63);
        assert_eq!(Slsb::OUTPUT_ERROR.0, 0xaf);
    }

    #[test]
    fn test_decode() {
        assert_eq!(Slsb::INPUT_ACK.state(), Some(BufferState::Ack));
        assert_eq!(Slsb::CU_INPUT_EMPTY.state(), Some(BufferState::Empty));
        assert_eq!(Slsb::INPUT_PRIMED.state(), Some(BufferState::Primed));
        assert_eq!(Slsb::OUTPUT_EMPTY.state(), Some(BufferState::Empty));
        assert_eq!(Slsb::CU_OUTPUT_PENDING.state(), Some(BufferState::Pending));
        assert_eq!(Slsb::OUTPUT_HALTED.state(), Some(BufferState::Halted));
        assert_eq!(Slsb::CU_OUTPUT_PENDING.direction(), Direction::Output);
        assert_eq!(Slsb(0x00).state(), None);
        assert_eq!(Slsb(0xc1).state(), None);
        assert_eq!(Slsb(0x85).state(), None);
    }
}
