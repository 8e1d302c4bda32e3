//! Application-facing message type and send flags.

use crate::clock::UsecTime;

bitflags::bitflags! {
    /// Flags passed to `send`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        const RELIABLE = 0b001;
        const NO_NAGLE = 0b010;
        const NO_DELAY = 0b100;
    }
}

/// A message delivered to, or enqueued by, the application. Delivered
/// messages are owned by the application until explicitly released
/// (dropping the value is sufficient in this implementation, since there
/// is no pooled buffer to return).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
    pub message_number: u64,
    pub reliable: bool,
    pub recv_timestamp: UsecTime,
}

impl Message {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
