//! Per-connection channel bookkeeping.

use std::collections::HashMap;

use crate::error::ProtocolError;

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// `channel.open` seen, `open-ok` not yet.
    Opening,
    Active,
    /// `channel.close` seen from either side.
    Closing,
}

/// Open channels of a session, bounded by the negotiated channel-max.
#[derive(Debug, Clone)]
pub struct ChannelTable {
    channel_max: u16,
    channels: HashMap<u16, ChannelState>,
}

impl ChannelTable {
    /// `channel_max` of 0 means no limit beyond the u16 range.
    pub fn new(channel_max: u16) -> Self {
        Self {
            channel_max: effective_max(channel_max),
            channels: HashMap::new(),
        }
    }

    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    pub fn set_channel_max(&mut self, channel_max: u16) {
        self.channel_max = effective_max(channel_max);
    }

    /// Channel 0 is the connection itself and never in range.
    pub fn check_range(&self, channel: u16) -> Result<(), ProtocolError> {
        if channel == 0 || channel > self.channel_max {
            return Err(ProtocolError::ChannelOutOfRange {
                channel,
                max: self.channel_max,
            });
        }
        Ok(())
    }

    pub fn open(&mut self, channel: u16) -> Result<(), ProtocolError> {
        self.check_range(channel)?;
        if self.channels.contains_key(&channel) {
            return Err(ProtocolError::ChannelAlreadyOpen(channel));
        }
        self.channels.insert(channel, ChannelState::Opening);
        Ok(())
    }

    /// `open-ok` arrived. Unknown channels are ignored.
    pub fn confirm(&mut self, channel: u16) {
        if let Some(state @ ChannelState::Opening) = self.channels.get_mut(&channel) {
            *state = ChannelState::Active;
        }
    }

    pub fn begin_close(&mut self, channel: u16) -> Result<(), ProtocolError> {
        match self.channels.get_mut(&channel) {
            Some(state) => {
                *state = ChannelState::Closing;
                Ok(())
            }
            None => Err(ProtocolError::ChannelNotOpen(channel)),
        }
    }

    pub fn remove(&mut self, channel: u16) -> Option<ChannelState> {
        self.channels.remove(&channel)
    }

    /// Fails unless the channel has been opened and not fully closed.
    pub fn require_open(&self, channel: u16) -> Result<ChannelState, ProtocolError> {
        self.check_range(channel)?;
        self.channels
            .get(&channel)
            .copied()
            .ok_or(ProtocolError::ChannelNotOpen(channel))
    }

    pub fn state(&self, channel: u16) -> Option<ChannelState> {
        self.channels.get(&channel).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

fn effective_max(channel_max: u16) -> u16 {
    if channel_max == 0 {
        u16::MAX
    } else {
        channel_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut table = ChannelTable::new(10);
        table.open(1).unwrap();
        assert_eq!(table.state(1), Some(ChannelState::Opening));
        table.confirm(1);
        assert_eq!(table.state(1), Some(ChannelState::Active));
        table.begin_close(1).unwrap();
        assert_eq!(table.state(1), Some(ChannelState::Closing));
        assert_eq!(table.remove(1), Some(ChannelState::Closing));
        assert!(table.is_empty());
    }

    #[test]
    fn test_range_enforced() {
        let mut table = ChannelTable::new(2);
        assert_eq!(
            table.open(3),
            Err(ProtocolError::ChannelOutOfRange { channel: 3, max: 2 })
        );
        assert!(table.open(0).is_err());
        assert!(table.open(2).is_ok());
    }

    #[test]
    fn test_double_open_and_close_unknown() {
        let mut table = ChannelTable::new(0);
        assert_eq!(table.channel_max(), u16::MAX);
        table.open(5).unwrap();
        assert_eq!(table.open(5), Err(ProtocolError::ChannelAlreadyOpen(5)));
        assert_eq!(table.begin_close(6), Err(ProtocolError::ChannelNotOpen(6)));
        assert_eq!(table.require_open(6), Err(ProtocolError::ChannelNotOpen(6)));
    }
}
