//! Accounting events emitted by the pipeline
//!
//! The core never persists anything itself; it reports channel and stream
//! lifecycle plus per-stream byte counters to an [`AccountingSink`].

use std::sync::{Mutex, PoisonError};

/// One lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingEvent {
    ChannelOpened {
        channel_id: u64,
        peer: String,
    },
    ChannelClosed {
        channel_id: u64,
        peer: String,
        failed: bool,
    },
    StreamOpened {
        channel_id: u64,
        stream_id: u32,
        target: String,
    },
    StreamClosed {
        channel_id: u64,
        stream_id: u32,
        target: String,
        bytes_sent: u64,
        bytes_received: u64,
    },
}

/// Receiver of accounting events
pub trait AccountingSink: Send + Sync {
    fn record(&self, event: AccountingEvent);
}

/// Default sink: writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAccounting;

impl AccountingSink for LogAccounting {
    fn record(&self, event: AccountingEvent) {
        match event {
            AccountingEvent::ChannelOpened { channel_id, peer } => {
                log::info!("Channel {channel_id} to {peer} established");
            }
            AccountingEvent::ChannelClosed {
                channel_id,
                peer,
                failed,
            } => {
                if failed {
                    log::warn!("Channel {channel_id} to {peer} failed");
                } else {
                    log::info!("Channel {channel_id} to {peer} closed");
                }
            }
            AccountingEvent::StreamOpened {
                channel_id,
                stream_id,
                target,
            } => {
                log::debug!("Stream {channel_id}/{stream_id} opened to {target}");
            }
            AccountingEvent::StreamClosed {
                channel_id,
                stream_id,
                target,
                bytes_sent,
                bytes_received,
            } => {
                log::info!(
                    "Stream {channel_id}/{stream_id} to {target} closed, {bytes_sent} bytes sent, {bytes_received} bytes received"
                );
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    events: Mutex<Vec<AccountingEvent>>,
}

impl MemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AccountingEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AccountingSink for MemoryAccounting {
    fn record(&self, event: AccountingEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_accounting_keeps_order() {
        let sink = MemoryAccounting::new();
        sink.record(AccountingEvent::ChannelOpened {
            channel_id: 1,
            peer: "a:443".into(),
        });
        sink.record(AccountingEvent::StreamClosed {
            channel_id: 1,
            stream_id: 1,
            target: "b:80".into(),
            bytes_sent: 3,
            bytes_received: 4,
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AccountingEvent::ChannelOpened { channel_id: 1, .. }));
        assert!(matches!(
            events[1],
            AccountingEvent::StreamClosed { bytes_sent: 3, bytes_received: 4, .. }
        ));
    }
}
