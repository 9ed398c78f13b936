use log::trace;
use tokio::sync::mpsc;

use crate::networking::file_transfer::TransferStatus;
use crate::networking::remote::RemoteStatus;

/// Notifications published by the engine for whatever front end is attached
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ServerStatusChanged {
        running: bool,
    },
    RemoteListChanged,
    RemoteStatusChanged {
        remote_id: String,
        status: RemoteStatus,
    },
    TransferListChanged {
        remote_id: String,
    },
    /// A peer offered us a transfer that now waits for accept/decline
    IncomingTransfer {
        remote_id: String,
        start_time: u64,
    },
    TransferStatusChanged {
        remote_id: String,
        start_time: u64,
        status: TransferStatus,
    },
    TransferProgressChanged {
        remote_id: String,
        start_time: u64,
        bytes_transferred: u64,
        bytes_per_second: u64,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Sending half of the notification channel. Emitting never blocks and
/// doesn't care whether anyone is listening.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event receiver attached, dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_receiver_is_harmless() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(EngineEvent::RemoteListChanged);
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(EngineEvent::RemoteListChanged);
        sink.emit(EngineEvent::TransferListChanged {
            remote_id: "ALPHA-000001".to_string(),
        });

        assert_eq!(rx.recv().await, Some(EngineEvent::RemoteListChanged));
        assert_eq!(
            rx.recv().await,
            Some(EngineEvent::TransferListChanged {
                remote_id: "ALPHA-000001".to_string()
            })
        );
    }
}
