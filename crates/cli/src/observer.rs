//! Observer that logs inbound signaling traffic

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use gbsip_sip_stack::{SipEvent, SipEventKind, SipObserver};

/// Logs every event and keeps simple counters
#[derive(Debug, Default)]
pub struct LoggingObserver {
    messages: AtomicU64,
    errors: AtomicU64,
}

impl LoggingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl SipObserver for LoggingObserver {
    fn on_event(&self, event: SipEvent) {
        match &event.kind {
            SipEventKind::Message { payload, source } => {
                self.messages.fetch_add(1, Ordering::Relaxed);
                let first_line = payload
                    .split(|b| *b == b'\n')
                    .next()
                    .map(|line| String::from_utf8_lossy(line).trim_end().to_string())
                    .unwrap_or_default();
                debug!("[{}] {} from {}: {}", event.transport, event.local_addr, source, first_line);
            }
            SipEventKind::ConnectionOpened { peer } => {
                debug!("[{}] connection from {}", event.transport, peer);
            }
            SipEventKind::ConnectionClosed { peer, reason } => {
                debug!("[{}] connection from {} closed ({:?})", event.transport, peer, reason);
            }
            SipEventKind::DialogErrorHandled { peer, error } => {
                debug!("[{}] dialogs with {} terminated: {}", event.transport, peer, error);
            }
            SipEventKind::IoError { peer, error } => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                match peer {
                    Some(peer) => warn!("[{}] I/O error with {}: {}", event.transport, peer, error),
                    None => warn!("[{}] I/O error on {}: {}", event.transport, event.local_addr, error),
                }
            }
            SipEventKind::EndpointClosed => {
                info!("[{}] endpoint {} stopped", event.transport, event.local_addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbsip_sip_stack::TransportKind;

    const INVITE: &[u8] = b"INVITE sip:34020000001320000001@3402000000 SIP/2.0\r\nContent-Length: 0\r\n\r\n";

    fn event(kind: SipEventKind) -> SipEvent {
        SipEvent {
            transport: TransportKind::Datagram,
            local_addr: "127.0.0.1:5060".parse().unwrap(),
            kind,
        }
    }

    #[test]
    fn test_counts_messages_and_errors() {
        let observer = LoggingObserver::new();
        let source = "127.0.0.1:5061".parse().unwrap();

        observer.on_event(event(SipEventKind::Message {
            payload: INVITE.to_vec().into(),
            source,
        }));
        observer.on_event(event(SipEventKind::IoError {
            peer: None,
            error: "reset".to_string(),
        }));
        observer.on_event(event(SipEventKind::EndpointClosed));

        assert_eq!(observer.messages(), 1);
        assert_eq!(observer.errors(), 1);
    }
}
