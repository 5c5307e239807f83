use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::AuditEvent;

/// Envelope wrapping an audit event with metadata
#[derive(Debug, Clone)]
pub struct AuditEventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

/// Handle for emitting audit events
///
/// Cheaply cloneable. Events go through a bounded channel to the
/// [`AuditWriter`](super::AuditWriter); a full or closed channel is logged
/// and never fails the caller.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEventEnvelope>,
}

impl AuditHandle {
    pub fn new(tx: mpsc::Sender<AuditEventEnvelope>) -> Self {
        Self { tx }
    }

    /// Emit an event stamped with the current time, waiting for channel
    /// capacity.
    pub async fn emit(&self, event: AuditEvent) {
        let envelope = AuditEventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        if let Err(e) = self.tx.send(envelope).await {
            tracing::error!("Failed to emit audit event: {}", e);
        }
    }

    /// Emit without waiting. Returns false if the event was dropped.
    pub fn try_emit(&self, event: AuditEvent) -> bool {
        self.try_emit_at(Utc::now(), event)
    }

    /// Emit without waiting, stamped with the caller's clock.
    ///
    /// The scheduler runs on an explicit `now`, so its events carry that
    /// time rather than the wall clock.
    pub fn try_emit_at(&self, timestamp: DateTime<Utc>, event: AuditEvent) -> bool {
        match self.tx.try_send(AuditEventEnvelope { timestamp, event }) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to emit audit event: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPreference;

    fn enqueued(job_id: &str) -> AuditEvent {
        AuditEvent::JobEnqueued {
            job_id: job_id.to_string(),
            source_ref: "/downloads/movie.mkv".to_string(),
            priority: 0,
            preference: WorkerPreference::PreferRemote,
        }
    }

    #[tokio::test]
    async fn test_emit_event() {
        let (tx, mut rx) = mpsc::channel(10);
        let handle = AuditHandle::new(tx);

        handle
            .emit(AuditEvent::ServiceStarted {
                version: "0.1.0".to_string(),
                config_hash: "abc123".to_string(),
            })
            .await;

        let envelope = rx.recv().await.expect("Should receive event");
        assert!(matches!(envelope.event, AuditEvent::ServiceStarted { .. }));
    }

    #[test]
    fn test_try_emit_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = AuditHandle::new(tx);

        assert!(handle.try_emit(enqueued("job-1")));
        assert!(!handle.try_emit(enqueued("job-2")));
    }

    #[tokio::test]
    async fn test_emit_closed_channel() {
        let (tx, rx) = mpsc::channel::<AuditEventEnvelope>(10);
        let handle = AuditHandle::new(tx);
        drop(rx);

        handle.emit(enqueued("job-1")).await;
        assert!(!handle.try_emit(enqueued("job-2")));
    }

    #[test]
    fn test_try_emit_at_keeps_timestamp() {
        let (tx, mut rx) = mpsc::channel(10);
        let handle = AuditHandle::new(tx);
        let at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert!(handle.try_emit_at(at, enqueued("job-1")));

        let envelope = rx.try_recv().expect("Should receive event");
        assert_eq!(envelope.timestamp, at);
        assert_eq!(envelope.event.job_id(), Some("job-1"));
    }
}
