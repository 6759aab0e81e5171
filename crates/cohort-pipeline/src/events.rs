//! Study event system for observability.
//!
//! Emits [`StudyEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, dashboards) can follow participants through the
//! pipeline without coupling to the state machine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while sessions are created, resolved and advanced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StudyEvent {
    SessionCreated {
        participant_id: String,
    },
    ConditionAssigned {
        participant_id: String,
        factor: String,
        value: String,
    },
    VariantLocked {
        participant_id: String,
        stage_id: String,
        variant: String,
    },
    SubmissionRecorded {
        participant_id: String,
        stage_id: String,
        passed: bool,
    },
    StageAdvanced {
        participant_id: String,
        from_stage: String,
        to_index: usize,
    },
    SessionCompleted {
        participant_id: String,
        total_seconds: i64,
    },
    SessionFailed {
        participant_id: String,
        stage_id: Option<String>,
        timeout: bool,
    },
    SessionsReaped {
        count: usize,
    },
}

/// Fan-out of [`StudyEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<StudyEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Returns how many subscribers received the event; zero when nobody listens.
    pub fn emit(&self, event: StudyEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StudyEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_variant_reaches_subscriber() {
        let events = EventEmitter::new(16);
        let mut sub = events.subscribe();

        events.emit(StudyEvent::VariantLocked {
            participant_id: "p1".into(),
            stage_id: "stage_1".into(),
            variant: "pronoun".into(),
        });

        match sub.recv().await.unwrap() {
            StudyEvent::VariantLocked { stage_id, variant, .. } => {
                assert_eq!(stage_id, "stage_1");
                assert_eq!(variant, "pronoun");
            }
            other => panic!("got {other:?}"),
        }
    }

    #[test]
    fn unobserved_events_are_dropped() {
        let events = EventEmitter::new(4);
        assert_eq!(events.subscriber_count(), 0);
        assert_eq!(events.emit(StudyEvent::SessionsReaped { count: 3 }), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let events = EventEmitter::default();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        let delivered = events.emit(StudyEvent::SessionFailed {
            participant_id: "p1".into(),
            stage_id: Some("stage_2".into()),
            timeout: true,
        });
        assert_eq!(delivered, 2);

        let a = serde_json::to_value(first.recv().await.unwrap()).unwrap();
        let b = serde_json::to_value(second.recv().await.unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["SessionFailed"]["timeout"], true);
    }
}
