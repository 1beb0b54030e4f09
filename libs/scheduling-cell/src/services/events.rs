// libs/scheduling-cell/src/services/events.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Domain events emitted by the scheduling engine, keyed by provider so an
/// external real-time layer can fan them out per agenda.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    AppointmentCreated {
        provider_id: Uuid,
        appointment_id: Uuid,
        patient_id: Uuid,
        scheduled_at: DateTime<Utc>,
    },
    AppointmentUpdated {
        provider_id: Uuid,
        appointment_id: Uuid,
        scheduled_at: DateTime<Utc>,
    },
    AppointmentCancelled {
        provider_id: Uuid,
        appointment_id: Uuid,
        cancelled_by: String,
    },
    SlotLocked {
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    SlotUnlocked {
        provider_id: Uuid,
        slot_start: DateTime<Utc>,
    },
    SlotsUpdated {
        provider_id: Uuid,
        date: NaiveDate,
    },
}

impl DomainEvent {
    pub fn provider_id(&self) -> Uuid {
        match self {
            DomainEvent::AppointmentCreated { provider_id, .. }
            | DomainEvent::AppointmentUpdated { provider_id, .. }
            | DomainEvent::AppointmentCancelled { provider_id, .. }
            | DomainEvent::SlotLocked { provider_id, .. }
            | DomainEvent::SlotUnlocked { provider_id, .. }
            | DomainEvent::SlotsUpdated { provider_id, .. } => *provider_id,
        }
    }
}

/// Boundary to the out-of-scope real-time layer. Publishing is
/// fire-and-forget: delivery failures never fail the emitting operation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

pub type EventSender = broadcast::Sender<String>;
pub type EventReceiver = broadcast::Receiver<String>;

/// In-process fan-out over broadcast channels: one channel per provider plus
/// a global firehose for monitoring consumers.
pub struct BroadcastEventPublisher {
    channels: Arc<RwLock<HashMap<Uuid, EventSender>>>,
    global_sender: EventSender,
}

impl BroadcastEventPublisher {
    pub fn new() -> Self {
        let (global_sender, _) = broadcast::channel(1000);

        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            global_sender,
        }
    }

    pub async fn subscribe(&self, provider_id: Uuid) -> EventReceiver {
        let mut channels = self.channels.write().await;
        channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(100).0)
            .subscribe()
    }

    pub fn subscribe_global(&self) -> EventReceiver {
        self.global_sender.subscribe()
    }

    pub async fn active_providers(&self) -> Vec<Uuid> {
        let channels = self.channels.read().await;
        channels.keys().cloned().collect()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        let provider_id = event.provider_id();

        let message = match serde_json::to_string(&serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
        })) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to serialize domain event: {}", e);
                return;
            }
        };

        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(&provider_id) {
                if let Err(e) = sender.send(message.clone()) {
                    // Channel may have no live subscribers; that is fine.
                    debug!("No subscriber for provider {}: {}", provider_id, e);
                }
            }
        }

        if let Err(e) = self.global_sender.send(message) {
            debug!("No global subscriber: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_provider_event() {
        let publisher = BroadcastEventPublisher::new();
        let provider_id = Uuid::new_v4();
        let mut receiver = publisher.subscribe(provider_id).await;

        publisher
            .publish(DomainEvent::SlotsUpdated {
                provider_id,
                date: NaiveDate::from_ymd_opt(2030, 5, 6).unwrap(),
            })
            .await;

        let message = receiver.recv().await.expect("event should be delivered");
        assert!(message.contains("slots_updated"));
        assert!(message.contains(&provider_id.to_string()));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let publisher = BroadcastEventPublisher::new();

        // Fire-and-forget: no panic, no error surfaced.
        publisher
            .publish(DomainEvent::SlotUnlocked {
                provider_id: Uuid::new_v4(),
                slot_start: Utc::now(),
            })
            .await;
    }

    #[tokio::test]
    async fn global_channel_sees_all_providers() {
        let publisher = BroadcastEventPublisher::new();
        let mut global = publisher.subscribe_global();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        publisher.subscribe(first).await;
        publisher.subscribe(second).await;

        publisher
            .publish(DomainEvent::SlotLocked {
                provider_id: first,
                slot_start: Utc::now(),
                expires_at: Utc::now(),
            })
            .await;
        publisher
            .publish(DomainEvent::SlotUnlocked {
                provider_id: second,
                slot_start: Utc::now(),
            })
            .await;

        assert!(global.recv().await.unwrap().contains("slot_locked"));
        assert!(global.recv().await.unwrap().contains("slot_unlocked"));
    }
}
