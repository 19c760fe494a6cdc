use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::inventory_movement::MovementType;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiver `process_events` drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without waiting; a full or closed channel drops the event with a warning.
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            counter!("remitflow_events.dropped", 1);
            warn!(error = %e, "event dropped");
        }
    }
}

/// Lifecycle events and diagnostics emitted by the services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
        old_payment_status: String,
        new_payment_status: String,
        changed_by: Option<Uuid>,
    },
    PaymentValidated {
        order_id: Uuid,
        validated_by: Uuid,
    },
    PaymentRejected {
        order_id: Uuid,
        rejected_by: Uuid,
        reason: String,
    },
    RemittanceCreated {
        remittance_id: Uuid,
        remittance_number: String,
        user_id: Uuid,
    },
    RemittanceStatusChanged {
        remittance_id: Uuid,
        old_status: String,
        new_status: String,
        changed_by: Option<Uuid>,
    },
    RemittanceRecalculated {
        remittance_id: Uuid,
        exchange_rate: String,
        amount_to_deliver: String,
    },
    BankTransferStatusChanged {
        bank_transfer_id: Uuid,
        remittance_id: Uuid,
        old_status: String,
        new_status: String,
    },
    InventoryMoved {
        inventory_id: Uuid,
        product_id: Uuid,
        movement: MovementType,
        quantity: i32,
        reference_id: Uuid,
    },
    /// A best-effort side effect failed or timed out and was swallowed.
    SideEffectFailed {
        name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

/// Drains the channel and logs each event; returns once every sender is gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                user_id,
            } => {
                info!(%order_id, %order_number, %user_id, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                old_payment_status,
                new_payment_status,
                changed_by,
            } => {
                counter!("remitflow_events.order_transitions", 1);
                info!(
                    %order_id,
                    from = %old_status,
                    to = %new_status,
                    payment_from = %old_payment_status,
                    payment_to = %new_payment_status,
                    changed_by = ?changed_by,
                    "order status changed"
                );
            }
            Event::PaymentValidated {
                order_id,
                validated_by,
            } => {
                info!(%order_id, %validated_by, "order payment validated");
            }
            Event::PaymentRejected {
                order_id,
                rejected_by,
                reason,
            } => {
                info!(%order_id, %rejected_by, %reason, "order payment rejected");
            }
            Event::RemittanceCreated {
                remittance_id,
                remittance_number,
                user_id,
            } => {
                info!(%remittance_id, %remittance_number, %user_id, "remittance created");
            }
            Event::RemittanceStatusChanged {
                remittance_id,
                old_status,
                new_status,
                changed_by,
            } => {
                counter!("remitflow_events.remittance_transitions", 1);
                info!(
                    %remittance_id,
                    from = %old_status,
                    to = %new_status,
                    changed_by = ?changed_by,
                    "remittance status changed"
                );
            }
            Event::RemittanceRecalculated {
                remittance_id,
                exchange_rate,
                amount_to_deliver,
            } => {
                info!(%remittance_id, %exchange_rate, %amount_to_deliver, "remittance recalculated");
            }
            Event::BankTransferStatusChanged {
                bank_transfer_id,
                remittance_id,
                old_status,
                new_status,
            } => {
                info!(
                    %bank_transfer_id,
                    %remittance_id,
                    from = %old_status,
                    to = %new_status,
                    "bank transfer status changed"
                );
            }
            Event::InventoryMoved {
                inventory_id,
                product_id,
                movement,
                quantity,
                reference_id,
            } => {
                info!(%inventory_id, %product_id, %movement, quantity, %reference_id, "inventory moved");
            }
            Event::SideEffectFailed {
                name,
                error,
                timestamp,
            } => {
                counter!("remitflow_events.side_effect_failures", 1);
                warn!(side_effect = %name, %error, %timestamp, "side effect failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_reach_the_receiver() {
        let (sender, mut rx) = EventSender::channel(4);
        let order_id = Uuid::new_v4();
        sender.emit(Event::PaymentValidated {
            order_id,
            validated_by: Uuid::nil(),
        });
        match rx.recv().await {
            Some(Event::PaymentValidated { order_id: got, .. }) => assert_eq!(got, order_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sender, mut rx) = EventSender::channel(1);
        for _ in 0..3 {
            sender.emit(Event::SideEffectFailed {
                name: "notify".into(),
                error: "timeout".into(),
                timestamp: Utc::now(),
            });
        }
        assert!(matches!(rx.try_recv(), Ok(Event::SideEffectFailed { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn process_events_ends_when_senders_drop() {
        let (sender, rx) = EventSender::channel(8);
        sender
            .send(Event::OrderCreated {
                order_id: Uuid::new_v4(),
                order_number: "ORD-20240101-00001".into(),
                user_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        drop(sender);
        process_events(rx).await;
    }
}
