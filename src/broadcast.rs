//! Broadcast events: one state change, fanned out to a specific audience of sessions.
//! `Manager` and `Session` both hold a sender; the `Server`'s dispatcher task is the
//! single consumer that resolves `Audience` against the session registry.

use crate::protocol::{
    ListItemsResponse, Message, MessageType, PurchaseNotificationPayload,
    SaleStartBroadcastPayload,
};
use crate::sale::SaleSnapshot;

/// The `senderId` carried on every broker-originated frame that isn't a direct reply to
/// a specific request — here, the broker itself.
const BROKER_SENDER_ID: &str = "broker";

/// Who should receive a given broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Stock changes go out to every connected buyer.
    Buyers,
    /// Sale lifecycle events go out to every connected session except whichever one
    /// caused them — that session already has its own direct reply in flight.
    Everyone,
    /// A purchase notification goes to the seller whose sale was bought from, and no
    /// one else.
    Seller,
}

#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    StockUpdate {
        items: Vec<SaleSnapshot>,
    },
    SaleStart {
        item_id: String,
        seller_id: String,
    },
    SaleEnd {
        seller_id: String,
        items: Vec<SaleSnapshot>,
    },
    PurchaseNotification {
        seller_id: String,
        item_id: String,
        quantity: f64,
        buyer_id: String,
    },
}

impl BroadcastEvent {
    /// Which sessions this event is destined for. `PurchaseNotification` targets exactly
    /// one client id, carried out-of-band via `target_client_id`.
    pub fn audience(&self) -> Audience {
        match self {
            BroadcastEvent::StockUpdate { .. } => Audience::Buyers,
            BroadcastEvent::SaleStart { .. } | BroadcastEvent::SaleEnd { .. } => {
                Audience::Everyone
            }
            BroadcastEvent::PurchaseNotification { .. } => Audience::Seller,
        }
    }

    /// For `PurchaseNotification`, the single client id to deliver to; `None` otherwise.
    pub fn target_client_id(&self) -> Option<&str> {
        match self {
            BroadcastEvent::PurchaseNotification { seller_id, .. } => Some(seller_id),
            _ => None,
        }
    }

    /// For an `Everyone` broadcast, the client id that caused it and should therefore
    /// be skipped — that session already received its own direct reply to the request
    /// that triggered this broadcast, so it doesn't need a second copy of the same
    /// news. `None` for broadcasts with no single originator.
    pub fn excluded_client_id(&self) -> Option<&str> {
        match self {
            BroadcastEvent::SaleStart { seller_id, .. } => Some(seller_id),
            BroadcastEvent::SaleEnd { seller_id, .. } => Some(seller_id),
            _ => None,
        }
    }

    /// Renders this event as the wire frame its audience receives. The dispatcher builds
    /// this once per event, not once per recipient.
    pub fn to_message(&self) -> Message {
        match self {
            BroadcastEvent::StockUpdate { items } => Message::new(
                MessageType::StockUpdate,
                BROKER_SENDER_ID,
                serde_json::to_value(ListItemsResponse { items: items.clone() })
                    .expect("ListItemsResponse always serializes"),
            ),
            BroadcastEvent::SaleStart { item_id, seller_id } => Message::new(
                MessageType::SaleStart,
                BROKER_SENDER_ID,
                serde_json::to_value(SaleStartBroadcastPayload {
                    item_id: item_id.clone(),
                    seller_id: seller_id.clone(),
                })
                .expect("SaleStartBroadcastPayload always serializes"),
            ),
            BroadcastEvent::SaleEnd { items, .. } => Message::new(
                MessageType::SaleEnd,
                BROKER_SENDER_ID,
                serde_json::to_value(ListItemsResponse { items: items.clone() })
                    .expect("ListItemsResponse always serializes"),
            ),
            BroadcastEvent::PurchaseNotification { item_id, quantity, buyer_id, .. } => {
                Message::new(
                    MessageType::PurchaseNotification,
                    BROKER_SENDER_ID,
                    serde_json::to_value(PurchaseNotificationPayload {
                        item_id: item_id.clone(),
                        quantity: *quantity,
                        buyer_id: buyer_id.clone(),
                    })
                    .expect("PurchaseNotificationPayload always serializes"),
                )
            }
        }
    }
}
