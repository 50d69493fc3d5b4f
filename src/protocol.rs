//! The wire envelope: a length-prefixed JSON frame per `Message`.
//!
//! Frames are self-delimiting: a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload. `tokio_util::codec::LengthDelimitedCodec` supplies the length-prefix
//! half; `serde_json` supplies the payload encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

use crate::catalog::ItemName;
use crate::sale::SaleSnapshot;

/// Client id before registration completes.
pub const UNREGISTERED: &str = "unregistered";

/// The two client roles a registered session is bound to for the rest of its
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "BUYER",
            Role::Seller => "SELLER",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUYER" => Ok(Role::Buyer),
            "SELLER" => Ok(Role::Seller),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    Ack,
    SaleStart,
    SaleEnd,
    BuyRequest,
    BuyResponse,
    ListItems,
    StockUpdate,
    Error,
    Heartbeat,
    PurchaseNotification,
}

/// The envelope every frame carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "senderId", default = "default_sender_id")]
    pub sender_id: String,
    pub timestamp: u64,
}

fn default_sender_id() -> String {
    UNREGISTERED.to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Message {
    pub fn new(kind: MessageType, sender_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            data,
            sender_id: sender_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn error(sender_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            sender_id,
            serde_json::json!({ "error": reason.into() }),
        )
    }
}

/// `tokio_util`'s length-delimited framing, configured for a 4-byte big-endian length
/// header with no header-field offsets.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

// --- typed payloads, one struct per message kind's JSON shape ---

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterPayload {
    #[serde(rename = "clientType")]
    pub client_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    #[serde(rename = "clientId")]
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaleStartRequest {
    pub name: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaleStartResponse {
    pub success: bool,
    #[serde(rename = "itemId")]
    pub item_id: Option<String>,
    pub name: Option<ItemName>,
    pub quantity: Option<f64>,
    #[serde(rename = "remainingTime")]
    pub remaining_time: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuyRequestPayload {
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyResponsePayload {
    pub success: bool,
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListItemsResponse {
    pub items: Vec<SaleSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseNotificationPayload {
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub quantity: f64,
    #[serde(rename = "buyerId")]
    pub buyer_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaleStartBroadcastPayload {
    #[serde(rename = "itemId")]
    pub item_id: String,
    #[serde(rename = "sellerId")]
    pub seller_id: String,
}
