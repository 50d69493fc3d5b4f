//! The session: one per connected client. Performs the registration handshake, then runs
//! the dispatch-by-role message loop, writing responses and broadcasts back through a
//! single serializing writer task.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEvent;
use crate::catalog::ItemName;
use crate::error::BrokerError;
use crate::manager::MarketManager;
use crate::protocol::{
    self, AckPayload, BuyRequestPayload, BuyResponsePayload, ListItemsResponse, Message,
    MessageType, RegisterPayload, Role, SaleStartRequest, SaleStartResponse, UNREGISTERED,
};
use crate::server::{Registry, SessionHandle};

/// Depth of each session's outbound queue: both the session's own replies and broadcasts
/// fanned out to it from the server's dispatcher are enqueued here.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Drives one client connection end to end: registration handshake, then the
/// dispatch-by-role message loop, until the socket closes or an unrecoverable decode
/// error occurs. Consumes the socket.
pub async fn run(
    stream: TcpStream,
    manager: Arc<MarketManager>,
    registry: Registry,
    broadcast_tx: mpsc::Sender<BroadcastEvent>,
) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader: Reader = FramedRead::new(read_half, protocol::frame_codec());
    let writer: Writer = FramedWrite::new(write_half, protocol::frame_codec());

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(run_writer(writer, outbound_rx));

    let (client_id, role) = match handshake(&mut reader, &manager, &registry, &outbound_tx).await {
        Ok(registered) => registered,
        Err(err) => {
            warn!(?peer, %err, "registration failed");
            let _ = outbound_tx.send(Message::error(UNREGISTERED, err.wire_message())).await;
            drop(outbound_tx);
            let _ = writer_task.await;
            return;
        }
    };
    info!(client_id = %client_id, role = role.as_str(), ?peer, "session registered");

    message_loop(&client_id, role, &mut reader, &manager, &registry, &outbound_tx, &broadcast_tx).await;

    registry.lock().await.remove(&client_id);
    drop(outbound_tx);
    let _ = writer_task.await;
    info!(client_id = %client_id, "session terminated");
}

/// Drains the per-session outbound queue and serializes each frame onto the wire. The
/// single consumer of this queue is what keeps a session's own replies and the
/// broadcasts fanned out to it from interleaving.
async fn run_writer(mut writer: Writer, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let bytes = match serde_json::to_vec(&msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to encode outbound frame");
                continue;
            }
        };
        if let Err(err) = writer.send(Bytes::from(bytes)).await {
            warn!(%err, "transport error on write; closing writer");
            return;
        }
    }
}

/// Reads exactly one inbound message and, if it is a well-formed REGISTER, assigns a
/// client id, seeds the seller ledger if applicable, inserts the session into the
/// registry, and sends the ACK.
async fn handshake(
    reader: &mut Reader,
    manager: &Arc<MarketManager>,
    registry: &Registry,
    outbound_tx: &mpsc::Sender<Message>,
) -> Result<(String, Role), BrokerError> {
    let frame = reader
        .next()
        .await
        .ok_or_else(|| BrokerError::ProtocolError("connection closed before registration".into()))?
        .map_err(|err| BrokerError::Transport(err.to_string()))?;

    let msg: Message = serde_json::from_slice(&frame)
        .map_err(|err| BrokerError::ProtocolError(format!("malformed first frame: {err}")))?;

    if msg.kind != MessageType::Register {
        return Err(BrokerError::ProtocolError(format!(
            "first message must be REGISTER, got {:?}",
            msg.kind
        )));
    }

    let payload: RegisterPayload = serde_json::from_value(msg.data)
        .map_err(|err| BrokerError::ProtocolError(format!("missing clientType: {err}")))?;
    let role: Role = payload.client_type.parse().map_err(|_| {
        BrokerError::ProtocolError(format!("unknown clientType: {}", payload.client_type))
    })?;

    let client_id = generate_client_id();
    if role == Role::Seller {
        manager.initialize_seller_stock(&client_id).await;
    }
    registry.lock().await.insert(
        client_id.clone(),
        SessionHandle::new(role, outbound_tx.clone()),
    );

    let ack = Message::new(
        MessageType::Ack,
        client_id.clone(),
        serde_json::to_value(AckPayload { client_id: client_id.clone() })
            .expect("AckPayload always serializes"),
    );
    outbound_tx
        .send(ack)
        .await
        .map_err(|_| BrokerError::Transport("outbound queue closed during registration".into()))?;

    Ok((client_id, role))
}

/// A short opaque client id, collision-free with overwhelming probability across a
/// process lifetime.
fn generate_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Reads and dispatches messages until the socket closes or decoding fails
/// unrecoverably.
async fn message_loop(
    client_id: &str,
    role: Role,
    reader: &mut Reader,
    manager: &Arc<MarketManager>,
    registry: &Registry,
    outbound_tx: &mpsc::Sender<Message>,
    broadcast_tx: &mpsc::Sender<BroadcastEvent>,
) {
    loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(client_id, %err, "transport error on read; closing session");
                break;
            }
            None => {
                debug!(client_id, "connection closed by peer");
                break;
            }
        };

        let msg: Message = match serde_json::from_slice(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(client_id, %err, "unrecoverable decode error; closing session");
                break;
            }
        };

        if let Some(handle) = registry.lock().await.get(client_id) {
            handle.touch();
        }

        if let Err(err) = dispatch(client_id, role, msg, manager, outbound_tx, broadcast_tx).await {
            // Request-scoped errors are reported to the requesting client only; the
            // session continues.
            let _ = outbound_tx.send(Message::error(client_id, err.wire_message())).await;
        }
    }
}

/// The dispatch table: one arm per message kind, role-checked where it matters.
async fn dispatch(
    client_id: &str,
    role: Role,
    msg: Message,
    manager: &Arc<MarketManager>,
    outbound_tx: &mpsc::Sender<Message>,
    broadcast_tx: &mpsc::Sender<BroadcastEvent>,
) -> Result<(), BrokerError> {
    match msg.kind {
        MessageType::SaleStart => {
            require_role(role, Role::Seller, "SALE_START")?;
            let req: SaleStartRequest = serde_json::from_value(msg.data)
                .map_err(|err| BrokerError::ProtocolError(format!("malformed SALE_START: {err}")))?;
            let item: ItemName = req
                .name
                .parse()
                .map_err(|_| BrokerError::UnknownItem(req.name.clone()))?;
            let sale = manager.start_sale(client_id, item, req.quantity).await?;

            let response = Message::new(
                MessageType::SaleStart,
                client_id,
                serde_json::to_value(SaleStartResponse {
                    success: true,
                    item_id: Some(sale.id.clone()),
                    name: Some(sale.item_name),
                    quantity: Some(sale.remaining()),
                    remaining_time: Some(sale.remaining_time().as_millis() as u64),
                })
                .expect("SaleStartResponse always serializes"),
            );
            let _ = outbound_tx.send(response).await;

            let _ = broadcast_tx
                .send(BroadcastEvent::SaleStart {
                    item_id: sale.id.clone(),
                    seller_id: client_id.to_string(),
                })
                .await;
            let _ = broadcast_tx
                .send(BroadcastEvent::StockUpdate { items: manager.get_active_items().await })
                .await;
            Ok(())
        }
        MessageType::SaleEnd => {
            require_role(role, Role::Seller, "SALE_END")?;
            manager.end_seller_sales(client_id).await;

            let response = Message::new(MessageType::SaleEnd, client_id, json!({ "success": true }));
            let _ = outbound_tx.send(response).await;

            let _ = broadcast_tx
                .send(BroadcastEvent::SaleEnd {
                    seller_id: client_id.to_string(),
                    items: manager.get_active_items().await,
                })
                .await;
            Ok(())
        }
        MessageType::BuyRequest => {
            require_role(role, Role::Buyer, "BUY_REQUEST")?;
            let req: BuyRequestPayload = serde_json::from_value(msg.data)
                .map_err(|err| BrokerError::ProtocolError(format!("malformed BUY_REQUEST: {err}")))?;

            let seller_id = manager.seller_for(&req.item_id).await;
            let success = manager.handle_buy_request(&req.item_id, req.quantity).await?;

            let response = Message::new(
                MessageType::BuyResponse,
                client_id,
                serde_json::to_value(BuyResponsePayload {
                    success,
                    item_id: req.item_id.clone(),
                    quantity: req.quantity,
                })
                .expect("BuyResponsePayload always serializes"),
            );
            let _ = outbound_tx.send(response).await;

            if success {
                let _ = broadcast_tx
                    .send(BroadcastEvent::StockUpdate { items: manager.get_active_items().await })
                    .await;
                if let Some(seller_id) = seller_id {
                    let _ = broadcast_tx
                        .send(BroadcastEvent::PurchaseNotification {
                            seller_id,
                            item_id: req.item_id,
                            quantity: req.quantity,
                            buyer_id: client_id.to_string(),
                        })
                        .await;
                }
            }
            Ok(())
        }
        MessageType::ListItems => {
            let response = Message::new(
                MessageType::ListItems,
                client_id,
                serde_json::to_value(ListItemsResponse { items: manager.get_active_items().await })
                    .expect("ListItemsResponse always serializes"),
            );
            let _ = outbound_tx.send(response).await;
            Ok(())
        }
        MessageType::Heartbeat => Ok(()),
        other => {
            debug!(client_id, kind = ?other, "ignoring message kind with no client-facing effect");
            Err(BrokerError::ProtocolError(format!(
                "unhandled message kind: {other:?}"
            )))
        }
    }
}

fn require_role(role: Role, required: Role, action: &str) -> Result<(), BrokerError> {
    if role != required {
        return Err(BrokerError::RoleViolation {
            role: role.as_str().to_string(),
            action: action.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_client_ids_are_short_and_distinct() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn require_role_rejects_a_mismatched_role() {
        let err = require_role(Role::Buyer, Role::Seller, "SALE_START").unwrap_err();
        assert!(matches!(err, BrokerError::RoleViolation { .. }));
    }

    #[test]
    fn require_role_accepts_a_matching_role() {
        assert!(require_role(Role::Seller, Role::Seller, "SALE_START").is_ok());
    }
}
