use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{stream::Stream, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, broadcast::error::RecvError, mpsc};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::hub::{Envelope, Hub, TestResponse};

/// What a subscriber may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum Request {
    /// Asks for a `test_response` echoing the payload.
    TestMessage(serde_json::Value),
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(hub): Extension<Arc<Hub>>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, addr, hub))
}

pub(crate) async fn read<S>(mut receiver: S, replies: mpsc::UnboundedSender<Envelope>)
where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(request_text) => {
                trace!(%request_text, "subscriber request");
                match serde_json::from_str(&request_text) {
                    Ok(Request::TestMessage(payload)) => {
                        info!("Test message received");
                        if replies
                            .send(Envelope::TestResponse(TestResponse::echo(payload)))
                            .is_err()
                        {
                            debug!("writer gone");
                            break;
                        }
                    }
                    // Subscribers are listeners, anything else they say is ignored.
                    Err(e) => debug!(%request_text, %e, "Ignoring request"),
                }
            }
            Message::Binary(_) => {
                debug!("client sent binary data");
            }
            Message::Ping(_) => {
                debug!("socket ping");
            }
            Message::Pong(_) => {
                debug!("socket pong");
            }
            Message::Close(_) => {
                debug!("client disconnected");
            }
        }
    }

    debug!("no more stuff");
}

async fn send(
    sender: &mut (impl futures::Sink<Message> + Unpin),
    envelope: &Envelope,
) -> Result<(), ()> {
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!(%envelope, %e, "Could not serialize, skipping");
            return Ok(());
        }
    };

    sender.send(Message::Text(text)).await.map_err(|_| ())?;
    trace!(%envelope, "Envelope flushed");

    Ok(())
}

pub(crate) async fn write(
    mut sender: impl futures::Sink<Message> + Unpin,
    initial: Vec<Envelope>,
    mut broadcasts: broadcast::Receiver<Envelope>,
    mut replies: mpsc::UnboundedReceiver<Envelope>,
) {
    for envelope in &initial {
        if send(&mut sender, envelope).await.is_err() {
            debug!("client disconnected");
            return;
        }
    }

    loop {
        let envelope = tokio::select! {
            broadcast = broadcasts.recv() => match broadcast {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber too slow, envelopes dropped");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
            reply = replies.recv() => match reply {
                Some(envelope) => envelope,
                None => return,
            },
        };

        if send(&mut sender, &envelope).await.is_err() {
            debug!("client disconnected");
            return;
        }
    }
}

pub(crate) async fn handle_websocket(websocket: WebSocket, addr: SocketAddr, hub: Arc<Hub>) {
    let subscription = hub.join(addr).await;
    let subscriber = subscription.subscriber;

    let (stream_sender, stream_receiver) = websocket.split();
    let (reply_sender, reply_receiver) = mpsc::unbounded_channel::<Envelope>();

    let span = info_span!("Subscriber", %subscriber);

    let read_handle = tokio::spawn(
        read(stream_receiver, reply_sender).instrument(info_span!(parent: &span, "Read")),
    );
    let write_handle = tokio::spawn(
        write(
            stream_sender,
            subscription.initial,
            subscription.receiver,
            reply_receiver,
        )
        .instrument(info_span!(parent: &span, "Write")),
    );
    drop(span);

    match read_handle.await {
        Ok(()) => debug!("Read task joined"),
        Err(e) => warn!("Read task join error: {e:?}"),
    }

    debug!("Aborting write task");
    // This ensures the underlying TCP connection gets closed,
    // which signals the peer that the session is over.
    write_handle.abort();

    hub.leave(subscriber.id).await;
}
