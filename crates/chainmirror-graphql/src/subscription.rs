//! WebSocket transport for the `newBlock` subscription.
//!
//! Speaks the `graphql-ws` sub-protocol the node serves: `connection_init`,
//! then one `start` carrying the subscription document. Every text frame the
//! node sends back is forwarded to the caller as an [`Envelope`] by a
//! background task that owns the socket.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainmirror_core::{Envelope, EnvelopeStream, MirrorError};

pub const SUBPROTOCOL: &str = "graphql-ws";

/// Operation id used for the single subscription of a session.
const OPERATION_ID: &str = "1";

const CHANNEL_CAPACITY: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a single frame from the node means for the session.
#[derive(Debug)]
pub(crate) enum Frame {
    Deliver(Envelope),
    Fail(MirrorError),
    End,
    Skip,
}

/// Connect to `url`, start `query` and return the stream of envelopes.
///
/// The stream ends when the node closes the socket or completes the
/// operation. Dropping it terminates the subscription.
pub async fn subscribe(url: &str, query: &str) -> Result<EnvelopeStream, MirrorError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| MirrorError::Config(format!("bad subscription url {url}: {e}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

    tracing::info!(url = %url, "connecting via WebSocket");
    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| MirrorError::Source(format!("WS connect {url}: {e}")))?;
    let (mut sink, stream) = ws_stream.split();

    for frame in [
        json!({ "type": "connection_init", "payload": {} }),
        json!({ "id": OPERATION_ID, "type": "start", "payload": { "query": query } }),
    ] {
        sink.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| MirrorError::Source(format!("WS send: {e}")))?;
    }

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(pump(sink, stream, tx));

    Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })))
}

/// Background task: forward frames until the socket ends or the receiver
/// goes away.
async fn pump(
    mut sink: SplitSink<Socket, Message>,
    mut stream: SplitStream<Socket>,
    tx: mpsc::Sender<Result<Envelope, MirrorError>>,
) {
    loop {
        let msg = tokio::select! {
            _ = tx.closed() => {
                terminate(&mut sink).await;
                return;
            }
            msg = stream.next() => msg,
        };

        let frame = match msg {
            None => Frame::End,
            Some(Err(e)) => Frame::Fail(MirrorError::Source(format!("WS receive: {e}"))),
            Some(Ok(message)) => handle_frame(message),
        };

        match frame {
            Frame::Deliver(envelope) => {
                if tx.send(Ok(envelope)).await.is_err() {
                    terminate(&mut sink).await;
                    return;
                }
            }
            Frame::Fail(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
            Frame::End => {
                tracing::warn!("WS subscription closed by node");
                return;
            }
            Frame::Skip => {}
        }
    }
}

async fn terminate(sink: &mut SplitSink<Socket, Message>) {
    let bye = json!({ "type": "connection_terminate" }).to_string();
    let _ = sink.send(Message::Text(bye.into())).await;
    let _ = sink.close().await;
}

/// Decide what to do with one WebSocket message.
pub(crate) fn handle_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => match Envelope::from_text(text.as_str()) {
            Ok(envelope) => match envelope.kind.as_str() {
                "connection_error" | "error" => Frame::Fail(MirrorError::Source(format!(
                    "subscription {}: {}",
                    envelope.kind, envelope.payload
                ))),
                "complete" => Frame::End,
                _ => Frame::Deliver(envelope),
            },
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable WS frame");
                Frame::Skip
            }
        },
        Message::Close(_) => Frame::End,
        // tungstenite queues the pong for a ping on its own.
        _ => Frame::Skip,
    }
}
