//! Transport — the participant's pipe to the relay.
//!
//! A [`Link`] is a pair of frame channels. In-process participants get one
//! from the relay hub directly; remote ones get one from [`connect`], which
//! pumps binary protobuf websocket messages in and out of the channels.
//! Per-sender ordering is whatever the websocket gives, which is FIFO.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::board::object::ParticipantId;

const LINK_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

/// Bidirectional frame pipe.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<frames::Frame>,
    pub inbound: mpsc::Receiver<frames::Frame>,
}

impl Link {
    /// Two links wired back to back, for tests.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Self { outbound: a_tx, inbound: b_rx }, Self { outbound: b_tx, inbound: a_rx })
    }
}

/// Relay websocket URL for a participant joining `room`.
#[must_use]
pub fn relay_url(base: &str, room: &str, participant: ParticipantId) -> String {
    let base = base.trim_end_matches('/');
    format!("{base}/ws?room={room}&participant={participant}")
}

/// Open a websocket to the relay and bridge it onto a [`Link`].
///
/// # Errors
///
/// Returns [`TransportError::Connect`] if the handshake fails.
pub async fn connect(url: &str) -> Result<Link, TransportError> {
    let (stream, _) = connect_async(url).await.map_err(Box::new)?;
    info!(%url, "connected to relay");
    let (mut sink, mut source) = stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<frames::Frame>(LINK_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<frames::Frame>(LINK_CAPACITY);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = frames::encode_frame(&frame);
            if let Err(e) = sink.send(WsMessage::Binary(bytes.into())).await {
                warn!(error = %e, "relay send failed; closing link");
                break;
            }
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "relay close failed");
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            let bytes = match msg {
                Ok(WsMessage::Binary(bytes)) => bytes,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "relay receive failed; closing link");
                    break;
                }
            };
            match frames::decode_frame(&bytes) {
                Ok(frame) => {
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable relay frame"),
            }
        }
        info!("relay link closed");
    });

    Ok(Link { outbound: out_tx, inbound: in_rx })
}
