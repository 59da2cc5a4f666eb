//! Bridges one UI transport session to the core's client queues.
use std::fmt::Display;

use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

use crate::message::{Message, WireError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("decode/encode error: {0}")]
    Wire(#[from] WireError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("core is no longer accepting messages")]
    CoreClosed,
}

/// Runs a session until either direction ends.
///
/// `inbound` yields serialized messages from the UI, `outbound` accepts
/// serialized messages for it. A clean end of `inbound` returns `Ok`; decode
/// or transport errors end the session with an error.
pub async fn bridge<I, O, E>(
    inbound: I,
    outbound: O,
    client_in: mpsc::Sender<Message>,
    mut client_out: broadcast::Receiver<Message>,
) -> Result<(), SessionError>
where
    I: Stream<Item = Result<String, E>>,
    O: Sink<String>,
    O::Error: Display,
    E: Display,
{
    let mut inbound = std::pin::pin!(inbound);
    let mut outbound = std::pin::pin!(outbound);

    let decode = async {
        while let Some(frame) = inbound.next().await {
            let text = frame.map_err(|e| SessionError::Transport(e.to_string()))?;
            let msg = Message::from_wire(&text)?;
            client_in.send(msg).await.map_err(|_| SessionError::CoreClosed)?;
        }
        Ok(())
    };

    let encode = async {
        loop {
            match client_out.recv().await {
                Ok(msg) => {
                    let text = msg.to_wire()?;
                    outbound
                        .send(text)
                        .await
                        .map_err(|e| SessionError::Transport(e.to_string()))?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("UI session lagging, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    };

    tokio::select! {
        res = decode => res,
        res = encode => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, Kind};
    use futures::channel::mpsc as fmpsc;
    use futures::stream;

    #[tokio::test]
    async fn decodes_inbound_and_ends_cleanly() {
        let (client_in, mut core) = mpsc::channel(4);
        let (_outbound_tx, outbound_rx) = broadcast::channel(4);
        let (sink, _ui) = fmpsc::unbounded::<String>();
        let frames = stream::iter(vec![Ok::<_, String>(
            r#"{"Type":"core","Action":"dc","Device":"","Body":""}"#.to_string(),
        )]);

        bridge(frames, sink, client_in, outbound_rx).await.unwrap();
        let msg = core.recv().await.unwrap();
        assert!(msg.is(Kind::Core, message::DISCOVER));
    }

    #[tokio::test]
    async fn malformed_frame_ends_the_session() {
        let (client_in, _core) = mpsc::channel(4);
        let (_outbound_tx, outbound_rx) = broadcast::channel(4);
        let (sink, _ui) = fmpsc::unbounded::<String>();
        let frames = stream::iter(vec![Ok::<_, String>("not json".to_string())]);

        let err = bridge(frames, sink, client_in, outbound_rx).await.unwrap_err();
        assert!(matches!(err, SessionError::Wire(_)));
    }

    #[tokio::test]
    async fn encodes_outbound_messages() {
        let (client_in, _core) = mpsc::channel(4);
        let (outbound_tx, outbound_rx) = broadcast::channel(4);
        let (sink, mut ui) = fmpsc::unbounded::<String>();
        let frames = stream::pending::<Result<String, String>>();

        let session = tokio::spawn(bridge(frames, sink, client_in, outbound_rx));
        outbound_tx.send(Message::response("p0", message::DISCOVER, "hello")).unwrap();
        let text = ui.next().await.unwrap();
        assert_eq!(
            Message::from_wire(&text).unwrap(),
            Message::response("p0", message::DISCOVER, "hello")
        );
        drop(outbound_tx);
        session.await.unwrap().unwrap();
    }
}
