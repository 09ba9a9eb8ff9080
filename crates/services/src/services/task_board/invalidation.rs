use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    Message,
    http::{HeaderValue, header::AUTHORIZATION},
};
use utils::ws::{
    HeaderFactory, HeaderFuture, WsClient, WsConfig, WsError, WsHandler, WsResult, run_ws_client,
};

use super::config::BoardConfig;

/// A change notice from the real-time channel. The payload is never trusted as
/// data; every notice triggers a full retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationEvent {
    Created {
        #[serde(default, alias = "taskId", alias = "id")]
        task_id: Option<String>,
    },
    Updated {
        #[serde(default, alias = "taskId", alias = "id")]
        task_id: Option<String>,
    },
    Deleted {
        #[serde(default, alias = "taskId", alias = "id")]
        task_id: Option<String>,
    },
}

impl InvalidationEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            InvalidationEvent::Created { task_id }
            | InvalidationEvent::Updated { task_id }
            | InvalidationEvent::Deleted { task_id } => task_id.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InvalidationEvent::Created { .. } => "created",
            InvalidationEvent::Updated { .. } => "updated",
            InvalidationEvent::Deleted { .. } => "deleted",
        }
    }

    /// `None` for anything that is not a recognised change notice.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::debug!(raw, ?err, "ignoring unrecognised realtime message");
                None
            }
        }
    }
}

/// Forwards change notices from the socket to the board.
pub struct InvalidationListener {
    events: mpsc::UnboundedSender<InvalidationEvent>,
}

impl InvalidationListener {
    pub fn new(events: mpsc::UnboundedSender<InvalidationEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl WsHandler for InvalidationListener {
    async fn handle_message(&mut self, msg: Message) -> WsResult<()> {
        let Message::Text(txt) = msg else {
            return Ok(());
        };
        if let Some(event) = InvalidationEvent::parse(&txt) {
            tracing::debug!(kind = event.kind(), task_id = ?event.task_id(), "task invalidated");
            self.events
                .send(event)
                .map_err(|err| WsError::Forward(err.to_string()))?;
        }
        Ok(())
    }

    async fn on_close(&mut self) -> WsResult<()> {
        tracing::info!("realtime channel closed");
        Ok(())
    }
}

fn bearer_headers(token: Option<String>) -> Option<HeaderFactory> {
    let token = token?;
    let factory: HeaderFactory = Arc::new(move || -> HeaderFuture {
        let token = token.clone();
        Box::pin(async move {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| WsError::Handler(Box::new(err)))?;
            Ok(vec![(AUTHORIZATION, value)])
        })
    });
    Some(factory)
}

/// Connect to the board's socket and return the client plus the stream of
/// change notices. The connection reconnects with backoff on its own.
pub async fn connect(
    config: &BoardConfig,
) -> Result<(WsClient, mpsc::UnboundedReceiver<InvalidationEvent>), WsError> {
    let url = config
        .websocket_endpoint()
        .map_err(|err| WsError::Handler(Box::new(err)))?;

    let mut ws_config = WsConfig::new(url.as_str());
    ws_config.header_factory = bearer_headers(config.bearer_token.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    let client = run_ws_client(InvalidationListener::new(tx), ws_config).await?;
    tracing::info!(%url, "realtime channel started");
    Ok((client, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_change_kind() {
        assert_eq!(
            InvalidationEvent::parse(r#"{"type":"created","taskId":"t1"}"#),
            Some(InvalidationEvent::Created {
                task_id: Some("t1".into())
            })
        );
        assert_eq!(
            InvalidationEvent::parse(r#"{"type":"updated"}"#),
            Some(InvalidationEvent::Updated { task_id: None })
        );
        assert_eq!(
            InvalidationEvent::parse(r#"{"type":"deleted","id":"t9"}"#)
                .and_then(|e| e.task_id().map(str::to_string)),
            Some("t9".to_string())
        );
    }

    #[test]
    fn ignores_unknown_messages() {
        assert_eq!(InvalidationEvent::parse(r#"{"type":"typing"}"#), None);
        assert_eq!(InvalidationEvent::parse("not json"), None);
    }

    #[tokio::test]
    async fn listener_forwards_text_frames_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = InvalidationListener::new(tx);

        listener
            .handle_message(Message::Text(r#"{"type":"updated","taskId":"a"}"#.into()))
            .await
            .unwrap();
        listener
            .handle_message(Message::Ping(Vec::new().into()))
            .await
            .unwrap();
        listener
            .handle_message(Message::Text("{}".into()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().task_id(), Some("a"));
        assert!(rx.try_recv().is_err());
    }
}
