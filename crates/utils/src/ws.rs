use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::watch,
    time::{Interval, sleep},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{self, HeaderName, HeaderValue},
        protocol::Message,
    },
};
use url::Url;

pub type HeaderFuture = BoxFuture<'static, WsResult<Vec<(HeaderName, HeaderValue)>>>;
pub type HeaderFactory = Arc<dyn Fn() -> HeaderFuture + Send + Sync>;

#[derive(Error, Debug)]
pub enum WsError {
    #[error("WebSocket connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to forward message: {0}")]
    Forward(String),

    #[error("Handler error: {0}")]
    Handler(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Shutdown channel closed unexpectedly")]
    ShutdownChannelClosed,

    #[error("failed to build websocket request: {0}")]
    Request(#[from] http::Error),

    #[error("unsupported websocket scheme `{0}`")]
    Scheme(String),
}

pub type WsResult<T> = std::result::Result<T, WsError>;

#[async_trait::async_trait]
pub trait WsHandler: Send + Sync + 'static {
    /// Called when a new `Message` is received.
    async fn handle_message(&mut self, msg: Message) -> WsResult<()>;

    /// Called when the socket is closed (either remote closed or error).
    async fn on_close(&mut self) -> WsResult<()>;
}

pub struct WsConfig {
    pub url: String,
    pub autoreconnect: bool,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub ping_interval: Option<Duration>,
    pub header_factory: Option<HeaderFactory>,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            autoreconnect: true,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            ping_interval: Some(Duration::from_secs(30)),
            header_factory: None,
        }
    }
}

/// Handle to a running listener. Dropping it does not stop the connection.
pub struct WsClient {
    shutdown: watch::Sender<()>,
}

impl WsClient {
    pub fn shutdown(&self) -> WsResult<()> {
        self.shutdown
            .send(())
            .map_err(|_| WsError::ShutdownChannelClosed)
    }
}

/// Swap an http(s) base for its ws(s) counterpart, dropping path and query.
pub fn derive_ws_url(mut url: Url) -> WsResult<Url> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other @ ("ws" | "wss") => other,
        other => return Err(WsError::Scheme(other.to_string())),
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| WsError::Scheme(scheme.clone()))?;
    url.set_path("");
    url.set_query(None);
    Ok(url)
}

/// Next reconnect delay: doubled, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current * 2, max)
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Spawns a receive-only connection loop that hands every incoming frame to
/// `handler`, reconnecting with backoff until shutdown.
pub async fn run_ws_client<H>(mut handler: H, config: WsConfig) -> WsResult<WsClient>
where
    H: WsHandler,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    tokio::spawn(async move {
        let mut backoff = config.reconnect_base_delay;

        loop {
            tracing::debug!(url = %config.url, "WebSocket connecting");
            let request = match build_request(&config).await {
                Ok(req) => req,
                Err(err) => {
                    tracing::error!(?err, "failed to build websocket request");
                    break;
                }
            };

            match connect_async(request).await {
                Ok((stream, _resp)) => {
                    tracing::info!("WebSocket connected");
                    backoff = config.reconnect_base_delay;
                    let end =
                        run_session(stream, &mut handler, config.ping_interval, &mut shutdown_rx)
                            .await;
                    if matches!(end, SessionEnd::Shutdown) {
                        break;
                    }
                }
                Err(err) => tracing::warn!(?err, "WebSocket connect error"),
            }

            if !config.autoreconnect {
                tracing::info!("autoreconnect disabled, exiting WS loop");
                break;
            }

            tracing::debug!(delay = ?backoff, "WebSocket reconnecting after backoff");
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("shutdown requested during backoff");
                    break;
                }
            }
            backoff = next_backoff(backoff, config.reconnect_max_delay);
        }

        tracing::info!("WebSocket client task exiting");
    });

    Ok(WsClient {
        shutdown: shutdown_tx,
    })
}

/// Pumps one connection until it drops or shutdown is requested.
async fn run_session<H: WsHandler>(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    handler: &mut H,
    ping_interval: Option<Duration>,
    shutdown: &mut watch::Receiver<()>,
) -> SessionEnd {
    let (mut sink, mut stream) = stream.split();
    let mut pings = ping_interval.map(tokio::time::interval);

    let end = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(msg)) => {
                    if let Err(err) = handler.handle_message(msg).await {
                        tracing::error!(?err, "WsHandler failed");
                        break SessionEnd::Disconnected;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(?err, "WebSocket stream error");
                    break SessionEnd::Disconnected;
                }
                None => {
                    tracing::debug!("WebSocket stream ended");
                    break SessionEnd::Disconnected;
                }
            },
            _ = tick(&mut pings) => {
                if let Err(err) = sink.send(Message::Ping(Vec::new().into())).await {
                    tracing::warn!(?err, "WebSocket ping failed");
                    break SessionEnd::Disconnected;
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("WebSocket shutdown requested");
                break SessionEnd::Shutdown;
            }
        }
    };

    if let Err(err) = handler.on_close().await {
        tracing::error!(?err, "WsHandler on_close failed");
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(?err, "WebSocket close failed");
    }
    end
}

/// Resolves on the next keep-alive tick; never resolves without an interval.
async fn tick(pings: &mut Option<Interval>) {
    match pings {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn build_request(config: &WsConfig) -> WsResult<http::Request<()>> {
    let mut request = config.url.clone().into_client_request()?;
    if let Some(factory) = &config.header_factory {
        let headers = factory().await?;
        for (name, value) in headers {
            request.headers_mut().insert(name, value);
        }
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_secure_socket_url_from_https_base() {
        let base = Url::parse("https://tasks.example.com/api/v1?x=1").unwrap();
        let ws = derive_ws_url(base).unwrap();
        assert_eq!(ws.as_str(), "wss://tasks.example.com/");
    }

    #[test]
    fn derives_plain_socket_url_from_http_base() {
        let base = Url::parse("http://localhost:8080").unwrap();
        let ws = derive_ws_url(base).unwrap();
        assert_eq!(ws.scheme(), "ws");
        assert_eq!(ws.port(), Some(8080));
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let base = Url::parse("ftp://example.com").unwrap();
        assert!(matches!(derive_ws_url(base), Err(WsError::Scheme(s)) if s == "ftp"));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..7 {
            delay = next_backoff(delay, max);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_without_interval_never_fires() {
        let mut none = None;
        let fired = tokio::time::timeout(Duration::from_secs(60), tick(&mut none)).await;
        assert!(fired.is_err());

        let mut every = Some(tokio::time::interval(Duration::from_secs(5)));
        tick(&mut every).await;
        let second = tokio::time::timeout(Duration::from_secs(6), tick(&mut every)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn request_carries_factory_headers() {
        let mut config = WsConfig::new("ws://localhost:9/ws");
        config.header_factory = Some(Arc::new(|| -> HeaderFuture {
            Box::pin(async {
                Ok(vec![(
                    http::header::AUTHORIZATION,
                    HeaderValue::from_static("Bearer t"),
                )])
            })
        }));
        let request = build_request(&config).await.unwrap();
        assert_eq!(request.headers()[http::header::AUTHORIZATION], "Bearer t");
        assert_eq!(request.uri(), "ws://localhost:9/ws");
    }
}
