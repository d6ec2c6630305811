//! Network driver for the headless client.
//!
//! Implements the [`Driver`] trait with reqwest for the REST endpoints and
//! tokio-tungstenite for the realtime connection. Every request runs in its
//! own task and reports back through one input channel, tagged with the
//! epoch it was started under. Realtime frames and failures also carry the
//! generation of the open that produced them.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use haggle_app::{Driver, DriverInput};
use haggle_client::SessionEvent;
use haggle_core::{ConnectionError, FetchError};
use haggle_proto::{
    ConversationId, Handshake, InboundEvent, OutboundFrame, ProtocolError,
    rest::{LAST_CHATS_PATH, LastChatsResponse, PeerResponse, peer_path},
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_tungstenite::tungstenite::Message;

/// Network driver errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No realtime transport for this epoch.
    #[error("realtime transport not connected")]
    NotConnected,

    /// Every input sender is gone.
    #[error("input channel closed")]
    InputClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Endpoints and credentials.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// REST base URL, e.g. `https://api.example.com`.
    pub api_url: String,
    /// Realtime WebSocket URL.
    pub realtime_url: String,
    /// Bearer token for REST calls.
    pub token: Option<String>,
    /// Longest wait in [`Driver::poll_input`] before the runtime ticks.
    pub tick: Duration,
}

/// How long a closed transport may take to flush queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Input = DriverInput<Instant>;

struct Realtime {
    epoch: u64,
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    task: AbortHandle,
}

/// Network driver implementing the [`Driver`] trait.
pub struct NetDriver {
    config: NetConfig,
    http: reqwest::Client,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,
    realtime: Option<Realtime>,
    fetches: Vec<AbortHandle>,
}

impl NetDriver {
    /// Create a driver. Nothing connects until the runtime asks.
    pub fn new(config: NetConfig) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        Self { config, http: reqwest::Client::new(), inputs_tx, inputs_rx, realtime: None, fetches: Vec::new() }
    }

    /// Sender for feeding commands from outside the runtime.
    pub fn inputs(&self) -> mpsc::UnboundedSender<Input> {
        self.inputs_tx.clone()
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.config.api_url.trim_end_matches('/'));
        let request = self.http.get(url);
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn spawn_fetch<F>(&mut self, fetch: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.fetches.retain(|handle| !handle.is_finished());
        self.fetches.push(tokio::spawn(fetch).abort_handle());
    }
}

impl Driver for NetDriver {
    type Error = NetError;
    type Instant = Instant;

    async fn poll_input(&mut self) -> Result<Option<Input>, Self::Error> {
        let tick = self.config.tick;
        tokio::select! {
            input = self.inputs_rx.recv() => input.map(Some).ok_or(NetError::InputClosed),
            () = tokio::time::sleep(tick) => Ok(None),
        }
    }

    fn fetch_last_chats(&mut self, epoch: u64) {
        let request = self.get(LAST_CHATS_PATH);
        let inputs = self.inputs_tx.clone();
        self.spawn_fetch(async move {
            let result = fetch_json::<LastChatsResponse>(request).await.map(|body| body.chats);
            if let Err(error) = &result {
                tracing::warn!(%error, "last chats request failed");
            }
            let _ = inputs.send(DriverInput::Session(SessionEvent::LastChatsFetched { epoch, result }));
        });
    }

    fn fetch_peer(&mut self, epoch: u64, conversation_id: ConversationId) {
        let request = self.get(&peer_path(&conversation_id));
        let inputs = self.inputs_tx.clone();
        self.spawn_fetch(async move {
            let result = fetch_json::<PeerResponse>(request).await.map(|body| body.peer);
            let _ = inputs.send(DriverInput::Session(SessionEvent::PeerFetched { epoch, conversation_id, result }));
        });
    }

    fn open_realtime(&mut self, epoch: u64, generation: u64, handshake: Handshake) {
        self.close_realtime(epoch);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let url = self.config.realtime_url.clone();
        let inputs = self.inputs_tx.clone();
        let tag = (epoch, generation);
        let task = tokio::spawn(async move {
            let error = match run_socket(&url, tag, handshake, outbound_rx, &inputs).await {
                Ok(()) => ConnectionError::Transport("connection closed".into()),
                Err(error) => ConnectionError::Transport(error.to_string()),
            };
            tracing::info!(%error, generation, "realtime transport ended");
            let _ = inputs.send(DriverInput::Session(SessionEvent::TransportFailed { epoch, generation, error }));
        });

        tracing::debug!(epoch, generation, "realtime transport opening");
        self.realtime = Some(Realtime { epoch, generation, outbound, task: task.abort_handle() });
    }

    fn close_realtime(&mut self, _epoch: u64) {
        let Some(Realtime { epoch, generation, outbound, task }) = self.realtime.take() else {
            return;
        };
        // Without a sender the pump drains what is queued, then sends Close
        drop(outbound);
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            task.abort();
        });
        tracing::debug!(epoch, generation, "realtime transport closing");
    }

    async fn transmit(&mut self, epoch: u64, frame: OutboundFrame) -> Result<(), Self::Error> {
        let realtime = self.realtime.as_ref().filter(|r| r.epoch == epoch).ok_or(NetError::NotConnected)?;
        let text = frame.encode()?;
        realtime.outbound.send(text).map_err(|_| NetError::NotConnected)
    }

    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn stop(&mut self) {
        if let Some(realtime) = self.realtime.take() {
            realtime.task.abort();
        }
        for fetch in self.fetches.drain(..) {
            fetch.abort();
        }
    }
}

async fn fetch_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, FetchError> {
    let response = request.send().await.map_err(|e| FetchError::Transport(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Http { status: status.as_u16() });
    }
    let body = response.text().await.map_err(|e| FetchError::Transport(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
}

/// Connect, say hello, then pump frames both ways until either side closes.
///
/// Returns `Ok` on a clean close. Frames with an unknown event tag are
/// skipped; malformed frames end the connection.
async fn run_socket(
    url: &str,
    (epoch, generation): (u64, u64),
    handshake: Handshake,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inputs: &mpsc::UnboundedSender<Input>,
) -> Result<(), NetError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
    let (mut write, mut read) = socket.split();

    let hello = OutboundFrame::Hello(handshake).encode()?;
    write.send(Message::Text(hello.into())).await?;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match InboundEvent::decode(text.as_str()) {
                    Ok(event) => {
                        let input = DriverInput::Session(SessionEvent::FrameReceived { epoch, generation, event });
                        if inputs.send(input).is_err() {
                            return Ok(());
                        }
                    },
                    Err(ProtocolError::UnknownEvent(detail)) => {
                        tracing::debug!(%detail, "skipping unknown realtime event");
                    },
                    Err(error) => return Err(error.into()),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {},
                Some(Err(error)) => return Err(error.into()),
            },

            text = outbound.recv() => match text {
                Some(text) => write.send(Message::Text(text.into())).await?,
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                },
            },
        }
    }
}
