use super::ClientEvent;
use crate::error::{Result, SessionError};
use crate::token::Credential;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tungstenite::Message,
>;

const CONTROL_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An open link to the remote endpoint.
///
/// Outbound control messages go through a bounded channel to a writer pump;
/// inbound text frames arrive on another channel from a reader pump. Either
/// side can be closed independently and closing twice is harmless.
pub struct TransportHandle {
    control_tx: Option<mpsc::Sender<ClientEvent>>,
    inbound_rx: mpsc::Receiver<String>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl TransportHandle {
    pub fn new(control_tx: mpsc::Sender<ClientEvent>, inbound_rx: mpsc::Receiver<String>) -> Self {
        Self {
            control_tx: Some(control_tx),
            inbound_rx,
            tasks: Vec::new(),
            closed: false,
        }
    }

    fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    /// True while the control channel can still be written.
    pub fn is_open(&self) -> bool {
        !self.closed
            && self
                .control_tx
                .as_ref()
                .map(|tx| !tx.is_closed())
                .unwrap_or(false)
    }

    pub fn send(&self, event: ClientEvent) -> Result<()> {
        let tx = self
            .control_tx
            .as_ref()
            .ok_or_else(|| SessionError::NetworkError("control channel closed".into()))?;
        tx.try_send(event)
            .map_err(|e| SessionError::NetworkError(format!("control channel: {}", e)))
    }

    /// Next inbound text message; `None` once the remote side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.inbound_rx.recv().await
    }

    /// Stops accepting outbound control messages. The writer flushes and exits.
    pub fn close_control(&mut self) {
        self.control_tx = None;
    }

    pub fn close(&mut self) {
        self.close_control();
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbound_rx.close();
        // Only the reader is aborted; the writer sends a close frame on its way out.
        if let Some(reader) = self.tasks.pop() {
            reader.abort();
        }
        self.tasks.clear();
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Negotiates a transport with the remote endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// `audio_rx` carries captured PCM16 frames for the lifetime of the transport.
    async fn connect(
        &self,
        credential: &Credential,
        audio_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<TransportHandle>;
}

/// WebSocket connector for the realtime endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(realtime_url: &str, model: &str) -> Self {
        Self {
            url: format!("{}?model={}", realtime_url.trim_end_matches('/'), model),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_request(
        &self,
        credential: &Credential,
    ) -> Result<tungstenite::http::Request<()>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::NegotiationFailed(format!("bad realtime url: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", credential.secret()))
            .map_err(|e| SessionError::NegotiationFailed(format!("bad credential: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);
        Ok(request)
    }
}

fn classify_connect_error(err: tungstenite::Error) -> SessionError {
    match err {
        tungstenite::Error::Http(resp) => SessionError::NegotiationFailed(format!(
            "endpoint rejected handshake with HTTP {}",
            resp.status().as_u16()
        )),
        tungstenite::Error::Url(e) => SessionError::NegotiationFailed(e.to_string()),
        tungstenite::Error::HttpFormat(e) => SessionError::NegotiationFailed(e.to_string()),
        tungstenite::Error::Protocol(e) => SessionError::NegotiationFailed(e.to_string()),
        other => SessionError::NetworkError(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        credential: &Credential,
        audio_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<TransportHandle> {
        let request = self.build_request(credential)?;
        log::info!("[transport] connecting to {}", self.url);
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(classify_connect_error)?;
        log::info!("[transport] websocket connected");

        let (ws_tx, mut ws_rx) = ws_stream.split();
        let (control_tx, control_rx) = mpsc::channel::<ClientEvent>(CONTROL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_CAPACITY);

        let writer = tokio::spawn(run_writer(ws_tx, control_rx, audio_rx));

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        log::error!("[transport] websocket error: {}", e);
                        break;
                    }
                };
                match msg {
                    tungstenite::Message::Text(text) => {
                        if inbound_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    tungstenite::Message::Close(frame) => {
                        match frame {
                            Some(frame) => log::warn!(
                                "[transport] websocket closed: {} {}",
                                frame.code,
                                frame.reason
                            ),
                            None => log::warn!("[transport] websocket closed"),
                        }
                        break;
                    }
                    _ => continue,
                }
            }
            log::debug!("[transport] reader stopped");
        });

        // Reader last: `close` aborts it by popping.
        Ok(TransportHandle::new(control_tx, inbound_rx).with_tasks(vec![writer, reader]))
    }
}

async fn send_text(ws_tx: &mut WsSink, event: &ClientEvent) -> bool {
    ws_tx
        .send(tungstenite::Message::Text(event.to_json().into()))
        .await
        .is_ok()
}

async fn send_audio(ws_tx: &mut WsSink, pcm: &[u8]) -> bool {
    if pcm.is_empty() {
        return true;
    }
    let append = ClientEvent::AudioAppend {
        audio: BASE64.encode(pcm),
    };
    send_text(ws_tx, &append).await
}

async fn run_writer(
    mut ws_tx: WsSink,
    mut control_rx: mpsc::Receiver<ClientEvent>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut audio_open = true;
    let mut frames: u64 = 0;
    loop {
        tokio::select! {
            biased;
            ctrl = control_rx.recv() => {
                let event = match ctrl {
                    Some(e) => e,
                    None => break,
                };
                if event == ClientEvent::AudioCommit {
                    // Audio already captured belongs to this turn; it must precede the commit.
                    let mut ok = true;
                    while let Ok(pcm) = audio_rx.try_recv() {
                        frames += 1;
                        if !send_audio(&mut ws_tx, &pcm).await {
                            ok = false;
                            break;
                        }
                    }
                    if !ok {
                        break;
                    }
                    log::debug!("[transport] commit after {} frames", frames);
                }
                if !send_text(&mut ws_tx, &event).await {
                    log::error!("[transport] failed to send control message");
                    break;
                }
            }
            audio = audio_rx.recv(), if audio_open => {
                match audio {
                    Some(pcm) => {
                        frames += 1;
                        if !send_audio(&mut ws_tx, &pcm).await {
                            break;
                        }
                    }
                    None => audio_open = false,
                }
            }
        }
    }
    log::info!("[transport] closing websocket");
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.close()).await;
}
