//! Streaming session client for the Lyria realtime music service.
//!
//! One WebSocket connection per generation: setup handshake, one weighted
//! prompt, a PLAY control, then a lazy stream of PCM chunks until the remote
//! side closes or the caller stops consuming. Chunks arrive as JSON text
//! frames carrying base64 16-bit PCM; a prompt the service refuses arrives as
//! a filter notice instead of audio.

use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::{Error, Result};

const SERVICE_HOST: &str = "generativelanguage.googleapis.com";
const SERVICE_PATH: &str =
    "ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateMusic";

/// Bound on waiting for the server's setup acknowledgement.
const SETUP_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One unit delivered by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw interleaved PCM16LE bytes.
    Audio(Vec<u8>),
    /// The service refused the prompt; carries the remote reason.
    Filtered(String),
}

/// Source of [`Chunk`]s for a generation task.
///
/// The production implementation is [`MusicSession`]; tests drive the task
/// with scripted sources instead of a live connection.
pub trait ChunkStream: Send {
    /// Next audio chunk or filter notice; `None` when the remote side closed
    /// the stream cleanly.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Chunk>>> + Send;

    /// Release the underlying transport. Best-effort, never fails.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ── Wire format ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
struct Setup<'a> {
    model: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptMessage {
    client_content: ClientContent,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    weighted_prompts: Vec<WeightedPrompt>,
}

#[derive(Serialize)]
struct WeightedPrompt {
    text: String,
    weight: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackMessage {
    playback_control: &'static str,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    filtered_prompt: Option<FilteredPrompt>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ServerContent {
    audio_chunks: Vec<AudioChunk>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AudioChunk {
    data: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct FilteredPrompt {
    text: Option<String>,
    filtered_reason: Option<String>,
}

/// Decoded server frame.
enum ServerEvent {
    SetupComplete,
    Chunk(Chunk),
    /// Frame carried nothing we consume (keepalive, unknown fields).
    Keepalive,
}

fn parse_server_event(raw: &str) -> Result<ServerEvent> {
    let message: ServerMessage = serde_json::from_str(raw)?;

    if let Some(notice) = message.filtered_prompt {
        let reason = notice
            .filtered_reason
            .unwrap_or_else(|| "no reason given".to_string());
        if let Some(text) = notice.text {
            tracing::debug!(prompt = %text, "prompt filtered by service");
        }
        return Ok(ServerEvent::Chunk(Chunk::Filtered(reason)));
    }

    if let Some(content) = message.server_content
        && let Some(chunk) = content.audio_chunks.first()
    {
        let bytes = BASE64
            .decode(&chunk.data)
            .map_err(|e| Error::Connect(format!("malformed audio chunk: {e}")))?;
        return Ok(ServerEvent::Chunk(Chunk::Audio(bytes)));
    }

    if message.setup_complete.is_some() {
        return Ok(ServerEvent::SetupComplete);
    }

    Ok(ServerEvent::Keepalive)
}

// ── Error mapping ─────────────────────────────────────────────────────────

fn session_url(api_key: &str) -> String {
    format!("wss://{SERVICE_HOST}/{SERVICE_PATH}?key={api_key}")
}

/// HTTP 401/403 during the upgrade means the credential is bad; everything
/// else is a transport problem.
fn connect_error(error: tungstenite::Error) -> Error {
    match &error {
        tungstenite::Error::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            Error::Auth(format!(
                "service rejected credentials (HTTP {})",
                response.status()
            ))
        }
        _ => Error::Connect(error.to_string()),
    }
}

/// Some deployments accept the upgrade and then close with a policy frame
/// when the key is invalid; treat that close as an auth failure too.
fn close_error(frame: Option<CloseFrame<'_>>) -> Error {
    match frame {
        Some(frame) => {
            let reason = frame.reason.to_string();
            if matches!(frame.code, CloseCode::Policy)
                || reason.to_lowercase().contains("api key")
            {
                Error::Auth(format!("service closed session: {reason}"))
            } else {
                Error::Connect(format!("service closed session: {reason}"))
            }
        }
        None => Error::Connect("service closed session without a reason".to_string()),
    }
}

/// Classify a close frame arriving mid-stream: a normal or going-away close
/// is the clean end of the chunk sequence, any other code failed it.
fn stream_end(frame: Option<CloseFrame<'_>>) -> Result<Option<Chunk>> {
    let Some(close) = frame else {
        return Ok(None);
    };
    if matches!(close.code, CloseCode::Normal | CloseCode::Away) {
        tracing::debug!(code = ?close.code, "stream closed cleanly");
        return Ok(None);
    }
    Err(close_error(Some(close)))
}

fn transport_error(error: tungstenite::Error) -> Error {
    Error::Connect(error.to_string())
}

// ── Session ───────────────────────────────────────────────────────────────

/// A live generation session over one WebSocket connection.
pub struct MusicSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl MusicSession {
    /// Open a connection, send the setup frame, and wait for the server ack.
    pub async fn connect(api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Auth("API key is empty".to_string()));
        }
        let url = session_url(api_key);
        let (ws, _response) = connect_async(url.as_str()).await.map_err(connect_error)?;

        let mut session = Self { ws };
        session
            .send_json(&SetupMessage {
                setup: Setup { model },
            })
            .await?;
        session.wait_setup_ack().await?;
        tracing::info!(model, "music session established");
        Ok(session)
    }

    /// Submit the weighted prompt the session will realize.
    pub async fn set_prompt(&mut self, text: &str, weight: f64) -> Result<()> {
        tracing::debug!(prompt = %text, weight, "setting prompt");
        self.send_json(&PromptMessage {
            client_content: ClientContent {
                weighted_prompts: vec![WeightedPrompt {
                    text: text.to_string(),
                    weight,
                }],
            },
        })
        .await
    }

    /// Tell the service to start streaming audio.
    pub async fn start(&mut self) -> Result<()> {
        self.send_json(&PlaybackMessage {
            playback_control: "PLAY",
        })
        .await
    }

    async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let frame = serde_json::to_string(message)?;
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(transport_error)
    }

    async fn wait_setup_ack(&mut self) -> Result<()> {
        tokio::time::timeout(SETUP_ACK_TIMEOUT, self.setup_ack_loop())
            .await
            .map_err(|_| Error::Connect("server did not acknowledge setup in time".to_string()))?
    }

    async fn setup_ack_loop(&mut self) -> Result<()> {
        while let Some(frame) = self.ws.next().await {
            match frame.map_err(transport_error)? {
                Message::Text(raw) => {
                    if matches!(parse_server_event(&raw)?, ServerEvent::SetupComplete) {
                        return Ok(());
                    }
                }
                Message::Close(frame) => return Err(close_error(frame)),
                _ => {}
            }
        }
        Err(Error::Connect(
            "connection closed before setup completed".to_string(),
        ))
    }
}

impl ChunkStream for MusicSession {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        while let Some(frame) = self.ws.next().await {
            match frame.map_err(transport_error)? {
                Message::Text(raw) => match parse_server_event(&raw)? {
                    ServerEvent::Chunk(chunk) => return Ok(Some(chunk)),
                    ServerEvent::SetupComplete | ServerEvent::Keepalive => {}
                },
                Message::Close(frame) => return stream_end(frame),
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        // The remote may already be gone; nothing useful to do about it.
        if let Err(error) = self.ws.close(None).await {
            tracing::debug!(%error, "session close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_setup_frame_shape() {
        let frame = serde_json::to_value(SetupMessage {
            setup: Setup {
                model: crate::config::MODEL_ID,
            },
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({"setup": {"model": "models/lyria-realtime-exp"}})
        );
    }

    #[test]
    fn test_prompt_frame_shape() {
        let frame = serde_json::to_value(PromptMessage {
            client_content: ClientContent {
                weighted_prompts: vec![WeightedPrompt {
                    text: "warm synthwave".to_string(),
                    weight: 1.0,
                }],
            },
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({
                "clientContent": {
                    "weightedPrompts": [{"text": "warm synthwave", "weight": 1.0}]
                }
            })
        );
    }

    #[test]
    fn test_playback_frame_shape() {
        let frame = serde_json::to_value(PlaybackMessage {
            playback_control: "PLAY",
        })
        .unwrap();
        assert_eq!(frame, json!({"playbackControl": "PLAY"}));
    }

    #[test]
    fn test_parse_audio_chunk() {
        let pcm: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04];
        let raw = json!({
            "serverContent": {"audioChunks": [{"data": BASE64.encode(&pcm)}]}
        })
        .to_string();
        match parse_server_event(&raw).unwrap() {
            ServerEvent::Chunk(Chunk::Audio(bytes)) => assert_eq!(bytes, pcm),
            _ => panic!("expected audio chunk"),
        }
    }

    #[test]
    fn test_parse_filtered_prompt() {
        let raw = json!({
            "filteredPrompt": {"text": "bad words", "filteredReason": "SAFETY"}
        })
        .to_string();
        match parse_server_event(&raw).unwrap() {
            ServerEvent::Chunk(Chunk::Filtered(reason)) => assert_eq!(reason, "SAFETY"),
            _ => panic!("expected filter notice"),
        }

        // Reason missing entirely still terminates the stream with a notice.
        let raw = json!({"filteredPrompt": {"text": "bad words"}}).to_string();
        match parse_server_event(&raw).unwrap() {
            ServerEvent::Chunk(Chunk::Filtered(reason)) => assert_eq!(reason, "no reason given"),
            _ => panic!("expected filter notice"),
        }
    }

    #[test]
    fn test_parse_setup_complete_and_keepalive() {
        assert!(matches!(
            parse_server_event(r#"{"setupComplete": {}}"#).unwrap(),
            ServerEvent::SetupComplete
        ));
        assert!(matches!(
            parse_server_event(r#"{"someFutureField": 1}"#).unwrap(),
            ServerEvent::Keepalive
        ));
    }

    #[test]
    fn test_parse_malformed_base64() {
        let raw = json!({
            "serverContent": {"audioChunks": [{"data": "@@not-base64@@"}]}
        })
        .to_string();
        assert!(matches!(
            parse_server_event(&raw),
            Err(Error::Connect(_))
        ));
    }

    #[test]
    fn test_http_status_maps_to_auth() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        assert!(matches!(
            connect_error(tungstenite::Error::Http(response)),
            Error::Auth(_)
        ));

        let response = tungstenite::http::Response::builder()
            .status(500)
            .body(None)
            .unwrap();
        assert!(matches!(
            connect_error(tungstenite::Error::Http(response)),
            Error::Connect(_)
        ));
    }

    #[test]
    fn test_close_frame_maps_policy_to_auth() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "API key not valid".into(),
        };
        assert!(matches!(close_error(Some(frame)), Error::Auth(_)));

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        };
        assert!(matches!(close_error(Some(frame)), Error::Connect(_)));
        assert!(matches!(close_error(None), Error::Connect(_)));
    }

    #[test]
    fn test_stream_end_close_codes() {
        assert!(matches!(stream_end(None), Ok(None)));

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        assert!(matches!(stream_end(Some(normal)), Ok(None)));

        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "shutting down".into(),
        };
        assert!(matches!(stream_end(Some(away)), Ok(None)));

        let error = CloseFrame {
            code: CloseCode::Error,
            reason: "internal error".into(),
        };
        assert!(matches!(stream_end(Some(error)), Err(Error::Connect(_))));

        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: "API key not valid".into(),
        };
        assert!(matches!(stream_end(Some(policy)), Err(Error::Auth(_))));
    }

    #[test]
    fn test_session_url_embeds_key() {
        let url = session_url("secret-key");
        assert!(url.starts_with("wss://generativelanguage.googleapis.com/"));
        assert!(url.contains("BidiGenerateMusic"));
        assert!(url.ends_with("?key=secret-key"));
    }

    #[tokio::test]
    async fn test_abnormal_close_fails_mid_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let chunk = json!({
                "serverContent": {"audioChunks": [{"data": BASE64.encode([1u8, 2, 3, 4])}]}
            });
            ws.send(Message::Text(chunk.to_string())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "internal error".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut session = MusicSession { ws };

        match session.next_chunk().await {
            Ok(Some(Chunk::Audio(bytes))) => assert_eq!(bytes, vec![1, 2, 3, 4]),
            other => panic!("expected the audio chunk first, got {other:?}"),
        }
        match session.next_chunk().await {
            Err(Error::Connect(reason)) => assert!(reason.contains("internal error")),
            other => panic!("expected the abnormal close to fail the stream, got {other:?}"),
        }

        drop(session);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_ack_wait_is_bounded() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Accept the upgrade but never acknowledge setup.
            while ws.next().await.is_some() {}
        });

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut session = MusicSession { ws };

        match session.wait_setup_ack().await {
            Err(Error::Connect(reason)) => assert!(reason.contains("acknowledge")),
            other => panic!("expected the setup wait to give up, got {other:?}"),
        }

        drop(session);
        server.await.unwrap();
    }
}
