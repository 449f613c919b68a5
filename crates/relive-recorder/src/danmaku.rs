//! Danmaku capture.
//!
//! Chat runs on its own transport so its failure never interrupts the
//! video capture. Events are appended as JSON lines to a sidecar file
//! next to the recording.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use relive_platform::{get_danmaku_info, ApiClient, AuthInfo};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{DanmakuOptions, DanmakuTransport};
use crate::error::{RecorderError, RecorderResult};

/// A typed event from the live room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DanmakuEvent {
    Chat {
        user: String,
        text: String,
    },
    Gift {
        user: String,
        gift: String,
        count: i64,
    },
    SuperChat {
        user: String,
        text: String,
        price: i64,
    },
    GuardJoin {
        user: String,
        level: i64,
    },
}

/// An event stamped with room and wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedEvent {
    pub room_id: i64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DanmakuEvent,
}

/// Connection seam for the actual transport implementation. The
/// recorder only consumes the resulting event stream.
pub trait DanmakuSource: Send + Sync {
    /// Attempt a connection over one concrete transport. Returns a
    /// receiver that closes when the transport drops.
    fn connect(
        &self,
        room_id: i64,
        transport: DanmakuTransport,
    ) -> RecorderResult<mpsc::Receiver<DanmakuEvent>>;
}

/// Concrete transports tried for a preference, in order. `Random`
/// shuffles the full candidate list instead of being its own protocol.
pub fn transport_order(preference: DanmakuTransport) -> Vec<DanmakuTransport> {
    match preference {
        DanmakuTransport::Random => {
            let mut order = vec![
                DanmakuTransport::Tcp,
                DanmakuTransport::SecureWs,
                DanmakuTransport::PlainWs,
            ];
            order.shuffle(&mut rand::thread_rng());
            order
        }
        explicit => vec![explicit],
    }
}

fn should_record(event: &DanmakuEvent, options: &DanmakuOptions) -> bool {
    match event {
        DanmakuEvent::Chat { .. } => true,
        DanmakuEvent::Gift { .. } => options.record_gifts,
        DanmakuEvent::SuperChat { .. } => options.record_super_chats,
        DanmakuEvent::GuardJoin { .. } => options.record_guard_joins,
    }
}

/// Sidecar path for a recording file.
pub fn sidecar_path(recording_path: &Path) -> PathBuf {
    recording_path.with_extension("danmaku.jsonl")
}

/// Record danmaku events to a sidecar file until the source closes or
/// every transport has failed.
pub async fn record_danmaku(
    source: &dyn DanmakuSource,
    room_id: i64,
    recording_path: &Path,
    options: &DanmakuOptions,
) -> RecorderResult<u64> {
    let path = sidecar_path(recording_path);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(crate::error::RecorderError::Disk)?;

    let mut written = 0u64;

    for transport in transport_order(options.transport) {
        let mut rx = match source.connect(room_id, transport) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(room_id, ?transport, error = %e, "danmaku transport failed, trying next");
                continue;
            }
        };
        debug!(room_id, ?transport, "danmaku session connected");

        while let Some(event) = rx.recv().await {
            if !should_record(&event, options) {
                continue;
            }
            let timed = TimedEvent {
                room_id,
                at: Utc::now(),
                event,
            };
            let mut line = serde_json::to_vec(&timed).unwrap_or_default();
            line.push(b'\n');
            file.write_all(&line)
                .await
                .map_err(crate::error::RecorderError::Disk)?;
            written += 1;
        }
        // Channel closed: session over, not an error
        break;
    }

    Ok(written)
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const OP_HEARTBEAT: u32 = 2;
const OP_NOTIFICATION: u32 = 5;
const OP_AUTH: u32 = 7;

/// Production source speaking the broadcast service's raw TCP framing.
/// Websocket transports are not implemented and fall through to the
/// next candidate in the transport order.
pub struct TcpDanmakuSource {
    client: ApiClient,
    auth: Option<AuthInfo>,
}

impl TcpDanmakuSource {
    pub fn new(client: ApiClient, auth: Option<AuthInfo>) -> Self {
        Self { client, auth }
    }
}

impl DanmakuSource for TcpDanmakuSource {
    fn connect(
        &self,
        room_id: i64,
        transport: DanmakuTransport,
    ) -> RecorderResult<mpsc::Receiver<DanmakuEvent>> {
        if transport != DanmakuTransport::Tcp {
            return Err(RecorderError::UnsupportedTransport);
        }

        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let auth = self.auth.clone();
        tokio::spawn(async move {
            let info = match get_danmaku_info(&client, room_id, auth.as_ref()).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(room_id, error = %e, "danmaku info lookup failed");
                    return;
                }
            };
            for host in &info.hosts {
                match pump_tcp(&host.host, host.port, room_id, &info.token, tx.clone()).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(room_id, host = %host.host, error = %e, "danmaku host failed, trying next");
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Frame layout: u32 total length, u16 header length (16), u16 version,
/// u32 opcode, u32 sequence, then the body.
fn encode_frame(op: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + body.len());
    frame.extend_from_slice(&((16 + body.len()) as u32).to_be_bytes());
    frame.extend_from_slice(&16u16.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&op.to_be_bytes());
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Authenticate against one host and feed notifications into the
/// channel until the peer closes or the receiver is dropped.
async fn pump_tcp(
    host: &str,
    port: u16,
    room_id: i64,
    token: &str,
    tx: mpsc::Sender<DanmakuEvent>,
) -> RecorderResult<()> {
    let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| RecorderError::Disconnected)?
        .map_err(|_| RecorderError::Disconnected)?;
    let (mut reader, mut writer) = stream.into_split();

    // Version 1 asks the server for uncompressed notification bodies
    let auth_body = serde_json::json!({
        "uid": 0,
        "roomid": room_id,
        "protover": 1,
        "platform": "web",
        "type": 2,
        "key": token,
    });
    writer
        .write_all(&encode_frame(OP_AUTH, auth_body.to_string().as_bytes()))
        .await
        .map_err(|_| RecorderError::Disconnected)?;

    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tick.tick().await;
            if writer.write_all(&encode_frame(OP_HEARTBEAT, b"")).await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut header = [0u8; 16];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let total = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let version = u16::from_be_bytes([header[6], header[7]]);
        let op = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        let mut body = vec![0u8; total.saturating_sub(16)];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }

        // Compressed bodies only appear at version >= 2, never requested here
        if op == OP_NOTIFICATION && version <= 1 {
            if let Some(event) = parse_notification(&body) {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }

    heartbeat.abort();
    Ok(())
}

/// Map one notification body onto a typed event. Unknown commands are
/// dropped.
fn parse_notification(body: &[u8]) -> Option<DanmakuEvent> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let cmd = value.get("cmd").and_then(serde_json::Value::as_str)?;

    // The command carries a version suffix on some rooms, e.g. DANMU_MSG:4:0:2:2:2:0
    if cmd.starts_with("DANMU_MSG") {
        let info = value.get("info")?;
        return Some(DanmakuEvent::Chat {
            user: info.get(2)?.get(1)?.as_str()?.to_string(),
            text: info.get(1)?.as_str()?.to_string(),
        });
    }

    let data = value.get("data");
    match cmd {
        "SEND_GIFT" => {
            let data = data?;
            Some(DanmakuEvent::Gift {
                user: data.get("uname")?.as_str()?.to_string(),
                gift: data.get("giftName")?.as_str()?.to_string(),
                count: data.get("num").and_then(serde_json::Value::as_i64).unwrap_or(1),
            })
        }
        "SUPER_CHAT_MESSAGE" => {
            let data = data?;
            Some(DanmakuEvent::SuperChat {
                user: data.pointer("/user_info/uname")?.as_str()?.to_string(),
                text: data.get("message")?.as_str()?.to_string(),
                price: data.get("price").and_then(serde_json::Value::as_i64).unwrap_or(0),
            })
        }
        "GUARD_BUY" => {
            let data = data?;
            Some(DanmakuEvent::GuardJoin {
                user: data.get("username")?.as_str()?.to_string(),
                level: data
                    .get("guard_level")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FakeSource;

    impl DanmakuSource for FakeSource {
        fn connect(
            &self,
            _room_id: i64,
            _transport: DanmakuTransport,
        ) -> RecorderResult<mpsc::Receiver<DanmakuEvent>> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx
                    .send(DanmakuEvent::Chat {
                        user: "a".to_string(),
                        text: "hello".to_string(),
                    })
                    .await;
                let _ = tx
                    .send(DanmakuEvent::Gift {
                        user: "b".to_string(),
                        gift: "flower".to_string(),
                        count: 3,
                    })
                    .await;
            });
            Ok(rx)
        }
    }

    #[test]
    fn test_explicit_transport_is_single() {
        assert_eq!(
            transport_order(DanmakuTransport::Tcp),
            vec![DanmakuTransport::Tcp]
        );
    }

    #[test]
    fn test_random_covers_all_transports() {
        let order = transport_order(DanmakuTransport::Random);
        assert_eq!(order.len(), 3);
        assert!(order.contains(&DanmakuTransport::Tcp));
        assert!(order.contains(&DanmakuTransport::SecureWs));
        assert!(order.contains(&DanmakuTransport::PlainWs));
    }

    #[test]
    fn test_encode_frame_header() {
        let frame = encode_frame(OP_AUTH, b"{}");
        assert_eq!(frame.len(), 18);
        assert_eq!(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]), 18);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 16);
        assert_eq!(u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]), OP_AUTH);
        assert_eq!(&frame[16..], b"{}");
    }

    #[test]
    fn test_parse_notification_chat() {
        let body = serde_json::json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [[], "hello there", [77, "alice"]]
        });
        let event = parse_notification(body.to_string().as_bytes()).unwrap();
        match event {
            DanmakuEvent::Chat { user, text } => {
                assert_eq!(user, "alice");
                assert_eq!(text, "hello there");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_notification_gift_and_guard() {
        let gift = serde_json::json!({
            "cmd": "SEND_GIFT",
            "data": {"uname": "bob", "giftName": "flower", "num": 3}
        });
        assert!(matches!(
            parse_notification(gift.to_string().as_bytes()),
            Some(DanmakuEvent::Gift { count: 3, .. })
        ));

        let guard = serde_json::json!({
            "cmd": "GUARD_BUY",
            "data": {"username": "carol", "guard_level": 2}
        });
        assert!(matches!(
            parse_notification(guard.to_string().as_bytes()),
            Some(DanmakuEvent::GuardJoin { level: 2, .. })
        ));
    }

    #[test]
    fn test_parse_notification_drops_unknown_commands() {
        let body = serde_json::json!({"cmd": "ONLINE_RANK_COUNT", "data": {"count": 9}});
        assert!(parse_notification(body.to_string().as_bytes()).is_none());
        assert!(parse_notification(b"not json").is_none());
    }

    #[tokio::test]
    async fn test_tcp_session_delivers_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Consume the auth frame
            let mut header = [0u8; 16];
            socket.read_exact(&mut header).await.unwrap();
            let total = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let mut body = vec![0u8; total - 16];
            socket.read_exact(&mut body).await.unwrap();
            let auth: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(auth["roomid"], 9025);

            socket
                .write_all(&encode_frame(8, br#"{"code":0}"#))
                .await
                .unwrap();
            let chat = serde_json::json!({
                "cmd": "DANMU_MSG",
                "info": [[], "hi", [1, "alice"]]
            });
            socket
                .write_all(&encode_frame(OP_NOTIFICATION, chat.to_string().as_bytes()))
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let session = tokio::spawn(async move {
            pump_tcp(&addr.ip().to_string(), addr.port(), 9025, "token", tx).await
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            DanmakuEvent::Chat { ref user, ref text } if user == "alice" && text == "hi"
        ));
        // The server task returns, closing the socket and ending the session
        session.await.unwrap().unwrap();
    }

    #[test]
    fn test_tcp_source_rejects_websocket_transports() {
        let client =
            ApiClient::new(relive_platform::ApiConfig::default()).unwrap();
        let source = TcpDanmakuSource::new(client, None);
        assert!(matches!(
            source.connect(1, DanmakuTransport::SecureWs),
            Err(RecorderError::UnsupportedTransport)
        ));
    }

    #[tokio::test]
    async fn test_gift_filtering() {
        let dir = tempdir().unwrap();
        let recording = dir.path().join("rec.flv");

        let options = DanmakuOptions {
            enabled: true,
            record_gifts: false,
            ..DanmakuOptions::default()
        };
        let written = record_danmaku(&FakeSource, 9025, &recording, &options)
            .await
            .unwrap();
        assert_eq!(written, 1);

        let content = std::fs::read_to_string(sidecar_path(&recording)).unwrap();
        assert!(content.contains("hello"));
        assert!(!content.contains("flower"));
    }
}
