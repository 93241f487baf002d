use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};

use super::actor::{RelayCommand, RelayHandle, relay_actor};
use super::messages::{ErrorNotice, MISSING_PARAMS_REASON};
use super::types::{Outbound, Role, RoomId};

pub const DEFAULT_RELAY_PORT: u16 = 9999;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RelayServer {
    listener: TcpListener,
    handle: RelayHandle,
}

impl RelayServer {
    /// Bind the listener and start the room actor
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let (tx, rx) = mpsc::channel::<RelayCommand>(1024);
        tokio::spawn(relay_actor(rx));

        info!("Relay server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handle: RelayHandle { tx },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let handle = self.handle.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Connection parameters extracted from the handshake request's query string
#[derive(Debug, Default, PartialEq)]
struct ConnectParams {
    room: Option<String>,
    client_type: Option<String>,
}

fn parse_query(query: &str) -> ConnectParams {
    let mut params = ConnectParams::default();
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match percent_decode(key).as_str() {
            "room" => params.room = Some(percent_decode(value)),
            "type" => params.client_type = Some(percent_decode(value)),
            _ => {}
        }
    }
    params
}

/// application/x-www-form-urlencoded decoding: `+` is space, `%XX` is a byte.
/// Malformed escapes pass through verbatim.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|v| v as u8)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RelayHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut query: Option<String> = None;
    let callback = |req: &Request, resp: Response| {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };
    let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    info!("WebSocket connection from {}", addr);

    let params = parse_query(query.as_deref().unwrap_or(""));

    // Both parameters are required; reject before any room state is touched.
    let (room, raw_type) = match (params.room, params.client_type) {
        (Some(room), Some(t)) if !room.is_empty() && !t.is_empty() => (RoomId::from(room), t),
        _ => {
            info!("Rejecting {}: missing room or client type", addr);
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: Utf8Bytes::from(MISSING_PARAMS_REASON),
            };
            ws_stream.close(Some(frame)).await?;
            return Ok(());
        }
    };

    let Some(role) = Role::parse(&raw_type) else {
        info!("Rejecting {}: invalid client type {:?}", addr, raw_type);
        let notice = ErrorNotice::invalid_client_type();
        ws_stream.send(Message::Text(notice.to_json().into())).await?;
        ws_stream.close(None).await?;
        return Ok(());
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let conn_id = match handle.join(room.clone(), role, tx).await {
        Ok(id) => id,
        Err(e) => {
            info!("Rejecting {} from room {}: {}", addr, room, e);
            let notice = ErrorNotice::from(&e);
            ws_stream.send(Message::Text(notice.to_json().into())).await?;
            ws_stream.close(None).await?;
            return Ok(());
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    // First keepalive fires one full interval after admission, not at once.
    let mut ping_interval =
        tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if ws_tx.send(msg.into_inner()).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        // Transport errors are observed only; the close path
                        // below performs the teardown.
                        warn!("WebSocket error in room {}: {}", room, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    frame @ (Message::Text(_) | Message::Binary(_)) => {
                        handle
                            .forward(room.clone(), conn_id, role, Outbound::from(frame))
                            .await;
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    handle.leave(room, conn_id, role).await;

    send_task.abort();
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use super::*;

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);
    // Joins land on the actor shortly after the client handshake completes;
    // a small grace period keeps admission ordering deterministic.
    const SETTLE: Duration = Duration::from_millis(100);

    async fn start_server() -> SocketAddr {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn connect(addr: SocketAddr, query: &str) -> WsClient {
        let url = format!("ws://{}/?{}", addr, query);
        let (ws, _) = connect_async(url).await.unwrap();
        tokio::time::sleep(SETTLE).await;
        ws
    }

    async fn recv_text(ws: &mut WsClient) -> String {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("transport error");
            match frame {
                Message::Text(t) => return t.to_string(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    async fn recv_close(ws: &mut WsClient) -> Option<CloseFrame> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let frame = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("timed out waiting for close")
                .expect("stream ended")
                .expect("transport error");
            match frame {
                Message::Close(frame) => return frame,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected close frame, got {:?}", other),
            }
        }
    }

    #[test]
    fn parse_query_extracts_room_and_type() {
        let params = parse_query("room=math101&type=teacher");
        assert_eq!(params.room.as_deref(), Some("math101"));
        assert_eq!(params.client_type.as_deref(), Some("teacher"));
    }

    #[test]
    fn parse_query_decodes_escapes() {
        let params = parse_query("room=year%205%2Fblue&type=student");
        assert_eq!(params.room.as_deref(), Some("year 5/blue"));
    }

    #[test]
    fn parse_query_plus_is_space() {
        let params = parse_query("room=open+lab&type=student");
        assert_eq!(params.room.as_deref(), Some("open lab"));
    }

    #[test]
    fn parse_query_ignores_unknown_keys() {
        let params = parse_query("token=abc&room=r&type=t&x");
        assert_eq!(params.room.as_deref(), Some("r"));
        assert_eq!(params.client_type.as_deref(), Some("t"));
    }

    #[test]
    fn parse_query_empty() {
        assert_eq!(parse_query(""), ConnectParams::default());
    }

    #[test]
    fn percent_decode_malformed_escape_passes_through() {
        assert_eq!(percent_decode("50%"), "50%");
        assert_eq!(percent_decode("a%zzb"), "a%zzb");
    }

    #[tokio::test]
    async fn classroom_relay_end_to_end() {
        let addr = start_server().await;

        let mut teacher = connect(addr, "room=A&type=teacher").await;
        let mut s1 = connect(addr, "room=A&type=student").await;
        let mut s2 = connect(addr, "room=A&type=student").await;

        teacher.send(Message::Text("hello".into())).await.unwrap();
        assert_eq!(recv_text(&mut s1).await, "hello");
        assert_eq!(recv_text(&mut s2).await, "hello");

        s1.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(recv_text(&mut teacher).await, "hi");

        s1.close(None).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        teacher.send(Message::Text("still there?".into())).await.unwrap();
        assert_eq!(recv_text(&mut s2).await, "still there?");
    }

    #[tokio::test]
    async fn second_teacher_is_rejected_and_first_unaffected() {
        let addr = start_server().await;

        let mut first = connect(addr, "room=B&type=teacher").await;
        let mut second = connect(addr, "room=B&type=teacher").await;

        assert_eq!(
            recv_text(&mut second).await,
            r#"{"error":"Teacher is already connected in this room."}"#
        );
        recv_close(&mut second).await;

        let mut student = connect(addr, "room=B&type=student").await;
        student.send(Message::Text("question".into())).await.unwrap();
        assert_eq!(recv_text(&mut first).await, "question");
    }

    #[tokio::test]
    async fn missing_parameters_closed_with_policy_violation() {
        let addr = start_server().await;

        let mut ws = connect(addr, "room=A").await;
        let frame = recv_close(&mut ws).await.expect("close frame with reason");
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(frame.reason.as_str(), MISSING_PARAMS_REASON);
    }

    #[tokio::test]
    async fn empty_parameter_values_closed_with_policy_violation() {
        let addr = start_server().await;

        let mut ws = connect(addr, "room=&type=teacher").await;
        let frame = recv_close(&mut ws).await.expect("close frame with reason");
        assert_eq!(frame.code, CloseCode::Policy);
    }

    #[tokio::test]
    async fn invalid_client_type_gets_error_payload() {
        let addr = start_server().await;

        let mut ws = connect(addr, "room=A&type=observer").await;
        assert_eq!(
            recv_text(&mut ws).await,
            r#"{"error":"Invalid client type. Use ?type=teacher or ?type=student."}"#
        );
        recv_close(&mut ws).await;
    }

    #[tokio::test]
    async fn teacher_can_rejoin_after_disconnect() {
        let addr = start_server().await;

        let first = connect(addr, "room=C&type=teacher").await;
        drop(first);
        tokio::time::sleep(SETTLE).await;

        let mut second = connect(addr, "room=C&type=teacher").await;
        let mut student = connect(addr, "room=C&type=student").await;

        second.send(Message::Text("round two".into())).await.unwrap();
        assert_eq!(recv_text(&mut student).await, "round two");
    }

    #[tokio::test]
    async fn student_message_without_teacher_is_dropped() {
        let addr = start_server().await;

        let mut s1 = connect(addr, "room=D&type=student").await;
        let mut s2 = connect(addr, "room=D&type=student").await;

        s1.send(Message::Text("echo?".into())).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        // No teacher and no peer echo: s2 sees nothing, and both stay open.
        s2.send(Message::Text("ping".into())).await.unwrap();
        tokio::time::sleep(SETTLE).await;
        let pending = tokio::time::timeout(Duration::from_millis(200), s2.next()).await;
        assert!(pending.is_err(), "student received an unexpected frame");
    }

    #[tokio::test]
    async fn binary_frames_relayed_verbatim() {
        let addr = start_server().await;

        let mut teacher = connect(addr, "room=E&type=teacher").await;
        let mut student = connect(addr, "room=E&type=student").await;

        let payload = Bytes::from_static(&[0x00, 0xFF, 0x10, 0x7F]);
        teacher.send(Message::Binary(payload.clone())).await.unwrap();

        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        let frame = tokio::time::timeout_at(deadline, student.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("transport error");
        match frame {
            Message::Binary(received) => assert_eq!(received, payload),
            other => panic!("expected binary frame, got {:?}", other),
        }
    }
}
