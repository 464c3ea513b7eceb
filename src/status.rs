use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;

use crate::proto::{self, ClientState, Handshake, LoginStart, ProtoError, RawPacket};
use crate::proxy::WakeRequest;
use crate::server::Server;
use crate::state::State;

/// Timeout for the first packet of a connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for every subsequent read.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one client connection on a hibernating server's port.
///
/// Speaks just enough protocol to answer the server list ping and to
/// kick a joining player, signalling a wake-up for the latter. Timeouts
/// and disconnects are not errors, the client simply went away.
pub async fn serve(
    server: Arc<Server>,
    mut stream: TcpStream,
    peer: SocketAddr,
    wake_tx: mpsc::Sender<WakeRequest>,
) -> Result<(), ProtoError> {
    let (mut reader, mut writer) = stream.split();
    let mut buf = BytesMut::new();

    // The first packet must be a handshake.
    let packet = match read_timeout(&mut buf, &mut reader, HANDSHAKE_TIMEOUT).await? {
        Some(packet) if packet.id == proto::HANDSHAKE_PACKET_ID_HANDSHAKE => packet,
        _ => return Ok(()),
    };
    let handshake = Handshake::decode(&packet.data)?;

    match ClientState::from_id(handshake.next_state) {
        Some(ClientState::Status) => serve_status(&server, &mut buf, &mut reader, &mut writer).await,
        Some(ClientState::Login) => {
            serve_login(&server, &mut buf, &mut reader, &mut writer, peer, wake_tx).await
        }
        None => {
            debug!(
                target: "craftnap::status",
                "Client {} requested unknown protocol state ({}), disconnecting",
                peer,
                handshake.next_state
            );
            Ok(())
        }
    }
}

/// Answer the server list ping with the hibernation MOTD.
async fn serve_status(
    server: &Server,
    buf: &mut BytesMut,
    reader: &mut ReadHalf<'_>,
    writer: &mut WriteHalf<'_>,
) -> Result<(), ProtoError> {
    // Status request, empty body.
    match read_timeout(buf, reader, READ_TIMEOUT).await? {
        Some(packet) if packet.id == proto::STATUS_PACKET_ID_STATUS => {}
        _ => return Ok(()),
    }

    let motd = server.tuning().await.motd_hibernating;
    let (max_players, favicon) = {
        let state = server.state().lock().await;
        (state.last_max(), state.last_icon().to_string())
    };
    let response = proto::status_response(&motd, max_players, &favicon);
    writer.write_all(&response.encode()).await?;

    // Ping is optional, echo the payload back when it arrives.
    if let Some(packet) = read_timeout(buf, reader, READ_TIMEOUT).await? {
        if packet.id == proto::STATUS_PACKET_ID_PING && packet.data.len() == 8 {
            writer.write_all(&proto::pong(&packet.data).encode()).await?;
        }
    }

    Ok(())
}

/// Kick the joining player and trigger a wake-up.
async fn serve_login(
    server: &Server,
    buf: &mut BytesMut,
    reader: &mut ReadHalf<'_>,
    writer: &mut WriteHalf<'_>,
    peer: SocketAddr,
    wake_tx: mpsc::Sender<WakeRequest>,
) -> Result<(), ProtoError> {
    let packet = match read_timeout(buf, reader, READ_TIMEOUT).await? {
        Some(packet) if packet.id == proto::LOGIN_PACKET_ID_LOGIN_START => packet,
        _ => return Ok(()),
    };
    let login = LoginStart::decode(&packet.data)?;

    info!(
        target: "craftnap::status",
        "Wake-up trigger from player '{}' ({}) on port {} (server '{}')",
        login.name,
        peer.ip(),
        server.addr().port(),
        server.name()
    );

    let kick_message = server.tuning().await.kick_message;
    writer
        .write_all(&proto::disconnect(&kick_message).encode())
        .await?;

    // Close right away so the connection does not hold the port.
    let _ = writer.shutdown().await;

    let state = server.current_state().await;
    if matches!(state, State::Stopped | State::Crashed) {
        // try_send: if the queue is full a wake-up is already pending,
        // and blocking here would stall the listener drain.
        let _ = wake_tx.try_send(WakeRequest {
            server: server.name().to_string(),
            player: Some(login.name),
        });
    }

    Ok(())
}

/// Read one packet with a timeout. A timeout reads as a disconnect.
async fn read_timeout(
    buf: &mut BytesMut,
    reader: &mut ReadHalf<'_>,
    timeout: Duration,
) -> Result<Option<RawPacket>, ProtoError> {
    match time::timeout(timeout, proto::read_packet(buf, reader)).await {
        Ok(result) => result,
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{get_string, put_string, put_varint};
    use crate::server::tests::test_config;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn spawn_session(
        state: State,
    ) -> (
        TcpStream,
        mpsc::Receiver<WakeRequest>,
        tokio::task::JoinHandle<Result<(), ProtoError>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(Server::from_config("survival", &test_config(addr.port())));
        {
            let mut sm = server.state().lock().await;
            sm.update_stats_cache(0, 30, "1.21.4", "");
            sm.transition(state, Instant::now());
        }

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve(server, stream, peer, wake_tx).await
        });

        let client = TcpStream::connect(addr).await.unwrap();
        (client, wake_rx, handle)
    }

    fn handshake_frame(next_state: i32) -> Vec<u8> {
        let mut data = Vec::new();
        put_varint(763, &mut data);
        put_string("localhost", &mut data);
        data.extend_from_slice(&25565u16.to_be_bytes());
        put_varint(next_state, &mut data);
        RawPacket::new(proto::HANDSHAKE_PACKET_ID_HANDSHAKE, data).encode()
    }

    async fn read_frame(stream: &mut TcpStream) -> RawPacket {
        let mut buf = BytesMut::new();
        loop {
            let mut chunk = [0u8; 512];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a full frame arrived");
            buf.extend_from_slice(&chunk[..n]);

            let mut copy = buf.clone();
            let mut peek = &copy[..];
            if let Ok(len) = crate::proto::get_varint(&mut peek) {
                let prefix = copy.len() - peek.len();
                if copy.len() >= prefix + len as usize {
                    use bytes::Buf;
                    copy.advance(prefix);
                    let frame = copy.split_to(len as usize);
                    return RawPacket::decode(&frame).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn status_ping_returns_hibernation_motd_and_pong() {
        let (mut client, _wake_rx, handle) = spawn_session(State::Stopped).await;

        client.write_all(&handshake_frame(1)).await.unwrap();
        client
            .write_all(&RawPacket::new(proto::STATUS_PACKET_ID_STATUS, vec![]).encode())
            .await
            .unwrap();

        let response = read_frame(&mut client).await;
        assert_eq!(response.id, proto::STATUS_PACKET_ID_STATUS);
        let mut slice = &response.data[..];
        let body: serde_json::Value =
            serde_json::from_str(&get_string(&mut slice).unwrap()).unwrap();
        assert_eq!(body["description"]["text"], "Zzz");
        assert_eq!(body["players"]["online"], 0);
        assert_eq!(body["players"]["max"], 30);

        let payload = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        client
            .write_all(&RawPacket::new(proto::STATUS_PACKET_ID_PING, payload.to_vec()).encode())
            .await
            .unwrap();

        let pong = read_frame(&mut client).await;
        assert_eq!(pong.id, proto::STATUS_PACKET_ID_PING);
        assert_eq!(pong.data, payload);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn login_kicks_and_requests_wake() {
        let (mut client, mut wake_rx, handle) = spawn_session(State::Stopped).await;

        client.write_all(&handshake_frame(2)).await.unwrap();
        let mut login = Vec::new();
        put_string("Alice", &mut login);
        client
            .write_all(&RawPacket::new(proto::LOGIN_PACKET_ID_LOGIN_START, login).encode())
            .await
            .unwrap();

        let kick = read_frame(&mut client).await;
        assert_eq!(kick.id, proto::LOGIN_PACKET_ID_DISCONNECT);
        let mut slice = &kick.data[..];
        let body: serde_json::Value =
            serde_json::from_str(&get_string(&mut slice).unwrap()).unwrap();
        assert_eq!(body["text"], "Starting!");

        let wake = wake_rx.recv().await.unwrap();
        assert_eq!(wake.server, "survival");
        assert_eq!(wake.player.as_deref(), Some("Alice"));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn login_without_wake_when_not_hibernating() {
        let (mut client, mut wake_rx, handle) = spawn_session(State::Idle).await;

        client.write_all(&handshake_frame(2)).await.unwrap();
        let mut login = Vec::new();
        put_string("Bob", &mut login);
        client
            .write_all(&RawPacket::new(proto::LOGIN_PACKET_ID_LOGIN_START, login).encode())
            .await
            .unwrap();

        let kick = read_frame(&mut client).await;
        assert_eq!(kick.id, proto::LOGIN_PACKET_ID_DISCONNECT);

        handle.await.unwrap().unwrap();
        assert!(wake_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_handshake_closes_silently() {
        let (mut client, _wake_rx, handle) = spawn_session(State::Stopped).await;

        // Valid frame, bogus handshake body.
        client
            .write_all(&RawPacket::new(proto::HANDSHAKE_PACKET_ID_HANDSHAKE, vec![0x80]).encode())
            .await
            .unwrap();
        drop(client);

        assert!(handle.await.unwrap().is_err());
    }
}
