use bytes::{Buf, BytesMut};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted frame size. Larger frames are a protocol violation,
/// genuine handshake-phase packets are tiny.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Handshake packet ID in the handshake state.
pub const HANDSHAKE_PACKET_ID_HANDSHAKE: i32 = 0x00;

/// Status request/response packet ID in the status state.
pub const STATUS_PACKET_ID_STATUS: i32 = 0x00;

/// Ping/pong packet ID in the status state.
pub const STATUS_PACKET_ID_PING: i32 = 0x01;

/// Login start packet ID in the login state.
pub const LOGIN_PACKET_ID_LOGIN_START: i32 = 0x00;

/// Disconnect packet ID in the login state.
pub const LOGIN_PACKET_ID_DISCONNECT: i32 = 0x00;

/// Protocol decoding error.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A packet violated framing or field encoding.
    #[error("malformed packet")]
    Malformed,

    /// A frame exceeded the size cap.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Reading from the stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Client protocol state as requested by the handshake `next_state`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientState {
    Status,
    Login,
}

impl ClientState {
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Self::Status),
            2 => Some(Self::Login),
            _ => None,
        }
    }
}

/// Decode a VarInt: 7 data bits per byte, MSB continuation, 5 bytes max.
///
/// The 32-bit result keeps its sign, values are written unsigned.
pub fn get_varint(buf: &mut impl Buf) -> Result<i32, ProtoError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        if !buf.has_remaining() {
            return Err(ProtoError::Malformed);
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtoError::Malformed)
}

/// Encode a VarInt.
pub fn put_varint(value: i32, buf: &mut Vec<u8>) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

/// Decode a VarInt-length-prefixed UTF-8 string.
pub fn get_string(buf: &mut &[u8]) -> Result<String, ProtoError> {
    let len = get_varint(buf)?;
    if len < 0 || len as usize > buf.remaining() {
        return Err(ProtoError::Malformed);
    }
    let raw = buf[..len as usize].to_vec();
    buf.advance(len as usize);
    String::from_utf8(raw).map_err(|_| ProtoError::Malformed)
}

/// Encode a VarInt-length-prefixed UTF-8 string.
pub fn put_string(value: &str, buf: &mut Vec<u8>) {
    put_varint(value.len() as i32, buf);
    buf.extend_from_slice(value.as_bytes());
}

/// A length-framed packet: VarInt frame length, VarInt packet ID, body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawPacket {
    pub id: i32,
    pub data: Vec<u8>,
}

impl RawPacket {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Encode including the frame length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.data.len() + 5);
        put_varint(self.id, &mut body);
        body.extend_from_slice(&self.data);

        let mut frame = Vec::with_capacity(body.len() + 5);
        put_varint(body.len() as i32, &mut frame);
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode from a frame body (length prefix already removed).
    pub fn decode(mut frame: &[u8]) -> Result<Self, ProtoError> {
        let id = get_varint(&mut frame)?;
        Ok(Self {
            id,
            data: frame.to_vec(),
        })
    }
}

/// Try to take one complete frame out of the receive buffer.
///
/// `Ok(None)` means more bytes are needed.
fn try_take_frame(buf: &mut BytesMut) -> Result<Option<RawPacket>, ProtoError> {
    // Peek the frame length without consuming.
    let mut peek = &buf[..];
    let available = peek.len();
    let len = match get_varint(&mut peek) {
        Ok(len) => len,
        // Up to 4 continuation bytes may legitimately still be in flight.
        Err(_) if available < 5 => return Ok(None),
        Err(err) => return Err(err),
    };
    let prefix = available - peek.remaining();

    if len < 0 {
        return Err(ProtoError::Malformed);
    }
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(len));
    }
    if buf.len() < prefix + len {
        return Ok(None);
    }

    buf.advance(prefix);
    let frame = buf.split_to(len);
    RawPacket::decode(&frame).map(Some)
}

/// Read the next packet from the stream.
///
/// `Ok(None)` is a clean disconnect on a frame boundary.
pub async fn read_packet<R>(
    buf: &mut BytesMut,
    reader: &mut R,
) -> Result<Option<RawPacket>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(packet) = try_take_frame(buf)? {
            return Ok(Some(packet));
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            // EOF in the middle of a frame.
            return Err(ProtoError::Malformed);
        }
    }
}

/// Handshake packet, the first packet of every Java connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_addr: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtoError> {
        let protocol_version = get_varint(&mut data)?;
        let server_addr = get_string(&mut data)?;
        if data.remaining() < 2 {
            return Err(ProtoError::Malformed);
        }
        let server_port = data.get_u16();
        let next_state = get_varint(&mut data)?;
        Ok(Self {
            protocol_version,
            server_addr,
            server_port,
            next_state,
        })
    }
}

/// Login start packet. Trailing fields newer protocols append (UUID)
/// are ignored.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoginStart {
    pub name: String,
}

impl LoginStart {
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtoError> {
        let name = get_string(&mut data)?;
        Ok(Self { name })
    }
}

/// Build the status response advertising the hibernating server.
pub fn status_response(motd: &str, max_players: u32, favicon: &str) -> RawPacket {
    let mut status = json!({
        "version": {
            "name": "Hibernating",
            "protocol": -1,
        },
        "players": {
            "max": max_players,
            "online": 0,
            "sample": [],
        },
        "description": {
            "text": motd,
        },
    });
    if !favicon.is_empty() {
        status["favicon"] = json!(favicon);
    }

    let mut data = Vec::new();
    put_string(&status.to_string(), &mut data);
    RawPacket::new(STATUS_PACKET_ID_STATUS, data)
}

/// Build a login disconnect carrying the kick message as a chat component.
pub fn disconnect(reason: &str) -> RawPacket {
    let component = json!({ "text": reason });
    let mut data = Vec::new();
    put_string(&component.to_string(), &mut data);
    RawPacket::new(LOGIN_PACKET_ID_DISCONNECT, data)
}

/// Build a pong echoing the client ping payload.
pub fn pong(payload: &[u8]) -> RawPacket {
    RawPacket::new(STATUS_PACKET_ID_PING, payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(value, &mut buf);
        buf
    }

    #[test]
    fn varint_round_trip() {
        for value in [
            0,
            1,
            2,
            127,
            128,
            255,
            25565,
            2097151,
            2147483647,
            -1,
            -2147483648,
        ] {
            let encoded = encode_varint(value);
            let mut slice = &encoded[..];
            assert_eq!(get_varint(&mut slice).unwrap(), value, "value {value}");
            assert!(!slice.has_remaining());
        }
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(encode_varint(0), [0x00]);
        assert_eq!(encode_varint(127), [0x7f]);
        assert_eq!(encode_varint(128), [0x80, 0x01]);
        assert_eq!(encode_varint(255), [0xff, 0x01]);
        assert_eq!(encode_varint(-1), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn varint_rejects_six_bytes() {
        let mut slice: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(get_varint(&mut slice).is_err());
    }

    #[test]
    fn varint_rejects_truncated() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(get_varint(&mut slice).is_err());
    }

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        put_string("mc.example.org", &mut buf);
        let mut slice = &buf[..];
        assert_eq!(get_string(&mut slice).unwrap(), "mc.example.org");
    }

    #[test]
    fn string_rejects_oversized_length() {
        let mut buf = Vec::new();
        put_varint(100, &mut buf);
        buf.extend_from_slice(b"short");
        let mut slice = &buf[..];
        assert!(get_string(&mut slice).is_err());
    }

    #[test]
    fn raw_packet_round_trip() {
        let packet = RawPacket::new(0x01, vec![1, 2, 3, 4]);
        let encoded = packet.encode();

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = try_take_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_needs_more_bytes() {
        let packet = RawPacket::new(0x00, vec![0; 64]);
        let encoded = packet.encode();

        let mut buf = BytesMut::from(&encoded[..10]);
        assert!(try_take_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[10..]);
        assert_eq!(try_take_frame(&mut buf).unwrap().unwrap(), packet);
    }

    #[test]
    fn frame_size_cap() {
        let mut buf = BytesMut::new();
        let mut prefix = Vec::new();
        put_varint((MAX_FRAME_SIZE + 1) as i32, &mut prefix);
        buf.extend_from_slice(&prefix);
        assert!(matches!(
            try_take_frame(&mut buf),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn handshake_round_trip() {
        let mut data = Vec::new();
        put_varint(763, &mut data);
        put_string("mc.example.org", &mut data);
        data.extend_from_slice(&25565u16.to_be_bytes());
        put_varint(2, &mut data);

        let handshake = Handshake::decode(&data).unwrap();
        assert_eq!(handshake.protocol_version, 763);
        assert_eq!(handshake.server_addr, "mc.example.org");
        assert_eq!(handshake.server_port, 25565);
        assert_eq!(handshake.next_state, 2);
    }

    #[test]
    fn login_start_ignores_trailing_uuid() {
        let mut data = Vec::new();
        put_string("Alice", &mut data);
        data.extend_from_slice(&[0xaa; 16]);

        let login = LoginStart::decode(&data).unwrap();
        assert_eq!(login.name, "Alice");
    }

    #[test]
    fn status_response_payload() {
        let packet = status_response("Zzz... wake me", 42, "");
        assert_eq!(packet.id, STATUS_PACKET_ID_STATUS);

        let mut slice = &packet.data[..];
        let body: serde_json::Value =
            serde_json::from_str(&get_string(&mut slice).unwrap()).unwrap();
        assert_eq!(body["version"]["name"], "Hibernating");
        assert_eq!(body["version"]["protocol"], -1);
        assert_eq!(body["players"]["online"], 0);
        assert_eq!(body["players"]["max"], 42);
        assert_eq!(body["description"]["text"], "Zzz... wake me");
        assert!(body.get("favicon").is_none());
    }

    #[test]
    fn status_response_with_favicon() {
        let packet = status_response("m", 20, "data:image/png;base64,xyz");
        let mut slice = &packet.data[..];
        let body: serde_json::Value =
            serde_json::from_str(&get_string(&mut slice).unwrap()).unwrap();
        assert_eq!(body["favicon"], "data:image/png;base64,xyz");
    }

    #[test]
    fn disconnect_is_chat_component() {
        let packet = disconnect("Server is starting!");
        assert_eq!(packet.id, LOGIN_PACKET_ID_DISCONNECT);

        let mut slice = &packet.data[..];
        let body: serde_json::Value =
            serde_json::from_str(&get_string(&mut slice).unwrap()).unwrap();
        assert_eq!(body["text"], "Server is starting!");
    }

    #[test]
    fn pong_echoes_payload() {
        let payload = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let packet = pong(&payload);
        assert_eq!(packet.id, STATUS_PACKET_ID_PING);
        assert_eq!(packet.data, payload);
    }

    #[tokio::test]
    async fn read_packet_from_stream() {
        let expected = RawPacket::new(0x00, b"hello".to_vec());
        let encoded = expected.encode();

        let (client, mut server) = tokio::io::duplex(64);
        let mut client = client;
        tokio::io::AsyncWriteExt::write_all(&mut client, &encoded)
            .await
            .unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        let packet = read_packet(&mut buf, &mut server).await.unwrap().unwrap();
        assert_eq!(packet, expected);

        // Clean EOF after the frame boundary.
        assert!(read_packet(&mut buf, &mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_packet_truncated_frame_is_error() {
        let encoded = RawPacket::new(0x00, vec![0; 32]).encode();

        let (client, mut server) = tokio::io::duplex(64);
        let mut client = client;
        tokio::io::AsyncWriteExt::write_all(&mut client, &encoded[..8])
            .await
            .unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        assert!(read_packet(&mut buf, &mut server).await.is_err());
    }
}
