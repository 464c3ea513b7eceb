use bytes::BufMut;
use rand::Rng;

/// RakNet offline message ID ("magic"), present in every offline packet.
pub const RAKNET_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// RakNet protocol version current Bedrock clients speak.
pub const RAKNET_PROTOCOL_VERSION: u8 = 11;

pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_UNCONNECTED_PONG: u8 = 0x1c;
pub const ID_OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const ID_INCOMPATIBLE_PROTOCOL: u8 = 0x19;

/// Game protocol version advertised in the pong.
const ADVERTISED_PROTOCOL: u32 = 729;

/// Game version name advertised in the pong.
const ADVERTISED_VERSION: &str = "1.21.80";

/// IPv6 port advertised in the pong, the Bedrock default.
const ADVERTISED_PORT_V6: u16 = 19133;

/// Shown when stripping formatting codes leaves an empty MOTD.
const FALLBACK_MOTD: &str = "Server hibernating";

/// Pick the random server GUID for one impersonator instance.
///
/// 63 bits so the value also fits the signed field in the pong.
pub fn random_server_guid() -> i64 {
    (rand::thread_rng().gen::<u64>() >> 1) as i64
}

/// Parse an Unconnected Ping, returning `(client_time, client_guid)`.
pub fn parse_unconnected_ping(data: &[u8]) -> Option<(u64, i64)> {
    if data.len() < 33 || data[0] != ID_UNCONNECTED_PING {
        return None;
    }
    if data[9..25] != RAKNET_MAGIC {
        return None;
    }
    let client_time = u64::from_be_bytes(data[1..9].try_into().unwrap());
    let client_guid = i64::from_be_bytes(data[25..33].try_into().unwrap());
    Some((client_time, client_guid))
}

/// Whether a datagram is an Open Connection Request 1.
pub fn is_open_connection_request_1(data: &[u8]) -> bool {
    data.len() >= 25 && data[0] == ID_OPEN_CONNECTION_REQUEST_1 && data[1..17] == RAKNET_MAGIC
}

/// Build an Unconnected Pong advertising the hibernating server.
///
/// The server name is the Bedrock semicolon tuple:
/// `MCPE;motd;protocol;version;online;max;guid;motd2;gamemode;gamemodenum;port4;port6`
pub fn build_unconnected_pong(
    client_time: u64,
    server_guid: i64,
    motd: &str,
    online_players: u32,
    max_players: u32,
    port_v4: u16,
) -> Vec<u8> {
    let motd = {
        let stripped = strip_formatting(motd);
        if stripped.is_empty() {
            FALLBACK_MOTD.to_string()
        } else {
            stripped
        }
    };

    let server_name = [
        "MCPE",
        &motd,
        &ADVERTISED_PROTOCOL.to_string(),
        ADVERTISED_VERSION,
        &online_players.to_string(),
        &max_players.to_string(),
        &server_guid.to_string(),
        &motd,
        "Survival",
        "1",
        &port_v4.to_string(),
        &ADVERTISED_PORT_V6.to_string(),
    ]
    .join(";");

    let mut buf = Vec::with_capacity(35 + server_name.len());
    buf.put_u8(ID_UNCONNECTED_PONG);
    buf.put_u64(client_time);
    buf.put_i64(server_guid);
    buf.put_slice(&RAKNET_MAGIC);
    buf.put_u16(server_name.len() as u16);
    buf.put_slice(server_name.as_bytes());
    buf
}

/// Build an Incompatible Protocol Version reply.
///
/// Rejects the connection attempt gracefully, the client shows
/// "unable to connect" while the real server boots.
pub fn build_incompatible_protocol(server_guid: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(26);
    buf.put_u8(ID_INCOMPATIBLE_PROTOCOL);
    buf.put_u8(RAKNET_PROTOCOL_VERSION);
    buf.put_slice(&RAKNET_MAGIC);
    buf.put_i64(server_guid);
    buf
}

/// Strip Minecraft `§x` formatting codes.
pub fn strip_formatting(motd: &str) -> String {
    let mut out = String::with_capacity(motd.len());
    let mut chars = motd.chars();
    while let Some(ch) = chars.next() {
        if ch == '§' {
            chars.next();
        } else {
            out.push(ch);
        }
    }
    out
}
