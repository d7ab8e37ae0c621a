//! Line-oriented wire codec
//!
//! Two encodings live here: the colon-delimited UDP heartbeat datagram and
//! the newline-terminated TCP protocol lines (control lines plus tagged
//! `DATA_*` lines). Everything on the wire is ASCII; display names and
//! binary payloads travel base64-encoded so they can never collide with the
//! field delimiter.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Broad device class advertised in heartbeats and recorded per peer.
///
/// Unknown tokens are preserved rather than rejected so newer device classes
/// keep working against older builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    Phone,
    Pc,
    Tablet,
    Tv,
    Other(String),
}

impl DeviceType {
    pub fn as_token(&self) -> &str {
        match self {
            DeviceType::Phone => "PHONE",
            DeviceType::Pc => "PC",
            DeviceType::Tablet => "TABLET",
            DeviceType::Tv => "TV",
            DeviceType::Other(token) => token,
        }
    }

    pub fn from_token(token: &str) -> Self {
        match token {
            "PHONE" => DeviceType::Phone,
            "PC" => DeviceType::Pc,
            "TABLET" => DeviceType::Tablet,
            "TV" => DeviceType::Tv,
            other => DeviceType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

impl Serialize for DeviceType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_token())
    }
}

impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Ok(DeviceType::from_token(&s))
    }
}

/// One heartbeat datagram: `uuid:base64(name):tcpPort:<sign><battery>:deviceType`.
///
/// The charge field carries `+` for charging, `-` for discharging, followed
/// by the battery percentage, e.g. `+37` or `-82`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub uuid: Uuid,
    pub display_name: String,
    pub tcp_port: u16,
    pub battery_level: u8,
    pub charging: bool,
    pub device_type: DeviceType,
}

impl Heartbeat {
    pub fn encode(&self) -> String {
        let sign = if self.charging { '+' } else { '-' };
        format!(
            "{}:{}:{}:{}{}:{}",
            self.uuid,
            BASE64.encode(self.display_name.as_bytes()),
            self.tcp_port,
            sign,
            self.battery_level,
            self.device_type.as_token(),
        )
    }

    /// Parse a heartbeat datagram.
    ///
    /// Fewer than 5 fields is malformed; extra trailing fields are tolerated
    /// for forward compatibility. A malformed charge field degrades to
    /// (0%, not charging) instead of discarding the whole heartbeat.
    pub fn decode(datagram: &str) -> Result<Self> {
        let fields: Vec<&str> = datagram.trim_end().split(':').collect();
        if fields.len() < 5 {
            return Err(Error::Malformed(format!(
                "heartbeat has {} fields, expected 5",
                fields.len()
            )));
        }

        let uuid = fields[0]
            .parse::<Uuid>()
            .map_err(|_| Error::Malformed("heartbeat uuid".to_string()))?;

        let name_bytes = BASE64
            .decode(fields[1])
            .map_err(|_| Error::Malformed("heartbeat name encoding".to_string()))?;
        let display_name = String::from_utf8(name_bytes)
            .map_err(|_| Error::Malformed("heartbeat name utf-8".to_string()))?;

        let tcp_port = fields[2]
            .parse::<u16>()
            .map_err(|_| Error::Malformed("heartbeat port".to_string()))?;

        let (charging, battery_level) = parse_charge(fields[3]);
        let device_type = DeviceType::from_token(fields[4]);

        Ok(Self {
            uuid,
            display_name,
            tcp_port,
            battery_level,
            charging,
            device_type,
        })
    }
}

fn parse_charge(field: &str) -> (bool, u8) {
    let mut chars = field.chars();
    let charging = match chars.next() {
        Some('+') => true,
        Some('-') => false,
        _ => return (false, 0),
    };
    match chars.as_str().parse::<u8>() {
        Ok(level) if level <= 100 => (charging, level),
        _ => (false, 0),
    }
}

/// Header tag of a data line, identifying the sync protocol that should
/// receive the decrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataTag {
    Notification,
    SuperIsland,
    MediaPlay,
    IconRequest,
    IconResponse,
    AppListRequest,
    AppListResponse,
    MediaControl,
    Ftp,
    Clipboard,
    Status,
    /// A tag from a newer peer; carried for logging, dropped by the router.
    Unknown(String),
}

impl DataTag {
    pub fn as_header(&self) -> &str {
        match self {
            DataTag::Notification => "DATA_NOTIFICATION",
            DataTag::SuperIsland => "DATA_SUPERISLAND",
            DataTag::MediaPlay => "DATA_MEDIAPLAY",
            DataTag::IconRequest => "DATA_ICON_REQUEST",
            DataTag::IconResponse => "DATA_ICON_RESPONSE",
            DataTag::AppListRequest => "DATA_APP_LIST_REQUEST",
            DataTag::AppListResponse => "DATA_APP_LIST_RESPONSE",
            DataTag::MediaControl => "DATA_MEDIA_CONTROL",
            DataTag::Ftp => "DATA_FTP",
            DataTag::Clipboard => "DATA_CLIPBOARD",
            DataTag::Status => "DATA_STATUS",
            DataTag::Unknown(header) => header,
        }
    }

    /// Map a line header to its tag. Returns `None` when the header is not a
    /// data-channel header at all (control lines, handshake lines).
    pub fn from_header(header: &str) -> Option<DataTag> {
        match header {
            // Bare DATA is the legacy spelling of the notification channel.
            "DATA" | "DATA_NOTIFICATION" => Some(DataTag::Notification),
            "DATA_SUPERISLAND" => Some(DataTag::SuperIsland),
            "DATA_MEDIAPLAY" => Some(DataTag::MediaPlay),
            "DATA_ICON_REQUEST" => Some(DataTag::IconRequest),
            "DATA_ICON_RESPONSE" => Some(DataTag::IconResponse),
            "DATA_APP_LIST_REQUEST" => Some(DataTag::AppListRequest),
            "DATA_APP_LIST_RESPONSE" => Some(DataTag::AppListResponse),
            "DATA_MEDIA_CONTROL" => Some(DataTag::MediaControl),
            "DATA_FTP" => Some(DataTag::Ftp),
            "DATA_CLIPBOARD" => Some(DataTag::Clipboard),
            "DATA_STATUS" => Some(DataTag::Status),
            other if other.starts_with("DATA_") => Some(DataTag::Unknown(other.to_string())),
            _ => None,
        }
    }
}

/// A tagged, encrypted data line: `<HEADER>:<senderUuid>:<reserved>:<base64 payload>`.
///
/// The payload is the sealed ciphertext produced by the sender's shared
/// secret with us; the third field is reserved and written as `_`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLine {
    pub tag: DataTag,
    pub uuid: Uuid,
    pub payload: Vec<u8>,
}

impl DataLine {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:_:{}",
            self.tag.as_header(),
            self.uuid,
            BASE64.encode(&self.payload)
        )
    }

    fn decode(header: &str, rest: &str) -> Result<Self> {
        let tag = DataTag::from_header(header)
            .ok_or_else(|| Error::Malformed(format!("not a data header: {header}")))?;
        let mut fields = rest.splitn(3, ':');
        let uuid = fields
            .next()
            .and_then(|f| f.parse::<Uuid>().ok())
            .ok_or_else(|| Error::Malformed("data line uuid".to_string()))?;
        let _reserved = fields
            .next()
            .ok_or_else(|| Error::Malformed("data line reserved field".to_string()))?;
        let payload = fields
            .next()
            .and_then(|f| BASE64.decode(f).ok())
            .ok_or_else(|| Error::Malformed("data line payload".to_string()))?;
        Ok(Self { tag, uuid, payload })
    }
}

/// Introduction frame exchanged during first-time pairing.
///
/// `signature` is the sender's Ed25519 signature over its own
/// `uuid || exchange_key` bytes, binding the ephemeral X25519 key to the
/// claimed identity key.
#[derive(Debug, Clone)]
pub struct HelloFrame {
    pub uuid: Uuid,
    pub display_name: String,
    pub tcp_port: u16,
    pub device_type: DeviceType,
    pub exchange_key: [u8; 32],
    pub identity_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl HelloFrame {
    pub fn encode(&self, ack: bool) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            if ack { "HELLO_ACK" } else { "HELLO" },
            self.uuid,
            BASE64.encode(self.display_name.as_bytes()),
            self.tcp_port,
            self.device_type.as_token(),
            BASE64.encode(self.exchange_key),
            BASE64.encode(self.identity_key),
            BASE64.encode(&self.signature),
        )
    }

    fn decode(rest: &str) -> Result<Self> {
        let fields: Vec<&str> = rest.split(':').collect();
        if fields.len() < 7 {
            return Err(Error::Malformed("hello frame field count".to_string()));
        }
        let uuid = fields[0]
            .parse::<Uuid>()
            .map_err(|_| Error::Malformed("hello uuid".to_string()))?;
        let display_name = BASE64
            .decode(fields[1])
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or_else(|| Error::Malformed("hello name".to_string()))?;
        let tcp_port = fields[2]
            .parse::<u16>()
            .map_err(|_| Error::Malformed("hello port".to_string()))?;
        let device_type = DeviceType::from_token(fields[3]);
        let exchange_key = decode_key32(fields[4], "hello exchange key")?;
        let identity_key = decode_key32(fields[5], "hello identity key")?;
        let signature = BASE64
            .decode(fields[6])
            .map_err(|_| Error::Malformed("hello signature".to_string()))?;
        Ok(Self {
            uuid,
            display_name,
            tcp_port,
            device_type,
            exchange_key,
            identity_key,
            signature,
        })
    }
}

fn decode_key32(field: &str, what: &str) -> Result<[u8; 32]> {
    BASE64
        .decode(field)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| Error::Malformed(what.to_string()))
}

/// Every line a session can carry.
#[derive(Debug, Clone)]
pub enum Line {
    Hello(HelloFrame),
    HelloAck(HelloFrame),
    /// Re-authentication by possession of the stored shared secret; the
    /// proof is a sealed JSON body.
    Auth { uuid: Uuid, proof: Vec<u8> },
    AuthOk { uuid: Uuid, proof: Vec<u8> },
    /// Heartbeat over TCP, refreshes presence like a UDP heartbeat.
    Heartbeat { uuid: Uuid },
    Data(DataLine),
    /// Recognizably well-formed but unhandled header; ignored upstream.
    Other(String),
}

/// Parse one newline-stripped protocol line.
pub fn parse_line(line: &str) -> Result<Line> {
    let line = line.trim_end();
    let (header, rest) = line
        .split_once(':')
        .ok_or_else(|| Error::Malformed("line has no header".to_string()))?;

    if DataTag::from_header(header).is_some() {
        return Ok(Line::Data(DataLine::decode(header, rest)?));
    }

    match header {
        "HELLO" => Ok(Line::Hello(HelloFrame::decode(rest)?)),
        "HELLO_ACK" => Ok(Line::HelloAck(HelloFrame::decode(rest)?)),
        "AUTH" | "AUTH_OK" => {
            let mut fields = rest.splitn(3, ':');
            let uuid = fields
                .next()
                .and_then(|f| f.parse::<Uuid>().ok())
                .ok_or_else(|| Error::Malformed("auth uuid".to_string()))?;
            let _reserved = fields.next();
            let proof = fields
                .next()
                .and_then(|f| BASE64.decode(f).ok())
                .ok_or_else(|| Error::Malformed("auth proof".to_string()))?;
            if header == "AUTH" {
                Ok(Line::Auth { uuid, proof })
            } else {
                Ok(Line::AuthOk { uuid, proof })
            }
        }
        "HBT" => {
            let uuid = rest
                .parse::<Uuid>()
                .map_err(|_| Error::Malformed("heartbeat line uuid".to_string()))?;
            Ok(Line::Heartbeat { uuid })
        }
        other => Ok(Line::Other(other.to_string())),
    }
}

/// Encode an AUTH / AUTH_OK line.
pub fn encode_auth(uuid: Uuid, proof: &[u8], ok: bool) -> String {
    format!(
        "{}:{}:_:{}",
        if ok { "AUTH_OK" } else { "AUTH" },
        uuid,
        BASE64.encode(proof)
    )
}

/// Encode an HBT line.
pub fn encode_heartbeat_line(uuid: Uuid) -> String {
    format!("HBT:{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_heartbeat() -> Heartbeat {
        Heartbeat {
            uuid: Uuid::new_v4(),
            display_name: "Living Room PC".to_string(),
            tcp_port: 23335,
            battery_level: 82,
            charging: true,
            device_type: DeviceType::Pc,
        }
    }

    #[test]
    fn heartbeat_roundtrip() {
        let hb = sample_heartbeat();
        let decoded = Heartbeat::decode(&hb.encode()).unwrap();
        assert_eq!(decoded, hb);
    }

    #[test]
    fn heartbeat_name_survives_colons() {
        let mut hb = sample_heartbeat();
        hb.display_name = "my:weird:name".to_string();
        let decoded = Heartbeat::decode(&hb.encode()).unwrap();
        assert_eq!(decoded.display_name, "my:weird:name");
    }

    #[test]
    fn heartbeat_tolerates_extra_fields() {
        let hb = sample_heartbeat();
        let datagram = format!("{}:future:fields", hb.encode());
        let decoded = Heartbeat::decode(&datagram).unwrap();
        assert_eq!(decoded.uuid, hb.uuid);
        assert_eq!(decoded.device_type, DeviceType::Pc);
    }

    #[test]
    fn heartbeat_rejects_too_few_fields() {
        assert!(Heartbeat::decode("only:three:fields").is_err());
    }

    #[test]
    fn heartbeat_rejects_bad_uuid() {
        let datagram = format!("not-a-uuid:{}:23335:+50:PC", BASE64.encode("x"));
        assert!(Heartbeat::decode(&datagram).is_err());
    }

    #[test]
    fn malformed_charge_defaults_without_dropping() {
        let uuid = Uuid::new_v4();
        let datagram = format!("{}:{}:23335:garbage:PHONE", uuid, BASE64.encode("phone"));
        let decoded = Heartbeat::decode(&datagram).unwrap();
        assert_eq!(decoded.battery_level, 0);
        assert!(!decoded.charging);
        assert_eq!(decoded.uuid, uuid);
    }

    #[test]
    fn overrange_battery_defaults() {
        assert_eq!(parse_charge("+250"), (false, 0));
        assert_eq!(parse_charge("-37"), (false, 37));
        assert_eq!(parse_charge("+5"), (true, 5));
    }

    #[test]
    fn unknown_device_type_preserved() {
        let dt = DeviceType::from_token("WATCH");
        assert_eq!(dt, DeviceType::Other("WATCH".to_string()));
        assert_eq!(dt.as_token(), "WATCH");
    }

    #[test]
    fn data_line_roundtrip() {
        let line = DataLine {
            tag: DataTag::IconRequest,
            uuid: Uuid::new_v4(),
            payload: vec![0, 1, 2, 250, 255],
        };
        match parse_line(&line.encode()).unwrap() {
            Line::Data(decoded) => assert_eq!(decoded, line),
            other => panic!("expected data line, got {other:?}"),
        }
    }

    #[test]
    fn bare_data_header_is_notification() {
        let uuid = Uuid::new_v4();
        let raw = format!("DATA:{}:_:{}", uuid, BASE64.encode(b"payload"));
        match parse_line(&raw).unwrap() {
            Line::Data(dl) => assert_eq!(dl.tag, DataTag::Notification),
            other => panic!("expected data line, got {other:?}"),
        }
    }

    #[test]
    fn unknown_data_tag_is_carried() {
        let uuid = Uuid::new_v4();
        let raw = format!("DATA_FUTURE_FEATURE:{}:_:{}", uuid, BASE64.encode(b"x"));
        match parse_line(&raw).unwrap() {
            Line::Data(dl) => {
                assert_eq!(dl.tag, DataTag::Unknown("DATA_FUTURE_FEATURE".to_string()));
            }
            other => panic!("expected data line, got {other:?}"),
        }
    }

    #[test]
    fn hello_frame_roundtrip() {
        let frame = HelloFrame {
            uuid: Uuid::new_v4(),
            display_name: "Tablet".to_string(),
            tcp_port: 4242,
            device_type: DeviceType::Tablet,
            exchange_key: [7u8; 32],
            identity_key: [9u8; 32],
            signature: vec![1u8; 64],
        };
        match parse_line(&frame.encode(false)).unwrap() {
            Line::Hello(decoded) => {
                assert_eq!(decoded.uuid, frame.uuid);
                assert_eq!(decoded.display_name, "Tablet");
                assert_eq!(decoded.exchange_key, frame.exchange_key);
                assert_eq!(decoded.signature, frame.signature);
            }
            other => panic!("expected hello, got {other:?}"),
        }
        match parse_line(&frame.encode(true)).unwrap() {
            Line::HelloAck(_) => {}
            other => panic!("expected hello ack, got {other:?}"),
        }
    }

    #[test]
    fn auth_line_roundtrip() {
        let uuid = Uuid::new_v4();
        let raw = encode_auth(uuid, b"sealed-proof", false);
        match parse_line(&raw).unwrap() {
            Line::Auth { uuid: u, proof } => {
                assert_eq!(u, uuid);
                assert_eq!(proof, b"sealed-proof");
            }
            other => panic!("expected auth, got {other:?}"),
        }
    }

    #[test]
    fn hbt_line_roundtrip() {
        let uuid = Uuid::new_v4();
        match parse_line(&encode_heartbeat_line(uuid)).unwrap() {
            Line::Heartbeat { uuid: u } => assert_eq!(u, uuid),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn non_data_header_is_other() {
        match parse_line("DATAGRAM:whatever").unwrap() {
            Line::Other(header) => assert_eq!(header, "DATAGRAM"),
            other => panic!("expected other, got {other:?}"),
        }
    }
}
