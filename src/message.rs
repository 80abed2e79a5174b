//! # Wire Protocol Messages
//!
//! This module defines the single message type exchanged between a relay and
//! its origins over the control connection, and its JSON wire representation.
//!
//! ## Wire Shape
//!
//! Every frame is one JSON object with fixed field names:
//!
//! ```json
//! {"Type":3,"RemoteAddr":"10.0.0.7:51824","LocalAddr":"203.0.113.9:8001","Data":"aGVsbG8K"}
//! ```
//!
//! - `Type` is a bare integer (`Relay=0, Stop=1, Connect=2, Data=3, Close=4`)
//! - `Data` is standard base64; `null` and a missing field both decode to empty
//! - Address fields are the text forms as seen by the relay; `RemoteAddr` is
//!   the demultiplexing key for everything after `Connect`
//!
//! Frames carry no length prefix; see [`crate::codec`] for the streaming
//! decoder that splits a byte stream back into messages.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Number of bytes of payload shown when a [`Message`] is formatted for logs.
const DISPLAY_PREVIEW_LEN: usize = 20;

/// The kind of a control-connection frame.
///
/// The relay sends `Relay` exactly once per origin as its first frame, then
/// any number of `Connect`/`Data`/`Close`. The origin sends any number of
/// `Data`/`Close`/`Stop`. No other direction/type pairs are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    /// First frame from the relay: payload is the UTF-8 public `host:port`
    /// that end-user clients can connect to.
    Relay = 0,
    /// Origin asks the relay to shut down this session.
    Stop = 1,
    /// Relay announces a new client connection; both address fields are set.
    Connect = 2,
    /// Byte payload for the client identified by `RemoteAddr`.
    Data = 3,
    /// One side of the client stream identified by `RemoteAddr` has closed.
    Close = 4,
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Relay),
            1 => Ok(MessageType::Stop),
            2 => Ok(MessageType::Connect),
            3 => Ok(MessageType::Data),
            4 => Ok(MessageType::Close),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Relay => "relay",
            MessageType::Stop => "stop",
            MessageType::Connect => "connect",
            MessageType::Data => "data",
            MessageType::Close => "close",
        };
        f.write_str(name)
    }
}

/// One control-connection frame.
///
/// Frames that concern a particular client carry the client's remote address
/// (and the public listener address) in text form; the remote address is the
/// key both sides use to route the frame to the right stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub kind: MessageType,
    #[serde(rename = "RemoteAddr", default)]
    pub remote_addr: String,
    #[serde(rename = "LocalAddr", default)]
    pub local_addr: String,
    #[serde(
        rename = "Data",
        default,
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub data: Vec<u8>,
}

impl Message {
    /// The advertisement frame: payload is the public address text.
    pub fn relay(public_addr: &str) -> Self {
        Message {
            kind: MessageType::Relay,
            remote_addr: String::new(),
            local_addr: String::new(),
            data: public_addr.as_bytes().to_vec(),
        }
    }

    /// A session-shutdown request from the origin.
    pub fn stop() -> Self {
        Message {
            kind: MessageType::Stop,
            remote_addr: String::new(),
            local_addr: String::new(),
            data: Vec::new(),
        }
    }

    /// A new-client announcement for the given address pair.
    pub fn connect(remote_addr: &str, local_addr: &str) -> Self {
        Message {
            kind: MessageType::Connect,
            remote_addr: remote_addr.to_string(),
            local_addr: local_addr.to_string(),
            data: Vec::new(),
        }
    }

    /// A payload frame for the client at `remote_addr`.
    pub fn data(remote_addr: &str, local_addr: &str, data: Vec<u8>) -> Self {
        Message {
            kind: MessageType::Data,
            remote_addr: remote_addr.to_string(),
            local_addr: local_addr.to_string(),
            data,
        }
    }

    /// A close notification for the client at `remote_addr`.
    pub fn close(remote_addr: &str, local_addr: &str) -> Self {
        Message {
            kind: MessageType::Close,
            remote_addr: remote_addr.to_string(),
            local_addr: local_addr.to_string(),
            data: Vec::new(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = String::from_utf8_lossy(&self.data);
        let preview: String = preview.chars().take(DISPLAY_PREVIEW_LEN).collect();
        write!(
            f,
            "[{} {} {} {}]",
            self.kind, self.remote_addr, self.local_addr, preview
        )
    }
}

fn serialize_base64<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&BASE64.encode(data))
}

fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // `Data` may be a base64 string, explicit null, or absent entirely.
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    match encoded {
        None => Ok(Vec::new()),
        Some(encoded) => BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_encoding_order() {
        assert_eq!(u8::from(MessageType::Relay), 0);
        assert_eq!(u8::from(MessageType::Stop), 1);
        assert_eq!(u8::from(MessageType::Connect), 2);
        assert_eq!(u8::from(MessageType::Data), 3);
        assert_eq!(u8::from(MessageType::Close), 4);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(MessageType::try_from(5).is_err());
        let err = serde_json::from_str::<Message>(r#"{"Type":9}"#);
        assert!(err.is_err());
    }

    #[test]
    fn wire_field_names() {
        let msg = Message::data("1.2.3.4:5", "6.7.8.9:10", b"hi".to_vec());
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"Type":3,"RemoteAddr":"1.2.3.4:5","LocalAddr":"6.7.8.9:10","Data":"aGk="}"#
        );
    }

    #[test]
    fn advertisement_payload_is_base64_of_address() {
        let msg = Message::relay("127.0.0.1:10000");
        let json = serde_json::to_string(&msg).unwrap();
        // base64("127.0.0.1:10000")
        assert!(json.contains(r#""Data":"MTI3LjAuMC4xOjEwMDAw""#));
        assert!(json.starts_with(r#"{"Type":0"#));
    }

    #[test]
    fn null_and_missing_data_decode_empty() {
        let msg: Message =
            serde_json::from_str(r#"{"Type":1,"RemoteAddr":"","LocalAddr":"","Data":null}"#)
                .unwrap();
        assert_eq!(msg.kind, MessageType::Stop);
        assert!(msg.data.is_empty());

        let msg: Message = serde_json::from_str(r#"{"Type":4,"RemoteAddr":"a:1"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Close);
        assert_eq!(msg.remote_addr, "a:1");
        assert!(msg.local_addr.is_empty());
        assert!(msg.data.is_empty());
    }

    #[test]
    fn payload_round_trip() {
        let msg = Message::data("c:1", "l:2", vec![0, 159, 146, 150, 255]);
        let json = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn display_truncates_payload() {
        let msg = Message::data("c:1", "l:2", b"0123456789012345678901234".to_vec());
        let text = format!("{msg}");
        assert_eq!(text, "[data c:1 l:2 01234567890123456789]");

        let stop = Message::stop();
        assert_eq!(format!("{stop}"), "[stop   ]");
    }
}
