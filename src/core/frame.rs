//! Frame codec
//!
//! Every message on the transport is one JSON text frame tagged by `type`.
//! Stream payloads travel as standard base64 so arbitrary bytes (including
//! NUL and other control bytes) survive a text-only transport.
//!
//! ```text
//! {"type":"stdin"|"stdout"|"stderr","data":"<base64>","timestamp":"<RFC3339>"}
//! {"type":"exit","exit_code":<int, 0 if absent>,"timestamp":"<RFC3339>"}
//! {"type":"resize","cols":<int>,"rows":<int>}
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Which byte stream a data frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn tag(self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One decoded message unit
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw bytes for one of the three streams
    Data {
        stream: StreamKind,
        data: Vec<u8>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Local terminal size changed
    Resize(TermSize),
    /// Remote process finished
    Exit {
        code: i32,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Type tag this client does not understand; ignored by the dispatcher
    Unknown(String),
}

/// Wire envelope shared by all frame types
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

impl Frame {
    /// Stdin frame stamped with the current time
    pub fn stdin(data: impl Into<Vec<u8>>) -> Self {
        Frame::Data {
            stream: StreamKind::Stdin,
            data: data.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn resize(size: TermSize) -> Self {
        Frame::Resize(size)
    }

    /// Encode to wire text
    pub fn encode(&self) -> Result<String> {
        let wire = match self {
            Frame::Data {
                stream,
                data,
                timestamp,
            } => WireFrame {
                kind: stream.tag().to_string(),
                data: Some(STANDARD.encode(data)),
                timestamp: *timestamp,
                ..Default::default()
            },
            Frame::Resize(size) => {
                if size.cols == 0 || size.rows == 0 {
                    return Err(SessionError::Protocol(format!(
                        "resize to {}x{} is not allowed",
                        size.cols, size.rows
                    )));
                }
                WireFrame {
                    kind: "resize".to_string(),
                    cols: Some(size.cols),
                    rows: Some(size.rows),
                    ..Default::default()
                }
            }
            Frame::Exit { code, timestamp } => WireFrame {
                kind: "exit".to_string(),
                exit_code: Some(*code),
                timestamp: *timestamp,
                ..Default::default()
            },
            Frame::Unknown(kind) => {
                return Err(SessionError::Protocol(format!(
                    "cannot encode frame of unknown type {:?}",
                    kind
                )));
            }
        };

        serde_json::to_string(&wire).map_err(SessionError::MalformedFrame)
    }

    /// Decode one wire text message
    pub fn decode(text: &str) -> Result<Self> {
        let wire: WireFrame = serde_json::from_str(text).map_err(SessionError::MalformedFrame)?;

        let stream = match wire.kind.as_str() {
            "stdin" => StreamKind::Stdin,
            "stdout" => StreamKind::Stdout,
            "stderr" => StreamKind::Stderr,
            "resize" => {
                return match (wire.cols, wire.rows) {
                    (Some(cols), Some(rows)) if cols > 0 && rows > 0 => {
                        Ok(Frame::Resize(TermSize::new(cols, rows)))
                    }
                    _ => Err(SessionError::Protocol(
                        "resize frame needs positive cols and rows".to_string(),
                    )),
                };
            }
            "exit" => {
                // peers omit a zero exit_code
                return Ok(Frame::Exit {
                    code: wire.exit_code.unwrap_or(0),
                    timestamp: wire.timestamp,
                });
            }
            _ => return Ok(Frame::Unknown(wire.kind)),
        };

        let encoded = wire.data.ok_or_else(|| {
            SessionError::Protocol(format!("{} frame without data", stream.tag()))
        })?;
        let data = STANDARD
            .decode(encoded.as_bytes())
            .map_err(SessionError::InvalidPayload)?;

        Ok(Frame::Data {
            stream,
            data,
            timestamp: wire.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_stdout() {
        let frame = Frame::decode(r#"{"type":"stdout","data":"aGVsbG8K"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream: StreamKind::Stdout,
                data: b"hello\n".to_vec(),
                timestamp: None,
            }
        );
    }

    #[test]
    fn test_encode_stdin() {
        let text = Frame::stdin(b"ls -la\n".to_vec()).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "stdin");
        assert_eq!(value["data"], "bHMgLWxhCg==");
        // RFC3339 timestamp
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(value.get("exit_code").is_none());
    }

    #[test]
    fn test_encode_resize_has_no_payload() {
        let text = Frame::resize(TermSize::new(120, 40)).encode().unwrap();
        assert_eq!(text, r#"{"type":"resize","cols":120,"rows":40}"#);
    }

    #[test]
    fn test_resize_zero_rejected() {
        assert!(Frame::resize(TermSize::new(0, 24)).encode().is_err());
        let err = Frame::decode(r#"{"type":"resize","cols":80,"rows":0}"#).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_decode_exit() {
        let frame =
            Frame::decode(r#"{"type":"exit","exit_code":42,"timestamp":"2024-05-01T10:00:00Z"}"#)
                .unwrap();
        match frame {
            Frame::Exit { code, timestamp } => {
                assert_eq!(code, 42);
                assert!(timestamp.is_some());
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let frame = Frame::decode(r#"{"type":"exit","timestamp":"2024-05-01T10:00:00Z"}"#).unwrap();
        assert!(matches!(frame, Frame::Exit { code: 0, .. }));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let frame = Frame::decode(r#"{"type":"heartbeat","seq":7}"#).unwrap();
        assert_eq!(frame, Frame::Unknown("heartbeat".to_string()));
    }

    #[test]
    fn test_malformed_json() {
        let err = Frame::decode("{not json").unwrap_err();
        assert!(matches!(err, SessionError::MalformedFrame(_)));

        let err = Frame::decode(r#"{"data":"aGk="}"#).unwrap_err();
        assert!(matches!(err, SessionError::MalformedFrame(_)));
    }

    #[test]
    fn test_invalid_base64() {
        let err = Frame::decode(r#"{"type":"stderr","data":"!!not base64!!"}"#).unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload(_)));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_data_frame_without_payload() {
        let err = Frame::decode(r#"{"type":"stdout"}"#).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_control_bytes_survive() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let text = Frame::stdin(bytes.clone()).encode().unwrap();
        match Frame::decode(&text).unwrap() {
            Frame::Data { data, .. } => assert_eq!(data, bytes),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn payload_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let text = Frame::stdin(bytes.clone()).encode().unwrap();
            match Frame::decode(&text).unwrap() {
                Frame::Data { stream, data, .. } => {
                    prop_assert_eq!(stream, StreamKind::Stdin);
                    prop_assert_eq!(data, bytes);
                }
                other => prop_assert!(false, "unexpected frame {:?}", other),
            }
        }
    }
}
