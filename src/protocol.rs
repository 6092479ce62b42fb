//! Proxy to server wire protocol.
//!
//! Messages are JSON documents framed with a `ZBXD` header:
//! `"ZBXD"`, one flags byte, little-endian data length, reserved field.
//! With the large-packet flag both length fields are 8 bytes, otherwise 4.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkErrorKind, ProxyError, Result};

/// Protocol version reported in every request.
pub const PROTOCOL_VERSION: &str = "4.2.0";

pub const REQUEST_PROXY_DATA: &str = "proxy data";
pub const REQUEST_PROXY_HEARTBEAT: &str = "proxy heartbeat";
pub const RESPONSE_SUCCESS: &str = "success";
pub const RESPONSE_FAILED: &str = "failed";

const HEADER_SIGNATURE: &[u8; 4] = b"ZBXD";
const FLAG_PROTOCOL: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;
const FLAG_LARGE: u8 = 0x04;

/// Largest payload accepted from the peer.
pub const MAX_MESSAGE_SIZE: u64 = 128 * 1024 * 1024;

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// One history row as sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub itemid: u64,
    pub clock: i64,
    pub ns: i32,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logeventid: Option<i64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub state: i32,
}

/// Network discovery result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub id: i64,
    pub clock: i64,
    pub druleid: u64,
    pub dcheckid: u64,
    pub ip: String,
    pub dns: String,
    pub port: u16,
    pub value: String,
    pub status: i32,
}

/// Active agent autoregistration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRegistrationRecord {
    pub id: i64,
    pub clock: i64,
    pub host: String,
    pub ip: String,
    pub dns: String,
    pub port: u16,
    pub host_metadata: String,
}

/// Host availability as seen by the proxy. Last write wins at the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub hostid: u64,
    pub available: i32,
    pub error: String,
}

/// Remote task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum TaskType {
    RemoteCommand,
    RemoteCommandResult,
    CheckNow,
    DataExchange,
    DataExchangeResult,
}

impl From<TaskType> for i32 {
    fn from(t: TaskType) -> i32 {
        match t {
            TaskType::RemoteCommand => 2,
            TaskType::RemoteCommandResult => 3,
            TaskType::CheckNow => 6,
            TaskType::DataExchange => 7,
            TaskType::DataExchangeResult => 8,
        }
    }
}

impl TryFrom<i32> for TaskType {
    type Error = String;

    fn try_from(v: i32) -> std::result::Result<Self, Self::Error> {
        match v {
            2 => Ok(TaskType::RemoteCommand),
            3 => Ok(TaskType::RemoteCommandResult),
            6 => Ok(TaskType::CheckNow),
            7 => Ok(TaskType::DataExchange),
            8 => Ok(TaskType::DataExchangeResult),
            other => Err(format!("unknown task type {}", other)),
        }
    }
}

impl TaskType {
    /// Result type answering a request of this type, if any.
    pub fn result_type(self) -> Option<TaskType> {
        match self {
            TaskType::RemoteCommand => Some(TaskType::RemoteCommandResult),
            TaskType::DataExchange => Some(TaskType::DataExchangeResult),
            _ => None,
        }
    }
}

/// Remote task as exchanged with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub taskid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_taskid: Option<i64>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub clock: i64,
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub payload: String,
}

/// One `proxy data` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDataEnvelope {
    pub request: String,
    pub host: String,
    pub session: String,
    #[serde(
        rename = "host availability",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub availability: Vec<AvailabilityRecord>,
    #[serde(rename = "history data", default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryRecord>,
    #[serde(rename = "discovery data", default, skip_serializing_if = "Vec::is_empty")]
    pub discovery: Vec<DiscoveryRecord>,
    #[serde(
        rename = "auto registration",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub autoregistration: Vec<AutoRegistrationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<u8>,
    pub version: String,
    pub clock: i64,
    pub ns: i32,
}

impl ProxyDataEnvelope {
    /// Creates an empty envelope stamped with the current time.
    pub fn new(host: &str, session: &str) -> Self {
        let now = crate::history::Timespec::now();
        Self {
            request: REQUEST_PROXY_DATA.to_string(),
            host: host.to_string(),
            session: session.to_string(),
            availability: Vec::new(),
            history: Vec::new(),
            discovery: Vec::new(),
            autoregistration: Vec::new(),
            tasks: Vec::new(),
            more: None,
            version: PROTOCOL_VERSION.to_string(),
            clock: now.sec,
            ns: now.ns,
        }
    }

    pub fn has_more(&self) -> bool {
        self.more == Some(1)
    }

    pub fn set_more(&mut self, more: bool) {
        self.more = if more { Some(1) } else { None };
    }

    /// True if nothing but the header would be sent.
    pub fn is_empty(&self) -> bool {
        self.availability.is_empty()
            && self.history.is_empty()
            && self.discovery.is_empty()
            && self.autoregistration.is_empty()
            && self.tasks.is_empty()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Liveness message without data payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub request: String,
    pub host: String,
    pub version: String,
}

impl HeartbeatRequest {
    pub fn new(host: &str) -> Self {
        Self {
            request: REQUEST_PROXY_HEARTBEAT.to_string(),
            host: host.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Server reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRecord>,
}

impl ServerResponse {
    pub fn success() -> Self {
        Self {
            response: RESPONSE_SUCCESS.to_string(),
            info: None,
            version: Some(PROTOCOL_VERSION.to_string()),
            tasks: Vec::new(),
        }
    }

    pub fn failed(info: &str) -> Self {
        Self {
            response: RESPONSE_FAILED.to_string(),
            info: Some(info.to_string()),
            version: Some(PROTOCOL_VERSION.to_string()),
            tasks: Vec::new(),
        }
    }
}

/// Interprets a raw response payload.
///
/// `"success"` yields the response, `"failed"` becomes `NegativeAck` with the
/// server's `info`, anything else is a protocol error.
pub fn parse_response(payload: &[u8]) -> Result<ServerResponse> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ProxyError::Protocol("empty response".to_string()));
    }

    let doc: serde_json::Value = serde_json::from_slice(payload)?;
    if doc.get("response").and_then(|v| v.as_str()).is_none() {
        return Err(ProxyError::Protocol(
            "cannot find tag \"response\" in reply".to_string(),
        ));
    }

    let response: ServerResponse = serde_json::from_value(doc)?;
    match response.response.as_str() {
        RESPONSE_SUCCESS => Ok(response),
        RESPONSE_FAILED => Err(ProxyError::NegativeAck {
            info: response.info.unwrap_or_else(|| "no details".to_string()),
        }),
        other => Err(ProxyError::Protocol(format!(
            "unexpected response value \"{}\"",
            other
        ))),
    }
}

/// Encodes a payload with the protocol header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let large = len > u32::MAX as u64;
    let mut frame = Vec::with_capacity(payload.len() + 21);
    frame.extend_from_slice(HEADER_SIGNATURE);
    if large {
        frame.push(FLAG_PROTOCOL | FLAG_LARGE);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&0u64.to_le_bytes());
    } else {
        frame.push(FLAG_PROTOCOL);
        frame.extend_from_slice(&(len as u32).to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Writes one framed message.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message and returns its payload.
pub async fn read_frame<R>(reader: &mut R, max_size: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 5];
    reader.read_exact(&mut head).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProxyError::network(NetworkErrorKind::Reset, "connection closed by peer")
        } else {
            ProxyError::from(e)
        }
    })?;

    if &head[..4] != HEADER_SIGNATURE {
        return Err(ProxyError::Protocol("invalid message header".to_string()));
    }
    let flags = head[4];
    if flags & FLAG_PROTOCOL == 0 {
        return Err(ProxyError::Protocol(format!(
            "unsupported protocol flags 0x{:02x}",
            flags
        )));
    }
    if flags & FLAG_COMPRESSED != 0 {
        return Err(ProxyError::Protocol(
            "compressed messages are not supported".to_string(),
        ));
    }

    let len = if flags & FLAG_LARGE != 0 {
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).await?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[..8]);
        u64::from_le_bytes(len)
    } else {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[..4]);
        u32::from_le_bytes(len) as u64
    };

    if len > max_size {
        return Err(ProxyError::Protocol(format!(
            "message size {} exceeds limit {}",
            len, max_size
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> ProxyDataEnvelope {
        let mut env = ProxyDataEnvelope::new("proxy-1", "0123456789abcdef0123456789abcdef");
        env.history.push(HistoryRecord {
            id: 7,
            itemid: 10,
            clock: 1_700_000_000,
            ns: 5,
            value: "1.5".to_string(),
            timestamp: None,
            source: None,
            severity: None,
            logeventid: None,
            state: 0,
        });
        env.tasks.push(TaskRecord {
            taskid: 3,
            parent_taskid: Some(1),
            task_type: TaskType::RemoteCommandResult,
            clock: 1_700_000_001,
            ttl: 0,
            payload: "ok".to_string(),
        });
        env.set_more(true);
        env
    }

    #[test]
    fn test_envelope_json_tags() {
        let env = sample_envelope();
        let json: serde_json::Value = serde_json::from_slice(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["request"], "proxy data");
        assert_eq!(json["host"], "proxy-1");
        assert_eq!(json["more"], 1);
        assert_eq!(json["history data"][0]["id"], 7);
        assert_eq!(json["tasks"][0]["type"], 3);
        assert!(json.get("discovery data").is_none());
        assert!(json["history data"][0].get("state").is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = sample_envelope();
        let back: ProxyDataEnvelope = serde_json::from_slice(&env.to_json().unwrap()).unwrap();
        assert_eq!(back, env);
        assert!(back.has_more());
    }

    #[test]
    fn test_parse_response_variants() {
        let ok = parse_response(br#"{"response":"success","info":"processed"}"#).unwrap();
        assert_eq!(ok.info.as_deref(), Some("processed"));

        match parse_response(br#"{"response":"failed","info":"host not found"}"#) {
            Err(ProxyError::NegativeAck { info }) => assert_eq!(info, "host not found"),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(parse_response(b""), Err(ProxyError::Protocol(_))));
        assert!(matches!(parse_response(b"not json"), Err(ProxyError::Protocol(_))));
        assert!(matches!(
            parse_response(br#"{"info":"x"}"#),
            Err(ProxyError::Protocol(_))
        ));
        assert!(matches!(
            parse_response(br#"{"response":"maybe"}"#),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[test]
    fn test_response_with_tasks() {
        let raw = br#"{"response":"success","tasks":[{"taskid":9,"type":2,"clock":100,"ttl":3600,"payload":"uptime"}]}"#;
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.tasks.len(), 1);
        assert_eq!(resp.tasks[0].task_type, TaskType::RemoteCommand);
        assert_eq!(resp.tasks[0].parent_taskid, None);
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        let raw = br#"{"taskid":1,"type":99,"clock":0}"#;
        assert!(serde_json::from_slice::<TaskRecord>(raw).is_err());
    }

    #[test]
    fn test_frame_header_layout() {
        let frame = encode_frame(b"{}");
        assert_eq!(&frame[..4], b"ZBXD");
        assert_eq!(frame[4], 0x01);
        assert_eq!(&frame[5..9], &2u32.to_le_bytes());
        assert_eq!(&frame[9..13], &[0, 0, 0, 0]);
        assert_eq!(&frame[13..], b"{}");
    }

    #[tokio::test]
    async fn test_frame_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, br#"{"response":"success"}"#).await.unwrap();
        let payload = read_frame(&mut b, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(payload, br#"{"response":"success"}"#);
    }

    #[tokio::test]
    async fn test_frame_errors() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        assert!(matches!(
            read_frame(&mut b, MAX_MESSAGE_SIZE).await,
            Err(ProxyError::Protocol(_))
        ));

        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[b'x'; 64]).await.unwrap();
        assert!(matches!(read_frame(&mut b, 16).await, Err(ProxyError::Protocol(_))));

        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        assert!(matches!(
            read_frame(&mut b, MAX_MESSAGE_SIZE).await,
            Err(ProxyError::Network {
                kind: NetworkErrorKind::Reset,
                ..
            })
        ));
    }
}
