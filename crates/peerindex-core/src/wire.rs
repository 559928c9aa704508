//! peerindex wire format — both planes.
//!
//! Control plane: one whitespace-delimited text line per UDP datagram.
//!
//!   R <peerId> <name>      register; sender follows with a bulk upload
//!   Q <peerId> <name>      deregister
//!   S <name>               search
//!   L <peerId>             list
//!   D <name>               download; sender follows with a bulk download
//!
//! Bulk plane: a TCP stream that opens with a length-prefixed JSON frame
//! (4 bytes big-endian length, then the body) identifying the transfer,
//! answered by a status frame, followed by raw payload bytes.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IndexError;

/// Hard cap on a peer id or content name, in bytes. Longer fields are
/// rejected, never truncated.
pub const MAX_FIELD_LEN: usize = 255;

/// Largest control datagram accepted.
pub const MAX_REQUEST_LEN: usize = 1024;

/// Largest UDP payload a reply may occupy.
pub const MAX_REPLY_LEN: usize = 65_507;

/// Largest bulk-plane frame body.
pub const MAX_FRAME_LEN: usize = 4096;

const LEN_SIZE: usize = 4;

// ── Control requests ──────────────────────────────────────────────────────────

/// A parsed control-plane command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { peer_id: String, name: String },
    Deregister { peer_id: String, name: String },
    Search { name: String },
    List { peer_id: String },
    Download { name: String },
}

impl Request {
    /// Parse one datagram. Anything malformed is `BadRequest`.
    pub fn parse(datagram: &[u8]) -> Result<Self, IndexError> {
        if datagram.len() > MAX_REQUEST_LEN {
            return Err(IndexError::BadRequest(format!(
                "message of {} bytes exceeds {} byte limit",
                datagram.len(),
                MAX_REQUEST_LEN
            )));
        }
        let text = std::str::from_utf8(datagram)
            .map_err(|_| IndexError::BadRequest("message is not valid UTF-8".into()))?;

        let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
        let (command, fields) = match tokens.split_first() {
            Some((c, f)) => (*c, f),
            None => return Err(IndexError::BadRequest("empty message".into())),
        };

        for field in fields {
            check_field(field)?;
        }

        let request = match (command, fields) {
            ("R", [peer_id, name]) => Request::Register {
                peer_id: peer_id.to_string(),
                name: name.to_string(),
            },
            ("Q", [peer_id, name]) => Request::Deregister {
                peer_id: peer_id.to_string(),
                name: name.to_string(),
            },
            ("S", [name]) => Request::Search {
                name: name.to_string(),
            },
            ("L", [peer_id]) => Request::List {
                peer_id: peer_id.to_string(),
            },
            ("D", [name]) => Request::Download {
                name: name.to_string(),
            },
            ("R" | "Q" | "S" | "L" | "D", _) => {
                return Err(IndexError::BadRequest(format!(
                    "wrong number of fields for '{}' ({} given)",
                    command,
                    fields.len()
                )))
            }
            _ => {
                return Err(IndexError::BadRequest(format!(
                    "unknown command '{}'",
                    truncate_for_log(command)
                )))
            }
        };
        Ok(request)
    }

    /// Render as a control datagram.
    pub fn encode(&self) -> String {
        match self {
            Request::Register { peer_id, name } => format!("R {} {}", peer_id, name),
            Request::Deregister { peer_id, name } => format!("Q {} {}", peer_id, name),
            Request::Search { name } => format!("S {}", name),
            Request::List { peer_id } => format!("L {}", peer_id),
            Request::Download { name } => format!("D {}", name),
        }
    }

    /// Command letter, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Request::Register { .. } => "R",
            Request::Deregister { .. } => "Q",
            Request::Search { .. } => "S",
            Request::List { .. } => "L",
            Request::Download { .. } => "D",
        }
    }
}

/// Validate a peer id or content name.
pub fn check_field(field: &str) -> Result<(), IndexError> {
    if field.is_empty() {
        return Err(IndexError::BadRequest("empty field".into()));
    }
    if field.len() > MAX_FIELD_LEN {
        return Err(IndexError::BadRequest(format!(
            "field of {} bytes exceeds {} byte limit",
            field.len(),
            MAX_FIELD_LEN
        )));
    }
    if field.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IndexError::BadRequest(
            "field contains whitespace or control characters".into(),
        ));
    }
    Ok(())
}

fn truncate_for_log(s: &str) -> &str {
    match s.char_indices().nth(16) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ── Control replies ───────────────────────────────────────────────────────────

/// One control-plane reply. Exactly one is sent per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Register accepted; the record is pending until an upload arrives on
    /// `bulk_port`.
    Ready { name: String, bulk_port: u16 },
    /// Deregistered.
    Removed { name: String },
    /// Search hit: the owning peer's last known address.
    Found {
        name: String,
        addr: SocketAddr,
        owner: String,
    },
    /// Download hit: open a bulk DOWNLOAD naming `owner` on `bulk_port`.
    Download {
        name: String,
        addr: SocketAddr,
        owner: String,
        size_bytes: u64,
        bulk_port: u16,
    },
    /// Available content of one peer, in registration order.
    Listing { peer_id: String, names: Vec<String> },
    Error { code: String, message: String },
}

impl From<IndexError> for Reply {
    fn from(e: IndexError) -> Self {
        Reply::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Ready { name, bulk_port } => format!("READY {} {}", name, bulk_port),
            Reply::Removed { name } => format!("OK {}", name),
            Reply::Found { name, addr, owner } => format!("FOUND {} {} {}", name, addr, owner),
            Reply::Download {
                name,
                addr,
                owner,
                size_bytes,
                bulk_port,
            } => format!(
                "FOUND {} {} {} {} {}",
                name, addr, owner, size_bytes, bulk_port
            ),
            Reply::Listing { peer_id, names } => {
                let mut out = format!("LIST {} {}", peer_id, names.len());
                for name in names {
                    out.push('\n');
                    out.push_str(name);
                }
                out
            }
            Reply::Error { code, message } => format!("ERROR {} {}", code, message),
        }
    }

    /// Parse a reply datagram (client side).
    pub fn parse(datagram: &[u8]) -> Result<Self, IndexError> {
        let text = std::str::from_utf8(datagram)
            .map_err(|_| malformed("reply is not valid UTF-8"))?;
        let mut lines = text.lines();
        let head = lines.next().ok_or_else(|| malformed("empty reply"))?;

        if let Some(rest) = head.strip_prefix("ERROR ") {
            let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
            return Ok(Reply::Error {
                code: code.to_string(),
                message: message.to_string(),
            });
        }

        let tokens: Vec<&str> = head.split_ascii_whitespace().collect();
        let reply = match tokens.as_slice() {
            ["READY", name, port] => Reply::Ready {
                name: name.to_string(),
                bulk_port: parse_num(port)?,
            },
            ["OK", name] => Reply::Removed {
                name: name.to_string(),
            },
            ["FOUND", name, addr, owner] => Reply::Found {
                name: name.to_string(),
                addr: parse_addr(addr)?,
                owner: owner.to_string(),
            },
            ["FOUND", name, addr, owner, size, port] => Reply::Download {
                name: name.to_string(),
                addr: parse_addr(addr)?,
                owner: owner.to_string(),
                size_bytes: parse_num(size)?,
                bulk_port: parse_num(port)?,
            },
            ["LIST", peer_id, count] => {
                let count: usize = parse_num(count)?;
                let names: Vec<String> = lines.map(str::to_string).collect();
                if names.len() != count {
                    return Err(malformed("listing count does not match entries"));
                }
                Reply::Listing {
                    peer_id: peer_id.to_string(),
                    names,
                }
            }
            _ => return Err(malformed("unrecognized reply")),
        };
        Ok(reply)
    }
}

fn malformed(what: &str) -> IndexError {
    IndexError::BadRequest(format!("malformed reply: {}", what))
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T, IndexError> {
    s.parse().map_err(|_| malformed("bad number"))
}

fn parse_addr(s: &str) -> Result<SocketAddr, IndexError> {
    s.parse().map_err(|_| malformed("bad address"))
}

// ── Bulk frames ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BulkOp {
    Upload,
    Download,
}

/// First frame of every bulk connection.
///
/// For uploads `peer_id` is the uploader; for downloads it is the owner
/// named in the `D` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHandshake {
    pub op: BulkOp,
    pub peer_id: String,
    pub name: String,
    /// Declared upload length. When present, an upload that ends short of
    /// it is aborted instead of committed. Ignored for downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl BulkHandshake {
    pub fn validate(&self) -> Result<(), IndexError> {
        check_field(&self.peer_id)?;
        check_field(&self.name)
    }
}

/// Service → client status frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BulkStatus {
    /// Upload slot claimed; send the body, then half-close.
    Accepted,
    /// Exactly `size_bytes` raw bytes follow.
    Sending { size_bytes: u64 },
    /// Upload flushed and committed.
    Complete { size_bytes: u64 },
    Rejected { code: String, message: String },
}

impl From<&IndexError> for BulkStatus {
    fn from(e: &IndexError) -> Self {
        BulkStatus::Rejected {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Encode a frame: 4-byte big-endian length, then the JSON body.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, IndexError> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| IndexError::TransferIo(format!("frame encode failed: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(IndexError::TransferIo("frame too large".into()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read exactly one frame from a stream.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T, IndexError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await.map_err(IndexError::io)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IndexError::BadRequest(format!(
            "frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(IndexError::io)?;
    serde_json::from_slice(&body)
        .map_err(|e| IndexError::BadRequest(format!("malformed frame: {}", e)))
}

/// Write one frame and flush.
pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), IndexError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await.map_err(IndexError::io)?;
    writer.flush().await.map_err(IndexError::io)
}
