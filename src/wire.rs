//! Messages exchanged between nodes and their binary encoding.
//!
//! # Frame layout
//!
//! Every frame starts with a one-byte tag. Integers are big-endian.
//!
//! ```text
//! request  (tags 1..=5): name | node:u32 | cookie:u64 | current:u8 | requested:u8 | flags:u8 | generation:u32
//! response (tag 6):      name | node:u32 | cookie:u64 | status:u8 [code:u8] | mode:u8 | generation:u32
//! notify   (tag 7):      name | node:u32 | cookie:u64 | kind:u8 | mode:u8 | generation:u32
//! name:                  len:u16 | bytes (UTF-8)
//! ```
//!
//! The status byte is followed by a failure code only when it is `Failed`.

use crate::error::{DlmError, Result};
use crate::lock::{HolderId, LockFlags};
use crate::mode::LockMode;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A request from a holder's node to the resource master.
///
/// The same layout serves every request kind: an acquire is a conversion
/// from `NL`, a release a conversion to `NL`, a recovery re-registration a
/// conversion from a mode to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub resource_name: String,
    pub holder: HolderId,
    pub current_mode: LockMode,
    pub requested_mode: LockMode,
    pub flags: LockFlags,
    pub generation: u32,
}

/// Why the master refused a request outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    UnknownResource,
    NotHolder,
    ConversionInProgress,
    AlreadyHolder,
}

impl FailureCode {
    fn as_u8(self) -> u8 {
        match self {
            FailureCode::UnknownResource => 1,
            FailureCode::NotHolder => 2,
            FailureCode::ConversionInProgress => 3,
            FailureCode::AlreadyHolder => 4,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FailureCode::UnknownResource),
            2 => Ok(FailureCode::NotHolder),
            3 => Ok(FailureCode::ConversionInProgress),
            4 => Ok(FailureCode::AlreadyHolder),
            other => Err(DlmError::Codec(format!("invalid failure code {}", other))),
        }
    }

    /// The code a master sends for a local refusal, if it has one.
    pub fn from_error(err: &DlmError) -> Option<Self> {
        match err {
            DlmError::UnknownResource(_) => Some(FailureCode::UnknownResource),
            DlmError::NotHolder { .. } => Some(FailureCode::NotHolder),
            DlmError::ConversionInProgress { .. } => Some(FailureCode::ConversionInProgress),
            DlmError::AlreadyHolder { .. } => Some(FailureCode::AlreadyHolder),
            _ => None,
        }
    }

    /// Rebuild the error on the requesting side.
    pub fn into_error(self, resource: &str, holder: HolderId) -> DlmError {
        let resource = resource.to_string();
        let holder = holder.to_string();
        match self {
            FailureCode::UnknownResource => DlmError::UnknownResource(resource),
            FailureCode::NotHolder => DlmError::NotHolder { resource, holder },
            FailureCode::ConversionInProgress => {
                DlmError::ConversionInProgress { resource, holder }
            }
            FailureCode::AlreadyHolder => DlmError::AlreadyHolder { resource, holder },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStatus {
    Granted,
    Queued,
    Denied,
    RetryMaster,
    Failed(FailureCode),
}

/// The master's synchronous answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResponse {
    pub resource_name: String,
    pub holder: HolderId,
    pub status: ConversionStatus,
    /// Mode the holder holds once the response is applied.
    pub mode: LockMode,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A queued request was granted at this mode.
    Granted(LockMode),
    /// A queued request was cancelled; the holder keeps this mode.
    Denied(LockMode),
    /// Someone is waiting for this mode behind the holder.
    Blocking(LockMode),
}

/// An unsolicited push from the master to a holder's node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub resource_name: String,
    pub holder: HolderId,
    pub kind: NotificationKind,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Acquire(ConversionRequest),
    Convert(ConversionRequest),
    Cancel(ConversionRequest),
    Release(ConversionRequest),
    Recover(ConversionRequest),
    Response(ConversionResponse),
    Notify(Notification),
}

const TAG_ACQUIRE: u8 = 1;
const TAG_CONVERT: u8 = 2;
const TAG_CANCEL: u8 = 3;
const TAG_RELEASE: u8 = 4;
const TAG_RECOVER: u8 = 5;
const TAG_RESPONSE: u8 = 6;
const TAG_NOTIFY: u8 = 7;

impl Message {
    /// Short label for logs and the event log.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Acquire(_) => "acquire",
            Message::Convert(_) => "convert",
            Message::Cancel(_) => "cancel",
            Message::Release(_) => "release",
            Message::Recover(_) => "recover",
            Message::Response(_) => "response",
            Message::Notify(_) => "notify",
        }
    }

    pub fn resource_name(&self) -> &str {
        match self {
            Message::Acquire(r)
            | Message::Convert(r)
            | Message::Cancel(r)
            | Message::Release(r)
            | Message::Recover(r) => &r.resource_name,
            Message::Response(r) => &r.resource_name,
            Message::Notify(n) => &n.resource_name,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32 + self.resource_name().len());
        match self {
            Message::Acquire(r) => encode_request(&mut buf, TAG_ACQUIRE, r)?,
            Message::Convert(r) => encode_request(&mut buf, TAG_CONVERT, r)?,
            Message::Cancel(r) => encode_request(&mut buf, TAG_CANCEL, r)?,
            Message::Release(r) => encode_request(&mut buf, TAG_RELEASE, r)?,
            Message::Recover(r) => encode_request(&mut buf, TAG_RECOVER, r)?,
            Message::Response(r) => {
                buf.put_u8(TAG_RESPONSE);
                put_name(&mut buf, &r.resource_name)?;
                put_holder(&mut buf, r.holder);
                match r.status {
                    ConversionStatus::Granted => buf.put_u8(0),
                    ConversionStatus::Queued => buf.put_u8(1),
                    ConversionStatus::Denied => buf.put_u8(2),
                    ConversionStatus::RetryMaster => buf.put_u8(3),
                    ConversionStatus::Failed(code) => {
                        buf.put_u8(4);
                        buf.put_u8(code.as_u8());
                    }
                }
                buf.put_u8(r.mode.as_u8());
                buf.put_u32(r.generation);
            }
            Message::Notify(n) => {
                buf.put_u8(TAG_NOTIFY);
                put_name(&mut buf, &n.resource_name)?;
                put_holder(&mut buf, n.holder);
                let (kind, mode) = match n.kind {
                    NotificationKind::Granted(m) => (0, m),
                    NotificationKind::Denied(m) => (1, m),
                    NotificationKind::Blocking(m) => (2, m),
                };
                buf.put_u8(kind);
                buf.put_u8(mode.as_u8());
                buf.put_u32(n.generation);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        need(&buf, 1, "tag")?;
        let tag = buf.get_u8();
        let message = match tag {
            TAG_ACQUIRE => Message::Acquire(decode_request(&mut buf)?),
            TAG_CONVERT => Message::Convert(decode_request(&mut buf)?),
            TAG_CANCEL => Message::Cancel(decode_request(&mut buf)?),
            TAG_RELEASE => Message::Release(decode_request(&mut buf)?),
            TAG_RECOVER => Message::Recover(decode_request(&mut buf)?),
            TAG_RESPONSE => {
                let resource_name = get_name(&mut buf)?;
                let holder = get_holder(&mut buf)?;
                need(&buf, 1, "status")?;
                let status = match buf.get_u8() {
                    0 => ConversionStatus::Granted,
                    1 => ConversionStatus::Queued,
                    2 => ConversionStatus::Denied,
                    3 => ConversionStatus::RetryMaster,
                    4 => {
                        need(&buf, 1, "failure code")?;
                        ConversionStatus::Failed(FailureCode::from_u8(buf.get_u8())?)
                    }
                    other => return Err(DlmError::Codec(format!("invalid status {}", other))),
                };
                need(&buf, 5, "response tail")?;
                let mode = LockMode::from_u8(buf.get_u8())?;
                let generation = buf.get_u32();
                Message::Response(ConversionResponse {
                    resource_name,
                    holder,
                    status,
                    mode,
                    generation,
                })
            }
            TAG_NOTIFY => {
                let resource_name = get_name(&mut buf)?;
                let holder = get_holder(&mut buf)?;
                need(&buf, 6, "notification tail")?;
                let kind = buf.get_u8();
                let mode = LockMode::from_u8(buf.get_u8())?;
                let kind = match kind {
                    0 => NotificationKind::Granted(mode),
                    1 => NotificationKind::Denied(mode),
                    2 => NotificationKind::Blocking(mode),
                    other => {
                        return Err(DlmError::Codec(format!(
                            "invalid notification kind {}",
                            other
                        )));
                    }
                };
                let generation = buf.get_u32();
                Message::Notify(Notification {
                    resource_name,
                    holder,
                    kind,
                    generation,
                })
            }
            other => return Err(DlmError::Codec(format!("unknown message tag {}", other))),
        };

        if buf.has_remaining() {
            return Err(DlmError::Codec(format!(
                "{} trailing bytes after {} frame",
                buf.remaining(),
                message.kind()
            )));
        }
        Ok(message)
    }
}

fn encode_request(buf: &mut BytesMut, tag: u8, r: &ConversionRequest) -> Result<()> {
    buf.put_u8(tag);
    put_name(buf, &r.resource_name)?;
    put_holder(buf, r.holder);
    buf.put_u8(r.current_mode.as_u8());
    buf.put_u8(r.requested_mode.as_u8());
    buf.put_u8(r.flags.bits());
    buf.put_u32(r.generation);
    Ok(())
}

fn decode_request(buf: &mut &[u8]) -> Result<ConversionRequest> {
    let resource_name = get_name(buf)?;
    let holder = get_holder(buf)?;
    need(buf, 7, "request tail")?;
    let current_mode = LockMode::from_u8(buf.get_u8())?;
    let requested_mode = LockMode::from_u8(buf.get_u8())?;
    let flags = LockFlags::from_bits(buf.get_u8());
    let generation = buf.get_u32();
    Ok(ConversionRequest {
        resource_name,
        holder,
        current_mode,
        requested_mode,
        flags,
        generation,
    })
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(DlmError::Codec(format!(
            "truncated frame: need {} bytes for {}, have {}",
            n,
            what,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    let len = u16::try_from(name.len())
        .map_err(|_| DlmError::Codec(format!("resource name too long ({} bytes)", name.len())))?;
    buf.put_u16(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn get_name(buf: &mut &[u8]) -> Result<String> {
    need(buf, 2, "name length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "name")?;
    let name = String::from_utf8(buf[..len].to_vec())
        .map_err(|e| DlmError::Codec(format!("resource name is not UTF-8: {}", e)))?;
    buf.advance(len);
    Ok(name)
}

fn put_holder(buf: &mut BytesMut, holder: HolderId) {
    buf.put_u32(holder.node);
    buf.put_u64(holder.cookie);
}

fn get_holder(buf: &mut &[u8]) -> Result<HolderId> {
    need(buf, 12, "holder")?;
    let node = buf.get_u32();
    let cookie = buf.get_u64();
    Ok(HolderId { node, cookie })
}
