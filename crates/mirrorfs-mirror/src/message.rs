//! Request/response envelopes and their frame encoding
//!
//! On the wire every envelope is a little-endian `u32` length followed by
//! the bincode encoding of the envelope.

use crate::op::{OpReply, Operation};
use mirrorfs_common::{Error, ErrorCode, GroupId, RemoteError, Result, TargetId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame (chunk payloads included)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Flags set by the sender of a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// Replay of an operation the group's primary already executed
    pub secondary_forward: bool,
}

/// Identity of one forward, unique per origin target.
///
/// A resent forward keeps its ID, so the secondary can answer it from its
/// reply cache instead of executing it twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardId {
    pub origin: TargetId,
    pub seq: u64,
}

/// A request addressed to one target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRequest {
    pub target: TargetId,
    /// Buddy group of the object; `None` for unmirrored objects
    pub group: Option<GroupId>,
    pub flags: RequestFlags,
    /// Set on forwards only
    pub forward_id: Option<ForwardId>,
    pub op: Operation,
}

impl MirrorRequest {
    /// A client request for an object in `group`
    #[must_use]
    pub const fn mirrored(target: TargetId, group: GroupId, op: Operation) -> Self {
        Self {
            target,
            group: Some(group),
            flags: RequestFlags {
                secondary_forward: false,
            },
            forward_id: None,
            op,
        }
    }

    /// A client request for an unmirrored object
    #[must_use]
    pub const fn local(target: TargetId, op: Operation) -> Self {
        Self {
            target,
            group: None,
            flags: RequestFlags {
                secondary_forward: false,
            },
            forward_id: None,
            op,
        }
    }

    /// The replay of an operation the primary of `group` executed
    #[must_use]
    pub const fn forward(secondary: TargetId, group: GroupId, id: ForwardId, op: Operation) -> Self {
        Self {
            target: secondary,
            group: Some(group),
            flags: RequestFlags {
                secondary_forward: true,
            },
            forward_id: Some(id),
            op,
        }
    }
}

/// What happened to the secondary copy of a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardOutcome {
    /// Not mirrored, read-only, or itself a forward
    NotRequired,
    /// The secondary executed the operation too
    Acknowledged,
    /// The secondary rejected an operation the primary executed
    Diverged(ErrorCode),
    /// The secondary could not be reached
    CommFailed,
    /// The secondary is not in sync; it was (or already is) flagged for resync
    Skipped,
    /// A resync pass to the secondary is running and will carry the change
    RecordedForResync,
}

/// Reply to a [`MirrorRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorResponse {
    pub result: std::result::Result<OpReply, RemoteError>,
    pub forward: ForwardOutcome,
}

impl MirrorResponse {
    #[must_use]
    pub fn ok(reply: OpReply, forward: ForwardOutcome) -> Self {
        Self {
            result: Ok(reply),
            forward,
        }
    }

    #[must_use]
    pub fn error(err: &Error) -> Self {
        Self {
            result: Err(RemoteError::from(err)),
            forward: ForwardOutcome::NotRequired,
        }
    }

    /// The reply, or the remote error converted back into an [`Error`]
    pub fn into_result(self) -> Result<OpReply> {
        self.result.map_err(Error::from)
    }
}

/// Encode `value` as one frame
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)
        .map_err(|e| Error::Serialization(format!("failed to encode frame: {e}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::invalid_argument(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| Error::invalid_argument("frame length does not fit in u32"))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream before the length prefix
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::invalid_argument(format!(
            "incoming frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let value = bincode::deserialize(&body)
        .map_err(|e| Error::Serialization(format!("failed to decode frame: {e}")))?;
    Ok(Some(value))
}
