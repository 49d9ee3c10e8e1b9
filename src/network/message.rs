//! Message model for the site-to-site protocol.
//!
//! Every frame is `type, control-length, payload-length, control, payload`
//! with both lengths big-endian and always present. Handshakes and acks are
//! transport-level; everything else is a replication message whose control
//! is the fixed [`RepControl`] block. Replication payloads are decoded once
//! at the boundary into the [`RepMessage`] sum type rather than being
//! re-interpreted per call site.

use bytes::Bytes;

use crate::constants::WIRE_VERSION;
use crate::Lsn;
use crate::NetworkError;
use crate::RecordType;
use crate::ReplicationError;
use crate::Result;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Handshake = 1,
    Ack = 2,
    Rep = 3,
}

impl MsgType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MsgType::Handshake),
            2 => Some(MsgType::Ack),
            3 => Some(MsgType::Rep),
            _ => None,
        }
    }
}

/// Control-block flags on replication messages.
pub mod rep_flags {
    /// Record must be acknowledged once durable at the receiver
    pub const NEEDS_ACK: u32 = 0x1;
    /// Retransmission of a record sent before
    pub const RESEND: u32 = 0x2;
    /// Receiver is caught up with the sender's log once this is applied
    pub const LOG_END: u32 = 0x4;
}

/// Handshake control plus the hostname carried in its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub priority: u32,
    pub port: u16,
    pub hostname: String,
}

/// Acknowledgement that a site has durably applied up to `lsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub lsn: Lsn,
    pub generation: u32,
}

/// Fixed control block carried by every replication message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepControl {
    pub version: u32,
    pub log_version: u32,
    pub lsn: Lsn,
    pub rec_type: u32,
    pub generation: u32,
    pub flags: u32,
}

impl RepControl {
    pub const SIZE: usize = 28;
}

// Replication message kinds on the wire.
const MK_LOG: u32 = 1;
const MK_LOG_MORE: u32 = 2;
const MK_BULK_LOG: u32 = 3;
const MK_ALL_REQ: u32 = 4;
const MK_LOG_REQ: u32 = 5;
const MK_NEWFILE: u32 = 6;
const MK_VERIFY_FAIL: u32 = 7;
const MK_PRIMARY_QUERY: u32 = 8;

/// One replication message, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepMessage {
    /// One log record
    Log {
        lsn: Lsn,
        rec_type: RecordType,
        flags: u32,
        payload: Vec<u8>,
    },
    /// A log record sent while the sender pauses under its throttle budget;
    /// there is more where it came from
    LogMore {
        lsn: Lsn,
        rec_type: RecordType,
        flags: u32,
        payload: Vec<u8>,
    },
    /// Several records batched into one buffer of `{len, lsn, body}` entries
    BulkLog {
        first_lsn: Lsn,
        flags: u32,
        payload: Vec<u8>,
    },
    /// Send everything starting at `from` (the sender's oldest record when
    /// `from` is unset)
    AllReq { from: Lsn },
    /// Send `from` and, if `end` is set, everything up to (excluding) it
    LogReq { from: Lsn, end: Option<Lsn> },
    /// The file containing `end_of_file` ended there; records that follow
    /// carry the next file number
    NewFile { end_of_file: Lsn, log_version: u32 },
    /// The requester is too far behind this log and must resynchronize by
    /// an external full-copy mechanism
    VerifyFail { lsn: Lsn },
    /// Broadcast while no primary is known
    PrimaryQuery,
}

impl RepMessage {
    /// Splits into the control block and payload for framing. `generation`
    /// and `log_version` describe the sender at send time.
    pub fn to_wire(&self, generation: u32, log_version: u32) -> (RepControl, Vec<u8>) {
        let mut ctl = RepControl {
            version: WIRE_VERSION,
            log_version,
            lsn: Lsn::ZERO,
            rec_type: 0,
            generation,
            flags: 0,
        };
        let payload = match self {
            RepMessage::Log {
                lsn,
                rec_type,
                flags,
                payload,
            }
            | RepMessage::LogMore {
                lsn,
                rec_type,
                flags,
                payload,
            } => {
                ctl.rec_type = if matches!(self, RepMessage::Log { .. }) {
                    MK_LOG
                } else {
                    MK_LOG_MORE
                };
                ctl.lsn = *lsn;
                ctl.flags = *flags;
                encode_record_body(*rec_type, payload)
            }
            RepMessage::BulkLog {
                first_lsn,
                flags,
                payload,
            } => {
                ctl.rec_type = MK_BULK_LOG;
                ctl.lsn = *first_lsn;
                ctl.flags = *flags;
                payload.clone()
            }
            RepMessage::AllReq { from } => {
                ctl.rec_type = MK_ALL_REQ;
                ctl.lsn = *from;
                Vec::new()
            }
            RepMessage::LogReq { from, end } => {
                ctl.rec_type = MK_LOG_REQ;
                ctl.lsn = *from;
                end.map(|e| e.to_be_bytes().to_vec()).unwrap_or_default()
            }
            RepMessage::NewFile {
                end_of_file,
                log_version: old_version,
            } => {
                ctl.rec_type = MK_NEWFILE;
                ctl.lsn = *end_of_file;
                old_version.to_be_bytes().to_vec()
            }
            RepMessage::VerifyFail { lsn } => {
                ctl.rec_type = MK_VERIFY_FAIL;
                ctl.lsn = *lsn;
                Vec::new()
            }
            RepMessage::PrimaryQuery => {
                ctl.rec_type = MK_PRIMARY_QUERY;
                Vec::new()
            }
        };
        (ctl, payload)
    }

    /// Decodes a control block and payload received off the wire.
    pub fn from_wire(ctl: &RepControl, payload: &[u8]) -> Result<Self> {
        match ctl.rec_type {
            MK_LOG | MK_LOG_MORE => {
                let (rec_type, body) = decode_record_body(payload)?;
                let msg = if ctl.rec_type == MK_LOG {
                    RepMessage::Log {
                        lsn: ctl.lsn,
                        rec_type,
                        flags: ctl.flags,
                        payload: body,
                    }
                } else {
                    RepMessage::LogMore {
                        lsn: ctl.lsn,
                        rec_type,
                        flags: ctl.flags,
                        payload: body,
                    }
                };
                Ok(msg)
            }
            MK_BULK_LOG => Ok(RepMessage::BulkLog {
                first_lsn: ctl.lsn,
                flags: ctl.flags,
                payload: payload.to_vec(),
            }),
            MK_ALL_REQ => Ok(RepMessage::AllReq { from: ctl.lsn }),
            MK_LOG_REQ => {
                let end = match payload.len() {
                    0 => None,
                    8 => Some(Lsn::from_be_bytes(payload.try_into().unwrap())),
                    n => {
                        return Err(NetworkError::BadFrame(format!(
                            "log request with {}-byte range end",
                            n
                        ))
                        .into())
                    }
                };
                Ok(RepMessage::LogReq { from: ctl.lsn, end })
            }
            MK_NEWFILE => {
                if payload.len() != 4 {
                    return Err(
                        NetworkError::BadFrame("new-file marker without version".into()).into(),
                    );
                }
                Ok(RepMessage::NewFile {
                    end_of_file: ctl.lsn,
                    log_version: u32::from_be_bytes(payload.try_into().unwrap()),
                })
            }
            MK_VERIFY_FAIL => Ok(RepMessage::VerifyFail { lsn: ctl.lsn }),
            MK_PRIMARY_QUERY => Ok(RepMessage::PrimaryQuery),
            other => Err(ReplicationError::UnknownMessageType(other).into()),
        }
    }
}

/// Wire body of one log record: its type tag followed by the payload.
pub fn encode_record_body(rec_type: RecordType, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&rec_type.as_u32().to_be_bytes());
    body.extend_from_slice(payload);
    body
}

pub fn decode_record_body(body: &[u8]) -> Result<(RecordType, Vec<u8>)> {
    if body.len() < 4 {
        return Err(NetworkError::BadFrame("short record body".into()).into());
    }
    let raw = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let rec_type = RecordType::from_u32(raw)
        .ok_or_else(|| NetworkError::BadFrame(format!("unknown record type {}", raw)))?;
    Ok((rec_type, body[4..].to_vec()))
}

impl RepControl {
    pub fn encode(&self) -> [u8; RepControl::SIZE] {
        let mut buf = [0u8; RepControl::SIZE];
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..8].copy_from_slice(&self.log_version.to_be_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rec_type.to_be_bytes());
        buf[20..24].copy_from_slice(&self.generation.to_be_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != RepControl::SIZE {
            return Err(NetworkError::BadFrame(format!(
                "replication control of {} bytes",
                buf.len()
            ))
            .into());
        }
        let version = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if version != WIRE_VERSION {
            return Err(NetworkError::VersionMismatch {
                remote: version,
                ours: WIRE_VERSION,
            }
            .into());
        }
        Ok(Self {
            version,
            log_version: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            lsn: Lsn::from_be_bytes(buf[8..16].try_into().unwrap()),
            rec_type: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            generation: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            flags: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

impl Handshake {
    /// 10-byte control: protocol version, election priority, listening port.
    pub fn encode_control(&self) -> [u8; 10] {
        let mut buf = [0u8; 10];
        buf[0..4].copy_from_slice(&self.version.to_be_bytes());
        buf[4..8].copy_from_slice(&self.priority.to_be_bytes());
        buf[8..10].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// NUL-terminated hostname payload.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = self.hostname.as_bytes().to_vec();
        buf.push(0);
        buf
    }

    pub fn decode(control: &[u8], payload: &[u8]) -> Result<Self> {
        if control.len() != 10 {
            return Err(
                NetworkError::BadFrame(format!("handshake control of {} bytes", control.len()))
                    .into(),
            );
        }
        let version = u32::from_be_bytes(control[0..4].try_into().unwrap());
        if version != WIRE_VERSION {
            return Err(NetworkError::VersionMismatch {
                remote: version,
                ours: WIRE_VERSION,
            }
            .into());
        }
        let Some(nul) = payload.iter().position(|&b| b == 0) else {
            return Err(NetworkError::BadFrame("unterminated handshake hostname".into()).into());
        };
        let hostname = String::from_utf8(payload[..nul].to_vec())
            .map_err(|_| NetworkError::BadFrame("non-UTF-8 handshake hostname".into()))?;
        if hostname.is_empty() {
            return Err(NetworkError::BadFrame("empty handshake hostname".into()).into());
        }
        Ok(Self {
            version,
            priority: u32::from_be_bytes(control[4..8].try_into().unwrap()),
            port: u16::from_be_bytes(control[8..10].try_into().unwrap()),
            hostname,
        })
    }
}

impl Ack {
    /// 12-byte control: LSN plus generation; the payload is always empty.
    pub fn encode_control(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..8].copy_from_slice(&self.lsn.to_be_bytes());
        buf[8..12].copy_from_slice(&self.generation.to_be_bytes());
        buf
    }

    pub fn decode(control: &[u8], payload: &[u8]) -> Result<Self> {
        if control.len() != 12 || !payload.is_empty() {
            return Err(NetworkError::BadFrame("bad ack msg size".into()).into());
        }
        Ok(Self {
            lsn: Lsn::from_be_bytes(control[0..8].try_into().unwrap()),
            generation: u32::from_be_bytes(control[8..12].try_into().unwrap()),
        })
    }
}

/// One whole inbound frame, reassembled by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub control: Bytes,
    pub payload: Bytes,
}
