use std::io::IoSlice;
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Buf;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::Frame;
use super::MsgType;
use crate::constants::FRAME_HEADER_SIZE;
use crate::Error;
use crate::NetworkError;

/// Inbound read phases. The header phase reads exactly the fixed header;
/// completing it sizes the buffers for the payload phase, which reads until
/// both the control and payload parts are full. Partial reads resume in the
/// same phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Header,
    Payload {
        msg_type: MsgType,
        control_len: usize,
        payload_len: usize,
    },
}

/// Frame codec for site-to-site connections.
pub struct WireCodec {
    phase: ReadPhase,
    max_frame_size: usize,
}

impl WireCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            phase: ReadPhase::Header,
            max_frame_size,
        }
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if let ReadPhase::Header = self.phase {
            if src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let msg_type = MsgType::from_u8(src[0])
                .ok_or_else(|| NetworkError::BadFrame(format!("unknown msg type {}", src[0])))?;
            let control_len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
            let payload_len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
            for len in [control_len, payload_len] {
                if len > self.max_frame_size {
                    return Err(NetworkError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_size,
                    }
                    .into());
                }
            }
            src.advance(FRAME_HEADER_SIZE);
            src.reserve(control_len + payload_len);
            self.phase = ReadPhase::Payload {
                msg_type,
                control_len,
                payload_len,
            };
        }

        let ReadPhase::Payload {
            msg_type,
            control_len,
            payload_len,
        } = self.phase
        else {
            unreachable!()
        };
        if src.len() < control_len + payload_len {
            return Ok(None);
        }
        let control = src.split_to(control_len).freeze();
        let payload = src.split_to(payload_len).freeze();
        self.phase = ReadPhase::Header;
        Ok(Some(Frame {
            msg_type,
            control,
            payload,
        }))
    }
}

/// An outbound message framed for sending: the fixed header plus the two
/// variable parts, kept separate so the fast path can scatter-write them
/// without copying. Flattening (for the queued path, where the transport
/// writer resumes mid-message) happens at most once and the flat buffer is
/// shared between every queue that references it.
#[derive(Debug)]
pub struct SendFrame {
    header: [u8; FRAME_HEADER_SIZE],
    control: Vec<u8>,
    payload: Vec<u8>,
    flat: OnceLock<Arc<Vec<u8>>>,
}

impl SendFrame {
    pub fn new(msg_type: MsgType, control: Vec<u8>, payload: Vec<u8>) -> Self {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0] = msg_type as u8;
        header[1..5].copy_from_slice(&(control.len() as u32).to_be_bytes());
        header[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        Self {
            header,
            control,
            payload,
            flat: OnceLock::new(),
        }
    }

    /// Total bytes on the wire.
    pub fn len(&self) -> usize {
        FRAME_HEADER_SIZE + self.control.len() + self.payload.len()
    }

    /// I/O slices covering everything from `offset` on, for scatter writes.
    pub fn slices_from(&self, offset: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(3);
        let mut skip = offset;
        for part in [&self.header[..], &self.control[..], &self.payload[..]] {
            if skip >= part.len() {
                skip -= part.len();
            } else {
                slices.push(IoSlice::new(&part[skip..]));
                skip = 0;
            }
        }
        slices
    }

    /// One flat shared copy of the whole frame, built on first use.
    pub fn flattened(&self) -> Arc<Vec<u8>> {
        self.flat
            .get_or_init(|| {
                let mut buf = Vec::with_capacity(self.len());
                buf.extend_from_slice(&self.header);
                buf.extend_from_slice(&self.control);
                buf.extend_from_slice(&self.payload);
                Arc::new(buf)
            })
            .clone()
    }
}
