//! Frame encoding and stream reassembly for [`Signal`]s.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::failure::FailureReport;
use super::signal::{Signal, SignalKey};

/// First byte of every frame.
pub const MAGIC: u8 = 0xC5;

/// Wire format version written by this crate.
pub const VERSION: u8 = 1;

/// Header size in bytes.
///
/// ```text
/// ┌──────────┬────────────┬─────────┬──────────────────┐
/// │ Magic(1) │ Version(1) │ Key(2)  │ Payload len (4)  │
/// └──────────┴────────────┴─────────┴──────────────────┘
/// ```
pub const HEADER_SIZE: usize = 8;

/// Largest payload accepted from the wire.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Errors during frame encode/decode.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer too small to decode a frame.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// First byte is not [`MAGIC`]; the stream is out of sync.
    #[error("bad frame magic: 0x{0:02x}")]
    BadMagic(u8),
    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown signal key: 0x{0:04x}")]
    UnknownKey(u16),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
    #[error("invalid {key} payload: {source}")]
    Payload {
        key: SignalKey,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    /// Whether the stream can continue after this error.
    ///
    /// Payload and key errors are confined to one frame whose length is
    /// known; header corruption leaves no way to find the next frame.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Payload { .. } | Self::UnknownKey(_))
    }
}

#[derive(Serialize, serde::Deserialize)]
struct FailurePayload {
    key: Option<SignalKey>,
    #[serde(flatten)]
    report: FailureReport,
}

/// Writer for encoding frames.
struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_frame(&mut self, key: SignalKey, payload: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len as usize <= MAX_PAYLOAD)
            .ok_or(CodecError::Oversized {
                len: payload.len(),
                max: MAX_PAYLOAD,
            })?;
        self.put_u8(MAGIC);
        self.put_u8(VERSION);
        self.put_u16(key.as_u16());
        self.put_u32(len);
        self.buf.extend_from_slice(payload);
        Ok(())
    }
}

/// Reader for decoding frame headers.
struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        if self.remaining() < N {
            return Err(CodecError::BufferTooSmall {
                need: N,
                have: self.remaining(),
            });
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(arr)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        self.take::<1>().map(|[b]| b)
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        self.take::<4>().map(u32::from_le_bytes)
    }
}

fn json<T: Serialize>(key: SignalKey, value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|source| CodecError::Payload { key, source })
}

fn from_json<T: DeserializeOwned>(key: SignalKey, payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(|source| CodecError::Payload { key, source })
}

fn payload_of(signal: &Signal) -> Result<Vec<u8>, CodecError> {
    let key = signal.key();
    match signal {
        Signal::ServerAlive | Signal::CloseTemplate | Signal::Start | Signal::Restart => {
            Ok(Vec::new())
        }
        Signal::Handshake { pid } => json(key, pid),
        Signal::Unpair { unpaired } => json(key, unpaired),
        Signal::Open(plan) | Signal::OpenInit(plan) | Signal::SingleSide(plan) => json(key, plan),
        Signal::Measure(mode) => json(key, mode),
        Signal::Save(list) => json(key, list),
        Signal::AlignmentIter(r) | Signal::RefXml(r) => json(key, r),
        Signal::ExportedFile(name) => json(key, name),
        Signal::Success { key: orig } => json(key, orig),
        Signal::Failure { key: orig, report } => json(
            key,
            &FailurePayload {
                key: *orig,
                report: report.clone(),
            },
        ),
    }
}

fn signal_from(key: SignalKey, payload: &[u8]) -> Result<Signal, CodecError> {
    Ok(match key {
        SignalKey::Handshake => Signal::Handshake {
            pid: from_json(key, payload)?,
        },
        SignalKey::ServerAlive => Signal::ServerAlive,
        SignalKey::Unpair => Signal::Unpair {
            unpaired: from_json(key, payload)?,
        },
        SignalKey::Open => Signal::Open(from_json(key, payload)?),
        SignalKey::OpenInit => Signal::OpenInit(from_json(key, payload)?),
        SignalKey::CloseTemplate => Signal::CloseTemplate,
        SignalKey::Start => Signal::Start,
        SignalKey::SingleSide => Signal::SingleSide(from_json(key, payload)?),
        SignalKey::Measure => Signal::Measure(from_json(key, payload)?),
        SignalKey::Save => Signal::Save(from_json(key, payload)?),
        SignalKey::AlignmentIter => Signal::AlignmentIter(from_json(key, payload)?),
        SignalKey::RefXml => Signal::RefXml(from_json(key, payload)?),
        SignalKey::Restart => Signal::Restart,
        SignalKey::ExportedFile => Signal::ExportedFile(from_json(key, payload)?),
        SignalKey::Success => Signal::Success {
            key: from_json(key, payload)?,
        },
        SignalKey::Failure => {
            let FailurePayload { key: orig, report } = from_json(key, payload)?;
            Signal::Failure { key: orig, report }
        }
    })
}

/// Appends the encoded frame for `signal` to `out`.
pub fn encode_signal(signal: &Signal, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let payload = payload_of(signal)?;
    FrameWriter::new(out).put_frame(signal.key(), &payload)
}

/// Decodes one frame from the front of `bytes`.
///
/// Returns the signal and the number of bytes consumed.
pub fn decode_signal(bytes: &[u8]) -> Result<(Signal, usize), CodecError> {
    let (key, payload, consumed) = split_frame(bytes)?;
    let key = SignalKey::try_from(key)?;
    Ok((signal_from(key, payload)?, consumed))
}

/// Validates the header and returns `(raw key, payload, frame length)`.
fn split_frame(bytes: &[u8]) -> Result<(u16, &[u8], usize), CodecError> {
    let mut r = FrameReader::new(bytes);

    let magic = r.take_u8()?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = r.take_u8()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let key = r.take_u16()?;
    let len = r.take_u32()? as usize;
    if len > MAX_PAYLOAD {
        return Err(CodecError::Oversized {
            len,
            max: MAX_PAYLOAD,
        });
    }
    let total = HEADER_SIZE + len;
    if bytes.len() < total {
        return Err(CodecError::BufferTooSmall {
            need: total,
            have: bytes.len(),
        });
    }
    Ok((key, &bytes[HEADER_SIZE..total], total))
}

/// Reassembles frames from a byte stream that may split them arbitrarily.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame, if any.
    ///
    /// A frame with a bad payload is consumed and reported; the stream stays
    /// usable. A corrupt header drops everything buffered.
    pub fn next_signal(&mut self) -> Option<Result<Signal, CodecError>> {
        match split_frame(&self.buf) {
            Ok((key, payload, consumed)) => {
                let decoded =
                    SignalKey::try_from(key).and_then(|key| signal_from(key, payload));
                self.buf.drain(..consumed);
                Some(decoded)
            }
            Err(CodecError::BufferTooSmall { .. }) => None,
            Err(e) => {
                self.buf.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signal::{MeasureMode, MeasurementId, PlanRef};

    fn encode(signal: &Signal) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_signal(signal, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_layout() {
        let buf = encode(&Signal::Start);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf[0], MAGIC);
        assert_eq!(buf[1], VERSION);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), SignalKey::Start.as_u16());
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 0);
    }

    #[test]
    fn payloads_are_json() {
        let buf = encode(&Signal::failure_for(
            SignalKey::Save,
            FailureReport::new(303, "bad mlist"),
        ));
        let payload: serde_json::Value = serde_json::from_slice(&buf[HEADER_SIZE..]).unwrap();
        assert_eq!(payload["key"], "Save");
        assert_eq!(payload["code"], 303);
        assert_eq!(payload["text"], "bad mlist");
    }

    #[test]
    fn decode_reports_consumed_length() {
        let signal = Signal::Save(vec![MeasurementId(1), MeasurementId(7)]);
        let mut buf = encode(&signal);
        buf.extend_from_slice(&encode(&Signal::Restart));

        let (decoded, used) = decode_signal(&buf).unwrap();
        assert_eq!(decoded, signal);
        let (next, _) = decode_signal(&buf[used..]).unwrap();
        assert_eq!(next, Signal::Restart);
    }

    #[test]
    fn decoder_reassembles_split_frames() {
        let mut stream = encode(&Signal::Open(PlanRef::new("door-left")));
        stream.extend_from_slice(&encode(&Signal::Measure(MeasureMode::Calibration)));

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(3) {
            decoder.extend(chunk);
            while let Some(next) = decoder.next_signal() {
                out.push(next.unwrap());
            }
        }
        assert_eq!(
            out,
            vec![
                Signal::Open(PlanRef::new("door-left")),
                Signal::Measure(MeasureMode::Calibration)
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_skips_bad_payload_and_continues() {
        let mut bad = Vec::new();
        FrameWriter::new(&mut bad)
            .put_frame(SignalKey::Unpair, b"not-json")
            .unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bad);
        decoder.extend(&encode(&Signal::Start));

        let first = decoder.next_signal().unwrap();
        assert!(matches!(first, Err(ref e) if e.is_recoverable()));
        assert_eq!(decoder.next_signal().unwrap().unwrap(), Signal::Start);
    }

    #[test]
    fn bad_magic_drops_buffer() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x00, 1, 0x14, 0, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.next_signal(),
            Some(Err(CodecError::BadMagic(0x00)))
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn rejects_unknown_version_and_oversized_length() {
        let mut buf = encode(&Signal::Start);
        buf[1] = 9;
        assert!(matches!(
            decode_signal(&buf),
            Err(CodecError::UnsupportedVersion(9))
        ));

        let mut huge = vec![MAGIC, VERSION, 0x14, 0x00];
        huge.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_signal(&huge),
            Err(CodecError::Oversized { .. })
        ));
    }

    #[test]
    fn decode_empty_buffer() {
        assert!(matches!(
            decode_signal(&[]),
            Err(CodecError::BufferTooSmall { need: 1, .. })
        ));
    }
}
