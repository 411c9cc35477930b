use crate::{flags::*, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;
use std::num::NonZeroU32;

/// https://httpwg.org/specs/rfc7540.html#StreamPriority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// One HTTP/2 frame, payload already parsed for its type.
///
/// Padding is stripped on decode and never produced on encode, so the PADDED
/// flag is absent from decoded frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorCode,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: NonZeroU32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
}

/// Outcome of one decode pass over the byte accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A frame of a type this implementation does not know; the spec says to
    /// ignore and discard it.
    Ignored(u8),
    /// Not enough buffered bytes for a whole frame yet.
    Unfinished,
}

impl Frame {
    /// Decodes one frame from the front of `buf`, leaving any remaining bytes
    /// in place. Call repeatedly until `Decoded::Unfinished`.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Decoded, FrameDecodeError> {
        if buf.len() < 9 {
            return Ok(Decoded::Unfinished);
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        if length > max_frame_size {
            return Err(FrameDecodeError::Oversized {
                length,
                max: max_frame_size,
            });
        }
        if buf.len() < 9 + length as usize {
            return Ok(Decoded::Unfinished);
        }

        let header = buf.split_to(9);
        let flags = header[4];
        // the high bit of the stream id is reserved and ignored on receipt
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & U31_MAX;
        let payload = buf.split_to(length as usize).freeze();

        let typ = match FrameType::from_u8(header[3]) {
            Some(typ) => typ,
            None => return Ok(Decoded::Ignored(header[3])),
        };

        let frame = match typ {
            FrameType::Data => {
                let flags = DataFlags::from_bits_truncate(flags);
                let data = strip_padding(payload, flags.contains(DataFlags::PADDED))?;
                Frame::Data {
                    stream: stream_id_required(stream_id)?,
                    flags: flags - DataFlags::PADDED,
                    data,
                }
            }
            FrameType::Headers => {
                let flags = HeadersFlags::from_bits_truncate(flags);
                let mut fragment = strip_padding(payload, flags.contains(HeadersFlags::PADDED))?;
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    Some(parse_priority(&mut fragment)?)
                } else {
                    None
                };
                Frame::Headers {
                    stream: stream_id_required(stream_id)?,
                    flags: flags - HeadersFlags::PADDED,
                    priority,
                    fragment,
                }
            }
            FrameType::Priority => {
                if payload.len() != 5 {
                    return Err(FrameDecodeError::InvalidLength {
                        typ,
                        length: payload.len(),
                    });
                }
                let mut payload = payload;
                Frame::Priority {
                    stream: stream_id_required(stream_id)?,
                    priority: parse_priority(&mut payload)?,
                }
            }
            FrameType::ResetStream => {
                if payload.len() != 4 {
                    return Err(FrameDecodeError::InvalidLength {
                        typ,
                        length: payload.len(),
                    });
                }
                Frame::ResetStream {
                    stream: stream_id_required(stream_id)?,
                    error: parse_error_code(&payload[0..4])?,
                }
            }
            FrameType::Settings => {
                if stream_id != 0 {
                    return Err(FrameDecodeError::UnexpectedStreamId);
                }
                let flags = SettingsFlags::from_bits_truncate(flags);
                if (flags.contains(SettingsFlags::ACK) && !payload.is_empty())
                    || payload.len() % 6 != 0
                {
                    return Err(FrameDecodeError::InvalidLength {
                        typ,
                        length: payload.len(),
                    });
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks(6) {
                    // RFC 7540 says to ignore unknown settings
                    if let Some(param) = SettingsParameter::from_u16(u16::from_be_bytes([
                        chunk[0], chunk[1],
                    ])) {
                        params.push((
                            param,
                            u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                        ));
                    }
                }
                Frame::Settings { flags, params }
            }
            FrameType::PushPromise => {
                let flags = PushPromiseFlags::from_bits_truncate(flags);
                let mut fragment =
                    strip_padding(payload, flags.contains(PushPromiseFlags::PADDED))?;
                if fragment.len() < 4 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let promised = fragment.get_u32() & U31_MAX;
                Frame::PushPromise {
                    stream: stream_id_required(stream_id)?,
                    flags: flags - PushPromiseFlags::PADDED,
                    promised: stream_id_required(promised)?,
                    fragment,
                }
            }
            FrameType::Ping => {
                if stream_id != 0 {
                    return Err(FrameDecodeError::UnexpectedStreamId);
                }
                if payload.len() != 8 {
                    return Err(FrameDecodeError::InvalidLength {
                        typ,
                        length: payload.len(),
                    });
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping {
                    flags: PingFlags::from_bits_truncate(flags),
                    data,
                }
            }
            FrameType::GoAway => {
                if stream_id != 0 {
                    return Err(FrameDecodeError::UnexpectedStreamId);
                }
                if payload.len() < 8 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let mut payload = payload;
                let last_stream = payload.get_u32() & U31_MAX;
                let error = parse_error_code(&payload.split_to(4))?;
                Frame::GoAway {
                    last_stream,
                    error,
                    debug: payload,
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameDecodeError::InvalidLength {
                        typ,
                        length: payload.len(),
                    });
                }
                let raw =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & U31_MAX;
                Frame::WindowUpdate {
                    stream: stream_id,
                    increment: NonZeroU32::new(raw)
                        .ok_or(FrameDecodeError::ZeroWindowIncrement)?,
                }
            }
            FrameType::Continuation => Frame::Continuation {
                stream: stream_id_required(stream_id)?,
                flags: ContinuationFlags::from_bits_truncate(flags),
                fragment: payload,
            },
        };
        Ok(Decoded::Frame(frame))
    }

    /// Serializes the 9-octet header and payload into `buf`.
    pub fn encode(&self, buf: &mut BytesMut, max_frame_size: u32) -> Result<(), FrameEncodeError> {
        match self {
            Frame::Data {
                stream,
                flags,
                data,
            } => {
                let flags = *flags - DataFlags::PADDED;
                frame_header(
                    buf,
                    data.len(),
                    FrameType::Data,
                    flags.bits(),
                    stream.get(),
                    max_frame_size,
                )?;
                buf.extend_from_slice(data);
            }
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                let mut bits = (*flags - HeadersFlags::PADDED).bits();
                let mut length = fragment.len();
                if priority.is_some() {
                    bits |= HeadersFlags::PRIORITY.bits();
                    length += 5;
                }
                frame_header(
                    buf,
                    length,
                    FrameType::Headers,
                    bits,
                    stream.get(),
                    max_frame_size,
                )?;
                if let Some(priority) = priority {
                    put_priority(buf, *priority);
                }
                buf.extend_from_slice(fragment);
            }
            Frame::Priority { stream, priority } => {
                frame_header(buf, 5, FrameType::Priority, 0, stream.get(), max_frame_size)?;
                put_priority(buf, *priority);
            }
            Frame::ResetStream { stream, error } => {
                frame_header(
                    buf,
                    4,
                    FrameType::ResetStream,
                    0,
                    stream.get(),
                    max_frame_size,
                )?;
                buf.put_u32(*error as u32);
            }
            Frame::Settings { flags, params } => {
                frame_header(
                    buf,
                    6 * params.len(),
                    FrameType::Settings,
                    flags.bits(),
                    0,
                    max_frame_size,
                )?;
                for (param, value) in params {
                    buf.put_u16(*param as u16);
                    buf.put_u32(*value);
                }
            }
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                let flags = *flags - PushPromiseFlags::PADDED;
                frame_header(
                    buf,
                    4 + fragment.len(),
                    FrameType::PushPromise,
                    flags.bits(),
                    stream.get(),
                    max_frame_size,
                )?;
                buf.put_u32(promised.get() & U31_MAX);
                buf.extend_from_slice(fragment);
            }
            Frame::Ping { flags, data } => {
                frame_header(buf, 8, FrameType::Ping, flags.bits(), 0, max_frame_size)?;
                buf.extend_from_slice(data);
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => {
                frame_header(
                    buf,
                    8 + debug.len(),
                    FrameType::GoAway,
                    0,
                    0,
                    max_frame_size,
                )?;
                buf.put_u32(last_stream & U31_MAX);
                buf.put_u32(*error as u32);
                buf.extend_from_slice(debug);
            }
            Frame::WindowUpdate { stream, increment } => {
                frame_header(buf, 4, FrameType::WindowUpdate, 0, *stream, max_frame_size)?;
                buf.put_u32(increment.get() & U31_MAX);
            }
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => {
                frame_header(
                    buf,
                    fragment.len(),
                    FrameType::Continuation,
                    flags.bits(),
                    stream.get(),
                    max_frame_size,
                )?;
                buf.extend_from_slice(fragment);
            }
        }
        Ok(())
    }
}

fn frame_header(
    buf: &mut BytesMut,
    length: usize,
    typ: FrameType,
    flags: u8,
    stream_id: StreamId,
    max_frame_size: u32,
) -> Result<(), FrameEncodeError> {
    if length as u64 > u64::from(max_frame_size) {
        return Err(FrameEncodeError::Oversized {
            length,
            max: max_frame_size,
        });
    }
    buf.reserve(9 + length);
    buf.put_uint(length as u64, 3);
    buf.put_u8(typ as u8);
    buf.put_u8(flags);
    buf.put_u32(stream_id & U31_MAX);
    Ok(())
}

fn stream_id_required(stream_id: StreamId) -> Result<NonZeroStreamId, FrameDecodeError> {
    NonZeroStreamId::new(stream_id).ok_or(FrameDecodeError::ZeroStreamId)
}

fn parse_error_code(bytes: &[u8]) -> Result<ErrorCode, FrameDecodeError> {
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    ErrorCode::from_u32(raw).ok_or(FrameDecodeError::UnknownErrorType(raw))
}

fn parse_priority(payload: &mut Bytes) -> Result<Priority, FrameDecodeError> {
    if payload.len() < 5 {
        return Err(FrameDecodeError::PayloadTooShort);
    }
    let raw = payload.get_u32();
    Ok(Priority {
        dependency: raw & U31_MAX,
        exclusive: raw & (1 << 31) != 0,
        weight: payload.get_u8(),
    })
}

fn put_priority(buf: &mut BytesMut, priority: Priority) {
    let mut raw = priority.dependency & U31_MAX;
    if priority.exclusive {
        raw |= 1 << 31;
    }
    buf.put_u32(raw);
    buf.put_u8(priority.weight);
}

fn strip_padding(mut payload: Bytes, padded: bool) -> Result<Bytes, FrameDecodeError> {
    if !padded {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameDecodeError::InvalidPadding);
    }
    let pad_length = payload[0] as usize;
    if pad_length + 1 > payload.len() {
        return Err(FrameDecodeError::InvalidPadding);
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad_length);
    Ok(payload)
}
