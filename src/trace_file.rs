use std::io::{self, Cursor, Read};

use byteorder::{ByteOrder, ReadBytesExt};
use log::{debug, warn};

use crate::event::{
    CommEvent, Event, LostEvent, MmapEvent, ProcessEvent, SampleEvent, ThrottleEvent, UnknownEvent,
};

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_READ: u32 = 8;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// b"MiniPerf" for little-endian files, byte-swapped for big-endian.
pub const MAGIC_LE: &[u8; 8] = b"MiniPerf";
pub const MAGIC_BE: &[u8; 8] = b"frePiniM";

/// Returns true if `prefix` starts with either admissible magic value.
pub fn is_trace_file(prefix: &[u8]) -> bool {
    prefix.len() >= 8 && (&prefix[..8] == MAGIC_LE || &prefix[..8] == MAGIC_BE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    LittleEndian,
    BigEndian,
}

/// The error type for the binary trace stream itself. Errors inside a
/// single record body are downgraded to warnings instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read trace data: {0}")]
    Io(#[from] io::Error),

    #[error("did not recognize magic value {0:?}")]
    UnrecognizedMagicValue([u8; 8]),

    #[error("MiniPerf file is from the future?")]
    ReservedBytesNotZero,

    #[error("record size {0} is smaller than the record header")]
    BadRecordSize(u16),
}

#[derive(thiserror::Error, Debug)]
enum RecordError {
    #[error("truncated record body: {0}")]
    Truncated(#[from] io::Error),

    #[error("callchain length {0} exceeds the record body")]
    CallchainTooLong(u64),
}

/// Streaming decoder for the binary trace format: a 24-byte preamble
/// (magic, reserved zeros, sample-format bitmask) followed by records with
/// an 8-byte header. The bitmask decides which fields sample records carry.
pub struct TraceReader<R: Read> {
    input: R,
    endian: Endianness,
    sample_type: u64,
}

impl<R: Read> TraceReader<R> {
    pub fn new(mut input: R) -> Result<Self, Error> {
        let mut preamble = [0u8; 24];
        input.read_exact(&mut preamble)?;
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&preamble[..8]);
        let endian = if &magic == MAGIC_LE {
            Endianness::LittleEndian
        } else if &magic == MAGIC_BE {
            Endianness::BigEndian
        } else {
            return Err(Error::UnrecognizedMagicValue(magic));
        };
        if preamble[8..16] != [0u8; 8] {
            return Err(Error::ReservedBytesNotZero);
        }
        let sample_type = match endian {
            Endianness::LittleEndian => byteorder::LittleEndian::read_u64(&preamble[16..24]),
            Endianness::BigEndian => byteorder::BigEndian::read_u64(&preamble[16..24]),
        };
        Ok(TraceReader {
            input,
            endian,
            sample_type,
        })
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn sample_type(&self) -> u64 {
        self.sample_type
    }

    /// Decode the next record, or `None` at a clean end of stream. A record
    /// whose body can't be decoded is reported and returned as `Unknown`;
    /// the stream stays aligned because the header carries the full size.
    pub fn next_event(&mut self) -> Result<Option<Event>, Error> {
        let mut header = [0u8; 8];
        if !read_full(&mut self.input, &mut header)? {
            return Ok(None);
        }
        let (kind, _misc, size) = match self.endian {
            Endianness::LittleEndian => parse_header::<byteorder::LittleEndian>(&header),
            Endianness::BigEndian => parse_header::<byteorder::BigEndian>(&header),
        };
        if (size as usize) < header.len() {
            return Err(Error::BadRecordSize(size));
        }
        let mut body = vec![0u8; size as usize - header.len()];
        self.input.read_exact(&mut body)?;
        let parsed = match self.endian {
            Endianness::LittleEndian => {
                parse_record::<byteorder::LittleEndian>(kind, &body, self.sample_type)
            }
            Endianness::BigEndian => {
                parse_record::<byteorder::BigEndian>(kind, &body, self.sample_type)
            }
        };
        let event = parsed.unwrap_or_else(|e| {
            warn!("undecodable {} record: {e}", kind_label(kind));
            Event::Unknown(UnknownEvent {
                kind: kind_label(kind),
            })
        });
        Ok(Some(event))
    }
}

fn parse_header<T: ByteOrder>(header: &[u8; 8]) -> (u32, u16, u16) {
    (
        T::read_u32(&header[0..4]),
        T::read_u16(&header[4..6]),
        T::read_u16(&header[6..8]),
    )
}

fn kind_label(kind: u32) -> String {
    match kind {
        PERF_RECORD_MMAP => "MMAP".into(),
        PERF_RECORD_LOST => "LOST".into(),
        PERF_RECORD_COMM => "COMM".into(),
        PERF_RECORD_EXIT => "EXIT".into(),
        PERF_RECORD_THROTTLE => "THROTTLE".into(),
        PERF_RECORD_UNTHROTTLE => "UNTHROTTLE".into(),
        PERF_RECORD_FORK => "FORK".into(),
        PERF_RECORD_READ => "READ".into(),
        PERF_RECORD_SAMPLE => "SAMPLE".into(),
        other => other.to_string(),
    }
}

/// Decode one record body. Non-sample records may carry a trailing
/// per-record sample-id block; it is ignored, since the header size already
/// bounds the body.
fn parse_record<T: ByteOrder>(kind: u32, body: &[u8], sample_type: u64) -> Result<Event, RecordError> {
    let mut cur = Cursor::new(body);
    let event = match kind {
        PERF_RECORD_MMAP => {
            let pid = cur.read_u32::<T>()? as i32;
            let tid = cur.read_u32::<T>()? as i32;
            let address = cur.read_u64::<T>()?;
            let length = cur.read_u64::<T>()?;
            let offset = cur.read_u64::<T>()?;
            let filename = padded_string(body, cur.position() as usize)?;
            Event::Mmap(MmapEvent {
                pid,
                tid,
                address,
                length,
                offset,
                filename,
            })
        }

        PERF_RECORD_LOST => {
            let id = cur.read_u64::<T>()?;
            let count = cur.read_u64::<T>()?;
            Event::Lost(LostEvent { id, count })
        }

        PERF_RECORD_COMM => {
            let _pid = cur.read_u32::<T>()?;
            let tid = cur.read_u32::<T>()? as i32;
            let name = padded_string(body, cur.position() as usize)?;
            Event::Comm(CommEvent { tid, name })
        }

        PERF_RECORD_EXIT | PERF_RECORD_FORK => {
            let pid = cur.read_u32::<T>()? as i32;
            let ppid = cur.read_u32::<T>()? as i32;
            let tid = cur.read_u32::<T>()? as i32;
            let ptid = cur.read_u32::<T>()? as i32;
            let time = cur.read_u64::<T>()?;
            let event = ProcessEvent {
                pid,
                ppid,
                tid,
                ptid,
                time,
            };
            if kind == PERF_RECORD_EXIT {
                Event::Exit(event)
            } else {
                Event::Fork(event)
            }
        }

        PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
            let time = cur.read_u64::<T>()?;
            let id = cur.read_u64::<T>()?;
            let stream_id = cur.read_u64::<T>()?;
            let event = ThrottleEvent {
                time,
                id,
                stream_id,
            };
            if kind == PERF_RECORD_THROTTLE {
                Event::Throttle(event)
            } else {
                Event::Unthrottle(event)
            }
        }

        PERF_RECORD_SAMPLE => parse_sample::<T>(body, sample_type)?,

        PERF_RECORD_READ => {
            debug!("skipping READ record");
            Event::Unknown(UnknownEvent {
                kind: kind_label(kind),
            })
        }

        other => {
            warn!("unknown trace record type {other}");
            Event::Unknown(UnknownEvent {
                kind: kind_label(other),
            })
        }
    };
    Ok(event)
}

fn parse_sample<T: ByteOrder>(body: &[u8], sample_type: u64) -> Result<Event, RecordError> {
    let mut cur = Cursor::new(body);

    let mut ip = None;
    if sample_type & PERF_SAMPLE_IP != 0 {
        ip = Some(cur.read_u64::<T>()?);
    }

    let (mut pid, mut tid) = (None, None);
    if sample_type & PERF_SAMPLE_TID != 0 {
        pid = Some(cur.read_u32::<T>()? as i32);
        tid = Some(cur.read_u32::<T>()? as i32);
    }

    let mut time = None;
    if sample_type & PERF_SAMPLE_TIME != 0 {
        time = Some(cur.read_u64::<T>()?);
    }

    if sample_type & PERF_SAMPLE_ADDR != 0 {
        let _addr = cur.read_u64::<T>()?;
    }

    if sample_type & PERF_SAMPLE_ID != 0 {
        let _id = cur.read_u64::<T>()?;
    }

    if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
        let _stream_id = cur.read_u64::<T>()?;
    }

    let mut cpu = None;
    if sample_type & PERF_SAMPLE_CPU != 0 {
        cpu = Some(cur.read_u32::<T>()?);
        let _ = cur.read_u32::<T>()?; // reserved, always zero
    }

    if sample_type & PERF_SAMPLE_PERIOD != 0 {
        let _period = cur.read_u64::<T>()?;
    }

    let mut callchain = Vec::new();
    if sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
        let nr = cur.read_u64::<T>()?;
        let remaining = (body.len() as u64).saturating_sub(cur.position()) / 8;
        if nr > remaining {
            return Err(RecordError::CallchainTooLong(nr));
        }
        callchain.reserve(nr as usize);
        for _ in 0..nr {
            callchain.push(cur.read_u64::<T>()?);
        }
    }

    Ok(Event::Sample(SampleEvent {
        cpu,
        time,
        pid,
        tid,
        ip,
        callchain,
    }))
}

/// Read a NUL-terminated string field that is padded to 8-byte alignment.
fn padded_string(body: &[u8], pos: usize) -> Result<String, RecordError> {
    let rest = body.get(pos..).ok_or_else(|| {
        RecordError::Truncated(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "string field starts past the record end",
        ))
    })?;
    let len = memchr::memchr(0, rest).unwrap_or(rest.len());
    Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
}

/// Fill `buf` completely. Returns false (instead of an error) when the
/// stream ends exactly on a record boundary.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
