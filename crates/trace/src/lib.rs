//! Binary kernel trace records with pluggable backends.
//!
//! Every record carries a sequence number, a record id (see [`records`]), an
//! optional microsecond timestamp and a small payload. Records are framed with
//! HDLC-style byte stuffing and an inverted additive checksum so that a host
//! tool can resynchronise on the `0x7E` flag after a lost byte.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

pub mod predefined;
pub mod records;

pub use predefined::TargetInfo;

/// Largest payload accepted by default.
const DEFAULT_MAX_PAYLOAD: usize = 64;

const FLAG: u8 = 0x7E;
const ESC: u8 = 0x7D;
const ESC_XOR: u8 = 0x20;

/// Tracer configuration.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_payload: usize,
    pub timestamps: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            timestamps: true,
        }
    }
}

/// One emitted record, as handed to the backend before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u8,
    pub id: u8,
    pub timestamp_us: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload of {0} bytes exceeds the configured maximum")]
    PayloadTooLarge(usize),
    #[error("backend i/o failed: {0}")]
    Backend(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Sink for framed records.
pub trait TraceBackend: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError>;
}

/// Writes frames to any [`Write`] implementation.
pub struct WriterBackend<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send + 'static> TraceBackend for WriterBackend<W> {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(frame)?;
        Ok(())
    }
}

/// Keeps every frame in memory. Handy for tests and post-mortem dumps.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all frames written so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Decodes every stored frame, skipping ones that fail to parse.
    pub fn records(&self, with_timestamps: bool) -> Vec<TraceRecord> {
        self.frames()
            .iter()
            .filter_map(|frame| decode_frame(frame, with_timestamps).ok())
            .collect()
    }
}

impl TraceBackend for MemoryBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame.to_vec());
        Ok(())
    }
}

/// Streams frames over a TCP connection.
pub struct TcpBackend {
    stream: Mutex<TcpStream>,
}

impl TcpBackend {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }
}

impl TraceBackend for TcpBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.write_all(frame)?;
        Ok(())
    }
}

/// Sends one datagram per frame.
pub struct UdpBackend {
    socket: UdpSocket,
}

impl UdpBackend {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(Self { socket })
    }
}

impl TraceBackend for UdpBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        self.socket.send(frame)?;
        Ok(())
    }
}

/// Record encoder bound to one backend.
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: TraceConfig,
    seq: u8,
    epoch: Instant,
}

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: TraceConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
            epoch: Instant::now(),
        }
    }

    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    pub fn record(
        &mut self,
        id: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<TraceRecord, TraceError> {
        if payload.len() > self.cfg.max_payload {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }

        let timestamp_us = (self.cfg.timestamps && with_timestamp)
            .then(|| micros(self.epoch.elapsed()));

        self.seq = self.seq.wrapping_add(1);
        let record = TraceRecord {
            seq: self.seq,
            id,
            timestamp_us,
            payload: payload.to_vec(),
        };
        self.backend.write_frame(&encode_frame(&record))?;
        Ok(record)
    }
}

fn micros(elapsed: Duration) -> u32 {
    elapsed.as_micros().min(u32::MAX as u128) as u32
}

/// Shareable handle to a tracer; produces [`TraceHook`]s for the kernel.
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

impl<B: TraceBackend> Clone for TracerHandle<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, id: u8, payload: &[u8], with_timestamp: bool) -> Result<TraceRecord, TraceError> {
        let mut tracer = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        tracer.record(id, payload, with_timestamp)
    }

    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |id, payload, with_timestamp| {
            let mut tracer = inner.lock().unwrap_or_else(|e| e.into_inner());
            tracer.record(id, payload, with_timestamp).map(|_| ())
        })
    }
}

/// Callback the kernel invokes for every record.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

/// Writes frames to stdout; useful during bring-up.
pub fn stdout_backend() -> WriterBackend<io::Stdout> {
    WriterBackend::new(io::stdout())
}

fn push_stuffed(out: &mut Vec<u8>, byte: u8) {
    if byte == FLAG || byte == ESC {
        out.push(ESC);
        out.push(byte ^ ESC_XOR);
    } else {
        out.push(byte);
    }
}

/// Frames a record: stuffed body, stuffed inverted checksum, closing flag.
pub fn encode_frame(record: &TraceRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(record.payload.len() + 10);
    let mut sum: u8 = 0;

    let mut body = Vec::with_capacity(record.payload.len() + 6);
    body.push(record.seq);
    body.push(record.id);
    if let Some(ts) = record.timestamp_us {
        body.extend_from_slice(&ts.to_le_bytes());
    }
    body.extend_from_slice(&record.payload);

    for byte in body {
        sum = sum.wrapping_add(byte);
        push_stuffed(&mut out, byte);
    }
    push_stuffed(&mut out, !sum);
    out.push(FLAG);
    out
}

/// Parses one frame produced by [`encode_frame`].
///
/// The caller states whether the stream carries timestamps; the framing
/// itself does not encode it.
pub fn decode_frame(frame: &[u8], with_timestamps: bool) -> Result<TraceRecord, TraceError> {
    let (last, body) = frame
        .split_last()
        .ok_or(TraceError::Malformed("empty frame"))?;
    if *last != FLAG {
        return Err(TraceError::Malformed("missing closing flag"));
    }

    let mut bytes = Vec::with_capacity(body.len());
    let mut iter = body.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESC {
            let &next = iter.next().ok_or(TraceError::Malformed("dangling escape"))?;
            bytes.push(next ^ ESC_XOR);
        } else {
            bytes.push(byte);
        }
    }

    let (checksum, content) = bytes
        .split_last()
        .ok_or(TraceError::Malformed("missing checksum"))?;
    let sum = content.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if !sum != *checksum {
        return Err(TraceError::Malformed("checksum mismatch"));
    }

    let header = if with_timestamps { 6 } else { 2 };
    if content.len() < header {
        return Err(TraceError::Malformed("truncated header"));
    }
    let timestamp_us = with_timestamps
        .then(|| u32::from_le_bytes([content[2], content[3], content[4], content[5]]));

    Ok(TraceRecord {
        seq: content[0],
        id: content[1],
        timestamp_us,
        payload: content[header..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_escapes_flag_and_escape_bytes() {
        let record = TraceRecord {
            seq: 1,
            id: records::thread::SWITCH,
            timestamp_us: None,
            payload: vec![FLAG, 0x01, ESC],
        };
        let frame = encode_frame(&record);

        assert_eq!(*frame.last().unwrap(), FLAG);
        assert_eq!(frame.iter().filter(|b| **b == FLAG).count(), 1);
        assert_eq!(decode_frame(&frame, false).unwrap(), record);
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let record = TraceRecord {
            seq: 9,
            id: records::sem::RELEASE,
            timestamp_us: Some(1234),
            payload: vec![3, 0],
        };
        let mut frame = encode_frame(&record);
        frame[2] ^= 0x01;

        assert!(matches!(
            decode_frame(&frame, true),
            Err(TraceError::Malformed("checksum mismatch"))
        ));
    }

    #[test]
    fn hook_feeds_memory_backend() {
        let backend = MemoryBackend::new();
        let tracer = Tracer::new(TraceConfig::default(), backend.clone()).into_handle();
        let hook = tracer.hook();

        hook(records::kernel::START, &[1, 2], false).unwrap();
        hook(records::thread::EXIT, &[7], true).unwrap();

        let frames = backend.frames();
        assert_eq!(frames.len(), 2);
        let first = decode_frame(&frames[0], false).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.id, records::kernel::START);
        assert_eq!(first.payload, vec![1, 2]);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let cfg = TraceConfig {
            max_payload: 4,
            timestamps: false,
        };
        let mut tracer = Tracer::new(cfg, MemoryBackend::new());
        assert!(matches!(
            tracer.record(records::kernel::TICK, &[0; 5], false),
            Err(TraceError::PayloadTooLarge(5))
        ));
    }

    #[test]
    fn udp_backend_sends_one_datagram_per_record() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let backend = UdpBackend::connect(receiver.local_addr().unwrap()).unwrap();
        let hook = Tracer::new(TraceConfig::default(), backend).into_handle().hook();

        hook(records::sem::RELEASE, &[3, 0], true).unwrap();
        hook(records::sem::ACQUIRE, &[3, 0], true).unwrap();

        let mut buf = [0u8; 128];
        let mut seen = Vec::new();
        for _ in 0..2 {
            let len = receiver.recv(&mut buf).unwrap();
            seen.push(decode_frame(&buf[..len], true).unwrap());
        }
        assert_eq!(seen[0].id, records::sem::RELEASE);
        assert_eq!(seen[1].id, records::sem::ACQUIRE);
        assert_eq!(seen[1].seq, seen[0].seq.wrapping_add(1));
        assert_eq!(seen[0].payload, vec![3, 0]);
    }

    #[test]
    fn tcp_backend_streams_frames_in_order() {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = TcpBackend::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        {
            let hook = Tracer::new(TraceConfig::default(), backend).into_handle().hook();
            hook(records::kernel::START, &[2, 0], false).unwrap();
            hook(records::thread::SWITCH, &[FLAG, ESC], false).unwrap();
        }

        let mut stream = Vec::new();
        peer.read_to_end(&mut stream).unwrap();
        let frames: Vec<TraceRecord> = stream
            .split_inclusive(|b| *b == FLAG)
            .map(|frame| decode_frame(frame, false).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, records::kernel::START);
        assert_eq!(frames[1].payload, vec![FLAG, ESC]);
    }

    #[test]
    fn writer_backend_reports_write_failures() {
        struct Broken;

        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut tracer = Tracer::new(TraceConfig::default(), WriterBackend::new(Broken));
        assert!(matches!(
            tracer.record(records::kernel::TICK, &[1, 0, 0, 0], false),
            Err(TraceError::Backend(_))
        ));

        let mut console = Tracer::new(TraceConfig::default(), stdout_backend());
        assert!(console.record(records::kernel::IDLE, &[], false).is_ok());
    }
}
