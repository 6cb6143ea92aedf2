//! Text line codec, stream sources and decision publishers.
//!
//! Sensor lines look like `imu lwx lwy ... raz gt` (space separated, topic first);
//! decisions go out as `ps 0.500000`.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame_decoder::{DecoderStats, FrameDecoder};
use crate::sample_queue::SampleProducer;
use crate::schema::ChannelLayout;
use crate::shutdown::Shutdown;
use crate::types::{Decision, RawSample};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Expected {expected} fields after the topic, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),

    #[error("Could not resolve address '{0}'")]
    Address(String),

    #[error("Decision receiver disconnected")]
    Disconnected,
}

/// Parses one sensor line. Lines for other topics (and blank lines) yield `None`.
///
/// A line matches when its first token starts with `topic`, so `imu` also receives
/// `imu2`.
pub fn parse_sample_line(
    line: &str,
    topic: &str,
    layout: &ChannelLayout,
) -> Result<Option<RawSample>, TransportError> {
    let mut fields = line.split_whitespace();
    let Some(head) = fields.next() else {
        return Ok(None);
    };
    if !head.starts_with(topic) {
        return Ok(None);
    }

    let mut values = fields
        .map(|f| {
            f.parse::<f64>()
                .map_err(|_| TransportError::InvalidNumber(f.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let expected = layout.len() + usize::from(layout.has_label);
    if values.len() != expected {
        return Err(TransportError::FieldCount {
            expected,
            actual: values.len(),
        });
    }

    let sample = if layout.has_label {
        let label = values.pop().unwrap_or_default();
        RawSample::with_label(values, label)
    } else {
        RawSample::new(values)
    };
    Ok(Some(sample))
}

pub fn format_decision(topic: &str, decision: Decision) -> String {
    format!("{} {:.6}", topic, decision.severity())
}

/// Downstream consumer of published decisions
pub trait DecisionSink: Send {
    fn publish(&mut self, decision: Decision) -> Result<(), TransportError>;
}

/// Writes one line per decision, flushing each time
pub struct LineSink<W: Write + Send> {
    writer: W,
    topic: String,
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(writer: W, topic: impl Into<String>) -> Self {
        Self {
            writer,
            topic: topic.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> DecisionSink for LineSink<W> {
    fn publish(&mut self, decision: Decision) -> Result<(), TransportError> {
        writeln!(self.writer, "{}", format_decision(&self.topic, decision))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Hands formatted lines to another thread
pub struct ChannelSink {
    tx: Sender<String>,
    topic: String,
}

pub fn channel_sink(topic: impl Into<String>) -> (ChannelSink, Receiver<String>) {
    let (tx, rx) = unbounded();
    (
        ChannelSink {
            tx,
            topic: topic.into(),
        },
        rx,
    )
}

impl DecisionSink for ChannelSink {
    fn publish(&mut self, decision: Decision) -> Result<(), TransportError> {
        self.tx
            .send(format_decision(&self.topic, decision))
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Binds the prediction endpoint and fans each decision out to every connected
/// subscriber.
///
/// Subscriber sockets are non-blocking, so `publish` never waits on a peer. A
/// subscriber whose send buffer cannot take a whole line, or whose write fails, is
/// dropped; a half-written line would corrupt its stream anyway.
pub struct TcpBroadcastSink {
    listener: TcpListener,
    clients: Vec<TcpStream>,
    topic: String,
}

impl TcpBroadcastSink {
    pub fn bind(addr: impl ToSocketAddrs, topic: impl Into<String>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "publishing decisions");
        Ok(Self {
            listener,
            clients: Vec::new(),
            topic: topic.into(),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn accept_pending(&mut self) -> Result<(), TransportError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    info!(%peer, "subscriber connected");
                    self.clients.push(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl DecisionSink for TcpBroadcastSink {
    fn publish(&mut self, decision: Decision) -> Result<(), TransportError> {
        self.accept_pending()?;
        let line = format_decision(&self.topic, decision) + "\n";
        self.clients.retain_mut(|client| match client.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                warn!("subscriber is not reading, dropping it");
                false
            }
            Err(e) => {
                debug!(error = %e, "dropping subscriber");
                false
            }
        });
        Ok(())
    }
}

/// Connects to a data endpoint with a read timeout so readers can poll for shutdown
pub fn connect(addr: &str, read_timeout: Duration) -> Result<TcpStream, TransportError> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Address(addr.to_string()))?;
    let stream = TcpStream::connect_timeout(&target, Duration::from_secs(5))?;
    stream.set_read_timeout(Some(read_timeout))?;
    info!(%addr, "connected to sensor stream");
    Ok(stream)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineStats {
    pub lines: u64,
    pub samples: u64,
    pub ignored: u64,
    pub malformed: u64,
}

/// Widest text rendering of one numeric field that a sensor is expected to send
const MAX_FIELD_CHARS: usize = 32;

/// Longest pending line kept while waiting for its newline, a few times the widest
/// valid line for `layout`
fn line_limit(topic: &str, layout: &ChannelLayout) -> usize {
    let fields = layout.len() + usize::from(layout.has_label);
    4 * (topic.len() + fields * (MAX_FIELD_CHARS + 1) + 1)
}

/// Reads sensor lines until end of stream, shutdown, or the consumer going away.
///
/// A read timeout only interrupts the wait; a partially received line is kept and
/// completed by the next read. A line that grows past [`line_limit`] without a
/// newline is counted as malformed and skipped up to the next newline.
pub fn pump_lines<R: BufRead>(
    mut reader: R,
    topic: &str,
    layout: &ChannelLayout,
    producer: &SampleProducer,
    shutdown: &Shutdown,
) -> Result<LineStats, TransportError> {
    let limit = line_limit(topic, layout);
    let mut stats = LineStats::default();
    let mut buf = Vec::new();
    let mut skipping = false;

    while !shutdown.is_triggered() {
        let budget = (limit + 1).saturating_sub(buf.len()) as u64;
        match reader.by_ref().take(budget).read_until(b'\n', &mut buf) {
            Ok(0) => {
                if !buf.is_empty() && !skipping {
                    ingest_line(&buf, topic, layout, producer, &mut stats);
                }
                info!(?stats, "sensor stream ended");
                return Ok(stats);
            }
            Ok(_) if buf.last() != Some(&b'\n') => {
                if buf.len() > limit {
                    if !skipping {
                        stats.lines += 1;
                        stats.malformed += 1;
                        warn!(limit, "dropping oversized sensor line");
                        skipping = true;
                    }
                    buf.clear();
                }
            }
            Ok(_) if skipping => {
                buf.clear();
                skipping = false;
            }
            Ok(_) => {
                let delivered = ingest_line(&buf, topic, layout, producer, &mut stats);
                buf.clear();
                if !delivered {
                    break;
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stats)
}

/// Returns `false` once the consumer is gone
fn ingest_line(
    raw: &[u8],
    topic: &str,
    layout: &ChannelLayout,
    producer: &SampleProducer,
    stats: &mut LineStats,
) -> bool {
    stats.lines += 1;
    let line = String::from_utf8_lossy(raw);
    match parse_sample_line(line.trim_end(), topic, layout) {
        Ok(Some(sample)) => {
            stats.samples += 1;
            producer.push(sample)
        }
        Ok(None) => {
            stats.ignored += 1;
            true
        }
        Err(e) => {
            stats.malformed += 1;
            warn!(error = %e, "dropping malformed sensor line");
            true
        }
    }
}

/// Feeds a raw frame stream through `decoder` until end of stream or shutdown
pub fn pump_frames<R: Read>(
    mut reader: R,
    decoder: &mut FrameDecoder,
    producer: &SampleProducer,
    shutdown: &Shutdown,
) -> Result<DecoderStats, TransportError> {
    let mut chunk = [0u8; 1024];

    while !shutdown.is_triggered() {
        match reader.read(&mut chunk) {
            Ok(0) => {
                info!(stats = ?decoder.stats(), "frame stream ended");
                break;
            }
            Ok(n) => {
                if !producer.push_all(decoder.feed(&chunk[..n])) {
                    break;
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(decoder.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_decoder::encode_frame;
    use crate::sample_queue::sample_queue;
    use std::io::{BufReader, Cursor};

    fn three_channels(has_label: bool) -> ChannelLayout {
        ChannelLayout {
            channels: vec!["x".into(), "y".into(), "z".into()],
            has_label,
        }
    }

    #[test]
    fn parses_labelled_line() {
        let layout = ChannelLayout::dual_foot();
        let line = "imu 1 2 3 4 5 6 7 8 9 10 11 12.5 2";
        let sample = parse_sample_line(line, "imu", &layout).unwrap().unwrap();
        assert_eq!(sample.len(), 12);
        assert_eq!(sample.get(11), Some(12.5));
        assert_eq!(sample.label(), Some(2.0));
    }

    #[test]
    fn topic_filter_is_a_prefix_match() {
        let layout = three_channels(false);
        assert!(parse_sample_line("ps 1 2 3", "imu", &layout).unwrap().is_none());
        assert!(parse_sample_line("", "imu", &layout).unwrap().is_none());
        let sample = parse_sample_line("imu2 1 2 3", "imu", &layout).unwrap().unwrap();
        assert_eq!(sample.values(), &[1.0, 2.0, 3.0]);
        assert_eq!(sample.label(), None);
    }

    #[test]
    fn malformed_lines_are_errors() {
        let layout = three_channels(true);
        assert!(matches!(
            parse_sample_line("imu 1 2 3", "imu", &layout),
            Err(TransportError::FieldCount { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            parse_sample_line("imu 1 2 x 0", "imu", &layout),
            Err(TransportError::InvalidNumber(f)) if f == "x"
        ));
    }

    #[test]
    fn decision_wire_format() {
        assert_eq!(format_decision("ps", Decision::Walk), "ps 0.000000");
        assert_eq!(format_decision("ps", Decision::PreFog), "ps 0.500000");
        assert_eq!(format_decision("ps", Decision::Fog), "ps 1.000000");

        let mut sink = LineSink::new(Vec::new(), "ps");
        sink.publish(Decision::Fog).unwrap();
        sink.publish(Decision::Walk).unwrap();
        assert_eq!(sink.into_inner(), b"ps 1.000000\nps 0.000000\n");
    }

    #[test]
    fn channel_sink_reports_disconnect() {
        let (mut sink, rx) = channel_sink("ps");
        sink.publish(Decision::PreFog).unwrap();
        assert_eq!(rx.recv().unwrap(), "ps 0.500000");
        drop(rx);
        assert!(matches!(
            sink.publish(Decision::Walk),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn pump_lines_skips_bad_input_and_handles_unterminated_tail() {
        let input = "imu 1 2 3\nps 0.5\nimu 1 2\nimu 4 5 6\nimu 7 8 9";
        let (tx, rx) = sample_queue();
        let stats = pump_lines(
            BufReader::new(Cursor::new(input)),
            "imu",
            &three_channels(false),
            &tx,
            &Shutdown::new(),
        )
        .unwrap();

        assert_eq!(
            stats,
            LineStats {
                lines: 5,
                samples: 3,
                ignored: 1,
                malformed: 1
            }
        );
        let firsts: Vec<f64> = std::iter::from_fn(|| rx.try_pop())
            .map(|s| s.values()[0])
            .collect();
        assert_eq!(firsts, vec![1.0, 4.0, 7.0]);
    }

    #[test]
    fn oversized_line_is_dropped_and_stream_resyncs() {
        let layout = three_channels(false);
        let flood = "9".repeat(10 * line_limit("imu", &layout));
        let input = format!("imu 1 {flood} 3\nimu 4 5 6\nimu {flood}");
        let (tx, rx) = sample_queue();
        // A small buffer so the flood arrives over many reads.
        let reader = BufReader::with_capacity(64, Cursor::new(input));
        let stats = pump_lines(reader, "imu", &layout, &tx, &Shutdown::new()).unwrap();

        assert_eq!(
            stats,
            LineStats {
                lines: 3,
                samples: 1,
                ignored: 0,
                malformed: 2
            }
        );
        assert_eq!(rx.try_pop().unwrap().values(), &[4.0, 5.0, 6.0]);
        assert!(rx.is_empty());
    }

    #[test]
    fn pump_lines_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let (tx, rx) = sample_queue();
        let stats = pump_lines(
            Cursor::new("imu 1 2 3\n"),
            "imu",
            &three_channels(false),
            &tx,
            &shutdown,
        )
        .unwrap();
        assert_eq!(stats.lines, 0);
        assert!(rx.is_empty());
    }

    #[test]
    fn pump_frames_decodes_stream() {
        let mut bytes = vec![0x00, 0x13, 0x37];
        for i in 0..4 {
            bytes.extend(encode_frame(&[i as f32; 9]));
        }
        let (tx, rx) = sample_queue();
        let mut decoder = FrameDecoder::new();
        let stats = pump_frames(Cursor::new(bytes), &mut decoder, &tx, &Shutdown::new()).unwrap();

        assert_eq!(stats.frames_decoded, 4);
        assert_eq!(rx.len(), 4);
        assert_eq!(rx.try_pop().unwrap().get(8), Some(0.0));
        assert_eq!(rx.try_pop().unwrap().get(0), Some(1.0));
    }

    #[test]
    fn tcp_broadcast_reaches_subscribers() {
        let mut sink = TcpBroadcastSink::bind("127.0.0.1:0", "ps").unwrap();
        let addr = sink.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // The connection may still be in the accept backlog on the first attempts.
        for _ in 0..50 {
            if sink.client_count() > 0 {
                break;
            }
            sink.accept_pending().unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        sink.publish(Decision::Fog).unwrap();

        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).unwrap();
        assert_eq!(line, "ps 1.000000\n");
    }

    #[test]
    fn subscriber_that_never_reads_is_dropped_without_blocking() {
        // Long lines fill the socket buffers after a few thousand decisions.
        let mut sink = TcpBroadcastSink::bind("127.0.0.1:0", "ps".repeat(2048)).unwrap();
        let addr = sink.local_addr().unwrap();
        let _stalled = TcpStream::connect(addr).unwrap();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let mut accepted = false;
            let mut published = 0u32;
            while published < 200_000 {
                sink.publish(Decision::Fog).unwrap();
                published += 1;
                accepted |= sink.client_count() > 0;
                if accepted && sink.client_count() == 0 {
                    break;
                }
                if !accepted {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            let _ = done_tx.send((accepted, sink.client_count(), published));
        });

        let (accepted, clients, published) = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("publish blocked on a subscriber that does not read");
        assert!(accepted);
        assert_eq!(clients, 0);
        assert!(published < 200_000);
    }
}
