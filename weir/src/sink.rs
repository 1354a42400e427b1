//! Dispatch sinks for flushed samples.
//!
//! The flush cycle hands each pass's samples to a [`Sink`]. Two are
//! provided: a JSON-lines writer for local consumption and an
//! influx-style UDP forwarder that packs text lines into bounded
//! datagrams. Delivery is best-effort; the transport is lossy by design.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use serde::Deserialize;
use tracing::warn;

use crate::sample::{Sample, SampleValue};

/// Default datagram budget for the UDP sink, a conservative
/// under-the-MTU payload size.
const DEFAULT_PACKET_BYTES: usize = 1452;

/// Errors produced by sinks.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Sample serialization failed.
    #[error("Failed to serialize sample: {0}")]
    Json(#[from] serde_json::Error),
    /// The downstream address did not resolve to any socket address.
    #[error("Failed to resolve sink address {addr}")]
    Resolve {
        /// Configured downstream address
        addr: String,
    },
    /// The configured packet size was outside `1024..=65535`.
    #[error("Packet size must be between 1024 and 65535 bytes: {0}")]
    PacketSizeOutOfRange(usize),
}

/// Destination for flushed samples.
///
/// `dispatch` is called once per sample in flush order; `flush` is called
/// once at the end of every pass and on shutdown, releasing anything the
/// sink buffered.
pub trait Sink {
    /// Accept one sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample could not be serialized or queued.
    fn dispatch(&mut self, sample: &Sample) -> Result<(), Error>;

    /// Release buffered samples downstream.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport failed; the buffered
    /// batch is dropped either way.
    fn flush(&mut self) -> Result<(), Error>;
}

/// In-memory sink collecting every sample, used by tests and embedders
/// that want the raw tuples.
impl Sink for Vec<Sample> {
    fn dispatch(&mut self, sample: &Sample) -> Result<(), Error> {
        self.push(sample.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Sink writing one JSON object per sample to a writer.
#[derive(Debug)]
pub struct Json<W: Write> {
    writer: W,
}

impl<W: Write> Json<W> {
    /// Create a new [`Json`] sink over `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// The wrapped writer, consuming the sink.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for Json<W> {
    fn dispatch(&mut self, sample: &Sample) -> Result<(), Error> {
        serde_json::to_writer(&mut self.writer, sample)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

fn default_max_packet_bytes() -> usize {
    DEFAULT_PACKET_BYTES
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`InfluxUdp`].
pub struct InfluxUdpConfig {
    /// Downstream address, host plus port.
    pub addr: String,
    /// Datagram payload budget in bytes, `1024..=65535`.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
}

impl InfluxUdpConfig {
    /// Check the packet size bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PacketSizeOutOfRange`] when the budget is outside
    /// `1024..=65535`.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1024..=65535).contains(&self.max_packet_bytes) {
            return Err(Error::PacketSizeOutOfRange(self.max_packet_bytes));
        }
        Ok(())
    }
}

/// Escape measurement-name characters that delimit the line protocol.
fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Sink batching samples into influx-style text lines over UDP.
///
/// Lines accumulate in a send buffer; the buffer goes out whenever the
/// next line would not fit and at the end of every pass. No-data samples
/// are skipped entirely -- NaN has no wire representation downstream --
/// and a single line larger than the packet budget is dropped with a
/// diagnostic.
#[derive(Debug)]
pub struct InfluxUdp {
    socket: UdpSocket,
    buffer: Vec<u8>,
    max_packet_bytes: usize,
}

impl InfluxUdp {
    /// Create a new [`InfluxUdp`] sink.
    ///
    /// # Errors
    ///
    /// Function will return an error if the downstream address does not
    /// resolve or the local socket cannot be created.
    pub fn new(config: &InfluxUdpConfig) -> Result<Self, Error> {
        config.validate()?;
        let target: SocketAddr = config
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Resolve {
                addr: config.addr.clone(),
            })?;
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(target)?;
        Ok(Self {
            socket,
            buffer: Vec::with_capacity(config.max_packet_bytes),
            max_packet_bytes: config.max_packet_bytes,
        })
    }

    fn render(sample: &Sample) -> String {
        let mut line = String::new();
        let _ = write!(
            line,
            "{name},kind={kind} value=",
            name = escape_name(&sample.name),
            kind = sample.kind.as_str()
        );
        match sample.value {
            SampleValue::Int(int) => {
                let _ = write!(line, "{int}i");
            }
            SampleValue::Float(float) => {
                let _ = write!(line, "{float}");
            }
        }
        let _ = write!(line, " {time}\n", time = sample.time);
        line
    }

    fn send_buffer(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.socket.send(&self.buffer);
        // The batch is gone either way; a datagram transport does not
        // retry.
        self.buffer.clear();
        result?;
        Ok(())
    }
}

impl Sink for InfluxUdp {
    fn dispatch(&mut self, sample: &Sample) -> Result<(), Error> {
        if sample.value.is_no_data() {
            return Ok(());
        }
        let line = Self::render(sample);
        if line.len() > self.max_packet_bytes {
            warn!(
                name = %sample.name,
                bytes = line.len(),
                budget = self.max_packet_bytes,
                "dropping sample larger than the packet budget"
            );
            return Ok(());
        }
        if self.buffer.len() + line.len() > self.max_packet_bytes {
            self.send_buffer()?;
        }
        self.buffer.extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.send_buffer()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Server`].
pub enum Config {
    /// Write JSON lines to standard output.
    Console,
    /// See [`InfluxUdpConfig`] for details.
    InfluxUdp(InfluxUdpConfig),
}

impl Default for Config {
    fn default() -> Self {
        Self::Console
    }
}

impl Config {
    /// Check sink-specific bounds without constructing the sink.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range packet budget.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Config::Console => Ok(()),
            Config::InfluxUdp(config) => config.validate(),
        }
    }
}

#[derive(Debug)]
/// The configured sink.
///
/// All sinks supported by weir are a variant of this enum.
pub enum Server {
    /// See [`Json`] for details.
    Console(Json<io::Stdout>),
    /// See [`InfluxUdp`] for details.
    InfluxUdp(InfluxUdp),
}

impl Server {
    /// Create a new [`Server`], deferring to the underlying sink.
    ///
    /// # Errors
    ///
    /// Function will return an error if the underlying sink creation
    /// signals error.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let server = match config {
            Config::Console => Self::Console(Json::new(io::stdout())),
            Config::InfluxUdp(config) => Self::InfluxUdp(InfluxUdp::new(config)?),
        };
        Ok(server)
    }
}

impl Sink for Server {
    fn dispatch(&mut self, sample: &Sample) -> Result<(), Error> {
        match self {
            Server::Console(inner) => inner.dispatch(sample),
            Server::InfluxUdp(inner) => inner.dispatch(sample),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        match self {
            Server::Console(inner) => inner.flush(),
            Server::InfluxUdp(inner) => inner.flush(),
        }
    }
}
