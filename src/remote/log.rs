//! Streaming client for the WAL durability service.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::wire::{LogRequest, LogResponse};
use super::LogService;
use crate::types::{Lsn, NimbusError, Result, ServiceKind, TimelineId, WalRecord};

struct Stream {
    reader: BufReader<TcpStream>,
}

/// One persistent connection to the log service.
///
/// The connection state is binary. A failed exchange disconnects the client.
/// Idempotent requests reconnect once and retry within the same call; an
/// append whose acknowledgment is lost fails, and the next call reconnects.
pub struct LogClient {
    addr: String,
    timeout: Duration,
    stream: Option<Stream>,
}

impl LogClient {
    /// Creates a client without connecting.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: None,
        }
    }

    /// Creates a client and connects it.
    pub fn connect_to(addr: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut client = Self::new(addr, timeout);
        client.connect()?;
        Ok(client)
    }

    /// Opens the stream if it is not open already.
    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_none() {
            let stream = open_stream(&self.addr, self.timeout)?;
            debug!(addr = %self.addr, "log.connect");
            self.stream = Some(Stream {
                reader: BufReader::new(stream),
            });
        }
        Ok(())
    }

    /// Closes the stream.
    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    /// Whether the stream is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Points the client at another service instance; takes effect on reconnect.
    pub fn set_server_address(&mut self, addr: impl Into<String>) {
        self.addr = addr.into();
        self.disconnect();
    }

    /// Alias of [`LogService::timeline_status`].
    pub fn get_timeline_status(&mut self, timeline: TimelineId) -> Result<Lsn> {
        self.timeline_status(timeline)
    }

    fn exchange(&mut self, request: &LogRequest) -> Result<LogResponse> {
        let line = request.to_line()?;
        match self.try_exchange(&line) {
            // The service may already hold the record, so an append is never re-sent.
            Err(NimbusError::Io(err)) if !matches!(request, LogRequest::Append { .. }) => {
                debug!(addr = %self.addr, error = %err, "log.exchange.reconnect");
                self.disconnect();
                self.try_exchange(&line)
            }
            other => other,
        }
    }

    fn try_exchange(&mut self, line: &[u8]) -> Result<LogResponse> {
        self.connect()?;
        let result = match self.stream.as_mut() {
            Some(stream) => Self::send_and_receive(stream, line),
            None => Err(NimbusError::Disconnected(ServiceKind::Log)),
        };
        if matches!(result, Err(NimbusError::Io(_)) | Err(NimbusError::Protocol(_))) {
            self.disconnect();
        }
        result
    }

    fn send_and_receive(stream: &mut Stream, line: &[u8]) -> Result<LogResponse> {
        let socket = stream.reader.get_mut();
        socket.write_all(line)?;
        socket.flush()?;
        let mut reply = String::new();
        if stream.reader.read_line(&mut reply)? == 0 {
            return Err(NimbusError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "log service closed the stream",
            )));
        }
        LogResponse::from_line(&reply)
    }

    fn expect_ok(response: LogResponse) -> Result<Option<u64>> {
        match response {
            LogResponse::Ok { committed_lsn } => Ok(committed_lsn),
            LogResponse::Error { code, message } => Err(NimbusError::Remote {
                kind: ServiceKind::Log,
                status: code,
                message,
            }),
        }
    }
}

/// Opens a TCP stream with connect, read and write timeouts applied.
fn open_stream(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.map(NimbusError::Io).unwrap_or_else(|| {
        NimbusError::InvalidOwned(format!("{addr} resolved to no addresses"))
    }))
}

impl LogService for LogClient {
    fn append(&mut self, timeline: TimelineId, record: &WalRecord) -> Result<Lsn> {
        let response = self.exchange(&LogRequest::append(timeline, record))?;
        let committed = Self::expect_ok(response)?.ok_or_else(|| {
            NimbusError::Protocol("append acknowledgment without committed_lsn".into())
        })?;
        Ok(Lsn(committed))
    }

    fn create_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        let response = self.exchange(&LogRequest::CreateTimeline {
            timeline_id: timeline.get(),
        })?;
        Self::expect_ok(response).map(|_| ())
    }

    fn delete_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        let response = self.exchange(&LogRequest::DeleteTimeline {
            timeline_id: timeline.get(),
        })?;
        Self::expect_ok(response).map(|_| ())
    }

    fn timeline_status(&mut self, timeline: TimelineId) -> Result<Lsn> {
        let response = self.exchange(&LogRequest::TimelineStatus {
            timeline_id: timeline.get(),
        })?;
        Ok(Lsn(Self::expect_ok(response)?.unwrap_or(0)))
    }

    fn check_availability(&mut self) -> Result<()> {
        let response = self.exchange(&LogRequest::Ping)?;
        Self::expect_ok(response).map(|_| ())
    }
}
