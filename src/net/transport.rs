//! Byte-stream transport to a relay

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::control::ControlMessage;
use super::wire::FrameReader;
use crate::core::error::Error;
use crate::core::types::Result;

/// Something arriving from the remote end
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Textual control message (one JSON line)
    Message(String),
    /// One complete binary frame
    Bytes(Vec<u8>),
    /// The connection ended
    Closed,
}

/// Receives transport events on the network task.
///
/// Implementations must not touch simulation state directly; post to a
/// dispatcher instead.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Outbound half of a connection
pub trait Transport: Send + Sync {
    /// Queue one binary frame. Never blocks; frames sent after the
    /// connection closed are dropped.
    fn send_bytes(&self, data: Vec<u8>);
}

/// Identity presented to the relay during the handshake
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    pub addr: String,
    pub token: String,
    pub observer_id: i64,
    pub name: String,
    pub appearance: String,
}

/// TCP connection speaking JSON lines until `Begin`, then binary frames
pub struct TcpTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl TcpTransport {
    /// Connect and run the handshake.
    ///
    /// Control messages received before `Begin` (world parameters, peers'
    /// metadata) go to `sink` as [`TransportEvent::Message`]. Fails with
    /// [`Error::Auth`] without a token or when the relay rejects the
    /// session. No retry is attempted.
    pub async fn connect(options: &ConnectOptions, sink: EventSink) -> Result<Self> {
        if options.token.is_empty() {
            log::error!("Unable to connect to {}: no valid session token", options.addr);
            return Err(Error::Auth("missing session token".into()));
        }

        let stream = TcpStream::connect(&options.addr).await?;
        stream.set_nodelay(true)?;
        log::info!("Connected to relay at {}", options.addr);

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let hello = ControlMessage::Hello {
            token: options.token.clone(),
            observer_id: options.observer_id,
        };
        let info = ControlMessage::ObserverInfo {
            observer_id: options.observer_id,
            name: options.name.clone(),
            appearance: options.appearance.clone(),
        };
        for msg in [hello, info] {
            writer.write_all(msg.to_line()?.as_bytes()).await?;
        }
        writer.flush().await?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(Error::Transport("connection closed during handshake".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match ControlMessage::parse(trimmed) {
                Ok(ControlMessage::Begin) => break,
                Ok(ControlMessage::Rejected { reason }) => {
                    log::error!("Relay at {} rejected session: {}", options.addr, reason);
                    return Err(Error::Auth(reason));
                }
                Ok(_) => sink(TransportEvent::Message(trimmed.to_string())),
                Err(e) => log::warn!("Ignoring malformed control message: {}", e),
            }
        }

        log::debug!("Handshake with {} complete", options.addr);

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(writer, rx));
        let reader = tokio::spawn(read_loop(reader, sink));

        Ok(Self {
            tx,
            reader,
            _writer: writer,
        })
    }
}

impl Transport for TcpTransport {
    fn send_bytes(&self, data: Vec<u8>) {
        if self.tx.send(data).is_err() {
            log::debug!("Dropping outbound frame: connection closed");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("Relay write error: {}", e);
            break;
        }
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, sink: EventSink) {
    let mut frames = FrameReader::new();
    let mut buf = vec![0u8; 8192];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::error!("Relay read error: {}", e);
                break;
            }
        };
        frames.push(&buf[..n]);

        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => sink(TransportEvent::Bytes(frame.encode())),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Closing relay connection: {}", e);
                    break 'read;
                }
            }
        }
    }

    log::info!("Relay connection closed");
    sink(TransportEvent::Closed);
}
