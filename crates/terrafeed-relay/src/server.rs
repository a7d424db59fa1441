//! TCP relay server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use terrafeed::net::{ControlMessage, FrameReader};

use crate::config::{RelayError, Result};
use crate::relay::{PeerId, Relay};

/// Relay server handle - keep this alive to keep the server running
pub struct RelayServer {
    local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl RelayServer {
    /// Bind to the configured address and start accepting peers.
    /// Returns once bound -- connections are served in the background.
    pub async fn start(relay: Arc<Relay>) -> Result<Self> {
        let listener = TcpListener::bind(&relay.config().bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Relay listening on {}", local_addr);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::info!("Peer connected from {}", peer);
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, relay).await {
                                log::warn!("Connection from {} ended: {}", peer, e);
                            }
                            log::info!("Peer disconnected: {}", peer);
                        });
                    }
                    Err(e) => {
                        log::error!("Relay accept error: {}", e);
                    }
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_control(reader: &mut BufReader<OwnedReadHalf>) -> Result<ControlMessage> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(RelayError::Handshake("connection closed".into()));
        }
        if !line.trim().is_empty() {
            return Ok(ControlMessage::parse(&line)?);
        }
    }
}

async fn write_control(writer: &mut OwnedWriteHalf, msg: &ControlMessage) -> Result<()> {
    writer.write_all(msg.to_line()?.as_bytes()).await?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (token, observer_id) = match read_control(&mut reader).await? {
        ControlMessage::Hello { token, observer_id } => (token, observer_id),
        other => {
            let reason = format!("expected Hello, got {:?}", other);
            write_control(&mut writer, &ControlMessage::Rejected { reason: reason.clone() }).await?;
            return Err(RelayError::Handshake(reason));
        }
    };

    let (name, appearance) = match read_control(&mut reader).await? {
        ControlMessage::ObserverInfo { name, appearance, .. } => (name, appearance),
        other => {
            log::debug!("Observer {} sent {:?} instead of its info", observer_id, other);
            (String::new(), String::new())
        }
    };

    if let Err(reason) = relay.config().authorize(&token) {
        log::warn!("Rejecting observer {}: {}", observer_id, reason);
        write_control(&mut writer, &ControlMessage::Rejected { reason: reason.clone() }).await?;
        return Err(RelayError::Handshake(reason));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let (peer, greeting) = relay.join(observer_id, name, appearance, tx).await;

    let result = serve_peer(&relay, peer, greeting, reader, writer, rx).await;
    relay.leave(peer).await;
    result
}

/// Finish the handshake, then pump frames until the peer goes away
async fn serve_peer(
    relay: &Relay,
    peer: PeerId,
    greeting: Vec<ControlMessage>,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<()> {
    for msg in greeting.iter().chain([&ControlMessage::Begin]) {
        write_control(&mut writer, msg).await?;
    }
    writer.flush().await?;

    let writer_task = tokio::spawn(write_loop(writer, rx));
    let result = read_frames(&mut reader, relay, peer).await;
    writer_task.abort();
    result
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("Relay write error: {}", e);
            break;
        }
    }
}

async fn read_frames(reader: &mut BufReader<OwnedReadHalf>, relay: &Relay, peer: PeerId) -> Result<()> {
    let mut frames = FrameReader::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        frames.push(&buf[..n]);

        while let Some(frame) = frames.next_frame()? {
            log::trace!("Peer {} sent {:?} for cell {}", peer, frame.kind, frame.cell);
            relay.handle_frame(peer, frame).await;
        }
    }
}
