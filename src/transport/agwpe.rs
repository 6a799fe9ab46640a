use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::agwpe::{kind, AgwpeCodec, AgwpeFrame};
use crate::core::{Callsign, Error, Result};
use super::Transport;

/// Configuration for an AGWPE-attached session
#[derive(Debug, Clone)]
pub struct AgwpeConfig {
    /// Local callsign registered with the engine
    pub my_call: Callsign,
    /// Remote station the engine connects to
    pub remote_call: Callsign,
    /// Radio port index
    pub port: u8,
    /// Ask the engine for monitor frames as well
    pub monitor: bool,
}

impl AgwpeConfig {
    /// Configuration with the default radio port and no monitoring
    pub fn new(my_call: Callsign, remote_call: Callsign) -> Self {
        AgwpeConfig { my_call, remote_call, port: 0, monitor: false }
    }
}

/// Byte-stream transport through an AGWPE SoundCard-TNC engine.
///
/// The engine runs the AX.25 machinery itself; this transport registers
/// the application, opens the connected link with `'C'`, then exchanges
/// `'D'` frames. Monitor frames are drained and ignored so they never
/// stall the session read path.
pub struct AgwpeTransport<S> {
    framed: Framed<S, AgwpeCodec>,
    config: AgwpeConfig,
    connected: bool,
    buffer: BytesMut,
}

impl<S> AgwpeTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an established byte stream to the AGWPE engine
    pub fn new(stream: S, config: AgwpeConfig) -> Self {
        AgwpeTransport {
            framed: Framed::new(stream, AgwpeCodec),
            config,
            connected: false,
            buffer: BytesMut::new(),
        }
    }

    async fn send_frame(&mut self, frame: AgwpeFrame) -> Result<()> {
        self.framed
            .send(frame)
            .await
            .map_err(|e| Error::transport(format!("AGWPE write failed: {}", e)))
    }

    async fn next_frame(&mut self) -> Result<AgwpeFrame> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(Error::transport(format!("AGWPE read failed: {}", e))),
            None => Err(Error::transport("AGWPE engine closed the connection")),
        }
    }
}

#[async_trait]
impl<S> Transport for AgwpeTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn open(&mut self) -> Result<()> {
        // Application login, answered with an 'X' frame
        self.send_frame(AgwpeFrame::login(self.config.port, &self.config.my_call))
            .await?;
        loop {
            let frame = self.next_frame().await?;
            if frame.kind == kind::LOGIN {
                if frame.payload.first() == Some(&0) {
                    return Err(Error::transport("AGWPE registration rejected"));
                }
                break;
            }
            debug!(kind = %(frame.kind as char), "frame before login reply ignored");
        }
        info!(call = %self.config.my_call, "registered with AGWPE");

        if self.config.monitor {
            self.send_frame(AgwpeFrame::bare(self.config.port, kind::MONITOR))
                .await?;
        }

        // Open the connected-mode link; the engine answers with 'C'
        self.send_frame(AgwpeFrame::connect(
            self.config.port,
            &self.config.my_call,
            &self.config.remote_call,
        ))
        .await?;
        loop {
            let frame = self.next_frame().await?;
            match frame.kind {
                kind::CONNECT => {
                    info!(remote = %self.config.remote_call, "AGWPE link established");
                    self.connected = true;
                    return Ok(());
                }
                kind::DISCONNECT => {
                    return Err(Error::link("AGWPE connect refused"));
                }
                other => {
                    debug!(kind = %(other as char), "frame while connecting ignored");
                }
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(AgwpeFrame::data(
            self.config.port,
            &self.config.my_call,
            &self.config.remote_call,
            Bytes::copy_from_slice(data),
        ))
        .await
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        loop {
            if !self.buffer.is_empty() {
                let take = self.buffer.len().min(max);
                return Ok(self.buffer.split_to(take).freeze());
            }
            let frame = self.next_frame().await?;
            match frame.kind {
                kind::DATA => self.buffer.extend_from_slice(&frame.payload),
                kind::DISCONNECT => {
                    warn!("AGWPE link disconnected by peer");
                    return Err(Error::link("AGWPE link disconnected"));
                }
                other => {
                    // Monitor traffic and engine chatter
                    debug!(kind = %(other as char), "non-data AGWPE frame drained");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            let _ = self
                .send_frame(AgwpeFrame {
                    port: self.config.port,
                    kind: kind::DISCONNECT,
                    call_from: self.config.my_call.to_string(),
                    call_to: self.config.remote_call.to_string(),
                    payload: Bytes::new(),
                })
                .await;
        }
        info!("AGWPE connection closed");
        Ok(())
    }
}
