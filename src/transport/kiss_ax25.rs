use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::ax25::{Ax25Frame, DataLink, LinkAction, LinkConfig};
use crate::core::{Error, Result};
use crate::kiss::{KissCodec, KissCommand, KissFrame, PollScheduler, TncParams,
    DEFAULT_POLL_INTERVAL_MS};
use super::Transport;

/// KISS-side configuration for a [`KissAx25Transport`]
#[derive(Debug, Clone)]
pub struct KissConfig {
    /// Multi-drop TNC address our data frames carry
    pub port: u8,
    /// XKISS checksum mode
    pub use_checksum: bool,
    /// TNC parameters emitted once at link start
    pub params: TncParams,
    /// Master-poll the configured slave addresses
    pub polled: bool,
    /// Slave addresses to poll
    pub slaves: Vec<u8>,
    /// Poll interval
    pub poll_interval: Duration,
}

impl Default for KissConfig {
    fn default() -> Self {
        KissConfig {
            port: 0,
            use_checksum: false,
            params: TncParams::default(),
            polled: false,
            slaves: Vec::new(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

enum Cmd {
    Connect,
    Send(Vec<u8>),
    Close,
}

#[derive(Debug)]
enum Event {
    Up,
    Data(Bytes),
    Closed,
    PeerClosed,
    Failed(String),
}

/// AX.25 connected mode over a KISS byte stream.
///
/// A spawned driver task owns the framed stream and runs the data-link
/// state machine; session writes, T1 retransmission and master polling
/// all funnel through that task, so writes serialise at the frame
/// boundary.
pub struct KissAx25Transport {
    cmd_tx: mpsc::Sender<Cmd>,
    event_rx: mpsc::Receiver<Event>,
    driver: JoinHandle<()>,
    poller: Option<PollScheduler>,
    buffer: BytesMut,
    connect_timeout: Duration,
    link_up: bool,
}

impl KissAx25Transport {
    /// Builds the transport over any byte stream carrying KISS frames
    pub fn new<S>(stream: S, kiss: KissConfig, link: LinkConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connect_timeout = link.t1 * (link.max_retries as u32 + 1);
        let data_link = DataLink::new(link)?;
        let framed = Framed::new(stream, KissCodec::new(kiss.use_checksum));

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);

        // TNC parameters go out first, through the same single writer
        for frame in kiss.params.frames(kiss.port) {
            let _ = frame_tx.try_send(frame);
        }
        let poller = if kiss.polled && !kiss.slaves.is_empty() {
            Some(PollScheduler::start(
                frame_tx.clone(),
                kiss.slaves.clone(),
                kiss.poll_interval,
            ))
        } else {
            None
        };

        let driver = tokio::spawn(drive(
            framed, data_link, kiss.port, cmd_rx, frame_rx, event_tx,
        ));

        Ok(KissAx25Transport {
            cmd_tx,
            event_rx,
            driver,
            poller,
            buffer: BytesMut::new(),
            connect_timeout,
            link_up: false,
        })
    }

    async fn send_cmd(&self, cmd: Cmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::link("AX.25 link driver is gone"))
    }
}

#[async_trait]
impl Transport for KissAx25Transport {
    async fn open(&mut self) -> Result<()> {
        self.send_cmd(Cmd::Connect).await?;
        let event = tokio::time::timeout(self.connect_timeout, self.event_rx.recv())
            .await
            .map_err(|_| Error::link("AX.25 connection timed out"))?;
        match event {
            Some(Event::Up) => {
                self.link_up = true;
                Ok(())
            }
            Some(Event::Failed(reason)) => Err(Error::link(reason)),
            other => Err(Error::link(format!("unexpected link event: {:?}", other))),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.send_cmd(Cmd::Send(data.to_vec())).await
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        loop {
            if !self.buffer.is_empty() {
                let take = self.buffer.len().min(max);
                return Ok(self.buffer.split_to(take).freeze());
            }
            match self.event_rx.recv().await {
                Some(Event::Data(data)) => self.buffer.extend_from_slice(&data),
                Some(Event::PeerClosed) => {
                    return Err(Error::link("DISC received mid-session"));
                }
                Some(Event::Failed(reason)) => return Err(Error::link(reason)),
                Some(Event::Closed) | None => return Ok(Bytes::new()),
                Some(Event::Up) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        if self.link_up && self.send_cmd(Cmd::Close).await.is_ok() {
            // Wait briefly for the DISC/UA handshake to finish
            let _ = tokio::time::timeout(Duration::from_secs(30), async {
                while let Some(event) = self.event_rx.recv().await {
                    if matches!(event, Event::Closed | Event::Failed(_)) {
                        break;
                    }
                }
            })
            .await;
        }
        self.link_up = false;
        self.driver.abort();
        Ok(())
    }
}

impl Drop for KissAx25Transport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Driver task: one writer, one reader, the link state machine between
async fn drive<S>(
    mut framed: Framed<S, KissCodec>,
    mut link: DataLink,
    port: u8,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    mut frame_rx: mpsc::Receiver<KissFrame>,
    event_tx: mpsc::Sender<Event>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("AX.25 link driver started");
    let mut cmd_open = true;
    loop {
        let deadline = link
            .t1_deadline()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
        let t1_armed = link.t1_deadline().is_some();

        let actions: Vec<LinkAction> = tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(kiss_frame)) => {
                    if kiss_frame.command == KissCommand::Data {
                        match Ax25Frame::decode(&kiss_frame.payload) {
                            Ok(frame) => link.on_frame(&frame),
                            Err(e) => {
                                // Bad FCS or malformed frame is absorbed here
                                debug!(error = %e, "discarding AX.25 frame");
                                Vec::new()
                            }
                        }
                    } else {
                        Vec::new()
                    }
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(Event::Failed(format!("KISS stream error: {}", e))).await;
                    return;
                }
                None => {
                    let _ = event_tx.send(Event::Failed("KISS stream ended".into())).await;
                    return;
                }
            },
            cmd = cmd_rx.recv(), if cmd_open => match cmd {
                Some(Cmd::Connect) => link.connect(),
                Some(Cmd::Send(data)) => link.send(&data),
                Some(Cmd::Close) => link.close(),
                None => {
                    // Transport handle dropped; release the link once
                    cmd_open = false;
                    link.close()
                }
            },
            Some(frame) = frame_rx.recv() => {
                // Poll and parameter frames share the writer with link data
                if let Err(e) = framed.send(frame).await {
                    warn!(error = %e, "KISS write failed");
                    let _ = event_tx.send(Event::Failed(format!("KISS write failed: {}", e))).await;
                    return;
                }
                Vec::new()
            },
            _ = tokio::time::sleep_until(deadline), if t1_armed => link.on_t1_expiry(),
        };

        for action in actions {
            match action {
                LinkAction::Transmit(frame) => {
                    let kiss_frame = KissFrame::data(port, frame.encode());
                    if let Err(e) = framed.send(kiss_frame).await {
                        let _ = event_tx
                            .send(Event::Failed(format!("KISS write failed: {}", e)))
                            .await;
                        return;
                    }
                }
                LinkAction::Deliver(data) => {
                    if event_tx.send(Event::Data(data)).await.is_err() {
                        return;
                    }
                }
                LinkAction::Connected => {
                    let _ = event_tx.send(Event::Up).await;
                }
                LinkAction::ConnectRefused => {
                    let _ = event_tx.send(Event::Failed("SABM refused with DM".into())).await;
                    return;
                }
                LinkAction::Closed => {
                    let _ = event_tx.send(Event::Closed).await;
                    return;
                }
                LinkAction::PeerClosed => {
                    let _ = event_tx.send(Event::PeerClosed).await;
                    return;
                }
                LinkAction::Failed(reason) => {
                    let _ = event_tx.send(Event::Failed(reason)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::{FrameType, Ax25Address};
    use crate::core::Callsign;
    use tokio::io::DuplexStream;

    /// Peer-side helper speaking raw KISS over the other half of a duplex
    struct FakePeer {
        framed: Framed<DuplexStream, KissCodec>,
        me: Callsign,
        them: Callsign,
    }

    impl FakePeer {
        fn new(stream: DuplexStream) -> Self {
            FakePeer {
                framed: Framed::new(stream, KissCodec::new(false)),
                me: Callsign::parse("KE4AHR-1").unwrap(),
                them: Callsign::parse("W1AW").unwrap(),
            }
        }

        async fn recv_ax25(&mut self) -> Ax25Frame {
            loop {
                let frame = self.framed.next().await.unwrap().unwrap();
                if frame.command == KissCommand::Data {
                    return Ax25Frame::decode(&frame.payload).unwrap();
                }
            }
        }

        async fn send_ax25(&mut self, frame_type: FrameType, command: bool, info: &[u8]) {
            let frame = Ax25Frame::new(
                Ax25Address::new(self.them.clone()),
                Ax25Address::new(self.me.clone()),
                vec![],
                frame_type,
                command,
                Bytes::copy_from_slice(info),
            );
            self.framed
                .send(KissFrame::data(0, frame.encode()))
                .await
                .unwrap();
        }
    }

    fn transport_pair() -> (KissAx25Transport, FakePeer) {
        let (near, far) = tokio::io::duplex(65536);
        let link = LinkConfig::new(
            Callsign::parse("W1AW").unwrap(),
            Callsign::parse("KE4AHR-1").unwrap(),
        );
        let kiss = KissConfig { params: TncParams { ignore: true, ..TncParams::default() }, ..KissConfig::default() };
        let transport = KissAx25Transport::new(near, kiss, link).unwrap();
        (transport, FakePeer::new(far))
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (mut transport, mut peer) = transport_pair();

        let peer_task = tokio::spawn(async move {
            let sabm = peer.recv_ax25().await;
            assert_eq!(sabm.frame_type, FrameType::Sabm { poll: true });
            peer.send_ax25(FrameType::Ua { fin: true }, false, b"").await;
            peer
        });

        transport.open().await.unwrap();
        peer_task.await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let (mut transport, mut peer) = transport_pair();

        let peer_task = tokio::spawn(async move {
            let sabm = peer.recv_ax25().await;
            assert_eq!(sabm.frame_type, FrameType::Sabm { poll: true });
            peer.send_ax25(FrameType::Ua { fin: true }, false, b"").await;

            // Take one I-frame and ack it
            let iframe = peer.recv_ax25().await;
            assert_eq!(
                iframe.frame_type,
                FrameType::I { ns: 0, nr: 0, poll: false }
            );
            assert_eq!(&iframe.info[..], b"[TEST-1.0-B$]\r\n");
            peer.send_ax25(FrameType::Rr { nr: 1, poll: false }, false, b"").await;

            // Send one of our own
            peer.send_ax25(
                FrameType::I { ns: 0, nr: 1, poll: false },
                true,
                b"FQ\r\n",
            )
            .await;
            peer
        });

        transport.open().await.unwrap();
        transport.write(b"[TEST-1.0-B$]\r\n").await.unwrap();
        let inbound = transport.read(64).await.unwrap();
        assert_eq!(&inbound[..], b"FQ\r\n");
        peer_task.await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect_reports_link_error() {
        let (mut transport, mut peer) = transport_pair();

        let peer_task = tokio::spawn(async move {
            let _sabm = peer.recv_ax25().await;
            peer.send_ax25(FrameType::Dm { fin: true }, false, b"").await;
        });

        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, Error::Link(_)));
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_emits_poll_frames() {
        let (near, far) = tokio::io::duplex(65536);
        let link = LinkConfig::new(
            Callsign::parse("W1AW").unwrap(),
            Callsign::parse("KE4AHR-1").unwrap(),
        );
        let kiss = KissConfig {
            polled: true,
            slaves: vec![1],
            poll_interval: Duration::from_millis(10),
            params: TncParams { ignore: true, ..TncParams::default() },
            ..KissConfig::default()
        };
        let _transport = KissAx25Transport::new(near, kiss, link).unwrap();

        let mut framed = Framed::new(far, KissCodec::new(false));
        let mut polls = 0;
        while polls < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), framed.next())
                .await
                .expect("poll frame within a second")
                .unwrap()
                .unwrap();
            if frame.command == KissCommand::Poll {
                assert_eq!(frame.port, 1);
                polls += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_tnc_params_emitted_first() {
        let (near, far) = tokio::io::duplex(65536);
        let link = LinkConfig::new(
            Callsign::parse("W1AW").unwrap(),
            Callsign::parse("KE4AHR-1").unwrap(),
        );
        let kiss = KissConfig::default();
        let _transport = KissAx25Transport::new(near, kiss, link).unwrap();

        let mut framed = Framed::new(far, KissCodec::new(false));
        let first = tokio::time::timeout(Duration::from_secs(1), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.command, KissCommand::TxDelay);
    }
}
