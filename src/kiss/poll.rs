use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::codec::KissFrame;

/// Master-poll scheduler for XKISS multi-drop operation.
///
/// Emits one poll frame per configured slave address in round-robin every
/// `interval`. Poll frames are pushed into the same writer queue as data
/// frames, so poll and session writes serialise at the frame boundary.
#[derive(Debug)]
pub struct PollScheduler {
    handle: JoinHandle<()>,
}

impl PollScheduler {
    /// Starts polling the given slave addresses
    pub fn start(
        writer: mpsc::Sender<KissFrame>,
        slaves: Vec<u8>,
        interval: Duration,
    ) -> Self {
        info!(?slaves, ?interval, "KISS polling started");
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for &addr in &slaves {
                    debug!(addr, "emitting poll frame");
                    if writer.send(KissFrame::poll(addr)).await.is_err() {
                        // Writer side is gone; the transport closed
                        return;
                    }
                }
            }
        });
        PollScheduler { handle }
    }

    /// Stops the polling task
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiss::codec::KissCommand;

    #[tokio::test(start_paused = true)]
    async fn test_poll_rate() {
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = PollScheduler::start(tx, vec![1, 2], Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        scheduler.stop();

        let mut per_addr = [0usize; 16];
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.command, KissCommand::Poll);
            per_addr[frame.port as usize] += 1;
        }
        // At least 9 polls per slave over one second at 100 ms
        assert!(per_addr[1] >= 9, "addr 1 polled {} times", per_addr[1]);
        assert!(per_addr[2] >= 9, "addr 2 polled {} times", per_addr[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = PollScheduler::start(tx, vec![3, 7], Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.port, 3);
        assert_eq!(second.port, 7);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_polling() {
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = PollScheduler::start(tx, vec![1], Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }
}
