use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::{Error, Result};
use super::Transport;

/// Scripted transport for session tests: each `read` pops the next
/// inbound chunk, writes accumulate in a shared buffer
pub(crate) struct MockTransport {
    script: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    fail_writes_after: Option<usize>,
}

impl MockTransport {
    /// Builds a transport from inbound chunks, returning the write log
    pub fn scripted(script: Vec<Vec<u8>>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            MockTransport {
                script: script.into(),
                written: Arc::clone(&written),
                fail_writes_after: None,
            },
            written,
        )
    }

    /// Makes writes fail with a link error once `limit` bytes went out,
    /// imitating an AX.25 link that stopped being acknowledged
    pub fn fail_writes_after(mut self, limit: usize) -> Self {
        self.fail_writes_after = Some(limit);
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut written = self.written.lock().unwrap();
        if let Some(limit) = self.fail_writes_after {
            if written.len() + data.len() > limit {
                return Err(Error::link("T1 retries exhausted"));
            }
        }
        written.extend_from_slice(data);
        Ok(())
    }

    async fn read(&mut self, _max: usize) -> Result<Bytes> {
        Ok(self.script.pop_front().map(Bytes::from).unwrap_or_default())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
