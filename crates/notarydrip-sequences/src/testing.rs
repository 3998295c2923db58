//! Test doubles shared by this crate's unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use notarydrip_core::traits::{OutboundMessage, Transport, TransportError, TransportReceipt};
use notarydrip_core::types::Channel;

/// Transport that replays a script of results, then succeeds.
pub struct ScriptedTransport {
    channel: Channel,
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, script: Vec<Result<(), TransportError>>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    /// Every send sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        next?;
        self.sent.lock().unwrap().push(message.clone());
        Ok(TransportReceipt {
            message_id: format!("msg-{}", self.calls()),
        })
    }
}
