use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sidecar_core::{Addon, AddonId, InvokeError, ModelInvoker};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Text(String),
    Error(InvokeError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One recorded invocation.
#[derive(Clone, Debug)]
pub struct MockCall {
    pub addon_ids: Vec<AddonId>,
    pub prompt: String,
    pub batch: bool,
}

/// Invoker that answers from per-add-on scripts.
///
/// Units run concurrently, so scripts are keyed by add-on id (standalone) or
/// by the first member's id (batch) rather than by call order. A script's
/// responses are consumed front to back; the last one repeats.
#[derive(Default)]
pub struct MockInvoker {
    scripts: Mutex<HashMap<AddonId, VecDeque<MockResponse>>>,
    calls: Mutex<Vec<MockCall>>,
    call_count: AtomicUsize,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for an add-on (or for a batch group led by that add-on).
    pub fn respond(self, addon_id: &str, response: MockResponse) -> Self {
        self.scripts
            .lock()
            .entry(AddonId::from_raw(addon_id))
            .or_default()
            .push_back(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    fn next_response(&self, key: &AddonId) -> Result<MockResponse, InvokeError> {
        let mut scripts = self.scripts.lock();
        let queue = scripts.get_mut(key).ok_or_else(|| {
            InvokeError::InvalidRequest(format!("MockInvoker: no response configured for {key}"))
        })?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| InvokeError::InvalidRequest(format!("MockInvoker: script for {key} is empty")))
    }

    fn record(&self, addons: &[Addon], prompt: &str, batch: bool) {
        let _ = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(MockCall {
            addon_ids: addons.iter().map(|a| a.id.clone()).collect(),
            prompt: prompt.to_string(),
            batch,
        });
    }
}

/// Resolve a MockResponse, unrolling nested delays iteratively.
async fn resolve_response(response: MockResponse) -> Result<String, InvokeError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Text(text) => return Ok(text),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[async_trait]
impl ModelInvoker for MockInvoker {
    async fn invoke(&self, addon: &Addon, prompt: &str) -> Result<String, InvokeError> {
        self.record(std::slice::from_ref(addon), prompt, false);
        let response = self.next_response(&addon.id)?;
        resolve_response(response).await
    }

    async fn invoke_batch(&self, addons: &[Addon], prompt: &str) -> Result<String, InvokeError> {
        self.record(addons, prompt, true);
        let lead = addons
            .first()
            .ok_or_else(|| InvokeError::InvalidRequest("empty batch".into()))?;
        let response = self.next_response(&lead.id)?;
        resolve_response(response).await
    }
}
