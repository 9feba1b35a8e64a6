use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use permsync_net::{FetchError, FetchOutcome, FetchRequest};
use permsync_shared::{ContentType, FetchStatus, ParsedEntry, PermissionType, SubscriptionId};
use permsync_store::Subscription;

use crate::source::ListSource;

pub(crate) fn block_subscription(priority: u8, uri: &str) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        priority,
        title: None,
        permission_type: PermissionType::Block,
        uri: uri.to_string(),
        content_type: ContentType::Plain,
        fetch_username: None,
        fetch_password: None,
        as_draft: true,
        adopt_orphans: false,
        created_at: Utc::now(),
        last_fetch_status: FetchStatus::Never,
        last_fetch_error: None,
        last_fetched_at: None,
        last_success_at: None,
        etag: None,
        last_modified: None,
        entry_count: 0,
    }
}

pub(crate) fn entries(domains: &[&str]) -> Vec<ParsedEntry> {
    domains.iter().map(|d| ParsedEntry::bare(*d)).collect()
}

type Hook = Box<dyn FnMut() + Send>;

/// Canned [`ListSource`] recording every request it receives.
pub(crate) struct StubSource {
    reply: Mutex<Result<FetchOutcome, FetchError>>,
    requests: Mutex<Vec<FetchRequest>>,
    hook: Mutex<Option<Hook>>,
    gate: Option<Arc<Semaphore>>,
}

impl StubSource {
    pub(crate) fn new(reply: Result<FetchOutcome, FetchError>) -> Self {
        Self {
            reply: Mutex::new(reply),
            requests: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
            gate: None,
        }
    }

    /// Each fetch waits for one permit of `gate` before answering.
    pub(crate) fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn set_reply(&self, reply: Result<FetchOutcome, FetchError>) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Run `hook` inside every fetch.
    pub(crate) fn on_fetch(&self, hook: impl FnMut() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn record(&self, req: &FetchRequest) {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook();
        }
    }
}

#[async_trait]
impl ListSource for StubSource {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        self.record(req);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.reply.lock().unwrap().clone()
    }
}
