//! Fault-injecting remote used by the engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::documents::DocumentStore;
use crate::models::Document;
use crate::store::RemoteStore;

/// Wraps an in-memory [`DocumentStore`], counting calls and failing the
/// ones it is told to.
pub struct FlakyRemote {
    inner: DocumentStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing: Mutex<HashSet<String>>,
    lost_responses: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    creates: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FlakyRemote {
    pub fn new() -> Self {
        Self {
            inner: DocumentStore::open_in_memory().unwrap(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            lost_responses: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every create for this local id fails before reaching the store.
    pub fn fail_record(&self, local_id: &str) {
        lock(&self.failing).insert(local_id.to_string());
    }

    pub fn heal_record(&self, local_id: &str) {
        lock(&self.failing).remove(local_id);
    }

    /// The next create for this local id is stored, but the caller sees
    /// an error, as if the response was dropped.
    pub fn lose_response_once(&self, local_id: &str) {
        lock(&self.lost_responses).insert(local_id.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Most creates that were ever running at the same time.
    pub fn peak_concurrent_creates(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Writes of any kind, the thing a failed pull must never reach.
    pub fn write_calls(&self) -> usize {
        self.set_calls() + self.create_calls()
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Counts one running create until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn get_user_document(&self, user_id: &str) -> Result<Option<Document>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("simulated network error reading user document");
        }
        self.inner.get_user_document(user_id)
    }

    async fn set_user_document(&self, user_id: &str, doc: Document, merge: bool) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("simulated network error writing user document");
        }
        self.inner.set_user_document(user_id, doc, merge)
    }

    async fn create_child_document(
        &self,
        user_id: &str,
        collection: &str,
        doc: Document,
    ) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let _running = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        self.delay().await;
        let local_id = doc
            .get("localId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if lock(&self.failing).contains(&local_id) {
            bail!("simulated network error uploading {local_id}");
        }
        let id = self.inner.create_child_document(user_id, collection, doc)?;
        if lock(&self.lost_responses).remove(&local_id) {
            bail!("simulated dropped response for {local_id}");
        }
        Ok(id)
    }
}
