use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::digest::{Digest as _, Mac as _};
use blake2::{Blake2b, Blake2bMac};
use oastd_task::{ShutdownSignal, Task};
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;

use crate::base32::to_base32;
use crate::event::Event;
use crate::heap::EventHeap;

/// Keyed BLAKE2b with a 256-bit digest; the first half of the digest becomes
/// the test ID, the second half the canary.
type Blake2bMac256 = Blake2bMac<U32>;
type Blake2b256 = Blake2b<U32>;

/// ID derivation engine. BLAKE2b treats a zero-length key as the unkeyed
/// hash, which the MAC type refuses to represent, so that case is explicit.
#[derive(Clone)]
enum MacEngine {
    Keyed(Blake2bMac256),
    Unkeyed,
}

impl MacEngine {
    /// Fails when the key is longer than the 64 bytes BLAKE2b supports.
    fn new(key: &[u8]) -> Result<Self, StorageError> {
        if key.is_empty() {
            return Ok(Self::Unkeyed);
        }
        Blake2bMac256::new_from_slice(key)
            .map(Self::Keyed)
            .map_err(|_| StorageError::InvalidKey)
    }

    fn digest(&self, secret: &[u8]) -> [u8; 32] {
        match self {
            Self::Keyed(mac) => mac.clone().chain_update(secret).finalize().into_bytes().into(),
            Self::Unkeyed => Blake2b256::new().chain_update(secret).finalize().into(),
        }
    }
}

/// Storage tuning knobs, typically lifted from the `Storage` configuration
/// section.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub ttl: Duration,
    pub check_interval: Duration,
    pub max_restarts: u32,
    pub max_events: usize,
    pub max_events_by_test: usize,
    pub max_dump_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("hmac_key must be between 0 and 64 bytes long")]
    InvalidKey,
    #[error("could not create test")]
    TestCapacity,
    #[error("test id {0} does not exist")]
    UnknownTest(String),
}

/// A registered test: the anchor for one payload campaign.
struct TestRecord {
    id: String,
    canary: String,
    events: EventHeap,
}

#[derive(Default)]
struct State {
    tests: HashMap<String, TestRecord>,
    total_tests: usize,
    total_events: usize,
}

impl State {
    fn push_event(&mut self, event: Event) {
        if let Some(test) = self.tests.get_mut(&event.test_id) {
            test.events.push(event);
            self.total_events += 1;
        }
    }

    /// Evicts the oldest event of `id`, deleting the test when it empties.
    fn pop_event(&mut self, id: &str) {
        if let Some(test) = self.tests.get_mut(id) {
            if test.events.pop().is_some() {
                self.total_events -= 1;
            }
            if test.events.is_empty() {
                self.delete_test(id);
            }
        }
    }

    fn delete_test(&mut self, id: &str) {
        if self.tests.remove(id).is_some() {
            self.total_tests -= 1;
        }
    }
}

/// In-memory test & event store.
///
/// Exclusively owns every test and its event heap behind a single
/// readers–writer lock. Reads (`search_test`, `load_events`, the counters)
/// take shared access; anything touching the map or the heaps takes exclusive
/// access. The MAC is stateless (the keyed engine is cloned per derivation),
/// so ID derivation itself happens outside the lock.
pub struct Storage {
    state: RwLock<State>,
    mac: MacEngine,
    max_tests: usize,
    cfg: StorageConfig,
}

impl Storage {
    /// Fails when the MAC rejects `hmac_key` (longer than 64 bytes), which is
    /// fatal to the process at startup.
    pub fn new(cfg: StorageConfig, hmac_key: &[u8]) -> Result<Self, StorageError> {
        let mac = MacEngine::new(hmac_key)?;

        let max_tests = if cfg.max_events > 0 && cfg.max_events_by_test > 0 {
            cfg.max_events / cfg.max_events_by_test
        } else {
            0
        };

        Ok(Self {
            state: RwLock::new(State::default()),
            mac,
            max_tests,
            cfg,
        })
    }

    /// Registers the test derived from `secret`, or fetches it when it
    /// already exists.
    ///
    /// The returned pair is a pure function of the HMAC key and the secret,
    /// so callers racing on the same secret all observe the same values.
    pub fn set_test(&self, secret: &[u8]) -> Result<(String, String), StorageError> {
        let digest = self.mac.digest(secret);
        let (id_half, canary_half) = digest.split_at(digest.len() / 2);
        let id = to_base32(id_half);
        let canary = to_base32(canary_half);

        let mut state = self.state.write();

        if let Some(test) = state.tests.get(&id) {
            return Ok((test.id.clone(), test.canary.clone()));
        }

        if state.total_tests < self.max_tests {
            state.tests.insert(
                id.clone(),
                TestRecord {
                    id: id.clone(),
                    canary: canary.clone(),
                    events: EventHeap::new(),
                },
            );
            state.total_tests += 1;
            return Ok((id, canary));
        }

        Err(StorageError::TestCapacity)
    }

    /// Returns the first test for which `predicate(id, canary)` holds.
    ///
    /// Iteration order is arbitrary: when several IDs appear in the same
    /// request text, which one wins is unspecified.
    pub fn search_test(&self, predicate: impl Fn(&str, &str) -> bool) -> Option<(String, String)> {
        let state = self.state.read();
        state
            .tests
            .values()
            .find(|test| predicate(&test.id, &test.canary))
            .map(|test| (test.id.clone(), test.canary.clone()))
    }

    /// Appends `event` to its test, evicting the oldest event when the
    /// per-test bound is reached.
    ///
    /// Unknown test IDs are an error; receivers log it and still answer the
    /// request normally.
    pub fn store_event(&self, mut event: Event) -> Result<(), StorageError> {
        let mut state = self.state.write();

        if !state.tests.contains_key(&event.test_id) {
            return Err(StorageError::UnknownTest(event.test_id));
        }

        if self.cfg.max_events > 0
            && self.cfg.max_events_by_test > 0
            && state.total_events <= self.cfg.max_events
        {
            let test_id = event.test_id.clone();
            let test_len = state
                .tests
                .get(&test_id)
                .map_or(0, |test| test.events.len());
            if test_len >= self.cfg.max_events_by_test {
                state.pop_event(&test_id);
            }
            truncate_dump(&mut event.dump, self.cfg.max_dump_size);
            state.push_event(event);
        }

        Ok(())
    }

    /// Returns a copy of the test's events in current heap order (not
    /// sorted).
    ///
    /// The copy is detached: writes made after this call never show up in the
    /// returned list, so it is safe to serialize while receivers keep
    /// appending.
    pub fn load_events(&self, id: &str) -> Option<Vec<Event>> {
        let state = self.state.read();
        state.tests.get(id).map(|test| test.events.to_vec())
    }

    pub fn total_tests(&self) -> usize {
        self.state.read().total_tests
    }

    pub fn total_events(&self) -> usize {
        self.state.read().total_events
    }

    /// One expiration pass over every test.
    ///
    /// The write lock is taken around individual mutations and released in
    /// between, so receivers and API reads are not starved by a large sweep.
    /// The test is re-fetched on every round since it may have been deleted
    /// while the lock was released.
    fn expire_sweep(&self) {
        let ttl = time::Duration::try_from(self.cfg.ttl).unwrap_or(time::Duration::MAX);
        let ids: Vec<String> = self.state.read().tests.keys().cloned().collect();

        for id in ids {
            loop {
                let mut state = self.state.write();

                let Some(test) = state.tests.get(&id) else {
                    break;
                };

                if test.events.is_empty() {
                    state.delete_test(&id);
                    break;
                }

                let expired = test
                    .events
                    .peek()
                    .is_some_and(|oldest| OffsetDateTime::now_utc() - oldest.time > ttl);
                if !expired {
                    break;
                }

                state.pop_event(&id);
            }
        }
    }
}

/// Truncates `dump` to at most `max` bytes.
///
/// The cut is on the raw bytes; a multi-byte sequence split by the budget is
/// replaced rather than kept whole.
fn truncate_dump(dump: &mut String, max: usize) {
    if dump.len() > max {
        if dump.is_char_boundary(max) {
            dump.truncate(max);
        } else {
            *dump = String::from_utf8_lossy(&dump.as_bytes()[..max]).into_owned();
        }
    }
}

/// Background task enforcing the event TTL.
///
/// Sweeps the whole store every `check_interval`, deleting empty tests and
/// evicting events older than `ttl`. A panicking sweep is caught and counted
/// against `max_restarts`; once the budget is exhausted the task resolves
/// with the error, which the supervisor treats as fatal.
pub struct ExpireTask {
    pub storage: Arc<Storage>,
}

#[async_trait]
impl Task for ExpireTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "storage expirer";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.expire_loop() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

impl ExpireTask {
    async fn expire_loop(&self) -> anyhow::Result<()> {
        let mut restarts = 0;
        let mut interval = tokio::time::interval(self.storage.cfg.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let sweep = std::panic::catch_unwind(AssertUnwindSafe(|| self.storage.expire_sweep()));

            if let Err(panic) = sweep {
                let error =
                    anyhow::anyhow!("storage expiration error (panic): {}", panic_message(&panic));

                if restarts >= self.storage.cfg.max_restarts {
                    return Err(error);
                }

                restarts += 1;
                info!(error = format!("{error:#}"), restarts, "Events expiration stopped, restarting");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
