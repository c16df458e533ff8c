//! Generic paginated transfer engine.
//!
//! A [`TransferEngine`] moves a payload across a request/reply link one page
//! at a time. The unit echoes what it stored (or returns what was asked for)
//! and the engine only advances once a reply matches. Everything that depends
//! on the kind of transfer lives in a [`TransferVariant`]; the retry, timeout
//! and progress logic below is shared by all of them.
//!
//! ```text
//!            start(job)
//!                |
//!          initialize ----------------------> Failed* (preconditions)
//!                |
//!                v
//!   +------> send page ---- not connected --> FailedConnection
//!   |            |
//!   |     wait for reply (reply window)
//!   |            |
//!   |     +------+--------+-----------+
//!   |     |      |        |           |
//!   | advance  missed   complete     fail
//!   |     |      |        |           |
//!   +-----+------+        v           v
//!               |     Succeeded    Failed*
//!        missed > max --> FailedLostPackets
//! ```
//!
//! Each run gets its own worker thread. Replies are injected from the
//! transport's read thread through [`TransferEngine::receive`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::transfer::status::{TransferState, TransferStatus};

/// Default time to wait for the unit to answer a page.
pub const DEFAULT_REPLY_WINDOW: Duration = Duration::from_millis(500);

/// Default deadline for a worker to acknowledge a stop request.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of consecutive misses tolerated on one page.
pub const DEFAULT_MAX_MISSED_PAGES: u32 = 5;

/// Default timeout of [`TransferEngine::run`].
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity of blocking waits, so stop requests are noticed quickly.
const SLICE: Duration = Duration::from_millis(10);

/// Engine timing and retry configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long to wait for an asynchronous reply before counting a miss.
    pub reply_window: Duration,
    /// Pause after every acknowledged page.
    pub step_delay: Duration,
    /// How long [`TransferEngine::stop`] waits for the worker.
    pub stop_timeout: Duration,
    /// Consecutive misses on one page before giving up.
    pub max_missed_pages: u32,
    /// Polling interval of [`TransferEngine::wait`].
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reply_window: DEFAULT_REPLY_WINDOW,
            step_delay: Duration::ZERO,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            max_missed_pages: DEFAULT_MAX_MISSED_PAGES,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    /// Set the reply window.
    #[must_use]
    pub fn with_reply_window(mut self, reply_window: Duration) -> Self {
        self.reply_window = reply_window;
        self
    }

    /// Set the pause after every acknowledged page.
    #[must_use]
    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    /// Set the stop deadline.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Set the per-page retry bound.
    #[must_use]
    pub fn with_max_missed_pages(mut self, max_missed_pages: u32) -> Self {
        self.max_missed_pages = max_missed_pages;
        self
    }
}

/// A reply delivered to a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A page echo or page of requested data.
    Page {
        /// Page index.
        page: u16,
        /// Page data without the index.
        data: Vec<u8>,
    },
    /// Verdict of the unit on an uploaded configuration.
    ImportComplete {
        /// Whether the configuration was accepted.
        success: bool,
    },
    /// Error report of a rejected configuration.
    ImportLog(String),
    /// Lines of a text protocol reply.
    Lines(Vec<String>),
}

/// What a transfer needs to know before its first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    /// Page count, possibly provisional.
    pub page_count: u32,
    /// Bytes to send, for uploads. Reaching it moves the transfer into its
    /// finishing phase.
    pub payload_len: Option<usize>,
}

/// A terminal failure with an optional message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Failure state.
    pub state: TransferState,
    /// Message replacing the state's default one.
    pub message: Option<String>,
}

impl Failure {
    /// Failure with the state's default message.
    pub fn new(state: TransferState) -> Self {
        Self {
            state,
            message: None,
        }
    }

    /// Failure with a specific message.
    pub fn with_message(state: TransferState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: Some(message.into()),
        }
    }
}

/// Position of the transfer, handed to the variant on every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageCursor {
    /// Current page index.
    pub page: u32,
    /// Bytes acknowledged so far.
    pub pointer: usize,
    /// All pages are acknowledged; the end of transfer is being signalled.
    pub finishing: bool,
}

/// Outcome of sending a page.
#[derive(Debug)]
pub enum Dispatch {
    /// The reply arrives later through [`TransferEngine::receive`].
    Await,
    /// The link answered synchronously.
    Replied(Reply),
    /// The variant resolved the step without a reply.
    Done(Verdict),
}

/// Decision taken on a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The page was acknowledged.
    Advance {
        /// Bytes the acknowledged page covered.
        bytes: usize,
        /// Page indices to skip forward.
        pages: u32,
    },
    /// The transfer finished successfully.
    Complete,
    /// The transfer failed for good.
    Fail(Failure),
    /// The page was not acknowledged and should be sent again. The message,
    /// if any, replaces the status message.
    Missed(Option<String>),
    /// The reply was consumed and another one is expected; the reply window
    /// starts over.
    Pending,
    /// The reply does not belong to this step.
    Ignore,
}

/// The parts of a transfer that differ between firmware, configuration and
/// log transfers.
pub trait TransferVariant: Send + 'static {
    /// Input of a transfer run.
    type Job: Send;

    /// Short name used for the worker thread and in logs.
    const NAME: &'static str;

    /// Reset for a new run and check preconditions.
    fn initialize(&mut self, job: Self::Job) -> Result<Plan, Failure>;

    /// Called once the run is published as running, before the first page.
    fn on_start(&mut self) {}

    /// Whether the link to the unit is up.
    fn is_connected(&self) -> bool;

    /// Send the page at `cursor` (or the end of transfer when finishing).
    fn send_page(&mut self, cursor: &PageCursor) -> Dispatch;

    /// Decide what a reply means for the page at `cursor`.
    fn check_reply(&mut self, cursor: &PageCursor, reply: Reply) -> Verdict;
}

type Subscriber = Arc<dyn Fn(&TransferStatus) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the engine handle and its worker.
struct Shared {
    name: &'static str,
    status: Mutex<TransferStatus>,
    subscribers: Mutex<Vec<Subscriber>>,
    inbox: Mutex<Option<Sender<Reply>>>,
    stop: AtomicBool,
}

impl Shared {
    fn snapshot(&self) -> TransferStatus {
        lock(&self.status).clone()
    }

    fn notify(&self, status: &TransferStatus) {
        let subscribers: Vec<Subscriber> = lock(&self.subscribers).clone();
        for subscriber in subscribers {
            subscriber(status);
        }
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&TransferStatus) -> Option<TransferStatus>,
    {
        let changed = {
            let mut status = lock(&self.status);
            match f(&status) {
                Some(next) => {
                    *status = next.clone();
                    Some(next)
                }
                None => None,
            }
        };
        if let Some(status) = changed {
            self.notify(&status);
        }
    }

    /// Unconditionally replace the state.
    fn set_state(&self, state: TransferState, message: Option<String>) {
        self.update(|s| {
            Some(TransferStatus::new(
                s.pages_total,
                s.current_page,
                state,
                message,
            ))
        });
    }

    /// Leave `Running` for `state`. No effect once the run has ended.
    fn finish(&self, state: TransferState, message: Option<String>) -> bool {
        let mut applied = false;
        self.update(|s| {
            if !s.state.is_running() {
                return None;
            }
            applied = true;
            Some(TransferStatus::new(
                s.pages_total,
                s.current_page,
                state,
                message,
            ))
        });
        if applied {
            info!("{} transfer finished: {state}", self.name);
        }
        applied
    }

    fn set_message(&self, message: String) {
        self.update(|s| {
            s.state.is_running().then(|| {
                TransferStatus::new(s.pages_total, s.current_page, s.state, Some(message))
            })
        });
    }

    fn set_page(&self, page: u32) {
        self.update(|s| {
            let message = Some(s.message.clone());
            Some(TransferStatus::new(s.pages_total, page, s.state, message))
        });
    }

    fn set_page_count(&self, pages_total: u32) {
        self.update(|s| {
            let message = Some(s.message.clone());
            Some(TransferStatus::new(
                pages_total,
                s.current_page,
                s.state,
                message,
            ))
        });
    }

    fn is_running(&self) -> bool {
        lock(&self.status).state.is_running()
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless a stop is requested. Returns false if
    /// interrupted.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

/// Consecutive misses on the same page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MissedPages {
    page: u32,
    count: u32,
}

impl MissedPages {
    /// Record a miss on `page` and return how many times in a row this page
    /// has been missed. A miss on a different page starts over at one.
    pub fn record(&mut self, page: u32) -> u32 {
        if page == self.page {
            self.count += 1;
        } else {
            self.page = page;
            self.count = 1;
        }
        self.count
    }

    /// Current consecutive miss count.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Drives one kind of transfer. Long-lived; every [`start`](Self::start)
/// resets it for a new run.
pub struct TransferEngine<V: TransferVariant> {
    variant: Arc<Mutex<V>>,
    shared: Arc<Shared>,
    config: EngineConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: TransferVariant> TransferEngine<V> {
    /// Create an idle engine around `variant`.
    pub fn new(variant: V, config: EngineConfig) -> Self {
        Self {
            variant: Arc::new(Mutex::new(variant)),
            shared: Arc::new(Shared {
                name: V::NAME,
                status: Mutex::new(TransferStatus::default()),
                subscribers: Mutex::new(Vec::new()),
                inbox: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            config,
            worker: Mutex::new(None),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current status snapshot.
    pub fn status(&self) -> TransferStatus {
        self.shared.snapshot()
    }

    /// Call `callback` with every new status snapshot.
    ///
    /// Callbacks run on whichever thread changed the status, usually the
    /// worker. They must not block.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&TransferStatus) + Send + Sync + 'static,
    {
        lock(&self.shared.subscribers).push(Arc::new(callback));
    }

    /// Read the variant, e.g. to collect downloaded data.
    pub fn inspect<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&lock(&self.variant))
    }

    /// Modify the variant, e.g. to replace the commands it sends. Takes
    /// effect on the next step.
    pub fn configure<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        f(&mut lock(&self.variant))
    }

    /// Start a new run.
    ///
    /// Any previous run is stopped first. If that fails the status is
    /// `FailedStop` and nothing starts.
    pub fn start(&self, job: V::Job) -> TransferStatus {
        if !self.stop() {
            return self.status();
        }

        self.shared.stop.store(false, Ordering::Release);

        let plan = match lock(&self.variant).initialize(job) {
            Ok(plan) => plan,
            Err(failure) => {
                warn!(
                    "{} transfer could not initialize: {}",
                    V::NAME,
                    failure.state
                );
                self.shared.update(|_| {
                    Some(TransferStatus::new(0, 0, failure.state, failure.message))
                });
                return self.status();
            }
        };

        let (tx, rx) = mpsc::channel();
        *lock(&self.shared.inbox) = Some(tx);
        self.shared
            .update(|_| Some(TransferStatus::new(plan.page_count, 0, TransferState::Running, None)));
        info!(
            "{} transfer started ({} pages)",
            V::NAME,
            plan.page_count
        );

        lock(&self.variant).on_start();

        let worker = Worker {
            variant: Arc::clone(&self.variant),
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            plan,
            inbox: rx,
        };

        match thread::Builder::new()
            .name(format!("cvls-{}", V::NAME))
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
            }
            Err(e) => {
                warn!("Failed to spawn {} worker: {e}", V::NAME);
                lock(&self.shared.inbox).take();
                self.shared.set_state(TransferState::FailedStart, None);
            }
        }

        self.status()
    }

    /// Stop the current run.
    ///
    /// Safe to call from any thread and any number of times. Returns false,
    /// with the status set to `FailedStop`, if the worker did not wind down
    /// within the stop deadline.
    pub fn stop(&self) -> bool {
        if lock(&self.worker).is_none() {
            return true;
        }

        // The handle stays in place until the worker has exited, so every
        // concurrent caller waits on the same worker.
        self.shared.stop.store(true, Ordering::Release);
        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            let finished = lock(&self.worker)
                .as_ref()
                .is_none_or(JoinHandle::is_finished);
            if finished {
                break;
            }
            if Instant::now() >= deadline {
                warn!("{} worker did not stop in time", V::NAME);
                self.shared.set_state(TransferState::FailedStop, None);
                return false;
            }
            thread::sleep(SLICE);
        }

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} worker panicked", V::NAME);
                self.shared.finish(TransferState::Failed, None);
            }
        }
        true
    }

    /// Block until the run ends or `timeout` elapses.
    ///
    /// On timeout the run is forced to `FailedTimeOut` and stopped.
    pub fn wait(&self, timeout: Duration) -> TransferStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status();
            if status.is_finished() {
                return status;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("{} transfer timed out after {timeout:?}", V::NAME);
                self.shared.finish(TransferState::FailedTimeOut, None);
                self.stop();
                return self.status();
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Start a run and wait for it to end.
    pub fn run(&self, job: V::Job, timeout: Duration) -> TransferStatus {
        let status = self.start(job);
        if status.state.is_failure() {
            return status;
        }
        self.wait(timeout)
    }

    /// Deliver a reply from the unit to the running transfer.
    ///
    /// Replies arriving while no run is waiting are discarded.
    pub fn receive(&self, reply: Reply) {
        match lock(&self.shared.inbox).as_ref() {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    trace!("{} reply arrived after the run ended", V::NAME);
                }
            }
            None => trace!("{} reply discarded, engine idle", V::NAME),
        }
    }

    /// Replace the page count with an authoritative one from the unit.
    pub fn set_page_count(&self, pages_total: u32) {
        debug!("{} page count revised to {pages_total}", V::NAME);
        self.shared.set_page_count(pages_total);
    }
}

impl<V: TransferVariant> Drop for TransferEngine<V> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One run of a transfer on its own thread.
struct Worker<V: TransferVariant> {
    variant: Arc<Mutex<V>>,
    shared: Arc<Shared>,
    config: EngineConfig,
    plan: Plan,
    inbox: Receiver<Reply>,
}

impl<V: TransferVariant> Worker<V> {
    fn run(self) {
        let mut cursor = PageCursor::default();
        let mut missed = MissedPages::default();

        loop {
            if self.shared.stop_requested() || !self.shared.is_running() {
                break;
            }

            if !lock(&self.variant).is_connected() {
                warn!("{} transfer lost its connection", V::NAME);
                self.shared.finish(TransferState::FailedConnection, None);
                break;
            }

            self.shared.set_page(cursor.page);

            // Anything still queued answers an earlier send.
            while self.inbox.try_recv().is_ok() {}

            let dispatch = lock(&self.variant).send_page(&cursor);
            let verdict = match dispatch {
                Dispatch::Done(verdict) => verdict,
                Dispatch::Replied(reply) => lock(&self.variant).check_reply(&cursor, reply),
                Dispatch::Await => match self.await_reply(&cursor) {
                    Some(verdict) => verdict,
                    None => break,
                },
            };

            match verdict {
                Verdict::Advance { bytes, pages } => {
                    trace!("{} page {} acknowledged", V::NAME, cursor.page);
                    cursor.pointer += bytes;
                    cursor.page += pages;
                    if self.plan.payload_len.is_some_and(|len| cursor.pointer >= len) {
                        debug!("{} payload sent, finishing", V::NAME);
                        cursor.finishing = true;
                    }
                    if !self.config.step_delay.is_zero() && !self.shared.pause(self.config.step_delay)
                    {
                        break;
                    }
                }
                Verdict::Complete => {
                    self.shared.set_page(cursor.page);
                    self.shared.finish(TransferState::Succeeded, None);
                    break;
                }
                Verdict::Fail(failure) => {
                    self.shared.finish(failure.state, failure.message);
                    break;
                }
                Verdict::Missed(message) => {
                    if let Some(message) = message {
                        self.shared.set_message(message);
                    }
                    let count = missed.record(cursor.page);
                    if count > self.config.max_missed_pages {
                        warn!(
                            "{} page {} missed {count} times, giving up",
                            V::NAME,
                            cursor.page
                        );
                        self.shared.finish(TransferState::FailedLostPackets, None);
                        break;
                    }
                    debug!("{} page {} missed ({count}), resending", V::NAME, cursor.page);
                }
                Verdict::Pending | Verdict::Ignore => {}
            }
        }

        lock(&self.shared.inbox).take();
        self.shared
            .finish(TransferState::Failed, Some("Transfer stopped.".to_string()));
    }

    /// Wait for a reply that settles the current step. `None` means stop.
    fn await_reply(&self, cursor: &PageCursor) -> Option<Verdict> {
        let mut deadline = Instant::now() + self.config.reply_window;
        loop {
            if self.shared.stop_requested() {
                return None;
            }

            let now = Instant::now();
            if now >= deadline {
                trace!("{} page {} reply window elapsed", V::NAME, cursor.page);
                return Some(Verdict::Missed(None));
            }

            match self.inbox.recv_timeout(SLICE.min(deadline - now)) {
                Ok(reply) => match lock(&self.variant).check_reply(cursor, reply) {
                    Verdict::Ignore => {}
                    Verdict::Pending => deadline = Instant::now() + self.config.reply_window,
                    verdict => return Some(verdict),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}
