//! Link session controller.
//!
//! Owns the state machine of one device-link attempt. Every async result
//! (QR fetch, status poll, prior-account lookup) carries the generation it
//! was issued under and is discarded when the session has moved on, so a
//! late reply can never overwrite a newer session or undo `Connected`.

use crate::driver::{next_countdown, Driver};
use qrlink_core::config::SessionConfig;
use qrlink_core::{
    mask_token, validate_token, ConnectedMetadata, LinkBackend, LinkError, LinkMode, LinkPhase,
    LinkSnapshot, QrResponse, StatusResponse,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Observer = Arc<dyn Fn(&LinkSnapshot) + Send + Sync>;

/// What caused a backend call. Used for log lines only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Start,
    Rotation,
    Refresh,
    Poll,
    Manual,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Rotation => "rotation",
            Self::Refresh => "refresh",
            Self::Poll => "poll",
            Self::Manual => "manual",
        }
    }
}

/// Result of applying a QR response to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QrOutcome {
    Displayed,
    NotReady,
    AlreadyLinked,
    Failed,
}

struct Inner {
    /// Bumped on every start and stop; results from older generations are stale.
    generation: u64,
    started: bool,
    mode: LinkMode,
    session: LinkSnapshot,
    driver: Option<Driver>,
    poll_in_flight: bool,
    /// Wake handle of the running QR fetch loop, if any. At most one per generation.
    qr_fetch: Option<Arc<Notify>>,
    runtime: Option<Handle>,
    observers: Vec<(u64, Observer)>,
    next_observer_id: u64,
    /// Snapshots published but not yet handed to observers.
    outbox: Vec<LinkSnapshot>,
    dispatching: bool,
    watch_tx: watch::Sender<LinkSnapshot>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.started && self.generation == generation
    }

    /// Current and not yet linked: further backend calls are allowed.
    fn may_call(&self, generation: u64) -> bool {
        self.is_current(generation) && self.session.phase != LinkPhase::Connected
    }

    fn masked_token(&self) -> String {
        self.session
            .token
            .as_deref()
            .map(mask_token)
            .unwrap_or_else(|| "-".to_string())
    }

    fn set_phase(&mut self, phase: LinkPhase) {
        if self.session.phase != phase {
            info!(
                "link: {} {} -> {}",
                self.masked_token(),
                self.session.phase.as_str(),
                phase.as_str()
            );
            self.session.phase = phase;
        }
    }

    /// Push the current snapshot to the watch channel and queue it for
    /// observers. Observers only run once the lock is released, see
    /// `Core::dispatch`.
    fn publish(&mut self) {
        let snapshot = self.session.clone();
        self.watch_tx.send_replace(snapshot.clone());
        if !self.observers.is_empty() {
            self.outbox.push(snapshot);
        }
    }

    /// Clear the QR fetch marker if `wake` still owns it.
    fn release_qr_fetch(&mut self, wake: &Arc<Notify>) {
        if self.qr_fetch.as_ref().is_some_and(|w| Arc::ptr_eq(w, wake)) {
            self.qr_fetch = None;
        }
    }

    fn cancel_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }

    fn spawn<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => Some(runtime.spawn(task)),
            None => {
                warn!("link: no runtime captured, dropping session task");
                None
            }
        }
    }

    fn enter_connected(&mut self, metadata: Option<ConnectedMetadata>) {
        self.cancel_driver();
        self.poll_in_flight = false;
        self.session.qr_payload = None;
        self.session.last_error = None;
        self.session.connected = metadata;
        self.set_phase(LinkPhase::Connected);
        self.publish();
    }

    fn enter_failed(&mut self, source: LinkError) {
        let err = LinkError::QrFetch(source.to_string());
        warn!("link: {} {err}", self.masked_token());
        self.cancel_driver();
        self.session.qr_payload = None;
        self.session.last_error = Some(err.to_string());
        self.set_phase(LinkPhase::Failed);
        self.publish();
    }

    fn stop_session(&mut self) {
        if !self.started {
            return;
        }
        self.generation += 1;
        self.started = false;
        self.poll_in_flight = false;
        if let Some(wake) = self.qr_fetch.take() {
            wake.notify_waiters();
        }
        self.cancel_driver();
        if self.session.phase == LinkPhase::Connected {
            debug!("link: {} stopped after link", self.masked_token());
            return;
        }
        self.session.qr_payload = None;
        self.set_phase(LinkPhase::Idle);
        self.publish();
    }
}

fn lock(state: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Re-opens dispatch if an observer panics mid-delivery.
struct DispatchReset<'a>(&'a Mutex<Inner>);

impl Drop for DispatchReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut inner = lock(self.0);
            inner.dispatching = false;
            inner.outbox.clear();
        }
    }
}

/// Shared half of the controller, cloned into every task it spawns.
#[derive(Clone)]
pub(crate) struct Core {
    backend: Arc<dyn LinkBackend>,
    config: Arc<SessionConfig>,
    state: Arc<Mutex<Inner>>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.state)
    }

    pub(crate) fn config(&self) -> Arc<SessionConfig> {
        self.config.clone()
    }

    /// Release `guard` and deliver queued snapshots to observers.
    ///
    /// One caller dispatches at a time. Snapshots published meanwhile, by
    /// other tasks or by an observer calling back into the controller, join
    /// the active dispatcher's queue, so observers see publish order.
    fn dispatch<'a>(&'a self, mut guard: MutexGuard<'a, Inner>) {
        if guard.dispatching || guard.outbox.is_empty() {
            return;
        }
        guard.dispatching = true;
        let _reset = DispatchReset(&*self.state);
        loop {
            let pending = std::mem::take(&mut guard.outbox);
            if pending.is_empty() {
                guard.dispatching = false;
                return;
            }
            let observers: Vec<Observer> =
                guard.observers.iter().map(|(_, o)| o.clone()).collect();
            drop(guard);
            for snapshot in &pending {
                for observer in &observers {
                    observer(snapshot);
                }
            }
            guard = self.lock();
        }
    }

    fn ensure_driver(&self, inner: &mut Inner, generation: u64) {
        if inner.driver.is_some() {
            return;
        }
        if let Some(runtime) = inner.runtime.clone() {
            inner.driver = Some(Driver::spawn(&runtime, self.clone(), generation));
        }
    }

    /// Start the QR fetch loop, or fold `trigger` into the one already
    /// running. A loop waiting out a not-ready delay is woken to fetch now.
    fn spawn_qr_fetch(&self, inner: &mut Inner, generation: u64, trigger: Trigger) {
        if let Some(wake) = &inner.qr_fetch {
            debug!("link: QR fetch already running, {} joins it", trigger.as_str());
            wake.notify_waiters();
            return;
        }
        let Some(token) = inner.session.token.clone() else {
            return;
        };
        let wake = Arc::new(Notify::new());
        inner.qr_fetch = Some(wake.clone());
        let core = self.clone();
        if inner
            .spawn(async move { core.run_qr_fetch(generation, token, trigger, wake).await })
            .is_none()
        {
            inner.qr_fetch = None;
        }
    }

    async fn run_qr_fetch(
        self,
        generation: u64,
        token: String,
        trigger: Trigger,
        wake: Arc<Notify>,
    ) {
        let label = format!("{} fetch for {}", trigger.as_str(), mask_token(&token));
        loop {
            // Registered before the request so a refresh during it is not lost.
            let woken = wake.notified();
            tokio::pin!(woken);
            {
                let mut guard = self.lock();
                if !guard.may_call(generation) {
                    guard.release_qr_fetch(&wake);
                    debug!("link: {label} skipped, session moved on");
                    return;
                }
            }
            let result = self.backend.fetch_qr(&token).await;
            match self.apply_qr(generation, result, &wake) {
                Ok(QrOutcome::NotReady) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay()) => {}
                        _ = &mut woken => debug!("link: {label} retrying early"),
                    }
                }
                Ok(outcome) => {
                    debug!("link: {label} -> {outcome:?}");
                    return;
                }
                Err(e) => {
                    debug!("link: {label} discarded: {e}");
                    return;
                }
            }
        }
    }

    fn apply_qr(
        &self,
        generation: u64,
        result: Result<QrResponse, LinkError>,
        wake: &Arc<Notify>,
    ) -> Result<QrOutcome, LinkError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.may_call(generation) {
            inner.release_qr_fetch(wake);
            return Err(LinkError::StaleResult);
        }

        let outcome = match result {
            Ok(response) if response.connected => {
                inner.enter_connected(None);
                QrOutcome::AlreadyLinked
            }
            Ok(QrResponse { qr: Some(qr), .. }) => {
                inner.session.qr_payload = Some(qr);
                inner.session.expires_in_secs = self.config.rotation_secs;
                inner.session.last_error = None;
                inner.set_phase(LinkPhase::AwaitingScan);
                self.ensure_driver(inner, generation);
                inner.publish();
                QrOutcome::Displayed
            }
            Ok(QrResponse {
                message: Some(message),
                ..
            }) => {
                info!(
                    "link: {} QR not ready yet ({message}), retrying in {}s",
                    inner.masked_token(),
                    self.config.retry_secs
                );
                QrOutcome::NotReady
            }
            Ok(_) => {
                inner.enter_failed(LinkError::Protocol(
                    "backend returned neither a QR payload nor a message".into(),
                ));
                QrOutcome::Failed
            }
            Err(e) => {
                inner.enter_failed(e);
                QrOutcome::Failed
            }
        };
        if outcome != QrOutcome::NotReady {
            inner.release_qr_fetch(wake);
        }
        self.dispatch(guard);
        Ok(outcome)
    }

    /// Issue a status check unless one is already in flight.
    fn begin_status_check(&self, generation: u64, trigger: Trigger) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.may_call(generation) {
            return;
        }
        if trigger == Trigger::Poll && inner.session.phase != LinkPhase::AwaitingScan {
            return;
        }
        if inner.poll_in_flight {
            debug!("link: status check in flight, skipping {} check", trigger.as_str());
            return;
        }
        let Some(token) = inner.session.token.clone() else {
            return;
        };
        inner.poll_in_flight = true;
        let core = self.clone();
        if inner
            .spawn(async move { core.run_status_check(generation, token).await })
            .is_none()
        {
            inner.poll_in_flight = false;
        }
    }

    async fn run_status_check(self, generation: u64, token: String) {
        if !self.lock().may_call(generation) {
            return;
        }
        let result = self.backend.fetch_status(&token).await;
        if let Err(e) = self.apply_status(generation, result) {
            debug!("link: status for {} discarded: {e}", mask_token(&token));
        }
    }

    fn apply_status(
        &self,
        generation: u64,
        result: Result<StatusResponse, LinkError>,
    ) -> Result<(), LinkError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.is_current(generation) {
            return Err(LinkError::StaleResult);
        }
        inner.poll_in_flight = false;
        if inner.session.phase == LinkPhase::Connected {
            return Err(LinkError::StaleResult);
        }

        inner.session.poll_count += 1;
        match result {
            Ok(status) if status.connected => {
                inner.enter_connected(Some(ConnectedMetadata::from_status(&status)));
            }
            Ok(_) => inner.publish(),
            Err(e) => {
                let err = LinkError::TransientPoll(e.to_string());
                warn!("link: {} {err}", inner.masked_token());
                inner.publish();
            }
        }
        self.dispatch(guard);
        Ok(())
    }

    async fn run_prior_lookup(self, generation: u64, token: String) {
        if !self.lock().may_call(generation) {
            return;
        }
        let status = match self.backend.fetch_status(&token).await {
            Ok(status) => status,
            Err(e) => {
                debug!("link: prior account lookup for {} failed: {e}", mask_token(&token));
                return;
            }
        };

        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.may_call(generation) {
            debug!(
                "link: prior account for {} discarded: {}",
                mask_token(&token),
                LinkError::StaleResult
            );
            return;
        }
        let prior = ConnectedMetadata::from_status(&status);
        info!("link: {} previously linked as {}", inner.masked_token(), prior.describe());
        inner.session.prior_account = Some(prior);
        inner.publish();
        self.dispatch(guard);
    }

    /// Poll timer fired. Returns whether the driver should keep running.
    pub(crate) fn on_poll_tick(&self, generation: u64) -> bool {
        if !self.lock().is_current(generation) {
            return false;
        }
        self.begin_status_check(generation, Trigger::Poll);
        true
    }

    pub(crate) fn on_rotation_tick(&self, generation: u64) -> bool {
        let mut guard = self.lock();
        if !guard.is_current(generation) {
            return false;
        }
        if guard.session.phase == LinkPhase::AwaitingScan {
            debug!("link: rotating QR for {}", guard.masked_token());
            self.spawn_qr_fetch(&mut guard, generation, Trigger::Rotation);
        }
        true
    }

    pub(crate) fn on_countdown_tick(&self, generation: u64) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.is_current(generation) {
            return false;
        }
        if inner.session.phase == LinkPhase::AwaitingScan {
            inner.session.expires_in_secs =
                next_countdown(inner.session.expires_in_secs, self.config.rotation_secs);
            inner.publish();
        }
        self.dispatch(guard);
        true
    }
}

/// Drives a QR device-link session against a [`LinkBackend`].
///
/// Observers registered with [`subscribe`](Self::subscribe) run after the
/// state lock is released, so they may call back into the controller (for
/// example `stop()` on `Connected`). Async hosts can use
/// [`watch`](Self::watch) instead.
///
/// Dropping the controller stops the session.
pub struct LinkSessionController {
    core: Core,
}

impl LinkSessionController {
    /// Build an idle controller. Fails if the timer policy is out of range.
    pub fn new(backend: Arc<dyn LinkBackend>, config: SessionConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let initial = LinkSnapshot {
            rotation_secs: config.rotation_secs,
            expires_in_secs: config.rotation_secs,
            ..Default::default()
        };
        let (watch_tx, _) = watch::channel(initial.clone());
        let inner = Inner {
            generation: 0,
            started: false,
            mode: LinkMode::Connect,
            session: initial,
            driver: None,
            poll_in_flight: false,
            qr_fetch: None,
            runtime: None,
            observers: Vec::new(),
            next_observer_id: 0,
            outbox: Vec::new(),
            dispatching: false,
            watch_tx,
        };
        Ok(Self {
            core: Core {
                backend,
                config: Arc::new(config),
                state: Arc::new(Mutex::new(inner)),
            },
        })
    }

    /// Start linking `token` in [`LinkMode::Connect`].
    pub fn start(&self, token: &str) -> Result<(), LinkError> {
        self.start_with(token, LinkMode::Connect)
    }

    /// Start linking `token`.
    ///
    /// Starting the token that is already running in the same mode is a
    /// no-op. A different token, or the same token in another mode, stops
    /// the current session and starts over. Must be called from within a
    /// tokio runtime.
    pub fn start_with(&self, token: &str, mode: LinkMode) -> Result<(), LinkError> {
        let token = validate_token(token)?;
        let runtime = Handle::try_current().map_err(|_| LinkError::NoRuntime)?;

        let mut guard = self.core.lock();
        let inner = &mut *guard;
        if inner.started {
            if inner.session.token.as_deref() == Some(token) && inner.mode == mode {
                debug!("link: {} already started", mask_token(token));
                return Ok(());
            }
            info!(
                "link: restarting {} ({:?}) as {} ({:?})",
                inner.masked_token(),
                inner.mode,
                mask_token(token),
                mode
            );
            inner.stop_session();
        }

        inner.generation += 1;
        inner.started = true;
        inner.mode = mode;
        inner.poll_in_flight = false;
        inner.qr_fetch = None;
        inner.runtime = Some(runtime);
        inner.session = LinkSnapshot {
            token: Some(token.to_string()),
            rotation_secs: self.core.config.rotation_secs,
            expires_in_secs: self.core.config.rotation_secs,
            ..Default::default()
        };
        info!("link: starting {:?} session for {}", mode, mask_token(token));
        inner.set_phase(LinkPhase::FetchingQr);
        inner.publish();

        let generation = inner.generation;
        self.core.spawn_qr_fetch(inner, generation, Trigger::Start);
        if mode == LinkMode::Relink {
            let core = self.core.clone();
            let token = token.to_string();
            inner.spawn(async move { core.run_prior_lookup(generation, token).await });
        }
        self.core.dispatch(guard);
        Ok(())
    }

    /// Stop the session and cancel all timers. Idempotent.
    ///
    /// A `Connected` session keeps its phase; anything else returns to `Idle`.
    pub fn stop(&self) {
        let mut guard = self.core.lock();
        guard.stop_session();
        self.core.dispatch(guard);
    }

    /// Fetch a fresh QR now and restart the countdown once it arrives.
    ///
    /// Also the way out of `Failed`. No-op when idle or linked. While a QR
    /// fetch is already running the refresh joins it instead of starting a
    /// second one; a fetch waiting to retry a not-ready answer retries now.
    pub fn refresh(&self) {
        let mut guard = self.core.lock();
        let inner = &mut *guard;
        if !inner.started || inner.session.phase == LinkPhase::Connected {
            debug!("link: refresh ignored in {}", inner.session.phase.as_str());
            return;
        }
        if let Some(driver) = &inner.driver {
            driver.reset_rotation();
        }
        if inner.session.phase == LinkPhase::Failed {
            inner.set_phase(LinkPhase::FetchingQr);
            inner.publish();
        }
        let generation = inner.generation;
        self.core.spawn_qr_fetch(inner, generation, Trigger::Refresh);
        self.core.dispatch(guard);
    }

    /// Run one status check immediately. No-op when idle or linked.
    pub fn check_now(&self) {
        let generation = {
            let guard = self.core.lock();
            if !guard.started || guard.session.phase == LinkPhase::Connected {
                debug!("link: manual check ignored in {}", guard.session.phase.as_str());
                return;
            }
            guard.generation
        };
        self.core.begin_status_check(generation, Trigger::Manual);
    }

    /// Register `callback` for every state change.
    ///
    /// Callbacks run outside the state lock, in publish order. A snapshot
    /// already being delivered when the subscription is dropped may still
    /// reach it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LinkSnapshot) + Send + Sync + 'static,
    {
        let mut guard = self.core.lock();
        let id = guard.next_observer_id;
        guard.next_observer_id += 1;
        guard.observers.push((id, Arc::new(callback)));
        Subscription {
            id,
            state: Arc::downgrade(&self.core.state),
        }
    }

    /// Receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<LinkSnapshot> {
        self.core.lock().watch_tx.subscribe()
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        self.core.lock().session.clone()
    }

    /// Mode of the current (or last) session.
    pub fn mode(&self) -> LinkMode {
        self.core.lock().mode
    }

    /// Whether a session is started and has not been stopped.
    pub fn is_active(&self) -> bool {
        self.core.lock().started
    }
}

impl Drop for LinkSessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Observer registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the observer immediately"]
pub struct Subscription {
    id: u64,
    state: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Explicitly unsubscribe. Same as dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).observers.retain(|(id, _)| *id != self.id);
        }
    }
}
