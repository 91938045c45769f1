//! Polling coordinator shared by the entities of one config entry
//!
//! The coordinator calls a fetch function on a fixed interval while anyone
//! listens, keeps the last good result and tells listeners when it changed.
//! At most one fetch runs at a time; callers that ask for a refresh while
//! one is running wait for it and get its outcome.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use ha_config_entries::SetupError;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const REQUEST_REFRESH_DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Why a fetch produced no data
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateFailed {
    #[error("{0}")]
    Error(String),

    /// Credentials were rejected; polling stops until the entry is reloaded
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

impl UpdateFailed {
    pub fn new(message: impl Into<String>) -> Self {
        UpdateFailed::Error(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        UpdateFailed::AuthFailed(message.into())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, UpdateFailed::AuthFailed(_))
    }
}

impl From<UpdateFailed> for SetupError {
    fn from(err: UpdateFailed) -> Self {
        match err {
            UpdateFailed::Error(message) => SetupError::NotReady(message),
            UpdateFailed::AuthFailed(message) => SetupError::AuthFailed(message),
        }
    }
}

type FetchFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, UpdateFailed>> + Send + Sync>;
type Listener = Arc<dyn Fn() + Send + Sync>;
type AuthFailedHook = Box<dyn Fn(&UpdateFailed) + Send + Sync>;
type Waiters = Option<Vec<oneshot::Sender<Result<(), UpdateFailed>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Status<T> {
    data: Option<Arc<T>>,
    last_update_success: bool,
    last_exception: Option<UpdateFailed>,
    last_update_success_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PollTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Debounce {
    timer: Option<JoinHandle<()>>,
    pending: bool,
}

/// Removes its listener when dropped
#[must_use = "the listener is removed when the guard is dropped"]
pub struct ListenerGuard {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerGuard {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

pub struct CoordinatorBuilder<T> {
    name: String,
    fetch: FetchFn<T>,
    update_interval: Option<Duration>,
    always_update: bool,
    polling_disabled: bool,
    cooldown: Duration,
    on_auth_failed: Option<AuthFailedHook>,
}

impl<T> CoordinatorBuilder<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// With `false`, listeners are skipped when a fetch returns equal data
    pub fn always_update(mut self, always_update: bool) -> Self {
        self.always_update = always_update;
        self
    }

    /// Mirrors the entry's `pref_disable_polling`
    pub fn polling_disabled(mut self, disabled: bool) -> Self {
        self.polling_disabled = disabled;
        self
    }

    pub fn request_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Called when a fetch fails with [`UpdateFailed::AuthFailed`]
    pub fn on_auth_failed(mut self, hook: impl Fn(&UpdateFailed) + Send + Sync + 'static) -> Self {
        self.on_auth_failed = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Arc<DataUpdateCoordinator<T>> {
        Arc::new_cyclic(|me| DataUpdateCoordinator {
            name: self.name,
            update_interval: self.update_interval,
            always_update: self.always_update,
            polling_disabled: self.polling_disabled,
            cooldown: self.cooldown,
            fetch: self.fetch,
            on_auth_failed: self.on_auth_failed,
            status: Mutex::new(Status {
                data: None,
                last_update_success: true,
                last_exception: None,
                last_update_success_time: None,
            }),
            inflight: Mutex::new(None),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener_id: AtomicU64::new(0),
            poll: Mutex::new(PollTimer::default()),
            debounce: Mutex::new(Debounce::default()),
            shutdown: AtomicBool::new(false),
            me: me.clone(),
        })
    }
}

pub struct DataUpdateCoordinator<T> {
    name: String,
    update_interval: Option<Duration>,
    always_update: bool,
    polling_disabled: bool,
    cooldown: Duration,
    fetch: FetchFn<T>,
    on_auth_failed: Option<AuthFailedHook>,
    status: Mutex<Status<T>>,
    /// `Some` while a refresh runs; holds the callers waiting for it
    inflight: Mutex<Waiters>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_listener_id: AtomicU64,
    poll: Mutex<PollTimer>,
    debounce: Mutex<Debounce>,
    shutdown: AtomicBool,
    me: Weak<Self>,
}

/// Releases the waiters of a refresh that was dropped before finishing
struct InflightGuard<'a> {
    slot: &'a Mutex<Waiters>,
}

impl InflightGuard<'_> {
    fn finish(self, result: &Result<(), UpdateFailed>) {
        let waiters = lock(self.slot).take().unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
    }
}

impl<T> DataUpdateCoordinator<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    pub fn builder<F, Fut>(name: impl Into<String>, fetch: F) -> CoordinatorBuilder<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UpdateFailed>> + Send + 'static,
    {
        CoordinatorBuilder {
            name: name.into(),
            fetch: Box::new(move || fetch().boxed()),
            update_interval: None,
            always_update: true,
            polling_disabled: false,
            cooldown: REQUEST_REFRESH_DEFAULT_COOLDOWN,
            on_auth_failed: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.update_interval
    }

    pub fn data(&self) -> Option<Arc<T>> {
        lock(&self.status).data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        lock(&self.status).last_update_success
    }

    pub fn last_exception(&self) -> Option<UpdateFailed> {
        lock(&self.status).last_exception.clone()
    }

    pub fn last_update_success_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.status).last_update_success_time
    }

    /// Refresh during entry setup
    ///
    /// A failure becomes `NotReady` so the entry is retried, or
    /// `AuthFailed` so a reauth flow starts.
    pub async fn first_refresh(&self) -> Result<(), SetupError> {
        self.refresh().await.map_err(SetupError::from)
    }

    /// Fetch now, or join the fetch that is already running
    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        let waiter = {
            let mut inflight = lock(&self.inflight);
            match inflight.as_mut() {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    *inflight = Some(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            debug!(name = %self.name, "Refresh in progress, waiting for it");
            return rx
                .await
                .unwrap_or_else(|_| Err(UpdateFailed::new("refresh was cancelled")));
        }

        let guard = InflightGuard {
            slot: &self.inflight,
        };
        let result = self.run_refresh().await;
        guard.finish(&result);
        result
    }

    async fn run_refresh(&self) -> Result<(), UpdateFailed> {
        self.cancel_poll();

        let outcome = (self.fetch)().await;

        let (result, notify) = {
            let mut status = lock(&self.status);
            let previous_success = status.last_update_success;
            match outcome {
                Ok(data) => {
                    if !previous_success {
                        info!("Fetching {} data recovered", self.name);
                    }
                    let changed = status.data.as_deref() != Some(&data);
                    status.data = Some(Arc::new(data));
                    status.last_update_success = true;
                    status.last_exception = None;
                    status.last_update_success_time = Some(Utc::now());
                    (Ok(()), self.always_update || !previous_success || changed)
                }
                Err(err) => {
                    if previous_success {
                        error!("Error fetching {} data: {}", self.name, err);
                    } else {
                        debug!("Error fetching {} data: {}", self.name, err);
                    }
                    status.last_update_success = false;
                    status.last_exception = Some(err.clone());
                    (Err(err), self.always_update || previous_success)
                }
            }
        };

        match &result {
            Err(err) if err.is_auth() => {
                if let Some(hook) = &self.on_auth_failed {
                    hook(err);
                }
            }
            _ => self.schedule_refresh(),
        }

        if notify {
            self.update_listeners();
        }
        result
    }

    /// Refresh soon, at most once per cooldown
    ///
    /// The first request runs right away; requests during the cooldown are
    /// folded into one refresh when it ends.
    pub async fn request_refresh(&self) {
        let run_now = {
            let mut debounce = lock(&self.debounce);
            if debounce.timer.is_some() {
                debounce.pending = true;
                false
            } else {
                debounce.timer = Some(self.spawn_cooldown());
                true
            }
        };
        if run_now {
            let _ = self.refresh().await;
        }
    }

    fn spawn_cooldown(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cooldown).await;
                let Some(coordinator) = me.upgrade() else {
                    return;
                };
                let run = {
                    let mut debounce = lock(&coordinator.debounce);
                    if debounce.pending {
                        debounce.pending = false;
                        true
                    } else {
                        debounce.timer = None;
                        false
                    }
                };
                if !run {
                    return;
                }
                let _ = coordinator.refresh().await;
            }
        })
    }

    /// Store data pushed by the device instead of polled
    pub fn set_updated_data(&self, data: T) {
        self.cancel_poll();
        {
            let mut status = lock(&self.status);
            status.data = Some(Arc::new(data));
            status.last_update_success = true;
            status.last_exception = None;
            status.last_update_success_time = Some(Utc::now());
        }
        debug!("Manually updated {} data", self.name);
        self.schedule_refresh();
        self.update_listeners();
    }

    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerGuard {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut listeners = lock(&self.listeners);
            let was_empty = listeners.is_empty();
            listeners.insert(id, Arc::new(listener));
            was_empty
        };
        if first {
            self.schedule_refresh();
        }

        let me = self.me.clone();
        ListenerGuard::new(move || {
            if let Some(coordinator) = me.upgrade() {
                coordinator.remove_listener(id);
            }
        })
    }

    fn remove_listener(&self, id: u64) {
        let now_empty = {
            let mut listeners = lock(&self.listeners);
            listeners.remove(&id);
            listeners.is_empty()
        };
        if now_empty {
            self.cancel_poll();
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn update_listeners(&self) {
        let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    fn schedule_refresh(&self) {
        let Some(interval) = self.update_interval else {
            return;
        };
        if self.polling_disabled
            || self.shutdown.load(Ordering::SeqCst)
            || lock(&self.listeners).is_empty()
        {
            return;
        }

        let mut poll = lock(&self.poll);
        poll.generation += 1;
        let generation = poll.generation;
        if let Some(task) = poll.task.take() {
            task.abort();
        }

        let me = self.me.clone();
        poll.task = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(coordinator) = me.upgrade() else {
                return;
            };
            if coordinator.claim_poll(generation) {
                let _ = coordinator.refresh().await;
            }
        }));
    }

    /// Detach the poll task that is about to refresh so rescheduling does
    /// not abort it
    fn claim_poll(&self, generation: u64) -> bool {
        let mut poll = lock(&self.poll);
        if poll.generation != generation {
            return false;
        }
        poll.task = None;
        true
    }

    fn cancel_poll(&self) {
        let mut poll = lock(&self.poll);
        poll.generation += 1;
        if let Some(task) = poll.task.take() {
            task.abort();
        }
    }

    /// Stop polling and pending debounced refreshes
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_poll();
        if let Some(timer) = lock(&self.debounce).timer.take() {
            timer.abort();
        }
        debug!(name = %self.name, "Coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Coordinator whose fetches pop results from a script, then return 0
    fn scripted(
        script: Vec<Result<u32, UpdateFailed>>,
    ) -> (CoordinatorBuilder<u32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let counter = calls.clone();
        let builder = DataUpdateCoordinator::builder("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = lock(&script).pop_front().unwrap_or(Ok(0));
            async move { next }
        });
        (builder, calls)
    }

    fn counting_listener(coordinator: &DataUpdateCoordinator<u32>) -> (ListenerGuard, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let guard = coordinator.add_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (guard, hits)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let coordinator = DataUpdateCoordinator::builder("slow", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(7_u32)
            }
        })
        .build();

        let (a, b, c) = tokio::join!(
            coordinator.refresh(),
            coordinator.refresh(),
            coordinator.refresh()
        );
        assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.data().as_deref(), Some(&7));

        coordinator.refresh().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_streak_and_recovery() {
        let (builder, _) = scripted(vec![
            Ok(1),
            Err(UpdateFailed::new("timeout")),
            Err(UpdateFailed::new("timeout")),
            Ok(2),
        ]);
        let coordinator = builder.build();
        let (_guard, hits) = counting_listener(&coordinator);

        coordinator.refresh().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let first_success = coordinator.last_update_success_time();
        assert!(first_success.is_some());

        assert!(coordinator.refresh().await.is_err());
        assert!(!coordinator.last_update_success());
        assert_eq!(
            coordinator.last_exception(),
            Some(UpdateFailed::new("timeout"))
        );
        // Last good data is kept
        assert_eq!(coordinator.data().as_deref(), Some(&1));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Every refresh notifies while always_update is set
        assert!(coordinator.refresh().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        coordinator.refresh().await.unwrap();
        assert!(coordinator.last_update_success());
        assert_eq!(coordinator.last_exception(), None);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_repeated_failure_notifies_once_without_always_update() {
        let (builder, _) = scripted(vec![
            Ok(1),
            Err(UpdateFailed::new("timeout")),
            Err(UpdateFailed::new("timeout")),
        ]);
        let coordinator = builder.always_update(false).build();
        let (_guard, hits) = counting_listener(&coordinator);

        coordinator.refresh().await.unwrap();
        assert!(coordinator.refresh().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(coordinator.refresh().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unchanged_data_skips_listeners() {
        let (builder, _) = scripted(vec![Ok(5), Ok(5), Ok(6)]);
        let coordinator = builder.always_update(false).build();
        let (_guard, hits) = counting_listener(&coordinator);

        coordinator.refresh().await.unwrap();
        coordinator.refresh().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        coordinator.refresh().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_only_while_listened_to() {
        let (builder, calls) = scripted(vec![]);
        let coordinator = builder.update_interval(Duration::from_secs(5)).build();

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let (guard, hits) = counting_listener(&coordinator);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(guard);
        assert_eq!(coordinator.listener_count(), 0);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_polling_and_shutdown() {
        let (builder, calls) = scripted(vec![]);
        let coordinator = builder
            .update_interval(Duration::from_secs(5))
            .polling_disabled(true)
            .build();
        let (_guard, _) = counting_listener(&coordinator);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let (builder, calls) = scripted(vec![]);
        let coordinator = builder.update_interval(Duration::from_secs(5)).build();
        let (_guard, _) = counting_listener(&coordinator);
        coordinator.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_refresh_maps_errors() {
        let (builder, _) = scripted(vec![Err(UpdateFailed::new("offline"))]);
        assert_eq!(
            builder.build().first_refresh().await,
            Err(SetupError::NotReady("offline".to_string()))
        );

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let counter = hook_calls.clone();
        let (builder, _) = scripted(vec![Err(UpdateFailed::auth("expired"))]);
        let coordinator = builder
            .on_auth_failed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        assert_eq!(
            coordinator.first_refresh().await,
            Err(SetupError::AuthFailed("expired".to_string()))
        );
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_refresh_is_debounced() {
        let (builder, calls) = scripted(vec![]);
        let coordinator = builder.build();

        coordinator.request_refresh().await;
        coordinator.request_refresh().await;
        coordinator.request_refresh().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_set_updated_data_notifies() {
        let (builder, calls) = scripted(vec![Err(UpdateFailed::new("down"))]);
        let coordinator = builder.build();
        let _ = coordinator.refresh().await;
        let (_guard, hits) = counting_listener(&coordinator);

        coordinator.set_updated_data(42);
        assert!(coordinator.last_update_success());
        assert_eq!(coordinator.data().as_deref(), Some(&42));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
