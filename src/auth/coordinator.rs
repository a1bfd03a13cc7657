// Single-flight session refresh

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use super::store::CredentialStore;
use super::types::{Credential, SessionEvent};
use crate::error::RefreshError;

/// Produces one refresh attempt
pub type RefreshFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Credential, RefreshError>> + Send + Sync>;

type InFlight = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

const EVENT_CAPACITY: usize = 16;

/// Serializes session refreshes.
///
/// At most one refresh runs at a time. Callers arriving while it runs attach to the same shared
/// future and all observe the same outcome. The refresh itself runs in a spawned task, so a caller
/// dropping its future does not strand the others.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    refresh: RefreshFn,
    store: Arc<dyn CredentialStore>,
    timeout: Duration,
    login_route: String,
    events: broadcast::Sender<SessionEvent>,
    in_flight: Mutex<Option<InFlight>>,
    refresh_count: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        refresh: RefreshFn,
        store: Arc<dyn CredentialStore>,
        timeout: Duration,
        login_route: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                refresh,
                store,
                timeout,
                login_route: login_route.into(),
                events,
                in_flight: Mutex::new(None),
                refresh_count: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to refresh outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of refresh calls started so far
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::SeqCst)
    }

    pub async fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().await.is_some()
    }

    /// Get a credential newer than `stale`, refreshing or awaiting an in-flight refresh.
    ///
    /// `stale` is the token the rejected request was sent with. If the store already holds a
    /// different one, a refresh finished in the meantime and that credential is returned as-is.
    pub async fn fresh_credential(&self, stale: Option<&str>) -> Result<Credential, RefreshError> {
        let pending = {
            let mut slot = self.inner.in_flight.lock().await;

            match slot.clone() {
                Some(pending) => {
                    tracing::debug!("Refresh already in progress, waiting for it to settle");
                    pending
                }
                None => {
                    if let Some(current) = self.newer_credential(stale).await {
                        tracing::debug!(
                            token = %current.preview(),
                            "Credential changed since request was sent, skipping refresh"
                        );
                        return Ok(current);
                    }

                    let pending = self.start_refresh();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    // Store I/O runs on the blocking pool; the slot stays locked meanwhile
    async fn newer_credential(&self, stale: Option<&str>) -> Option<Credential> {
        let store = Arc::clone(&self.inner.store);

        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(Ok(Some(current))) if Some(current.token.as_str()) != stale => Some(current),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read credential store: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Credential store read aborted: {}", e);
                None
            }
        }
    }

    // Caller must hold the in-flight slot lock
    fn start_refresh(&self) -> InFlight {
        let inner = Arc::clone(&self.inner);
        let generation = inner.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, "Starting session refresh");

        let task = tokio::spawn(async move {
            let attempt = async {
                let refresh = (inner.refresh)();
                let credential = match tokio::time::timeout(inner.timeout, refresh).await {
                    Ok(result) => result?,
                    Err(_) => return Err(RefreshError::Timeout(inner.timeout)),
                };

                let store = Arc::clone(&inner.store);
                let saved = credential.clone();
                tokio::task::spawn_blocking(move || store.save(&saved))
                    .await
                    .map_err(|e| RefreshError::Aborted(e.to_string()))?
                    .map_err(|e| RefreshError::Store(e.to_string()))?;

                Ok::<_, RefreshError>(credential)
            };

            // A panicking refresh settles like any other failure
            let result = AssertUnwindSafe(attempt)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(RefreshError::Aborted(panic_message(panic.as_ref())))
                });

            match &result {
                Ok(credential) => {
                    let _ = inner.events.send(SessionEvent::Refreshed {
                        expires_at: credential.expires_at,
                    });
                }
                Err(e) => inner.expire(generation, e),
            }

            // Cleared before any waiter can observe the result
            inner.in_flight.lock().await.take();
            result
        });

        let owner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    // Task was cancelled before it could settle
                    let err = RefreshError::Aborted(e.to_string());
                    owner.expire(generation, &err);
                    owner.in_flight.lock().await.take();
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn expire(&self, generation: u64, reason: &RefreshError) {
        tracing::error!(
            generation,
            error = %reason,
            "Session refresh failed, session expired"
        );
        let _ = self.events.send(SessionEvent::Expired {
            reason: reason.clone(),
            login_route: self.login_route.clone(),
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "refresh panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Refresh that counts calls and resolves only once `gate` is notified
    fn gated_refresh(
        calls: Arc<AtomicUsize>,
        gate: Arc<Notify>,
        outcome: Result<Credential, RefreshError>,
    ) -> RefreshFn {
        Arc::new(move || {
            let calls = calls.clone();
            let gate = gate.clone();
            let outcome = outcome.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                outcome
            }
            .boxed()
        })
    }

    fn coordinator(refresh: RefreshFn, store: Arc<MemoryStore>) -> RefreshCoordinator {
        RefreshCoordinator::new(refresh, store, Duration::from_secs(5), "/login")
    }

    async fn wait_until_refreshing(coordinator: &RefreshCoordinator) {
        while !coordinator.is_refreshing().await {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryStore::with_credential(Credential::new("T1")));
        let coordinator = coordinator(
            gated_refresh(calls.clone(), gate.clone(), Ok(Credential::new("T2"))),
            store.clone(),
        );

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.fresh_credential(Some("T1")).await })
            })
            .collect();

        wait_until_refreshing(&coordinator).await;
        // Give every waiter a chance to attach before releasing the refresh
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().token, "T2");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
        assert_eq!(store.load().unwrap().unwrap().token, "T2");
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_callers_and_emits_one_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let failure = RefreshError::Rejected {
            status: 401,
            message: "refresh token revoked".to_string(),
        };
        let store = Arc::new(MemoryStore::with_credential(Credential::new("T1")));
        let coordinator = coordinator(
            gated_refresh(calls.clone(), gate.clone(), Err(failure.clone())),
            store.clone(),
        );
        let mut events = coordinator.subscribe();

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.fresh_credential(Some("T1")).await })
        };
        wait_until_refreshing(&coordinator).await;

        let others: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.fresh_credential(Some("T1")).await })
            })
            .collect();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        assert_eq!(first.await.unwrap().unwrap_err(), failure);
        for other in others {
            assert_eq!(other.await.unwrap().unwrap_err(), failure);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Expired {
                reason: failure,
                login_route: "/login".to_string(),
            }
        );
        assert!(events.try_recv().is_err());

        // Old credential is left in place
        assert_eq!(store.load().unwrap().unwrap().token, "T1");
    }

    #[tokio::test]
    async fn test_refresh_timeout_fails_waiters() {
        let refresh: RefreshFn = Arc::new(|| {
            futures::future::pending::<Result<Credential, RefreshError>>().boxed()
        });
        let coordinator = RefreshCoordinator::new(
            refresh,
            Arc::new(MemoryStore::new()),
            Duration::from_millis(50),
            "/login",
        );
        let mut events = coordinator.subscribe();

        let err = coordinator.fresh_credential(None).await.unwrap_err();
        assert_eq!(err, RefreshError::Timeout(Duration::from_millis(50)));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Expired { .. }
        ));
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_newer_stored_credential_skips_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryStore::with_credential(Credential::new("T2")));
        let coordinator = coordinator(
            gated_refresh(calls.clone(), gate, Ok(Credential::new("T3"))),
            store,
        );

        let credential = coordinator.fresh_credential(Some("T1")).await.unwrap();
        assert_eq!(credential.token, "T2");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_run_separately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let refresh: RefreshFn = {
            let counter = counter.clone();
            Arc::new(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, RefreshError>(Credential::new(format!("T{}", n + 1))) }
                    .boxed()
            })
        };
        let store = Arc::new(MemoryStore::with_credential(Credential::new("T1")));
        let coordinator = coordinator(refresh, store);

        let second = coordinator.fresh_credential(Some("T1")).await.unwrap();
        assert_eq!(second.token, "T2");

        let third = coordinator.fresh_credential(Some("T2")).await.unwrap();
        assert_eq!(third.token, "T3");
        assert_eq!(coordinator.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_refreshed_event_on_success() {
        let refresh: RefreshFn = Arc::new(|| {
            async { Ok::<_, RefreshError>(Credential::expiring_in("T2", 60).unwrap()) }.boxed()
        });
        let coordinator = coordinator(refresh, Arc::new(MemoryStore::new()));
        let mut events = coordinator.subscribe();

        coordinator.fresh_credential(None).await.unwrap();
        match events.recv().await.unwrap() {
            SessionEvent::Refreshed { expires_at } => assert!(expires_at.is_some()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_refresh_frees_slot() {
        let counter = Arc::new(AtomicUsize::new(0));
        let refresh: RefreshFn = {
            let counter = counter.clone();
            Arc::new(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("expiry out of range");
                    }
                    Ok::<_, RefreshError>(Credential::new("T3"))
                }
                .boxed()
            })
        };
        let store = Arc::new(MemoryStore::with_credential(Credential::new("T1")));
        let coordinator = coordinator(refresh, store.clone());
        let mut events = coordinator.subscribe();

        let err = coordinator.fresh_credential(Some("T1")).await.unwrap_err();
        match &err {
            RefreshError::Aborted(message) => assert!(message.contains("expiry out of range")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!coordinator.is_refreshing().await);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Expired {
                reason: err,
                login_route: "/login".to_string(),
            }
        );

        // Next 401 starts a new refresh instead of replaying the failure
        let credential = coordinator.fresh_credential(Some("T1")).await.unwrap();
        assert_eq!(credential.token, "T3");
        assert_eq!(coordinator.refresh_count(), 2);
        assert_eq!(store.load().unwrap().unwrap().token, "T3");
    }

    #[tokio::test]
    async fn test_dropped_initiator_does_not_strand_waiters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let store = Arc::new(MemoryStore::with_credential(Credential::new("T1")));
        let coordinator = coordinator(
            gated_refresh(calls.clone(), gate.clone(), Ok(Credential::new("T2"))),
            store.clone(),
        );

        let initiator = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.fresh_credential(Some("T1")).await })
        };
        wait_until_refreshing(&coordinator).await;

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.fresh_credential(Some("T1")).await })
            })
            .collect();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        initiator.abort();
        assert!(initiator.await.unwrap_err().is_cancelled());
        gate.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().token, "T2");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing().await);
        assert_eq!(store.load().unwrap().unwrap().token, "T2");
    }

    /// Memory store that records which threads read it
    #[derive(Default)]
    struct ThreadRecordingStore {
        inner: MemoryStore,
        readers: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl CredentialStore for ThreadRecordingStore {
        fn load(&self) -> anyhow::Result<Option<Credential>> {
            self.readers.lock().unwrap().push(std::thread::current().id());
            self.inner.load()
        }

        fn save(&self, credential: &Credential) -> anyhow::Result<()> {
            self.inner.save(credential)
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear()
        }
    }

    #[tokio::test]
    async fn test_store_read_runs_off_runtime_thread() {
        let store = Arc::new(ThreadRecordingStore::default());
        store.save(&Credential::new("T2")).unwrap();

        let refresh: RefreshFn = Arc::new(|| {
            futures::future::pending::<Result<Credential, RefreshError>>().boxed()
        });
        let coordinator =
            RefreshCoordinator::new(refresh, store.clone(), Duration::from_secs(5), "/login");

        let credential = coordinator.fresh_credential(Some("T1")).await.unwrap();
        assert_eq!(credential.token, "T2");

        let readers = store.readers.lock().unwrap();
        assert!(!readers.is_empty());
        assert!(readers.iter().all(|id| *id != std::thread::current().id()));
    }
}
