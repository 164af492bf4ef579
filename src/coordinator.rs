//! Poll Coordinator Module
//!
//! Drives login, vehicle discovery, command dispatch and status polling on a
//! fixed interval, and publishes the latest snapshot to observers.
//!
//! One cycle runs at a time. A cycle walks the state machine from wherever
//! the previous cycle left it:
//!
//! ```text
//! Unauthenticated --login--> AuthenticatedNoVehicles --vehicles--> Ready
//!        ^                                                          |
//!        +------------------- status fetch failed ------------------+
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::{AuthManager, Credentials};
use crate::commands::{self, CommandError, CommandKind, CommandRequest};
use crate::config::{ConfigError, SyncConfig, DEFAULT_POLL_INTERVAL_SECS};
use crate::registry::{Vehicle, VehicleRegistry};
use crate::sync::{ApiClient, ApiError, TelematicsApi};
use crate::telemetry::{self, Snapshot};

/// Where the coordinator stands between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unauthenticated,
    AuthenticatedNoVehicles,
    Ready,
}

/// Result of one call to [`Coordinator::refresh`]
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// A new snapshot was published.
    Published(Arc<Snapshot>),
    /// The cycle failed; it is retried on the next tick.
    Failed(ApiError),
    /// Another cycle was already running, nothing was done.
    Coalesced,
}

/// Errors building a coordinator from configuration
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ApiError),
}

/// Handle returned when registering an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// State owned by the running cycle
struct CycleState {
    state: SyncState,
    auth: AuthManager,
    registry: VehicleRegistry,
}

/// Published view of the last finished cycle
struct Status {
    state: SyncState,
    last_update_success: bool,
    last_error: Option<ApiError>,
    last_success_at: Option<DateTime<Utc>>,
    vehicles: Vec<Vehicle>,
}

/// Periodic sync coordinator for one account
pub struct Coordinator<A: TelematicsApi> {
    api: A,
    poll_interval: Duration,
    cycle: tokio::sync::Mutex<CycleState>,
    pending: Mutex<Option<CommandRequest>>,
    status: Mutex<Status>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl Coordinator<ApiClient> {
    /// Build a coordinator talking to the real cloud API.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let api = ApiClient::new(&config.api_base_url, config.request_timeout())?;
        Ok(Self::new(api, config.credentials(), config.poll_interval()))
    }
}

impl<A: TelematicsApi> Coordinator<A> {
    /// A zero `poll_interval` falls back to the default interval.
    pub fn new(api: A, credentials: Credentials, mut poll_interval: Duration) -> Self {
        if poll_interval.is_zero() {
            poll_interval = Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS);
            warn!("Poll interval of zero requested, using {:?}", poll_interval);
        }
        debug!("Data will be updated every {:?}", poll_interval);
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            api,
            poll_interval,
            cycle: tokio::sync::Mutex::new(CycleState {
                state: SyncState::Unauthenticated,
                auth: AuthManager::new(credentials),
                registry: VehicleRegistry::new(),
            }),
            pending: Mutex::new(None),
            status: Mutex::new(Status {
                state: SyncState::Unauthenticated,
                last_update_success: false,
                last_error: None,
                last_success_at: None,
                vehicles: Vec::new(),
            }),
            snapshot,
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one poll cycle unless one is already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Ok(mut cycle) = self.cycle.try_lock() else {
            debug!("Poll cycle already running, skipping");
            return RefreshOutcome::Coalesced;
        };

        let result = self.run_cycle(&mut cycle).await;
        debug_assert!(cycle.state != SyncState::Ready || !cycle.registry.is_empty());

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.snapshot.send_replace(Arc::clone(&snapshot));
                self.record(&cycle, None);
                drop(cycle);

                debug!("Published snapshot with {} vehicle(s)", snapshot.len());
                self.notify(&snapshot);
                RefreshOutcome::Published(snapshot)
            }
            Err(e) => {
                warn!("Poll cycle failed in state {:?}: {}", cycle.state, e);
                self.record(&cycle, Some(e.clone()));
                RefreshOutcome::Failed(e)
            }
        }
    }

    async fn run_cycle(&self, cycle: &mut CycleState) -> Result<Snapshot, ApiError> {
        if cycle.state == SyncState::Unauthenticated {
            cycle.auth.login(&self.api).await?;
            cycle.registry.clear();
            cycle.state = SyncState::AuthenticatedNoVehicles;
        }

        let Some(session) = cycle.auth.session().cloned() else {
            cycle.state = SyncState::Unauthenticated;
            return Err(ApiError::Auth("no active session".into()));
        };

        if cycle.state == SyncState::AuthenticatedNoVehicles {
            cycle.registry.refresh(&self.api, &session).await?;
            cycle.state = SyncState::Ready;
        }

        if let Some(request) = self.take_pending() {
            if cycle.registry.contains(&request.vin) {
                commands::dispatch(&self.api, &session, &request).await;
            } else {
                warn!(
                    "Discarding {} command for unknown vehicle {}",
                    request.action.kind(),
                    request.vin
                );
            }
        }

        match telemetry::fetch_all(&self.api, &session, cycle.registry.vehicles()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                // Any status failure is treated as an expired token.
                info!("Status poll failed, logging in again on next cycle");
                cycle.auth.invalidate();
                cycle.state = SyncState::Unauthenticated;
                Err(e)
            }
        }
    }

    /// Run one cycle now and report its failure as an error.
    ///
    /// Meant for start-up, where a failure means the service is not ready.
    pub async fn first_refresh(&self) -> Result<Arc<Snapshot>, ApiError> {
        match self.refresh().await {
            RefreshOutcome::Published(snapshot) => Ok(snapshot),
            RefreshOutcome::Failed(e) => Err(e),
            RefreshOutcome::Coalesced => {
                // Wait for the running cycle and report its outcome.
                drop(self.cycle.lock().await);
                if self.last_update_succeeded() {
                    Ok(self.snapshot())
                } else {
                    Err(self
                        .last_error()
                        .unwrap_or_else(|| ApiError::Auth("first refresh did not complete".into())))
                }
            }
        }
    }

    /// Poll on the configured interval until `shutdown` resolves.
    ///
    /// The first cycle runs one interval after start; call
    /// [`first_refresh`](Self::first_refresh) beforehand for an immediate one.
    /// A cycle still in flight when `shutdown` resolves is abandoned.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Polling every {:?}", self.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Poll loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Poll loop stopped, abandoning running cycle");
                            break;
                        }
                        _ = self.refresh() => {}
                    }
                }
            }
        }
    }

    /// Queue a command for the next cycle, replacing any queued one.
    pub fn submit_command(
        &self,
        vin: impl Into<String>,
        kind: CommandKind,
        value: Option<&Value>,
    ) -> Result<(), CommandError> {
        let request = CommandRequest::new(vin, kind, value)?;
        self.submit(request);
        Ok(())
    }

    /// Queue an already validated command for the next cycle.
    pub fn submit(&self, request: CommandRequest) {
        info!("Queued {} command for {}", request.action.kind(), request.vin);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.replace(request) {
            warn!(
                "Replaced pending {} command for {}",
                previous.action.kind(),
                previous.vin
            );
        }
    }

    pub fn pending_command(&self) -> Option<CommandRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_pending(&self) -> Option<CommandRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Register a callback run after every published snapshot.
    pub fn on_snapshot_updated<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Unregister an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    /// Most recently published snapshot (empty before the first success).
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn state(&self) -> SyncState {
        self.with_status(|s| s.state)
    }

    pub fn last_update_succeeded(&self) -> bool {
        self.with_status(|s| s.last_update_success)
    }

    pub fn last_error(&self) -> Option<ApiError> {
        self.with_status(|s| s.last_error.clone())
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.with_status(|s| s.last_success_at)
    }

    /// Vehicles known to the current session.
    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.with_status(|s| s.vehicles.clone())
    }

    fn with_status<T>(&self, f: impl FnOnce(&Status) -> T) -> T {
        f(&self.status.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn record(&self, cycle: &CycleState, error: Option<ApiError>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.state = cycle.state;
        status.vehicles = cycle.registry.vehicles().to_vec();
        status.last_update_success = error.is_none();
        if error.is_none() {
            status.last_success_at = Some(Utc::now());
        }
        status.last_error = error;
    }

    fn notify(&self, snapshot: &Snapshot) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(snapshot);
        }
    }
}
