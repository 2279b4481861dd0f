// SessionStateMachine: authoritative capture session lifecycle
//
// States: Created -> Capturing -> Stopping -> {Completed, Failed}.
// Every transition for a session id goes through that session's exclusive
// async mutex, so a client stop racing an observed subprocess crash
// resolves deterministically: whichever acquires the lock first decides
// the terminal state and the loser folds into a no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::api::{epoch_ms, DeviceIdentity, Point, Session, SessionStatus};
use crate::capture::{CaptureHandle, CaptureSupervisor};
use crate::cluster::{cluster_loop, ClusterSession};
use crate::config::AppConfig;
use crate::device::DeviceLink;
use crate::error::{log_session_error, SessionError};
use crate::extract::OfflineExtractor;
use crate::ingest::ingest_loop;
use crate::process::ExitReport;
use crate::store::TelemetryStore;
use crate::stream::StreamBroker;

/// One registered session: the record plus its live work handles
struct SessionSlot {
    record: AsyncMutex<Session>,
    runtime: StdMutex<Option<SessionRuntime>>,
    cluster: Arc<ClusterSession>,
}

/// Handles for the background work of a capturing session
struct SessionRuntime {
    cancel: CancellationToken,
    capture: Arc<AsyncMutex<CaptureHandle>>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<u64, Arc<SessionSlot>>,
    /// device id -> session id for every non-terminal session
    active: HashMap<String, u64>,
}

/// Owns every session's lifecycle and background work
pub struct SessionManager {
    config: AppConfig,
    device: Arc<dyn DeviceLink>,
    store: Arc<dyn TelemetryStore>,
    broker: Arc<StreamBroker>,
    supervisor: CaptureSupervisor,
    registry: StdMutex<Registry>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: AppConfig,
        device: Arc<dyn DeviceLink>,
        store: Arc<dyn TelemetryStore>,
        broker: Arc<StreamBroker>,
    ) -> Self {
        let supervisor = CaptureSupervisor::new(config.capture.clone(), Arc::clone(&broker));
        Self {
            config,
            device,
            store,
            broker,
            supervisor,
            registry: StdMutex::new(Registry::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start a capture session for a device.
    ///
    /// Fails with `DeviceBusy` when the device already has a non-terminal
    /// session, `DeviceUnreachable` when it is not attached, and
    /// `SpawnFailure` when the capture tool cannot be started (the session
    /// is then recorded as Failed).
    pub async fn start(self: Arc<Self>, device_id: &str) -> Result<Session, SessionError> {
        self.check_device_attached(device_id).await?;
        let identity = self.query_identity(device_id).await;

        // Reserve the device and the id atomically so two concurrent
        // starts cannot both pass the busy check.
        let (session_id, slot) = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            if let Some(active) = registry.active.get(device_id) {
                log::warn!(
                    "[SessionManager] Device {} busy with session {}",
                    device_id,
                    active
                );
                return Err(SessionError::DeviceBusy {
                    device_id: device_id.to_string(),
                });
            }

            let session_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let start_time = epoch_ms();
            let session = Session {
                id: session_id,
                device_id: device_id.to_string(),
                device_model: identity.model.clone(),
                firmware: identity.firmware.clone(),
                status: SessionStatus::Created,
                start_time,
                end_time: None,
                session_dir: self.session_dir_for(device_id, start_time),
                artifacts: Vec::new(),
                failure: None,
            };
            let slot = Arc::new(SessionSlot {
                record: AsyncMutex::new(session),
                runtime: StdMutex::new(None),
                cluster: Arc::new(ClusterSession::new(session_id, self.config.clustering.clone())),
            });
            registry.slots.insert(session_id, Arc::clone(&slot));
            registry.active.insert(device_id.to_string(), session_id);
            (session_id, slot)
        };

        let created = slot.record.lock().await.clone();
        self.store.append_session(&created);
        log::info!(
            "[SessionManager] Created session {} for device {}",
            session_id,
            device_id
        );

        if let Err(err) = tokio::fs::create_dir_all(&created.session_dir).await {
            let failure = SessionError::Io {
                context: format!("creating {}: {}", created.session_dir, err),
            };
            self.fail_during_start(&slot, &failure).await;
            return Err(failure);
        }

        self.broker.open(session_id);
        let mut capture = match self.supervisor.start_capture(&created).await {
            Ok(capture) => capture,
            Err(err) => {
                self.fail_during_start(&slot, &err).await;
                self.broker.complete(session_id);
                return Err(err);
            }
        };

        // Confirmed running: transition to Capturing under the session lock.
        let snapshot = {
            let mut record = slot.record.lock().await;
            if record.status.is_terminal() {
                // A stop raced session creation; the subprocess is orphaned.
                log::warn!(
                    "[SessionManager] Session {} reached a terminal state during start",
                    session_id
                );
                let (_, artifacts) = self.supervisor.stop_capture(&mut capture).await;
                for artifact in &artifacts {
                    self.store.append_artifact(artifact);
                }
                record.artifacts = artifacts;
                self.store.update_session(&record);
                return Ok(record.clone());
            }
            record.status = SessionStatus::Capturing;
            self.store.update_session(&record);
            record.clone()
        };

        let exit_rx = capture.exit_receiver();
        let cancel = CancellationToken::new();
        let capture = Arc::new(AsyncMutex::new(capture));
        *slot.runtime.lock().expect("runtime poisoned") = Some(SessionRuntime {
            cancel: cancel.clone(),
            capture,
        });

        tokio::spawn(ingest_loop(
            session_id,
            device_id.to_string(),
            Arc::clone(&self.device),
            Arc::clone(&self.broker),
            Arc::clone(&slot.cluster),
            Arc::clone(&self.store),
            self.config.ingest.clone(),
            cancel.clone(),
        ));
        tokio::spawn(cluster_loop(
            Arc::clone(&slot.cluster),
            Arc::clone(&self.broker),
            cancel.clone(),
        ));

        // Watch for an exit nobody requested.
        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            let mut exit_rx = exit_rx;
            loop {
                let report = exit_rx.borrow().clone();
                if let Some(report) = report {
                    if !report.requested {
                        manager.handle_unrequested_exit(session_id, report).await;
                    }
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        log::info!("[SessionManager] Session {} is capturing", session_id);
        Ok(snapshot)
    }

    /// Stop a session. Idempotent: a terminal session returns its current
    /// state, an unknown id returns None.
    pub async fn stop(&self, session_id: u64) -> Option<Session> {
        let slot = self.slot(session_id)?;
        let mut record = slot.record.lock().await;
        if record.status.is_terminal() {
            log::info!(
                "[SessionManager] Stop on terminal session {} is a no-op",
                session_id
            );
            return Some(record.clone());
        }

        record.status = SessionStatus::Stopping;
        self.store.update_session(&record);
        log::info!("[SessionManager] Stopping session {}", session_id);

        let runtime = slot.runtime.lock().expect("runtime poisoned").take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            let mut capture = runtime.capture.lock().await;
            let (report, artifacts) = self.supervisor.stop_capture(&mut capture).await;
            log::info!(
                "[SessionManager] Capture for session {} exited with code {:?}",
                session_id,
                report.code
            );
            for artifact in &artifacts {
                self.store.append_artifact(artifact);
            }
            record.artifacts = artifacts;
        }

        record.status = SessionStatus::Completed;
        record.end_time = Some(epoch_ms());
        self.store.update_session(&record);
        self.release_device(&record.device_id);
        self.broker.complete(session_id);
        Some(record.clone())
    }

    /// Terminal transition for a crash observed by the exit watcher.
    ///
    /// Runs under the session lock; if a client stop won the race the
    /// session is already terminal and this folds into a no-op.
    async fn handle_unrequested_exit(&self, session_id: u64, report: ExitReport) {
        let Some(slot) = self.slot(session_id) else {
            return;
        };
        let mut record = slot.record.lock().await;
        if record.status.is_terminal() {
            return;
        }

        log::error!(
            "[SessionManager] Capture for session {} exited unexpectedly (code {:?})",
            session_id,
            report.code
        );

        let runtime = slot.runtime.lock().expect("runtime poisoned").take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            let mut capture = runtime.capture.lock().await;
            let artifacts = self.supervisor.finalize_artifacts(&mut capture).await;
            for artifact in &artifacts {
                self.store.append_artifact(artifact);
            }
            record.artifacts = artifacts;
        }

        record.status = SessionStatus::Failed;
        record.end_time = Some(epoch_ms());
        record.failure = Some(
            SessionError::AbnormalExit {
                code: report.code,
                stderr_tail: report.stderr_tail,
            }
            .to_string(),
        );
        self.store.update_session(&record);
        self.release_device(&record.device_id);
        self.broker.complete(session_id);
    }

    /// Register an already-completed session around a previously captured
    /// trace and seed its point set for offline analysis.
    pub async fn create_offline(
        &self,
        trace: &Path,
        extractor: &dyn OfflineExtractor,
    ) -> Result<Session, SessionError> {
        let points = extractor.extract_gps_points(trace).map_err(|err| {
            SessionError::Io {
                context: format!("extracting {}: {}", trace.display(), err),
            }
        })?;

        let session_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = epoch_ms();
        let session_dir = trace
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_string_lossy()
            .into_owned();
        let session = Session {
            id: session_id,
            device_id: "offline".to_string(),
            device_model: "Offline".to_string(),
            firmware: "N/A".to_string(),
            status: SessionStatus::Completed,
            start_time: now,
            end_time: Some(now),
            session_dir,
            artifacts: Vec::new(),
            failure: None,
        };

        let cluster = Arc::new(ClusterSession::new(
            session_id,
            self.config.clustering.clone(),
        ));
        cluster.seed_points(points.clone());

        let slot = Arc::new(SessionSlot {
            record: AsyncMutex::new(session.clone()),
            runtime: StdMutex::new(None),
            cluster,
        });
        self.registry
            .lock()
            .expect("registry poisoned")
            .slots
            .insert(session_id, slot);

        self.store.append_session(&session);
        for point in &points {
            self.store.append_point(session_id, point);
        }
        log::info!(
            "[SessionManager] Offline session {} seeded with {} points from {}",
            session_id,
            points.len(),
            trace.display()
        );
        Ok(session)
    }

    pub async fn session(&self, session_id: u64) -> Option<Session> {
        match self.slot(session_id) {
            Some(slot) => Some(slot.record.lock().await.clone()),
            None => self.store.session(session_id),
        }
    }

    pub fn recent_sessions(&self, limit: usize) -> Vec<Session> {
        self.store.recent_sessions(limit)
    }

    /// The session's live point set, falling back to persisted points for
    /// sessions this process no longer holds.
    pub fn points_for(&self, session_id: u64) -> Option<Vec<Point>> {
        if let Some(slot) = self.slot(session_id) {
            return Some(slot.cluster.snapshot());
        }
        let persisted = self.store.points(session_id);
        if persisted.is_empty() && self.store.session(session_id).is_none() {
            return None;
        }
        Some(persisted)
    }

    /// The cluster engine state for a registered session.
    pub fn cluster_session(&self, session_id: u64) -> Option<Arc<ClusterSession>> {
        self.slot(session_id).map(|slot| Arc::clone(&slot.cluster))
    }

    fn slot(&self, session_id: u64) -> Option<Arc<SessionSlot>> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .slots
            .get(&session_id)
            .cloned()
    }

    fn release_device(&self, device_id: &str) {
        self.registry
            .lock()
            .expect("registry poisoned")
            .active
            .remove(device_id);
    }

    async fn fail_during_start(&self, slot: &SessionSlot, err: &SessionError) {
        log_session_error(err, "session start");
        let mut record = slot.record.lock().await;
        record.status = SessionStatus::Failed;
        record.end_time = Some(epoch_ms());
        record.failure = Some(err.to_string());
        self.store.update_session(&record);
        self.release_device(&record.device_id);
    }

    async fn check_device_attached(&self, device_id: &str) -> Result<(), SessionError> {
        let timeout = Duration::from_millis(self.config.ingest.query_timeout_ms);
        let attached = tokio::time::timeout(timeout, self.device.list_devices())
            .await
            .ok()
            .and_then(|result| result.ok())
            .map(|devices| devices.iter().any(|d| d == device_id))
            .unwrap_or(false);
        if attached {
            Ok(())
        } else {
            Err(SessionError::DeviceUnreachable {
                device_id: device_id.to_string(),
            })
        }
    }

    async fn query_identity(&self, device_id: &str) -> DeviceIdentity {
        let timeout = Duration::from_millis(self.config.ingest.query_timeout_ms);
        tokio::time::timeout(timeout, self.device.device_identity(device_id))
            .await
            .ok()
            .and_then(|result| result.ok())
            .unwrap_or_else(|| DeviceIdentity {
                model: "Unknown".to_string(),
                firmware: "Unknown".to_string(),
            })
    }

    fn session_dir_for(&self, device_id: &str, start_time: u64) -> String {
        PathBuf::from(&self.config.capture.base_dir)
            .join(format!("{}_{}", device_id, start_time))
            .to_string_lossy()
            .into_owned()
    }
}
