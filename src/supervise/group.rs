use crate::bus::{LogBus, SYSTEM_TAG};
use crate::config::{ServiceSpec, SupervisorConfig};
use crate::error::{Result, WardenError};
use crate::supervise::supervisor::{ServiceSupervisor, StatusSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Poll slice for the cancellable inter-service start delay
const START_DELAY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Orchestrates the full supervisor set: sequential startup with an
/// inter-service delay, collective stop, per-name dispatch and reload.
///
/// The group assumes its configuration was validated by the config
/// layer; names are unique and commands are non-empty by contract.
pub struct SupervisionGroup {
    supervisors: Vec<Arc<ServiceSupervisor>>,
    by_name: HashMap<String, usize>,
    start_interval_secs: u64,
    bus: LogBus,
    shutdown: Arc<AtomicBool>,
}

impl SupervisionGroup {
    pub fn new(config: SupervisorConfig, bus: LogBus) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (supervisors, by_name) = Self::build(config.services, &bus, &shutdown);
        Self {
            supervisors,
            by_name,
            start_interval_secs: config.start_interval_secs,
            bus,
            shutdown,
        }
    }

    fn build(
        specs: Vec<ServiceSpec>,
        bus: &LogBus,
        shutdown: &Arc<AtomicBool>,
    ) -> (Vec<Arc<ServiceSupervisor>>, HashMap<String, usize>) {
        let mut supervisors = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        for (idx, spec) in specs.into_iter().enumerate() {
            by_name.insert(spec.name.clone(), idx);
            supervisors.push(Arc::new(ServiceSupervisor::new(
                spec,
                bus.clone(),
                Arc::clone(shutdown),
            )));
        }
        (supervisors, by_name)
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Start every service in configured order, waiting for each health
    /// outcome and inserting the configured delay between starts.
    ///
    /// The sequencing runs on its own task so the caller is never
    /// blocked; the returned handle completes when the sequence does.
    /// Many services assume earlier ones are already listening, which is
    /// why the order is strict and the delay sits between starts.
    pub fn start_all(&self) -> JoinHandle<()> {
        let supervisors = self.supervisors.clone();
        let interval = self.start_interval_secs;
        let shutdown = Arc::clone(&self.shutdown);
        let bus = self.bus.clone();

        tokio::spawn(async move {
            bus.emit(
                SYSTEM_TAG,
                &format!("starting {} services", supervisors.len()),
            );
            let last = supervisors.len().saturating_sub(1);
            for (idx, sup) in supervisors.iter().enumerate() {
                if shutdown.load(Ordering::SeqCst) {
                    bus.emit(SYSTEM_TAG, "startup sequence aborted by shutdown");
                    return;
                }
                Arc::clone(sup).start().await;
                if idx < last
                    && interval > 0
                    && !sleep_unless_shutdown(Duration::from_secs(interval), &shutdown).await
                {
                    bus.emit(SYSTEM_TAG, "startup sequence aborted by shutdown");
                    return;
                }
            }
            bus.emit(SYSTEM_TAG, "startup sequence complete");
        })
    }

    /// Stop every service, forcefully and concurrently; order between
    /// services is deliberately not preserved.
    pub async fn stop_all(&self) {
        let mut handles = Vec::with_capacity(self.supervisors.len());
        for sup in &self.supervisors {
            let sup = Arc::clone(sup);
            handles.push(tokio::spawn(async move { sup.stop(true).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.bus.emit(SYSTEM_TAG, "all services stopped");
    }

    /// Start a single service by name; the launch and health wait run on
    /// their own task.
    pub fn start_one(&self, name: &str) -> Result<()> {
        let sup = self.get(name)?;
        tokio::spawn(Arc::clone(sup).start());
        Ok(())
    }

    /// Gracefully stop a single service by name.
    pub async fn stop_one(&self, name: &str) -> Result<()> {
        let sup = self.get(name)?;
        sup.stop(false).await;
        Ok(())
    }

    /// Replace the whole supervisor set from a new configuration.
    ///
    /// Rejected while any supervisor still owns a live child: discarding
    /// such a supervisor would orphan its process and its in-flight
    /// restart timers. On success every restart counter starts from zero.
    pub fn reload(&mut self, config: SupervisorConfig) -> Result<()> {
        if let Some(live) = self.supervisors.iter().find(|s| s.has_live_child()) {
            return Err(WardenError::ReloadBlocked(format!(
                "service '{}' still has a live process",
                live.name()
            )));
        }

        for sup in &self.supervisors {
            sup.retire();
        }

        let (supervisors, by_name) = Self::build(config.services, &self.bus, &self.shutdown);
        self.supervisors = supervisors;
        self.by_name = by_name;
        self.start_interval_secs = config.start_interval_secs;

        info!("configuration reloaded with {} services", self.len());
        self.bus.emit(
            SYSTEM_TAG,
            &format!("configuration reloaded ({} services)", self.len()),
        );
        Ok(())
    }

    /// Snapshots of every supervisor in configured order, for display.
    pub fn statuses(&self) -> Vec<StatusSnapshot> {
        self.supervisors.iter().map(|s| s.snapshot()).collect()
    }

    pub fn get(&self, name: &str) -> Result<&Arc<ServiceSupervisor>> {
        self.by_name
            .get(name)
            .map(|&idx| &self.supervisors[idx])
            .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))
    }

    /// Raise the group-wide shutdown flag and stop everything. Pending
    /// restarts, health waits and the startup sequence all observe the
    /// flag at their next poll slice.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.bus.emit(SYSTEM_TAG, "shutting down");
        self.stop_all().await;
    }
}

/// Sleep the full duration in small slices, giving up early when the
/// shutdown flag is raised. Returns false when aborted.
async fn sleep_unless_shutdown(duration: Duration, shutdown: &Arc<AtomicBool>) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(START_DELAY_POLL_INTERVAL)).await;
    }
}
