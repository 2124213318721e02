use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex as StdMutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::catalog::{AppConfig, Catalog};
use crate::config::EngineConfig;
use crate::error::{AllocationError, CatalogError, RegistryError};
use crate::instance::{InstanceRecord, StartRequest, generate_instance_id, normalize_instance_id};
use crate::liveness::{LivenessChecker, ProcLiveness, probe_start_marker};
use crate::port_probe;
use crate::snapshot::{RegistrySnapshot, RestoreReport, SnapshotSink};
use crate::strategy::{PortStrategy, allocate};

#[derive(Debug, Default)]
pub(crate) struct AppSlot {
    pub(crate) instances: BTreeMap<String, InstanceRecord>,
    // Set once the app is unregistered; holders must look the slot up again.
    retired: bool,
}

// port -> (app, instance id), across every app. Never held across an await.
#[derive(Debug, Default)]
pub(crate) struct PortLedger {
    claims: StdMutex<BTreeMap<u16, (String, String)>>,
}

impl PortLedger {
    fn claims(&self) -> MutexGuard<'_, BTreeMap<u16, (String, String)>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `pick` against every claimed port plus `skip`, and claims its answer.
    fn claim_with(
        &self,
        app: &str,
        instance_id: &str,
        skip: &BTreeSet<u16>,
        pick: impl FnOnce(&BTreeSet<u16>) -> Result<u16, AllocationError>,
    ) -> Result<u16, AllocationError> {
        let mut claims = self.claims();
        let mut occupied: BTreeSet<u16> = claims.keys().copied().collect();
        occupied.extend(skip.iter().copied());
        let port = pick(&occupied)?;
        claims.insert(port, (app.to_string(), instance_id.to_string()));
        Ok(port)
    }

    fn try_claim(&self, port: u16, app: &str, instance_id: &str) -> bool {
        let mut claims = self.claims();
        if claims.contains_key(&port) {
            return false;
        }
        claims.insert(port, (app.to_string(), instance_id.to_string()));
        true
    }

    /// Frees `port` only if it is still claimed by this exact instance.
    pub(crate) fn release(&self, port: u16, app: &str, instance_id: &str) -> bool {
        let mut claims = self.claims();
        match claims.get(&port) {
            Some((a, i)) if a == app && i == instance_id => {
                claims.remove(&port);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.claims().len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub apps_registered: usize,
    pub active_instances: usize,
    pub instances: Vec<InstanceRecord>,
}

/// Instance mutations of one app are serialized by that app's mutex; different apps
/// only meet in the port ledger.
pub struct Registry {
    config: EngineConfig,
    catalog: Catalog,
    slots: RwLock<HashMap<String, Arc<Mutex<AppSlot>>>>,
    pub(crate) ledger: PortLedger,
    pub(crate) liveness: Arc<dyn LivenessChecker>,
    sink: Option<Arc<dyn SnapshotSink>>,
    // Copy of every slot's instances, refreshed under the owning slot lock.
    // Readers and snapshots use it so they never wait on another app's lock.
    published: StdMutex<BTreeMap<String, Vec<InstanceRecord>>>,
    revision: AtomicU64,
}

impl Registry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            catalog: Catalog::new(),
            slots: RwLock::new(HashMap::new()),
            ledger: PortLedger::default(),
            liveness: Arc::new(ProcLiveness),
            sink: None,
            published: StdMutex::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    pub fn with_liveness(mut self, checker: Arc<dyn LivenessChecker>) -> Self {
        self.liveness = checker;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn published(&self) -> MutexGuard<'_, BTreeMap<String, Vec<InstanceRecord>>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Call with the slot lock of `app_name` held.
    pub(crate) fn publish(&self, app_name: &str, slot: &AppSlot) {
        let mut published = self.published();
        if slot.instances.is_empty() {
            published.remove(app_name);
        } else {
            let mut records: Vec<InstanceRecord> = slot.instances.values().cloned().collect();
            records.sort_by_key(|r| r.port);
            published.insert(app_name.to_string(), records);
        }
    }

    async fn slot(&self, name: &str) -> Arc<Mutex<AppSlot>> {
        if let Some(slot) = self.slots.read().await.get(name) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    async fn remove_slot(&self, name: &str, slot: &Arc<Mutex<AppSlot>>) {
        let mut slots = self.slots.write().await;
        if slots.get(name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(name);
        }
    }

    pub(crate) async fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) async fn lock_app(
        &self,
        name: &str,
    ) -> Option<(OwnedMutexGuard<AppSlot>, Arc<AppConfig>)> {
        loop {
            if !self.catalog.contains(name) {
                return None;
            }
            let slot = self.slot(name).await;
            let guard = slot.clone().lock_owned().await;
            if guard.retired {
                continue;
            }
            // Unregistering removes the app while holding this lock.
            let Some(app) = self.catalog.get(name) else {
                let empty = guard.instances.is_empty();
                drop(guard);
                if empty {
                    self.remove_slot(name, &slot).await;
                }
                return None;
            };
            return Some((guard, app));
        }
    }

    /// Dead instances of the app are swept first, so their ports are eligible again.
    pub async fn start(
        &self,
        app_name: &str,
        req: StartRequest,
    ) -> Result<InstanceRecord, RegistryError> {
        let requested_id = req
            .instance_id
            .as_deref()
            .map(normalize_instance_id)
            .transpose()?;
        let start_marker =
            probe_start_marker(self.liveness.clone(), req.pid, self.config.liveness_timeout)
                .await;

        let (mut slot, app) = self
            .lock_app(app_name)
            .await
            .ok_or_else(|| RegistryError::AppNotFound(app_name.to_string()))?;
        let reclaimed = self.sweep_slot(app_name, &mut slot).await;

        let result = self.start_locked(
            app_name,
            &app.strategy,
            &mut slot,
            requested_id,
            req.port,
            req.pid,
            start_marker,
        );
        self.publish(app_name, &slot);
        drop(slot);

        if result.is_ok() || !reclaimed.is_empty() {
            self.notify().await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn start_locked(
        &self,
        app_name: &str,
        strategy: &PortStrategy,
        slot: &mut AppSlot,
        requested_id: Option<String>,
        requested_port: Option<u16>,
        pid: u32,
        start_marker: Option<u64>,
    ) -> Result<InstanceRecord, RegistryError> {
        let instance_id = match requested_id {
            Some(id) if slot.instances.contains_key(&id) => {
                return Err(RegistryError::InstanceIdInUse {
                    app: app_name.to_string(),
                    instance_id: id,
                });
            }
            Some(id) => id,
            None => generate_instance_id(|id| slot.instances.contains_key(id)),
        };

        let port = self
            .claim_port(app_name, &instance_id, strategy, requested_port)
            .map_err(|e| RegistryError::allocation(app_name, e))?;

        let record = InstanceRecord {
            app_name: app_name.to_string(),
            instance_id: instance_id.clone(),
            port,
            pid,
            start_marker,
            started_at: Utc::now(),
        };
        slot.instances.insert(instance_id, record.clone());
        tracing::info!(
            app = app_name,
            instance_id = %record.instance_id,
            port,
            pid,
            "instance started"
        );
        Ok(record)
    }

    fn claim_port(
        &self,
        app_name: &str,
        instance_id: &str,
        strategy: &PortStrategy,
        requested: Option<u16>,
    ) -> Result<u16, AllocationError> {
        let any = self.config.any_range;
        let mut busy = BTreeSet::new();
        loop {
            let port = self.ledger.claim_with(app_name, instance_id, &busy, |occupied| {
                allocate(strategy, any, occupied, requested)
            })?;
            if !self.config.probe_bind || port_probe::is_bindable(port) {
                return Ok(port);
            }
            self.ledger.release(port, app_name, instance_id);
            tracing::debug!(app = app_name, port, "port held outside the registry; skipping");
            if requested.is_some() {
                return Err(AllocationError::PortUnavailable(port));
            }
            busy.insert(port);
        }
    }

    pub async fn release(
        &self,
        app_name: &str,
        instance_id: &str,
    ) -> Result<InstanceRecord, RegistryError> {
        let (mut slot, _) = self
            .lock_app(app_name)
            .await
            .ok_or_else(|| RegistryError::AppNotFound(app_name.to_string()))?;
        let record =
            slot.instances
                .remove(instance_id)
                .ok_or_else(|| RegistryError::InstanceNotFound {
                    app: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                })?;
        self.ledger.release(record.port, app_name, instance_id);
        self.publish(app_name, &slot);
        drop(slot);

        tracing::info!(app = app_name, instance_id, port = record.port, "instance released");
        self.notify().await;
        Ok(record)
    }

    pub async fn release_by_pid(
        &self,
        app_name: &str,
        pid: u32,
    ) -> Result<Vec<InstanceRecord>, RegistryError> {
        let (mut slot, _) = self
            .lock_app(app_name)
            .await
            .ok_or_else(|| RegistryError::AppNotFound(app_name.to_string()))?;
        let ids: Vec<String> = slot
            .instances
            .values()
            .filter(|r| r.pid == pid)
            .map(|r| r.instance_id.clone())
            .collect();
        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = slot.instances.remove(&id) {
                self.ledger.release(record.port, app_name, &id);
                released.push(record);
            }
        }
        self.publish(app_name, &slot);
        drop(slot);

        if !released.is_empty() {
            tracing::info!(app = app_name, pid, count = released.len(), "released instances by pid");
            self.notify().await;
        }
        Ok(released)
    }

    pub async fn attach_pid(
        &self,
        app_name: &str,
        instance_id: &str,
        pid: u32,
    ) -> Result<InstanceRecord, RegistryError> {
        let start_marker =
            probe_start_marker(self.liveness.clone(), pid, self.config.liveness_timeout).await;
        let (mut slot, _) = self
            .lock_app(app_name)
            .await
            .ok_or_else(|| RegistryError::AppNotFound(app_name.to_string()))?;
        let record =
            slot.instances
                .get_mut(instance_id)
                .ok_or_else(|| RegistryError::InstanceNotFound {
                    app: app_name.to_string(),
                    instance_id: instance_id.to_string(),
                })?;
        record.pid = pid;
        record.start_marker = start_marker;
        let record = record.clone();
        self.publish(app_name, &slot);
        drop(slot);

        tracing::debug!(app = app_name, instance_id, pid, "instance pid attached");
        self.notify().await;
        Ok(record)
    }

    /// No-op unless `pid` still owns the instance.
    pub async fn instance_exited(
        &self,
        app_name: &str,
        instance_id: &str,
        pid: u32,
    ) -> Option<InstanceRecord> {
        let (mut slot, _) = self.lock_app(app_name).await?;
        if slot.instances.get(instance_id).map(|r| r.pid) != Some(pid) {
            return None;
        }
        let record = slot.instances.remove(instance_id)?;
        self.ledger.release(record.port, app_name, instance_id);
        self.publish(app_name, &slot);
        drop(slot);

        tracing::info!(app = app_name, instance_id, port = record.port, pid, "instance exited");
        self.notify().await;
        Some(record)
    }

    /// Live instances sorted by app then port. Never waits on an app lock.
    pub fn list_instances(&self, app_name: Option<&str>) -> Vec<InstanceRecord> {
        let published = self.published();
        match app_name {
            Some(name) => published.get(name).cloned().unwrap_or_default(),
            None => published.values().flatten().cloned().collect(),
        }
    }

    pub fn status(&self) -> RegistryStatus {
        let instances = self.list_instances(None);
        RegistryStatus {
            apps_registered: self.catalog.len(),
            active_instances: instances.len(),
            instances,
        }
    }

    pub fn claimed_ports(&self) -> usize {
        self.ledger.len()
    }

    pub async fn register_app(
        &self,
        app: AppConfig,
        replace: bool,
    ) -> Result<AppConfig, CatalogError> {
        // A replacement waits for in-flight starts of the same app.
        let guard = if replace {
            self.lock_app(&app.name).await
        } else {
            None
        };
        let stored = app.clone();
        self.catalog.register(app, replace)?;
        drop(guard);

        tracing::info!(
            app = %stored.name,
            strategy = stored.strategy.kind(),
            path = %stored.path.display(),
            "app registered"
        );
        self.notify().await;
        Ok(stored)
    }

    /// Live instances keep their ports.
    pub async fn update_strategy(
        &self,
        app_name: &str,
        strategy: PortStrategy,
    ) -> Result<AppConfig, CatalogError> {
        let (slot, _) = self
            .lock_app(app_name)
            .await
            .ok_or_else(|| CatalogError::AppNotFound(app_name.to_string()))?;
        let updated = self.catalog.set_strategy(app_name, strategy)?;
        drop(slot);

        tracing::info!(app = app_name, strategy = updated.strategy.kind(), "app strategy updated");
        self.notify().await;
        Ok(AppConfig::clone(&updated))
    }

    /// Fails with `AppHasLiveInstances` if live instances remain after a sweep, unless
    /// `cascade` is set.
    pub async fn unregister_app(
        &self,
        app_name: &str,
        cascade: bool,
    ) -> Result<Vec<InstanceRecord>, CatalogError> {
        let (mut slot, _) = self
            .lock_app(app_name)
            .await
            .ok_or_else(|| CatalogError::AppNotFound(app_name.to_string()))?;
        let reclaimed = self.sweep_slot(app_name, &mut slot).await;

        let live = slot.instances.len();
        if live > 0 && !cascade {
            drop(slot);
            if !reclaimed.is_empty() {
                self.notify().await;
            }
            return Err(CatalogError::AppHasLiveInstances {
                name: app_name.to_string(),
                count: live,
            });
        }

        let released: Vec<InstanceRecord> =
            std::mem::take(&mut slot.instances).into_values().collect();
        for record in &released {
            self.ledger
                .release(record.port, app_name, &record.instance_id);
        }
        self.publish(app_name, &slot);
        self.catalog.remove(app_name);
        slot.retired = true;
        let handle = OwnedMutexGuard::mutex(&slot).clone();
        self.remove_slot(app_name, &handle).await;
        drop(slot);

        tracing::info!(app = app_name, released = released.len(), "app unregistered");
        self.notify().await;
        Ok(released)
    }

    pub fn get_app(&self, app_name: &str) -> Option<AppConfig> {
        self.catalog.get(app_name).map(|a| AppConfig::clone(&a))
    }

    pub fn list_apps(&self) -> Vec<AppConfig> {
        self.catalog.list()
    }

    // The revision is taken under the published lock so a higher revision never
    // carries older state.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let published = self.published();
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        RegistrySnapshot {
            revision,
            apps: self.catalog.list(),
            instances: published.values().flatten().cloned().collect(),
        }
    }

    /// Instances of unknown apps or on an already claimed port are dropped.
    pub async fn restore(&self, snapshot: RegistrySnapshot) -> RestoreReport {
        let mut report = RestoreReport::default();

        for app in snapshot.apps {
            let name = app.name.clone();
            match self.catalog.restore(app) {
                Ok(()) => report.apps += 1,
                Err(err) => tracing::warn!(app = %name, error = %err, "skipping persisted app"),
            }
        }

        for record in snapshot.instances {
            let Some((mut slot, _)) = self.lock_app(&record.app_name).await else {
                tracing::warn!(app = %record.app_name, instance_id = %record.instance_id, "dropping instance of unknown app");
                report.dropped += 1;
                continue;
            };
            if slot.instances.contains_key(&record.instance_id)
                || !self
                    .ledger
                    .try_claim(record.port, &record.app_name, &record.instance_id)
            {
                tracing::warn!(
                    app = %record.app_name,
                    instance_id = %record.instance_id,
                    port = record.port,
                    "dropping conflicting persisted instance"
                );
                report.dropped += 1;
                continue;
            }
            let app_name = record.app_name.clone();
            slot.instances.insert(record.instance_id.clone(), record);
            self.publish(&app_name, &slot);
            report.instances += 1;
        }

        self.revision.fetch_max(snapshot.revision, Ordering::SeqCst);
        report.reclaimed = self.sweep(None).await.len();
        report
    }

    pub(crate) async fn notify(&self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let snapshot = self.snapshot();
        let revision = snapshot.revision;
        if let Err(err) = sink.registry_changed(snapshot) {
            tracing::warn!(revision, error = %err, "registry snapshot was not persisted");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::strategy::PortRange;

    /// Liveness driven by the test: pids are alive until killed.
    #[derive(Debug, Default)]
    pub(crate) struct FakeLiveness {
        dead: StdMutex<HashSet<u32>>,
        markers: StdMutex<HashMap<u32, u64>>,
    }

    impl FakeLiveness {
        pub(crate) fn kill(&self, pid: u32) {
            self.dead.lock().unwrap().insert(pid);
        }

        /// Simulates the OS handing `pid` to a new process.
        pub(crate) fn reuse(&self, pid: u32) {
            self.dead.lock().unwrap().remove(&pid);
            *self.markers.lock().unwrap().entry(pid).or_insert(1) += 1;
        }

        fn marker(&self, pid: u32) -> u64 {
            self.markers.lock().unwrap().get(&pid).copied().unwrap_or(1)
        }
    }

    impl LivenessChecker for FakeLiveness {
        fn start_marker(&self, pid: u32) -> Option<u64> {
            Some(self.marker(pid))
        }

        fn is_alive(&self, pid: u32, start_marker: Option<u64>) -> bool {
            if self.dead.lock().unwrap().contains(&pid) {
                return false;
            }
            start_marker.is_none_or(|m| m == self.marker(pid))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        revisions: StdMutex<Vec<u64>>,
        fail: bool,
    }

    impl SnapshotSink for RecordingSink {
        fn registry_changed(&self, snapshot: RegistrySnapshot) -> anyhow::Result<()> {
            self.revisions.lock().unwrap().push(snapshot.revision);
            if self.fail {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub(crate) registry: Arc<Registry>,
        pub(crate) liveness: Arc<FakeLiveness>,
        pub(crate) dir: tempfile::TempDir,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        pub(crate) fn with_config(config: EngineConfig) -> Self {
            let liveness = Arc::new(FakeLiveness::default());
            let registry = Registry::new(config).with_liveness(liveness.clone());
            Self {
                registry: Arc::new(registry),
                liveness,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        pub(crate) async fn app(&self, name: &str, strategy: PortStrategy) {
            self.registry
                .register_app(
                    AppConfig::new(name, self.dir.path()).with_strategy(strategy),
                    false,
                )
                .await
                .unwrap();
        }
    }

    fn range(low: u16, high: u16) -> PortStrategy {
        PortStrategy::Range { low, high }
    }

    #[tokio::test]
    async fn dedicated_port_is_exclusive_until_released() {
        let h = Harness::new();
        h.app("a", PortStrategy::Dedicated { port: 8001 }).await;

        let first = h.registry.start("a", StartRequest::new(100)).await.unwrap();
        assert_eq!(first.port, 8001);
        assert_eq!(
            h.registry.start("a", StartRequest::new(101)).await,
            Err(RegistryError::StrategyExhausted("a".to_string()))
        );

        h.registry.release("a", &first.instance_id).await.unwrap();
        let again = h.registry.start("a", StartRequest::new(101)).await.unwrap();
        assert_eq!(again.port, 8001);
    }

    #[tokio::test]
    async fn range_exhausts_then_reuses_lowest_free_port() {
        let h = Harness::new();
        h.app("b", range(8010, 8012)).await;

        let mut ids = Vec::new();
        for (pid, want) in [(1, 8010), (2, 8011), (3, 8012)] {
            let rec = h.registry.start("b", StartRequest::new(pid)).await.unwrap();
            assert_eq!(rec.port, want);
            ids.push(rec.instance_id);
        }
        assert_eq!(
            h.registry.start("b", StartRequest::new(4)).await,
            Err(RegistryError::StrategyExhausted("b".to_string()))
        );

        h.registry.release("b", &ids[1]).await.unwrap();
        let rec = h.registry.start("b", StartRequest::new(5)).await.unwrap();
        assert_eq!(rec.port, 8011);
    }

    #[tokio::test]
    async fn start_sweeps_dead_instances_first() {
        let h = Harness::new();
        h.app("a", PortStrategy::Dedicated { port: 8001 }).await;

        h.registry.start("a", StartRequest::new(100)).await.unwrap();
        h.liveness.kill(100);

        let rec = h.registry.start("a", StartRequest::new(200)).await.unwrap();
        assert_eq!(rec.port, 8001);
        assert_eq!(rec.pid, 200);
        assert_eq!(h.registry.list_instances(Some("a")), vec![rec]);
    }

    #[tokio::test]
    async fn sweep_reclaims_dead_instances_across_apps() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.app("b", range(8020, 8029)).await;

        let a1 = h.registry.start("a", StartRequest::new(1)).await.unwrap();
        h.registry.start("a", StartRequest::new(2)).await.unwrap();
        let b1 = h.registry.start("b", StartRequest::new(3)).await.unwrap();
        h.liveness.kill(1);
        h.liveness.kill(3);

        let mut reclaimed = h.registry.sweep(None).await;
        reclaimed.sort_by_key(|r| r.port);
        assert_eq!(reclaimed, vec![a1.clone(), b1]);

        let live = h.registry.list_instances(None);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].pid, 2);
        assert_eq!(h.registry.claimed_ports(), 1);

        let next = h.registry.start("a", StartRequest::new(4)).await.unwrap();
        assert_eq!(next.port, a1.port);
    }

    #[tokio::test]
    async fn reused_pid_is_reclaimed() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.registry.start("a", StartRequest::new(7)).await.unwrap();

        h.liveness.reuse(7);
        assert_eq!(h.registry.sweep(Some("a")).await.len(), 1);
        assert!(h.registry.list_instances(Some("a")).is_empty());
    }

    #[tokio::test]
    async fn second_release_fails_and_never_frees_a_reassigned_port() {
        let h = Harness::new();
        h.app("a", PortStrategy::Dedicated { port: 8001 }).await;

        let first = h
            .registry
            .start("a", StartRequest::new(1).with_instance_id("one"))
            .await
            .unwrap();
        h.registry.release("a", "one").await.unwrap();
        let second = h
            .registry
            .start("a", StartRequest::new(2).with_instance_id("two"))
            .await
            .unwrap();
        assert_eq!(first.port, second.port);

        assert_eq!(
            h.registry.release("a", "one").await,
            Err(RegistryError::InstanceNotFound {
                app: "a".to_string(),
                instance_id: "one".to_string()
            })
        );
        assert_eq!(h.registry.claimed_ports(), 1);
        assert_eq!(
            h.registry.start("a", StartRequest::new(3)).await,
            Err(RegistryError::StrategyExhausted("a".to_string()))
        );
    }

    #[tokio::test]
    async fn live_instance_id_cannot_be_reused() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.registry
            .start("a", StartRequest::new(1).with_instance_id("w1"))
            .await
            .unwrap();

        assert_eq!(
            h.registry
                .start("a", StartRequest::new(2).with_instance_id("w1"))
                .await,
            Err(RegistryError::InstanceIdInUse {
                app: "a".to_string(),
                instance_id: "w1".to_string()
            })
        );
        assert_eq!(h.registry.list_instances(Some("a")).len(), 1);
    }

    #[tokio::test]
    async fn failed_allocation_changes_nothing() {
        let h = Harness::new();
        h.app("a", range(8010, 8012)).await;
        h.registry.start("a", StartRequest::new(1)).await.unwrap();
        let before = h.registry.list_instances(None);

        assert_eq!(
            h.registry
                .start("a", StartRequest::new(2).with_port(8010))
                .await,
            Err(RegistryError::PortUnavailable {
                app: "a".to_string(),
                port: 8010
            })
        );
        assert!(matches!(
            h.registry
                .start("a", StartRequest::new(2).with_port(9999))
                .await,
            Err(RegistryError::PortUnavailable { port: 9999, .. })
        ));
        assert_eq!(h.registry.list_instances(None), before);
        assert_eq!(h.registry.claimed_ports(), 1);

        let rec = h
            .registry
            .start("a", StartRequest::new(2).with_port(8012))
            .await
            .unwrap();
        assert_eq!(rec.port, 8012);
    }

    #[tokio::test]
    async fn unknown_app_and_bad_ids_are_rejected() {
        let h = Harness::new();
        assert_eq!(
            h.registry.start("nope", StartRequest::new(1)).await,
            Err(RegistryError::AppNotFound("nope".to_string()))
        );
        assert!(h.registry.slot_names().await.is_empty());

        h.app("a", PortStrategy::Any).await;
        assert!(matches!(
            h.registry
                .start("a", StartRequest::new(1).with_instance_id("../x"))
                .await,
            Err(RegistryError::InvalidInstanceId(_))
        ));
    }

    #[tokio::test]
    async fn overlapping_strategies_never_share_a_port() {
        let h = Harness::new();
        h.app("a", range(8010, 8011)).await;
        h.app("b", range(8011, 8012)).await;
        h.app("c", PortStrategy::List { ports: vec![8012, 8010] }).await;

        assert_eq!(h.registry.start("a", StartRequest::new(1)).await.unwrap().port, 8010);
        assert_eq!(h.registry.start("b", StartRequest::new(2)).await.unwrap().port, 8011);
        assert_eq!(h.registry.start("c", StartRequest::new(3)).await.unwrap().port, 8012);
        assert!(matches!(
            h.registry.start("a", StartRequest::new(4)).await,
            Err(RegistryError::StrategyExhausted(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_and_releases_never_double_assign() {
        let config = EngineConfig {
            any_range: PortRange::new(8100, 8139).unwrap(),
            ..EngineConfig::default()
        };
        let h = Harness::with_config(config);
        for name in ["a", "b", "c"] {
            h.app(name, PortStrategy::Any).await;
        }

        let mut tasks = Vec::new();
        for i in 0..90u32 {
            let registry = h.registry.clone();
            tasks.push(tokio::spawn(async move {
                let app = ["a", "b", "c"][(i % 3) as usize];
                let rec = registry.start(app, StartRequest::new(i + 1)).await;
                if let (Ok(rec), true) = (&rec, i % 4 == 0) {
                    tokio::task::yield_now().await;
                    registry.release(app, &rec.instance_id).await.unwrap();
                }
                rec
            }));
        }

        let mut ok = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RegistryError::StrategyExhausted(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(ok >= 40);

        let live = h.registry.list_instances(None);
        let ports: HashSet<u16> = live.iter().map(|r| r.port).collect();
        assert_eq!(ports.len(), live.len());
        assert_eq!(h.registry.claimed_ports(), live.len());
        assert!(live.len() <= 40);
    }

    #[tokio::test]
    async fn unregister_rejects_live_instances_unless_cascading() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        let rec = h.registry.start("a", StartRequest::new(1)).await.unwrap();

        assert_eq!(
            h.registry.unregister_app("a", false).await,
            Err(CatalogError::AppHasLiveInstances {
                name: "a".to_string(),
                count: 1
            })
        );
        assert!(h.registry.get_app("a").is_some());

        let released = h.registry.unregister_app("a", true).await.unwrap();
        assert_eq!(released, vec![rec]);
        assert!(h.registry.get_app("a").is_none());
        assert!(h.registry.list_instances(Some("a")).is_empty());
        assert_eq!(h.registry.claimed_ports(), 0);
        assert!(h.registry.slot_names().await.is_empty());
        assert_eq!(
            h.registry.unregister_app("a", true).await,
            Err(CatalogError::AppNotFound("a".to_string()))
        );
    }

    #[tokio::test]
    async fn dead_instances_do_not_block_unregister() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.registry.start("a", StartRequest::new(1)).await.unwrap();
        h.liveness.kill(1);

        assert_eq!(h.registry.unregister_app("a", false).await, Ok(vec![]));
        assert_eq!(h.registry.claimed_ports(), 0);
    }

    #[tokio::test]
    async fn app_can_be_registered_again_after_removal() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.registry.start("a", StartRequest::new(1)).await.unwrap();
        h.registry.unregister_app("a", true).await.unwrap();

        h.app("a", PortStrategy::Dedicated { port: 8050 }).await;
        let rec = h.registry.start("a", StartRequest::new(2)).await.unwrap();
        assert_eq!(rec.port, 8050);
    }

    #[tokio::test]
    async fn strategy_update_keeps_live_instances() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        let rec = h.registry.start("a", StartRequest::new(1)).await.unwrap();

        let updated = h
            .registry
            .update_strategy("a", PortStrategy::Dedicated { port: 8030 })
            .await
            .unwrap();
        assert_eq!(updated.strategy, PortStrategy::Dedicated { port: 8030 });
        assert_eq!(h.registry.list_instances(Some("a")), vec![rec]);
        assert_eq!(h.registry.start("a", StartRequest::new(2)).await.unwrap().port, 8030);
    }

    #[tokio::test]
    async fn exit_notification_ignores_stale_pids() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        let rec = h.registry.start("a", StartRequest::new(10)).await.unwrap();

        let attached = h
            .registry
            .attach_pid("a", &rec.instance_id, 11)
            .await
            .unwrap();
        assert_eq!(attached.pid, 11);
        assert_eq!(attached.port, rec.port);

        assert_eq!(h.registry.instance_exited("a", &rec.instance_id, 10).await, None);
        assert_eq!(h.registry.list_instances(Some("a")).len(), 1);

        let gone = h
            .registry
            .instance_exited("a", &rec.instance_id, 11)
            .await
            .unwrap();
        assert_eq!(gone.port, rec.port);
        assert_eq!(h.registry.claimed_ports(), 0);
    }

    #[tokio::test]
    async fn release_by_pid_removes_only_that_owner() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.registry.start("a", StartRequest::new(5)).await.unwrap();
        h.registry.start("a", StartRequest::new(5)).await.unwrap();
        let keep = h.registry.start("a", StartRequest::new(6)).await.unwrap();

        let released = h.registry.release_by_pid("a", 5).await.unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(h.registry.list_instances(Some("a")), vec![keep]);
    }

    #[tokio::test]
    async fn status_counts_apps_and_instances() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.app("b", range(8020, 8029)).await;
        h.registry.start("b", StartRequest::new(1)).await.unwrap();

        let status = h.registry.status();
        assert_eq!(status.apps_registered, 2);
        assert_eq!(status.active_instances, 1);
        assert_eq!(status.instances[0].app_name, "b");
    }

    #[tokio::test]
    async fn sink_sees_every_mutation_and_failures_are_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(EngineConfig::default())
            .with_liveness(Arc::new(FakeLiveness::default()))
            .with_sink(sink.clone());

        registry
            .register_app(AppConfig::new("a", dir.path()), false)
            .await
            .unwrap();
        let rec = registry.start("a", StartRequest::new(1)).await.unwrap();
        registry.release("a", &rec.instance_id).await.unwrap();
        // Nothing changes on a failed start.
        registry
            .start("a", StartRequest::new(1).with_port(1))
            .await
            .unwrap_err();

        assert_eq!(*sink.revisions.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn restore_round_trips_and_sweeps() {
        let h = Harness::new();
        h.app("a", range(8010, 8019)).await;
        h.app("b", PortStrategy::Dedicated { port: 8050 }).await;
        let a1 = h.registry.start("a", StartRequest::new(1)).await.unwrap();
        h.registry.start("b", StartRequest::new(2)).await.unwrap();
        let mut snapshot = h.registry.snapshot();

        // A duplicate port and an orphan are dropped.
        let mut dup = a1.clone();
        dup.instance_id = "dup".to_string();
        snapshot.instances.push(dup);
        let mut orphan = a1.clone();
        orphan.app_name = "gone".to_string();
        snapshot.instances.push(orphan);

        let restored = Harness::new();
        restored.liveness.kill(2);
        let report = restored.registry.restore(snapshot.clone()).await;
        assert_eq!(
            report,
            RestoreReport {
                apps: 2,
                instances: 2,
                dropped: 2,
                reclaimed: 1,
            }
        );
        assert_eq!(restored.registry.list_instances(None), vec![a1]);
        assert!(restored.registry.snapshot().revision > snapshot.revision);
    }

    #[tokio::test]
    async fn bind_probe_skips_ports_held_outside_the_registry() {
        let held = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held_port = held.local_addr().unwrap().port();
        let free = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);

        let h = Harness::with_config(EngineConfig {
            probe_bind: true,
            ..EngineConfig::default()
        });
        h.app(
            "a",
            PortStrategy::List {
                ports: vec![held_port, free_port],
            },
        )
        .await;

        let rec = h.registry.start("a", StartRequest::new(1)).await.unwrap();
        assert_eq!(rec.port, free_port);
        assert!(matches!(
            h.registry
                .start("a", StartRequest::new(2).with_port(held_port))
                .await,
            Err(RegistryError::PortUnavailable { .. })
        ));
        assert_eq!(h.registry.claimed_ports(), 1);
        drop(held);
    }

    /// Probes of `pid >= 100` block for 400ms once `slow` is set.
    #[derive(Default)]
    struct SlowFor {
        slow: std::sync::atomic::AtomicBool,
    }

    impl LivenessChecker for SlowFor {
        fn start_marker(&self, _pid: u32) -> Option<u64> {
            None
        }

        fn is_alive(&self, pid: u32, _start_marker: Option<u64>) -> bool {
            if pid >= 100 && self.slow.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(400));
            }
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_sweep_of_one_app_does_not_stall_another() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(SlowFor::default());
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(
            Registry::new(EngineConfig {
                liveness_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            })
            .with_liveness(liveness.clone())
            .with_sink(sink.clone()),
        );
        for (name, low) in [("a", 8010), ("b", 8020)] {
            registry
                .register_app(
                    AppConfig::new(name, dir.path()).with_strategy(range(low, low + 9)),
                    false,
                )
                .await
                .unwrap();
        }
        for pid in 100..103 {
            registry.start("b", StartRequest::new(pid)).await.unwrap();
        }

        liveness.slow.store(true, Ordering::SeqCst);
        let sweeping = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.sweep(Some("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let began = std::time::Instant::now();
        let rec = registry.start("a", StartRequest::new(1)).await.unwrap();
        let took = began.elapsed();
        assert!(took < Duration::from_millis(200), "start(a) took {took:?}");
        assert_eq!(registry.list_instances(None).len(), 4);
        assert!(!sweeping.is_finished());

        assert!(sweeping.await.unwrap().is_empty());
        assert_eq!(registry.list_instances(Some("a")), vec![rec]);
    }

    struct Hung;

    impl LivenessChecker for Hung {
        fn start_marker(&self, _pid: u32) -> Option<u64> {
            None
        }

        fn is_alive(&self, _pid: u32, _start_marker: Option<u64>) -> bool {
            std::thread::sleep(Duration::from_millis(300));
            false
        }
    }

    #[tokio::test]
    async fn hung_liveness_probe_keeps_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(EngineConfig {
            liveness_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        })
        .with_liveness(Arc::new(Hung));
        registry
            .register_app(AppConfig::new("a", dir.path()), false)
            .await
            .unwrap();
        registry.start("a", StartRequest::new(1)).await.unwrap();

        assert!(registry.sweep(Some("a")).await.is_empty());
        assert_eq!(registry.list_instances(Some("a")).len(), 1);
    }
}
