use crate::instance::InstanceRecord;
use crate::liveness::probe_alive;
use crate::registry::{AppSlot, Registry};

impl Registry {
    /// Removes instances whose process is gone and frees their ports.
    ///
    /// Scans one app, or every app when `app_name` is `None`. An unknown app yields
    /// nothing. Returns the reclaimed records.
    pub async fn sweep(&self, app_name: Option<&str>) -> Vec<InstanceRecord> {
        let names = match app_name {
            Some(name) => vec![name.to_string()],
            None => self.slot_names().await,
        };

        let mut reclaimed = Vec::new();
        for name in names {
            let Some((mut slot, _)) = self.lock_app(&name).await else {
                continue;
            };
            reclaimed.extend(self.sweep_slot(&name, &mut slot).await);
        }

        if !reclaimed.is_empty() {
            self.notify().await;
        }
        reclaimed
    }

    /// Sweeps one app whose lock the caller holds.
    pub(crate) async fn sweep_slot(&self, app_name: &str, slot: &mut AppSlot) -> Vec<InstanceRecord> {
        let timeout = self.config().liveness_timeout;
        let mut dead = Vec::new();
        for record in slot.instances.values() {
            let alive =
                probe_alive(self.liveness.clone(), record.pid, record.start_marker, timeout).await;
            if !alive {
                dead.push(record.instance_id.clone());
            }
        }

        let mut reclaimed = Vec::with_capacity(dead.len());
        for id in dead {
            let Some(record) = slot.instances.remove(&id) else {
                continue;
            };
            self.ledger.release(record.port, app_name, &id);
            tracing::info!(
                app = app_name,
                instance_id = %id,
                port = record.port,
                pid = record.pid,
                "reclaimed port of dead instance"
            );
            reclaimed.push(record);
        }
        if !reclaimed.is_empty() {
            self.publish(app_name, slot);
        }
        reclaimed
    }
}
