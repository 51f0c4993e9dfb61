//! Periodic status refresh for every known VM.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::VmError;
use crate::manager::Manager;
use crate::vm_state::VmStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSnapshot {
    pub name: String,
    pub status: VmStatus,
    /// `None` for VMs with no running hypervisor.
    pub reachable: Option<bool>,
    pub ssh: String,
}

/// One pass: reconcile every VM, probe the running ones and re-render
/// their status windows.
pub async fn refresh(manager: &Manager) -> Result<Vec<VmSnapshot>, VmError> {
    let records = manager.list().await?;
    let reachability = manager.probe_all(&records).await;

    let mut snapshots = Vec::with_capacity(records.len());
    for (record, reachable) in records.iter().zip(reachability) {
        manager.publish_status(record, reachable).await;
        snapshots.push(VmSnapshot {
            name: record.name.clone(),
            status: record.status(),
            reachable,
            ssh: record.ssh_info.describe(),
        });
    }
    Ok(snapshots)
}

/// Refresh every `interval` until `cancel` fires. A slow pass delays the
/// next tick instead of stacking up.
pub async fn run(
    manager: &Manager,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_tick: impl FnMut(&[VmSnapshot]),
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let pass = tokio::select! {
            _ = cancel.cancelled() => break,
            pass = refresh(manager) => pass,
        };
        match pass {
            Ok(snapshots) => {
                tracing::debug!(vms = snapshots.len(), "status refresh");
                on_tick(&snapshots);
            }
            Err(e) => tracing::warn!("status refresh failed: {e}"),
        }
    }
}
