// ===============================
// src/snapshot.rs (authoritative REST snapshot loader)
// ===============================
//
// Triggers: startup (first interval tick fires immediately), the fixed
// polling interval, and refresh requests (manual or post-command). Each
// load carries a monotonic sequence number; overlapping loads are allowed
// and the reconciler discards any response older than the last applied,
// so a slow response can never overwrite newer data.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::api::ApiClient;
use crate::reconcile::SnapshotResult;

fn spawn_load(api: &ApiClient, seq: u64, snap_tx: &mpsc::Sender<SnapshotResult>) {
    let api = api.clone();
    let tx = snap_tx.clone();
    tokio::spawn(async move {
        debug!(seq, "snapshot load started");
        let result = api.load_snapshot().await;
        // reconciler gone means shutdown; nothing to do with the result
        let _ = tx.send(SnapshotResult { seq, result }).await;
    });
}

pub async fn run(
    api: ApiClient,
    poll_interval: Duration,
    mut refresh_rx: mpsc::Receiver<()>,
    snap_tx: mpsc::Sender<SnapshotResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = poll_interval.as_secs(), "snapshot loader started");
    let mut tick = interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                seq += 1;
                spawn_load(&api, seq, &snap_tx);
            }
            maybe = refresh_rx.recv() => {
                let Some(()) = maybe else { return };
                seq += 1;
                spawn_load(&api, seq, &snap_tx);
            }
            _ = shutdown.changed() => return,
        }
    }
}
