// ===============================
// src/commands.rs (fire-and-forget mutation dispatcher)
// ===============================
//
// One HTTP call per command, no optimistic local mutation and no automatic
// retry: state only changes through the forced re-snapshot that follows a
// 2xx. Client-side validation rejects obviously bad input before any
// network I/O.

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError};
use crate::domain::{Banner, BannerKind, Event};
use crate::metrics::COMMANDS;

#[derive(Debug, Clone)]
pub enum Command {
    EngineStart,
    EngineStop,
    EngineTrigger,
    SaveEngineConfig(Value),
    UpdateMonitoringPosition { symbol: String, body: Value },
    BatchUpdate { symbols: Vec<String>, settings: Value },
    ExcludeSymbol(String),
    SaveGlobalSettings(Value),
    DeleteAiPosition(String),
    DeleteAllAiPositions,
    SyncHistory(Value),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::EngineStart => "engine_start",
            Command::EngineStop => "engine_stop",
            Command::EngineTrigger => "engine_trigger",
            Command::SaveEngineConfig(_) => "save_engine_config",
            Command::UpdateMonitoringPosition { .. } => "update_monitoring_position",
            Command::BatchUpdate { .. } => "batch_update",
            Command::ExcludeSymbol(_) => "exclude_symbol",
            Command::SaveGlobalSettings(_) => "save_global_settings",
            Command::DeleteAiPosition(_) => "delete_ai_position",
            Command::DeleteAllAiPositions => "delete_all_ai_positions",
            Command::SyncHistory(_) => "sync_history",
        }
    }

    fn success_text(&self) -> &'static str {
        match self {
            Command::EngineStart => "engine started",
            Command::EngineStop => "engine stopped",
            Command::EngineTrigger => "analysis triggered",
            Command::SaveEngineConfig(_) => "engine config saved",
            Command::UpdateMonitoringPosition { .. } => "monitoring updated",
            Command::BatchUpdate { .. } => "batch update applied",
            Command::ExcludeSymbol(_) => "symbol excluded",
            Command::SaveGlobalSettings(_) => "global settings saved",
            Command::DeleteAiPosition(_) => "position deleted",
            Command::DeleteAllAiPositions => "all positions deleted",
            Command::SyncHistory(_) => "history sync started",
        }
    }

    /// Local preconditions; failures block the call before any network I/O.
    pub fn validate(&self) -> Result<(), ApiError> {
        match self {
            Command::BatchUpdate { symbols, .. } if symbols.is_empty() => Err(
                ApiError::Validation("batch update needs at least one symbol".into()),
            ),
            Command::UpdateMonitoringPosition { symbol, .. }
            | Command::ExcludeSymbol(symbol)
            | Command::DeleteAiPosition(symbol)
                if symbol.trim().is_empty() =>
            {
                Err(ApiError::Validation("symbol must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

async fn dispatch(api: &ApiClient, cmd: &Command) -> Result<(), ApiError> {
    cmd.validate()?;
    match cmd {
        Command::EngineStart => api.engine_start().await,
        Command::EngineStop => api.engine_stop().await,
        Command::EngineTrigger => api.engine_trigger().await,
        Command::SaveEngineConfig(cfg) => api.put_engine_config(cfg).await,
        Command::UpdateMonitoringPosition { symbol, body } => {
            api.update_monitoring_position(symbol, body).await
        }
        Command::BatchUpdate { symbols, settings } => {
            let body = json!({ "symbols": symbols, "settings": settings });
            api.batch_update(&body).await
        }
        Command::ExcludeSymbol(symbol) => api.exclude_symbol(symbol).await,
        Command::SaveGlobalSettings(settings) => api.put_global_settings(settings).await,
        Command::DeleteAiPosition(symbol) => api.delete_ai_position(symbol).await,
        Command::DeleteAllAiPositions => api.delete_ai_positions().await,
        Command::SyncHistory(body) => api.sync_history(body).await,
    }
}

pub async fn run(
    api: ApiClient,
    mut cmd_rx: mpsc::Receiver<Command>,
    refresh_tx: mpsc::Sender<()>,
    banner_tx: mpsc::Sender<Banner>,
    rec_tx: Option<mpsc::Sender<Event>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let cmd = tokio::select! {
            maybe = cmd_rx.recv() => {
                let Some(cmd) = maybe else { return };
                cmd
            }
            _ = shutdown.changed() => return,
        };

        let name = cmd.name();
        match dispatch(&api, &cmd).await {
            Ok(()) => {
                info!(command = name, "command ok");
                COMMANDS.with_label_values(&[name, "ok"]).inc();
                let _ = banner_tx
                    .send(Banner {
                        kind: BannerKind::Success,
                        text: cmd.success_text().to_string(),
                    })
                    .await;
                // server confirmed; pull the authoritative state it now holds
                let _ = refresh_tx.send(()).await;
                if let Some(tx) = &rec_tx {
                    let _ = tx.try_send(Event::Command {
                        name: name.to_string(),
                        ok: true,
                    });
                }
            }
            Err(e) => {
                warn!(command = name, %e, "command failed");
                COMMANDS.with_label_values(&[name, "err"]).inc();
                let _ = banner_tx
                    .send(Banner {
                        kind: BannerKind::Error,
                        text: e.to_string(),
                    })
                    .await;
                if let Some(tx) = &rec_tx {
                    let _ = tx.try_send(Event::Command {
                        name: name.to_string(),
                        ok: false,
                    });
                }
            }
        }
    }
}
