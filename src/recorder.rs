// ===============================
// src/recorder.rs
// ===============================
//
// Lightweight JSONL journal:
// - appends every Event to a .jsonl file
// - BufWriter to keep syscalls down
// - flushes every 1s and/or every 1000 events
// - creates the parent directory if missing
// - on a failed write, reopens the file once and carries on
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` to enable (see main.rs).
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

async fn open_writer(path: &str) -> BufWriter<tokio::fs::File> {
    // make sure the parent directory exists (if there is one)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap_or_else(|e| panic!("recorder: open {} failed: {}", path, e));

    BufWriter::new(file)
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = open_writer(&path).await;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        let line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };

                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "recorder: write_all failed, attempting reopen");
                            writer = open_writer(&path).await;
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        if let Err(e) = writer.write_all(b"\n").await {
                            error!(?e, "recorder: write newline failed");
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            if let Err(e) = writer.flush().await {
                                error!(?e, "recorder: flush failed");
                            }
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        // senders gone: final flush and exit
                        if let Err(e) = writer.flush().await {
                            error!(?e, "recorder: final flush failed");
                        }
                        info!("recorder: stopped");
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                if since_last_flush > 0 {
                    if let Err(e) = writer.flush().await {
                        error!(?e, "recorder: periodic flush failed");
                    }
                    since_last_flush = 0;
                }
            }
        }
    }
}
