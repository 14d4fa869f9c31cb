// ===============================
// src/stream.rs
// ===============================
//
// Stream adapters:
// - run_mock : random-walk quote generator, no backend required
// - run_live : one WebSocket per logical stream (/ws/quotes, /ws/ai-trading)
//              with an explicit Disconnected -> Connecting -> Connected
//              lifecycle and a single reconnect sleep per drop.
//
// The adapter does transport only: frames are parsed into StreamEvent and
// forwarded; a malformed frame is logged and dropped, never kills the
// connection. Business meaning lives in the reconciler.

use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use url::Url;

use crate::domain::{ConnState, QuoteEvent, StreamEvent, StreamKind};
use crate::metrics::{WS_CONNECTED, WS_PARSE_ERRORS, WS_RECONNECTS};

/// Decode one text frame. `None` means the frame is unusable (not JSON, no
/// `type`, or a known type with a broken payload) — callers log and drop.
pub fn parse_frame(txt: &str) -> Option<StreamEvent> {
    let v: serde_json::Value = serde_json::from_str(txt).ok()?;
    let kind = v.get("type")?.as_str()?.to_string();
    match kind.as_str() {
        "quote" => serde_json::from_value::<QuoteEvent>(v).ok().map(StreamEvent::Quote),
        "portfolio_update" => {
            let positions = v
                .get("positions")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .ok()?
                .unwrap_or_default();
            let totals = v
                .get("totals")
                .cloned()
                .and_then(|t| serde_json::from_value(t).ok());
            let account_balance = v.get("account_balance").and_then(|b| b.as_f64());
            Some(StreamEvent::PortfolioUpdate {
                positions,
                totals,
                account_balance,
            })
        }
        "status" => {
            let subscribed_symbols = v
                .get("subscribed_symbols")
                .cloned()
                .and_then(|s| serde_json::from_value(s).ok())
                .unwrap_or_default();
            Some(StreamEvent::Status { subscribed_symbols })
        }
        "ai_analysis" => Some(StreamEvent::AiAnalysis(v)),
        _ => Some(StreamEvent::Unknown { kind, raw: v }),
    }
}

fn set_state(stream: StreamKind, tx: &watch::Sender<ConnState>, state: ConnState) {
    WS_CONNECTED
        .with_label_values(&[stream.as_str()])
        .set(if state == ConnState::Connected { 1 } else { 0 });
    let _ = tx.send(state);
}

/// Live WebSocket loop for one stream.
///
/// On close the state flips to Disconnected immediately, then exactly one
/// reconnect sleep runs before the next attempt. Shutdown wins any race:
/// it cancels the sleep and the read loop, so no reconnect can happen after
/// the owner is gone.
pub async fn run_live(
    stream: StreamKind,
    ws_base: String,
    reconnect_delay: Duration,
    ev_tx: mpsc::Sender<StreamEvent>,
    state_tx: watch::Sender<ConnState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_url = format!("{}{}", ws_base.trim_end_matches('/'), stream.path());
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            set_state(stream, &state_tx, ConnState::Error);
            return;
        }
    };

    loop {
        set_state(stream, &state_tx, ConnState::Connecting);
        info!(stream = stream.as_str(), %ws_url, "connecting");

        let connected = tokio::select! {
            res = connect_async(url.clone()) => res,
            _ = shutdown.changed() => {
                set_state(stream, &state_tx, ConnState::Disconnected);
                return;
            }
        };

        match connected {
            Ok((mut ws, _resp)) => {
                info!(stream = stream.as_str(), "connected");
                set_state(stream, &state_tx, ConnState::Connected);

                loop {
                    tokio::select! {
                        frame = ws.next() => match frame {
                            Some(Ok(m)) if m.is_text() => {
                                let txt = match m.into_text() {
                                    Ok(t) => t,
                                    Err(e) => {
                                        warn!(?e, stream = stream.as_str(), "unreadable text frame");
                                        WS_PARSE_ERRORS.with_label_values(&[stream.as_str()]).inc();
                                        continue;
                                    }
                                };
                                match parse_frame(&txt) {
                                    Some(ev) => {
                                        if ev_tx.send(ev).await.is_err() {
                                            // reconciler gone; nothing left to feed
                                            set_state(stream, &state_tx, ConnState::Disconnected);
                                            return;
                                        }
                                    }
                                    None => {
                                        warn!(stream = stream.as_str(), "malformed frame dropped");
                                        WS_PARSE_ERRORS.with_label_values(&[stream.as_str()]).inc();
                                    }
                                }
                            }
                            Some(Ok(_)) => {
                                // ignore non-text frames
                            }
                            Some(Err(e)) => {
                                error!(?e, stream = stream.as_str(), "ws read error");
                                break;
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            let _ = ws.close(None).await;
                            set_state(stream, &state_tx, ConnState::Disconnected);
                            return;
                        }
                    }
                }

                // stale, not invalid: flip the badge before the backoff runs
                set_state(stream, &state_tx, ConnState::Disconnected);
                info!(stream = stream.as_str(), "disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, stream = stream.as_str(), "connect failed");
                set_state(stream, &state_tx, ConnState::Error);
            }
        }

        tokio::select! {
            _ = sleep(reconnect_delay) => {
                WS_RECONNECTS.with_label_values(&[stream.as_str()]).inc();
            }
            _ = shutdown.changed() => {
                set_state(stream, &state_tx, ConnState::Disconnected);
                return;
            }
        }
    }
}

/// Random-walk quote generator for offline runs (~5 ticks/s per symbol).
pub async fn run_mock(
    symbols: Vec<String>,
    ev_tx: mpsc::Sender<StreamEvent>,
    state_tx: watch::Sender<ConnState>,
    mut shutdown: watch::Receiver<bool>,
) {
    set_state(StreamKind::Quotes, &state_tx, ConnState::Connected);
    let mut prices: Vec<f64> = symbols.iter().map(|_| 100.0).collect();
    let mut seq: u64 = 0;
    loop {
        for (i, sym) in symbols.iter().enumerate() {
            // do not hold ThreadRng across an .await
            let step = rand::thread_rng().gen_range(-0.25..=0.25);
            prices[i] = (prices[i] + step).max(1.0);
            seq += 1;
            let ev = StreamEvent::Quote(QuoteEvent {
                symbol: sym.clone(),
                last_done: Some((prices[i] * 100.0).round() / 100.0),
                close: None,
                open: None,
                high: None,
                low: None,
                volume: None,
                turnover: None,
                timestamp: Some(Utc::now()),
                sequence: Some(seq),
            });
            if ev_tx.send(ev).await.is_err() {
                return;
            }
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(200)) => {}
            _ = shutdown.changed() => {
                set_state(StreamKind::Quotes, &state_tx, ConnState::Disconnected);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quote_frame() {
        let ev = parse_frame(r#"{"type":"quote","symbol":"AAPL.US","last_done":155.0,"sequence":7}"#)
            .expect("quote frame");
        match ev {
            StreamEvent::Quote(q) => {
                assert_eq!(q.symbol, "AAPL.US");
                assert_eq!(q.price(), Some(155.0));
                assert_eq!(q.sequence, Some(7));
            }
            other => panic!("expected quote, got {other:?}"),
        }
    }

    #[test]
    fn quote_price_falls_back_to_close() {
        let ev = parse_frame(r#"{"type":"quote","symbol":"X","close":12.5}"#).unwrap();
        match ev {
            StreamEvent::Quote(q) => assert_eq!(q.price(), Some(12.5)),
            other => panic!("expected quote, got {other:?}"),
        }
    }

    #[test]
    fn parses_portfolio_update() {
        let ev = parse_frame(
            r#"{"type":"portfolio_update","positions":[{"symbol":"TSLA.US","quantity":2.0,"avg_cost":200.0}],"account_balance":5000.0}"#,
        )
        .unwrap();
        match ev {
            StreamEvent::PortfolioUpdate {
                positions,
                account_balance,
                ..
            } => {
                assert_eq!(positions.len(), 1);
                assert_eq!(positions[0].symbol, "TSLA.US");
                assert_eq!(account_balance, Some(5000.0));
            }
            other => panic!("expected portfolio_update, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_preserved_not_dropped() {
        let ev = parse_frame(r#"{"type":"heartbeat","n":3}"#).unwrap();
        match ev {
            StreamEvent::Unknown { kind, raw } => {
                assert_eq!(kind, "heartbeat");
                assert_eq!(raw["n"], 3);
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_none() {
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame(r#"{"no_type":1}"#).is_none());
        assert!(parse_frame(r#"{"type":42}"#).is_none());
    }
}
