// ===============================
// src/project.rs (read-only view-model derivation)
// ===============================
//
// Pure functions from the reconciled ViewSnapshot to display values.
// No network, no mutation, fully deterministic — this is the unit-test
// seam for everything the dashboard would render.

use crate::domain::{ConnState, PriceDirection};
use crate::reconcile::ViewSnapshot;

/// Fixed 2-decimal money value, no sign decoration.
pub fn fmt_money(v: f64) -> String {
    format!("{v:.2}")
}

/// Fixed 2-decimal delta, `+`-prefixed when positive.
pub fn fmt_signed(v: f64) -> String {
    if v > 0.0 {
        format!("+{v:.2}")
    } else {
        format!("{v:.2}")
    }
}

/// Fixed 2-decimal percent delta, `+`-prefixed when positive.
pub fn fmt_signed_percent(v: f64) -> String {
    if v > 0.0 {
        format!("+{v:.2}%")
    } else {
        format!("{v:.2}%")
    }
}

/// CSS-style class for the transient price flash, if one is active.
pub fn flash_class(view: &ViewSnapshot, symbol: &str) -> Option<&'static str> {
    view.flashes.get(symbol).map(|d| match d {
        PriceDirection::Up => "flash-up",
        PriceDirection::Down => "flash-down",
    })
}

pub fn conn_badge(state: ConnState) -> &'static str {
    match state {
        ConnState::Disconnected => "offline",
        ConnState::Connecting => "connecting…",
        ConnState::Connected => "live",
        ConnState::Error => "error",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    /// Nothing loaded yet.
    Loading,
    /// First load never succeeded; show the failure instead of an empty table.
    Error(String),
    /// Loaded, but no positions to show.
    Empty,
    Ready,
}

pub fn view_state(view: &ViewSnapshot) -> ViewState {
    if !view.loaded {
        if let Some(b) = &view.banner {
            if b.kind == crate::domain::BannerKind::Error {
                return ViewState::Error(b.text.clone());
            }
        }
        return ViewState::Loading;
    }
    if view.positions.is_empty() {
        return ViewState::Empty;
    }
    ViewState::Ready
}

/// One formatted table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRow {
    pub symbol: String,
    pub quantity: String,
    pub price: String,
    pub market_value: String,
    pub pnl: String,
    pub pnl_percent: String,
    pub day_pnl: String,
    pub flash: Option<&'static str>,
}

pub fn position_rows(view: &ViewSnapshot) -> Vec<PositionRow> {
    view.positions
        .iter()
        .map(|p| PositionRow {
            symbol: p.symbol.clone(),
            quantity: fmt_money(p.quantity),
            price: fmt_money(p.current_price),
            market_value: fmt_money(p.market_value),
            pnl: fmt_signed(p.pnl),
            pnl_percent: fmt_signed_percent(p.pnl_percent),
            day_pnl: p.day_pnl.map(fmt_signed).unwrap_or_else(|| "-".to_string()),
            flash: flash_class(view, &p.symbol),
        })
        .collect()
}

/// One-line portfolio summary (heartbeat log, status bar).
pub fn totals_line(view: &ViewSnapshot) -> String {
    format!(
        "mv={} pnl={} ({}) positions={}",
        fmt_money(view.totals.market_value),
        fmt_signed(view.totals.pnl),
        fmt_signed_percent(view.totals.pnl_percent),
        view.positions.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Banner, BannerKind, Direction, Position};
    use chrono::Utc;

    fn view_with(positions: Vec<Position>, loaded: bool) -> ViewSnapshot {
        let mut v = ViewSnapshot {
            positions,
            loaded,
            ..Default::default()
        };
        v.totals.resum(&v.positions);
        v
    }

    fn pos(symbol: &str, qty: f64, avg_cost: f64, price: f64) -> Position {
        let mut p = Position {
            symbol: symbol.to_string(),
            quantity: qty,
            direction: Direction::Long,
            avg_cost,
            current_price: price,
            market_value: 0.0,
            pnl: 0.0,
            pnl_percent: 0.0,
            day_pnl: None,
            day_pnl_percent: None,
            last_update: Utc::now(),
        };
        p.recompute();
        p
    }

    #[test]
    fn money_is_fixed_two_decimals() {
        assert_eq!(fmt_money(1550.0), "1550.00");
        assert_eq!(fmt_money(0.005), "0.01");
        assert_eq!(fmt_money(-3.2), "-3.20");
    }

    #[test]
    fn positive_deltas_get_a_sign_prefix() {
        assert_eq!(fmt_signed(50.0), "+50.00");
        assert_eq!(fmt_signed(-50.0), "-50.00");
        assert_eq!(fmt_signed(0.0), "0.00");
        assert_eq!(fmt_signed_percent(3.333333), "+3.33%");
        assert_eq!(fmt_signed_percent(-1.0), "-1.00%");
    }

    #[test]
    fn flash_class_reflects_direction_map() {
        let mut v = view_with(vec![pos("AAPL.US", 10.0, 150.0, 155.0)], true);
        assert_eq!(flash_class(&v, "AAPL.US"), None);
        v.flashes.insert("AAPL.US".into(), PriceDirection::Up);
        assert_eq!(flash_class(&v, "AAPL.US"), Some("flash-up"));
        v.flashes.insert("AAPL.US".into(), PriceDirection::Down);
        assert_eq!(flash_class(&v, "AAPL.US"), Some("flash-down"));
    }

    #[test]
    fn view_state_selection() {
        assert_eq!(view_state(&view_with(vec![], false)), ViewState::Loading);
        assert_eq!(view_state(&view_with(vec![], true)), ViewState::Empty);
        assert_eq!(
            view_state(&view_with(vec![pos("AAPL.US", 1.0, 1.0, 1.0)], true)),
            ViewState::Ready
        );

        let mut failed = view_with(vec![], false);
        failed.banner = Some(Banner {
            kind: BannerKind::Error,
            text: "network error: refused".into(),
        });
        assert_eq!(
            view_state(&failed),
            ViewState::Error("network error: refused".into())
        );
    }

    #[test]
    fn rows_format_the_reference_scenario() {
        // AAPL 10 @ 150 after a 155 tick
        let v = view_with(vec![pos("AAPL.US", 10.0, 150.0, 155.0)], true);
        let rows = position_rows(&v);
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.price, "155.00");
        assert_eq!(r.market_value, "1550.00");
        assert_eq!(r.pnl, "+50.00");
        assert_eq!(r.pnl_percent, "+3.33%");
        assert_eq!(r.day_pnl, "-");
    }

    #[test]
    fn totals_line_is_deterministic() {
        let v = view_with(vec![pos("AAPL.US", 10.0, 150.0, 155.0)], true);
        assert_eq!(totals_line(&v), "mv=1550.00 pnl=+50.00 (+3.33%) positions=1");
    }
}
