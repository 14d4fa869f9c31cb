// ===============================
// src/api.rs
// ===============================
//
// REST client for the dashboard backend. Read side feeds the snapshot
// loader; write side backs the command dispatcher. Mutating calls are
// never retried here (user-initiated retry only).

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::domain::{EngineStatus, Position, Snapshot, Totals};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error ({status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Parse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// Pull the human-readable reason out of a structured error body,
/// falling back to a generic message.
fn error_detail(status: u16, body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "message"] {
            if let Some(s) = v.get(key).and_then(|x| x.as_str()) {
                return s.to_string();
            }
        }
    }
    format!("request failed with status {status}")
}

#[derive(Debug, Deserialize)]
pub struct PortfolioOverview {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub totals: Option<Totals>,
    #[serde(default)]
    pub account_balance: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct MonitoringPositions {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub global_settings: Option<Value>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Server {
            status: status.as_u16(),
            detail: error_detail(status.as_u16(), &body),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp = self.http.get(self.url(path)).send().await?;
        let resp = Self::check(resp).await?;
        let v = resp
            .json::<T>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(v)
    }

    async fn send_empty(&self, req: reqwest::RequestBuilder) -> Result<(), ApiError> {
        let resp = req.send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn send_body(&self, req: reqwest::RequestBuilder, body: &Value) -> Result<(), ApiError> {
        let resp = req.json(body).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ---- snapshot reads ----

    pub async fn get_portfolio_overview(&self) -> Result<PortfolioOverview, ApiError> {
        self.get_json("/portfolio/positions").await
    }

    pub async fn get_monitoring_positions(&self) -> Result<MonitoringPositions, ApiError> {
        self.get_json("/monitoring/positions").await
    }

    pub async fn get_engine_status(&self) -> Result<EngineStatus, ApiError> {
        self.get_json("/ai-trading/engine/status").await
    }

    /// One authoritative snapshot. The portfolio overview is required; the
    /// monitoring settings and engine status degrade to `None` on failure so
    /// one flaky auxiliary endpoint does not blank the whole view.
    pub async fn load_snapshot(&self) -> Result<Snapshot, ApiError> {
        let overview = self.get_portfolio_overview().await?;

        let global_settings = match self.get_monitoring_positions().await {
            Ok(m) => m.global_settings,
            Err(e) => {
                warn!(%e, "monitoring positions fetch failed, keeping settings empty");
                None
            }
        };
        let engine = match self.get_engine_status().await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(%e, "engine status fetch failed");
                None
            }
        };

        Ok(Snapshot {
            positions: overview.positions,
            totals: overview.totals,
            account_balance: overview.account_balance,
            global_settings,
            engine,
        })
    }

    // ---- engine commands ----

    pub async fn engine_start(&self) -> Result<(), ApiError> {
        self.send_empty(self.http.post(self.url("/ai-trading/engine/start"))).await
    }

    pub async fn engine_stop(&self) -> Result<(), ApiError> {
        self.send_empty(self.http.post(self.url("/ai-trading/engine/stop"))).await
    }

    pub async fn engine_trigger(&self) -> Result<(), ApiError> {
        self.send_empty(self.http.post(self.url("/ai-trading/engine/trigger"))).await
    }

    pub async fn get_engine_config(&self) -> Result<Value, ApiError> {
        self.get_json("/ai-trading/config").await
    }

    pub async fn put_engine_config(&self, config: &Value) -> Result<(), ApiError> {
        self.send_body(self.http.put(self.url("/ai-trading/config")), config).await
    }

    // ---- monitoring commands ----

    pub async fn update_monitoring_position(
        &self,
        symbol: &str,
        body: &Value,
    ) -> Result<(), ApiError> {
        self.send_body(
            self.http.put(self.url(&format!("/monitoring/position/{symbol}"))),
            body,
        )
        .await
    }

    pub async fn batch_update(&self, body: &Value) -> Result<(), ApiError> {
        self.send_body(self.http.post(self.url("/monitoring/batch-update")), body)
            .await
    }

    pub async fn exclude_symbol(&self, symbol: &str) -> Result<(), ApiError> {
        self.send_empty(
            self.http.post(self.url(&format!("/monitoring/exclude/{symbol}"))),
        )
        .await
    }

    pub async fn put_global_settings(&self, settings: &Value) -> Result<(), ApiError> {
        self.send_body(self.http.put(self.url("/monitoring/global-settings")), settings)
            .await
    }

    // ---- AI positions ----

    pub async fn get_ai_positions(&self) -> Result<Vec<Position>, ApiError> {
        self.get_json("/ai-trading/positions").await
    }

    pub async fn get_trades(&self, limit: u32) -> Result<Value, ApiError> {
        self.get_json(&format!("/ai-trading/trades?limit={limit}")).await
    }

    pub async fn delete_ai_position(&self, symbol: &str) -> Result<(), ApiError> {
        self.send_empty(
            self.http.delete(self.url(&format!("/ai-trading/positions/{symbol}"))),
        )
        .await
    }

    pub async fn delete_ai_positions(&self) -> Result<(), ApiError> {
        self.send_empty(self.http.delete(self.url("/ai-trading/positions"))).await
    }

    // ---- history & strategies ----

    pub async fn get_history(
        &self,
        symbol: &str,
        limit: u32,
        period: &str,
        adjust_type: &str,
    ) -> Result<Value, ApiError> {
        self.get_json(&format!(
            "/quotes/history?symbol={symbol}&limit={limit}&period={period}&adjust_type={adjust_type}"
        ))
        .await
    }

    pub async fn sync_history(&self, body: &Value) -> Result<(), ApiError> {
        self.send_body(self.http.post(self.url("/quotes/history/sync")), body)
            .await
    }

    pub async fn get_watchlist_signals(&self) -> Result<Value, ApiError> {
        self.get_json("/strategies/advanced/watchlist/signals").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_prefers_detail_field() {
        let body = r#"{"detail":"engine already running"}"#;
        assert_eq!(error_detail(409, body), "engine already running");
    }

    #[test]
    fn error_detail_falls_back_to_message() {
        let body = r#"{"message":"bad symbol"}"#;
        assert_eq!(error_detail(422, body), "bad symbol");
    }

    #[test]
    fn error_detail_generic_on_junk() {
        assert_eq!(error_detail(500, "<html>"), "request failed with status 500");
        assert_eq!(error_detail(502, r#"{"other":1}"#), "request failed with status 502");
    }
}
