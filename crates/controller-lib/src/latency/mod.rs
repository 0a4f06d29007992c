//! Latency Source: queries an external time-series system for the current
//! HP tail latency in milliseconds.
//!
//! Grounded on `docker/drcio/controller.py::get_hp_latency` for the exact
//! Prometheus instant-query shape, and on the teacher's
//! `cli::client::ApiClient` for the `reqwest` client-construction idiom
//! (bounded timeout, `Context`-wrapped errors, typed JSON deserialize).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Classification of a failed latency read, for the caller's error counter.
/// The source itself stays metric-free, same separation as `ClusterView`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyFailure {
    Transport,
    Parse,
}

pub struct PrometheusLatencySource {
    client: reqwest::Client,
    base_url: String,
    query: String,
}

impl PrometheusLatencySource {
    pub fn new(base_url: impl Into<String>, namespace: &str, hp_label_value: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .context("failed to build Prometheus HTTP client")?;

        let query = format!(
            "histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{{namespace=\"{namespace}\",group_id=\"{hp_label_value}\"}}[1m])) by (le))"
        );

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            query,
        })
    }

    /// Return the current HP latency in milliseconds, or `Err` classified
    /// by failure mode. Stateless across calls: no connection bookkeeping
    /// beyond the shared `reqwest::Client`.
    pub async fn current_latency_ms(&self) -> Result<f64, LatencyFailure> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", self.query.as_str())])
            .send()
            .await
            .map_err(|_| LatencyFailure::Transport)?;

        if !response.status().is_success() {
            return Err(LatencyFailure::Transport);
        }

        let body: PrometheusResponse = response
            .json()
            .await
            .map_err(|_| LatencyFailure::Parse)?;

        if body.status != "success" {
            return Err(LatencyFailure::Parse);
        }

        let sample = body.data.result.first().ok_or(LatencyFailure::Parse)?;
        let latency_seconds: f64 = sample
            .value
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or(LatencyFailure::Parse)?;

        Ok(latency_seconds * 1000.0)
    }
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusSample>,
}

#[derive(Debug, Deserialize)]
struct PrometheusSample {
    value: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_well_formed_for_namespace_and_label() {
        let source = PrometheusLatencySource::new("http://prom:9090", "fraud-detection", "hp")
            .unwrap();
        assert!(source.query.contains("namespace=\"fraud-detection\""));
        assert!(source.query.contains("group_id=\"hp\""));
        assert!(source.query.starts_with("histogram_quantile(0.95,"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let source = PrometheusLatencySource::new("http://prom:9090/", "ns", "hp").unwrap();
        assert_eq!(source.base_url, "http://prom:9090");
    }

    #[tokio::test]
    async fn success_envelope_parses_to_milliseconds() {
        let body = serde_json::json!({
            "status": "success",
            "data": {"resultType": "vector", "result": [{"metric": {}, "value": [1700000000.0, "0.35"]}]}
        });
        let body: PrometheusResponse = serde_json::from_value(body).unwrap();
        assert_eq!(body.status, "success");
        let latency_seconds: f64 = body.data.result[0].value[1]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(latency_seconds * 1000.0, 350.0);
    }

    #[tokio::test]
    async fn empty_result_is_a_parse_failure_shape() {
        let body = serde_json::json!({
            "status": "success",
            "data": {"resultType": "vector", "result": []}
        });
        let body: PrometheusResponse = serde_json::from_value(body).unwrap();
        assert!(body.data.result.is_empty());
    }
}
