//! HTTP implementation of [`TraceSource`] against a Langfuse-style REST API.
//!
//! The source exposes `GET /api/public/traces` (paginated listing) and
//! `GET /api/public/traces/{id}` (single trace with observations), both
//! behind basic auth with a public/secret key pair.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use url::Url;

use super::{FetchError, TraceDetail, TracePage, TraceSource};

/// Telemetry source connection settings.
#[derive(Debug, Clone)]
pub struct TraceSourceSettings {
    pub base_url: Url,
    pub public_key: String,
    pub secret_key: String,
    pub request_timeout: Duration,
}

pub struct HttpTraceSource {
    client: reqwest::Client,
    settings: TraceSourceSettings,
}

impl HttpTraceSource {
    pub fn new(settings: TraceSourceSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.settings
            .base_url
            .join(path)
            .map_err(|e| FetchError::Parse(format!("invalid trace endpoint {path}: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        context: &str,
    ) -> Result<T, FetchError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.settings.public_key, Some(&self.settings.secret_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                context: context.to_string(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Parse(format!("{context}: {e}")))
    }
}

#[async_trait]
impl TraceSource for HttpTraceSource {
    async fn fetch_traces(
        &self,
        from: DateTime<Utc>,
        page_size: u32,
        page: u32,
    ) -> Result<TracePage, FetchError> {
        let mut url = self.endpoint("/api/public/traces")?;
        url.query_pairs_mut()
            .append_pair(
                "fromTimestamp",
                &from.to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .append_pair("limit", &page_size.to_string())
            .append_pair("page", &page.to_string());

        self.get_json(url, &format!("trace listing page {page}")).await
    }

    async fn fetch_trace(&self, id: &str) -> Result<TraceDetail, FetchError> {
        let url = self.endpoint(&format!("/api/public/traces/{id}"))?;

        // The single-trace endpoint wraps the payload in a `data` envelope.
        #[derive(serde::Deserialize)]
        struct Envelope {
            data: TraceDetail,
        }

        let envelope: Envelope = self.get_json(url, &format!("trace {id}")).await?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traces::UsageFetcher;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> TraceSourceSettings {
        TraceSourceSettings {
            base_url: Url::parse(&server.uri()).unwrap(),
            public_key: "pk-test".into(),
            secret_key: "sk-test".into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn trace_json(id: &str, cost: f64, latency: f64) -> serde_json::Value {
        json!({
            "id": id,
            "timestamp": "2025-07-03T10:00:00.000Z",
            "latencyMs": latency,
            "totalCostUSD": cost,
            "metadata": {"customerId": "cus_1"}
        })
    }

    #[tokio::test]
    async fn single_page_listing_makes_no_second_page_call() {
        let server = MockServer::start().await;

        let traces: Vec<_> = (0..100).map(|i| trace_json(&format!("t{i}"), 0.001, 100.0)).collect();
        Mock::given(method("GET"))
            .and(path("/api/public/traces"))
            .and(query_param("page", "1"))
            .and(basic_auth("pk-test", "sk-test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({
                    "data": traces,
                    "meta": {"totalPages": 1}
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        // One detail fetch per listed trace, none for a phantom second page.
        Mock::given(method("GET"))
            .and(wiremock::matchers::path_regex(r"^/api/public/traces/t\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "t0",
                    "timestamp": "2025-07-03T10:00:00.000Z",
                    "latencyMs": 100.0,
                    "totalCostUSD": 0.001,
                    "metadata": {},
                    "observations": []
                }
            })))
            .expect(100)
            .mount(&server)
            .await;

        let source = Arc::new(HttpTraceSource::new(settings(&server)).unwrap());
        let fetcher = UsageFetcher::new(source, 100);
        let since = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();

        let details = fetcher.fetch(since, None).await.unwrap();
        assert_eq!(details.len(), 100);
    }

    #[tokio::test]
    async fn multi_page_listing_accumulates_in_order() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/public/traces"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [trace_json("a", 0.001, 10.0)],
                "meta": {"totalPages": 2}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/public/traces"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [trace_json("b", 0.002, 20.0)],
                "meta": {"totalPages": 2}
            })))
            .mount(&server)
            .await;
        for id in ["a", "b"] {
            Mock::given(method("GET"))
                .and(path(format!("/api/public/traces/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": {
                        "id": id,
                        "timestamp": "2025-07-03T10:00:00.000Z",
                        "latencyMs": 10.0,
                        "totalCostUSD": 0.001,
                        "metadata": {},
                        "observations": []
                    }
                })))
                .mount(&server)
                .await;
        }

        let source = Arc::new(HttpTraceSource::new(settings(&server)).unwrap());
        let fetcher = UsageFetcher::new(source, 1);
        let since = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();

        let details = fetcher.fetch(since, None).await.unwrap();
        let ids: Vec<_> = details.iter().map(|d| d.trace.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn noop_traces_are_filtered_before_detail_fetch() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/public/traces"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [trace_json("noop", 0.0, 0.0), trace_json("real", 0.01, 500.0)],
                "meta": {"totalPages": 1}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/public/traces/real"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "real",
                    "timestamp": "2025-07-03T10:00:00.000Z",
                    "latencyMs": 500.0,
                    "totalCostUSD": 0.01,
                    "metadata": {},
                    "observations": []
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = Arc::new(HttpTraceSource::new(settings(&server)).unwrap());
        let fetcher = UsageFetcher::new(source, 100);

        let details = fetcher.fetch(Utc::now(), None).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].trace.id, "real");
    }

    #[tokio::test]
    async fn server_error_aborts_whole_fetch() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/public/traces"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = Arc::new(HttpTraceSource::new(settings(&server)).unwrap());
        let fetcher = UsageFetcher::new(source, 100);

        let err = fetcher.fetch(Utc::now(), None).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { .. }));
    }

    #[tokio::test]
    async fn specific_trace_skips_listing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/public/traces/tr-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "tr-9",
                    "timestamp": "2025-07-03T10:00:00.000Z",
                    "latencyMs": 2000.0,
                    "totalCostUSD": 0.002,
                    "metadata": {},
                    "observations": [
                        {"model": "gpt-4o", "usage": {"input": 100, "output": 50, "total": 150}, "calculatedTotalCostUSD": 0.002}
                    ]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = Arc::new(HttpTraceSource::new(settings(&server)).unwrap());
        let fetcher = UsageFetcher::new(source, 100);

        let details = fetcher.fetch(Utc::now(), Some("tr-9")).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].observations.len(), 1);
    }
}
