// SPDX-License-Identifier: Apache-2.0

//! Ships finished traces to Elasticsearch, applying three admission rules
//! in order before the sink call: a configured-URL gate, a request-name
//! filter, and a decaying one-minute rate limit.

use std::collections::HashSet;

use chrono::Utc;
use requestmonitor_metrics::RateMeter;

use super::RequestTraceReporter;
use crate::trace::RequestTrace;

const DOCUMENT_TYPE: &str = "requests";

pub struct ElasticsearchReporter {
    client: reqwest::Client,
    url: Option<String>,
    index_prefix: String,
    only_report_requests_with_name: HashSet<String>,
    requests_per_minute_limit: i64,
    rate_meter: RateMeter,
}

impl ElasticsearchReporter {
    pub fn new(
        url: Option<String>,
        index_prefix: impl Into<String>,
        only_report_requests_with_name: HashSet<String>,
        requests_per_minute_limit: i64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            index_prefix: index_prefix.into(),
            only_report_requests_with_name,
            requests_per_minute_limit,
            rate_meter: RateMeter::new(),
        }
    }

    fn index_name(&self) -> String {
        format!("{}-{}", self.index_prefix, Utc::now().format("%Y.%m.%d"))
    }
}

#[async_trait::async_trait]
impl RequestTraceReporter for ElasticsearchReporter {
    fn is_active(&self, trace: &RequestTrace) -> bool {
        let Some(_) = &self.url else {
            return false;
        };
        if self.requests_per_minute_limit == 0 {
            return false;
        }
        if !self.only_report_requests_with_name.is_empty()
            && !self
                .only_report_requests_with_name
                .contains(&trace.name())
        {
            return false;
        }
        true
    }

    async fn report_request_trace(&self, trace: &RequestTrace) -> anyhow::Result<()> {
        self.rate_meter.mark();
        if self.requests_per_minute_limit != i64::MAX
            && self.rate_meter.one_minute_rate_per_minute() > self.requests_per_minute_limit as f64
        {
            return Ok(());
        }

        let base_url = self
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("elasticsearch reporter has no url configured"))?;
        let endpoint = format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.index_name(),
            DOCUMENT_TYPE
        );

        self.client
            .post(endpoint)
            .json(&trace.to_json())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Name;

    fn trace(name: &str) -> RequestTrace {
        RequestTrace::new("1", Name::Eager(name.to_string()))
    }

    #[test]
    fn inactive_without_a_configured_url() {
        let reporter =
            ElasticsearchReporter::new(None, "requests", HashSet::new(), i64::MAX);
        assert!(!reporter.is_active(&trace("Report Me")));
    }

    #[test]
    fn inactive_when_rate_limit_is_zero() {
        let reporter = ElasticsearchReporter::new(
            Some("http://es.example".into()),
            "requests",
            HashSet::new(),
            0,
        );
        assert!(!reporter.is_active(&trace("Report Me")));
    }

    #[test]
    fn name_filter_rejects_non_matching_trace_but_stays_healthy() {
        let mut names = HashSet::new();
        names.insert("Report Me".to_string());
        let reporter = ElasticsearchReporter::new(
            Some("http://es.example".into()),
            "requests",
            names,
            i64::MAX,
        );

        assert!(!reporter.is_active(&trace("Regular Foo")));
        // The reporter itself is still healthy: a matching trace is active.
        assert!(reporter.is_active(&trace("Report Me")));
    }

    #[test]
    fn index_name_uses_utc_date_and_configured_prefix() {
        let reporter =
            ElasticsearchReporter::new(Some("http://es.example".into()), "myapp-requests", HashSet::new(), i64::MAX);
        let index = reporter.index_name();
        assert!(index.starts_with("myapp-requests-"));
        assert_eq!(index.len(), "myapp-requests-".len() + "yyyy.MM.dd".len());
    }
}
