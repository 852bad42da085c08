//! Probe execution and response classification

use crate::{HealthCheckEngine, REPORT_SOURCE};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;
use watchdog_common::types::PROBE_DURATION_UNAVAILABLE;
use watchdog_common::{is_success_code, Error, HealthCheck, HealthState, Result, Ticks};
use watchdog_platform::{Partition, PlatformClient, ReplicaRole, ResolvedEndpoint};

/// Classify a response status against the check's configured code sets.
///
/// The warning set is consulted first, then the error set, then the success
/// range; anything else is an error.
pub fn classify_response(check: &HealthCheck, status: u16) -> HealthState {
    if check.warning_status_codes.contains(&status) {
        HealthState::Warning
    } else if check.error_status_codes.contains(&status) {
        HealthState::Error
    } else if is_success_code(status) {
        HealthState::Ok
    } else {
        HealthState::Error
    }
}

/// First endpoint a probe may target: the primary of a stateful partition or
/// any stateless instance
fn probe_endpoint(endpoints: &[ResolvedEndpoint]) -> Option<&ResolvedEndpoint> {
    endpoints
        .iter()
        .find(|e| matches!(e.role, ReplicaRole::Primary | ReplicaRole::Stateless))
}

impl HealthCheckEngine {
    /// Execute one probe and return the check with refreshed result fields
    pub(crate) async fn probe(
        &self,
        client: &Arc<dyn PlatformClient>,
        check: &HealthCheck,
        partition: &Partition,
    ) -> Result<HealthCheck> {
        let key = partition.resolution_key().ok_or_else(|| {
            Error::InvalidArgument(format!("partition {} has an unknown kind", partition.id))
        })?;

        let base_address = match client.resolve_endpoints(&check.service_name, &key).await {
            Ok(endpoints) => probe_endpoint(&endpoints)
                .and_then(|e| e.listener_address(check.endpoint.as_deref()))
                .map(str::to_string),
            Err(e) if e.is_transient() => {
                warn!("endpoint resolution for '{}' failed: {}", check.key(), e);
                None
            }
            Err(Error::NotFound(what)) => {
                warn!("endpoint resolution for '{}' found nothing: {}", check.key(), what);
                None
            }
            Err(e) => return Err(e),
        };

        let captured = Utc::now();
        let Some(base_address) = base_address else {
            return self
                .finish_probe(client, check, partition.id, captured, None, Duration::ZERO, "")
                .await;
        };

        let url = format!(
            "{}/{}",
            base_address.trim_end_matches('/'),
            check.suffix_path.trim_start_matches('/')
        );
        let method = reqwest::Method::from_bytes(check.method.as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("'{}' is not an HTTP method", check.method)))?;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(check.maximum_duration());
        for (name, value) in &check.headers {
            request = request.header(name, value);
        }
        if let (Some(content), Some(media_type)) = (&check.content, &check.media_type) {
            request = request
                .header(reqwest::header::CONTENT_TYPE, media_type)
                .body(content.clone());
        }

        let started = Instant::now();
        let status = match request.send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                debug!("probe of {} failed: {}", url, e);
                None
            }
        };
        let elapsed = started.elapsed();

        self.finish_probe(client, check, partition.id, captured, status, elapsed, &base_address)
            .await
    }

    /// Publish verdict and availability, then build the updated record.
    /// `status` is `None` when no response was obtained.
    #[allow(clippy::too_many_arguments)]
    async fn finish_probe(
        &self,
        client: &Arc<dyn PlatformClient>,
        check: &HealthCheck,
        partition: Uuid,
        captured: chrono::DateTime<Utc>,
        status: Option<u16>,
        elapsed: Duration,
        location: &str,
    ) -> Result<HealthCheck> {
        let (verdict, result_code, duration_ms) = match status {
            Some(code) => (
                classify_response(check, code),
                code,
                elapsed.as_millis() as i64,
            ),
            None => (HealthState::Error, 500, PROBE_DURATION_UNAVAILABLE),
        };
        let success = verdict == HealthState::Ok;

        let description = match status {
            Some(code) => format!("probe '{}' returned {}", check.name, code),
            None => format!("probe '{}' could not reach the target", check.name),
        };
        if let Err(e) = client
            .report_partition_health(partition, REPORT_SOURCE, &check.name, verdict, &description)
            .await
        {
            warn!("failed to report partition health for '{}': {}", check.key(), e);
        }

        self.telemetry
            .report_availability(
                &check.service_name,
                &partition.to_string(),
                &check.name,
                captured,
                elapsed,
                location,
                success,
            )
            .await;

        Ok(HealthCheck {
            last_attempt: Some(Ticks::from_datetime(captured)),
            failure_count: if success { 0 } else { check.failure_count + 1 },
            result_code,
            duration_ms,
            ..check.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn check_with_sets(warning: &[u16], error: &[u16]) -> HealthCheck {
        serde_json::from_value::<HealthCheck>(serde_json::json!({
            "name": "hc",
            "service_name": "fabric:/A/B",
            "suffix_path": "health",
            "warning_status_codes": warning,
            "error_status_codes": error
        }))
        .unwrap()
    }

    #[test]
    fn warning_set_wins_over_error_set() {
        let check = check_with_sets(&[403], &[403, 500]);
        assert_eq!(classify_response(&check, 403), HealthState::Warning);
        assert_eq!(classify_response(&check, 500), HealthState::Error);
    }

    #[test]
    fn configured_sets_override_the_success_range() {
        let check = check_with_sets(&[204], &[]);
        assert_eq!(classify_response(&check, 204), HealthState::Warning);
        assert_eq!(classify_response(&check, 200), HealthState::Ok);
    }

    #[test]
    fn unconfigured_codes_fall_back_to_the_range_rule() {
        let check = check_with_sets(&[], &[]);
        assert_eq!(classify_response(&check, 299), HealthState::Ok);
        assert_eq!(classify_response(&check, 301), HealthState::Error);
        assert_eq!(classify_response(&check, 404), HealthState::Error);
    }

    #[test]
    fn probe_endpoint_skips_secondaries() {
        let endpoints = vec![
            ResolvedEndpoint {
                role: ReplicaRole::ActiveSecondary,
                listeners: BTreeMap::from([(String::new(), "http://s1".to_string())]),
            },
            ResolvedEndpoint {
                role: ReplicaRole::Primary,
                listeners: BTreeMap::from([(String::new(), "http://p1".to_string())]),
            },
        ];
        let picked = probe_endpoint(&endpoints).unwrap();
        assert_eq!(picked.listener_address(None), Some("http://p1"));

        let stateless = vec![ResolvedEndpoint {
            role: ReplicaRole::Stateless,
            listeners: BTreeMap::from([
                ("admin".to_string(), "http://a1".to_string()),
                ("data".to_string(), "http://d1".to_string()),
            ]),
        }];
        let picked = probe_endpoint(&stateless).unwrap();
        assert_eq!(picked.listener_address(Some("data")), Some("http://d1"));
        assert_eq!(picked.listener_address(None), Some("http://a1"));

        let only_secondary = vec![ResolvedEndpoint {
            role: ReplicaRole::ActiveSecondary,
            listeners: BTreeMap::new(),
        }];
        assert!(probe_endpoint(&only_secondary).is_none());
    }
}
