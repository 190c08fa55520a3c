//! Post-deployment health checks.
//!
//! A fixed set of checks, each retried up to 8 times with 3-second gaps:
//! the gateway and lighttpd services, the deployed web root, the SSE health
//! endpoint, and the reverse-proxy route.

use std::time::Duration;

use tracing::{info, warn};

use super::runner::EventBus;

/// Retries per check.
pub const HEALTH_CHECK_RETRIES: u32 = 8;
/// Gap between retries.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// One health check target.
enum Check {
    Systemd(&'static str),
    Http(&'static str),
}

const CHECKS: &[(&str, Check)] = &[
    ("mcapp_service", Check::Systemd("mcapp")),
    ("lighttpd_service", Check::Systemd("lighttpd")),
    ("webapp_http", Check::Http("http://localhost/webapp/index.html")),
    ("sse_health", Check::Http("http://localhost:2981/health")),
    ("lighttpd_proxy", Check::Http("http://localhost/health")),
];

/// Run every check; publishes one `health` event per check. Returns true
/// when all pass.
pub async fn run_health_checks(bus: &EventBus) -> bool {
    let http = reqwest::Client::new();
    let mut all_passed = true;

    for (name, check) in CHECKS {
        let mut passed = false;
        for attempt in 0..HEALTH_CHECK_RETRIES {
            if run_one(check, &http).await {
                passed = true;
                break;
            }
            if attempt + 1 < HEALTH_CHECK_RETRIES {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
            }
        }

        bus.publish("health", serde_json::json!({"check": name, "passed": passed}));
        if passed {
            info!(check = *name, "health check passed");
        } else {
            warn!(check = *name, "health check failed");
            all_passed = false;
        }
    }

    all_passed
}

async fn run_one(check: &Check, http: &reqwest::Client) -> bool {
    match check {
        Check::Systemd(unit) => tokio::process::Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false),
        Check::Http(url) => http
            .get(*url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false),
    }
}
