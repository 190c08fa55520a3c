//! Topic beacon scheduler (`!topic`).
//!
//! One cooperative task per group: sleep `interval*60 − 10` seconds
//! (floor 10), publish the beacon to the group over `udp_message`, loop.
//! `!topic delete GROUP` cancels the task; shutdown cancels every handle.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::registry::ParsedCommand;
use super::CommandEngine;
use crate::domain;
use crate::error::GatewayResult;
use crate::message::OutboundMessage;
use crate::router::{RouterEvent, Topic};

/// Beacon text length limit.
const MAX_BEACON_TEXT: usize = 120;
/// Interval bounds, minutes.
const INTERVAL_RANGE: (u32, u32) = (1, 1440);

#[derive(Debug)]
pub struct ActiveBeacon {
    pub text: String,
    pub interval_minutes: u32,
    handle: JoinHandle<()>,
}

/// All active beacons, keyed by group.
#[derive(Debug, Default)]
pub struct BeaconState {
    active: HashMap<String, ActiveBeacon>,
}

impl BeaconState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<(String, String, u32)> {
        self.active
            .iter()
            .map(|(group, b)| (group.clone(), b.text.clone(), b.interval_minutes))
            .collect()
    }

    pub fn contains(&self, group: &str) -> bool {
        self.active.contains_key(group)
    }

    fn stop(&mut self, group: &str) -> bool {
        match self.active.remove(group) {
            Some(beacon) => {
                beacon.handle.abort();
                debug!(group, "beacon stopped");
                true
            }
            None => false,
        }
    }

    /// Cancel and await every beacon task (shutdown path).
    pub async fn cancel_all(&mut self) {
        let drained: Vec<_> = self.active.drain().collect();
        for (group, beacon) in drained {
            beacon.handle.abort();
            let _ = beacon.handle.await;
            debug!(%group, "beacon cancelled on shutdown");
        }
    }
}

impl CommandEngine {
    /// `!topic` / `!topic GROUP TEXT interval:MIN` / `!topic delete GROUP`.
    pub(crate) async fn handle_topic(
        &self,
        parsed: &ParsedCommand,
        requester: &str,
    ) -> GatewayResult<String> {
        if !self.is_admin(requester) {
            return Ok("❌ Admin access required".to_string());
        }

        // Bare command: list active beacons.
        if parsed.args.is_empty() {
            let beacons = self.beacons.lock().await;
            let list = beacons.list();
            if list.is_empty() {
                return Ok("📡 No active beacon topics".to_string());
            }
            let rendered: Vec<String> = list
                .iter()
                .map(|(group, text, interval)| {
                    let preview = if text.len() > 30 {
                        format!("{}...", super::truncate(text, 30))
                    } else {
                        text.clone()
                    };
                    format!("Group {group}: '{preview}' every {interval}min")
                })
                .collect();
            return Ok(format!("📡 Active beacons: {}", rendered.join(" | ")));
        }

        if parsed.arg("action") == Some("delete") {
            let Some(group) = parsed.arg("group").map(str::to_string) else {
                return Ok("❌ Group required for delete".to_string());
            };
            if !domain::is_group(&group) {
                return Ok("❌ Invalid group format".to_string());
            }
            let mut beacons = self.beacons.lock().await;
            return Ok(if beacons.stop(&group) {
                format!("✅ Beacon stopped for group {group}")
            } else {
                format!("ℹ️ No beacon active for group {group}")
            });
        }

        let Some(group) = parsed.arg("group").map(str::to_string) else {
            return Ok("❌ Group required".to_string());
        };
        if !domain::is_group(&group) {
            return Ok("❌ Invalid group format (use digits 1-99999 or TEST)".to_string());
        }
        let text = parsed.arg("text").unwrap_or("").to_string();
        if text.is_empty() {
            return Ok("❌ Beacon text required".to_string());
        }
        if text.len() > MAX_BEACON_TEXT {
            return Ok("❌ Beacon text too long (max 120 chars)".to_string());
        }
        let interval: u32 = match parsed.arg("interval").unwrap_or("30").parse() {
            Ok(n) if (INTERVAL_RANGE.0..=INTERVAL_RANGE.1).contains(&n) => n,
            Ok(_) => return Ok("❌ Interval must be between 1 and 1440 minutes".to_string()),
            Err(_) => return Ok("❌ Invalid interval format".to_string()),
        };

        let mut beacons = self.beacons.lock().await;
        beacons.stop(&group);

        let engine = self.strong();
        let loop_group = group.clone();
        let loop_text = text.clone();
        let handle = tokio::spawn(async move {
            engine.beacon_loop(loop_group, loop_text, interval).await;
        });
        beacons.active.insert(
            group.clone(),
            ActiveBeacon {
                text: text.clone(),
                interval_minutes: interval,
                handle,
            },
        );
        info!(group = %group, interval, "beacon started");

        let preview = if text.len() > 50 {
            format!("{}...", super::truncate(&text, 50))
        } else {
            text
        };
        Ok(format!(
            "✅ Beacon started for group {group}: '{preview}' every {interval}min"
        ))
    }

    async fn beacon_loop(self: std::sync::Arc<Self>, group: String, text: String, interval_minutes: u32) {
        // Ten seconds early keeps the cadence on the radio side despite
        // air-time delays.
        let interval_secs = (u64::from(interval_minutes) * 60).saturating_sub(10).max(10);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval_secs)) => {}
            }

            if !self.beacons.lock().await.contains(&group) {
                return;
            }

            let out = OutboundMessage::new(&group, &format!("📡 {text}"), "beacon");
            self.router
                .publish("beacon", Topic::UdpMessage, RouterEvent::Outbound(out))
                .await;
            debug!(group = %group, "beacon sent");
        }
    }
}
