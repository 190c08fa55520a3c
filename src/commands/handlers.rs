//! Command handlers: data queries, simple commands, admin commands,
//! weather.

use chrono::{Local, TimeZone};
use rand::Rng;
use tracing::debug;

use super::registry::ParsedCommand;
use super::response::pad_for_chunk_break;
use super::CommandEngine;
use crate::domain::{self, base_callsign};
use crate::error::GatewayResult;

fn hhmm(timestamp_ms: i64) -> String {
    Local
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

impl CommandEngine {
    /// `!search call:CALL days:N` — per-callsign activity summary.
    pub(crate) async fn handle_search(
        &self,
        parsed: &ParsedCommand,
        _requester: &str,
    ) -> GatewayResult<String> {
        let user = parsed.arg("call").unwrap_or("*").to_uppercase();
        let days: i64 = parsed.arg("days").and_then(|d| d.parse().ok()).unwrap_or(1);

        // Bare callsigns search as a prefix across SSIDs.
        let (search_prefix, exact, display) = if user != "*" && !user.contains('-') {
            (format!("{user}-"), false, format!("{user}-*"))
        } else if user != "*" {
            (user.clone(), true, user.clone())
        } else {
            (String::new(), false, "*".to_string())
        };

        let rows = self.storage.search_activity(days).await?;

        let mut msg_count = 0u32;
        let mut pos_count = 0u32;
        let mut last_msg: Option<i64> = None;
        let mut last_pos: Option<i64> = None;
        let mut destinations: Vec<String> = Vec::new();
        let mut sids: Vec<(String, i64)> = Vec::new();

        for (src, dst, kind, timestamp) in rows {
            let matched = if user == "*" {
                true
            } else if exact {
                src.to_uppercase().contains(&search_prefix)
            } else {
                src.to_uppercase().starts_with(&search_prefix)
                    || src.to_uppercase() == user
            };
            if !matched {
                continue;
            }

            if !exact && user != "*" {
                if let Some(sid) = src.split('-').nth(1) {
                    match sids.iter_mut().find(|entry| entry.0 == sid) {
                        Some(entry) => entry.1 = entry.1.max(timestamp),
                        None => sids.push((sid.to_string(), timestamp)),
                    }
                }
            }

            match kind.as_str() {
                "msg" => {
                    msg_count += 1;
                    last_msg = Some(last_msg.map_or(timestamp, |t| t.max(timestamp)));
                    if dst.chars().all(|c| c.is_ascii_digit()) && !dst.is_empty() {
                        if !destinations.contains(&dst) {
                            destinations.push(dst);
                        }
                    }
                }
                "pos" => {
                    pos_count += 1;
                    last_pos = Some(last_pos.map_or(timestamp, |t| t.max(timestamp)));
                }
                _ => {}
            }
        }

        if msg_count == 0 && pos_count == 0 {
            return Ok(format!("🔍 No activity for {display} in last {days} day(s)"));
        }

        let mut response = format!("🔍 {display} ({days}d): ");
        if msg_count > 0 {
            response.push_str(&format!(
                "{msg_count} msg (last {})",
                hhmm(last_msg.unwrap_or(0))
            ));
        }
        if msg_count > 0 && pos_count > 0 {
            response.push_str(" / ");
        }
        if pos_count > 0 {
            response.push_str(&format!(
                "{pos_count} pos (last {})",
                hhmm(last_pos.unwrap_or(0))
            ));
        }
        if !sids.is_empty() {
            sids.sort_by(|a, b| b.1.cmp(&a.1));
            let rendered: Vec<String> = sids
                .iter()
                .map(|(sid, ts)| format!("-{sid} @{}", hhmm(*ts)))
                .collect();
            response.push_str(&format!(" / SIDs: {}", rendered.join(", ")));
        }
        if !destinations.is_empty() {
            destinations.sort_by_key(|d| d.parse::<u64>().unwrap_or(u64::MAX));
            response.push_str(&format!(" / Groups: {}", destinations.join(",")));
        }
        Ok(response)
    }

    /// `!stats [hours]` — message statistics.
    pub(crate) async fn handle_stats(&self, parsed: &ParsedCommand) -> GatewayResult<String> {
        let hours: i64 = parsed.arg("hours").and_then(|h| h.parse().ok()).unwrap_or(24);
        let (msg_count, pos_count, users) = self.storage.stats(hours).await?;
        let total = msg_count + pos_count;
        let avg = (total as f64 / hours.max(1) as f64 * 10.0).round() / 10.0;
        Ok(format!(
            "📊 Stats (last {hours}h): Messages: {msg_count}, Positions: {pos_count}, \
             Total: {total} ({avg}/h), Active stations: {users}"
        ))
    }

    /// `!mheard [limit] [type]` — recently heard stations, two padded lines.
    pub(crate) async fn handle_mheard(&self, parsed: &ParsedCommand) -> GatewayResult<String> {
        let limit: usize = parsed
            .arg("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(5);
        let kind = parsed.arg("type").unwrap_or("all").to_lowercase();

        let stations = self.storage.mheard_stations().await?;

        let mut lines: Vec<String> = Vec::new();

        if kind == "all" || kind == "msg" {
            let mut msg_stations: Vec<_> = stations.iter().filter(|s| s.1 > 0).collect();
            msg_stations.sort_by(|a, b| b.2.cmp(&a.2));
            if !msg_stations.is_empty() {
                let entries: Vec<String> = msg_stations
                    .iter()
                    .take(limit)
                    .map(|s| format!("{} @{} ({})", s.0, hhmm(s.2), s.1))
                    .collect();
                lines.push(format!("📻 MH: 💬 {}", entries.join(" | ")));
            }
        }

        if kind == "all" || kind == "pos" {
            let mut pos_stations: Vec<_> = stations.iter().filter(|s| s.3 > 0).collect();
            pos_stations.sort_by(|a, b| b.4.cmp(&a.4));
            if !pos_stations.is_empty() {
                let entries: Vec<String> = pos_stations
                    .iter()
                    .take(limit)
                    .map(|s| format!("{} @{} ({})", s.0, hhmm(s.4), s.3))
                    .collect();
                lines.push(format!("      📍 {}", entries.join(" | ")));
            }
        }

        match lines.len() {
            0 => Ok("📻 No activity found".to_string()),
            1 => Ok(lines.remove(0)),
            _ => {
                let first = pad_for_chunk_break(&lines[0]);
                Ok(format!("{first}{}", lines[1]))
            }
        }
    }

    /// `!pos call:CALL [days:N]` — latest stored position.
    pub(crate) async fn handle_position(&self, parsed: &ParsedCommand) -> GatewayResult<String> {
        let Some(callsign) = parsed.arg("call").map(str::to_uppercase) else {
            return Ok("❌ Callsign required (call:CALLSIGN)".to_string());
        };
        let days: i64 = parsed.arg("days").and_then(|d| d.parse().ok()).unwrap_or(7);

        match self.storage.latest_position(&callsign).await? {
            Some((lat, lon, ts)) if ts > 0 => Ok(format!(
                "🔍 {callsign} position: {lat:.4},{lon:.4} (last seen {})",
                hhmm(ts)
            )),
            Some((lat, lon, _)) => Ok(format!("🔍 {callsign} position: {lat:.4},{lon:.4}")),
            None => Ok(format!("🔍 No position data for {callsign} in last {days} day(s)")),
        }
    }

    /// `!dice` — two dice with Mäxchen scoring.
    pub(crate) fn handle_dice(&self, requester: &str) -> String {
        let mut rng = rand::thread_rng();
        let die1: u8 = rng.gen_range(1..=6);
        let die2: u8 = rng.gen_range(1..=6);
        let (value, label) = maexchen_value(die1, die2);
        format!("🎲 {requester}: [{die1}][{die2}] → {value} {label}").trim_end().to_string()
    }

    /// `!time` — node local time.
    pub(crate) fn handle_time(&self) -> String {
        let now = Local::now();
        let weekday = match now.format("%A").to_string().as_str() {
            "Monday" => "Montag",
            "Tuesday" => "Dienstag",
            "Wednesday" => "Mittwoch",
            "Thursday" => "Donnerstag",
            "Friday" => "Freitag",
            "Saturday" => "Samstag",
            "Sunday" => "Sonntag",
            other => return format!("🕐 {} Uhr, {other}, {}", now.format("%H:%M:%S"), now.format("%d.%m.%Y")),
        };
        format!(
            "🕐 {} Uhr, {weekday}, {}",
            now.format("%H:%M:%S"),
            now.format("%d.%m.%Y")
        )
    }

    /// `!wx` — cached weather for the node location.
    pub(crate) async fn handle_weather(&self) -> GatewayResult<String> {
        if !self.weather.has_location() {
            if let Some(gps) = self.router.cached_gps() {
                self.weather.update_location(gps.lat, gps.lon);
            }
        }
        match self.weather.get_weather().await {
            Ok(data) => Ok(self.weather.format_for_lora(&data)),
            Err(e) => {
                debug!(error = %e, "weather lookup failed");
                Ok(format!(
                    "❌ Weather unavailable: {}",
                    super::truncate(&e.to_string(), 30)
                ))
            }
        }
    }

    /// `!group on|off` — group-response mode (admin only).
    pub(crate) fn handle_group_control(&self, parsed: &ParsedCommand, requester: &str) -> String {
        if !self.is_admin(requester) {
            return "❌ Admin access required".to_string();
        }
        match parsed.arg("state").map(str::to_ascii_lowercase).as_deref() {
            Some("on") => {
                self.set_group_responses(true);
                "✅ Group responses ENABLED".to_string()
            }
            Some("off") => {
                self.set_group_responses(false);
                "✅ Group responses DISABLED".to_string()
            }
            _ => {
                let current = if self.group_responses_enabled() { "ON" } else { "OFF" };
                format!("🔧 Group responses: {current}. Use !group on|off")
            }
        }
    }

    /// `!userinfo` — configured operator info.
    pub(crate) fn handle_userinfo(&self) -> String {
        if self.user_info.is_empty() {
            "❌ User info not configured".to_string()
        } else {
            self.user_info.clone()
        }
    }

    /// `!kb [callsign] [del|list|delall]` — kick-ban list (admin only).
    pub(crate) fn handle_kickban(&self, parsed: &ParsedCommand, requester: &str) -> String {
        if !self.is_admin(requester) {
            return "❌ Admin access required".to_string();
        }

        let mut blocked = self.blocked_callsigns.lock().expect("blocklist poisoned");
        let arg = parsed.arg("callsign").unwrap_or("list");

        if arg == "list" {
            return if blocked.is_empty() {
                "📋 Blocklist is empty".to_string()
            } else {
                let list: Vec<&str> = blocked.iter().map(String::as_str).collect();
                format!("🚫 Blocked: {}", list.join(", "))
            };
        }

        if arg == "delall" {
            let count = blocked.len();
            blocked.clear();
            return format!("✅ Cleared {count} blocked callsign(s)");
        }

        let callsign = arg.to_uppercase();
        if !domain::is_strict_callsign(&callsign) {
            return "❌ Invalid callsign format".to_string();
        }
        if base_callsign(&callsign) == base_callsign(&self.my_callsign) {
            return "❌ Cannot block own callsign".to_string();
        }

        if parsed.arg("action") == Some("del") {
            return if blocked.remove(&callsign) {
                format!("✅ {callsign} unblocked")
            } else {
                format!("ℹ️ {callsign} was not blocked")
            };
        }

        if !blocked.insert(callsign.clone()) {
            return format!("ℹ️ {callsign} already blocked");
        }
        format!("🚫 {callsign} blocked")
    }

    /// `!help` — command overview.
    pub(crate) fn handle_help(&self) -> String {
        "📋 Available commands: \
         Search: !search call:CALL days:7, !pos call:CALL | \
         Stats: !stats 24, !mheard 5 | \
         Weather: !wx | \
         Fun: !dice, !time"
            .to_string()
    }
}

/// Mäxchen scoring: {2,1} is Mäxchen, doubles are Pasch, otherwise higher
/// die first.
fn maexchen_value(die1: u8, die2: u8) -> (String, &'static str) {
    if (die1 == 2 && die2 == 1) || (die1 == 1 && die2 == 2) {
        return ("21".to_string(), "(Mäxchen! 🏆)");
    }
    if die1 == die2 {
        let name = match die1 {
            1 => "(Einser-Pasch)",
            2 => "(Zweier-Pasch)",
            3 => "(Dreier-Pasch)",
            4 => "(Vierer-Pasch)",
            5 => "(Fünfer-Pasch)",
            _ => "(Sechser-Pasch)",
        };
        return (format!("{die1}{die2}"), name);
    }
    let (hi, lo) = if die1 > die2 { (die1, die2) } else { (die2, die1) };
    (format!("{hi}{lo}"), "")
}
