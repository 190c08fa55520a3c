//! Deduplication, throttling and abuse protection for the command engine.
//!
//! Three layers: a 5-minute msg-id dedup cache, a content-keyed throttle
//! (5 minutes default, 5 seconds for the cheap interactive commands), and
//! the abuse tally (three failed attempts within 5 minutes block the
//! sender for 25 minutes).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::registry::CommandId;

/// Msg-id dedup window.
pub const MSG_ID_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Default content throttle window.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(5 * 60);
/// Short throttle for interactive commands.
pub const SHORT_THROTTLE: Duration = Duration::from_secs(5);
/// Failed attempts tolerated within [`ABUSE_WINDOW`] before a block.
pub const MAX_FAILED_ATTEMPTS: usize = 3;
pub const ABUSE_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Block duration after the tally is exceeded.
pub const BLOCK_DURATION: Duration = Duration::from_secs(25 * 60);

/// Commands with the short throttle window.
pub fn throttle_window(cmd: CommandId) -> Duration {
    match cmd {
        CommandId::Dice
        | CommandId::Time
        | CommandId::Group
        | CommandId::KickBan
        | CommandId::Topic => SHORT_THROTTLE,
        _ => DEFAULT_THROTTLE,
    }
}

/// Throttle/abuse key: source, destination and the command word; arguments
/// only count for commands on the default window.
pub fn content_key(src: &str, dst: &str, msg: &str) -> String {
    if let Some(parsed) = super::registry::parse_command_word(msg) {
        if throttle_window(parsed) == SHORT_THROTTLE {
            let word = msg.split_whitespace().next().unwrap_or(msg);
            return format!("{src}:{dst}:{word}");
        }
    }
    format!("{src}:{dst}:{msg}")
}

#[derive(Debug)]
struct ThrottleEntry {
    at: Instant,
    cmd: Option<CommandId>,
}

/// All dedup/throttle/abuse state, guarded by one mutex in the engine.
#[derive(Debug, Default)]
pub struct DedupState {
    processed_msg_ids: HashMap<String, Instant>,
    throttle: HashMap<String, ThrottleEntry>,
    failed_attempts: HashMap<String, Vec<Instant>>,
    blocked_users: HashMap<String, Instant>,
    block_notified: HashSet<String>,
}

impl DedupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Msg-id dedup with expiry cleanup.
    pub fn is_duplicate(&mut self, msg_id: &str) -> bool {
        let now = Instant::now();
        self.processed_msg_ids
            .retain(|_, at| now.duration_since(*at) < MSG_ID_WINDOW);
        self.processed_msg_ids.contains_key(msg_id)
    }

    pub fn mark_processed(&mut self, msg_id: &str) {
        self.processed_msg_ids.insert(msg_id.to_string(), Instant::now());
    }

    /// Returns a human-readable window description when the content key is
    /// still throttled.
    pub fn throttle_window_hit(&mut self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.throttle.retain(|_, entry| {
            let window = entry.cmd.map_or(DEFAULT_THROTTLE, throttle_window);
            now.duration_since(entry.at) < window
        });
        self.throttle.get(key).map(|entry| {
            let window = entry.cmd.map_or(DEFAULT_THROTTLE, throttle_window);
            if window < Duration::from_secs(60) {
                format!("{}s", window.as_secs())
            } else {
                format!("{}min", window.as_secs() / 60)
            }
        })
    }

    pub fn mark_content(&mut self, key: &str, cmd: CommandId) {
        self.throttle.insert(
            key.to_string(),
            ThrottleEntry {
                at: Instant::now(),
                cmd: Some(cmd),
            },
        );
    }

    /// Record one failed attempt; blocks the source once the tally trips.
    pub fn track_failed_attempt(&mut self, src: &str) {
        let now = Instant::now();
        let attempts = self.failed_attempts.entry(src.to_string()).or_default();
        attempts.push(now);
        attempts.retain(|at| now.duration_since(*at) < ABUSE_WINDOW);
        if attempts.len() >= MAX_FAILED_ATTEMPTS {
            self.blocked_users.insert(src.to_string(), now);
        }
    }

    pub fn is_user_blocked(&mut self, src: &str) -> bool {
        let now = Instant::now();
        let expired: Vec<String> = self
            .blocked_users
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= BLOCK_DURATION)
            .map(|(src, _)| src.clone())
            .collect();
        for src in expired {
            self.blocked_users.remove(&src);
            self.block_notified.remove(&src);
        }
        self.blocked_users.contains_key(src)
    }

    /// For a blocked source: `Some(true)` exactly once (send the courtesy
    /// reply), then `Some(false)`.
    pub fn should_notify_block(&mut self, src: &str) -> Option<bool> {
        if !self.blocked_users.contains_key(src) {
            return None;
        }
        Some(self.block_notified.insert(src.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_detect_duplicate_msg_ids() {
        let mut state = DedupState::new();
        assert!(!state.is_duplicate("0000002A"));
        state.mark_processed("0000002A");
        assert!(state.is_duplicate("0000002A"));
        assert!(!state.is_duplicate("0000002B"));
    }

    #[test]
    fn test_should_block_after_three_failures_and_notify_once() {
        let mut state = DedupState::new();
        state.track_failed_attempt("OE5HWN-12");
        state.track_failed_attempt("OE5HWN-12");
        assert!(!state.is_user_blocked("OE5HWN-12"));

        state.track_failed_attempt("OE5HWN-12");
        assert!(state.is_user_blocked("OE5HWN-12"));

        assert_eq!(state.should_notify_block("OE5HWN-12"), Some(true));
        assert_eq!(state.should_notify_block("OE5HWN-12"), Some(false));
        assert_eq!(state.should_notify_block("DK5EN-1"), None);
    }

    #[test]
    fn test_should_throttle_repeated_content() {
        let mut state = DedupState::new();
        let key = content_key("OE5HWN-12", "20", "!STATS 24");
        assert!(state.throttle_window_hit(&key).is_none());
        state.mark_content(&key, CommandId::Stats);
        assert_eq!(state.throttle_window_hit(&key), Some("5min".to_string()));
    }

    #[test]
    fn test_should_key_short_throttle_commands_without_arguments() {
        // Dice with different args still maps to the same key: the 5 s
        // window applies per command, not per argument set.
        let a = content_key("X-1", "20", "!DICE");
        let b = content_key("X-1", "20", "!DICE AGAIN");
        assert_eq!(a, b);

        // Default-window commands keep their arguments in the key.
        let c = content_key("X-1", "20", "!STATS 24");
        let d = content_key("X-1", "20", "!STATS 48");
        assert_ne!(c, d);
    }

    #[test]
    fn test_should_use_short_window_for_interactive_commands() {
        assert_eq!(throttle_window(CommandId::Dice), SHORT_THROTTLE);
        assert_eq!(throttle_window(CommandId::Time), SHORT_THROTTLE);
        assert_eq!(throttle_window(CommandId::Weather), DEFAULT_THROTTLE);
        assert_eq!(throttle_window(CommandId::CtcPing), DEFAULT_THROTTLE);
    }
}
