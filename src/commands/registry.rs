//! Command registry and the argument parser.
//!
//! Commands are a closed set. Arguments after `!cmd` are either
//! case-insensitive `key:value` pairs or positionals with per-command
//! meaning; the parser produces a flat argument map either way.

use std::collections::HashMap;

/// Command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    Search,
    Stats,
    Mheard,
    Pos,
    Dice,
    Time,
    Weather,
    Group,
    UserInfo,
    KickBan,
    Topic,
    CtcPing,
    Help,
}

/// Number of registered command words (aliases included).
pub const COMMAND_COUNT: usize = 16;

/// A parsed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub id: CommandId,
    pub args: HashMap<String, String>,
}

impl ParsedCommand {
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// Resolve just the command word (used by throttling before full parsing).
pub fn parse_command_word(msg: &str) -> Option<CommandId> {
    let word = msg.strip_prefix('!')?.split_whitespace().next()?;
    resolve(word)
}

fn resolve(word: &str) -> Option<CommandId> {
    match word.to_ascii_lowercase().as_str() {
        "search" | "s" => Some(CommandId::Search),
        "stats" => Some(CommandId::Stats),
        "mheard" | "mh" => Some(CommandId::Mheard),
        "pos" => Some(CommandId::Pos),
        "dice" => Some(CommandId::Dice),
        "time" => Some(CommandId::Time),
        "wx" | "weather" => Some(CommandId::Weather),
        "group" => Some(CommandId::Group),
        "userinfo" => Some(CommandId::UserInfo),
        "kb" => Some(CommandId::KickBan),
        "topic" => Some(CommandId::Topic),
        "ctcping" => Some(CommandId::CtcPing),
        "help" => Some(CommandId::Help),
        _ => None,
    }
}

/// Parse a command message. Returns `None` for unknown command words.
pub fn parse_command(msg: &str) -> Option<ParsedCommand> {
    let body = msg.strip_prefix('!')?;
    let mut parts = body.split_whitespace();
    let word = parts.next()?;
    let id = resolve(word)?;
    let rest: Vec<&str> = parts.collect();

    let mut args: HashMap<String, String> = HashMap::new();

    // key:value pairs apply to every command.
    for part in &rest {
        if let Some((key, value)) = part.split_once(':') {
            if !key.is_empty() {
                args.insert(key.to_ascii_lowercase(), value.to_string());
            }
        }
    }

    // Positional handling is per command.
    let positionals: Vec<&str> = rest.iter().copied().filter(|p| !p.contains(':')).collect();
    match id {
        CommandId::Search | CommandId::Pos => {
            if let Some(first) = positionals.first() {
                args.entry("call".into()).or_insert_with(|| (*first).to_string());
            }
        }
        CommandId::Stats => {
            if let Some(first) = positionals.first() {
                if first.parse::<i64>().is_ok() {
                    args.entry("hours".into()).or_insert_with(|| (*first).to_string());
                }
            }
        }
        CommandId::Mheard => {
            if let Some(first) = positionals.first() {
                if first.parse::<i64>().is_ok() {
                    args.entry("limit".into()).or_insert_with(|| (*first).to_string());
                } else if matches!(first.to_ascii_lowercase().as_str(), "msg" | "pos" | "all") {
                    args.entry("type".into())
                        .or_insert_with(|| first.to_ascii_lowercase());
                }
            }
        }
        CommandId::Group => {
            if let Some(first) = positionals.first() {
                args.entry("state".into()).or_insert_with(|| (*first).to_string());
            }
        }
        CommandId::Topic => parse_topic_args(&rest, &mut args),
        CommandId::KickBan => parse_kb_args(&positionals, &mut args),
        CommandId::CtcPing => {
            // ctcping takes key:value only (call, payload, repeat); the
            // TARGET: key is consumed by the routing layer.
            if let Some(call) = args.get("call").cloned() {
                args.insert("call".into(), call.to_ascii_uppercase());
            }
        }
        _ => {}
    }

    Some(ParsedCommand { id, args })
}

/// `!topic` grammar: bare (list), `delete GROUP`, or
/// `GROUP TEXT... [interval:N | trailing integer]`.
fn parse_topic_args(rest: &[&str], args: &mut HashMap<String, String>) {
    if rest.is_empty() {
        return;
    }
    if rest[0].eq_ignore_ascii_case("delete") {
        args.insert("action".into(), "delete".into());
        if let Some(group) = rest.get(1) {
            args.insert("group".into(), group.to_ascii_uppercase());
        }
        return;
    }

    args.insert("group".into(), rest[0].to_ascii_uppercase());
    let mut text_parts: Vec<&str> = Vec::new();
    for part in &rest[1..] {
        if part.to_ascii_lowercase().starts_with("interval:") {
            break;
        }
        text_parts.push(part);
    }

    // A bare trailing integer doubles as the interval.
    if !args.contains_key("interval") {
        if let Some(last) = text_parts.last() {
            if last.parse::<u32>().is_ok() && text_parts.len() > 1 {
                args.insert("interval".into(), (*last).to_string());
                text_parts.pop();
            }
        }
    }

    if !text_parts.is_empty() {
        args.insert("text".into(), text_parts.join(" "));
    }
}

/// `!kb` grammar: bare (list), `LIST`, `DELALL`, `CALL [DEL]`.
fn parse_kb_args(positionals: &[&str], args: &mut HashMap<String, String>) {
    let Some(first) = positionals.first() else {
        return;
    };
    let upper = first.to_ascii_uppercase();
    if upper == "LIST" || upper == "DELALL" {
        args.insert("callsign".into(), upper.to_ascii_lowercase());
        return;
    }
    args.insert("callsign".into(), upper);
    if positionals
        .get(1)
        .is_some_and(|second| second.eq_ignore_ascii_case("del"))
    {
        args.insert("action".into(), "del".into());
    }
}
