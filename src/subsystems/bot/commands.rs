//! Chat command parsing.
//!
//! A command is `<prefix> <verb> [args…]`, e.g. `!koe Run`.  Verbs match
//! case-insensitively; anything after the verb is ignored.

/// Verbs listed in help and unknown-command replies.
pub const AVAILABLE: &str = "Run, Stop, NO, Learn, Status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// Load the model and start replying in this channel.
    Run,
    /// Stop replying everywhere.
    Stop,
    /// Stop replying in this channel only.
    No,
    /// Fine-tune on the full history and reload.
    Learn,
    Status,
    /// Prefix present but the verb is missing or unknown.
    Unknown(String),
}

/// Parse `content` as a command.  `None` if it does not start with `prefix`.
pub fn parse(content: &str, prefix: &str) -> Option<BotCommand> {
    let mut words = content.split_whitespace();
    if words.next()? != prefix {
        return None;
    }
    let verb = words.next().unwrap_or_default();
    Some(match verb.to_ascii_lowercase().as_str() {
        "run" => BotCommand::Run,
        "stop" => BotCommand::Stop,
        "no" => BotCommand::No,
        "learn" => BotCommand::Learn,
        "status" => BotCommand::Status,
        _ => BotCommand::Unknown(verb.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognised_verbs() {
        assert_eq!(parse("!koe Run", "!koe"), Some(BotCommand::Run));
        assert_eq!(parse("  !koe   stop  ", "!koe"), Some(BotCommand::Stop));
        assert_eq!(parse("!koe NO", "!koe"), Some(BotCommand::No));
        assert_eq!(parse("!koe Learn now", "!koe"), Some(BotCommand::Learn));
        assert_eq!(parse("!koe STATUS", "!koe"), Some(BotCommand::Status));
    }

    #[test]
    fn unknown_or_missing_verb() {
        assert_eq!(parse("!koe dance", "!koe"), Some(BotCommand::Unknown("dance".into())));
        assert_eq!(parse("!koe", "!koe"), Some(BotCommand::Unknown(String::new())));
    }

    #[test]
    fn ordinary_messages_are_not_commands() {
        assert_eq!(parse("hello there", "!koe"), None);
        assert_eq!(parse("!koeRun", "!koe"), None);
        assert_eq!(parse("say !koe Run", "!koe"), None);
        assert_eq!(parse("", "!koe"), None);
    }
}
