use log::debug;

/// Moderation commands the gate understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationCommand {
    Warn,
    Unwarn,
}

/// Recognises `/warn` and `/unwarn`, optionally addressed as `/warn@botname`
#[derive(Debug, Clone)]
pub struct CommandParser {
    command_prefix: String,
    bot_username: Option<String>,
}

impl CommandParser {
    pub fn new(bot_username: Option<String>) -> Self {
        Self {
            command_prefix: "/".to_string(),
            bot_username: bot_username.map(|name| name.trim_start_matches('@').to_lowercase()),
        }
    }

    pub fn parse(&self, text: &str) -> Option<ModerationCommand> {
        let content_without_prefix = text.trim_start().strip_prefix(&self.command_prefix)?;
        let token = content_without_prefix.split_whitespace().next()?;

        let (name, addressee) = match token.split_once('@') {
            Some((name, addressee)) => (name, Some(addressee.to_lowercase())),
            None => (token, None),
        };

        if let (Some(addressee), Some(bot_username)) = (&addressee, &self.bot_username) {
            if addressee != bot_username {
                debug!("Ignoring command addressed to @{}", addressee);
                return None;
            }
        }

        match name.to_lowercase().as_str() {
            "warn" => Some(ModerationCommand::Warn),
            "unwarn" => Some(ModerationCommand::Unwarn),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_plain_commands() {
        let parser = CommandParser::new(None);
        assert_eq!(parser.parse("/warn"), Some(ModerationCommand::Warn));
        assert_eq!(parser.parse("  /UNWARN spam again"), Some(ModerationCommand::Unwarn));
        assert_eq!(parser.parse("/warning"), None);
        assert_eq!(parser.parse("warn"), None);
        assert_eq!(parser.parse("/"), None);
        assert_eq!(parser.parse(""), None);
    }

    #[test]
    fn test_addressed_commands() {
        let parser = CommandParser::new(Some("@WardenBot".to_string()));
        assert_eq!(parser.parse("/warn@wardenbot"), Some(ModerationCommand::Warn));
        assert_eq!(parser.parse("/unwarn@WARDENBOT"), Some(ModerationCommand::Unwarn));
        assert_eq!(parser.parse("/warn@otherbot"), None);

        let anonymous = CommandParser::new(None);
        assert_eq!(anonymous.parse("/warn@anybot"), Some(ModerationCommand::Warn));
    }
}
