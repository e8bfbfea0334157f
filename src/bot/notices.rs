use crate::config::NoticeConfig;
use crate::types::ChatUser;

/// Renders the user-visible notices from configured templates
#[derive(Debug, Clone)]
pub struct NoticeTemplates {
    config: NoticeConfig,
}

impl NoticeTemplates {
    pub fn new(config: NoticeConfig) -> Self {
        Self { config }
    }

    pub fn deletion(&self, user: &ChatUser) -> String {
        self.render(&self.config.deletion_notice, user)
    }

    pub fn restriction(&self, user: &ChatUser, duration_seconds: u64) -> String {
        self.render(&self.config.restriction_notice, user)
            .replace("$(duration)", &format_duration(duration_seconds))
    }

    pub fn restoration(&self, user: &ChatUser) -> String {
        self.render(&self.config.restoration_notice, user)
    }

    /// Markdown deep link addressing `user`
    pub fn mention(&self, user: &ChatUser) -> String {
        self.config
            .mention_template
            .replace("$(name)", &escape_markdown(user.display_name()))
            .replace("$(id)", &user.id.to_string())
    }

    fn render(&self, template: &str, user: &ChatUser) -> String {
        template.replace("$(user)", &self.mention(user))
    }
}

fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '[' | ']' | '(' | ')' | '_' | '*' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Human readable duration using the largest whole unit
pub fn format_duration(seconds: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(86_400, "day"), (3_600, "hour"), (60, "minute"), (1, "second")];

    for (size, name) in UNITS {
        if seconds >= size && seconds % size == 0 {
            let count = seconds / size;
            return if count == 1 {
                format!("1 {}", name)
            } else {
                format!("{} {}s", count, name)
            };
        }
    }
    format!("{} seconds", seconds)
}
