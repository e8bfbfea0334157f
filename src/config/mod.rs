// src/config/mod.rs - Bot configuration with validation and hot-reload

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, Duration};

use crate::types::{AllowPattern, ChatId, ContentFlag, EntityKind, UserId};

const BOT_CONFIG_FILE: &str = "bot.yaml";
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Manages `bot.yaml` inside a configuration directory
#[derive(Clone)]
pub struct ConfigurationManager {
    config_dir: PathBuf,
    bot_config: Arc<RwLock<BotConfiguration>>,

    /// File watchers for hot-reloading
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,

    /// Event broadcaster for configuration changes
    change_notifier: broadcast::Sender<ConfigChangeEvent>,

    validator: Arc<ConfigValidator>,
}

/// Events broadcasted when configuration changes
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    BotConfigUpdated { file: String },
    ValidationError { file: String, error: String },
    ReloadComplete { files_updated: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfiguration {
    pub version: String,
    /// The bot's own account; never a warn target
    pub bot_user_id: UserId,
    /// Accepted as `/warn@<bot_username>`
    #[serde(default)]
    pub bot_username: Option<String>,
    /// The moderated chat. Events from other chats are ignored when set.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub rules: RuleConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub notices: NoticeConfig,
}

/// Trust gate and content rules for new members
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub forbidden_entities: Vec<EntityKind>,
    pub forbidden_content: Vec<ContentFlag>,
    /// Patterns exempting an otherwise forbidden entity, per entity kind
    pub allow_list: BTreeMap<EntityKind, Vec<String>>,
    pub min_message_count: u64,
    pub min_time_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Distinct warn votes that trigger a restriction
    pub warn_threshold: u32,
    /// Restriction level -> duration in seconds
    pub ladder: BTreeMap<u32, u64>,
}

/// Notice templates. `$(user)` expands to `mention_template`, which may use
/// `$(name)` and `$(id)`; restriction notices also get `$(duration)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoticeConfig {
    pub mention_template: String,
    pub deletion_notice: String,
    pub restriction_notice: String,
    pub restoration_notice: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid allow-list pattern '{pattern}' for {kind:?}: {reason}")]
    InvalidPattern { kind: EntityKind, pattern: String, reason: String },

    #[error("restriction ladder is empty")]
    EmptyLadder,

    #[error("restriction ladder level {level} is invalid (levels start at 1, durations must be positive)")]
    InvalidLadderEntry { level: u32 },

    #[error("warn threshold must be at least 1")]
    InvalidThreshold,

    #[error("minimum trust values must not be negative")]
    NegativeTrustWindow,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const DAY: u64 = 60 * 60 * 24;

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            forbidden_entities: vec![
                EntityKind::Mention,
                EntityKind::Url,
                EntityKind::TextLink,
                EntityKind::TextMention,
            ],
            forbidden_content: vec![ContentFlag::Photo],
            allow_list: BTreeMap::new(),
            min_message_count: 5,
            min_time_seconds: DAY as i64,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 3,
            ladder: BTreeMap::from([
                (1, DAY),
                (2, 7 * DAY),
                (3, 30 * DAY),
                (4, 365 * DAY),
                (5, 3653 * DAY),
            ]),
        }
    }
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            mention_template: "[$(name)](tg://user?id=$(id))".to_string(),
            deletion_notice: "$(user), your message was removed. Spend some more time chatting here before posting links, mentions or photos.".to_string(),
            restriction_notice: "$(user) has been restricted for $(duration) after community warnings.".to_string(),
            restoration_notice: "$(user) can write again: the community lifted the restrictions.".to_string(),
        }
    }
}

impl Default for BotConfiguration {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            bot_user_id: 0,
            bot_username: None,
            chat_id: None,
            data_dir: default_data_dir(),
            rules: RuleConfig::default(),
            escalation: EscalationConfig::default(),
            notices: NoticeConfig::default(),
        }
    }
}

impl BotConfiguration {
    /// Override identity values from `CHATWARDEN_BOT_USER_ID`, `CHATWARDEN_BOT_USERNAME`,
    /// `CHATWARDEN_CHAT_ID` and `CHATWARDEN_DATA_DIR`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("CHATWARDEN_BOT_USER_ID") {
            self.bot_user_id = value.trim().parse()
                .context("CHATWARDEN_BOT_USER_ID must be an integer")?;
        }
        if let Ok(value) = env::var("CHATWARDEN_BOT_USERNAME") {
            self.bot_username = Some(value.trim().trim_start_matches('@').to_string());
        }
        if let Ok(value) = env::var("CHATWARDEN_CHAT_ID") {
            self.chat_id = Some(value.trim().parse()
                .context("CHATWARDEN_CHAT_ID must be an integer")?);
        }
        if let Ok(value) = env::var("CHATWARDEN_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        Ok(())
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_bot_config(&self, config: &BotConfiguration) -> Result<(), ConfigError> {
        self.validate_rules(&config.rules)?;
        self.validate_escalation(&config.escalation)
    }

    fn validate_rules(&self, rules: &RuleConfig) -> Result<(), ConfigError> {
        if rules.min_time_seconds < 0 {
            return Err(ConfigError::NegativeTrustWindow);
        }
        for (kind, patterns) in &rules.allow_list {
            for pattern in patterns {
                AllowPattern::parse(pattern).map_err(|reason| ConfigError::InvalidPattern {
                    kind: *kind,
                    pattern: pattern.clone(),
                    reason,
                })?;
            }
        }
        Ok(())
    }

    fn validate_escalation(&self, escalation: &EscalationConfig) -> Result<(), ConfigError> {
        if escalation.warn_threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        if escalation.ladder.is_empty() {
            return Err(ConfigError::EmptyLadder);
        }
        for (level, seconds) in &escalation.ladder {
            if *level == 0 || *seconds == 0 {
                return Err(ConfigError::InvalidLadderEntry { level: *level });
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationManager {
    /// Create a new configuration manager
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        let (tx, _) = broadcast::channel(100);

        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            bot_config: Arc::new(RwLock::new(BotConfiguration::default())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            change_notifier: tx,
            validator: Arc::new(ConfigValidator::new()),
        }
    }

    /// Load (or create) the configuration without watching for changes
    pub async fn load(&self) -> Result<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).await?;
            info!("Created configuration directory: {}", self.config_dir.display());
        }

        let file = match self.load_bot_config().await {
            Ok(()) => BOT_CONFIG_FILE.to_string(),
            Err(e) if !self.config_dir.join(BOT_CONFIG_FILE).exists() => {
                warn!("Failed to load bot config, using defaults: {}", e);
                self.create_default_bot_config().await?;
                format!("{} (created default)", BOT_CONFIG_FILE)
            }
            // A present but broken file must not be silently replaced
            Err(e) => return Err(e),
        };

        let _ = self.change_notifier.send(ConfigChangeEvent::ReloadComplete { files_updated: vec![file] });
        Ok(())
    }

    /// Load configuration and start hot-reloading
    pub async fn initialize(&self) -> Result<()> {
        self.load().await?;
        self.setup_file_watchers().await?;
        info!("Configuration manager initialized successfully");
        Ok(())
    }

    async fn load_bot_config(&self) -> Result<()> {
        let config_path = self.config_dir.join(BOT_CONFIG_FILE);
        if !config_path.exists() {
            return Err(anyhow::anyhow!("Bot config file not found"));
        }

        let content = fs::read_to_string(&config_path).await?;
        let config: BotConfiguration = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        self.validator.validate_bot_config(&config)?;

        *self.bot_config.write().await = config;
        debug!("Loaded bot configuration from {}", config_path.display());
        Ok(())
    }

    async fn create_default_bot_config(&self) -> Result<()> {
        let config = BotConfiguration::default();
        let config_path = self.config_dir.join(BOT_CONFIG_FILE);
        let content = serde_yaml::to_string(&config)?;
        fs::write(&config_path, content).await?;

        *self.bot_config.write().await = config;
        info!("Created default bot configuration: {}", config_path.display());
        Ok(())
    }

    /// Setup file watchers for hot-reloading
    async fn setup_file_watchers(&self) -> Result<()> {
        let config_dir = self.config_dir.clone();
        let change_notifier = self.change_notifier.clone();
        let bot_config = self.bot_config.clone();
        let validator = self.validator.clone();
        let config_path = self.config_dir.join(BOT_CONFIG_FILE);

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watch event: {}", e);
                }
            }
        })?;

        watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;

        // Store watcher to prevent it from being dropped
        self.watchers.write().await.push(watcher);

        tokio::spawn(async move {
            // Changes are coalesced: every relevant event restarts the quiet
            // period and the file is read once after it elapses.
            let mut pending = false;
            loop {
                let event = if pending {
                    tokio::select! {
                        event = rx.recv() => event,
                        _ = sleep(RELOAD_DEBOUNCE) => {
                            pending = false;
                            info!("Bot configuration file changed, reloading...");
                            let event = match Self::reload_bot_config(&config_path, &bot_config, &validator).await {
                                Ok(()) => ConfigChangeEvent::BotConfigUpdated {
                                    file: BOT_CONFIG_FILE.to_string(),
                                },
                                Err(e) => {
                                    error!("Failed to reload bot config: {}", e);
                                    ConfigChangeEvent::ValidationError {
                                        file: BOT_CONFIG_FILE.to_string(),
                                        error: e.to_string(),
                                    }
                                }
                            };
                            let _ = change_notifier.send(event);
                            continue;
                        }
                    }
                } else {
                    rx.recv().await
                };

                let Some(event) = event else {
                    break;
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(BOT_CONFIG_FILE));
                if touches_config {
                    pending = true;
                } else {
                    debug!("Ignoring change to non-config file: {:?}", event.paths);
                }
            }
            debug!("Configuration watcher stopped");
        });

        info!("File watchers setup for hot-reloading");
        Ok(())
    }

    /// Reload and validate; the cached configuration is kept on failure
    async fn reload_bot_config(
        path: &Path,
        bot_config: &Arc<RwLock<BotConfiguration>>,
        validator: &Arc<ConfigValidator>,
    ) -> Result<()> {
        let content = fs::read_to_string(path).await?;
        let config: BotConfiguration = serde_yaml::from_str(&content)?;

        validator.validate_bot_config(&config)?;

        *bot_config.write().await = config;
        debug!("Reloaded bot configuration from {}", path.display());
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get current bot configuration
    pub async fn get_bot_config(&self) -> BotConfiguration {
        self.bot_config.read().await.clone()
    }

    /// Subscribe to configuration change events
    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    /// Validate and write a new bot configuration
    pub async fn save_bot_config(&self, config: BotConfiguration) -> Result<()> {
        self.validator.validate_bot_config(&config)?;

        let config_path = self.config_dir.join(BOT_CONFIG_FILE);
        let content = serde_yaml::to_string(&config)?;
        fs::write(&config_path, content).await?;

        *self.bot_config.write().await = config;
        info!("Saved bot configuration to {}", config_path.display());
        Ok(())
    }
}
