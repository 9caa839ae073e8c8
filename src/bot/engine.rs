//! Dispatch engine: identity lookup, permission and quota checks, command
//! handlers, and the error-to-reply boundary.
//!
//! Handlers never touch the transport. They take the store and an inbound
//! event and return a [`Reply`], so every path here is testable without a
//! live connection. Permission is checked before the rate limit: a refusal
//! does not consume quota.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::ai::{self, CompletionClient};
use crate::bot::commands::{self, Command};
use crate::bot::event::InboundMessage;
use crate::bot::timeparse;
use crate::config::Config;
use crate::store::user::{Language, TurnRole, UserRecord, UserRole};
use crate::store::{NewUser, StoreError, UserStore};

/// Longest accepted bio and location, in characters.
const MAX_BIO_LEN: usize = 500;
const MAX_LOCATION_LEN: usize = 100;

/// A file attached to an outbound reply.
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What a handler wants sent back.
pub struct Reply {
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), attachment: None }
    }
}

/// Failures recovered at the dispatch boundary.
#[derive(Debug)]
enum HandlerError {
    Store(StoreError),
    RateLimited,
    Upstream(ai::Error),
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store: {e}"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Upstream(e) => write!(f, "upstream: {e}"),
        }
    }
}

impl HandlerError {
    /// The user-visible notice for this failure. Permission refusals stay
    /// generic on purpose; they don't explain what would have been allowed.
    fn user_text(&self, lang: Language) -> String {
        match (self, lang) {
            (Self::Store(StoreError::PermissionDenied), Language::En) => {
                "🔒 You don't have permission to use this command.".to_string()
            }
            (Self::Store(StoreError::PermissionDenied), Language::Es) => {
                "🔒 No tienes permiso para usar este comando.".to_string()
            }
            (Self::Store(StoreError::NotFound(_)), Language::En) => "User not found.".to_string(),
            (Self::Store(StoreError::NotFound(_)), Language::Es) => {
                "Usuario no encontrado.".to_string()
            }
            (Self::RateLimited, Language::En) => {
                "⚠️ You're sending requests too fast. Please try again later.".to_string()
            }
            (Self::RateLimited, Language::Es) => {
                "⚠️ Estás enviando solicitudes demasiado rápido. Inténtalo más tarde.".to_string()
            }
            (_, Language::En) => "⚠️ Something went wrong. Please try again later.".to_string(),
            (_, Language::Es) => "⚠️ Algo salió mal. Inténtalo de nuevo más tarde.".to_string(),
        }
    }
}

/// The dispatch engine. Owns the store and the AI collaborator; the
/// transport stays outside.
pub struct Engine {
    config: Config,
    store: Arc<UserStore>,
    ai: Option<CompletionClient>,
}

impl Engine {
    pub fn new(config: Config, store: Arc<UserStore>, ai: Option<CompletionClient>) -> Self {
        Self { config, store, ai }
    }

    /// Handle one inbound message and produce the reply to send.
    ///
    /// Never fails: every error is converted to a user-visible notice here
    /// so one bad handler run cannot take the event loop down.
    pub async fn dispatch(&self, msg: &InboundMessage) -> Reply {
        let seed = NewUser {
            role: self.config.initial_role(msg.user_id),
            language: self.config.default_language,
            display_name: msg.display_name.clone(),
            username: msg.username.clone(),
        };

        let record = match self.store.get_or_create(msg.user_id, &seed).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load record for user {}: {}", msg.user_id, e);
                return Reply::text(
                    HandlerError::Store(e).user_text(self.config.default_language),
                );
            }
        };
        let lang = record.language;

        match self.handle(msg, record).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Handler failed for user {}: {}", msg.user_id, e);
                Reply::text(e.user_text(lang))
            }
        }
    }

    async fn handle(
        &self,
        msg: &InboundMessage,
        record: UserRecord,
    ) -> Result<Reply, HandlerError> {
        let record = self
            .store
            .update(record.id, |r| {
                r.last_seen_at = msg.timestamp;
                r.message_count += 1;
                if r.profile.display_name.is_empty() {
                    r.profile.display_name = msg.display_name.clone();
                }
                if msg.username.is_some() && r.profile.username != msg.username {
                    r.profile.username = msg.username.clone();
                }
            })
            .await?;

        let limit = self.config.rate_limits.for_role(record.role);

        match Command::parse(&msg.text) {
            Some(command) => {
                if record.role < command.required_role() {
                    return Err(StoreError::PermissionDenied.into());
                }
                if !self.store.check_and_increment_rate(record.id, limit).await? {
                    return Err(HandlerError::RateLimited);
                }
                info!("Command from {} ({}): {:?}", msg.display_name, msg.user_id, command);
                self.handle_command(command, &record).await
            }
            None => {
                if !self.store.check_and_increment_rate(record.id, limit).await? {
                    return Err(HandlerError::RateLimited);
                }
                if record.chat_mode {
                    self.chat_turn(&record, msg).await
                } else {
                    Ok(Reply::text(
                        "🤖 I'm not in chat mode. Type /chat to start a conversation,\n\
                         or /help to see what else I can do.",
                    ))
                }
            }
        }
    }

    async fn handle_command(
        &self,
        command: Command,
        record: &UserRecord,
    ) -> Result<Reply, HandlerError> {
        match command {
            Command::Start => Ok(Reply::text(format!(
                "👋 Hello {}! I'm your friendly AI bot.\n\n\
                 • /help shows available commands\n\
                 • /chat starts AI chat mode\n\
                 • /contact gets you in touch",
                record.profile.display_name
            ))),

            Command::Help => Ok(Reply::text(help_text(record.role))),

            Command::Contact => Ok(Reply::text(
                "📧 Contact\n\nFor support or questions, message the bot administrators.",
            )),

            Command::Chat => {
                if self.ai.is_none() {
                    return Ok(Reply::text(
                        "⚠️ AI features are currently disabled. Please contact the bot administrator.",
                    ));
                }
                self.store.update(record.id, |r| r.chat_mode = true).await?;
                Ok(Reply::text(
                    "💬 AI chat mode activated. Send any message and I'll respond.\n\
                     Type /endchat to exit.",
                ))
            }

            Command::EndChat => {
                self.store.update(record.id, |r| r.chat_mode = false).await?;
                Ok(Reply::text("👋 AI chat mode deactivated. Type /chat to start again."))
            }

            Command::Profile | Command::MyInfo => Ok(Reply::text(format_record(record))),

            Command::SetBio(bio) => {
                if bio.is_empty() {
                    return Ok(Reply::text("Usage: /setbio <text>"));
                }
                if bio.chars().count() > MAX_BIO_LEN {
                    return Ok(Reply::text(format!(
                        "❌ Bio is too long (max {} characters).",
                        MAX_BIO_LEN
                    )));
                }
                self.store.update(record.id, |r| r.profile.bio = bio).await?;
                Ok(Reply::text("✅ Bio updated."))
            }

            Command::SetLocation(location) => {
                if location.is_empty() {
                    return Ok(Reply::text("Usage: /setlocation <city, country>"));
                }
                if location.chars().count() > MAX_LOCATION_LEN {
                    return Ok(Reply::text(format!(
                        "❌ Location is too long (max {} characters).",
                        MAX_LOCATION_LEN
                    )));
                }
                self.store
                    .update(record.id, |r| r.profile.location = location)
                    .await?;
                Ok(Reply::text("📍 Location updated."))
            }

            Command::Language(code) => {
                if code.is_empty() {
                    return Ok(Reply::text(format!(
                        "🌐 Current language: {}\nSupported: {}\nUsage: /language <code>",
                        record.language.code(),
                        Language::ALL.map(|l| l.code()).join(", ")
                    )));
                }
                match Language::from_code(&code) {
                    Some(language) => {
                        self.store.update(record.id, |r| r.language = language).await?;
                        Ok(Reply::text(format!("✅ Language set to {}.", language.code())))
                    }
                    None => Ok(Reply::text(format!(
                        "❌ Unsupported language '{}'. Supported: {}",
                        code,
                        Language::ALL.map(|l| l.code()).join(", ")
                    ))),
                }
            }

            Command::Feedback(text) => {
                if text.is_empty() {
                    return Ok(Reply::text("Usage: /feedback <your message>"));
                }
                self.append_feedback(record, &text)?;
                Ok(Reply::text("🙏 Thank you for your feedback!"))
            }

            Command::RemindMe(args) => {
                if args.is_empty() {
                    return Ok(Reply::text(
                        "⏰ Set a reminder\n\nUsage: /remindme <when> <message>\n\n\
                         Examples:\n\
                         • /remindme in 30 minutes take the pizza out\n\
                         • /remindme at 14:30 team meeting\n\
                         • /remindme +2h stretch",
                    ));
                }
                let now = Utc::now();
                let (fire_at, text) = match timeparse::parse_reminder(&args, now) {
                    Ok(parsed) => parsed,
                    Err(e) => return Ok(Reply::text(format!("❌ {}", e))),
                };
                if fire_at <= now {
                    return Ok(Reply::text("❌ Please specify a future time."));
                }
                self.store.append_reminder(record.id, fire_at, text.clone()).await?;
                Ok(Reply::text(format!(
                    "⏰ I'll remind you at {}:\n{}",
                    fire_at.format("%Y-%m-%d %H:%M UTC"),
                    text
                )))
            }

            Command::UserInfo(args) => {
                let target = match commands::parse_user_id_arg(&args) {
                    Ok(id) => id,
                    Err(e) => return Ok(Reply::text(format!("Usage: /userinfo <user_id> ({})", e))),
                };
                let target_record = self
                    .store
                    .get(target)
                    .ok_or(StoreError::NotFound(target))?;
                Ok(Reply::text(format_record(&target_record)))
            }

            Command::Users => {
                let counts = self.store.count_by_role();
                let mut all = self.store.list_all();
                all.sort_by(|a, b| b.created_at.cmp(&a.created_at));

                let mut text = format!(
                    "👥 Users\n\n\
                     • Total: {}\n• Admins: {}\n• Moderators: {}\n• Regular: {}\n\n\
                     🕐 Most recent:\n",
                    counts.users + counts.moderators + counts.admins,
                    counts.admins,
                    counts.moderators,
                    counts.users,
                );
                for record in all.iter().take(10) {
                    text.push_str(&format!(
                        "• {} - {} (id {}) - {}\n",
                        record.created_at.format("%Y-%m-%d"),
                        record.profile.username.as_deref().unwrap_or("n/a"),
                        record.id,
                        record.role,
                    ));
                }
                Ok(Reply::text(text))
            }

            Command::Stats => {
                let summary = self.store.activity_summary(Utc::now());
                Ok(Reply::text(format!(
                    "📊 Daily statistics\n\n\
                     • Total users: {}\n\
                     • New today: {}\n\
                     • Active today: {}\n\
                     • Messages total: {}",
                    summary.total_users,
                    summary.new_today,
                    summary.active_today,
                    summary.messages_total,
                )))
            }

            Command::Promote(args) => {
                let (target, role) = match commands::parse_promote_args(&args) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        return Ok(Reply::text(format!(
                            "Usage: /promote <user_id> [moderator|admin] ({})",
                            e
                        )));
                    }
                };
                let updated = self.store.set_role(record.id, target, role).await?;
                Ok(Reply::text(format!("✅ User {} is now {}.", updated.id, updated.role)))
            }

            Command::Demote(args) => {
                let target = match commands::parse_user_id_arg(&args) {
                    Ok(id) => id,
                    Err(e) => return Ok(Reply::text(format!("Usage: /demote <user_id> ({})", e))),
                };
                let updated = self.store.set_role(record.id, target, UserRole::User).await?;
                Ok(Reply::text(format!("✅ User {} is now {}.", updated.id, updated.role)))
            }

            Command::Export => {
                let all = self.store.list_all();
                let bytes = serde_json::to_vec_pretty(&all)
                    .map_err(|e| HandlerError::Store(StoreError::Serialize(e)))?;
                let count = all.len();
                Ok(Reply {
                    text: format!("📦 Exported {} user record(s).", count),
                    attachment: Some(Attachment {
                        filename: "users_export.json".to_string(),
                        bytes,
                    }),
                })
            }

            Command::Unknown(name) => Ok(Reply::text(format!(
                "❓ Unknown command '/{}'. Use /help to see what I can do.",
                name
            ))),
        }
    }

    /// One AI conversation turn. History is only appended after a successful
    /// completion, so an upstream failure leaves the record unchanged apart
    /// from the counter already incremented.
    async fn chat_turn(
        &self,
        record: &UserRecord,
        msg: &InboundMessage,
    ) -> Result<Reply, HandlerError> {
        let Some(ai) = &self.ai else {
            return Ok(Reply::text(
                "⚠️ AI features are currently disabled. Type /endchat to leave chat mode.",
            ));
        };

        let system = system_prompt(record);
        let completion = ai
            .complete(&system, &record.history, &msg.text)
            .await
            .map_err(HandlerError::Upstream)?;

        let user_text = msg.text.clone();
        let assistant_text = completion.clone();
        self.store
            .update(record.id, |r| {
                r.push_turn(TurnRole::User, user_text);
                r.push_turn(TurnRole::Assistant, assistant_text);
            })
            .await?;

        Ok(Reply::text(completion))
    }

    /// Append one entry to the feedback file (same atomic-replace discipline
    /// as the store).
    fn append_feedback(&self, record: &UserRecord, text: &str) -> Result<(), HandlerError> {
        let path = self.config.data_dir.join("feedback.json");

        let mut entries: Vec<serde_json::Value> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Io { path: path.clone(), source: e })?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            Vec::new()
        };

        entries.push(json!({
            "user_id": record.id,
            "username": record.profile.username,
            "text": text,
            "timestamp": Utc::now(),
        }));

        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| HandlerError::Store(StoreError::Serialize(e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| StoreError::Io { path: tmp.clone(), source: e })?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| StoreError::Io { path: path.clone(), source: e })?;
        Ok(())
    }
}

fn help_text(role: UserRole) -> String {
    let mut text = String::from(
        "🤖 Available commands:\n\n\
         • /start - Welcome message\n\
         • /help - This message\n\
         • /profile - View your profile\n\
         • /setbio - Set your bio\n\
         • /setlocation - Set your location\n\
         • /language - Change language\n\
         • /chat - Start AI chat mode\n\
         • /endchat - Exit AI chat mode\n\
         • /remindme - Set a reminder\n\
         • /feedback - Send us feedback\n\
         • /myinfo - Show your information\n\
         • /contact - Contact information\n",
    );

    if role >= UserRole::Moderator {
        text.push_str("\n🔧 Moderator commands:\n• /userinfo - Look up a user\n");
    }
    if role >= UserRole::Admin {
        text.push_str(
            "\n👑 Admin commands:\n\
             • /users - User statistics\n\
             • /stats - Activity summary\n\
             • /promote - Promote a user\n\
             • /demote - Demote a user\n\
             • /export - Export user data\n",
        );
    }
    text
}

fn format_record(record: &UserRecord) -> String {
    let username = record
        .profile
        .username
        .as_deref()
        .map(|u| format!(" (@{})", u))
        .unwrap_or_default();

    format!(
        "👤 {}{}\n\n\
         🆔 User ID: {}\n\
         🎖 Role: {}\n\
         🌐 Language: {}\n\
         📝 Bio: {}\n\
         📍 Location: {}\n\
         📊 Messages: {}\n\
         📅 Member since: {}\n\
         📱 Last seen: {}",
        record.profile.display_name,
        username,
        record.id,
        record.role,
        record.language.code(),
        if record.profile.bio.is_empty() { "not set" } else { &record.profile.bio },
        if record.profile.location.is_empty() { "not set" } else { &record.profile.location },
        record.message_count,
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.last_seen_at.format("%Y-%m-%d %H:%M"),
    )
}

/// System prompt for the AI collaborator, personalized from the profile.
fn system_prompt(record: &UserRecord) -> String {
    let mut prompt = String::from(
        "You are a helpful AI assistant in a Telegram bot. \
         Be concise, friendly, and helpful in your responses.",
    );
    if !record.profile.display_name.is_empty() {
        prompt.push_str(&format!(" You are chatting with {}.", record.profile.display_name));
    }
    if !record.profile.bio.is_empty() {
        prompt.push_str(&format!(" About them: {}.", record.profile.bio));
    }
    if !record.profile.location.is_empty() {
        prompt.push_str(&format!(" They are from {}.", record.profile.location));
    }
    prompt
}
