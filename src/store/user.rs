//! The per-user record schema.
//!
//! Records are stored as JSON and carry a `schema_version` so old files can
//! be upgraded on load. Deserialization is tolerant: unknown fields are
//! ignored and missing optional fields take their defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum conversation turns kept per user. Oldest turns are evicted first.
pub const MAX_HISTORY_TURNS: usize = 20;

/// Privilege tiers, ordered: `User < Moderator < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Moderator,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
        }
    }

    /// Parse a role name as typed in commands like `/promote 42 moderator`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Some(Self::User),
            "moderator" | "mod" => Some(Self::Moderator),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported interface languages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::En, Language::Es];

    pub fn code(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "en" => Some(Self::En),
            "es" => Some(Self::Es),
            _ => None,
        }
    }
}

/// Free-form profile fields, filled from the messaging platform on first
/// contact and editable by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub location: String,
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One turn of the AI conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub text: String,
}

/// Per-minute request counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCounter {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// A pending reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub fire_at: DateTime<Utc>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One record per distinct user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub role: UserRole,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub chat_mode: bool,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    pub counters: RateCounter,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub schema_version: u32,
}

impl UserRecord {
    pub fn new(id: i64, role: UserRole, language: Language, now: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            profile: Profile::default(),
            language,
            chat_mode: false,
            history: Vec::new(),
            counters: RateCounter { window_start: now, count: 0 },
            reminders: Vec::new(),
            message_count: 0,
            created_at: now,
            last_seen_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Append a conversation turn, evicting the oldest once the cap is hit.
    pub fn push_turn(&mut self, role: TurnRole, text: impl Into<String>) {
        self.history.push(HistoryTurn { role, text: text.into() });
        if self.history.len() > MAX_HISTORY_TURNS {
            let excess = self.history.len() - MAX_HISTORY_TURNS;
            self.history.drain(..excess);
        }
    }

    /// Upgrade a record loaded from an older schema to the current one.
    ///
    /// Missing fields already took serde defaults; this clamps anything an
    /// older build may have let grow past current limits and stamps the
    /// version.
    pub fn migrate(&mut self) {
        if self.schema_version >= SCHEMA_VERSION {
            return;
        }
        if self.history.len() > MAX_HISTORY_TURNS {
            let excess = self.history.len() - MAX_HISTORY_TURNS;
            self.history.drain(..excess);
        }
        self.schema_version = SCHEMA_VERSION;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(UserRole::User < UserRole::Moderator);
        assert!(UserRole::Moderator < UserRole::Admin);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(UserRole::parse("admin"), Some(UserRole::Admin));
        assert_eq!(UserRole::parse("Moderator"), Some(UserRole::Moderator));
        assert_eq!(UserRole::parse("mod"), Some(UserRole::Moderator));
        assert_eq!(UserRole::parse("root"), None);
    }

    #[test]
    fn test_role_serde_as_lowercase() {
        let json = serde_json::to_string(&UserRole::Admin).unwrap();
        assert_eq!(json, r#""admin""#);
        let role: UserRole = serde_json::from_str(r#""moderator""#).unwrap();
        assert_eq!(role, UserRole::Moderator);
    }

    #[test]
    fn test_language_codes() {
        assert_eq!(Language::from_code("EN"), Some(Language::En));
        assert_eq!(Language::from_code("es"), Some(Language::Es));
        assert_eq!(Language::from_code("fr"), None);
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let now = Utc::now();
        let mut record = UserRecord::new(1, UserRole::User, Language::En, now);

        for i in 0..MAX_HISTORY_TURNS + 5 {
            record.push_turn(TurnRole::User, format!("turn {}", i));
        }

        assert_eq!(record.history.len(), MAX_HISTORY_TURNS);
        assert_eq!(record.history[0].text, "turn 5");
        assert_eq!(record.history.last().unwrap().text, format!("turn {}", MAX_HISTORY_TURNS + 4));
    }

    #[test]
    fn test_record_round_trip() {
        let now = Utc::now();
        let mut record = UserRecord::new(42, UserRole::Moderator, Language::Es, now);
        record.push_turn(TurnRole::User, "hola");
        record.push_turn(TurnRole::Assistant, "hola!");
        record.reminders.push(Reminder {
            fire_at: now,
            text: "call mom".to_string(),
            created_at: now,
        });

        let json = serde_json::to_string(&record).unwrap();
        let back: UserRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, 42);
        assert_eq!(back.role, UserRole::Moderator);
        assert_eq!(back.language, Language::Es);
        assert_eq!(back.history.len(), 2);
        assert_eq!(back.reminders.len(), 1);
        assert_eq!(back.created_at, record.created_at);
    }

    #[test]
    fn test_tolerates_missing_optional_fields() {
        // A minimal record as an older build might have written it.
        let json = r#"{
            "id": 7,
            "role": "user",
            "counters": {"window_start": "2024-01-01T00:00:00Z", "count": 0},
            "created_at": "2024-01-01T00:00:00Z",
            "last_seen_at": "2024-01-01T00:00:00Z"
        }"#;

        let mut record: UserRecord = serde_json::from_str(json).unwrap();
        record.migrate();

        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert!(!record.chat_mode);
        assert!(record.history.is_empty());
        assert_eq!(record.language, Language::En);
    }
}
