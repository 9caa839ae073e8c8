//! Command parsing and the command registry.
//!
//! Parsing is purely structural: each command carries its raw argument
//! string and the handler decides what a usable argument looks like, so a
//! typo gets a usage reply instead of being dropped.

use crate::store::user::UserRole;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Help,
    Contact,
    Chat,
    EndChat,
    Profile,
    MyInfo,
    SetBio(String),
    SetLocation(String),
    Language(String),
    Feedback(String),
    RemindMe(String),
    UserInfo(String),
    Users,
    Stats,
    Promote(String),
    Demote(String),
    Export,
    Unknown(String),
}

impl Command {
    /// Parse a leading-slash command. Returns `None` for plain text.
    ///
    /// A `@botname` suffix on the command (the group-chat form) is stripped.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        if rest.is_empty() {
            return Some(Command::Unknown(String::new()));
        }

        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        let args = args.to_string();

        Some(match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "contact" => Command::Contact,
            "chat" => Command::Chat,
            "endchat" => Command::EndChat,
            "profile" => Command::Profile,
            "myinfo" => Command::MyInfo,
            "setbio" => Command::SetBio(args),
            "setlocation" => Command::SetLocation(args),
            "language" => Command::Language(args),
            "feedback" => Command::Feedback(args),
            "remindme" => Command::RemindMe(args),
            "userinfo" => Command::UserInfo(args),
            "users" => Command::Users,
            "stats" => Command::Stats,
            "promote" => Command::Promote(args),
            "demote" => Command::Demote(args),
            "export" => Command::Export,
            _ => Command::Unknown(name),
        })
    }

    /// Minimum role required to invoke this command.
    pub fn required_role(&self) -> UserRole {
        match self {
            Command::Users
            | Command::Stats
            | Command::Promote(_)
            | Command::Demote(_)
            | Command::Export => UserRole::Admin,
            Command::UserInfo(_) => UserRole::Moderator,
            _ => UserRole::User,
        }
    }
}

/// Parse `/promote` arguments: `<user_id> [role]`, defaulting to moderator.
pub fn parse_promote_args(args: &str) -> Result<(i64, UserRole), String> {
    let mut parts = args.split_whitespace();
    let target: i64 = parts
        .next()
        .ok_or("missing user id")?
        .parse()
        .map_err(|_| "user id must be numeric".to_string())?;
    let role = match parts.next() {
        None => UserRole::Moderator,
        Some(name) => UserRole::parse(name).ok_or(format!("unknown role '{}'", name))?,
    };
    Ok((target, role))
}

/// Parse a single numeric user-id argument (`/demote`, `/userinfo`).
pub fn parse_user_id_arg(args: &str) -> Result<i64, String> {
    args.split_whitespace()
        .next()
        .ok_or("missing user id")?
        .parse()
        .map_err(|_| "user id must be numeric".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text_is_not_a_command() {
        assert_eq!(Command::parse("hello there"), None);
        assert_eq!(Command::parse("  just chatting"), None);
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/help"), Some(Command::Help));
        assert_eq!(Command::parse("/endchat"), Some(Command::EndChat));
        assert_eq!(Command::parse(" /chat "), Some(Command::Chat));
    }

    #[test]
    fn test_parse_strips_bot_mention() {
        assert_eq!(Command::parse("/help@my_bot"), Some(Command::Help));
        assert_eq!(
            Command::parse("/promote@my_bot 42 admin"),
            Some(Command::Promote("42 admin".to_string()))
        );
    }

    #[test]
    fn test_parse_args_are_preserved() {
        assert_eq!(
            Command::parse("/remindme in 5 minutes call mom"),
            Some(Command::RemindMe("in 5 minutes call mom".to_string()))
        );
        assert_eq!(
            Command::parse("/setbio I write Rust"),
            Some(Command::SetBio("I write Rust".to_string()))
        );
        assert_eq!(Command::parse("/language es"), Some(Command::Language("es".to_string())));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            Command::parse("/frobnicate now"),
            Some(Command::Unknown("frobnicate".to_string()))
        );
    }

    #[test]
    fn test_required_roles() {
        assert_eq!(Command::Start.required_role(), UserRole::User);
        assert_eq!(Command::UserInfo(String::new()).required_role(), UserRole::Moderator);
        assert_eq!(Command::Users.required_role(), UserRole::Admin);
        assert_eq!(Command::Promote(String::new()).required_role(), UserRole::Admin);
        assert_eq!(Command::Export.required_role(), UserRole::Admin);
    }

    #[test]
    fn test_promote_args() {
        assert_eq!(parse_promote_args("42 admin"), Ok((42, UserRole::Admin)));
        assert_eq!(parse_promote_args("42 moderator"), Ok((42, UserRole::Moderator)));
        assert_eq!(parse_promote_args("42"), Ok((42, UserRole::Moderator)));
        assert!(parse_promote_args("").is_err());
        assert!(parse_promote_args("alice admin").is_err());
        assert!(parse_promote_args("42 overlord").is_err());
    }

    #[test]
    fn test_user_id_arg() {
        assert_eq!(parse_user_id_arg("42"), Ok(42));
        assert!(parse_user_id_arg("").is_err());
        assert!(parse_user_id_arg("bob").is_err());
    }
}
