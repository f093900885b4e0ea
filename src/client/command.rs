use crate::messaging::message::{GroupKind, MAX_TEXT_LEN};

/// Problems with the user's input or with what the user asked for in the client's current
///  state. These are reported locally and never cause protocol traffic.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UserError {
    #[error("unknown command {0} - type /help for a list of commands")]
    UnknownCommand(String),
    #[error("group kind must be 0 (centralized) or 1 (decentralized)")]
    InvalidGroupKind,
    #[error("missing arguments: {0}")]
    MissingArguments(&'static str),
    #[error("not possible right now: {0}")]
    NotAllowed(&'static str),
    #[error("please answer the invitation with yes or no")]
    InvalidAnswer,
    #[error("message is too long")]
    MessageTooLong,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UserInput {
    Chat(String),
    CreateGroup { kind: GroupKind, usernames: Vec<String> },
    InviteGroup { usernames: Vec<String> },
    Disjoint,
    Exit,
    List,
    Help,
}

impl UserInput {
    pub fn parse(line: &str) -> Result<UserInput, UserError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.starts_with('/') {
            if line.len() > MAX_TEXT_LEN {
                return Err(UserError::MessageTooLong);
            }
            return Ok(UserInput::Chat(line.to_string()));
        }

        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let args = parts.map(|s| s.to_string()).collect::<Vec<_>>();

        match command {
            "/create_group" => {
                let Some((kind, usernames)) = args.split_first() else {
                    return Err(UserError::MissingArguments("/create_group <0|1> <usernames...>"));
                };
                let kind = match kind.as_str() {
                    "0" => GroupKind::Centralized,
                    "1" => GroupKind::Decentralized,
                    _ => return Err(UserError::InvalidGroupKind),
                };
                if usernames.is_empty() {
                    return Err(UserError::MissingArguments("/create_group <0|1> <usernames...>"));
                }
                Ok(UserInput::CreateGroup { kind, usernames: usernames.to_vec() })
            }
            "/invite_group" => {
                if args.is_empty() {
                    return Err(UserError::MissingArguments("/invite_group <usernames...>"));
                }
                Ok(UserInput::InviteGroup { usernames: args })
            }
            "/disjoint" => Ok(UserInput::Disjoint),
            "/exit" => Ok(UserInput::Exit),
            "/list" => Ok(UserInput::List),
            "/help" => Ok(UserInput::Help),
            other => Err(UserError::UnknownCommand(other.to_string())),
        }
    }
}

/// the answer to a pending invitation
pub fn parse_answer(line: &str) -> Result<bool, UserError> {
    match line.trim().to_lowercase().as_str() {
        "yes" | "y" => Ok(true),
        "no" | "n" => Ok(false),
        _ => Err(UserError::InvalidAnswer),
    }
}
