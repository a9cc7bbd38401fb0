//! Command vocabulary carried in `Command` frames.
//!
//! Commands are ASCII, case-insensitive and space-separated. Parsing produces
//! a typed [`Command`] so nothing downstream inspects raw text.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Whether a client shows up in `LIST_CLIENTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    /// Single-character flag sent in the registration frame.
    pub fn as_flag(self) -> &'static str {
        match self {
            Visibility::Private => "0",
            Visibility::Public => "1",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag.trim() {
            "0" => Some(Visibility::Private),
            "1" => Some(Visibility::Public),
            _ => None,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Private => f.write_str("private"),
            Visibility::Public => f.write_str("public"),
        }
    }
}

impl FromStr for Visibility {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUBLIC" => Ok(Visibility::Public),
            "PRIVATE" => Ok(Visibility::Private),
            _ => Err(CommandError::InvalidVisibility(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListClients,
    Visibility(Visibility),
    ConnectTo { target: String },
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unrecognized command: {0}")]
    Unrecognized(String),
    #[error("missing argument, usage: {usage}")]
    MissingArgument { usage: &'static str },
    #[error("invalid visibility '{0}', expected PUBLIC or PRIVATE")]
    InvalidVisibility(String),
}

const VISIBILITY_USAGE: &str = "VISIBILITY <PUBLIC|PRIVATE>";
const CONNECT_USAGE: &str = "CONNECT_TO <id>";

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut parts = line.split_whitespace();
        let keyword = match parts.next() {
            Some(keyword) => keyword.to_ascii_uppercase(),
            None => return Err(CommandError::Unrecognized(String::new())),
        };

        match keyword.as_str() {
            "LIST_CLIENTS" => Ok(Command::ListClients),
            "TERMINATE" => Ok(Command::Terminate),
            "VISIBILITY" => {
                let value = parts.next().ok_or(CommandError::MissingArgument {
                    usage: VISIBILITY_USAGE,
                })?;
                Ok(Command::Visibility(value.parse()?))
            }
            "CONNECT_TO" => {
                // Identities are case-sensitive; only the keyword is normalised.
                let target = parts.next().ok_or(CommandError::MissingArgument {
                    usage: CONNECT_USAGE,
                })?;
                Ok(Command::ConnectTo {
                    target: target.to_string(),
                })
            }
            _ => Err(CommandError::Unrecognized(keyword)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ListClients => f.write_str("LIST_CLIENTS"),
            Command::Visibility(Visibility::Public) => f.write_str("VISIBILITY PUBLIC"),
            Command::Visibility(Visibility::Private) => f.write_str("VISIBILITY PRIVATE"),
            Command::ConnectTo { target } => write!(f, "CONNECT_TO {target}"),
            Command::Terminate => f.write_str("TERMINATE"),
        }
    }
}
