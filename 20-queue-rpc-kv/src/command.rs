//! Request and reply records exchanged between RPC client and server.
//!
//! [`Request`] is the wire shape: the command kind travels as a plain string
//! so that a request with a kind this server does not know still decodes and
//! can be logged. [`Command`] is the typed form the server executes.

use std::fmt;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const ADD_ITEM: &str = "add";
pub const REMOVE_ITEM: &str = "remove";
pub const GET_ITEM: &str = "get";
pub const GET_ALL_ITEMS: &str = "getall";

/// Serialized body of a request published to the server queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("malformed request body")
    }
}

/// The four operations the store serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { key: String, value: String },
    Remove { key: String },
    Get { key: String },
    GetAll,
}

impl Command {
    /// Wire name of this command's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Add { .. } => ADD_ITEM,
            Command::Remove { .. } => REMOVE_ITEM,
            Command::Get { .. } => GET_ITEM,
            Command::GetAll => GET_ALL_ITEMS,
        }
    }

    /// Builds a command from its wire kind plus positional arguments.
    ///
    /// Arguments a kind does not use are ignored, missing ones default to
    /// the empty string.
    pub fn parse(kind: &str, key: Option<String>, value: Option<String>) -> Result<Self> {
        let key = key.unwrap_or_default();
        let value = value.unwrap_or_default();
        match kind {
            ADD_ITEM => Ok(Command::Add { key, value }),
            REMOVE_ITEM => Ok(Command::Remove { key }),
            GET_ITEM => Ok(Command::Get { key }),
            GET_ALL_ITEMS => Ok(Command::GetAll),
            other => Err(anyhow!("unknown command kind '{other}'")),
        }
    }

    pub fn to_request(&self) -> Request {
        let (key, value) = match self {
            Command::Add { key, value } => (key.clone(), value.clone()),
            Command::Remove { key } | Command::Get { key } => (key.clone(), String::new()),
            Command::GetAll => (String::new(), String::new()),
        };
        Request {
            command: self.kind().to_string(),
            key,
            value,
        }
    }
}

impl TryFrom<Request> for Command {
    type Error = anyhow::Error;

    fn try_from(request: Request) -> Result<Self> {
        Command::parse(&request.command, Some(request.key), Some(request.value))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Add { key, value } => write!(f, "{ADD_ITEM} {key} {value}"),
            Command::Remove { key } => write!(f, "{REMOVE_ITEM} {key}"),
            Command::Get { key } => write!(f, "{GET_ITEM} {key}"),
            Command::GetAll => f.write_str(GET_ALL_ITEMS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Command-specific reply published back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Add { success: bool },
    Remove { success: bool },
    Get { success: bool, value: String },
    GetAll { items: Vec<KeyValuePair> },
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("malformed reply body")
    }

    /// Renders the reply the way the command-line client prints it.
    pub fn render(&self) -> String {
        match self {
            Reply::Add { success: true } | Reply::Remove { success: true } => {
                "Succeed".to_string()
            }
            Reply::Add { success: false } | Reply::Remove { success: false } => {
                "Failed".to_string()
            }
            Reply::Get { success: true, value } => value.clone(),
            Reply::Get { success: false, .. } => "Failed".to_string(),
            Reply::GetAll { items } => items
                .iter()
                .map(|pair| format!("{}: {}", pair.key, pair.value))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_preserves_every_command() {
        let commands = [
            Command::Add {
                key: "a".into(),
                value: "1".into(),
            },
            Command::Remove { key: "a".into() },
            Command::Get { key: "a".into() },
            Command::GetAll,
        ];

        for command in commands {
            let bytes = command.to_request().encode().expect("encode request");
            let decoded = Request::decode(&bytes).expect("decode request");
            assert_eq!(Command::try_from(decoded).expect("known kind"), command);
        }
    }

    #[test]
    fn reply_roundtrip_preserves_every_shape() {
        let replies = [
            Reply::Add { success: true },
            Reply::Remove { success: true },
            Reply::Get {
                success: false,
                value: String::new(),
            },
            Reply::GetAll {
                items: vec![KeyValuePair {
                    key: "b".into(),
                    value: "2".into(),
                }],
            },
        ];

        for reply in replies {
            let bytes = reply.encode().expect("encode reply");
            assert_eq!(Reply::decode(&bytes).expect("decode reply"), reply);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let request = Request {
            command: "explode".into(),
            key: "k".into(),
            value: String::new(),
        };
        let err = Command::try_from(request).expect_err("unknown kind must fail");
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn request_without_key_or_value_decodes() {
        let request = Request::decode(br#"{"command":"getall"}"#).expect("decode");
        assert_eq!(Command::try_from(request).expect("known kind"), Command::GetAll);
    }

    #[test]
    fn unused_arguments_are_dropped() {
        let command = Command::parse(GET_ITEM, Some("k".into()), Some("ignored".into()))
            .expect("parse get");
        assert_eq!(command, Command::Get { key: "k".into() });
        assert_eq!(command.to_request().value, "");
    }

    #[test]
    fn render_matches_cli_output() {
        assert_eq!(Reply::Add { success: true }.render(), "Succeed");
        assert_eq!(
            Reply::Get {
                success: false,
                value: String::new()
            }
            .render(),
            "Failed"
        );
        let all = Reply::GetAll {
            items: vec![
                KeyValuePair {
                    key: "a".into(),
                    value: "1".into(),
                },
                KeyValuePair {
                    key: "b".into(),
                    value: "2".into(),
                },
            ],
        };
        assert_eq!(all.render(), "a: 1\nb: 2");
    }
}
