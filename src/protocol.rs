//! Message grammar for the relay wire protocol.
//!
//! The first frame on a connection carries credentials as
//! `mode|username:password`. Every later frame is a tagged, colon-delimited
//! message. File payloads travel base64-encoded so every frame stays valid
//! UTF-8 text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// How a client wants to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Login,
    Register,
}

impl AuthMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "login" => Ok(AuthMode::Login),
            "register" => Ok(AuthMode::Register),
            other => Err(Error::InvalidAuthMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Login => "login",
            AuthMode::Register => "register",
        }
    }
}

/// The first frame sent on a connection.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub mode: AuthMode,
    pub username: String,
    pub password: String,
}

impl AuthRequest {
    pub fn parse(text: &str) -> Result<Self> {
        let (mode, credentials) = text.split_once('|').ok_or(Error::MalformedAuth)?;
        let mode = AuthMode::parse(mode)?;
        let (username, password) = credentials.split_once(':').ok_or(Error::MalformedAuth)?;

        Ok(AuthRequest {
            mode,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        format!("{}|{}:{}", self.mode.as_str(), self.username, self.password)
    }
}

/// A message from an authenticated client.
///
/// The sender is never carried on the wire; the server binds it from the
/// session that received the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `B::content` — deliver to all online users except the sender.
    Broadcast { content: String },
    /// `U:target:content` — deliver to one named user.
    Unicast { target: String, content: String },
    /// `M:group:content` — deliver to the online members of a group.
    Multicast { group: String, content: String },
    /// `C:group:member1,member2,...` — create or overwrite a group.
    CreateGroup { name: String, members: Vec<String> },
    /// `F:target:filename:base64payload` — send a file to one named user.
    FileTransfer {
        target: String,
        filename: String,
        payload: Vec<u8>,
    },
    /// `Q::` — end the session.
    Logout,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let (tag, rest) = text.split_once(':').ok_or(Error::MalformedMessage)?;

        match tag {
            "F" => {
                let (target, rest) = rest.split_once(':').ok_or(Error::MalformedFileMessage)?;
                let (filename, encoded) =
                    rest.split_once(':').ok_or(Error::MalformedFileMessage)?;
                let payload = BASE64.decode(encoded)?;

                Ok(ClientMessage::FileTransfer {
                    target: target.to_string(),
                    filename: filename.to_string(),
                    payload,
                })
            }
            "B" => {
                let (_, content) = rest.split_once(':').ok_or(Error::MalformedMessage)?;
                Ok(ClientMessage::Broadcast {
                    content: content.to_string(),
                })
            }
            "U" => {
                let (target, content) = rest.split_once(':').ok_or(Error::MalformedMessage)?;
                Ok(ClientMessage::Unicast {
                    target: target.to_string(),
                    content: content.to_string(),
                })
            }
            "M" => {
                let (group, content) = rest.split_once(':').ok_or(Error::MalformedMessage)?;
                Ok(ClientMessage::Multicast {
                    group: group.to_string(),
                    content: content.to_string(),
                })
            }
            "C" => {
                let (name, members) = rest.split_once(':').ok_or(Error::MalformedMessage)?;
                let members = members
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect();

                Ok(ClientMessage::CreateGroup {
                    name: name.to_string(),
                    members,
                })
            }
            "Q" => Ok(ClientMessage::Logout),
            other => Err(Error::UnknownMessageTag(other.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ClientMessage::Broadcast { content } => format!("B::{content}"),
            ClientMessage::Unicast { target, content } => format!("U:{target}:{content}"),
            ClientMessage::Multicast { group, content } => format!("M:{group}:{content}"),
            ClientMessage::CreateGroup { name, members } => {
                format!("C:{}:{}", name, members.join(","))
            }
            ClientMessage::FileTransfer {
                target,
                filename,
                payload,
            } => format!("F:{}:{}:{}", target, filename, BASE64.encode(payload)),
            ClientMessage::Logout => "Q::".to_string(),
        }
    }
}

/// Hash a password for storage and comparison.
///
/// Single round of unsalted SHA-256, hex-encoded, matching the format of
/// existing credential files. Not an appropriate scheme for production
/// credential storage.
pub fn password_hash(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
