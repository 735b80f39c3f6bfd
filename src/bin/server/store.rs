//! Durable stores: credentials, groups, and the activity log.
//!
//! All three are plain text files shared with earlier tooling: the
//! credential file holds `username:hash` lines, the group file holds
//! `group:member1,member2` lines and is append-only (the last line for a
//! name wins, which is what gives group creation its overwrite semantics),
//! and the activity log is one entry per line.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::config::Config;

/// Durable username -> password hash mapping.
pub struct CredentialStore {
    path: PathBuf,
    users: Mutex<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut users = HashMap::new();

        if path.exists() {
            for line in std::fs::read_to_string(&path)?.lines() {
                match line.split_once(':') {
                    Some((username, hash)) => {
                        users.insert(username.to_string(), hash.to_string());
                    }
                    None => warn!(line, "skipping malformed credential line"),
                }
            }
        }

        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    /// Look up a user's stored password hash.
    pub fn lookup(&self, username: &str) -> Option<String> {
        self.users.lock().unwrap().get(username).cloned()
    }

    /// Register a new user. Returns false, writing nothing, if the
    /// username is taken. Check and append happen under one lock so two
    /// concurrent registrations cannot both claim a name.
    pub fn register(&self, username: &str, hash: &str) -> io::Result<bool> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(username) {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{username}:{hash}")?;

        users.insert(username.to_string(), hash.to_string());
        Ok(true)
    }
}

/// Durable group name -> members mapping.
pub struct GroupStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl GroupStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Re-read the whole mapping from disk. Called fresh for every
    /// multicast so stale membership is never acted on.
    pub fn reload_all(&self) -> io::Result<HashMap<String, Vec<String>>> {
        let mut groups = HashMap::new();
        if !self.path.exists() {
            return Ok(groups);
        }

        for line in std::fs::read_to_string(&self.path)?.lines() {
            match line.split_once(':') {
                Some((name, members)) => {
                    let members = members
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                    groups.insert(name.to_string(), members);
                }
                None => warn!(line, "skipping malformed group line"),
            }
        }

        Ok(groups)
    }

    /// Create or overwrite a group by appending its new membership line.
    pub fn upsert(&self, name: &str, members: &[String]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}:{}", name, members.join(","))
    }
}

/// Append-only log of delivered messages and group creations.
pub struct ActivityLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ActivityLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one entry. Best-effort: failures are logged and swallowed so
    /// routing never fails on the log. Appends are serialized so entries
    /// from concurrent senders never interleave mid-line.
    pub fn append(&self, entry: &str) {
        let _guard = self.write_lock.lock().unwrap();

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{entry}"));

        if let Err(e) = result {
            warn!(error = %e, "failed to append to activity log");
        }
    }
}

/// The three stores the router works against.
pub struct Stores {
    pub credentials: CredentialStore,
    pub groups: GroupStore,
    pub log: ActivityLog,
}

impl Stores {
    pub fn open(config: &Config) -> io::Result<Self> {
        Ok(Self {
            credentials: CredentialStore::open(&config.users_file)?,
            groups: GroupStore::open(&config.groups_file),
            log: ActivityLog::open(&config.log_file),
        })
    }
}
