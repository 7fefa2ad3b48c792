//! Credential challenge against a pluggable user database, plus the
//! login-attempt audit trail.

use crate::config::Settings;
use crate::error::{AppResult, GateError};
use crate::login::LoginContext;
use argon2::Argon2;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use password_hash::{PasswordHash, PasswordVerifier};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ATTEMPT_OK: char = ' ';
pub const ATTEMPT_FAIL: char = '-';

#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Canonical spelling of the userid.
    pub userid: String,
    /// PHC-format password hash.
    pub passwd_hash: String,
}

#[async_trait]
pub trait PasswordStore: Send + Sync {
    /// Case-insensitive lookup.
    async fn load(&self, userid: &str) -> AppResult<Option<UserRecord>>;
}

#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn record(&self, userid: &str, outcome: char, when: DateTime<Local>, host: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    Ok,
    Fail,
    FreeId,
}

pub struct Authenticator {
    store: Arc<dyn PasswordStore>,
    argon: Argon2<'static>,
    guest_id: Option<String>,
    regnew_id: Option<String>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn PasswordStore>, settings: &Settings) -> Self {
        Self {
            store,
            argon: Argon2::default(),
            guest_id: settings.guest_id.clone(),
            regnew_id: settings.regnew_id.clone(),
        }
    }

    /// The canonical sentinel if `userid` names a free account.
    pub fn free_userid(&self, userid: &str) -> Option<&str> {
        for sentinel in [&self.guest_id, &self.regnew_id].into_iter().flatten() {
            if userid.eq_ignore_ascii_case(sentinel) {
                return Some(sentinel);
            }
        }
        None
    }

    /// Challenge the context's credentials. The canonical userid is written
    /// back on every outcome that produced a record, so retries and audit
    /// entries carry the stored spelling rather than the typed one.
    pub async fn challenge(&self, ctx: &mut LoginContext) -> AppResult<Challenge> {
        if let Some(free) = self.free_userid(&ctx.userid) {
            ctx.userid = free.to_string();
            return Ok(Challenge::FreeId);
        }

        match self.store.load(&ctx.userid).await? {
            Some(rec) => {
                let ok = self.verify(&rec.passwd_hash, &ctx.passwd);
                ctx.userid = rec.userid;
                Ok(if ok { Challenge::Ok } else { Challenge::Fail })
            }
            None => Ok(Challenge::Fail),
        }
    }

    fn verify(&self, hash: &str, passwd: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon
                .verify_password(passwd.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "unparsable password hash in store");
                false
            }
        }
    }
}

/// In-memory store, handy for tests and embedded setups.
#[derive(Debug, Default)]
pub struct MemoryPasswordStore {
    users: HashMap<String, UserRecord>,
}

impl MemoryPasswordStore {
    pub fn insert(&mut self, userid: &str, passwd_hash: &str) {
        self.users.insert(
            userid.to_ascii_lowercase(),
            UserRecord {
                userid: userid.to_string(),
                passwd_hash: passwd_hash.to_string(),
            },
        );
    }
}

#[async_trait]
impl PasswordStore for MemoryPasswordStore {
    async fn load(&self, userid: &str) -> AppResult<Option<UserRecord>> {
        Ok(self.users.get(&userid.to_ascii_lowercase()).cloned())
    }
}

/// Store backed by a `userid:phc-hash` line file, read once at startup.
#[derive(Debug, Default)]
pub struct FilePasswordStore {
    users: HashMap<String, UserRecord>,
}

impl FilePasswordStore {
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GateError::Store(format!("{}: {e}", path.display())))?;
        let mut users = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((userid, hash)) = line.split_once(':') else {
                tracing::warn!(%line, "skipping malformed user record");
                continue;
            };
            users.insert(
                userid.to_ascii_lowercase(),
                UserRecord {
                    userid: userid.to_string(),
                    passwd_hash: hash.to_string(),
                },
            );
        }
        Ok(Self { users })
    }

    /// Missing files yield an empty store so free accounts still work.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(error = %e, "starting with an empty user database");
                Self::default()
            }
        }
    }
}

#[async_trait]
impl PasswordStore for FilePasswordStore {
    async fn load(&self, userid: &str) -> AppResult<Option<UserRecord>> {
        Ok(self.users.get(&userid.to_ascii_lowercase()).cloned())
    }
}

/// Appends one line per challenged login to a plain log file.
pub struct FileAttemptLog {
    path: PathBuf,
}

impl FileAttemptLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl AttemptLog for FileAttemptLog {
    async fn record(&self, userid: &str, outcome: char, when: DateTime<Local>, host: &str) {
        use tokio::io::AsyncWriteExt;

        let line = format!(
            "{:<12}{} {} @{}\n",
            userid,
            outcome,
            when.format("%m/%d/%Y %H:%M:%S"),
            host
        );
        let open = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await;
        match open {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %e, "cannot append to attempt log");
                }
            }
            Err(e) => tracing::warn!(error = %e, path = %self.path.display(), "cannot open attempt log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::Argon2;
    use password_hash::rand_core::OsRng;
    use password_hash::{PasswordHasher, SaltString};

    fn hash(pass: &str) -> String {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(pass.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn authenticator() -> Authenticator {
        let mut store = MemoryPasswordStore::default();
        store.insert("Alice", &hash("secret"));
        Authenticator::new(Arc::new(store), &Settings::default())
    }

    fn ctx(userid: &str, passwd: &str) -> LoginContext {
        let mut c = LoginContext::new("10.0.0.1".into(), "3000".into());
        c.userid = userid.to_string();
        c.passwd = passwd.to_string();
        c
    }

    #[tokio::test]
    async fn good_credentials_pass_and_canonicalise() {
        let auth = authenticator();
        let mut c = ctx("ALICE", "secret");
        assert_eq!(auth.challenge(&mut c).await.unwrap(), Challenge::Ok);
        assert_eq!(c.userid, "Alice");
    }

    #[tokio::test]
    async fn bad_password_fails_with_canonical_id() {
        let auth = authenticator();
        let mut c = ctx("alice", "wrong");
        assert_eq!(auth.challenge(&mut c).await.unwrap(), Challenge::Fail);
        assert_eq!(c.userid, "Alice");
    }

    #[tokio::test]
    async fn empty_password_fails() {
        let auth = authenticator();
        let mut c = ctx("alice", "");
        assert_eq!(auth.challenge(&mut c).await.unwrap(), Challenge::Fail);
    }

    #[tokio::test]
    async fn unknown_user_fails_untouched() {
        let auth = authenticator();
        let mut c = ctx("nobody", "x");
        assert_eq!(auth.challenge(&mut c).await.unwrap(), Challenge::Fail);
        assert_eq!(c.userid, "nobody");
    }

    #[tokio::test]
    async fn free_ids_skip_the_store_and_canonicalise() {
        let auth = authenticator();
        let mut c = ctx("GUEST", "");
        assert_eq!(auth.challenge(&mut c).await.unwrap(), Challenge::FreeId);
        assert_eq!(c.userid, "guest");

        let mut c = ctx("New", "");
        assert_eq!(auth.challenge(&mut c).await.unwrap(), Challenge::FreeId);
        assert_eq!(c.userid, "new");
    }

    #[test]
    fn file_store_parses_records() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# users").unwrap();
        writeln!(f, "Bob:$argon2id$bogus").unwrap();
        writeln!(f, "garbage-line").unwrap();

        let store = FilePasswordStore::load_from(f.path()).unwrap();
        let rec = block_on(store.load("BOB")).unwrap().unwrap();
        assert_eq!(rec.userid, "Bob");
        assert!(block_on(store.load("garbage-line")).unwrap().is_none());
    }

    // small sync driver for the async trait in a sync test
    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }
}
