//! Archive cursors and the message log.

use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use {
    anyhow::{Context, Result},
    jid::BareJid,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

/// Sync position for one archive. Timestamps are unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub last_mam_id: Option<String>,
    pub last_muc_timestamp: Option<i64>,
    /// How far back the archive has been fetched. `Some(0)` means everything.
    pub oldest_mam_timestamp: Option<i64>,
}

/// Partial update of an [`ArchiveInfo`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ArchiveUpdate {
    pub last_mam_id: Option<String>,
    pub last_muc_timestamp: Option<i64>,
    pub oldest_mam_timestamp: Option<i64>,
}

impl ArchiveInfo {
    fn apply(&mut self, update: ArchiveUpdate) {
        if update.last_mam_id.is_some() {
            self.last_mam_id = update.last_mam_id;
        }
        if update.last_muc_timestamp.is_some() {
            self.last_muc_timestamp = update.last_muc_timestamp;
        }
        if update.oldest_mam_timestamp.is_some() {
            self.oldest_mam_timestamp = update.oldest_mam_timestamp;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    GcMsg,
    ChatMsgSent,
    ChatMsgRecv,
}

/// One message in the local log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub account: String,
    /// Conversation JID. For MUC private messages this is the full occupant JID.
    pub jid: String,
    pub timestamp: i64,
    pub kind: MessageKind,
    pub message: String,
    /// Occupant nick for group chat messages.
    pub contact_name: Option<String>,
    pub stanza_id: Option<String>,
    pub message_id: Option<String>,
    /// Archive the stanza id belongs to.
    pub archive: String,
    pub oob_url: Option<String>,
}

/// Persistence used by the archive sync.
pub trait ArchiveStore: Send + Sync {
    fn get_archive_infos(&self, jid: &BareJid) -> Option<ArchiveInfo>;

    fn set_archive_infos(&self, jid: &BareJid, update: ArchiveUpdate) -> Result<()>;

    /// Forget the cursor of `jid` so the next sync starts over.
    fn reset_archive_infos(&self, jid: &BareJid) -> Result<()>;

    /// Whether a message with one of these ids is already logged.
    fn find_stanza_id(
        &self,
        account: &str,
        archive: &BareJid,
        stanza_id: Option<&str>,
        message_id: Option<&str>,
        groupchat: bool,
    ) -> bool;

    fn insert_into_logs(&self, entry: LogEntry) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    archives: BTreeMap<String, ArchiveInfo>,
    logs: Vec<LogEntry>,
    /// (account, scope, id). Scope is the room for group chat, empty otherwise.
    ids: HashSet<(String, String, String)>,
}

impl MemoryInner {
    fn index(&mut self, entry: &LogEntry) {
        let scope = match entry.kind {
            MessageKind::GcMsg => entry.archive.clone(),
            _ => String::new(),
        };
        for id in [&entry.stanza_id, &entry.message_id].into_iter().flatten() {
            self.ids
                .insert((entry.account.clone(), scope.clone(), id.clone()));
        }
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryArchiveStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the message log.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .logs
            .clone()
    }

    fn archives(&self) -> BTreeMap<String, ArchiveInfo> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .archives
            .clone()
    }
}

impl ArchiveStore for MemoryArchiveStore {
    fn get_archive_infos(&self, jid: &BareJid) -> Option<ArchiveInfo> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .archives
            .get(&jid.to_string())
            .cloned()
    }

    fn set_archive_infos(&self, jid: &BareJid, update: ArchiveUpdate) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .archives
            .entry(jid.to_string())
            .or_default()
            .apply(update);
        Ok(())
    }

    fn reset_archive_infos(&self, jid: &BareJid) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.archives.remove(&jid.to_string());
        Ok(())
    }

    fn find_stanza_id(
        &self,
        account: &str,
        archive: &BareJid,
        stanza_id: Option<&str>,
        message_id: Option<&str>,
        groupchat: bool,
    ) -> bool {
        let scope = if groupchat {
            archive.to_string()
        } else {
            String::new()
        };
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        [stanza_id, message_id].into_iter().flatten().any(|id| {
            inner
                .ids
                .contains(&(account.to_string(), scope.clone(), id.to_string()))
        })
    }

    fn insert_into_logs(&self, entry: LogEntry) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.index(&entry);
        inner.logs.push(entry);
        Ok(())
    }
}

/// Store persisted under a data directory.
///
/// Cursors live in `archives.json`, the log is appended to `logs.jsonl`.
pub struct FileArchiveStore {
    data_dir: PathBuf,
    memory: MemoryArchiveStore,
}

impl FileArchiveStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            memory: MemoryArchiveStore::new(),
        };
        {
            let mut inner = store
                .memory
                .inner
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let archives_path = store.archives_path();
            if archives_path.exists() {
                let data = fs::read_to_string(&archives_path)
                    .with_context(|| format!("reading {}", archives_path.display()))?;
                inner.archives = serde_json::from_str(&data)
                    .with_context(|| format!("parsing {}", archives_path.display()))?;
            }
            let logs_path = store.logs_path();
            if logs_path.exists() {
                let data = fs::read_to_string(&logs_path)
                    .with_context(|| format!("reading {}", logs_path.display()))?;
                for line in data.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => {
                            inner.index(&entry);
                            inner.logs.push(entry);
                        },
                        Err(e) => warn!(error = %e, "skipping corrupt log line"),
                    }
                }
            }
            debug!(
                archives = inner.archives.len(),
                messages = inner.logs.len(),
                "archive store loaded"
            );
        }
        Ok(store)
    }

    fn archives_path(&self) -> PathBuf {
        self.data_dir.join("archives.json")
    }

    fn logs_path(&self) -> PathBuf {
        self.data_dir.join("logs.jsonl")
    }

    fn persist_archives(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let data = serde_json::to_string_pretty(&self.memory.archives())?;
        fs::write(self.archives_path(), data)?;
        Ok(())
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.memory.logs()
    }
}

impl ArchiveStore for FileArchiveStore {
    fn get_archive_infos(&self, jid: &BareJid) -> Option<ArchiveInfo> {
        self.memory.get_archive_infos(jid)
    }

    fn set_archive_infos(&self, jid: &BareJid, update: ArchiveUpdate) -> Result<()> {
        self.memory.set_archive_infos(jid, update)?;
        self.persist_archives()
    }

    fn reset_archive_infos(&self, jid: &BareJid) -> Result<()> {
        self.memory.reset_archive_infos(jid)?;
        self.persist_archives()
    }

    fn find_stanza_id(
        &self,
        account: &str,
        archive: &BareJid,
        stanza_id: Option<&str>,
        message_id: Option<&str>,
        groupchat: bool,
    ) -> bool {
        self.memory
            .find_stanza_id(account, archive, stanza_id, message_id, groupchat)
    }

    fn insert_into_logs(&self, entry: LogEntry) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.logs_path())?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        self.memory.insert_into_logs(entry)
    }
}
