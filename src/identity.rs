use std::cell::OnceCell;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;
use crate::store::lock;
use crate::tab_id::TabId;

const ID_FILE: &str = "tab-id";
const LOCK_FILE: &str = "tab.lock";

/// Identity of the running tab.
///
/// A persistent identity lives in a directory private to the tab so a reload
/// of the same tab keeps its id. The directory is locked for as long as the
/// identity is alive; a second opener (a duplicated tab) gets a fresh id that
/// is never written back.
#[derive(Debug)]
pub struct TabIdentity {
    id: OnceCell<TabId>,
    session_dir: Option<PathBuf>,
    _lock: Option<File>,
}

impl TabIdentity {
    /// Identity that lives only in memory; the id is allocated on first use.
    pub fn ephemeral() -> Self {
        Self {
            id: OnceCell::new(),
            session_dir: None,
            _lock: None,
        }
    }

    /// In-memory identity with a caller-chosen id.
    pub fn with_id(id: TabId) -> Self {
        Self {
            id: OnceCell::from(id),
            ..Self::ephemeral()
        }
    }

    /// Identity persisted under `session_dir`.
    pub fn open(session_dir: &Path) -> Result<Self> {
        fs::create_dir_all(session_dir)?;
        let Some(lock) = lock::try_acquire_lock(&session_dir.join(LOCK_FILE))? else {
            tracing::info!(
                dir = %session_dir.display(),
                "session directory held by another tab; using a fresh identity"
            );
            return Ok(Self::ephemeral());
        };

        let id_path = session_dir.join(ID_FILE);
        let existing = match fs::read_to_string(&id_path) {
            Ok(raw) => match raw.parse::<TabId>() {
                Ok(id) => Some(id),
                Err(err) => {
                    tracing::warn!(path = %id_path.display(), %err, "ignoring unreadable tab id");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let id = match existing {
            Some(id) => id,
            None => {
                let id = TabId::generate()?;
                fs::write(&id_path, id.as_str())?;
                id
            }
        };

        Ok(Self {
            id: OnceCell::from(id),
            session_dir: Some(session_dir.to_path_buf()),
            _lock: Some(lock),
        })
    }

    /// The tab's id, stable for the lifetime of this value.
    pub fn current_tab_id(&self) -> &TabId {
        self.id.get_or_init(allocate)
    }

    pub fn is_persistent(&self) -> bool {
        self.session_dir.is_some()
    }

    pub fn session_dir(&self) -> Option<&Path> {
        self.session_dir.as_deref()
    }
}

fn allocate() -> TabId {
    TabId::generate().unwrap_or_else(|err| {
        tracing::warn!(%err, "OS entropy unavailable; deriving tab id from clock and pid");
        let now = Utc::now();
        let mix = std::process::id() ^ now.timestamp_subsec_nanos();
        TabId::generate_at(now, |bytes| {
            bytes.copy_from_slice(&mix.to_be_bytes());
            Ok(())
        })
        .expect("a random source that never fails cannot fail generation")
    })
}
