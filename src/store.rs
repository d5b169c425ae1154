use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::audit::AuditEvent;
use crate::error::PmError;

pub const ROOT_DIR: &str = ".pm";
pub const AUDIT_FILE: &str = "audit.jsonl";

const GITIGNORE_CONTENT: &str = "cache/\n";

/// Cache namespace. Each category carries its own payload format contract,
/// enforced on read: corrupt payloads degrade to a miss, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Search,
    Fetch,
    Cite,
    Download,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Search,
        Category::Fetch,
        Category::Cite,
        Category::Download,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Search => "search",
            Category::Fetch => "fetch",
            Category::Cite => "cite",
            Category::Download => "download",
        }
    }

    fn validates(self, payload: &str) -> bool {
        match self {
            Category::Search | Category::Cite | Category::Download => {
                serde_json::from_str::<serde_json::Value>(payload).is_ok()
            }
            Category::Fetch => is_well_formed_xml(payload),
        }
    }
}

/// Detect `.pm/` in the current working directory. A plain file named
/// `.pm` is not a state root.
pub fn find_root() -> Option<Utf8PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).ok()?;
    find_root_in(&cwd)
}

pub fn find_root_in(dir: &Utf8Path) -> Option<Utf8PathBuf> {
    let root = dir.join(ROOT_DIR);
    if root.as_std_path().is_dir() {
        Some(root)
    } else {
        None
    }
}

/// Read-through cache over `.pm/cache/<category>/<key>`.
///
/// A `Store` without a root (no `.pm/` found) is valid: every read is a
/// miss and every write is a no-op, so callers never branch on presence.
#[derive(Debug, Clone)]
pub struct Store {
    root: Option<Utf8PathBuf>,
}

impl Store {
    pub fn detect() -> Self {
        Self { root: find_root() }
    }

    pub fn from_root(root: Utf8PathBuf) -> Self {
        Self { root: Some(root) }
    }

    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Returns the cached payload, or `None` on miss. Unreadable bytes or
    /// a payload failing the category's format check are also a miss.
    pub fn read(&self, category: Category, key: &str) -> Option<String> {
        let root = self.root.as_deref()?;
        let path = root.join("cache").join(category.as_str()).join(key);
        let payload = fs::read_to_string(path.as_std_path()).ok()?;
        if !category.validates(&payload) {
            return None;
        }
        Some(payload)
    }

    /// Atomically replace the payload under `(category, key)`. The write
    /// goes to a sibling temp file first and is renamed into place, so a
    /// previously valid entry stays readable through a crash mid-write.
    pub fn write(&self, category: Category, key: &str, payload: &str) -> Result<(), PmError> {
        let Some(root) = self.root.as_deref() else {
            return Ok(());
        };
        let dir = root.join("cache").join(category.as_str());
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| PmError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(dir.as_std_path())
            .map_err(|err| PmError::Filesystem(err.to_string()))?;
        temp.write_all(payload.as_bytes())
            .map_err(|err| PmError::Filesystem(err.to_string()))?;
        temp.persist(dir.join(key).as_std_path())
            .map_err(|err| PmError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Create `.pm/` in `dir` with the cache tree, a `.gitignore` excluding
/// `cache/`, and `audit.jsonl` seeded with an `init` event. Fails if the
/// root already exists.
pub fn init(dir: &Utf8Path) -> Result<Utf8PathBuf, PmError> {
    let root = dir.join(ROOT_DIR);
    // create_dir (not create_dir_all) so a concurrent init loses cleanly.
    match fs::create_dir(root.as_std_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(PmError::AlreadyInitialized(dir.to_owned()));
        }
        Err(err) => return Err(PmError::Filesystem(err.to_string())),
    }

    for category in Category::ALL {
        let sub = root.join("cache").join(category.as_str());
        fs::create_dir_all(sub.as_std_path())
            .map_err(|err| PmError::Filesystem(err.to_string()))?;
    }

    fs::write(root.join(".gitignore").as_std_path(), GITIGNORE_CONTENT)
        .map_err(|err| PmError::Filesystem(err.to_string()))?;

    crate::audit::append(Some(&root), AuditEvent::new("init"))?;

    Ok(root)
}

fn is_well_formed_xml(text: &str) -> bool {
    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut seen_element = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                depth += 1;
                seen_element = true;
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Ok(Event::Empty(_)) => seen_element = true,
            Ok(Event::Eof) => return depth == 0 && seen_element,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}
