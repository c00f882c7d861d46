//! Instrumented stand-ins for the collaborators.
//!
//! The "database" is a plain file holding the feed payload, and its companion
//! records `v2:{len}` so a pair that does not belong together fails to open.
//! A "zip" is any file starting with `PK`.

use crate::error::{ErrorKind, Result};
use crate::feed::{FeedConsumer, FeedStore, PatternDetector, Release};
use exn::ResultExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) fn write_zip(dir: &Path, name: &str, payload: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut data = b"PK".to_vec();
    data.extend_from_slice(payload);
    std::fs::write(&path, data).unwrap();
    path
}

fn companion(db: &Path) -> PathBuf {
    let mut path = db.as_os_str().to_owned();
    path.push(".p");
    PathBuf::from(path)
}

#[derive(Debug)]
pub(crate) struct FakeHandle {
    pub(crate) db: PathBuf,
    pub(crate) content: Vec<u8>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeStore {
    loads: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

impl FakeStore {
    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl FeedStore for FakeStore {
    type Handle = FakeHandle;

    fn open_or_create(&self, db_path: &Path) -> Result<FakeHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let content = match std::fs::read(db_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).or_raise(|| ErrorKind::Database),
        };
        if db_path.exists() {
            let marker = std::fs::read_to_string(companion(db_path)).or_raise(|| ErrorKind::Database)?;
            if marker != format!("v2:{}", content.len()) {
                exn::bail!(ErrorKind::Database);
            }
        }
        Ok(FakeHandle { db: db_path.to_path_buf(), content })
    }

    fn load_from_source(&self, handle: &mut FakeHandle, source_path: &Path) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Long enough for concurrent callers to pile up behind one load.
        std::thread::sleep(Duration::from_millis(20));
        let data = std::fs::read(source_path).or_raise(|| ErrorKind::Parse)?;
        let Some(payload) = data.strip_prefix(b"PK") else {
            exn::bail!(ErrorKind::Parse);
        };
        handle.content = payload.to_vec();
        Ok(())
    }

    fn close(&self, handle: FakeHandle) -> Result<()> {
        std::fs::write(&handle.db, &handle.content).or_raise(|| ErrorKind::Database)?;
        std::fs::write(companion(&handle.db), format!("v2:{}", handle.content.len()))
            .or_raise(|| ErrorKind::Database)
    }
}

pub(crate) struct NoPatterns;

impl PatternDetector<FakeHandle> for NoPatterns {
    fn detect_patterns(&self, _handle: &mut FakeHandle) -> Result<()> {
        Ok(())
    }
}

/// Open handles per database file, and the most ever open at once.
#[derive(Default)]
struct Handles {
    open: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

pub(crate) struct FakeFeed {
    pub(crate) content: Vec<u8>,
    db: String,
    consumer: FakeConsumer,
}

impl Release for FakeFeed {
    fn close(&mut self) -> Result<()> {
        self.consumer.closing.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.consumer.close_delay);
        let mut handles = self.consumer.handles.lock().unwrap();
        if let Some(open) = handles.open.get_mut(&self.db) {
            *open -= 1;
        }
        self.consumer.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeConsumer {
    closing: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    handles: Arc<Mutex<Handles>>,
    close_delay: Duration,
}

impl FakeConsumer {
    /// A consumer whose feeds take `delay` to close.
    pub(crate) fn slow_close(delay: Duration) -> Self {
        Self { close_delay: delay, ..Self::default() }
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Closes that have started, finished or not.
    pub(crate) fn closes_started(&self) -> usize {
        self.closing.load(Ordering::SeqCst)
    }

    /// Handles currently open on the database file `db`.
    pub(crate) fn open_handles(&self, db: &str) -> usize {
        self.handles.lock().unwrap().open.get(db).copied().unwrap_or(0)
    }

    /// Most handles ever open at once on the database file `db`.
    pub(crate) fn peak_handles(&self, db: &str) -> usize {
        self.handles.lock().unwrap().peak.get(db).copied().unwrap_or(0)
    }
}

impl FeedConsumer<FakeHandle> for FakeConsumer {
    type Value = FakeFeed;

    fn process(&self, handle: FakeHandle) -> Result<FakeFeed> {
        let db = handle.db.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
        let mut handles = self.handles.lock().unwrap();
        let open = handles.open.entry(db.clone()).or_default();
        *open += 1;
        let open = *open;
        let peak = handles.peak.entry(db.clone()).or_default();
        *peak = (*peak).max(open);
        drop(handles);
        Ok(FakeFeed { content: handle.content, db, consumer: self.clone() })
    }
}
