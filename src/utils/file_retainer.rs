//! Reference-counted pins on durability files.
//!
//! A recovery plan pins every file it intends to ship; the retention sweep
//! consults the retainer and skips pinned paths instead of deleting a file
//! mid-transfer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct FileRetainer {
    pins: Mutex<HashMap<PathBuf, usize>>,
}

impl FileRetainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a locker; files added to it stay pinned until the locker is
    /// dropped.
    pub fn add_locker(self: &Arc<Self>) -> FileLocker {
        FileLocker {
            retainer: Arc::clone(self),
            files: Vec::new(),
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pins.lock().contains_key(path)
    }

    fn pin(&self, path: PathBuf) {
        *self.pins.lock().entry(path).or_insert(0) += 1;
    }

    fn unpin(&self, path: &Path) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                pins.remove(path);
            }
        }
    }
}

#[derive(Debug)]
pub struct FileLocker {
    retainer: Arc<FileRetainer>,
    files: Vec<PathBuf>,
}

impl FileLocker {
    pub fn add_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.retainer.pin(path.clone());
        self.files.push(path);
    }
}

impl Drop for FileLocker {
    fn drop(&mut self) {
        for path in &self.files {
            self.retainer.unpin(path);
        }
    }
}
