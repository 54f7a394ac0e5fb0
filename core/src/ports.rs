//! External collaborators the core only defines interfaces for: blob
//! storage, user-facing notifications, and scratch files (`spec.md` §1/§9
//! "inject a BlobStore, a NotificationSink, and a TempFileManager through
//! constructors"). Concrete adapters (OS notification center, a real temp
//! directory, a blob-to-disk writer) live outside this crate.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Durable storage for large inline blobs (images, files) evicted from a
/// persisted `ClipboardEntry`, addressed afterward via `local_path`
/// (`spec.md` §3/§4.4).
pub trait BlobStore: Send + Sync {
    fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<PathBuf>;
    fn load(&self, path: &Path) -> Result<Vec<u8>>;
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Surfaces user-facing events (new remote clipboard item, pairing request)
/// without coupling the core to a particular UI shell (`spec.md` §9).
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Scratch space for file transfers in flight, distinct from `BlobStore`'s
/// durable storage (`spec.md` §9).
pub trait TempFileManager: Send + Sync {
    fn create_temp_file(&self, suggested_name: &str) -> Result<PathBuf>;
    fn cleanup(&self, path: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct DiskBlobStore {
        dir: PathBuf,
    }

    impl BlobStore for DiskBlobStore {
        fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<PathBuf> {
            let path = self.dir.join(suggested_name);
            std::fs::write(&path, bytes)?;
            Ok(path)
        }

        fn load(&self, path: &Path) -> Result<Vec<u8>> {
            Ok(std::fs::read(path)?)
        }

        fn remove(&self, path: &Path) -> Result<()> {
            std::fs::remove_file(path)?;
            Ok(())
        }
    }

    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, title: &str, _body: &str) {
            self.seen.lock().unwrap().push(title.to_string());
        }
    }

    #[test]
    fn blob_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore { dir: dir.path().to_path_buf() };
        let path = store.store(b"hello", "greeting.bin").unwrap();
        assert_eq!(store.load(&path).unwrap(), b"hello");
        store.remove(&path).unwrap();
        assert!(store.load(&path).is_err());
    }

    #[test]
    fn notification_sink_records_titles() {
        let sink = RecordingSink { seen: Mutex::new(Vec::new()) };
        sink.notify("New clipboard item", "from Phone");
        assert_eq!(sink.seen.lock().unwrap().as_slice(), ["New clipboard item"]);
    }
}
