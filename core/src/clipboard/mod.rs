//! Clipboard Monitor (C5) — polls the system pasteboard and emits typed
//! entries, throttled by a token bucket (`spec.md` §4.5/§5).

mod image_codec;
mod throttle;

pub use throttle::TokenBucket;

use std::time::Duration;

use tokio::sync::mpsc;

use std::sync::Arc;

use crate::ports::NotificationSink;
use crate::protocol::constants::{
    CLIPBOARD_THROTTLE_CAPACITY, CLIPBOARD_THROTTLE_REFILL_PER_SEC, MAX_COPY_SIZE_BYTES,
};
use crate::protocol::envelope::{ClipboardContent, ImageFormat};
use crate::{Error, Result};

/// The system pasteboard is an external collaborator (`spec.md` §1); this
/// trait is the seam `ClipboardManager` consumes so platform adapters and
/// tests can both plug in behind it.
pub trait PasteboardSource: Send + Sync {
    fn read(&mut self) -> Result<Option<ClipboardContent>>;
    fn write(&mut self, content: &ClipboardContent) -> Result<()>;
}

/// Default pasteboard backed by `arboard`, covering text and image content.
/// File and rich-link detection beyond URL sniffing depend on platform
/// pasteboard extensions not exposed by `arboard` and are left to a richer
/// adapter (`spec.md` §1 "platform clipboard/system-pasteboard adapters").
pub struct ArboardSource {
    clipboard: arboard::Clipboard,
    notifications: Option<Arc<dyn NotificationSink>>,
}

impl ArboardSource {
    pub fn new(notifications: Option<Arc<dyn NotificationSink>>) -> Result<Self> {
        Ok(Self {
            clipboard: arboard::Clipboard::new().map_err(|e| Error::Clipboard(e.to_string()))?,
            notifications,
        })
    }
}

impl PasteboardSource for ArboardSource {
    fn read(&mut self) -> Result<Option<ClipboardContent>> {
        // Priority order per `spec.md` §3: image > file > link > text. This
        // adapter cannot observe file content, so it checks image first,
        // then falls back to text (classified as a link when it parses as
        // one).
        match self.clipboard.get_image() {
            Ok(image) => {
                return image_codec::encode_arboard_image(image, self.notifications.as_deref());
            }
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(e) => return Err(Error::Clipboard(e.to_string())),
        }

        match self.clipboard.get_text() {
            Ok(text) if !text.is_empty() => Ok(Some(classify_text(text))),
            Ok(_) => Ok(None),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Error::Clipboard(e.to_string())),
        }
    }

    fn write(&mut self, content: &ClipboardContent) -> Result<()> {
        match content {
            ClipboardContent::Text { text } => self
                .clipboard
                .set_text(text)
                .map_err(|e| Error::Clipboard(e.to_string())),
            ClipboardContent::Link { url } => self
                .clipboard
                .set_text(url)
                .map_err(|e| Error::Clipboard(e.to_string())),
            ClipboardContent::Image { bytes, .. } => {
                let decoded = image_codec::decode_to_arboard(bytes)?;
                self.clipboard
                    .set_image(decoded)
                    .map_err(|e| Error::Clipboard(e.to_string()))
            }
            ClipboardContent::File { .. } => {
                // No pasteboard-native representation for files; the caller
                // is expected to have already materialized `local_path`.
                Ok(())
            }
        }
    }
}

fn classify_text(text: String) -> ClipboardContent {
    match url::Url::parse(text.trim()) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            ClipboardContent::Link { url: text }
        }
        _ => ClipboardContent::Text { text },
    }
}

/// Polls a [`PasteboardSource`], applying throttling and echo suppression.
pub struct ClipboardManager {
    source: Box<dyn PasteboardSource>,
    last_seen: Option<ClipboardContent>,
    throttle: TokenBucket,
}

impl ClipboardManager {
    pub fn new(source: Box<dyn PasteboardSource>) -> Self {
        Self {
            source,
            last_seen: None,
            throttle: TokenBucket::new(CLIPBOARD_THROTTLE_CAPACITY, CLIPBOARD_THROTTLE_REFILL_PER_SEC),
        }
    }

    pub fn write(&mut self, content: &ClipboardContent) -> Result<()> {
        self.source.write(content)
    }

    /// Set the last-seen content without emitting a change — used by the
    /// orchestrator after applying a remote entry to suppress the echo on
    /// the next poll (`spec.md` §4.14).
    pub fn suppress_echo(&mut self, content: ClipboardContent) {
        self.last_seen = Some(content);
    }

    /// Poll once. Returns `Ok(None)` when unchanged, throttled, or the
    /// candidate exceeds `max_copy_size_bytes` (the latter additionally
    /// logs a warning per `spec.md` §7 "Item too large").
    pub fn poll_once(&mut self) -> Result<Option<ClipboardContent>> {
        let Some(content) = self.source.read()? else {
            self.last_seen = None;
            return Ok(None);
        };

        if let Some(existing) = &self.last_seen {
            if existing.matches(&content) {
                return Ok(None);
            }
        }

        if content_byte_size(&content) > MAX_COPY_SIZE_BYTES {
            tracing::warn!("clipboard item exceeds max_copy_size_bytes, dropping");
            return Ok(None);
        }

        if !self.throttle.try_take(1) {
            tracing::debug!("clipboard poll throttled");
            return Ok(None);
        }

        self.last_seen = Some(content.clone());
        Ok(Some(content))
    }
}

fn content_byte_size(content: &ClipboardContent) -> u64 {
    match content {
        ClipboardContent::Text { text } => text.len() as u64,
        ClipboardContent::Link { url } => url.len() as u64,
        ClipboardContent::Image { byte_size, .. } => *byte_size,
        ClipboardContent::File { byte_size, .. } => *byte_size,
    }
}

#[derive(Debug, Clone)]
pub struct ClipboardChange {
    pub content: ClipboardContent,
}

/// Spawn a task that polls `manager` every `poll_interval` and forwards
/// changes over a channel, mirroring the teacher's `start_monitor` shape.
pub fn start_monitor(
    mut manager: ClipboardManager,
    poll_interval: Duration,
) -> (mpsc::Receiver<ClipboardChange>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll_interval).await;

            match manager.poll_once() {
                Ok(Some(content)) => {
                    if tx.send(ClipboardChange { content }).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("clipboard read error: {e}"),
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeSource {
        queue: Arc<Mutex<Vec<Option<ClipboardContent>>>>,
        written: Arc<Mutex<Vec<ClipboardContent>>>,
    }

    impl PasteboardSource for FakeSource {
        fn read(&mut self) -> Result<Option<ClipboardContent>> {
            Ok(self.queue.lock().unwrap().pop())
        }

        fn write(&mut self, content: &ClipboardContent) -> Result<()> {
            self.written.lock().unwrap().push(content.clone());
            Ok(())
        }
    }

    fn fake(contents: Vec<Option<ClipboardContent>>) -> ClipboardManager {
        let mut reversed = contents;
        reversed.reverse();
        let source = FakeSource {
            queue: Arc::new(Mutex::new(reversed)),
            written: Arc::new(Mutex::new(Vec::new())),
        };
        ClipboardManager::new(Box::new(source))
    }

    #[test]
    fn emits_on_first_content() {
        let mut manager = fake(vec![Some(ClipboardContent::Text { text: "hi".into() })]);
        let change = manager.poll_once().unwrap();
        assert!(change.is_some());
    }

    #[test]
    fn suppresses_repeat_content() {
        let mut manager = fake(vec![
            Some(ClipboardContent::Text { text: "same".into() }),
            Some(ClipboardContent::Text { text: "same".into() }),
        ]);
        assert!(manager.poll_once().unwrap().is_some());
        assert!(manager.poll_once().unwrap().is_none());
    }

    #[test]
    fn suppress_echo_prevents_reemission() {
        let mut manager = fake(vec![Some(ClipboardContent::Text { text: "remote".into() })]);
        manager.suppress_echo(ClipboardContent::Text { text: "remote".into() });
        assert!(manager.poll_once().unwrap().is_none());
    }

    #[test]
    fn classify_text_detects_link() {
        match classify_text("https://example.com/path".to_string()) {
            ClipboardContent::Link { url } => assert_eq!(url, "https://example.com/path"),
            _ => panic!("expected link classification"),
        }
    }

    #[test]
    fn classify_text_keeps_plain_text() {
        match classify_text("just some words".to_string()) {
            ClipboardContent::Text { text } => assert_eq!(text, "just some words"),
            _ => panic!("expected text classification"),
        }
    }
}
