use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::MediaError;
use crate::protocol::PeerId;

/// Backend-specific track object carried alongside a media handle.
pub type TrackHandle = Arc<dyn Any + Send + Sync>;

/// Acquires the local audio source when a session joins.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;
}

/// The local audio source shared read-only by every peer link.
///
/// Clones share the same enabled flag, so muting is visible to every attached
/// connection immediately.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

struct LocalMediaInner {
    id: String,
    enabled: AtomicBool,
    released: AtomicBool,
    track: Option<TrackHandle>,
}

impl LocalMedia {
    pub fn new(id: impl Into<String>) -> Self {
        Self::build(id.into(), None)
    }

    pub fn with_track<T: Any + Send + Sync>(id: impl Into<String>, track: Arc<T>) -> Self {
        Self::build(id.into(), Some(track as TrackHandle))
    }

    fn build(id: String, track: Option<TrackHandle>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                id,
                enabled: AtomicBool::new(true),
                released: AtomicBool::new(false),
                track,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the backend track if it has type `T`.
    pub fn track<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.track.clone()?.downcast::<T>().ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.inner.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Marks the source as released; sample writers stop feeding it.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::SeqCst);
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn ptr_eq(&self, other: &LocalMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Audio received from one remote participant.
#[derive(Clone)]
pub struct RemoteMedia {
    pub peer_id: PeerId,
    pub track_id: String,
    pub stream_id: String,
    pub track: Option<TrackHandle>,
}

impl RemoteMedia {
    pub fn track<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.track.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("peer_id", &self.peer_id)
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_is_shared_between_clones() {
        let media = LocalMedia::new("mic");
        let attached = media.clone();

        assert!(media.is_enabled());
        assert!(!media.toggle());
        assert!(!attached.is_enabled());
        assert!(attached.toggle());
        assert!(media.is_enabled());
        assert!(media.ptr_eq(&attached));
    }

    #[test]
    fn track_downcasts_only_to_the_stored_type() {
        let media = LocalMedia::with_track("mic", Arc::new(42_u32));
        assert_eq!(media.track::<u32>().as_deref(), Some(&42));
        assert!(media.track::<String>().is_none());
        assert!(LocalMedia::new("bare").track::<u32>().is_none());
    }

    #[test]
    fn release_disables_the_source() {
        let media = LocalMedia::new("mic");
        media.release();
        assert!(media.is_released());
        assert!(!media.is_enabled());
    }
}
