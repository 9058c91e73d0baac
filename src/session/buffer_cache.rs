//! Per-stream buffer cache between the hardware layer and the client.
//!
//! The hardware layer asks for output buffers mid-capture; fetching one from
//! the client is a round trip it should not pay on every frame. The cache
//! manager keeps a small per-stream stock, refills it from the client's
//! buffer-request callback on demand, and hands buffers back to the client
//! when a stream goes idle or the session flushes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{BufferRequestError, HalError, HalResult};
use crate::types::{StreamBuffer, StreamId};

/// Bound on one client buffer-request round trip.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side of the buffer management protocol.
#[async_trait]
pub trait BufferRequestClient: Send + Sync {
    /// Asks the client for `count` buffers of `stream_id`.
    async fn request_buffers(
        &self,
        stream_id: StreamId,
        count: u32,
    ) -> Result<Vec<StreamBuffer>, BufferRequestError>;

    /// Hands unused buffers back to the client.
    async fn return_buffers(&self, buffers: Vec<StreamBuffer>);
}

struct StreamCache {
    capacity: u32,
    active: bool,
    cached: VecDeque<StreamBuffer>,
    handed_out: u32,
}

/// Caches client buffers per stream for on-demand hardware acquisition.
pub struct StreamBufferCacheManager {
    client: Arc<dyn BufferRequestClient>,
    streams: Mutex<HashMap<StreamId, StreamCache>>,
    fetch_timeout: Duration,
}

impl StreamBufferCacheManager {
    /// Creates a manager fetching through `client`.
    pub fn new(client: Arc<dyn BufferRequestClient>, fetch_timeout: Duration) -> Self {
        Self {
            client,
            streams: Mutex::new(HashMap::new()),
            fetch_timeout,
        }
    }

    /// Registers a stream with its in-flight capacity.
    ///
    /// Fails with `AlreadyExists` when the stream is already registered.
    pub fn register_stream(&self, stream_id: StreamId, capacity: u32) -> HalResult<()> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&stream_id) {
            return Err(HalError::AlreadyExists(format!(
                "stream {stream_id} already registered"
            )));
        }
        streams.insert(
            stream_id,
            StreamCache {
                capacity,
                active: false,
                cached: VecDeque::new(),
                handed_out: 0,
            },
        );
        Ok(())
    }

    /// Marks a stream eligible for fetches. Called on its first request.
    pub fn notify_provider_readiness(&self, stream_id: StreamId) {
        if let Some(cache) = self.streams.lock().get_mut(&stream_id) {
            cache.active = true;
        }
    }

    /// Whether a stream is registered and currently serving buffers.
    pub fn is_stream_active(&self, stream_id: StreamId) -> bool {
        self.streams
            .lock()
            .get(&stream_id)
            .is_some_and(|c| c.active)
    }

    /// Gets one buffer for `stream_id`, from cache or a client fetch.
    pub async fn get_buffer(&self, stream_id: StreamId) -> Result<StreamBuffer, BufferRequestError> {
        {
            let mut streams = self.streams.lock();
            let cache = streams
                .get_mut(&stream_id)
                .ok_or(BufferRequestError::StreamDisconnected)?;
            if !cache.active {
                return Err(BufferRequestError::StreamDisconnected);
            }
            if let Some(buffer) = cache.cached.pop_front() {
                cache.handed_out += 1;
                return Ok(buffer);
            }
            if cache.handed_out >= cache.capacity {
                return Err(BufferRequestError::MaxBufferExceeded);
            }
        }

        // Cache miss. Fetch without holding the stream lock.
        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.client.request_buffers(stream_id, 1),
        )
        .await;
        let mut buffers = match fetched {
            Ok(Ok(buffers)) => buffers,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(stream_id, "buffer fetch timed out");
                return Err(BufferRequestError::Unknown);
            }
        };
        let Some(buffer) = buffers.pop() else {
            return Err(BufferRequestError::NoBufferAvailable);
        };
        let mut surplus = buffers;

        let rejected = {
            let mut streams = self.streams.lock();
            match streams.get_mut(&stream_id) {
                Some(cache) if cache.active => {
                    // A concurrent miss can win the fetch race; re-check so
                    // handed_out never exceeds capacity.
                    if cache.handed_out >= cache.capacity {
                        Some(BufferRequestError::MaxBufferExceeded)
                    } else {
                        cache.handed_out += 1;
                        cache.cached.extend(surplus.drain(..));
                        None
                    }
                }
                // Stream was torn down while the fetch was in flight.
                _ => Some(BufferRequestError::StreamDisconnected),
            }
        };
        if let Some(err) = rejected {
            surplus.push(buffer);
            self.client.return_buffers(surplus).await;
            return Err(err);
        }
        Ok(buffer)
    }

    /// Returns a buffer the hardware layer no longer needs.
    ///
    /// Cached while the stream is active; handed straight back to the client
    /// otherwise.
    pub async fn return_buffer(&self, buffer: StreamBuffer) {
        let to_client = {
            let mut streams = self.streams.lock();
            match streams.get_mut(&buffer.stream_id) {
                Some(cache) if cache.active => {
                    cache.handed_out = cache.handed_out.saturating_sub(1);
                    cache.cached.push_back(buffer);
                    None
                }
                Some(cache) => {
                    cache.handed_out = cache.handed_out.saturating_sub(1);
                    Some(buffer)
                }
                None => Some(buffer),
            }
        };
        if let Some(buffer) = to_client {
            self.client.return_buffers(vec![buffer]).await;
        }
    }

    /// Notes that a handed-out buffer left the pipeline inside a capture
    /// result and is under client ownership again.
    pub fn mark_delivered(&self, stream_id: StreamId) {
        if let Some(cache) = self.streams.lock().get_mut(&stream_id) {
            cache.handed_out = cache.handed_out.saturating_sub(1);
        }
    }

    /// Deactivates one stream and drains its cache back to the client.
    pub async fn notify_flushing(&self, stream_id: StreamId) {
        let drained = {
            let mut streams = self.streams.lock();
            match streams.get_mut(&stream_id) {
                Some(cache) => {
                    cache.active = false;
                    cache.cached.drain(..).collect::<Vec<_>>()
                }
                None => Vec::new(),
            }
        };
        if !drained.is_empty() {
            debug!(stream_id, count = drained.len(), "draining stream cache");
            self.client.return_buffers(drained).await;
        }
    }

    /// Deactivates every stream and drains all caches.
    pub async fn notify_flushing_all(&self) {
        let stream_ids: Vec<StreamId> = self.streams.lock().keys().copied().collect();
        for stream_id in stream_ids {
            self.notify_flushing(stream_id).await;
        }
    }

    /// Total buffers currently cached across all streams.
    pub fn cached_buffer_count(&self) -> usize {
        self.streams.lock().values().map(|c| c.cached.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Client stub with a canned stock of buffers per stream.
    struct StubClient {
        stock: Mutex<HashMap<StreamId, Vec<StreamBuffer>>>,
        returned: Mutex<Vec<StreamBuffer>>,
    }

    impl StubClient {
        fn with_stock(stream_id: StreamId, count: u64) -> Arc<Self> {
            let buffers = (1..=count)
                .map(|buffer_id| StreamBuffer {
                    stream_id,
                    buffer_id,
                    ..StreamBuffer::default()
                })
                .collect();
            Arc::new(Self {
                stock: Mutex::new(HashMap::from([(stream_id, buffers)])),
                returned: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BufferRequestClient for StubClient {
        async fn request_buffers(
            &self,
            stream_id: StreamId,
            count: u32,
        ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
            let mut stock = self.stock.lock();
            let available = stock
                .get_mut(&stream_id)
                .ok_or(BufferRequestError::StreamDisconnected)?;
            if available.is_empty() {
                return Err(BufferRequestError::NoBufferAvailable);
            }
            let take = (count as usize).min(available.len());
            Ok(available.drain(..take).collect())
        }

        async fn return_buffers(&self, buffers: Vec<StreamBuffer>) {
            self.returned.lock().extend(buffers);
        }
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let client = StubClient::with_stock(0, 2);
        let manager = StreamBufferCacheManager::new(client, DEFAULT_FETCH_TIMEOUT);
        manager.register_stream(0, 2).unwrap();
        assert!(matches!(
            manager.register_stream(0, 2),
            Err(HalError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_get_fetches_then_serves_cache() {
        let client = StubClient::with_stock(0, 2);
        let manager = StreamBufferCacheManager::new(client, DEFAULT_FETCH_TIMEOUT);
        manager.register_stream(0, 2).unwrap();
        manager.notify_provider_readiness(0);

        let buffer = manager.get_buffer(0).await.unwrap();
        manager.return_buffer(buffer.clone()).await;
        assert_eq!(manager.cached_buffer_count(), 1);

        // Served from cache, not from the client stock.
        let again = manager.get_buffer(0).await.unwrap();
        assert_eq!(again.buffer_id, buffer.buffer_id);
    }

    #[tokio::test]
    async fn test_inactive_stream_disconnected() {
        let client = StubClient::with_stock(0, 2);
        let manager = StreamBufferCacheManager::new(client, DEFAULT_FETCH_TIMEOUT);
        manager.register_stream(0, 2).unwrap();

        // Registered but no request seen yet.
        assert!(matches!(
            manager.get_buffer(0).await,
            Err(BufferRequestError::StreamDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let client = StubClient::with_stock(0, 5);
        let manager = StreamBufferCacheManager::new(client, DEFAULT_FETCH_TIMEOUT);
        manager.register_stream(0, 1).unwrap();
        manager.notify_provider_readiness(0);

        let _held = manager.get_buffer(0).await.unwrap();
        assert!(matches!(
            manager.get_buffer(0).await,
            Err(BufferRequestError::MaxBufferExceeded)
        ));
    }

    /// Stub wrapper whose fetches park until the test opens the gate.
    struct GatedClient {
        inner: Arc<StubClient>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl BufferRequestClient for GatedClient {
        async fn request_buffers(
            &self,
            stream_id: StreamId,
            count: u32,
        ) -> Result<Vec<StreamBuffer>, BufferRequestError> {
            let _permit = self.gate.acquire().await.expect("gate closed");
            self.inner.request_buffers(stream_id, count).await
        }

        async fn return_buffers(&self, buffers: Vec<StreamBuffer>) {
            self.inner.return_buffers(buffers).await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_respect_capacity() {
        let stub = StubClient::with_stock(0, 2);
        let client = Arc::new(GatedClient {
            inner: stub.clone(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let manager = Arc::new(StreamBufferCacheManager::new(
            client.clone(),
            DEFAULT_FETCH_TIMEOUT,
        ));
        manager.register_stream(0, 1).unwrap();
        manager.notify_provider_readiness(0);

        // Both calls miss the cache and park on the fetch with nothing
        // handed out yet.
        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_buffer(0).await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_buffer(0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.gate.add_permits(2);

        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Err(BufferRequestError::MaxBufferExceeded))));
        // The losing fetch handed its buffer straight back.
        assert_eq!(stub.returned.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_client_stock() {
        let client = StubClient::with_stock(0, 0);
        let manager = StreamBufferCacheManager::new(client, DEFAULT_FETCH_TIMEOUT);
        manager.register_stream(0, 2).unwrap();
        manager.notify_provider_readiness(0);
        assert!(matches!(
            manager.get_buffer(0).await,
            Err(BufferRequestError::NoBufferAvailable)
        ));
    }

    #[tokio::test]
    async fn test_flush_drains_cache_to_client() {
        let client = StubClient::with_stock(0, 2);
        let manager = StreamBufferCacheManager::new(client.clone(), DEFAULT_FETCH_TIMEOUT);
        manager.register_stream(0, 2).unwrap();
        manager.notify_provider_readiness(0);

        let buffer = manager.get_buffer(0).await.unwrap();
        manager.return_buffer(buffer).await;
        assert_eq!(manager.cached_buffer_count(), 1);

        manager.notify_flushing_all().await;
        assert_eq!(manager.cached_buffer_count(), 0);
        assert_eq!(client.returned.lock().len(), 1);
        assert!(!manager.is_stream_active(0));
    }
}
