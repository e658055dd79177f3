//! Tiered byte-buffer pools and reusable request/response object pools (spec §4.E).

use std::sync::{Arc, Mutex};

/// Buffer size tiers. The chosen pool is the smallest tier whose capacity covers
/// the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTier {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl BufferTier {
    pub const fn capacity(self) -> usize {
        match self {
            BufferTier::Small => 4 * 1024,
            BufferTier::Medium => 16 * 1024,
            BufferTier::Large => 64 * 1024,
            BufferTier::ExtraLarge => 128 * 1024,
        }
    }

    fn for_size(size: usize) -> Option<Self> {
        [BufferTier::Small, BufferTier::Medium, BufferTier::Large, BufferTier::ExtraLarge]
            .into_iter()
            .find(|tier| size <= tier.capacity())
    }
}

struct TierPool {
    tier: BufferTier,
    free: Mutex<Vec<Vec<u8>>>,
}

impl TierPool {
    fn new(tier: BufferTier, warm_count: usize) -> Self {
        let free = (0..warm_count).map(|_| Vec::with_capacity(tier.capacity())).collect();
        Self { tier, free: Mutex::new(free) }
    }

    fn take(&self) -> Vec<u8> {
        self.free.lock().expect("buffer pool lock poisoned").pop().unwrap_or_else(|| {
            tracing::debug!(tier = ?self.tier, "buffer pool empty, allocating fresh");
            Vec::with_capacity(self.tier.capacity())
        })
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.free.lock().expect("buffer pool lock poisoned").push(buf);
    }
}

/// A handle to a pooled (or freshly-allocated) byte slice. Call [`BufferHandle::release`]
/// exactly once to return the underlying storage to its pool; a second release is
/// undefined (matching the spec's contract, which assumes single-ownership release).
pub struct BufferHandle {
    buf: Vec<u8>,
    origin: Option<Arc<TierPool>>,
}

impl BufferHandle {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Return the buffer to its pool. A no-op for buffers that exceeded every tier.
    pub fn release(mut self) {
        if let Some(pool) = self.origin.take() {
            pool.give_back(std::mem::take(&mut self.buf));
        }
    }
}

/// The four tiered buffer pools plus the request/response object pools, warmed at
/// process start with the counts the original implementation used (30/20/10/5, and
/// 10 reusable request+response pairs).
pub struct BufferPools {
    small: Arc<TierPool>,
    medium: Arc<TierPool>,
    large: Arc<TierPool>,
    extra_large: Arc<TierPool>,
    request_objects: Mutex<Vec<RequestScratch>>,
    response_objects: Mutex<Vec<ResponseScratch>>,
}

/// Reusable scratch space for building an outbound request (headers + body bytes).
#[derive(Default)]
pub struct RequestScratch {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestScratch {
    fn reset(&mut self) {
        self.headers.clear();
        self.body.clear();
    }
}

/// Reusable scratch space for holding a response body before it is copied out.
#[derive(Default)]
pub struct ResponseScratch {
    pub body: Vec<u8>,
}

impl ResponseScratch {
    fn reset(&mut self) {
        self.body.clear();
    }
}

impl BufferPools {
    pub fn new() -> Self {
        Self {
            small: Arc::new(TierPool::new(BufferTier::Small, 30)),
            medium: Arc::new(TierPool::new(BufferTier::Medium, 20)),
            large: Arc::new(TierPool::new(BufferTier::Large, 10)),
            extra_large: Arc::new(TierPool::new(BufferTier::ExtraLarge, 5)),
            request_objects: Mutex::new((0..10).map(|_| RequestScratch::default()).collect()),
            response_objects: Mutex::new((0..10).map(|_| ResponseScratch::default()).collect()),
        }
    }

    /// Return a buffer of at least `size` bytes. If `size` exceeds the largest tier,
    /// a fresh non-pooled slice is returned and [`BufferHandle::release`] is a no-op.
    ///
    /// If a pooled item's capacity turns out to be insufficient (it can't, since tiers
    /// are chosen by capacity, but a shrunk buffer re-pushed from elsewhere could be
    /// under-capacity) a fresh slice of the exact size is allocated and the pooled item
    /// is still returned to its pool — the spec retains this as written (§9 Open
    /// Questions) rather than simplifying it away.
    pub fn get_buffer(&self, size: usize) -> BufferHandle {
        let Some(tier) = BufferTier::for_size(size) else {
            return BufferHandle { buf: vec![0u8; size], origin: None };
        };

        let pool = match tier {
            BufferTier::Small => &self.small,
            BufferTier::Medium => &self.medium,
            BufferTier::Large => &self.large,
            BufferTier::ExtraLarge => &self.extra_large,
        };

        let mut buf = pool.take();
        if buf.capacity() < size {
            let fresh = vec![0u8; size];
            pool.give_back(buf);
            return BufferHandle { buf: fresh, origin: Some(pool.clone()) };
        }
        buf.resize(size, 0);
        BufferHandle { buf, origin: Some(pool.clone()) }
    }

    pub fn take_request_scratch(&self) -> RequestScratch {
        self.request_objects.lock().expect("request pool lock poisoned").pop().unwrap_or_default()
    }

    pub fn give_back_request_scratch(&self, mut scratch: RequestScratch) {
        scratch.reset();
        self.request_objects.lock().expect("request pool lock poisoned").push(scratch);
    }

    pub fn take_response_scratch(&self) -> ResponseScratch {
        self.response_objects.lock().expect("response pool lock poisoned").pop().unwrap_or_default()
    }

    pub fn give_back_response_scratch(&self, mut scratch: ResponseScratch) {
        scratch.reset();
        self.response_objects.lock().expect("response pool lock poisoned").push(scratch);
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smallest_tier_that_fits() {
        assert_eq!(BufferTier::for_size(100), Some(BufferTier::Small));
        assert_eq!(BufferTier::for_size(5000), Some(BufferTier::Medium));
        assert_eq!(BufferTier::for_size(20_000), Some(BufferTier::Large));
        assert_eq!(BufferTier::for_size(70_000), Some(BufferTier::ExtraLarge));
        assert_eq!(BufferTier::for_size(200_000), None);
    }

    #[test]
    fn oversized_request_gets_unpooled_slice() {
        let pools = BufferPools::new();
        let handle = pools.get_buffer(200_000);
        assert_eq!(handle.len(), 200_000);
        handle.release(); // no-op, must not panic
    }

    #[test]
    fn buffer_round_trips_through_pool() {
        let pools = BufferPools::new();
        let handle = pools.get_buffer(1000);
        assert_eq!(handle.len(), 1000);
        handle.release();

        let handle2 = pools.get_buffer(1000);
        assert_eq!(handle2.len(), 1000);
    }

    #[test]
    fn release_resets_length_to_zero_before_pooling() {
        let pools = BufferPools::new();
        let mut handle = pools.get_buffer(10);
        handle.as_mut_slice().fill(0xAB);
        handle.release();

        // Pull the buffer straight back out of the pool via the internal tier.
        let raw = pools.small.take();
        assert_eq!(raw.len(), 0);
    }

    #[test]
    fn request_and_response_scratch_round_trip() {
        let pools = BufferPools::new();
        let mut scratch = pools.take_request_scratch();
        scratch.headers.push(("X-Trace-ID".into(), "abc".into()));
        pools.give_back_request_scratch(scratch);

        let scratch = pools.take_request_scratch();
        assert!(scratch.headers.is_empty(), "scratch must be reset before reuse");
    }
}
