//! Bucketing free list for byte buffers.
//!
//! Relay pumps and the KCP framing layer churn through medium-sized buffers
//! at connection rate; the pool keeps one free list per power-of-two bucket
//! between 16 B and 64 KiB. Requests above the largest bucket bypass the
//! pool entirely.

use std::sync::OnceLock;

use parking_lot::Mutex;

/// A buffer leased from a [`BufPool`]. Returns itself to the pool on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    len: usize,
    pool: &'static BufPool,
}

impl PooledBuf {
    /// The requested length of the lease.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the lease is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.put(data);
    }
}

/// A bucketing free list for byte buffers of sizes in `[2^min_n, 2^max_n]`.
pub struct BufPool {
    min_n: u32,
    max_n: u32,
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
}

/// The process-wide pool for buffers between 16 B and 64 KiB.
pub fn global() -> &'static BufPool {
    static GLOBAL: OnceLock<BufPool> = OnceLock::new();
    GLOBAL.get_or_init(|| BufPool::new(4, 16))
}

impl BufPool {
    /// Create a pool for buffer sizes in `[2^min_n, 2^max_n]` bytes.
    pub fn new(min_n: u32, max_n: u32) -> Self {
        assert!(max_n > 0, "max_n must be greater than 0");
        assert!(min_n <= max_n, "max_n must be >= min_n");
        let buckets = (min_n..=max_n).map(|_| Mutex::new(Vec::new())).collect();
        BufPool {
            min_n,
            max_n,
            buckets,
        }
    }

    /// Lease a zero-initialised buffer of exactly `size` bytes.
    fn lease(&'static self, size: usize) -> PooledBuf {
        let data = if size == 0 || size > (1usize << self.max_n) {
            vec![0u8; size]
        } else {
            let mut v = self.buckets[self.bucket_idx(size)]
                .lock()
                .pop()
                .unwrap_or_else(|| vec![0u8; 1usize << self.bucket_n(size)]);
            // buffers come back dirty
            v[..size].fill(0);
            v
        };
        PooledBuf {
            data,
            len: size,
            pool: self,
        }
    }

    fn put(&self, buf: Vec<u8>) {
        let size = buf.capacity();
        if size == 0 || size > (1usize << self.max_n) {
            return; // oversize allocations are released to the allocator
        }
        let idx = self.bucket_idx(size.min(1usize << self.max_n));
        let mut bucket = self.buckets[idx].lock();
        if bucket.len() < 64 {
            bucket.push(buf);
        }
    }

    fn bucket_n(&self, size: usize) -> u32 {
        self.min_n + self.bucket_idx(size) as u32
    }

    fn bucket_idx(&self, size: usize) -> usize {
        let mut size = (size - 1) >> self.min_n;
        let mut idx = 0usize;
        while size != 0 {
            idx += 1;
            size >>= 1;
        }
        idx.min((self.max_n - self.min_n) as usize)
    }
}

/// Lease a buffer of `size` bytes from the global pool.
pub fn get(size: usize) -> PooledBuf {
    global().lease(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_sizes() {
        for size in [1, 15, 16, 17, 100, 1024, 32 * 1024, 64 * 1024] {
            let buf = get(size);
            assert_eq!(buf.len(), size);
            assert!(buf.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_oversize_bypasses_pool() {
        let buf = get(256 * 1024);
        assert_eq!(buf.len(), 256 * 1024);
    }

    #[test]
    fn test_reuse_is_zeroed() {
        {
            let mut buf = get(64);
            buf.iter_mut().for_each(|b| *b = 0xAA);
        }
        let buf = get(64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bucket_idx_boundaries() {
        let pool = BufPool::new(4, 16);
        assert_eq!(pool.bucket_idx(1), 0);
        assert_eq!(pool.bucket_idx(16), 0);
        assert_eq!(pool.bucket_idx(17), 1);
        assert_eq!(pool.bucket_idx(32), 1);
        assert_eq!(pool.bucket_idx(33), 2);
        assert_eq!(pool.bucket_idx(64 * 1024), 12);
    }
}
