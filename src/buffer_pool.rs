/// 传输缓冲区池
///
/// 复用读取缓冲区，避免每次读取都重新分配。池是纯粹的资源优化，
/// 关闭后每次都分配新缓冲区，行为完全相同。
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 池中最多保留的空闲缓冲区数量
const DEFAULT_MAX_IDLE: usize = 1024;

pub struct BufferPool {
    queue: SegQueue<Vec<u8>>,
    buffer_size: usize,
    max_idle: usize,
    idle: AtomicUsize,
    enabled: bool,
}

impl BufferPool {
    /// 创建指定缓冲区大小的池
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_idle(buffer_size, DEFAULT_MAX_IDLE)
    }

    /// 创建指定最大空闲数量的池
    pub fn with_max_idle(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            buffer_size,
            max_idle,
            idle: AtomicUsize::new(0),
            enabled: true,
        }
    }

    /// 创建不复用缓冲区的池
    pub fn disabled(buffer_size: usize) -> Self {
        Self {
            enabled: false,
            ..Self::with_max_idle(buffer_size, 0)
        }
    }

    /// 获取一个长度为 buffer_size 的缓冲区
    pub fn acquire(&self) -> Vec<u8> {
        if let Some(buf) = self.queue.pop() {
            self.idle.fetch_sub(1, Ordering::Relaxed);
            return buf;
        }
        vec![0u8; self.buffer_size]
    }

    /// 归还缓冲区，调用后不能再使用该缓冲区
    pub fn release(&self, mut buf: Vec<u8>) {
        if !self.enabled || buf.capacity() < self.buffer_size {
            return;
        }

        if self.idle.fetch_add(1, Ordering::Relaxed) >= self.max_idle {
            self.idle.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        // 重置为完整长度，清除上一次使用留下的内容
        buf.clear();
        buf.resize(self.buffer_size, 0);
        self.queue.push(buf);
    }

    /// 缓冲区大小
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// 当前空闲缓冲区数量
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_has_full_length() {
        let pool = BufferPool::new(64);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_release_resets_buffer() {
        let pool = BufferPool::new(8);
        let mut buf = pool.acquire();
        buf[..3].copy_from_slice(b"abc");
        buf.truncate(3);
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire();
        assert_eq!(reused.len(), 8);
        assert!(reused.iter().all(|&b| b == 0));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_max_idle() {
        let pool = BufferPool::with_max_idle(8, 2);
        for _ in 0..4 {
            pool.release(vec![0u8; 8]);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_disabled_pool_never_retains() {
        let pool = BufferPool::disabled(8);
        pool.release(pool.acquire());
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.acquire().len(), 8);
    }

    #[test]
    fn test_foreign_small_buffer_dropped() {
        let pool = BufferPool::new(1024);
        pool.release(Vec::with_capacity(16));
        assert_eq!(pool.idle(), 0);
    }
}
