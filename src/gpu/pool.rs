// gpu/pool.rs — Fixed-capacity texture pool.
//
// The pool owns a fixed number of buckets, one per pooled texture. Free
// buckets form an intrusive singly linked list threaded through `next`, so
// both `acquire` and `free` are O(1) and never touch the allocator:
//
//   head ─► bucket 3 ─► bucket 2 ─► bucket 1 ─► bucket 0 ─► None
//
// Bucket `i` manages the texture with handle id `i + 1`; id 0 is reserved
// for the visible surface, which is never pooled.
//
// The pool tracks ownership only. Texture storage lives in `GpuContext`,
// which resets a texture to 1×1 transparent black when it is handed out.

use crate::error::{PipelineError, Result};
use crate::gpu::texture::TextureHandle;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    next: Option<usize>,
    free: bool,
}

/// Free-list of pooled texture handles.
#[derive(Debug, Clone)]
pub struct TexturePool {
    buckets: Vec<Bucket>,
    head: Option<usize>,
    available: usize,
}

impl TexturePool {
    /// Create a pool managing `capacity` textures.
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "texture pool capacity must be > 0");
        let buckets = (0..capacity)
            .map(|i| Bucket {
                next: i.checked_sub(1),
                free: true,
            })
            .collect();
        TexturePool {
            buckets,
            head: Some(capacity - 1),
            available: capacity,
        }
    }

    /// Take a handle out of the pool.
    ///
    /// # Errors
    /// `OutOfMemory` when every bucket is in use.
    pub fn acquire(&mut self) -> Result<TextureHandle> {
        let index = self
            .head
            .ok_or(PipelineError::OutOfMemory(self.buckets.len()))?;
        let bucket = &mut self.buckets[index];
        bucket.free = false;
        self.head = bucket.next.take();
        self.available -= 1;
        Ok(TextureHandle(index as u32 + 1))
    }

    /// Return a handle to the pool.
    ///
    /// # Errors
    /// `DoubleFree` when the handle is not managed by this pool or is
    /// already free.
    pub fn free(&mut self, handle: TextureHandle) -> Result<()> {
        let index = self
            .bucket_index(handle)
            .ok_or(PipelineError::DoubleFree(handle.0))?;
        let bucket = &mut self.buckets[index];
        if bucket.free {
            return Err(PipelineError::DoubleFree(handle.0));
        }
        bucket.free = true;
        bucket.next = self.head;
        self.head = Some(index);
        self.available += 1;
        Ok(())
    }

    /// Whether `handle` is currently checked out of this pool.
    pub fn is_allocated(&self, handle: TextureHandle) -> bool {
        self.bucket_index(handle)
            .map_or(false, |i| !self.buckets[i].free)
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of free buckets.
    pub fn available(&self) -> usize {
        self.available
    }

    fn bucket_index(&self, handle: TextureHandle) -> Option<usize> {
        (handle.0 as usize)
            .checked_sub(1)
            .filter(|&i| i < self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = TexturePool::new(3);
        let handles: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(handles.iter().all(|h| !h.is_surface()));
        match pool.acquire() {
            Err(PipelineError::OutOfMemory(3)) => {}
            other => panic!("expected OutOfMemory(3), got {other:?}"),
        }
    }

    #[test]
    fn freed_handle_is_recycled_first() {
        let mut pool = TexturePool::new(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.acquire().unwrap(), a);
        assert!(pool.is_allocated(b));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = TexturePool::new(2);
        let a = pool.acquire().unwrap();
        pool.free(a).unwrap();
        assert!(matches!(pool.free(a), Err(PipelineError::DoubleFree(_))));
        assert!(matches!(
            pool.free(TextureHandle::SURFACE),
            Err(PipelineError::DoubleFree(0))
        ));
        assert!(matches!(
            pool.free(TextureHandle(99)),
            Err(PipelineError::DoubleFree(99))
        ));
        assert_eq!(pool.available(), 2);
    }
}
