use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{RawMutex as _, RawRwLock as _};
use parking_lot::{RawMutex, RawRwLock};

/// A node wrapped for shared ownership with four handle kinds:
///
/// - [`ViewHandle`] / [`ReadHandle`] — shared access for navigation.
/// - [`HashHandle`] — exclusive against other hash and write handles but
///   shared with views; the holder may update the node's interior-mutable
///   hash cells, never its structure.
/// - [`WriteHandle`] — fully exclusive structural access.
///
/// The wrapper also carries the persistence dirty flag, readable without
/// taking any node lock so the cache and write buffer never block on node
/// handles while holding their own locks.
pub struct Shared<N> {
    inner: Arc<Inner<N>>,
}

struct Inner<N> {
    structure: RawRwLock,
    hash_token: RawMutex,
    dirty: AtomicBool,
    data: UnsafeCell<N>,
}

// Access to `data` is guarded by `structure` (plus `hash_token` for hash
// passes); the cell itself is what makes these impls necessary.
unsafe impl<N: Send> Send for Inner<N> {}
unsafe impl<N: Send + Sync> Sync for Inner<N> {}

impl<N> Clone for Shared<N> {
    fn clone(&self) -> Self {
        Shared {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N> Shared<N> {
    /// Wraps a node; the new wrapper starts out clean.
    pub fn new(data: N) -> Self {
        Shared {
            inner: Arc::new(Inner {
                structure: RawRwLock::INIT,
                hash_token: RawMutex::INIT,
                dirty: AtomicBool::new(false),
                data: UnsafeCell::new(data),
            }),
        }
    }

    /// Shared read-only access; multiple views may coexist.
    pub fn view(&self) -> ViewHandle<'_, N> {
        self.inner.structure.lock_shared();
        ViewHandle {
            shared: self,
            _not_send: PhantomData,
        }
    }

    /// Alias of [`Shared::view`], used where the read set is explicit.
    pub fn read(&self) -> ReadHandle<'_, N> {
        self.view()
    }

    /// Fully exclusive access.
    pub fn write(&self) -> WriteHandle<'_, N> {
        self.inner.structure.lock_exclusive();
        WriteHandle {
            shared: self,
            _not_send: PhantomData,
        }
    }

    /// Access for hash maintenance: excludes writers and other hashers,
    /// coexists with views.
    pub fn hash(&self) -> HashHandle<'_, N> {
        self.inner.hash_token.lock();
        self.inner.structure.lock_shared();
        HashHandle {
            shared: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_hash(&self) -> Option<HashHandle<'_, N>> {
        if !self.inner.hash_token.try_lock() {
            return None;
        }
        if !self.inner.structure.try_lock_shared() {
            unsafe { self.inner.hash_token.unlock() };
            return None;
        }
        Some(HashHandle {
            shared: self,
            _not_send: PhantomData,
        })
    }

    pub fn try_write(&self) -> Option<WriteHandle<'_, N>> {
        if self.inner.structure.try_lock_exclusive() {
            Some(WriteHandle {
                shared: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Marks the wrapped node as needing persistence.
    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::Release);
    }

    pub fn mark_clean(&self) {
        self.inner.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    pub fn ptr_eq(a: &Shared<N>, b: &Shared<N>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

pub struct ViewHandle<'a, N> {
    shared: &'a Shared<N>,
    _not_send: PhantomData<*mut ()>,
}

/// Read handles are views under a name that marks an explicit read set.
pub type ReadHandle<'a, N> = ViewHandle<'a, N>;

pub struct WriteHandle<'a, N> {
    shared: &'a Shared<N>,
    _not_send: PhantomData<*mut ()>,
}

pub struct HashHandle<'a, N> {
    shared: &'a Shared<N>,
    _not_send: PhantomData<*mut ()>,
}

impl<N> Deref for ViewHandle<'_, N> {
    type Target = N;

    fn deref(&self) -> &N {
        unsafe { &*self.shared.inner.data.get() }
    }
}

impl<N> Drop for ViewHandle<'_, N> {
    fn drop(&mut self) {
        unsafe { self.shared.inner.structure.unlock_shared() };
    }
}

impl<N> Deref for WriteHandle<'_, N> {
    type Target = N;

    fn deref(&self) -> &N {
        unsafe { &*self.shared.inner.data.get() }
    }
}

impl<N> DerefMut for WriteHandle<'_, N> {
    fn deref_mut(&mut self) -> &mut N {
        unsafe { &mut *self.shared.inner.data.get() }
    }
}

impl<N> Drop for WriteHandle<'_, N> {
    fn drop(&mut self) {
        unsafe { self.shared.inner.structure.unlock_exclusive() };
    }
}

impl<N> Deref for HashHandle<'_, N> {
    type Target = N;

    fn deref(&self) -> &N {
        unsafe { &*self.shared.inner.data.get() }
    }
}

impl<N> Drop for HashHandle<'_, N> {
    fn drop(&mut self) {
        unsafe {
            self.shared.inner.structure.unlock_shared();
            self.shared.inner.hash_token.unlock();
        }
    }
}
