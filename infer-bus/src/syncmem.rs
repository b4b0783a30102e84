//! Dual-location memory cell.
//!
//! A [`SyncedBuffer`] holds up to two physical copies of the same bytes, one
//! in host memory and one on an accelerator, and copies lazily between them.
//! `head` records which side is current:
//!
//! ```text
//!                 mutable_host_data()              mutable_device_data()
//!  UNINITIALIZED ───────────────────► HEAD_AT_HOST ◄──────────────────► HEAD_AT_DEVICE
//!                                          │    host_data()/device_data()   │
//!                                          └───────────► SYNCED ◄──────────┘
//! ```
//!
//! A zero-sized buffer never allocates and every accessor returns `None`.

use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{CopyDirection, DeviceContext, MemoryLocation, MemoryOps};
use crate::error::{MemoryError, fatal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncedHead {
    /// Nothing allocated yet.
    Uninitialized,
    /// Host copy is current, device copy (if any) is stale.
    HeadAtHost,
    /// Device copy is current, host copy (if any) is stale.
    HeadAtDevice,
    /// Both copies hold the same bytes.
    Synced,
}

struct Inner {
    host: Option<NonNull<u8>>,
    device: Option<NonNull<u8>>,
    head: SyncedHead,
    owns_host: bool,
    owns_device: bool,
    ctx: DeviceContext,
    // context the owned device allocation was made on
    device_alloc_ctx: DeviceContext,
}

// SAFETY: the pointers are plain addresses; they are only dereferenced while
// the buffer mutex is held or by callers that follow the head protocol.
unsafe impl Send for Inner {}

pub struct SyncedBuffer {
    size: usize,
    ops: Arc<dyn MemoryOps>,
    inner: Mutex<Inner>,
}

impl SyncedBuffer {
    pub fn new(size: usize, ops: Arc<dyn MemoryOps>) -> Self {
        Self::with_context(size, DeviceContext::default(), ops)
    }

    pub fn with_device(size: usize, device_id: i32, channel: i32, ops: Arc<dyn MemoryOps>) -> Self {
        Self::with_context(size, DeviceContext::new(device_id, channel), ops)
    }

    pub fn with_context(size: usize, ctx: DeviceContext, ops: Arc<dyn MemoryOps>) -> Self {
        Self {
            size,
            ops,
            inner: Mutex::new(Inner {
                host: None,
                device: None,
                head: SyncedHead::Uninitialized,
                owns_host: false,
                owns_device: false,
                ctx,
                device_alloc_ctx: ctx,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn head(&self) -> SyncedHead {
        self.lock().head
    }

    pub fn device_id(&self) -> i32 {
        self.lock().ctx.device_id
    }

    pub fn channel(&self) -> i32 {
        self.lock().ctx.channel
    }

    pub fn ctx(&self) -> DeviceContext {
        self.lock().ctx
    }

    /// Pins the buffer to a device and memory channel. Call before the first
    /// accessor when the default device is not wanted.
    pub fn set_device_context(&self, device_id: i32, channel: i32) {
        if let Err(e) = self.try_set_device_context(device_id, channel) {
            fatal(e);
        }
    }

    pub(crate) fn try_set_device_context(&self, device_id: i32, channel: i32) -> Result<(), MemoryError> {
        if self.size == 0 {
            return Ok(());
        }
        let mut inner = self.lock();
        self.ops.check_device(device_id)?;
        inner.ctx = DeviceContext::new(device_id, channel);
        Ok(())
    }

    /// Host pointer to current data, copying from the device first if the
    /// device side is newer.
    pub fn host_data(&self) -> Option<NonNull<u8>> {
        let mut inner = self.lock();
        self.to_host(&mut inner);
        inner.host
    }

    /// Like [`host_data`](Self::host_data) but marks the host side as the
    /// only current copy.
    pub fn mutable_host_data(&self) -> Option<NonNull<u8>> {
        let mut inner = self.lock();
        if self.size == 0 {
            return None;
        }
        self.to_host(&mut inner);
        inner.head = SyncedHead::HeadAtHost;
        inner.host
    }

    pub fn device_data(&self) -> Option<NonNull<u8>> {
        let mut inner = self.lock();
        self.to_device(&mut inner);
        inner.device
    }

    pub fn mutable_device_data(&self) -> Option<NonNull<u8>> {
        let mut inner = self.lock();
        if self.size == 0 {
            return None;
        }
        self.to_device(&mut inner);
        inner.head = SyncedHead::HeadAtDevice;
        inner.device
    }

    /// Adopts `data` as the current host copy. An owned host allocation is
    /// released first; `data` itself is never freed by this buffer.
    ///
    /// # Safety
    /// `data` must stay valid for `size()` bytes for as long as this buffer
    /// may read or write it.
    pub unsafe fn set_host_data(&self, data: NonNull<u8>) {
        let mut inner = self.lock();
        if self.size == 0 {
            return;
        }
        if inner.owns_host {
            if let Some(old) = inner.host.take() {
                // SAFETY: old was allocated by ops.alloc() for this size.
                unsafe { self.ops.free(old, self.size, MemoryLocation::Host, inner.ctx) };
            }
        }
        inner.host = Some(data);
        inner.head = SyncedHead::HeadAtHost;
        inner.owns_host = false;
    }

    /// Adopts `data` as the current device copy without taking ownership.
    ///
    /// # Safety
    /// `data` must be device memory valid for `size()` bytes on this
    /// buffer's device for as long as this buffer may use it.
    pub unsafe fn set_device_data(&self, data: NonNull<u8>) {
        let mut inner = self.lock();
        if self.size == 0 {
            return;
        }
        if inner.owns_device {
            if let Some(old) = inner.device.take() {
                // SAFETY: old was allocated by ops.alloc() on device_alloc_ctx.
                unsafe {
                    self.ops
                        .free(old, self.size, MemoryLocation::Device, inner.device_alloc_ctx)
                };
            }
        }
        inner.device = Some(data);
        inner.head = SyncedHead::HeadAtDevice;
        inner.owns_device = false;
    }

    /// Runs `f` over the current host bytes. Empty for a zero-sized buffer.
    pub fn with_host<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let mut inner = self.lock();
        self.to_host(&mut inner);
        match inner.host {
            // SAFETY: host is valid for size bytes and the lock is held.
            Some(ptr) => f(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) }),
            None => f(&[]),
        }
    }

    /// Runs `f` over the host bytes for writing; the host side becomes head.
    pub fn with_host_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.lock();
        if self.size == 0 {
            return f(&mut []);
        }
        self.to_host(&mut inner);
        inner.head = SyncedHead::HeadAtHost;
        match inner.host {
            // SAFETY: host is valid for size bytes and the lock is held.
            Some(ptr) => f(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) }),
            None => f(&mut []),
        }
    }

    pub fn read_host(&self) -> Vec<u8> {
        self.with_host(|bytes| bytes.to_vec())
    }

    /// Copies `data` into the host side; extra input bytes are ignored.
    pub fn write_host(&self, data: &[u8]) {
        self.with_host_mut(|bytes| {
            let len = bytes.len().min(data.len());
            bytes[..len].copy_from_slice(&data[..len]);
        });
    }

    /// Fills side `dst` from an external region at `src` living on
    /// `src_location`, allocating `dst` storage if absent. `dst` becomes head.
    ///
    /// # Safety
    /// `src` must be valid for `size()` bytes on `src_location`.
    pub(crate) unsafe fn load_from(
        &self,
        src: NonNull<u8>,
        src_location: MemoryLocation,
        dst: MemoryLocation,
        src_ctx: DeviceContext,
    ) {
        let mut inner = self.lock();
        if self.size == 0 {
            return;
        }
        let direction = CopyDirection::between(src_location, dst);
        let dst_ptr = match dst {
            MemoryLocation::Host => self.ensure_host(&mut inner),
            MemoryLocation::Device => self.ensure_device(&mut inner),
        };
        let copy_ctx = match direction {
            CopyDirection::DeviceToHost => src_ctx,
            _ => inner.ctx,
        };
        // SAFETY: dst_ptr was just allocated for size bytes; src is valid per contract.
        if let Err(e) = unsafe { self.ops.copy(dst_ptr, src, self.size, direction, copy_ctx) } {
            fatal(e);
        }
        inner.head = match dst {
            MemoryLocation::Host => SyncedHead::HeadAtHost,
            MemoryLocation::Device => SyncedHead::HeadAtDevice,
        };
    }

    /// Builds a new buffer on `ctx` holding the current bytes of `self`.
    /// Device-resident data moves with a peer copy; host-resident data is
    /// copied on the host and uploaded lazily on the new device.
    pub(crate) fn clone_to_device(&self, ctx: DeviceContext) -> SyncedBuffer {
        let inner = self.lock();
        let target = SyncedBuffer::with_context(self.size, ctx, Arc::clone(&self.ops));
        if self.size == 0 {
            return target;
        }
        match (inner.head, inner.host, inner.device) {
            (SyncedHead::HeadAtDevice, _, Some(src)) => {
                let mut target_inner = target.lock();
                let dst = target.ensure_device(&mut target_inner);
                // SAFETY: both regions are size bytes; target is not shared yet.
                if let Err(e) = unsafe {
                    self.ops
                        .copy(dst, src, self.size, CopyDirection::PeerToPeer, ctx)
                } {
                    fatal(e);
                }
                target_inner.head = SyncedHead::HeadAtDevice;
            }
            (SyncedHead::HeadAtHost | SyncedHead::Synced, Some(src), _) => {
                // SAFETY: the host copy is current and valid for size bytes.
                unsafe { target.load_from(src, MemoryLocation::Host, MemoryLocation::Host, inner.ctx) };
            }
            _ => {}
        }
        target
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_host(&self, inner: &mut Inner) -> NonNull<u8> {
        if let Some(ptr) = inner.host {
            return ptr;
        }
        let ptr = self
            .ops
            .alloc(self.size, MemoryLocation::Host, inner.ctx)
            .unwrap_or_else(|e| fatal(e));
        inner.host = Some(ptr);
        inner.owns_host = true;
        ptr
    }

    fn ensure_device(&self, inner: &mut Inner) -> NonNull<u8> {
        if let Some(ptr) = inner.device {
            return ptr;
        }
        let ptr = self
            .ops
            .alloc(self.size, MemoryLocation::Device, inner.ctx)
            .unwrap_or_else(|e| fatal(e));
        inner.device = Some(ptr);
        inner.owns_device = true;
        inner.device_alloc_ctx = inner.ctx;
        ptr
    }

    fn to_host(&self, inner: &mut Inner) {
        if self.size == 0 {
            return;
        }
        match inner.head {
            SyncedHead::Uninitialized => {
                let ptr = self.ensure_host(inner);
                // SAFETY: freshly allocated host region of size bytes.
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, self.size) };
                inner.head = SyncedHead::HeadAtHost;
            }
            SyncedHead::HeadAtDevice => {
                let dst = self.ensure_host(inner);
                let Some(src) = inner.device else {
                    fatal(MemoryError::Configuration(
                        "head is at device but no device memory is set".to_string(),
                    ));
                };
                // SAFETY: both regions are size bytes and the lock is held.
                if let Err(e) = unsafe {
                    self.ops
                        .copy(dst, src, self.size, CopyDirection::DeviceToHost, inner.ctx)
                } {
                    fatal(e);
                }
                inner.head = SyncedHead::Synced;
            }
            SyncedHead::HeadAtHost | SyncedHead::Synced => {}
        }
    }

    fn to_device(&self, inner: &mut Inner) {
        if self.size == 0 {
            return;
        }
        match inner.head {
            SyncedHead::Uninitialized => {
                self.ensure_device(inner);
                inner.head = SyncedHead::HeadAtDevice;
            }
            SyncedHead::HeadAtHost => {
                let dst = self.ensure_device(inner);
                let Some(src) = inner.host else {
                    fatal(MemoryError::Configuration(
                        "head is at host but no host memory is set".to_string(),
                    ));
                };
                // SAFETY: both regions are size bytes and the lock is held.
                if let Err(e) = unsafe {
                    self.ops
                        .copy(dst, src, self.size, CopyDirection::HostToDevice, inner.ctx)
                } {
                    fatal(e);
                }
                inner.head = SyncedHead::Synced;
            }
            SyncedHead::HeadAtDevice | SyncedHead::Synced => {}
        }
    }
}

impl Drop for SyncedBuffer {
    fn drop(&mut self) {
        let size = self.size;
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if size == 0 {
            return;
        }
        if inner.owns_host {
            if let Some(ptr) = inner.host.take() {
                // SAFETY: owned host memory from ops.alloc() with this size.
                unsafe { self.ops.free(ptr, size, MemoryLocation::Host, inner.ctx) };
            }
        }
        if inner.owns_device {
            if let Some(ptr) = inner.device.take() {
                // SAFETY: owned device memory from ops.alloc() on device_alloc_ctx.
                unsafe {
                    self.ops
                        .free(ptr, size, MemoryLocation::Device, inner.device_alloc_ctx)
                };
            }
        }
    }
}

impl Debug for SyncedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let inner = self.lock();
        f.debug_struct("SyncedBuffer")
            .field("size", &self.size)
            .field("head", &inner.head)
            .field("ctx", &inner.ctx)
            .field("owns_host", &inner.owns_host)
            .field("owns_device", &inner.owns_device)
            .finish()
    }
}

#[cfg(test)]
#[path = "syncmem_test.rs"]
mod syncmem_test;
