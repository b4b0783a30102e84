//! Accelerator memory collaborator.
//!
//! [`MemoryOps`] is the narrow allocate/free/copy interface the memory layer
//! talks to. [`SimulatedDevice`] implements it on pageable host memory so the
//! whole pipeline can run without an accelerator; it also keeps counters that
//! make lazy-copy behaviour observable.

use std::alloc::Layout;
use std::fmt::{Display, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MemoryError;

/// Alignment of every simulated allocation.
pub const ALLOC_ALIGNMENT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    Host,
    Device,
}

impl Display for MemoryLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            MemoryLocation::Host => write!(f, "host"),
            MemoryLocation::Device => write!(f, "device"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    PeerToPeer,
}

impl CopyDirection {
    pub fn between(src: MemoryLocation, dst: MemoryLocation) -> Self {
        match (src, dst) {
            (MemoryLocation::Host, MemoryLocation::Host) => CopyDirection::HostToHost,
            (MemoryLocation::Host, MemoryLocation::Device) => CopyDirection::HostToDevice,
            (MemoryLocation::Device, MemoryLocation::Host) => CopyDirection::DeviceToHost,
            (MemoryLocation::Device, MemoryLocation::Device) => CopyDirection::DeviceToDevice,
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl Display for CopyDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let name = match self {
            CopyDirection::HostToHost => "host->host",
            CopyDirection::HostToDevice => "host->device",
            CopyDirection::DeviceToHost => "device->host",
            CopyDirection::DeviceToDevice => "device->device",
            CopyDirection::PeerToPeer => "peer->peer",
        };
        write!(f, "{}", name)
    }
}

/// Device ordinal plus memory channel. A channel of `-1` lets the driver pick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceContext {
    pub device_id: i32,
    pub channel: i32,
}

impl DeviceContext {
    pub fn new(device_id: i32, channel: i32) -> Self {
        Self { device_id, channel }
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self {
            device_id: 0,
            channel: -1,
        }
    }
}

/// Allocate/free/copy primitives of an accelerator runtime. All calls are
/// synchronous.
pub trait MemoryOps: Send + Sync {
    fn alloc(
        &self,
        size: usize,
        location: MemoryLocation,
        ctx: DeviceContext,
    ) -> Result<NonNull<u8>, MemoryError>;

    /// # Safety
    /// `ptr` must come from [`MemoryOps::alloc`] on `self` with the same
    /// `size` and `location`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, location: MemoryLocation, ctx: DeviceContext);

    /// # Safety
    /// `src` and `dst` must be valid for `size` bytes on the sides named by
    /// `direction` and must not overlap.
    unsafe fn copy(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        size: usize,
        direction: CopyDirection,
        ctx: DeviceContext,
    ) -> Result<(), MemoryError>;

    fn check_device(&self, device_id: i32) -> Result<(), MemoryError>;
}

/// Point-in-time copy of [`SimulatedDevice`] counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub host_allocs: usize,
    pub device_allocs: usize,
    pub host_frees: usize,
    pub device_frees: usize,
    pub device_bytes: usize,
    pub peak_device_bytes: usize,
    pub copies: [usize; 5],
}

impl MemoryStats {
    pub fn copies(&self, direction: CopyDirection) -> usize {
        self.copies[direction.slot()]
    }

    pub fn total_copies(&self) -> usize {
        self.copies.iter().sum()
    }
}

/// "Accelerator" memory backed by host pages, tagged with a device ordinal.
pub struct SimulatedDevice {
    device_count: i32,
    host_allocs: AtomicUsize,
    device_allocs: AtomicUsize,
    host_frees: AtomicUsize,
    device_frees: AtomicUsize,
    device_bytes: AtomicUsize,
    peak_device_bytes: AtomicUsize,
    copies: [AtomicUsize; 5],
}

impl SimulatedDevice {
    pub fn new(device_count: i32) -> Self {
        Self {
            device_count,
            host_allocs: AtomicUsize::new(0),
            device_allocs: AtomicUsize::new(0),
            host_frees: AtomicUsize::new(0),
            device_frees: AtomicUsize::new(0),
            device_bytes: AtomicUsize::new(0),
            peak_device_bytes: AtomicUsize::new(0),
            copies: Default::default(),
        }
    }

    pub fn device_count(&self) -> i32 {
        self.device_count
    }

    pub fn stats(&self) -> MemoryStats {
        let mut copies = [0usize; 5];
        for (slot, counter) in copies.iter_mut().zip(self.copies.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        MemoryStats {
            host_allocs: self.host_allocs.load(Ordering::Relaxed),
            device_allocs: self.device_allocs.load(Ordering::Relaxed),
            host_frees: self.host_frees.load(Ordering::Relaxed),
            device_frees: self.device_frees.load(Ordering::Relaxed),
            device_bytes: self.device_bytes.load(Ordering::Relaxed),
            peak_device_bytes: self.peak_device_bytes.load(Ordering::Relaxed),
            copies,
        }
    }

    fn layout(size: usize) -> Result<Layout, MemoryError> {
        Layout::from_size_align(size, ALLOC_ALIGNMENT)
            .map_err(|e| MemoryError::Configuration(format!("invalid layout for {} bytes: {}", size, e)))
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryOps for SimulatedDevice {
    fn alloc(
        &self,
        size: usize,
        location: MemoryLocation,
        ctx: DeviceContext,
    ) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::Allocation {
                size,
                location,
                reason: "zero-sized allocation".to_string(),
            });
        }
        if location == MemoryLocation::Device {
            self.check_device(ctx.device_id)?;
        }
        let layout = Self::layout(size)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| MemoryError::Allocation {
            size,
            location,
            reason: "out of memory".to_string(),
        })?;
        match location {
            MemoryLocation::Host => {
                self.host_allocs.fetch_add(1, Ordering::Relaxed);
            }
            MemoryLocation::Device => {
                self.device_allocs.fetch_add(1, Ordering::Relaxed);
                let now = self.device_bytes.fetch_add(size, Ordering::Relaxed) + size;
                self.peak_device_bytes.fetch_max(now, Ordering::Relaxed);
            }
        }
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, location: MemoryLocation, _ctx: DeviceContext) {
        let Ok(layout) = Self::layout(size) else {
            log::error!("free: invalid layout for {} bytes, leaking", size);
            return;
        };
        // SAFETY: the caller guarantees ptr was allocated by alloc() with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        match location {
            MemoryLocation::Host => {
                self.host_frees.fetch_add(1, Ordering::Relaxed);
            }
            MemoryLocation::Device => {
                self.device_frees.fetch_add(1, Ordering::Relaxed);
                self.device_bytes.fetch_sub(size, Ordering::Relaxed);
            }
        }
    }

    unsafe fn copy(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        size: usize,
        direction: CopyDirection,
        ctx: DeviceContext,
    ) -> Result<(), MemoryError> {
        match direction {
            CopyDirection::HostToHost => {}
            _ => self.check_device(ctx.device_id).map_err(|e| MemoryError::Transfer {
                size,
                direction,
                reason: e.to_string(),
            })?,
        }
        // SAFETY: the caller guarantees both regions are valid and disjoint.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), size) };
        self.copies[direction.slot()].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check_device(&self, device_id: i32) -> Result<(), MemoryError> {
        if device_id < 0 || device_id >= self.device_count {
            return Err(MemoryError::Configuration(format!(
                "can not find device by id: {} (have {})",
                device_id, self.device_count
            )));
        }
        Ok(())
    }
}
