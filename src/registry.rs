//! Fixed-capacity table of active regions and the operations that
//! dispatch requests across them.
//!
//! The registry is the only allocator state living outside the mappings
//! themselves. Allocation scans the slots in order, so older regions fill
//! up first; when every region is out of room a new mapping is acquired
//! and installed in the first empty slot. Releasing a chunk runs the scan
//! the other way around, locating the region whose address range contains
//! the pointer.

use std::ptr::{self, NonNull};

use crate::freeblock::{FREE_BLOCK_SIZE, SIZE_FIELD};
use crate::kernel;
use crate::region::{REGION_HEADER_SIZE, Region};
use crate::utils::{align, die, raw_stderr};

/// Upper bound on simultaneously held OS mappings.
#[cfg(not(feature = "test_only_small_constants"))]
pub const MAX_REGIONS: usize = 4096;
#[cfg(feature = "test_only_small_constants")]
pub const MAX_REGIONS: usize = 8;

/// Mapping size requested from the OS whenever a new region is needed and
/// the triggering request does not demand more. Mapping calls are slow, so
/// one region has to amortize many allocations.
#[cfg(not(feature = "test_only_small_constants"))]
pub const DEFAULT_REGION_BYTES: usize = 262_144;
#[cfg(feature = "test_only_small_constants")]
pub const DEFAULT_REGION_BYTES: usize = 4096;

/// Granule every chunk size is rounded up to. Payload pointers inherit
/// this alignment, which satisfies any scalar type.
pub const ALIGNMENT: usize = std::mem::size_of::<usize>();

pub(crate) struct Registry {
    /// Active regions by slot. `None` slots are free for future mappings.
    slots: [Option<NonNull<Region>>; MAX_REGIONS],
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; MAX_REGIONS],
        }
    }

    /// Serves `size` payload bytes from the first region with room,
    /// mapping a new region when none has any.
    ///
    /// Returns `None` for zero-sized requests, when the OS is out of
    /// memory, and when the registry itself is full.
    pub(crate) unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if size > usize::MAX - (ALIGNMENT - 1) {
            return None;
        }
        let size = align(size, ALIGNMENT);

        for slot in self.slots.iter() {
            if let Some(mut region) = *slot {
                if let Some(payload) = unsafe { region.as_mut().allocate(size) } {
                    return Some(payload);
                }
            }
        }

        // Every active region is out of room, grow by one mapping.
        let index = self.slots.iter().position(Option::is_none)?;
        let mapping_bytes = Self::region_bytes_for(size)?;
        let buffer = unsafe { kernel::request_memory(mapping_bytes)? };

        let mut region = unsafe { Region::init(buffer, mapping_bytes) };
        self.slots[index] = Some(region);

        // The fresh region was sized for this request, so it cannot miss.
        unsafe { region.as_mut().allocate(size) }
    }

    /// Serves `count * size` zeroed payload bytes.
    ///
    /// The product is computed with overflow detection; a wrapped product
    /// would silently hand back a chunk far smaller than the caller asked
    /// for. On overflow nothing is allocated and no mapping is requested.
    pub(crate) unsafe fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let payload = unsafe { self.allocate(total)? };

        // Recycled chunks keep their previous contents, only fresh
        // mappings arrive zeroed. Clear unconditionally.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, total) };

        Some(payload)
    }

    /// Moves the chunk behind `old` into a fresh chunk of `size` bytes,
    /// preserving the leading `min(old size, size)` payload bytes.
    ///
    /// A null `old` degenerates to a plain allocation and a zero `size`
    /// to a release. Shrinking in place is never attempted. When the
    /// fresh allocation fails the old chunk stays valid and null is
    /// returned.
    pub(crate) unsafe fn resize(&mut self, old: *mut u8, size: usize) -> *mut u8 {
        if old.is_null() {
            if size == 0 {
                return ptr::null_mut();
            }
            return match unsafe { self.allocate(size) } {
                Some(payload) => payload.as_ptr(),
                None => ptr::null_mut(),
            };
        }

        if size == 0 {
            unsafe { self.free(old) };
            return ptr::null_mut();
        }

        unsafe {
            let old_data_size = old.sub(SIZE_FIELD).cast::<usize>().read();

            let Some(fresh) = self.allocate(size) else {
                return ptr::null_mut();
            };

            ptr::copy_nonoverlapping(old, fresh.as_ptr(), old_data_size.min(size));
            self.free(old);

            fresh.as_ptr()
        }
    }

    /// Returns the chunk behind `payload` to its owning region, and the
    /// region to the OS once nothing in it is allocated anymore.
    ///
    /// A null pointer is a no-op. A pointer no region contains is dropped
    /// with a diagnostic instead of corrupting a list; only a failed unmap
    /// of an empty region is fatal, because its slot could otherwise be
    /// handed out twice.
    pub(crate) unsafe fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }

        let block_addr = payload.wrapping_sub(SIZE_FIELD);
        let Some(index) = self.owner_of(block_addr) else {
            raw_stderr(c"free: pointer does not belong to any region\n");
            return;
        };

        if let Some(mut region) = self.slots[index] {
            unsafe {
                region.as_mut().release(NonNull::new_unchecked(payload));

                if region.as_ref().is_empty() {
                    let base = region.as_ptr().cast::<u8>();
                    let bytes = region.as_ref().mapping_bytes;

                    if !kernel::return_memory(base, bytes) {
                        die(c"free: the OS refused to take back an empty region\n");
                    }
                    self.slots[index] = None;
                }
            }
        }
    }

    /// Number of OS mappings currently held.
    pub(crate) fn region_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Locates the slot whose region contains `block_addr`, where
    /// `block_addr` is a chunk start. A valid chunk begins no earlier than
    /// the first byte after the region header and no later than one block
    /// header before the end of the mapping.
    fn owner_of(&self, block_addr: *mut u8) -> Option<usize> {
        let addr = block_addr as usize;

        self.slots.iter().position(|slot| match slot {
            Some(region) => unsafe {
                let base = region.as_ptr() as usize;
                let first = base + REGION_HEADER_SIZE;
                let last = base + region.as_ref().mapping_bytes - FREE_BLOCK_SIZE;
                first <= addr && addr <= last
            },
            None => false,
        })
    }

    /// Mapping size for a request of `size` payload bytes that no existing
    /// region can serve: the request plus its bookkeeping, but never less
    /// than the default region size.
    fn region_bytes_for(size: usize) -> Option<usize> {
        let needed = size.checked_add(REGION_HEADER_SIZE + FREE_BLOCK_SIZE)?;
        Some(needed.max(DEFAULT_REGION_BYTES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Payload size that consumes a default-sized region whole: the
    /// spanning free block cannot split because nothing would be left.
    const FULL_REGION: usize = DEFAULT_REGION_BYTES - REGION_HEADER_SIZE - SIZE_FIELD;

    #[test]
    fn zero_size_is_refused_without_touching_the_os() {
        let mut registry = Registry::new();

        unsafe {
            assert!(registry.allocate(0).is_none());
        }
        assert_eq!(registry.region_count(), 0);
    }

    #[test]
    fn overflowing_products_are_refused_without_touching_the_os() {
        let mut registry = Registry::new();

        unsafe {
            assert!(registry.allocate_zeroed(usize::MAX, 2).is_none());
            assert!(registry.allocate_zeroed(2, usize::MAX).is_none());
            assert!(registry.allocate(usize::MAX - 2).is_none());
        }
        assert_eq!(registry.region_count(), 0);
    }

    #[test]
    fn first_allocation_maps_one_region() {
        let mut registry = Registry::new();

        unsafe {
            let payload = registry.allocate(8).unwrap();
            assert_eq!(registry.region_count(), 1);

            registry.free(payload.as_ptr());
            assert_eq!(registry.region_count(), 0);
        }
    }

    #[test]
    fn exhausted_regions_trigger_a_second_mapping() {
        let mut registry = Registry::new();

        unsafe {
            let first = registry.allocate(FULL_REGION).unwrap();
            assert_eq!(registry.region_count(), 1);

            // The first region has no free block left, so this request
            // must land in a newly mapped region.
            let second = registry.allocate(FULL_REGION).unwrap();
            assert_eq!(registry.region_count(), 2);

            registry.free(first.as_ptr());
            assert_eq!(registry.region_count(), 1);
            registry.free(second.as_ptr());
            assert_eq!(registry.region_count(), 0);
        }
    }

    #[test]
    fn oversized_requests_get_a_matching_region() {
        let mut registry = Registry::new();

        unsafe {
            let payload = registry.allocate(4 * DEFAULT_REGION_BYTES).unwrap();
            assert_eq!(registry.region_count(), 1);

            // The chunk really offers the requested capacity.
            let data_size = payload.as_ptr().sub(SIZE_FIELD).cast::<usize>().read();
            assert!(data_size >= 4 * DEFAULT_REGION_BYTES);

            registry.free(payload.as_ptr());
            assert_eq!(registry.region_count(), 0);
        }
    }

    #[test]
    fn residual_smaller_than_a_header_is_not_split_off() {
        let mut registry = Registry::new();

        unsafe {
            // Four bytes short of filling the region: after rounding, the
            // leftover is below a block header and cannot be split off.
            let payload = registry.allocate(FULL_REGION - 4).unwrap();
            assert_eq!(registry.region_count(), 1);

            let data_size = payload.as_ptr().sub(SIZE_FIELD).cast::<usize>().read();
            let region = registry.slots[0].unwrap();

            // The chunk swallowed the whole extent, so it reports more
            // than asked and the region's free list drained.
            assert!(data_size > align(FULL_REGION - 4, ALIGNMENT));
            assert_eq!(
                data_size + SIZE_FIELD,
                region.as_ref().mapping_bytes - REGION_HEADER_SIZE
            );
            assert_eq!(region.as_ref().length, 0);

            registry.free(payload.as_ptr());
            assert_eq!(registry.region_count(), 0);
        }
    }

    #[test]
    fn foreign_pointers_are_ignored() {
        let mut registry = Registry::new();

        unsafe {
            let payload = registry.allocate(32).unwrap();
            assert_eq!(registry.region_count(), 1);

            let mut stray = 0u64;
            registry.free((&mut stray as *mut u64).cast());

            // The bogus pointer changed nothing.
            assert_eq!(registry.region_count(), 1);

            registry.free(payload.as_ptr());
            assert_eq!(registry.region_count(), 0);
        }
    }

    #[test]
    fn null_free_is_a_no_op() {
        let mut registry = Registry::new();

        unsafe {
            registry.free(ptr::null_mut());
        }
        assert_eq!(registry.region_count(), 0);
    }

    #[test]
    fn slot_order_prefers_older_regions() {
        let mut registry = Registry::new();

        unsafe {
            let first = registry.allocate(FULL_REGION).unwrap();
            let second = registry.allocate(FULL_REGION).unwrap();
            assert_eq!(registry.region_count(), 2);

            // Free the first region's only chunk. It goes back to the OS,
            // and the next allocation reuses its slot for a new mapping
            // before ever considering growing the table.
            registry.free(first.as_ptr());
            assert_eq!(registry.region_count(), 1);

            let third = registry.allocate(16).unwrap();
            assert_eq!(registry.region_count(), 2);
            assert!(registry.slots[0].is_some());

            registry.free(second.as_ptr());
            registry.free(third.as_ptr());
            assert_eq!(registry.region_count(), 0);
        }
    }

    #[cfg(feature = "test_only_small_constants")]
    #[test]
    fn full_registry_refuses_to_grow() {
        let mut registry = Registry::new();

        unsafe {
            let mut held = Vec::new();
            for _ in 0..MAX_REGIONS {
                held.push(registry.allocate(FULL_REGION).unwrap());
            }
            assert_eq!(registry.region_count(), MAX_REGIONS);

            // Every region is full and every slot is taken.
            assert!(registry.allocate(FULL_REGION).is_none());

            for payload in held {
                registry.free(payload.as_ptr());
            }
            assert_eq!(registry.region_count(), 0);
        }
    }
}
