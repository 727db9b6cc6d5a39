//! Boundary with the guest runtime.
//!
//! The guest exports a reservation entry point ([`REQUEST_EXPORT`]) that allocates
//! the requested number of bytes with its own allocator and passes the address to
//! the host import [`ACK_IMPORT`]. The host splices the shared segment into the
//! reservation and answers with `(offset << 32) | size`, locating the usable
//! shared window relative to the reservation pointer.

use memalias_common::Result;

/// Name of the guest export that reserves memory for the shared window.
pub const REQUEST_EXPORT: &str = "memalias_mem_req";

/// Name of the host import the guest calls with its reservation pointer.
pub const ACK_IMPORT: &str = "memalias_mem_ack";

/// Exit code used to terminate a guest whose memory could not be spliced.
pub const ACK_FAILURE_EXIT_CODE: u32 = 401;

/// Packs the acknowledgment answer: window offset in the high half, size in the low half.
#[inline]
pub fn pack_ack(offset: u32, size: u32) -> u64 {
    ((offset as u64) << 32) | size as u64
}

/// Splits an acknowledgment answer into `(offset, size)`.
#[inline]
pub fn unpack_ack(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Descriptor of a guest linear-memory buffer in host address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBuffer {
    /// Host address of guest offset 0.
    pub address: usize,
    /// Current length of the guest memory in bytes.
    pub len: usize,
    /// Bytes the memory may grow to without moving.
    pub capacity: usize,
}

impl LinearBuffer {
    /// The first `len` bytes of the buffer.
    ///
    /// # Safety
    ///
    /// The buffer must be mapped and readable for `len` bytes for the whole
    /// lifetime `'a`.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.len) }
    }

    /// The whole capacity of the buffer, for writing.
    ///
    /// # Safety
    ///
    /// The buffer must be mapped and writable for `capacity` bytes for the whole
    /// lifetime `'a`, and no other reference to it may be alive.
    pub unsafe fn as_capacity_mut<'a>(&self) -> &'a mut [u8] {
        if self.capacity == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.address as *mut u8, self.capacity) }
    }
}

/// Access to a guest instance's linear memory.
pub trait GuestMemory {
    /// The buffer currently backing the guest's linear memory.
    fn buffer(&self) -> LinearBuffer;

    /// Installs `buffer` as the guest's linear memory and returns the previous one.
    ///
    /// # Safety
    ///
    /// `buffer` must stay mapped for as long as the guest may touch it, and must
    /// contain the guest's memory contents.
    unsafe fn replace_buffer(&mut self, buffer: LinearBuffer) -> LinearBuffer;

    /// Aborts the guest instance with `exit_code`.
    fn terminate(&mut self, exit_code: u32);
}

/// A guest instance whose reservation entry point can be invoked by the host.
pub trait GuestInstance {
    /// Calls [`REQUEST_EXPORT`] with `size` and returns the guest's result, which
    /// is the size of the shared window it ended up with.
    fn request_memory(&mut self, size: u32) -> Result<u64>;
}

/// The host side of [`ACK_IMPORT`], as seen by a guest runtime.
pub trait AckHandler: Send + Sync {
    /// Handles the guest's acknowledgment of the reservation at `ptr` and returns
    /// the packed answer. Failures terminate the guest through `memory`.
    fn acknowledge(&self, memory: &mut dyn GuestMemory, ptr: u32) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_packing() {
        assert_eq!(pack_ack(0, 0), 0);
        assert_eq!(pack_ack(1, 2), (1u64 << 32) | 2);
        assert_eq!(unpack_ack(pack_ack(4072, 401_408)), (4072, 401_408));
        assert_eq!(unpack_ack(pack_ack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
        assert_eq!(unpack_ack(401_408), (0, 401_408));
    }

    #[test]
    fn test_empty_buffer_slices() {
        let buffer = LinearBuffer {
            address: 0,
            len: 0,
            capacity: 0,
        };
        assert!(unsafe { buffer.as_bytes() }.is_empty());
        assert!(unsafe { buffer.as_capacity_mut() }.is_empty());
    }
}
