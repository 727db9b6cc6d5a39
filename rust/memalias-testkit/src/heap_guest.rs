use std::sync::Arc;

use memalias::{
    AckHandler, GuestInstance, GuestMemory, LinearBuffer, Result,
    error::Error,
    guest::{ACK_IMPORT, REQUEST_EXPORT, unpack_ack},
};

/// A guest whose linear memory is a heap allocation and whose allocator is a bump
/// pointer.
///
/// It mirrors what a real guest module does: its reservation entry point allocates
/// the requested bytes, calls the host acknowledgment with the pointer and keeps
/// the returned window. The buffer it reads from is whatever the host installed
/// last, so the host must keep a composition alive while the guest is used.
pub struct HeapGuest {
    original: Vec<u8>,
    buffer: LinearBuffer,
    heap_next: usize,
    host: Arc<dyn AckHandler>,
    reservation: Option<u32>,
    window: Option<(usize, usize)>,
    exit_code: Option<u32>,
}

impl HeapGuest {
    /// Offset of the first heap allocation; deliberately not page aligned.
    pub const DEFAULT_HEAP_START: usize = 1032;

    pub fn new(len: usize, host: Arc<dyn AckHandler>) -> HeapGuest {
        let mut original = vec![0u8; len];
        let buffer = LinearBuffer {
            address: original.as_mut_ptr() as usize,
            len,
            capacity: len,
        };
        HeapGuest {
            original,
            buffer,
            heap_next: Self::DEFAULT_HEAP_START,
            host,
            reservation: None,
            window: None,
            exit_code: None,
        }
    }

    pub fn with_heap_start(mut self, offset: usize) -> HeapGuest {
        self.heap_next = offset;
        self
    }

    /// The guest's linear memory as currently installed.
    pub fn bytes(&self) -> &[u8] {
        unsafe { self.buffer.as_bytes() }
    }

    /// The guest's linear memory for writing. Writes into the shared window fault.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.buffer.len;
        let bytes = unsafe { self.buffer.as_capacity_mut() };
        &mut bytes[..len]
    }

    /// Whether the guest still runs on the memory it was created with.
    pub fn uses_original_buffer(&self) -> bool {
        self.buffer.address == self.original.as_ptr() as usize
    }

    /// Allocates `size` bytes from the guest heap, 8-byte aligned.
    pub fn malloc(&mut self, size: u32) -> Option<u32> {
        let ptr = self.heap_next.next_multiple_of(8);
        let end = ptr.checked_add(size as usize)?;
        if end > self.buffer.len || ptr > u32::MAX as usize {
            return None;
        }
        self.heap_next = end;
        Some(ptr as u32)
    }

    pub fn reservation(&self) -> Option<u32> {
        self.reservation
    }

    /// `(guest offset, size)` of the shared window, once acknowledged.
    pub fn window(&self) -> Option<(usize, usize)> {
        self.window
    }

    pub fn shared_window(&self) -> Option<&[u8]> {
        let (start, size) = self.window?;
        self.bytes().get(start..start + size)
    }

    /// Sums the shared window as little-endian `u32` values.
    pub fn work(&self) -> u32 {
        self.shared_window()
            .map(|window| {
                window
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .fold(0u32, |acc, v| acc.wrapping_add(v))
            })
            .unwrap_or(0)
    }

    /// Writes the first and the last byte of the shared window.
    pub fn try_write(&mut self) {
        if let Some((start, size)) = self.window {
            let base = self.buffer.address as *mut u8;
            unsafe {
                std::ptr::write_volatile(base.add(start), 0xFF);
                std::ptr::write_volatile(base.add(start + size - 1), 42);
            }
        }
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Calls a guest export by name, the way a runtime resolves module exports.
    pub fn call_export(&mut self, name: &str, arg: u32) -> Result<u64> {
        match name {
            REQUEST_EXPORT => self.reserve_and_acknowledge(arg),
            _ => Err(Error::invalid_operation(format!("unknown guest export {name}"))),
        }
    }

    /// Calls a host import by name on behalf of the guest.
    fn call_import(&mut self, name: &str, arg: u32) -> Result<u64> {
        match name {
            ACK_IMPORT => {
                let host = Arc::clone(&self.host);
                Ok(host.acknowledge(self, arg))
            }
            _ => Err(Error::invalid_operation(format!("unknown host import {name}"))),
        }
    }

    fn reserve_and_acknowledge(&mut self, size: u32) -> Result<u64> {
        let ptr = match self.reservation {
            Some(ptr) => ptr,
            None => {
                let ptr = self
                    .malloc(size)
                    .ok_or_else(|| Error::invalid_operation("guest heap exhausted"))?;
                self.reservation = Some(ptr);
                ptr
            }
        };

        let answer = self.call_import(ACK_IMPORT, ptr)?;
        if let Some(code) = self.exit_code {
            return Err(Error::invalid_operation(format!(
                "guest terminated with exit code {code}"
            )));
        }

        // A repeated acknowledgment only reports the size.
        let (offset, size) = unpack_ack(answer);
        if self.window.is_none() {
            self.window = Some((ptr as usize + offset as usize, size as usize));
        }
        Ok(size as u64)
    }
}

impl GuestMemory for HeapGuest {
    fn buffer(&self) -> LinearBuffer {
        self.buffer
    }

    unsafe fn replace_buffer(&mut self, buffer: LinearBuffer) -> LinearBuffer {
        std::mem::replace(&mut self.buffer, buffer)
    }

    fn terminate(&mut self, exit_code: u32) {
        self.exit_code = Some(exit_code);
    }
}

impl GuestInstance for HeapGuest {
    fn request_memory(&mut self, size: u32) -> Result<u64> {
        self.call_export(REQUEST_EXPORT, size)
    }
}
