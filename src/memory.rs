//! The client memory bridge contract (§4.6).
//!
//! The replay core never touches client address space directly; it only
//! asks an opaque bridge to resolve client addresses into views it can
//! read, write, and mark dirty for writeback. This module defines that
//! contract plus a simple heap-backed implementation used by the CLI
//! smoke-test harness and by the test suite.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A bridge that resolves client-resident addresses into readable and/or
/// writable views.
///
/// Implementations back this with whatever the real ioctl transport uses
/// to reach into a traced client's address space (ptrace `/proc/pid/mem`,
/// a shared mapping, …); the core only ever sees this trait.
pub trait ClientMemory: fmt::Debug {
    /// Resolve `length` bytes at client address `addr`.
    ///
    /// `readable`/`writable` declare the access the core intends to perform;
    /// an implementation may use them to avoid needless copies, but must
    /// support both being true simultaneously.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be resolved (unmapped, access
    /// violation, client gone). The dispatcher treats this as "unhandled".
    fn resolve(
        &self,
        addr: u64,
        length: usize,
        readable: bool,
        writable: bool,
    ) -> Result<ClientView, MemoryError>;
}

/// Failure to resolve a range of client memory.
#[derive(Debug, thiserror::Error)]
#[error("failed to resolve {length} bytes at client address {addr:#x}")]
pub struct MemoryError {
    pub addr: u64,
    pub length: usize,
}

/// A bidirectional view over a resolved range of client memory.
///
/// Cloning a view is cheap; all clones observe the same backing bytes and
/// dirty flag, mirroring how a handle borrowed from a handler-owned
/// address-space mapping would behave.
#[derive(Clone)]
pub struct ClientView {
    client_addr: u64,
    bytes: Rc<RefCell<Vec<u8>>>,
    dirty: Rc<RefCell<bool>>,
    flush: Rc<dyn Fn(&[u8])>,
}

impl fmt::Debug for ClientView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientView")
            .field("client_addr", &format_args!("{:#x}", self.client_addr))
            .field("len", &self.bytes.borrow().len())
            .field("dirty", &*self.dirty.borrow())
            .finish()
    }
}

impl ClientView {
    /// Build a view backed by `bytes`, flushed back via `flush` on `dirty(true)`.
    pub fn new(client_addr: u64, bytes: Vec<u8>, flush: impl Fn(&[u8]) + 'static) -> Self {
        Self {
            client_addr,
            bytes: Rc::new(RefCell::new(bytes)),
            dirty: Rc::new(RefCell::new(false)),
            flush: Rc::new(flush),
        }
    }

    /// The client-side pointer value this view was resolved from, used as
    /// URB identity and for `set_ptr`-style fix-ups in outbound structures.
    #[must_use]
    pub const fn client_addr(&self) -> u64 {
        self.client_addr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn read(&self) -> Vec<u8> {
        self.bytes.borrow().clone()
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.bytes.borrow()[offset]
    }

    #[must_use]
    pub fn read_u32_le(&self, offset: usize) -> u32 {
        let bytes = self.bytes.borrow();
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[must_use]
    pub fn read_u64_le(&self, offset: usize) -> u64 {
        let bytes = self.bytes.borrow();
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    pub fn write_u32_le(&self, offset: usize, value: u32) {
        let mut bytes = self.bytes.borrow_mut();
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&self, offset: usize, value: u64) {
        let mut bytes = self.bytes.borrow_mut();
        bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&self, offset: usize, value: i32) {
        self.write_u32_le(offset, value as u32);
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.borrow_mut();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Write `target`'s client address into this view at `offset`, the
    /// `set_ptr`-style fix-up §4.6 requires for embedded pointers.
    pub fn set_ptr(&self, offset: usize, target: &Self) {
        let mut bytes = self.bytes.borrow_mut();
        bytes[offset..offset + 8].copy_from_slice(&target.client_addr().to_le_bytes());
    }

    /// Mark this view for writeback. `recursive` is accepted for contract
    /// compatibility; this implementation has no nested views to cascade to.
    pub fn dirty(&self, recursive: bool) {
        let _ = recursive;
        *self.dirty.borrow_mut() = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        *self.dirty.borrow()
    }

    /// Flush this view back to the client if it was marked dirty.
    pub fn flush_if_dirty(&self) {
        if *self.dirty.borrow() {
            (self.flush)(&self.bytes.borrow());
            *self.dirty.borrow_mut() = false;
        }
    }
}

/// A heap-backed [`ClientMemory`] standing in for a real client address
/// space: a single flat byte arena addressed by `u64` "pointers" that are
/// really just offsets into the arena.
///
/// Used by the CLI's recording smoke-test and by the test suite; never by
/// the core itself, which only depends on the [`ClientMemory`] trait.
#[derive(Debug, Default)]
pub struct HeapClientMemory {
    arena: Rc<RefCell<Vec<u8>>>,
}

impl HeapClientMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `bytes` in the arena and return the "client address" (really
    /// an offset) at which they live.
    pub fn alloc(&self, bytes: &[u8]) -> u64 {
        let mut arena = self.arena.borrow_mut();
        let addr = arena.len() as u64;
        arena.extend_from_slice(bytes);
        addr
    }

    #[must_use]
    pub fn read_at(&self, addr: u64, length: usize) -> Vec<u8> {
        let arena = self.arena.borrow();
        let start = addr as usize;
        arena[start..start + length].to_vec()
    }
}

impl ClientMemory for HeapClientMemory {
    fn resolve(
        &self,
        addr: u64,
        length: usize,
        _readable: bool,
        _writable: bool,
    ) -> Result<ClientView, MemoryError> {
        let start = addr as usize;
        let arena = self.arena.borrow();
        if start + length > arena.len() {
            return Err(MemoryError { addr, length });
        }
        drop(arena);
        let bytes = self.read_at(addr, length);
        let backing = Rc::clone(&self.arena);
        Ok(ClientView::new(addr, bytes, move |data| {
            let mut arena = backing.borrow_mut();
            arena[start..start + data.len()].copy_from_slice(data);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_round_trips_bytes() {
        let heap = HeapClientMemory::new();
        let addr = heap.alloc(&[1, 2, 3, 4]);
        let view = heap.resolve(addr, 4, true, true).unwrap();
        assert_eq!(view.read(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn dirty_view_flushes_on_request() {
        let heap = HeapClientMemory::new();
        let addr = heap.alloc(&[0, 0, 0, 0]);
        let view = heap.resolve(addr, 4, true, true).unwrap();
        view.write_u32_le(0, 0xdead_beef);
        view.dirty(false);
        view.flush_if_dirty();
        assert_eq!(heap.read_at(addr, 4), 0xdead_beef_u32.to_le_bytes());
    }

    #[test]
    fn resolve_out_of_range_fails() {
        let heap = HeapClientMemory::new();
        let addr = heap.alloc(&[1, 2]);
        assert!(heap.resolve(addr, 4, true, true).is_err());
    }
}
