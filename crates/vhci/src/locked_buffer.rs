//! Page-locked memory descriptors
//!
//! A [`LockedBuffer`] describes a caller-owned byte range that must stay
//! resident while a transfer is in flight. Preparing it pins the backing
//! pages (pageable memory) or just records the descriptor (non-paged
//! memory, which is resident already); unpreparing undoes exactly what
//! prepare did and is safe to call any number of times.
//!
//! Anything that can be prepared implements [`Lockable`].
//! [`prepare_all`] prepares an ordered sequence of them and, if one fails,
//! unprepares the ones already prepared in reverse order before returning
//! the failure.

use common::{Error, Result};
use std::collections::BTreeMap;
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// Kind of memory backing a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Always resident; prepare only builds the descriptor
    NonPaged,
    /// Pageable; prepare locks the pages
    Paged,
    /// Stack memory, locked like pageable memory
    Stack,
}

impl MemoryKind {
    pub const fn is_pageable(self) -> bool {
        !matches!(self, Self::NonPaged)
    }
}

/// How the transfer accesses the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    /// The buffer is read (outgoing data)
    Read,
    /// The buffer is written (incoming data)
    Write,
    /// Both
    Modify,
}

impl LockOperation {
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::Modify)
    }
}

/// Origin of the buffer's address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Kernel,
    /// Caller-supplied address; every page is touched before locking
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unprepared,
    /// Non-paged descriptor built, nothing to undo
    Described,
    /// Pages locked
    Locked,
}

/// Capability shared by every preparable buffer type
pub trait Lockable {
    fn prepare(&mut self, operation: LockOperation, mode: AccessMode) -> Result<()>;

    /// Undo a successful prepare; no effect otherwise
    fn unprepare(&mut self);
}

impl<T: Lockable + ?Sized> Lockable for &mut T {
    fn prepare(&mut self, operation: LockOperation, mode: AccessMode) -> Result<()> {
        (**self).prepare(operation, mode)
    }

    fn unprepare(&mut self) {
        (**self).unprepare()
    }
}

/// Descriptor for a borrowed byte range
pub struct LockedBuffer<'a> {
    addr: *mut u8,
    len: usize,
    kind: MemoryKind,
    writable: bool,
    state: LockState,
    _marker: PhantomData<&'a mut [u8]>,
}

// The descriptor only ever hands out the range through the borrow it was
// built from, so it moves between threads like that borrow would.
unsafe impl Send for LockedBuffer<'_> {}
unsafe impl Sync for LockedBuffer<'_> {}

impl<'a> LockedBuffer<'a> {
    /// Describe a read-only range
    pub fn from_slice(kind: MemoryKind, buf: &'a [u8]) -> Self {
        Self {
            addr: buf.as_ptr().cast_mut(),
            len: buf.len(),
            kind,
            writable: false,
            state: LockState::Unprepared,
            _marker: PhantomData,
        }
    }

    pub fn from_mut_slice(kind: MemoryKind, buf: &'a mut [u8]) -> Self {
        Self {
            addr: buf.as_mut_ptr(),
            len: buf.len(),
            kind,
            writable: true,
            state: LockState::Unprepared,
            _marker: PhantomData,
        }
    }

    /// Describe a raw range
    ///
    /// A null address or zero length is accepted here and rejected by
    /// [`Lockable::prepare`].
    ///
    /// # Safety
    ///
    /// A non-null `addr` must be valid for reads of `len` bytes (and for
    /// writes if `writable`) for `'a`, and must not be mutated through any
    /// other path while the descriptor exists.
    pub unsafe fn from_raw_parts(
        kind: MemoryKind,
        addr: *mut u8,
        len: usize,
        writable: bool,
    ) -> Self {
        Self {
            addr,
            len,
            kind,
            writable,
            state: LockState::Unprepared,
            _marker: PhantomData,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_prepared(&self) -> bool {
        self.state != LockState::Unprepared
    }

    /// Whether prepare pinned pages that unprepare must unlock
    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    /// Number of pages the range touches
    pub fn page_count(&self) -> usize {
        if self.addr.is_null() || self.len == 0 {
            return 0;
        }
        let (_, span) = page_span(self.addr as usize, self.len);
        span / sys::page_size()
    }

    /// Address usable for the transfer, `None` until prepared
    pub fn system_address(&self) -> Option<NonNull<u8>> {
        if self.is_prepared() {
            NonNull::new(self.addr)
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> Option<&[u8]> {
        let addr = self.system_address()?;
        // SAFETY: prepare checked the range is non-empty and non-null; the
        // constructor contract keeps it valid for `'a`.
        Some(unsafe { std::slice::from_raw_parts(addr.as_ptr(), self.len) })
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.writable {
            return None;
        }
        let addr = self.system_address()?;
        // SAFETY: as for `as_slice`, plus the range was described as writable
        // and `&mut self` makes this the only live view.
        Some(unsafe { std::slice::from_raw_parts_mut(addr.as_ptr(), self.len) })
    }

    /// Touch one byte per page, writing it back when the transfer writes
    fn probe(&self, operation: LockOperation) {
        let page = sys::page_size();
        let mut offset = 0;
        while offset < self.len {
            // SAFETY: offset < len keeps the access inside the described range.
            unsafe {
                let p = self.addr.add(offset);
                let byte = p.read_volatile();
                if operation.writes() {
                    p.write_volatile(byte);
                }
            }
            offset += page - (self.addr as usize + offset) % page;
        }
    }
}

impl Lockable for LockedBuffer<'_> {
    fn prepare(&mut self, operation: LockOperation, mode: AccessMode) -> Result<()> {
        if self.state != LockState::Unprepared {
            return Err(Error::Parameter("buffer is already prepared".into()));
        }
        if self.addr.is_null() {
            return Err(Error::Parameter("null buffer address".into()));
        }
        if self.len == 0 {
            return Err(Error::Parameter("zero-length buffer".into()));
        }
        if operation.writes() && !self.writable {
            return Err(Error::Parameter(format!(
                "read-only buffer cannot be prepared for {operation:?}"
            )));
        }

        if !self.kind.is_pageable() {
            self.state = LockState::Described;
            trace!("described non-paged buffer: {} bytes", self.len);
            return Ok(());
        }

        if mode == AccessMode::User {
            self.probe(operation);
        }

        let (start, span) = page_span(self.addr as usize, self.len);
        pin_pages(start, span).map_err(|e| {
            Error::Resource(format!("failed to lock {} bytes: {}", self.len, e))
        })?;

        self.state = LockState::Locked;
        trace!(
            "locked {:?} buffer: {} bytes over {} pages",
            self.kind,
            self.len,
            span / sys::page_size()
        );
        Ok(())
    }

    fn unprepare(&mut self) {
        if self.state == LockState::Locked {
            let (start, span) = page_span(self.addr as usize, self.len);
            if let Err(e) = unpin_pages(start, span) {
                warn!("failed to unlock {} bytes: {}", self.len, e);
            }
        }
        self.state = LockState::Unprepared;
    }
}

impl Drop for LockedBuffer<'_> {
    fn drop(&mut self) {
        self.unprepare();
    }
}

impl std::fmt::Debug for LockedBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("kind", &self.kind)
            .field("writable", &self.writable)
            .field("state", &self.state)
            .finish()
    }
}

/// Page-aligned start and length covering `[addr, addr + len)`
fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = sys::page_size();
    let start = addr & !(page - 1);
    let end = (addr + len).div_ceil(page) * page;
    (start, end - start)
}

/// Lock counts of pinned pages, keyed by page address
///
/// `mlock` does not nest, so a page is unlocked only when the last buffer
/// over it is unprepared.
static PINNED: Mutex<BTreeMap<usize, u32>> = Mutex::new(BTreeMap::new());

fn pinned() -> MutexGuard<'static, BTreeMap<usize, u32>> {
    PINNED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pin every page of a page-aligned span, or none of them
fn pin_pages(start: usize, span: usize) -> io::Result<()> {
    let page = sys::page_size();
    let mut pinned = pinned();

    for addr in (start..start + span).step_by(page) {
        let count = pinned.get(&addr).copied().unwrap_or(0);
        if count == 0 {
            if let Err(e) = sys::lock(addr, page) {
                for done in (start..addr).step_by(page) {
                    if let Err(ue) = unpin_page(&mut pinned, done, page) {
                        warn!("failed to unlock page {:#x}: {}", done, ue);
                    }
                }
                return Err(e);
            }
        }
        pinned.insert(addr, count + 1);
    }
    Ok(())
}

fn unpin_pages(start: usize, span: usize) -> io::Result<()> {
    let page = sys::page_size();
    let mut pinned = pinned();

    let mut result = Ok(());
    for addr in (start..start + span).step_by(page) {
        if let Err(e) = unpin_page(&mut pinned, addr, page) {
            result = Err(e);
        }
    }
    result
}

fn unpin_page(pinned: &mut BTreeMap<usize, u32>, addr: usize, page: usize) -> io::Result<()> {
    match pinned.get(&addr).copied() {
        Some(count) if count > 1 => {
            pinned.insert(addr, count - 1);
            Ok(())
        }
        Some(_) => {
            pinned.remove(&addr);
            sys::unlock(addr, page)
        }
        None => Ok(()),
    }
}

/// Prepare every item in order
///
/// Stops at the first failure; items prepared before it are unprepared in
/// reverse order and the failure is returned. Nothing stays prepared on
/// error.
pub fn prepare_all<T: Lockable>(
    operation: LockOperation,
    mode: AccessMode,
    items: &mut [T],
) -> Result<()> {
    for i in 0..items.len() {
        if let Err(e) = items[i].prepare(operation, mode) {
            for done in items[..i].iter_mut().rev() {
                done.unprepare();
            }
            return Err(e);
        }
    }
    Ok(())
}

pub fn unprepare_all<T: Lockable>(items: &mut [T]) {
    for item in items.iter_mut() {
        item.unprepare();
    }
}

/// Total byte length of a buffer list
pub fn list_size(buffers: &[LockedBuffer<'_>]) -> usize {
    buffers.iter().map(LockedBuffer::len).sum()
}

/// Ordered list of buffers sent or received as one transfer
#[derive(Debug, Default)]
pub struct BufferChain<'a> {
    buffers: Vec<LockedBuffer<'a>>,
}

impl<'a> BufferChain<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: LockedBuffer<'a>) {
        self.buffers.push(buffer);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn total_len(&self) -> usize {
        list_size(&self.buffers)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockedBuffer<'a>> {
        self.buffers.iter()
    }
}

impl Lockable for BufferChain<'_> {
    fn prepare(&mut self, operation: LockOperation, mode: AccessMode) -> Result<()> {
        prepare_all(operation, mode, self.buffers.as_mut_slice())
    }

    fn unprepare(&mut self) {
        unprepare_all(self.buffers.as_mut_slice());
    }
}

#[cfg(unix)]
mod sys {
    use nix::sys::mman;
    use nix::unistd::{SysconfVar, sysconf};
    use std::ffi::c_void;
    use std::io;
    use std::ptr::NonNull;

    const FALLBACK_PAGE_SIZE: usize = 4096;

    pub fn page_size() -> usize {
        match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as usize,
            _ => FALLBACK_PAGE_SIZE,
        }
    }

    fn page_ptr(addr: usize) -> io::Result<NonNull<c_void>> {
        NonNull::new(addr as *mut c_void)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null page address"))
    }

    pub fn lock(addr: usize, len: usize) -> io::Result<()> {
        let ptr = page_ptr(addr)?;
        // SAFETY: mlock only changes residency of mapped pages; it never
        // dereferences the range.
        unsafe { mman::mlock(ptr, len) }.map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    pub fn unlock(addr: usize, len: usize) -> io::Result<()> {
        let ptr = page_ptr(addr)?;
        // SAFETY: as for `lock`.
        unsafe { mman::munlock(ptr, len) }.map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;

    pub fn page_size() -> usize {
        4096
    }

    pub fn lock(_addr: usize, _len: usize) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "page locking is not supported on this platform",
        ))
    }

    pub fn unlock(_addr: usize, _len: usize) -> io::Result<()> {
        Ok(())
    }
}
