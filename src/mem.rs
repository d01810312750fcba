use crate::error::{EmuError, Result};
use crate::paging::Paging;
use crate::{PAGE_SIZE, page_align, page_offset};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

pub type PageBytes = [u8; PAGE_SIZE as usize];

/// Host memory backing one guest physical page.
///
/// Cloning a `HostPage` is cheap and yields another handle to the same
/// bytes, so the embedder can keep its own handle to a page it inserted
/// and inspect or patch it directly. [`GuestMemory::remove`] only drops
/// the store's handle; the bytes are freed once the last handle is gone.
#[derive(Clone)]
pub struct HostPage(Arc<Mutex<Box<PageBytes>>>);

impl HostPage {
    pub fn zeroed() -> Self {
        Self(Arc::new(Mutex::new(Box::new([0; PAGE_SIZE as usize]))))
    }

    /// Create a page holding `data`, zero-padded to a full page.
    ///
    /// # Panics
    ///
    /// If `data` is longer than [`PAGE_SIZE`].
    pub fn from_bytes(data: &[u8]) -> Self {
        let page = Self::zeroed();
        page.write(0, data);
        page
    }

    fn bytes(&self) -> MutexGuard<'_, Box<PageBytes>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    ///
    /// If the range runs past the end of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert_in_page(offset, buf.len(), "HostPage::read");
        buf.copy_from_slice(&self.bytes()[offset..offset + buf.len()]);
    }

    /// Copy `data` into the page starting at `offset`.
    ///
    /// # Panics
    ///
    /// If the range runs past the end of the page.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert_in_page(offset, data.len(), "HostPage::write");
        self.bytes()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Run `f` with exclusive access to the whole page.
    ///
    /// The page stays locked while `f` runs: accessing the same page from
    /// inside `f`, through this handle or through [`GuestMemory`],
    /// deadlocks.
    pub fn with<R>(&self, f: impl FnOnce(&mut PageBytes) -> R) -> R {
        f(&mut self.bytes())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// True if both handles refer to the same host buffer.
    pub fn same_page(&self, other: &HostPage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for HostPage {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for HostPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostPage({:p})", Arc::as_ptr(&self.0))
    }
}

fn assert_in_page(offset: usize, len: usize, operation: &str) {
    assert!(
        offset + len <= PAGE_SIZE as usize,
        "{}() range {:#x}+{:#x} exceeds page size",
        operation,
        offset,
        len
    );
}

/// Bytes that can be transferred starting at `addr` before crossing into
/// the next page.
fn chunk_len(addr: u64, remaining: usize) -> usize {
    std::cmp::min(PAGE_SIZE as usize - page_offset(addr), remaining)
}

/// Serializes missing-page handler calls. The owning thread may re-enter,
/// so a handler that touches other unbacked pages resolves them inline.
#[derive(Default)]
struct FaultLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

struct FaultGuard<'a>(&'a FaultLock);

impl FaultLock {
    /// `None` if the current thread already holds the lock.
    fn enter(&self) -> Option<FaultGuard<'_>> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(me) {
            return None;
        }
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(me);
        Some(FaultGuard(self))
    }
}

impl Drop for FaultGuard<'_> {
    fn drop(&mut self) {
        *self.0.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.0.released.notify_all();
    }
}

pub type MissingPageHandler = Arc<dyn Fn(&GuestMemory, u64) + Send + Sync>;

/// Guest physical memory: the gpa -> [`HostPage`] mapping plus the
/// missing-page handler used to fill it lazily.
///
/// All methods take `&self`; the mapping is guarded by a lock so one
/// `GuestMemory` can be shared by several CPUs through an `Arc`.
#[derive(Default)]
pub struct GuestMemory {
    pages: RwLock<BTreeMap<u64, HostPage>>,
    missing_page: RwLock<Option<MissingPageHandler>>,
    fault: FaultLock,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `page` at `gpa`.
    ///
    /// If the GPA was already mapped, the mapping is replaced and the
    /// previous page is handed back.
    ///
    /// # Panics
    ///
    /// If `gpa` is not page-aligned.
    pub fn insert(&self, gpa: u64, page: HostPage) -> Option<HostPage> {
        assert_eq!(
            page_offset(gpa),
            0,
            "insert() gpa must be page-aligned: {:#x}",
            gpa
        );
        debug!(gpa = format_args!("{gpa:#x}"), "page insert");
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gpa, page)
    }

    /// Drop the mapping for the page containing `gpa`. Removing an
    /// unmapped page is a no-op.
    pub fn remove(&self, gpa: u64) -> Option<HostPage> {
        let gpa = page_align(gpa);
        let removed = self
            .pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&gpa);
        if removed.is_some() {
            debug!(gpa = format_args!("{gpa:#x}"), "page remove");
        }
        removed
    }

    pub fn contains(&self, gpa: u64) -> bool {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&page_align(gpa))
    }

    pub fn len(&self) -> usize {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mapped page addresses in ascending order.
    pub fn pages(&self) -> Vec<u64> {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Drop every mapping. The missing-page handler stays installed.
    pub fn clear(&self) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Look up the page backing `gpa`.
    ///
    /// This is a pure lookup: it never calls the missing-page handler.
    pub fn translate_physical(&self, gpa: u64) -> Result<HostPage> {
        let gpa = page_align(gpa);
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&gpa)
            .cloned()
            .ok_or(EmuError::MissingPage(gpa))
    }

    /// Install the missing-page handler, replacing any previous one.
    ///
    /// The handler is called with the page-aligned GPA of every access to an
    /// unmapped page and should map it with [`GuestMemory::insert`]. Calls
    /// are serialized across threads. No page-map lock is held while it
    /// runs, so it may insert or remove other pages and may itself fault on
    /// unbacked pages, which are resolved on the same thread.
    pub fn set_missing_page_handler<F>(&self, handler: F)
    where
        F: Fn(&GuestMemory, u64) + Send + Sync + 'static,
    {
        *self
            .missing_page
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear_missing_page_handler(&self) {
        *self
            .missing_page
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_missing_page_handler(&self) -> bool {
        self.missing_page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Look up the page backing `gpa`, giving the missing-page handler one
    /// chance to map it.
    pub fn resolve(&self, gpa: u64) -> Result<HostPage> {
        let gpa = page_align(gpa);
        if let Ok(page) = self.translate_physical(gpa) {
            return Ok(page);
        }

        let handler = self
            .missing_page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            warn!(gpa = format_args!("{gpa:#x}"), "missing page, no handler installed");
            return Err(EmuError::MissingPage(gpa));
        };

        // One handler call at a time; another thread may have resolved the
        // page while this one waited.
        let _guard = self.fault.enter();
        if let Ok(page) = self.translate_physical(gpa) {
            debug!(gpa = format_args!("{gpa:#x}"), "missing page resolved concurrently");
            return Ok(page);
        }

        debug!(gpa = format_args!("{gpa:#x}"), "calling missing-page handler");
        handler(self, gpa);

        // Exactly one retry; a handler that cannot resolve the page must not
        // be called in a loop.
        self.translate_physical(gpa).map_err(|_| {
            warn!(gpa = format_args!("{gpa:#x}"), "missing-page handler left page unresolved");
            EmuError::UnresolvedFault(gpa)
        })
    }

    /// Read `buf.len()` bytes of guest physical memory starting at `gpa`.
    ///
    /// The transfer is split at page boundaries and each page is resolved
    /// separately. On failure, chunks before the failing page have already
    /// been copied.
    pub fn read_physical(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        let mut current_addr = gpa;

        while offset < buf.len() {
            let to_copy = chunk_len(current_addr, buf.len() - offset);
            let page = self.resolve(current_addr)?;
            page.read(page_offset(current_addr), &mut buf[offset..offset + to_copy]);

            offset += to_copy;
            current_addr = current_addr.wrapping_add(to_copy as u64);
        }

        Ok(())
    }

    /// Write `data` to guest physical memory starting at `gpa`.
    ///
    /// Not atomic: if a later page cannot be resolved, bytes written to
    /// earlier pages stay written and the error is returned.
    pub fn write_physical(&self, gpa: u64, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        let mut current_addr = gpa;

        while offset < data.len() {
            let to_copy = chunk_len(current_addr, data.len() - offset);
            let page = self.resolve(current_addr)?;
            page.write(page_offset(current_addr), &data[offset..offset + to_copy]);

            offset += to_copy;
            current_addr = current_addr.wrapping_add(to_copy as u64);
        }

        Ok(())
    }

    pub fn read_phys_u8(&self, gpa: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_physical(gpa, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_phys_u16(&self, gpa: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_physical(gpa, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_phys_u32(&self, gpa: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_physical(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_phys_u64(&self, gpa: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_physical(gpa, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_phys_u8(&self, gpa: u64, value: u8) -> Result<()> {
        self.write_physical(gpa, &[value])
    }

    pub fn write_phys_u16(&self, gpa: u64, value: u16) -> Result<()> {
        self.write_physical(gpa, &value.to_le_bytes())
    }

    pub fn write_phys_u32(&self, gpa: u64, value: u32) -> Result<()> {
        self.write_physical(gpa, &value.to_le_bytes())
    }

    pub fn write_phys_u64(&self, gpa: u64, value: u64) -> Result<()> {
        self.write_physical(gpa, &value.to_le_bytes())
    }

    /// Translate `gva` to a GPA using the guest page tables described by
    /// `paging`.
    pub fn translate_virtual(&self, paging: &Paging, gva: u64) -> Result<u64> {
        paging.translate(self, gva)
    }

    /// Read guest virtual memory, translating every page the transfer
    /// touches.
    pub fn read_virtual(&self, paging: &Paging, gva: u64, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        let mut current_addr = gva;

        while offset < buf.len() {
            let to_copy = chunk_len(current_addr, buf.len() - offset);
            let gpa = paging.translate(self, current_addr)?;
            trace!(
                gva = format_args!("{current_addr:#x}"),
                gpa = format_args!("{gpa:#x}"),
                len = to_copy,
                "virtual read chunk"
            );
            self.read_physical(gpa, &mut buf[offset..offset + to_copy])?;

            offset += to_copy;
            current_addr = current_addr.wrapping_add(to_copy as u64);
        }

        Ok(())
    }

    /// Write guest virtual memory, translating every page the transfer
    /// touches. Same non-atomicity as [`GuestMemory::write_physical`].
    pub fn write_virtual(&self, paging: &Paging, gva: u64, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        let mut current_addr = gva;

        while offset < data.len() {
            let to_copy = chunk_len(current_addr, data.len() - offset);
            let gpa = paging.translate(self, current_addr)?;
            trace!(
                gva = format_args!("{current_addr:#x}"),
                gpa = format_args!("{gpa:#x}"),
                len = to_copy,
                "virtual write chunk"
            );
            self.write_physical(gpa, &data[offset..offset + to_copy])?;

            offset += to_copy;
            current_addr = current_addr.wrapping_add(to_copy as u64);
        }

        Ok(())
    }

    pub fn read_virt_u32(&self, paging: &Paging, gva: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_virtual(paging, gva, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_virt_u64(&self, paging: &Paging, gva: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_virtual(paging, gva, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_virt_u32(&self, paging: &Paging, gva: u64, value: u32) -> Result<()> {
        self.write_virtual(paging, gva, &value.to_le_bytes())
    }

    pub fn write_virt_u64(&self, paging: &Paging, gva: u64, value: u64) -> Result<()> {
        self.write_virtual(paging, gva, &value.to_le_bytes())
    }
}

impl fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMemory")
            .field("pages", &self.len())
            .field("missing_page_handler", &self.has_missing_page_handler())
            .finish()
    }
}
