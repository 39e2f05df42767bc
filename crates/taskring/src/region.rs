//! Lifecycle of the named shared region and its two counting semaphores.
//!
//! The host exclusively owns creation and destruction; workers attach to
//! existing objects and never unlink. All cross-process state lives behind
//! the atomic index protocol in [`crate::transport`]; nothing else in the
//! mapping is written after `create_host` returns.

use crate::error::IpcError;
use crate::slots::{
    region_size, Indices, RegionHeader, RegionLayout, ReqSlot, RespSlot, RING_MASK, SEM_REQ_NAME,
    SEM_RESP_NAME, SHM_NAME,
};
use std::ffi::CString;
use std::io;
use std::ptr::{self, addr_of, addr_of_mut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Names of the three OS objects a region is made of.
///
/// The defaults are the production names; [`RegionConfig::for_run`] derives
/// a suffixed set so tests (or a second host on the same machine) get an
/// isolated region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub shm_name: String,
    pub sem_req_name: String,
    pub sem_resp_name: String,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            shm_name: SHM_NAME.to_owned(),
            sem_req_name: SEM_REQ_NAME.to_owned(),
            sem_resp_name: SEM_RESP_NAME.to_owned(),
        }
    }
}

impl RegionConfig {
    /// Derives an isolated set of names from a run id.
    pub fn for_run(run_id: &str) -> Self {
        Self {
            shm_name: format!("{SHM_NAME}.{run_id}"),
            sem_req_name: format!("{SEM_REQ_NAME}.{run_id}"),
            sem_resp_name: format!("{SEM_RESP_NAME}.{run_id}"),
        }
    }
}

/// Which side of the protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Worker,
}

fn c_name(name: &str) -> Result<CString, IpcError> {
    CString::new(name).map_err(|_| IpcError::ResourceInit {
        op: "object name",
        source: io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL in object name"),
    })
}

/// A named POSIX counting semaphore.
///
/// `wait` retries signal-interrupted waits; the transport treats a wakeup as
/// "one item is deliverable".
#[derive(Debug)]
pub(crate) struct Semaphore {
    raw: *mut libc::sem_t,
}

// SAFETY: sem_post/sem_wait on a named semaphore are async-signal- and
// thread-safe; the raw pointer is only handed to those calls.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates the semaphore with initial count 0. Fails if it exists.
    fn create(name: &str) -> Result<Self, IpcError> {
        let c = c_name(name)?;
        // SAFETY: valid NUL-terminated name; O_EXCL so a racing second host
        // fails here instead of sharing state.
        let raw = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if raw == libc::SEM_FAILED {
            return Err(IpcError::os("sem_open(create)"));
        }
        Ok(Self { raw })
    }

    /// Opens an existing semaphore.
    fn open(name: &str) -> Result<Self, IpcError> {
        let c = c_name(name)?;
        // SAFETY: valid NUL-terminated name.
        let raw = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if raw == libc::SEM_FAILED {
            return Err(IpcError::os("sem_open(attach)"));
        }
        Ok(Self { raw })
    }

    /// Increments the count. One post per successfully enqueued slot.
    #[inline]
    pub(crate) fn post(&self) {
        // SAFETY: raw is a live semaphore until detach. The only documented
        // failure is counter overflow, which the bounded rings cannot reach.
        let rc = unsafe { libc::sem_post(self.raw) };
        debug_assert_eq!(rc, 0, "sem_post failed: {}", io::Error::last_os_error());
    }

    /// Blocks until the count is positive, then decrements it. Retries
    /// signal-interrupted waits.
    pub(crate) fn wait(&self) -> Result<(), IpcError> {
        loop {
            // SAFETY: raw is a live semaphore until detach.
            if unsafe { libc::sem_wait(self.raw) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::ResourceInit {
                op: "sem_wait",
                source: err,
            });
        }
    }

    /// Non-blocking variant: `Ok(true)` if a count was taken.
    pub(crate) fn try_wait(&self) -> Result<bool, IpcError> {
        loop {
            // SAFETY: raw is a live semaphore until detach.
            if unsafe { libc::sem_trywait(self.raw) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(IpcError::ResourceInit {
                        op: "sem_trywait",
                        source: err,
                    })
                }
            }
        }
    }

    fn close(&self) {
        // SAFETY: close is called at most once, from detach.
        unsafe {
            libc::sem_close(self.raw);
        }
    }

    fn unlink(name: &str) {
        if let Ok(c) = c_name(name) {
            // SAFETY: valid NUL-terminated name; failure (ENOENT) is fine.
            unsafe {
                libc::sem_unlink(c.as_ptr());
            }
        }
    }
}

/// A mapped shared region plus its two semaphores.
///
/// Host and every worker hold one of these over the same named objects; the
/// queue protocol lives in [`crate::transport`].
#[derive(Debug)]
pub struct SharedRegion {
    layout: *mut RegionLayout,
    fd: libc::c_int,
    pub(crate) sem_req: Semaphore,
    pub(crate) sem_resp: Semaphore,
    role: Role,
    config: RegionConfig,
    detached: AtomicBool,
}

// SAFETY: the mapping is only mutated through the atomic index protocol and
// the per-slot single-writer discipline enforced by that protocol; the
// semaphores are thread-safe. Sharing a SharedRegion across threads is how
// the host's producers and drain thread are meant to use it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates the region as the host: force-unlinks stale objects from a
    /// crashed prior run, creates and sizes the shared-memory object, maps
    /// it, placement-constructs the header and the zeroed indices, and
    /// creates both semaphores with count 0.
    ///
    /// Two hosts racing on the same names: the loser of the `O_EXCL`
    /// creation fails cleanly without corrupting the winner.
    pub fn create_host(config: RegionConfig) -> Result<Self, IpcError> {
        let shm = c_name(&config.shm_name)?;

        // Best-effort cleanup of a crashed prior run. ENOENT is the normal
        // case and ignored.
        // SAFETY: valid NUL-terminated names.
        unsafe {
            libc::shm_unlink(shm.as_ptr());
        }
        Semaphore::unlink(&config.sem_req_name);
        Semaphore::unlink(&config.sem_resp_name);

        // SAFETY: valid name; O_EXCL makes a host race lose cleanly here.
        let fd = unsafe {
            libc::shm_open(
                shm.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666 as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(IpcError::os("shm_open(create)"));
        }

        // SAFETY: fd is a fresh shm object; extending it provides zero
        // pages, which is the initial state of every slot.
        if unsafe { libc::ftruncate(fd, region_size() as libc::off_t) } == -1 {
            let err = IpcError::os("ftruncate");
            // SAFETY: fd/name were created above.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(shm.as_ptr());
            }
            return Err(err);
        }

        let layout = map_region(fd).map_err(|err| {
            // SAFETY: fd/name were created above.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(shm.as_ptr());
            }
            err
        })?;

        // Placement-construct the control block. Slots stay as the zero
        // pages ftruncate provided. Workers attach only after this returns,
        // so no ordering beyond program order is needed here.
        // SAFETY: layout points at a mapping large enough for RegionLayout.
        unsafe {
            ptr::write(addr_of_mut!((*layout).header), RegionHeader::current());
            ptr::write(addr_of_mut!((*layout).indices), Indices::zeroed());
        }

        let sem_req = Semaphore::create(&config.sem_req_name).map_err(|err| {
            // SAFETY: unwinding the mapping and object created above.
            unsafe {
                libc::munmap(layout.cast(), region_size());
                libc::close(fd);
                libc::shm_unlink(shm.as_ptr());
            }
            err
        })?;
        let sem_resp = Semaphore::create(&config.sem_resp_name).map_err(|err| {
            sem_req.close();
            Semaphore::unlink(&config.sem_req_name);
            // SAFETY: unwinding the mapping and object created above.
            unsafe {
                libc::munmap(layout.cast(), region_size());
                libc::close(fd);
                libc::shm_unlink(shm.as_ptr());
            }
            err
        })?;

        Ok(Self {
            layout,
            fd,
            sem_req,
            sem_resp,
            role: Role::Host,
            config,
            detached: AtomicBool::new(false),
        })
    }

    /// Attaches to an existing region as a worker. Validates the header and
    /// never reinitializes the indices: the host's in-flight counters must
    /// survive every attach.
    pub fn attach_worker(config: RegionConfig) -> Result<Self, IpcError> {
        let shm = c_name(&config.shm_name)?;

        // SAFETY: valid NUL-terminated name.
        let fd = unsafe { libc::shm_open(shm.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd == -1 {
            return Err(IpcError::os("shm_open(attach)"));
        }

        let layout = map_region(fd).map_err(|err| {
            // SAFETY: fd was opened above.
            unsafe {
                libc::close(fd);
            }
            err
        })?;

        // SAFETY: the header is written before any worker is spawned and
        // read-only afterwards.
        let header_check = unsafe { (*addr_of!((*layout).header)).validate() };
        if let Err(what) = header_check {
            // SAFETY: unwinding the mapping opened above.
            unsafe {
                libc::munmap(layout.cast(), region_size());
                libc::close(fd);
            }
            return Err(IpcError::LayoutMismatch(what));
        }

        let sem_req = Semaphore::open(&config.sem_req_name).map_err(|err| {
            // SAFETY: unwinding the mapping opened above.
            unsafe {
                libc::munmap(layout.cast(), region_size());
                libc::close(fd);
            }
            err
        })?;
        let sem_resp = Semaphore::open(&config.sem_resp_name).map_err(|err| {
            sem_req.close();
            // SAFETY: unwinding the mapping opened above.
            unsafe {
                libc::munmap(layout.cast(), region_size());
                libc::close(fd);
            }
            err
        })?;

        Ok(Self {
            layout,
            fd,
            sem_req,
            sem_resp,
            role: Role::Worker,
            config,
            detached: AtomicBool::new(false),
        })
    }

    /// Unmaps and closes everything; the host additionally unlinks the
    /// names. Idempotent; the second and later calls are no-ops.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }

        self.sem_req.close();
        self.sem_resp.close();

        // SAFETY: mapping and fd are live until this first detach.
        unsafe {
            libc::munmap(self.layout.cast(), region_size());
            libc::close(self.fd);
        }

        if self.role == Role::Host {
            if let Ok(shm) = c_name(&self.config.shm_name) {
                // SAFETY: valid NUL-terminated name.
                unsafe {
                    libc::shm_unlink(shm.as_ptr());
                }
            }
            Semaphore::unlink(&self.config.sem_req_name);
            Semaphore::unlink(&self.config.sem_resp_name);
        }
    }

    /// This process's side of the protocol.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The names this region was created or attached with.
    #[inline]
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn indices(&self) -> &Indices {
        // SAFETY: the indices were placement-constructed by the host before
        // any other participant existed; the reference only hands out
        // atomics.
        unsafe { &(*self.layout).indices }
    }

    /// Raw pointer to a request slot by free-running index.
    #[inline]
    pub(crate) fn req_slot(&self, idx: u64) -> *mut ReqSlot {
        // SAFETY: masked index is always within the ring array.
        unsafe {
            addr_of_mut!((*self.layout).req_ring)
                .cast::<ReqSlot>()
                .add((idx & RING_MASK) as usize)
        }
    }

    /// Raw pointer to a response slot by free-running index.
    #[inline]
    pub(crate) fn resp_slot(&self, idx: u64) -> *mut RespSlot {
        // SAFETY: masked index is always within the ring array.
        unsafe {
            addr_of_mut!((*self.layout).resp_ring)
                .cast::<RespSlot>()
                .add((idx & RING_MASK) as usize)
        }
    }
}

fn map_region(fd: libc::c_int) -> Result<*mut RegionLayout, IpcError> {
    // SAFETY: fd refers to a shm object sized to region_size() (by the host
    // ftruncate); MAP_SHARED gives every process the same physical pages.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            region_size(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(IpcError::os("mmap"));
    }
    Ok(addr.cast::<RegionLayout>())
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique_config() -> RegionConfig {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let id = SEQ.fetch_add(1, Ordering::Relaxed);
        RegionConfig::for_run(&format!("regiontest-{}-{id}", std::process::id()))
    }

    #[test]
    fn create_attach_detach_round_trip() {
        let config = unique_config();
        let host = SharedRegion::create_host(config.clone()).unwrap();
        assert_eq!(host.role(), Role::Host);

        let worker = SharedRegion::attach_worker(config).unwrap();
        assert_eq!(worker.role(), Role::Worker);

        // Host-initialized indices are visible through the worker mapping.
        assert_eq!(
            worker.indices().req_write_idx.load(Ordering::Acquire),
            0
        );

        worker.detach();
        worker.detach(); // idempotent
        host.detach();
    }

    #[test]
    fn second_host_never_shares_the_first_region() {
        let config = unique_config();
        let first = SharedRegion::create_host(config.clone()).unwrap();
        first
            .indices()
            .req_write_idx
            .store(7, Ordering::Release);

        // A second host on the same names force-unlinks the stale entries
        // and creates a fresh object. The first host's mapping must be
        // untouched: no silent sharing, no corruption.
        let second = SharedRegion::create_host(config).unwrap();
        assert_eq!(second.indices().req_write_idx.load(Ordering::Acquire), 0);
        assert_eq!(first.indices().req_write_idx.load(Ordering::Acquire), 7);

        second.detach();
        first.detach();
    }

    #[test]
    fn attach_absent_region_fails() {
        let config = unique_config();
        let err = SharedRegion::attach_worker(config).unwrap_err();
        assert!(matches!(err, IpcError::ResourceInit { .. }));
    }
}
