//! The exokernel model: process table, mapping syscalls, fault dispatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use exofork_abi::layout::{PAGE_SIZE, TABLE_SPAN, USER_TOP, UXSTACK_BASE};
use exofork_abi::{
    CreateChild, ErrorCode, Exokernel, FaultCause, FaultContext, FaultUpcall, PageNumber,
    PagePerms, ProcId, ProcStatus, Result, SysError, VirtAddr,
};

use crate::frames::{FrameId, FrameTable};

/// Frames available before the model reports `OutOfMemory`.
pub const DEFAULT_FRAME_LIMIT: usize = 4096;

/// Identifier of the boot process a fresh model starts with.
pub const FIRST_PID: u32 = 1;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    frame: FrameId,
    perms: PagePerms,
}

struct EnvState {
    pages: BTreeMap<PageNumber, Mapping>,
    status: ProcStatus,
    upcall: Option<FaultUpcall>,
    parent: ProcId,
}

impl EnvState {
    fn new(status: ProcStatus, parent: ProcId) -> Self {
        EnvState {
            pages: BTreeMap::new(),
            status,
            upcall: None,
            parent,
        }
    }
}

struct SimState {
    frames: FrameTable,
    envs: HashMap<ProcId, EnvState>,
    current: ProcId,
    next_pid: u32,
    in_upcall: bool,
}

impl SimState {
    fn resolve(&self, target: ProcId) -> ProcId {
        if target.is_self_alias() {
            self.current
        } else {
            target
        }
    }

    /// Resolves `target` and checks the caller may operate on it: a process
    /// may address itself and its direct children, nothing else.
    fn check_target(&self, target: ProcId) -> Result<ProcId> {
        let pid = self.resolve(target);
        let env = self.envs.get(&pid).ok_or_else(|| {
            SysError::with_message(ErrorCode::NotFound, "no such process")
                .with_context(pid.as_u32() as u64)
        })?;
        if pid != self.current && env.parent != self.current {
            return Err(SysError::with_message(
                ErrorCode::PermissionDenied,
                "target is neither the caller nor a child of the caller",
            ));
        }
        Ok(pid)
    }

    fn env(&self, pid: ProcId) -> &EnvState {
        self.envs.get(&pid).expect("validated process vanished")
    }

    fn env_mut(&mut self, pid: ProcId) -> &mut EnvState {
        self.envs.get_mut(&pid).expect("validated process vanished")
    }

    fn current_env(&self) -> &EnvState {
        self.envs.get(&self.current).expect("current process vanished")
    }

    /// Installs a mapping whose frame reference is already accounted for,
    /// releasing whatever the slot previously held.
    fn install_owned(&mut self, pid: ProcId, page: PageNumber, frame: FrameId, perms: PagePerms) {
        let env = self.envs.get_mut(&pid).expect("validated process vanished");
        if let Some(old) = env.pages.insert(page, Mapping { frame, perms }) {
            self.frames.release(old.frame);
        }
    }
}

fn check_va(va: VirtAddr) -> Result<PageNumber> {
    if !va.is_page_aligned() {
        return Err(SysError::with_message(
            ErrorCode::InvalidArgument,
            "address is not page-aligned",
        ));
    }
    if va.as_u64() >= USER_TOP {
        return Err(SysError::with_message(
            ErrorCode::InvalidArgument,
            "address is above the user range",
        ));
    }
    Ok(va.page_number())
}

fn check_perms(perms: PagePerms) -> Result<()> {
    if !perms.is_user_present() {
        return Err(SysError::with_message(
            ErrorCode::InvalidArgument,
            "mapping must be present and user-accessible",
        ));
    }
    if !PagePerms::MAPPABLE.contains(perms) {
        return Err(SysError::with_message(
            ErrorCode::InvalidArgument,
            "permission bits outside the mappable set",
        ));
    }
    Ok(())
}

/// Counters for kernel-visible events.
pub struct SimStats {
    faults_delivered: AtomicUsize,
    frames_allocated: AtomicUsize,
    pages_mapped: AtomicUsize,
    pages_unmapped: AtomicUsize,
}

impl SimStats {
    const fn new() -> Self {
        SimStats {
            faults_delivered: AtomicUsize::new(0),
            frames_allocated: AtomicUsize::new(0),
            pages_mapped: AtomicUsize::new(0),
            pages_unmapped: AtomicUsize::new(0),
        }
    }

    fn inc_faults_delivered(&self) {
        self.faults_delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_frames_allocated(&self) {
        self.frames_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_pages_mapped(&self) {
        self.pages_mapped.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_pages_unmapped(&self) {
        self.pages_unmapped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn faults_delivered(&self) -> usize {
        self.faults_delivered.load(Ordering::Relaxed)
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated.load(Ordering::Relaxed)
    }

    pub fn pages_mapped(&self) -> usize {
        self.pages_mapped.load(Ordering::Relaxed)
    }

    pub fn pages_unmapped(&self) -> usize {
        self.pages_unmapped.load(Ordering::Relaxed)
    }
}

/// The in-memory exokernel.
///
/// All state sits behind one lock; the lock is never held across an upcall
/// invocation, so a fault handler is free to issue further calls.
pub struct SimKernel {
    state: Mutex<SimState>,
    stats: SimStats,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::with_frame_limit(DEFAULT_FRAME_LIMIT)
    }

    pub fn with_frame_limit(limit: usize) -> Self {
        let boot = ProcId::new(FIRST_PID);
        let mut envs = HashMap::new();
        envs.insert(boot, EnvState::new(ProcStatus::Runnable, boot));
        SimKernel {
            state: Mutex::new(SimState {
                frames: FrameTable::new(limit),
                envs,
                current: boot,
                next_pid: FIRST_PID + 1,
                in_upcall: false,
            }),
            stats: SimStats::new(),
        }
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    // ── Driver surface (the "scheduler") ────────────────────────────────

    /// Identity of the process currently executing.
    pub fn current(&self) -> ProcId {
        self.state.lock().current
    }

    /// Switches execution to `pid`. Panics if `pid` does not exist or is
    /// not runnable; the model has no scheduler to queue it on.
    pub fn set_current(&self, pid: ProcId) {
        let mut st = self.state.lock();
        let env = st.envs.get(&pid).expect("switching to an unknown process");
        assert!(
            env.status == ProcStatus::Runnable,
            "switching to a process that is not runnable"
        );
        st.current = pid;
    }

    // ── Inspection hooks for tests ──────────────────────────────────────

    pub fn proc_count(&self) -> usize {
        self.state.lock().envs.len()
    }

    pub fn status_of(&self, pid: ProcId) -> Option<ProcStatus> {
        self.state.lock().envs.get(&pid).map(|env| env.status)
    }

    pub fn has_upcall(&self, pid: ProcId) -> bool {
        self.state
            .lock()
            .envs
            .get(&pid)
            .map(|env| env.upcall.is_some())
            .unwrap_or(false)
    }

    /// Leaf permissions of `page` in `pid`'s space; empty if unmapped.
    pub fn perms_of(&self, pid: ProcId, page: PageNumber) -> PagePerms {
        self.state
            .lock()
            .envs
            .get(&pid)
            .and_then(|env| env.pages.get(&page))
            .map(|mapping| mapping.perms)
            .unwrap_or(PagePerms::empty())
    }

    /// Frame backing `va` in `pid`'s space.
    pub fn frame_of(&self, pid: ProcId, va: VirtAddr) -> Option<FrameId> {
        self.state
            .lock()
            .envs
            .get(&pid)
            .and_then(|env| env.pages.get(&va.page_number()))
            .map(|mapping| mapping.frame)
    }

    pub fn frame_refs(&self, frame: FrameId) -> usize {
        self.state.lock().frames.refs(frame)
    }

    pub fn live_frames(&self) -> usize {
        self.state.lock().frames.live()
    }

    pub fn mapped_pages(&self, pid: ProcId) -> Vec<PageNumber> {
        self.state
            .lock()
            .envs
            .get(&pid)
            .map(|env| env.pages.keys().copied().collect())
            .unwrap_or_default()
    }

    // ── Fault dispatch ──────────────────────────────────────────────────

    /// Delivers a page fault to the current process's upcall and returns
    /// once the upcall completes. Delivery requires a registered upcall and
    /// a writable exception stack; nesting is refused.
    fn deliver_fault(&self, va: VirtAddr, cause: FaultCause) -> Result<()> {
        let upcall = {
            let mut st = self.state.lock();
            if st.in_upcall {
                return Err(SysError::with_message(
                    ErrorCode::InvalidState,
                    "page fault while a fault upcall is running",
                ));
            }
            let env = st.current_env();
            let upcall = env.upcall.ok_or(SysError::with_message(
                ErrorCode::InvalidState,
                "page fault with no upcall registered",
            ))?;
            let uxstack_ok = env
                .pages
                .get(&UXSTACK_BASE.page_number())
                .map(|m| m.perms.contains(PagePerms::RW))
                .unwrap_or(false);
            if !uxstack_ok {
                return Err(SysError::with_message(
                    ErrorCode::InvalidState,
                    "exception stack is not mapped writable",
                ));
            }
            st.in_upcall = true;
            upcall
        };

        self.stats.inc_faults_delivered();
        log::debug!("fault upcall: va={:#x} cause={:?}", va.as_u64(), cause);
        upcall(self, &FaultContext { va, cause });
        self.state.lock().in_upcall = false;
        Ok(())
    }

    fn read_in_page(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        for attempt in 0..2 {
            let cause = {
                let st = self.state.lock();
                match st.current_env().pages.get(&va.page_number()) {
                    Some(mapping) if mapping.perms.is_user_present() => {
                        let start = va.page_offset();
                        let data = st.frames.data(mapping.frame);
                        buf.copy_from_slice(&data[start..start + buf.len()]);
                        return Ok(());
                    }
                    Some(_) => FaultCause::USER | FaultCause::PRESENT,
                    None => FaultCause::USER,
                }
            };
            if attempt == 1 {
                return Err(SysError::with_message(
                    ErrorCode::PermissionDenied,
                    "read still faults after the upcall",
                ));
            }
            self.deliver_fault(va, cause)?;
        }
        unreachable!()
    }

    fn write_in_page(&self, va: VirtAddr, bytes: &[u8]) -> Result<()> {
        for attempt in 0..2 {
            let cause = {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                let env = st.envs.get(&st.current).expect("current process vanished");
                match env.pages.get(&va.page_number()) {
                    Some(mapping) if mapping.perms.contains(PagePerms::RW) => {
                        let start = va.page_offset();
                        let data = st.frames.data_mut(mapping.frame);
                        data[start..start + bytes.len()].copy_from_slice(bytes);
                        return Ok(());
                    }
                    Some(_) => FaultCause::WRITE | FaultCause::USER | FaultCause::PRESENT,
                    None => FaultCause::WRITE | FaultCause::USER,
                }
            };
            if attempt == 1 {
                return Err(SysError::with_message(
                    ErrorCode::PermissionDenied,
                    "write still faults after the upcall",
                ));
            }
            self.deliver_fault(va, cause)?;
        }
        unreachable!()
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Exokernel for SimKernel {
    fn page_alloc(&self, target: ProcId, va: VirtAddr, perms: PagePerms) -> Result<()> {
        let page = check_va(va)?;
        check_perms(perms)?;
        {
            let mut st = self.state.lock();
            let pid = st.check_target(target)?;
            let frame = st.frames.alloc()?;
            st.install_owned(pid, page, frame, perms);
            log::trace!("page_alloc: {} va={:#x} {:?}", pid, va.as_u64(), perms);
        }
        self.stats.inc_frames_allocated();
        self.stats.inc_pages_mapped();
        Ok(())
    }

    fn page_map(
        &self,
        src: ProcId,
        src_va: VirtAddr,
        dst: ProcId,
        dst_va: VirtAddr,
        perms: PagePerms,
    ) -> Result<()> {
        let src_page = check_va(src_va)?;
        let dst_page = check_va(dst_va)?;
        check_perms(perms)?;
        {
            let mut st = self.state.lock();
            let src_pid = st.check_target(src)?;
            let dst_pid = st.check_target(dst)?;
            let mapping = st
                .env(src_pid)
                .pages
                .get(&src_page)
                .copied()
                .ok_or(SysError::with_message(
                    ErrorCode::NotMapped,
                    "no mapping at the source address",
                ))?;
            if perms.is_writable() && !mapping.perms.is_writable() {
                return Err(SysError::with_message(
                    ErrorCode::InvalidArgument,
                    "write access requested on a read-only source mapping",
                ));
            }
            st.frames.retain(mapping.frame);
            st.install_owned(dst_pid, dst_page, mapping.frame, perms);
        }
        self.stats.inc_pages_mapped();
        Ok(())
    }

    fn page_unmap(&self, target: ProcId, va: VirtAddr) -> Result<()> {
        let page = check_va(va)?;
        let removed = {
            let mut st = self.state.lock();
            let pid = st.check_target(target)?;
            let removed = st.env_mut(pid).pages.remove(&page);
            if let Some(old) = removed {
                st.frames.release(old.frame);
            }
            removed.is_some()
        };
        if removed {
            self.stats.inc_pages_unmapped();
        }
        Ok(())
    }

    fn create_child(&self) -> Result<CreateChild> {
        // The register file would be snapshotted here; the model has no
        // instruction stream, so the new process only ever runs through the
        // driver, and the caller always takes the Spawned path.
        let mut st = self.state.lock();
        let parent = st.current;
        let pid = ProcId::new(st.next_pid);
        st.next_pid += 1;
        st.envs.insert(pid, EnvState::new(ProcStatus::NotRunnable, parent));
        log::debug!("create_child: {} spawned by {}", pid, parent);
        Ok(CreateChild::Spawned(pid))
    }

    fn set_status(&self, target: ProcId, status: ProcStatus) -> Result<()> {
        let mut st = self.state.lock();
        let pid = st.check_target(target)?;
        st.env_mut(pid).status = status;
        Ok(())
    }

    fn set_fault_upcall(&self, target: ProcId, upcall: FaultUpcall) -> Result<()> {
        let mut st = self.state.lock();
        let pid = st.check_target(target)?;
        st.env_mut(pid).upcall = Some(upcall);
        Ok(())
    }

    fn getpid(&self) -> ProcId {
        self.state.lock().current
    }

    fn fault_upcall(&self) -> Option<FaultUpcall> {
        self.state.lock().current_env().upcall
    }

    fn table_present(&self, page: PageNumber) -> bool {
        let group = page.table_group();
        let start = PageNumber::new(group * TABLE_SPAN);
        let end = PageNumber::new((group + 1) * TABLE_SPAN);
        self.state
            .lock()
            .current_env()
            .pages
            .range(start..end)
            .next()
            .is_some()
    }

    fn page_perms(&self, page: PageNumber) -> PagePerms {
        self.state
            .lock()
            .current_env()
            .pages
            .get(&page)
            .map(|mapping| mapping.perms)
            .unwrap_or(PagePerms::empty())
    }

    fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = VirtAddr::new(va.as_u64() + done as u64);
            let step = (PAGE_SIZE - cur.page_offset()).min(buf.len() - done);
            self.read_in_page(cur, &mut buf[done..done + step])?;
            done += step;
        }
        Ok(())
    }

    fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let cur = VirtAddr::new(va.as_u64() + done as u64);
            let step = (PAGE_SIZE - cur.page_offset()).min(bytes.len() - done);
            self.write_in_page(cur, &bytes[done..done + step])?;
            done += step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: u64) -> VirtAddr {
        VirtAddr::new(addr)
    }

    #[test]
    fn alloc_write_read_round_trip() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RW).unwrap();
        k.write_bytes(va(0x1234), &[0xde, 0xad]).unwrap();
        let mut buf = [0u8; 2];
        k.read_bytes(va(0x1234), &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad]);
    }

    #[test]
    fn map_shares_the_frame_and_counts_references() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RW).unwrap();
        let frame = k.frame_of(k.current(), va(0x1000)).unwrap();
        assert_eq!(k.frame_refs(frame), 1);

        k.page_map(ProcId::SELF, va(0x1000), ProcId::SELF, va(0x2000), PagePerms::RW)
            .unwrap();
        assert_eq!(k.frame_refs(frame), 2);

        k.page_unmap(ProcId::SELF, va(0x2000)).unwrap();
        assert_eq!(k.frame_refs(frame), 1);
    }

    #[test]
    fn remap_in_place_keeps_the_frame() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RW).unwrap();
        let frame = k.frame_of(k.current(), va(0x1000)).unwrap();

        k.page_map(ProcId::SELF, va(0x1000), ProcId::SELF, va(0x1000), PagePerms::RO)
            .unwrap();
        assert_eq!(k.frame_of(k.current(), va(0x1000)), Some(frame));
        assert_eq!(k.frame_refs(frame), 1);
        assert_eq!(k.perms_of(k.current(), va(0x1000).page_number()), PagePerms::RO);
    }

    #[test]
    fn replacing_a_mapping_releases_the_old_frame() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RW).unwrap();
        let old = k.frame_of(k.current(), va(0x1000)).unwrap();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RW).unwrap();
        assert_eq!(k.frame_refs(old), 0);
        assert_eq!(k.live_frames(), 1);
    }

    #[test]
    fn map_from_unmapped_source_fails() {
        let k = SimKernel::new();
        let err = k
            .page_map(ProcId::SELF, va(0x1000), ProcId::SELF, va(0x2000), PagePerms::RO)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotMapped);
    }

    #[test]
    fn cannot_gain_write_access_from_a_read_only_mapping() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RO).unwrap();
        let err = k
            .page_map(ProcId::SELF, va(0x1000), ProcId::SELF, va(0x1000), PagePerms::RW)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn unaligned_and_out_of_range_addresses_are_rejected() {
        let k = SimKernel::new();
        let unaligned = k.page_alloc(ProcId::SELF, va(0x1001), PagePerms::RW);
        assert_eq!(unaligned.unwrap_err().code(), ErrorCode::InvalidArgument);
        let above = k.page_alloc(ProcId::SELF, va(USER_TOP), PagePerms::RW);
        assert_eq!(above.unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn kernel_only_bits_are_rejected() {
        let k = SimKernel::new();
        let noisy = PagePerms::RW | PagePerms::from_bits_retain(1 << 8);
        let err = k.page_alloc(ProcId::SELF, va(0x1000), noisy).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn targets_are_limited_to_self_and_children() {
        let k = SimKernel::new();
        let child = match k.create_child().unwrap() {
            CreateChild::Spawned(id) => id,
            CreateChild::InChild => unreachable!(),
        };
        k.page_alloc(child, va(0x1000), PagePerms::RW).unwrap();

        // A sibling of the caller is out of reach.
        let sibling = match k.create_child().unwrap() {
            CreateChild::Spawned(id) => id,
            CreateChild::InChild => unreachable!(),
        };
        k.set_status(child, ProcStatus::Runnable).unwrap();
        k.set_current(child);
        let err = k.page_alloc(sibling, va(0x1000), PagePerms::RW).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn write_fault_without_upcall_is_an_error() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RO).unwrap();
        let err = k.write_bytes(va(0x1000), &[1]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(k.stats().faults_delivered(), 0);
    }

    fn widen_upcall(sys: &dyn Exokernel, utf: &FaultContext) {
        // Test upcall: promote the faulting page in place.
        let base = utf.va.page_base();
        sys.page_alloc(ProcId::SELF, VirtAddr::new(0x7000), PagePerms::RW)
            .unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        sys.read_bytes(base, &mut buf).unwrap();
        sys.write_bytes(VirtAddr::new(0x7000), &buf).unwrap();
        sys.page_map(
            ProcId::SELF,
            VirtAddr::new(0x7000),
            ProcId::SELF,
            base,
            PagePerms::RW,
        )
        .unwrap();
        sys.page_unmap(ProcId::SELF, VirtAddr::new(0x7000)).unwrap();
    }

    #[test]
    fn upcall_requires_an_exception_stack() {
        let k = SimKernel::new();
        k.page_alloc(ProcId::SELF, va(0x1000), PagePerms::RO).unwrap();
        k.install_local_fault_handler(widen_upcall).unwrap();

        let err = k.write_bytes(va(0x1000), &[1]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        k.page_alloc(ProcId::SELF, UXSTACK_BASE, PagePerms::RW).unwrap();
        k.write_bytes(va(0x1000), &[1]).unwrap();
        assert_eq!(k.stats().faults_delivered(), 1);
        let mut buf = [0u8; 1];
        k.read_bytes(va(0x1000), &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }
}
