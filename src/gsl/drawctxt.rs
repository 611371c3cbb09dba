#![allow(clippy::cast_possible_truncation)]

//! Draw contexts: per-client GPU state multiplexed onto one command processor.
//!
//! On the 3D core each context owns a `gpustate` block holding a register
//! shadow, a shader shadow and the save/restore command lists executed as
//! indirect buffers on a switch, plus an optional GMEM shadow the tile memory
//! is resolved into when the context is switched out. The 2D core keeps no
//! state; its contexts are plain slots.

use crate::error::{KgslError, KgslResult};
use crate::gsl::device::Device;
use crate::gsl::memory::{MemDesc, MemFlags, SharedMem};
use crate::gsl::memqueue::MemQueue;
use crate::gsl::{GslEnv, Pid};
use crate::hw::pm4::{PM4_INDIRECT_BUFFER_PFD, PM4_MEM_WRITE, nop_packet, type0_packet, type3_packet};
use crate::hw::regs::REG_SCRATCH_REG0;
use crate::hw::{DeviceId, YAMATO_GMEM_SIZE};

pub const YAMATO_CONTEXT_MAX: usize = 20;
pub const G12_CONTEXT_MAX: usize = 8;

/// Size of the per-context state block on the 3D core.
pub const CONTEXT_SIZE: u32 = 0x6000;

const REG_SHADOW_OFFSET: u32 = 0x0000;
const SHADER_SHADOW_OFFSET: u32 = 0x2000;
const CMD_OFFSET: u32 = 0x4000;
/// Bytes reserved per command list.
const CMD_LIST_STRIDE: u32 = 0x400;

/// Tags written into the shadows by the save lists.
pub const REG_SAVED_MAGIC: u32 = 0x5245_0000;
pub const SHADER_SAVED_MAGIC: u32 = 0x5348_0000;
pub const GMEM_SAVED_MAGIC: u32 = 0x474d_0000;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawCtxtFlags: u32 {
        const IN_USE = 1 << 0;
        const GMEM_SAVE = 1 << 1;
        const GMEM_RESTORE = 1 << 2;
        const SHADER_SAVE = 1 << 3;
        const SHADER_RESTORE = 1 << 4;
        const STATE_DIRTY = 1 << 5;
        /// Client asked for no driver-allocated GMEM shadow.
        const NO_GMEM_ALLOC = 1 << 6;
        const USER_GMEM_SHADOW = 1 << 7;
        /// An MMU fault was taken while this context was active.
        const FAULTED = 1 << 8;
    }
}

impl DrawCtxtFlags {
    /// Flags a client may pass at creation.
    pub const CREATE_MASK: Self = Self::NO_GMEM_ALLOC;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ContextType {
    Generic = 1,
    OpenGl = 2,
    OpenVg = 3,
}

impl ContextType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Generic),
            2 => Some(Self::OpenGl),
            3 => Some(Self::OpenVg),
            _ => None,
        }
    }
}

/// Region of GMEM a client shadow covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GmemRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Row pitch of the shadow buffer in pixels.
    pub pitch: u32,
}

impl GmemRect {
    /// Bytes of shadow needed at four bytes per pixel.
    #[must_use]
    pub fn shadow_bytes(&self) -> Option<u32> {
        self.pitch.checked_mul(self.height)?.checked_mul(4)
    }
}

/// The save/restore command lists inside `gpustate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdList {
    RegSave = 0,
    RegRestore,
    ShaderSave,
    ShaderRestore,
    GmemSave,
    GmemRestore,
}

#[derive(Debug, Clone)]
pub struct DrawContext {
    pub id: u32,
    pub pid: Pid,
    pub ctx_type: ContextType,
    pub flags: DrawCtxtFlags,
    pub gpustate: Option<MemDesc>,
    pub gmem_shadow: Option<MemDesc>,
    pub user_shadow: Option<(GmemRect, MemDesc)>,
    /// Dword length of each list written into `gpustate`.
    list_len: [u32; 6],
}

impl DrawContext {
    fn list_addr(&self, list: CmdList) -> Option<u32> {
        self.gpustate
            .map(|gs| gs.gpuaddr + CMD_OFFSET + list as u32 * CMD_LIST_STRIDE)
    }

    /// Indirect-buffer packet running `list`.
    fn ib(&self, list: CmdList) -> Option<[u32; 3]> {
        let addr = self.list_addr(list)?;
        let len = self.list_len[list as usize];
        (len > 0).then_some([type3_packet(PM4_INDIRECT_BUFFER_PFD, 2), addr, len])
    }

    /// Shadow the GMEM save list resolves into, the client's if bound.
    fn active_gmem_shadow(&self) -> Option<u32> {
        self.user_shadow
            .map(|(_, desc)| desc.gpuaddr)
            .or(self.gmem_shadow.map(|d| d.gpuaddr))
    }

    fn write_list(&mut self, sharedmem: &SharedMem, list: CmdList, words: &[u32]) -> KgslResult<()> {
        let Some(gs) = self.gpustate else {
            return Ok(());
        };
        let offset = CMD_OFFSET + list as u32 * CMD_LIST_STRIDE;
        sharedmem.write_words(&gs, offset, words)?;
        self.list_len[list as usize] = words.len() as u32;
        Ok(())
    }

    /// Builds every save/restore list for this context.
    fn build_lists(&mut self, sharedmem: &SharedMem) -> KgslResult<()> {
        let Some(gs) = self.gpustate else {
            return Ok(());
        };
        self.write_list(
            sharedmem,
            CmdList::RegSave,
            &[
                type3_packet(PM4_MEM_WRITE, 2),
                gs.gpuaddr + REG_SHADOW_OFFSET,
                REG_SAVED_MAGIC | self.id,
            ],
        )?;
        self.write_list(
            sharedmem,
            CmdList::RegRestore,
            &[type0_packet(REG_SCRATCH_REG0, 1), self.id],
        )?;
        self.write_list(
            sharedmem,
            CmdList::ShaderSave,
            &[
                type3_packet(PM4_MEM_WRITE, 2),
                gs.gpuaddr + SHADER_SHADOW_OFFSET,
                SHADER_SAVED_MAGIC | self.id,
            ],
        )?;
        self.write_list(
            sharedmem,
            CmdList::ShaderRestore,
            &[nop_packet(1), gs.gpuaddr + SHADER_SHADOW_OFFSET],
        )?;
        self.build_gmem_lists(sharedmem)
    }

    fn build_gmem_lists(&mut self, sharedmem: &SharedMem) -> KgslResult<()> {
        match self.active_gmem_shadow() {
            Some(shadow) => {
                self.write_list(
                    sharedmem,
                    CmdList::GmemSave,
                    &[type3_packet(PM4_MEM_WRITE, 2), shadow, GMEM_SAVED_MAGIC | self.id],
                )?;
                self.write_list(sharedmem, CmdList::GmemRestore, &[nop_packet(1), shadow])
            }
            None => {
                self.list_len[CmdList::GmemSave as usize] = 0;
                self.list_len[CmdList::GmemRestore as usize] = 0;
                Ok(())
            }
        }
    }

    /// Commands saving this context as it is switched out.
    fn save_cmds(&mut self) -> Vec<u32> {
        let mut cmds = Vec::new();
        cmds.extend(self.ib(CmdList::RegSave).into_iter().flatten());
        if self.flags.contains(DrawCtxtFlags::SHADER_SAVE) {
            cmds.extend(self.ib(CmdList::ShaderSave).into_iter().flatten());
            self.flags |= DrawCtxtFlags::SHADER_RESTORE;
        }
        if self.flags.contains(DrawCtxtFlags::GMEM_SAVE) {
            if let Some(ib) = self.ib(CmdList::GmemSave) {
                cmds.extend(ib);
                self.flags |= DrawCtxtFlags::GMEM_RESTORE;
            }
        }
        self.flags.remove(DrawCtxtFlags::STATE_DIRTY);
        cmds
    }

    /// Commands restoring this context as it is switched in.
    fn restore_cmds(&mut self) -> Vec<u32> {
        let mut cmds = Vec::new();
        if self.flags.contains(DrawCtxtFlags::GMEM_RESTORE) {
            cmds.extend(self.ib(CmdList::GmemRestore).into_iter().flatten());
            self.flags.remove(DrawCtxtFlags::GMEM_RESTORE);
        }
        cmds.extend(self.ib(CmdList::RegRestore).into_iter().flatten());
        if self.flags.contains(DrawCtxtFlags::SHADER_RESTORE) {
            cmds.extend(self.ib(CmdList::ShaderRestore).into_iter().flatten());
            self.flags.remove(DrawCtxtFlags::SHADER_RESTORE);
        }
        cmds
    }

    fn buffers(&self) -> impl Iterator<Item = MemDesc> {
        self.gpustate.into_iter().chain(self.gmem_shadow)
    }
}

/// A device's fixed-size context table.
#[derive(Debug)]
pub struct DrawContextTable {
    slots: Vec<Option<DrawContext>>,
    active: Option<u32>,
}

impl DrawContextTable {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            slots: vec![None; max],
            active: None,
        }
    }

    #[must_use]
    pub fn for_device(device: DeviceId) -> Self {
        match device {
            DeviceId::Yamato => Self::new(YAMATO_CONTEXT_MAX),
            DeviceId::G12 => Self::new(G12_CONTEXT_MAX),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub const fn active(&self) -> Option<u32> {
        self.active
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&DrawContext> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut DrawContext> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    /// Ids of every context owned by `pid`.
    #[must_use]
    pub fn owned_by(&self, pid: Pid) -> Vec<u32> {
        self.slots
            .iter()
            .flatten()
            .filter(|c| c.pid == pid)
            .map(|c| c.id)
            .collect()
    }

    /// Claims a slot. With `with_state` the 3D state and GMEM shadows are
    /// allocated and the save/restore lists written.
    pub(crate) fn create(
        &mut self,
        env: &mut GslEnv<'_>,
        device: DeviceId,
        pid: Pid,
        ctx_type: ContextType,
        flags: DrawCtxtFlags,
        with_state: bool,
    ) -> KgslResult<u32> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            log::warn!("drawctxt[{}]: all {} slots in use", device.name(), self.slots.len());
            return Err(KgslError::OutOfMemory);
        };

        let mut ctx = DrawContext {
            id: slot as u32,
            pid,
            ctx_type,
            flags: DrawCtxtFlags::IN_USE | (flags & DrawCtxtFlags::CREATE_MASK),
            gpustate: None,
            gmem_shadow: None,
            user_shadow: None,
            list_len: [0; 6],
        };

        if with_state {
            let gpustate = env.alloc(device, pid, MemFlags::ALIGN4K, CONTEXT_SIZE)?;
            ctx.gpustate = Some(gpustate);

            if !ctx.flags.contains(DrawCtxtFlags::NO_GMEM_ALLOC) {
                match env.alloc(device, pid, MemFlags::ALIGN4K, YAMATO_GMEM_SIZE) {
                    Ok(shadow) => {
                        ctx.gmem_shadow = Some(shadow);
                        ctx.flags |= DrawCtxtFlags::GMEM_SAVE;
                    }
                    Err(e) => {
                        let _ = env.free(&gpustate);
                        return Err(e);
                    }
                }
            }
            ctx.flags |= DrawCtxtFlags::SHADER_SAVE | DrawCtxtFlags::STATE_DIRTY;

            if let Err(e) = ctx.build_lists(env.sharedmem) {
                for desc in ctx.buffers() {
                    let _ = env.free(&desc);
                }
                return Err(e);
            }
        }

        log::debug!(
            "drawctxt[{}]: created {} for pid {pid} ({:?})",
            device.name(),
            ctx.id,
            ctx.flags
        );
        let id = ctx.id;
        self.slots[slot] = Some(ctx);
        Ok(id)
    }

    /// Releases a slot. Its buffers are freed once `timestamp` retires.
    pub fn destroy(&mut self, id: u32, memqueue: &mut MemQueue, timestamp: u32) -> KgslResult<()> {
        let ctx = self
            .slots
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or_else(|| KgslError::bad_param(format!("no draw context {id}")))?;

        for desc in ctx.buffers() {
            memqueue.push(timestamp, desc, ctx.pid);
        }
        if self.active == Some(id) {
            self.active = None;
        }
        Ok(())
    }

    /// Frees every context immediately. The device must be idle.
    pub(crate) fn destroy_all(&mut self, env: &mut GslEnv<'_>) {
        for ctx in self.slots.iter_mut().filter_map(Option::take) {
            for desc in ctx.buffers() {
                if let Err(e) = env.free(&desc) {
                    log::warn!("drawctxt: freeing context {} buffer: {e}", ctx.id);
                }
            }
        }
        self.active = None;
    }

    /// Points the context's GMEM save at a client buffer covering `rect`.
    /// A zero `shadow` reverts to the driver-allocated shadow.
    pub fn bind_gmem_shadow(
        &mut self,
        sharedmem: &SharedMem,
        id: u32,
        rect: GmemRect,
        shadow: MemDesc,
    ) -> KgslResult<()> {
        let ctx = self
            .get_mut(id)
            .ok_or_else(|| KgslError::bad_param(format!("no draw context {id}")))?;
        if ctx.gpustate.is_none() {
            return Err(KgslError::NotSupported("context has no GMEM state".into()));
        }

        if shadow.gpuaddr == 0 {
            ctx.user_shadow = None;
            ctx.flags.remove(DrawCtxtFlags::USER_GMEM_SHADOW);
            ctx.flags.set(DrawCtxtFlags::GMEM_SAVE, ctx.gmem_shadow.is_some());
        } else {
            let needed = rect
                .shadow_bytes()
                .filter(|&n| n > 0 && rect.pitch >= rect.width && rect.width > 0)
                .ok_or_else(|| KgslError::bad_param(format!("bad GMEM rect {rect:?}")))?;
            if needed > shadow.size {
                return Err(KgslError::bad_param(format!(
                    "shadow of {} bytes too small for {needed}",
                    shadow.size
                )));
            }
            ctx.user_shadow = Some((rect, shadow));
            ctx.flags |= DrawCtxtFlags::USER_GMEM_SHADOW | DrawCtxtFlags::GMEM_SAVE;
        }
        ctx.build_gmem_lists(sharedmem)
    }

    /// Commands saving the active context, empty if there is none or it is
    /// already `incoming`.
    pub fn switch_out(&mut self, incoming: Option<u32>) -> Vec<u32> {
        if self.active == incoming {
            return Vec::new();
        }
        let Some(active) = self.active else {
            return Vec::new();
        };
        self.get_mut(active)
            .map(DrawContext::save_cmds)
            .unwrap_or_default()
    }

    /// Makes `incoming` active, returning the commands that restore it.
    pub fn switch_in(&mut self, incoming: Option<u32>) -> Vec<u32> {
        if self.active == incoming {
            return Vec::new();
        }
        self.active = incoming;
        incoming
            .and_then(|id| self.get_mut(id))
            .map(DrawContext::restore_cmds)
            .unwrap_or_default()
    }

    /// Flags a context after an MMU fault.
    pub fn mark_faulted(&mut self, id: u32) {
        if let Some(ctx) = self.get_mut(id) {
            ctx.flags |= DrawCtxtFlags::FAULTED;
        }
    }
}

impl Device {
    /// Creates a draw context for `pid`. The device must be started.
    pub(crate) fn context_create(
        &mut self,
        env: &mut GslEnv<'_>,
        pid: Pid,
        ctx_type: ContextType,
        flags: DrawCtxtFlags,
    ) -> KgslResult<u32> {
        self.require_started()?;
        let with_state = self.ops.has_context_state();
        self.drawctxt
            .create(env, self.id, pid, ctx_type, flags, with_state)
    }

    /// Destroys one of `pid`'s contexts. Its buffers go back to the arena
    /// once everything submitted so far has retired.
    pub(crate) fn context_destroy(&mut self, pid: Pid, id: u32) -> KgslResult<()> {
        self.check_owner(pid, id)?;
        let timestamp = self.current_timestamp();
        self.drawctxt.destroy(id, &mut self.memqueue, timestamp)?;
        self.shared.set_active_context(self.drawctxt.active());
        log::debug!("drawctxt[{}]: destroyed {id} at ts {timestamp}", self.id.name());
        Ok(())
    }

    pub(crate) fn context_bind_gmem_shadow(
        &mut self,
        env: &GslEnv<'_>,
        pid: Pid,
        id: u32,
        rect: GmemRect,
        shadow: MemDesc,
    ) -> KgslResult<()> {
        self.check_owner(pid, id)?;
        if shadow.gpuaddr != 0 && env.sharedmem.owner_of(&shadow)? != pid {
            return Err(KgslError::bad_param("shadow buffer belongs to another process"));
        }
        self.drawctxt
            .bind_gmem_shadow(env.sharedmem, id, rect, shadow)
    }

    fn check_owner(&self, pid: Pid, id: u32) -> KgslResult<()> {
        match self.drawctxt.get(id) {
            Some(ctx) if ctx.pid == pid => Ok(()),
            _ => Err(KgslError::bad_param(format!("no draw context {id} for pid {pid}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KgslConfig;
    use crate::gsl::mmu::PageTableSet;
    use crate::hw::PhysicalMemory;
    use std::sync::Arc;

    fn env_parts() -> (KgslConfig, SharedMem, PageTableSet) {
        let cfg = KgslConfig::new()
            .with_mmu(false)
            .with_memory(512 * 1024, 2 * 1024 * 1024);
        let physmem = Arc::new(PhysicalMemory::new(cfg.conphys_size, cfg.emem_size));
        let sm = SharedMem::new(physmem.clone(), &cfg).unwrap();
        let pts = PageTableSet::new(physmem, &cfg);
        (cfg, sm, pts)
    }

    #[test]
    fn test_create_allocates_shadows() {
        let (cfg, mut sm, mut pts) = env_parts();
        let mut env = GslEnv {
            sharedmem: &mut sm,
            pagetables: &mut pts,
            config: &cfg,
        };
        let mut table = DrawContextTable::for_device(DeviceId::Yamato);

        let a = table
            .create(&mut env, DeviceId::Yamato, 1, ContextType::OpenGl, DrawCtxtFlags::empty(), true)
            .unwrap();
        let b = table
            .create(
                &mut env,
                DeviceId::Yamato,
                1,
                ContextType::OpenGl,
                DrawCtxtFlags::NO_GMEM_ALLOC,
                true,
            )
            .unwrap();

        let ca = table.get(a).unwrap();
        assert!(ca.gmem_shadow.is_some());
        assert!(ca.flags.contains(DrawCtxtFlags::GMEM_SAVE));
        let cb = table.get(b).unwrap();
        assert!(cb.gmem_shadow.is_none());
        assert!(!cb.flags.contains(DrawCtxtFlags::GMEM_SAVE));
        assert_eq!(env.sharedmem.block_count(), 3);
    }

    #[test]
    fn test_slot_exhaustion() {
        let (cfg, mut sm, mut pts) = env_parts();
        let mut env = GslEnv {
            sharedmem: &mut sm,
            pagetables: &mut pts,
            config: &cfg,
        };
        let mut table = DrawContextTable::for_device(DeviceId::G12);
        for _ in 0..G12_CONTEXT_MAX {
            table
                .create(&mut env, DeviceId::G12, 1, ContextType::OpenVg, DrawCtxtFlags::empty(), false)
                .unwrap();
        }
        assert!(matches!(
            table.create(&mut env, DeviceId::G12, 1, ContextType::OpenVg, DrawCtxtFlags::empty(), false),
            Err(KgslError::OutOfMemory)
        ));
    }

    #[test]
    fn test_switch_saves_outgoing_and_restores_incoming() {
        let (cfg, mut sm, mut pts) = env_parts();
        let mut env = GslEnv {
            sharedmem: &mut sm,
            pagetables: &mut pts,
            config: &cfg,
        };
        let mut table = DrawContextTable::for_device(DeviceId::Yamato);
        let a = table
            .create(&mut env, DeviceId::Yamato, 1, ContextType::OpenGl, DrawCtxtFlags::empty(), true)
            .unwrap();
        let b = table
            .create(&mut env, DeviceId::Yamato, 2, ContextType::OpenGl, DrawCtxtFlags::NO_GMEM_ALLOC, true)
            .unwrap();

        assert!(table.switch_out(Some(a)).is_empty());
        let restore = table.switch_in(Some(a));
        assert_eq!(restore.len(), 3);
        assert_eq!(table.active(), Some(a));

        // Outgoing a: register, shader and GMEM saves.
        let save = table.switch_out(Some(b));
        assert_eq!(save.len(), 9);
        let ca = table.get(a).unwrap();
        assert!(ca.flags.contains(DrawCtxtFlags::GMEM_RESTORE | DrawCtxtFlags::SHADER_RESTORE));
        table.switch_in(Some(b));

        // Back to a: GMEM, register and shader restores.
        table.switch_out(Some(a));
        assert_eq!(table.switch_in(Some(a)).len(), 9);
        assert!(!table.get(a).unwrap().flags.contains(DrawCtxtFlags::GMEM_RESTORE));

        // Same context again is a no-op.
        assert!(table.switch_out(Some(a)).is_empty());
        assert!(table.switch_in(Some(a)).is_empty());
    }

    #[test]
    fn test_destroy_defers_frees_and_clears_active() {
        let (cfg, mut sm, mut pts) = env_parts();
        let mut env = GslEnv {
            sharedmem: &mut sm,
            pagetables: &mut pts,
            config: &cfg,
        };
        let mut table = DrawContextTable::for_device(DeviceId::Yamato);
        let mut queue = MemQueue::new();
        let a = table
            .create(&mut env, DeviceId::Yamato, 7, ContextType::OpenGl, DrawCtxtFlags::empty(), true)
            .unwrap();
        table.switch_in(Some(a));

        table.destroy(a, &mut queue, 42).unwrap();
        assert_eq!(table.active(), None);
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|e| e.timestamp == 42 && e.pid == 7));
        assert!(table.destroy(a, &mut queue, 42).is_err());

        // Slot is free again.
        let again = table
            .create(&mut env, DeviceId::Yamato, 7, ContextType::OpenGl, DrawCtxtFlags::NO_GMEM_ALLOC, true)
            .unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn test_bind_user_gmem_shadow() {
        let (cfg, mut sm, mut pts) = env_parts();
        let mut env = GslEnv {
            sharedmem: &mut sm,
            pagetables: &mut pts,
            config: &cfg,
        };
        let mut table = DrawContextTable::for_device(DeviceId::Yamato);
        let a = table
            .create(&mut env, DeviceId::Yamato, 1, ContextType::OpenGl, DrawCtxtFlags::NO_GMEM_ALLOC, true)
            .unwrap();
        let shadow = env.alloc(DeviceId::Yamato, 1, MemFlags::empty(), 64 * 64 * 4).unwrap();
        let rect = GmemRect {
            x: 0,
            y: 0,
            width: 64,
            height: 64,
            pitch: 64,
        };

        let too_big = GmemRect { height: 65, ..rect };
        assert!(table.bind_gmem_shadow(env.sharedmem, a, too_big, shadow).is_err());

        table.bind_gmem_shadow(env.sharedmem, a, rect, shadow).unwrap();
        let ctx = table.get(a).unwrap();
        assert!(ctx.flags.contains(DrawCtxtFlags::USER_GMEM_SHADOW | DrawCtxtFlags::GMEM_SAVE));

        table
            .bind_gmem_shadow(env.sharedmem, a, rect, MemDesc::default())
            .unwrap();
        let ctx = table.get(a).unwrap();
        assert!(!ctx.flags.intersects(DrawCtxtFlags::USER_GMEM_SHADOW | DrawCtxtFlags::GMEM_SAVE));
    }
}
