//! Z430 3D core: ring-buffer driven, MMU and context switches issued in-stream.

use std::sync::Arc;

use super::{Device, DeviceFlags, DeviceOps, DeviceShared};
use crate::error::{KgslError, KgslResult};
use crate::gsl::memory::MemFlags;
use crate::gsl::mmu::MmuFault;
use crate::gsl::ringbuffer::{CmdFlags, RingBuffer};
use crate::gsl::{GslEnv, Pid};
use crate::hw::MEMSTORE_SIZE;
use crate::hw::pm4::{PM4_INDIRECT_BUFFER_PFD, PM4_WAIT_FOR_IDLE, type0_packet, type3_packet};
use crate::hw::regs::{
    CP_INT_IB_ERROR, CP_INT_IB1, CP_INT_MASK, CP_INT_OPCODE_ERROR, CP_INT_PROTECTED_MODE_ERROR,
    CP_INT_RB, CP_INT_RESERVED_BIT_ERROR, CP_INT_T0_PACKET_IN_IB, MASTER_INT_CP, MASTER_INT_MH,
    MASTER_INT_RBBM, MH_INTERRUPT_MASK_ALL, MH_MMU_INVALIDATE_ALL, MH_MMU_INVALIDATE_TC,
    RBBM_STATUS_GUI_ACTIVE, REG_CP_INT_STATUS, REG_MASTER_INT_SIGNAL, REG_MH_INTERRUPT_STATUS,
    REG_MH_MMU_CONFIG, REG_MH_MMU_INVALIDATE, REG_MH_MMU_PAGE_FAULT, REG_MH_MMU_PT_BASE,
    REG_RBBM_CHIP_ID, REG_RBBM_STATUS,
};

const CP_INT_ERRORS: u32 = CP_INT_T0_PACKET_IN_IB
    | CP_INT_OPCODE_ERROR
    | CP_INT_PROTECTED_MODE_ERROR
    | CP_INT_RESERVED_BIT_ERROR
    | CP_INT_IB_ERROR;

#[derive(Debug)]
pub(super) struct Yamato;

impl Yamato {
    fn ringbuffer(dev: &mut Device) -> KgslResult<&mut RingBuffer> {
        dev.ringbuffer
            .as_mut()
            .ok_or_else(|| KgslError::failure("ring buffer not started"))
    }
}

impl DeviceOps for Yamato {
    fn init(&self, dev: &mut Device) -> KgslResult<()> {
        dev.chip_id = dev.hw.regs.read(REG_RBBM_CHIP_ID);
        if dev.chip_id == 0 {
            return Err(KgslError::Device("3D core does not identify".into()));
        }
        Ok(())
    }

    fn start(&self, dev: &mut Device, env: &mut GslEnv<'_>) -> KgslResult<()> {
        let memstore = dev
            .memstore
            .ok_or_else(|| KgslError::not_initialized("no memstore"))?;
        env.sharedmem.set(&memstore, 0, 0, MEMSTORE_SIZE)?;

        let translate = env.config.mmu_enabled && !dev.flags.contains(DeviceFlags::SAFEMODE);
        dev.mmu.start(&dev.hw, env.pagetables, translate);

        let flags = MemFlags::CONPHYS | MemFlags::STRICTREQUEST | MemFlags::ALIGN4K;
        let buffer = env.alloc(dev.id, 0, flags, env.config.ringbuffer_sizedwords * 4)?;
        let mut rb = match RingBuffer::new(
            dev.hw.clone(),
            env.sharedmem.physmem().clone(),
            buffer,
            memstore.gpuaddr,
            env.config.waitspace_spin_limit,
        ) {
            Ok(rb) => rb,
            Err(e) => {
                let _ = env.free(&buffer);
                return Err(e);
            }
        };

        let shared = dev.shared.clone();
        let ops = dev.ops;
        dev.hw.irq.connect(Arc::new(move || ops.isr(&shared)));

        if let Err(e) = rb.start() {
            dev.hw.irq.disconnect();
            let _ = env.free(&buffer);
            dev.mmu.stop(&dev.hw, env.sharedmem, env.pagetables);
            return Err(e);
        }
        dev.ringbuffer = Some(rb);
        Ok(())
    }

    fn stop(&self, dev: &mut Device, env: &mut GslEnv<'_>) {
        dev.drawctxt.destroy_all(env);
        if let Some(mut rb) = dev.ringbuffer.take() {
            rb.stop();
            if let Err(e) = env.free(&rb.buffer) {
                log::warn!("yamato: freeing ring buffer: {e}");
            }
        }
        dev.hw.irq.disconnect();
        dev.mmu.stop(&dev.hw, env.sharedmem, env.pagetables);
    }

    fn is_idle(&self, dev: &mut Device) -> bool {
        let drained = dev.ringbuffer.as_mut().is_none_or(RingBuffer::is_drained);
        drained && dev.hw.regs.read(REG_RBBM_STATUS) & RBBM_STATUS_GUI_ACTIVE == 0
    }

    fn current_timestamp(&self, dev: &Device) -> u32 {
        dev.ringbuffer.as_ref().map_or(0, |rb| rb.timestamp)
    }

    fn setpagetable(&self, dev: &mut Device, env: &mut GslEnv<'_>, pid: Pid) -> KgslResult<()> {
        dev.mmu.attach(pid, env.sharedmem, env.pagetables)?;
        let Some(sw) = dev.mmu.pending_switch(pid, env.pagetables) else {
            return Ok(());
        };

        let mut cmds = vec![type3_packet(PM4_WAIT_FOR_IDLE, 1), 0];
        if sw.switch {
            cmds.extend([type0_packet(REG_MH_MMU_PT_BASE, 1), sw.pt_base]);
        }
        cmds.extend([
            type0_packet(REG_MH_MMU_INVALIDATE, 1),
            MH_MMU_INVALIDATE_ALL | MH_MMU_INVALIDATE_TC,
        ]);
        Self::ringbuffer(dev)?.issuecmds(CmdFlags::PMODE | CmdFlags::NO_TS_CMP, &cmds)?;
        dev.mmu.commit(sw);
        Ok(())
    }

    fn issueibcmds(
        &self,
        dev: &mut Device,
        env: &mut GslEnv<'_>,
        pid: Pid,
        context: Option<u32>,
        ibaddr: u32,
        sizedwords: u32,
        flags: CmdFlags,
    ) -> KgslResult<u32> {
        // The outgoing context saves under the page table it ran with.
        let save = dev.drawctxt.switch_out(context);
        if !save.is_empty() {
            Self::ringbuffer(dev)?.issuecmds(CmdFlags::PMODE | CmdFlags::NO_TS_CMP, &save)?;
        }

        self.setpagetable(dev, env, pid)?;

        let restore = dev.drawctxt.switch_in(context);
        dev.shared.set_active_context(dev.drawctxt.active());
        if !restore.is_empty() {
            Self::ringbuffer(dev)?.issuecmds(CmdFlags::PMODE | CmdFlags::NO_TS_CMP, &restore)?;
        }

        let ib = [type3_packet(PM4_INDIRECT_BUFFER_PFD, 2), ibaddr, sizedwords];
        Self::ringbuffer(dev)?.issuecmds(flags | CmdFlags::NOT_KERNEL_CMD, &ib)
    }

    fn addtimestamp(&self, dev: &mut Device, _env: &mut GslEnv<'_>, _pid: Pid) -> KgslResult<u32> {
        Self::ringbuffer(dev)?.issuecmds(CmdFlags::empty(), &[])
    }

    fn cmdwindow_write(&self, _dev: &mut Device, _target: u32, _addr: u32, _data: u32) -> KgslResult<()> {
        Err(KgslError::NotSupported("the 3D core has no command window".into()))
    }

    fn has_context_state(&self) -> bool {
        true
    }

    fn isr(&self, shared: &DeviceShared) {
        let regs = &shared.hw().regs;
        let master = regs.take_bits(REG_MASTER_INT_SIGNAL, MASTER_INT_MH | MASTER_INT_CP | MASTER_INT_RBBM);
        if master == 0 {
            return;
        }

        if master & MASTER_INT_MH != 0 {
            let status = regs.take_bits(REG_MH_INTERRUPT_STATUS, MH_INTERRUPT_MASK_ALL);
            if status != 0 {
                shared.push_fault(MmuFault {
                    addr: regs.read(REG_MH_MMU_PAGE_FAULT),
                    status,
                    context: shared.active_context(),
                });
            }
        }

        if master & MASTER_INT_CP != 0 {
            let status = regs.take_bits(REG_CP_INT_STATUS, CP_INT_MASK);
            if status & CP_INT_ERRORS != 0 {
                log::error!("yamato: command processor error, status 0x{status:08x}");
            } else if status & (CP_INT_RB | CP_INT_IB1) == 0 {
                log::trace!("yamato: spurious CP interrupt 0x{status:08x}");
            }
        }

        shared.note_irq();
    }

    fn dump(&self, dev: &Device) {
        let regs = &dev.hw.regs;
        log::error!(
            "yamato: RBBM_STATUS 0x{:08x} MASTER_INT 0x{:08x} MH_CONFIG 0x{:08x} PT_BASE 0x{:08x}",
            regs.read(REG_RBBM_STATUS),
            regs.read(REG_MASTER_INT_SIGNAL),
            regs.read(REG_MH_MMU_CONFIG),
            regs.read(REG_MH_MMU_PT_BASE)
        );
        if let Some(rb) = &dev.ringbuffer {
            rb.dump();
        }
    }
}
