//! Z160 2D core: no ring buffer; work is kicked through registers and the
//! core writes the kicked timestamp to the memstore when done.

use std::sync::Arc;

use super::{Device, DeviceFlags, DeviceOps, DeviceShared, TimestampType};
use crate::error::{KgslError, KgslResult};
use crate::gsl::mmu::MmuFault;
use crate::gsl::ringbuffer::CmdFlags;
use crate::gsl::{GslEnv, Pid};
use crate::hw::MEMSTORE_SIZE;
use crate::hw::regs::{
    G12_IRQ_MH, G12_IRQ_TIMESTAMP, G12_STATUS_BUSY, MH_MMU_INVALIDATE_ALL, MH_MMU_INVALIDATE_TC,
    REG_G12_CHIP_ID, REG_G12_CMDWINDOW_ADDR, REG_G12_CMDWINDOW_DATA, REG_G12_IB_ADDR,
    REG_G12_IB_SIZE, REG_G12_IRQ_STATUS, REG_G12_KICK_TS, REG_G12_MEMSTORE_ADDR, REG_G12_STATUS,
    REG_MH_INTERRUPT_STATUS, REG_MH_MMU_INVALIDATE, REG_MH_MMU_PAGE_FAULT, REG_MH_MMU_PT_BASE,
};

/// Number of command-window targets.
pub const G12_CMDWINDOW_TARGETS: u32 = 4;

#[derive(Debug)]
pub(super) struct G12;

impl G12 {
    fn kick(dev: &mut Device, ibaddr: u32, sizedwords: u32) -> u32 {
        let ts = dev.timestamp.wrapping_add(1);
        let regs = &dev.hw.regs;
        regs.write(REG_G12_IB_ADDR, ibaddr);
        regs.write(REG_G12_IB_SIZE, sizedwords);
        regs.set_bits(REG_G12_STATUS, G12_STATUS_BUSY);
        regs.write(REG_G12_KICK_TS, ts);
        dev.timestamp = ts;
        ts
    }
}

impl DeviceOps for G12 {
    fn init(&self, dev: &mut Device) -> KgslResult<()> {
        dev.chip_id = dev.hw.regs.read(REG_G12_CHIP_ID);
        if dev.chip_id == 0 {
            return Err(KgslError::Device("2D core does not identify".into()));
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

        let regs = &dev.hw.regs;
        regs.write(REG_G12_IRQ_STATUS, 0);
        regs.write(REG_G12_STATUS, 0);
        regs.write(REG_G12_KICK_TS, 0);
        regs.write(REG_G12_MEMSTORE_ADDR, memstore.gpuaddr);
        dev.timestamp = 0;

        let shared = dev.shared.clone();
        let ops = dev.ops;
        dev.hw.irq.connect(Arc::new(move || ops.isr(&shared)));
        Ok(())
    }

    fn stop(&self, dev: &mut Device, env: &mut GslEnv<'_>) {
        dev.drawctxt.destroy_all(env);
        dev.hw.irq.disconnect();
        dev.hw.regs.write(REG_G12_MEMSTORE_ADDR, 0);
        dev.mmu.stop(&dev.hw, env.sharedmem, env.pagetables);
    }

    fn is_idle(&self, dev: &mut Device) -> bool {
        let busy = dev.hw.regs.read(REG_G12_STATUS) & G12_STATUS_BUSY != 0;
        !busy && dev.shared.read_timestamp(TimestampType::Retired) == Some(dev.timestamp)
    }

    fn current_timestamp(&self, dev: &Device) -> u32 {
        dev.timestamp
    }

    fn setpagetable(&self, dev: &mut Device, env: &mut GslEnv<'_>, pid: Pid) -> KgslResult<()> {
        dev.mmu.attach(pid, env.sharedmem, env.pagetables)?;
        let Some(sw) = dev.mmu.pending_switch(pid, env.pagetables) else {
            return Ok(());
        };
        let regs = &dev.hw.regs;
        if sw.switch {
            regs.write(REG_MH_MMU_PT_BASE, sw.pt_base);
        }
        regs.write(REG_MH_MMU_INVALIDATE, MH_MMU_INVALIDATE_ALL | MH_MMU_INVALIDATE_TC);
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
        _flags: CmdFlags,
    ) -> KgslResult<u32> {
        self.setpagetable(dev, env, pid)?;
        // 2D contexts carry no state, switching is bookkeeping only.
        dev.drawctxt.switch_out(context);
        dev.drawctxt.switch_in(context);
        dev.shared.set_active_context(dev.drawctxt.active());
        Ok(Self::kick(dev, ibaddr, sizedwords))
    }

    fn addtimestamp(&self, dev: &mut Device, _env: &mut GslEnv<'_>, _pid: Pid) -> KgslResult<u32> {
        Ok(Self::kick(dev, 0, 0))
    }

    fn cmdwindow_write(&self, dev: &mut Device, target: u32, addr: u32, data: u32) -> KgslResult<()> {
        if target >= G12_CMDWINDOW_TARGETS {
            return Err(KgslError::bad_param(format!("command window target {target}")));
        }
        let regs = &dev.hw.regs;
        regs.write(REG_G12_CMDWINDOW_ADDR, (target << 16) | (addr & 0xffff));
        regs.write(REG_G12_CMDWINDOW_DATA, data);
        Ok(())
    }

    fn has_context_state(&self) -> bool {
        false
    }

    fn isr(&self, shared: &DeviceShared) {
        let regs = &shared.hw().regs;
        let status = regs.take_bits(REG_G12_IRQ_STATUS, G12_IRQ_TIMESTAMP | G12_IRQ_MH);
        if status == 0 {
            return;
        }
        if status & G12_IRQ_MH != 0 {
            shared.push_fault(MmuFault {
                addr: regs.read(REG_MH_MMU_PAGE_FAULT),
                status: regs.take_bits(REG_MH_INTERRUPT_STATUS, u32::MAX),
                context: shared.active_context(),
            });
        }
        shared.note_irq();
    }

    fn dump(&self, dev: &Device) {
        let regs = &dev.hw.regs;
        log::error!(
            "g12: STATUS 0x{:08x} IRQ 0x{:08x} KICK_TS {} retired {:?}",
            regs.read(REG_G12_STATUS),
            regs.read(REG_G12_IRQ_STATUS),
            regs.read(REG_G12_KICK_TS),
            dev.shared.read_timestamp(TimestampType::Retired)
        );
    }
}
