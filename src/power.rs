//! Bus-power interlock
//!
//! The chip may power its bus interface down whenever the host lets it. Every
//! control exchange must therefore hold a wake request: the interlock counts
//! them, drives the chip-family wake handshake on the 0->1 transition and
//! schedules the release toward sleep on 1->0.

use alloc::sync::Arc;

use log::{debug, warn};

use crate::chip::{ChipInfo, WakeMethod};
use crate::error::{WifiError, WifiResult};
use crate::platform::{Bus, BusFunction, HostOs};

/// SDIO function-1 registers driven by the interlock
pub mod reg {
    /// Chip clock control/status
    pub const CHIP_CLOCK_CSR: u32 = 0x1000E;
    /// Wakeup control (save/restore firmwares)
    pub const WAKEUP_CTRL: u32 = 0x1001E;
    /// Sleep control/status (KSO handshake)
    pub const SLEEP_CSR: u32 = 0x1001F;
    /// Bus-controller Broadcom card capability register
    pub const BRCM_CARDCAP: u32 = 0xF0;

    /// CHIP_CLOCK_CSR bits
    pub const ALP_AVAIL_REQ: u32 = 0x08;
    pub const HT_AVAIL_REQ: u32 = 0x10;
    pub const ALP_AVAIL: u32 = 0x40;
    pub const HT_AVAIL: u32 = 0x80;

    /// SLEEP_CSR bits
    pub const KEEP_SDIO_ON: u32 = 0x01;
    pub const DEVICE_ON: u32 = 0x02;

    /// WAKEUP_CTRL bits
    pub const WAKE_TILL_HT_AVAIL: u32 = 0x02;

    /// BRCM_CARDCAP bits
    pub const CMD_NODEC: u32 = 0x08;
}

/// KSO handshake bounds
const KSO_MAX_ATTEMPTS: u32 = 64;
const KSO_RETRY_DELAY_MS: u32 = 1;

/// HT clock availability bounds
const HT_AVAIL_MAX_WAIT_MS: u32 = 1000;
const HT_AVAIL_POLL_MS: u32 = 1;

/// Deep-sleep (DS1) exit handshake
const D11_SHM_BASE: u32 = 0x0080_0000;
const M_DS1_CTRL_SDIO: u32 = 0x0018;
const DS1_CTRL_EXIT: u32 = 0x0001;
const DS1_CTRL_REQ_VALID: u32 = 0x0004;
const DS1_CTRL_PROC_DONE: u32 = 0x0100;
const DS1_EXIT_MAX_POLLS: u32 = 50;
const DS1_EXIT_POLL_MS: u32 = 100;
const PMU_MIN_RES_MASK_ADDR: u32 = 0x1800_0618;

struct PowerState {
    refs: u32,
    awake: bool,
}

/// Wake-request refcount plus the chip wake/sleep handshake.
pub struct PowerInterlock {
    bus: Arc<dyn Bus>,
    os: Arc<dyn HostOs>,
    wake: WakeMethod,
    save_restore: bool,
    ds1: bool,
    pmu_min_res_mask: u32,
    state: spin::Mutex<PowerState>,
}

impl PowerInterlock {
    pub fn new(bus: Arc<dyn Bus>, os: Arc<dyn HostOs>, chip: &ChipInfo) -> Self {
        PowerInterlock {
            bus,
            os,
            wake: chip.wake,
            save_restore: chip.save_restore,
            ds1: chip.ds1,
            pmu_min_res_mask: chip.pmu_min_res_mask,
            state: spin::Mutex::new(PowerState { refs: 0, awake: false }),
        }
    }

    /// One-time setup so a save/restore firmware wakes on bus activity.
    pub fn init_save_restore(&self) -> WifiResult<()> {
        if !self.save_restore {
            return Ok(());
        }
        let v = self.bus.read_register(BusFunction::Backplane, reg::WAKEUP_CTRL, 1)?;
        self.bus.write_register(
            BusFunction::Backplane,
            reg::WAKEUP_CTRL,
            1,
            v | reg::WAKE_TILL_HT_AVAIL,
        )?;
        self.bus
            .write_register(BusFunction::Bus, reg::BRCM_CARDCAP, 1, reg::CMD_NODEC)?;
        Ok(())
    }

    /// Take a wake request. The 0->1 transition drives the chip awake.
    pub fn acquire(&self) -> WifiResult<()> {
        let mut st = self.state.lock();
        if st.refs == 0 && !st.awake {
            self.bus.wakeup()?;
            if let Err(e) = self.chip_wake() {
                let _ = self.bus.sleep();
                return Err(e);
            }
            st.awake = true;
        }
        st.refs += 1;
        Ok(())
    }

    /// Drop a wake request. The 1->0 transition releases toward sleep.
    pub fn release(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.refs > 0);
        if st.refs == 0 {
            return;
        }
        st.refs -= 1;
        if st.refs == 0 {
            self.chip_release();
            st.awake = false;
            let _ = self.bus.sleep();
        }
    }

    /// Current wake-request count
    pub fn count(&self) -> u32 {
        self.state.lock().refs
    }

    fn chip_wake(&self) -> WifiResult<()> {
        match self.wake {
            WakeMethod::Kso => self.kso_enable(),
            WakeMethod::HtClock => self.ht_clock_request(),
        }
    }

    fn chip_release(&self) {
        match self.wake {
            WakeMethod::Kso => {
                // The chip may already have powered down; write the release
                // value and do not poll readback.
                let _ = self.bus.write_register(BusFunction::Backplane, reg::SLEEP_CSR, 1, 0);
            }
            WakeMethod::HtClock => {
                let _ =
                    self.bus.write_register(BusFunction::Backplane, reg::CHIP_CLOCK_CSR, 1, 0);
            }
        }
    }

    /// Keep-SDIO-On handshake. The write is doubled per silicon erratum.
    fn kso_enable(&self) -> WifiResult<()> {
        let want = reg::KEEP_SDIO_ON | reg::DEVICE_ON;
        self.bus
            .write_register(BusFunction::Backplane, reg::SLEEP_CSR, 1, reg::KEEP_SDIO_ON)?;
        self.bus
            .write_register(BusFunction::Backplane, reg::SLEEP_CSR, 1, reg::KEEP_SDIO_ON)?;
        for _ in 0..KSO_MAX_ATTEMPTS {
            let v = self.bus.read_register(BusFunction::Backplane, reg::SLEEP_CSR, 1)?;
            if v & want == want {
                if self.ds1 {
                    self.ds1_exit()?;
                }
                return Ok(());
            }
            self.os.delay_ms(KSO_RETRY_DELAY_MS);
            self.bus
                .write_register(BusFunction::Backplane, reg::SLEEP_CSR, 1, reg::KEEP_SDIO_ON)?;
        }
        warn!("power: kso enable timed out");
        Err(WifiError::BusUpFail)
    }

    /// Legacy clock-gate wake: request the HT clock and poll availability.
    fn ht_clock_request(&self) -> WifiResult<()> {
        self.bus.write_register(
            BusFunction::Backplane,
            reg::CHIP_CLOCK_CSR,
            1,
            reg::HT_AVAIL_REQ,
        )?;
        for _ in 0..(HT_AVAIL_MAX_WAIT_MS / HT_AVAIL_POLL_MS) {
            let v = self.bus.read_register(BusFunction::Backplane, reg::CHIP_CLOCK_CSR, 1)?;
            if v & reg::HT_AVAIL != 0 {
                return Ok(());
            }
            self.os.delay_ms(HT_AVAIL_POLL_MS);
        }
        warn!("power: ht clock unavailable");
        Err(WifiError::BusUpFail)
    }

    /// Deep-sleep exit: shared-memory handshake with the D11 core, then
    /// restore the PMU minimum-resource mask. Only reached on DS1-capable
    /// silicon, never from the fast path.
    fn ds1_exit(&self) -> WifiResult<()> {
        let ctrl = D11_SHM_BASE + M_DS1_CTRL_SDIO;
        let v = self.bus.read_backplane(ctrl, 4)?;
        if v & DS1_CTRL_REQ_VALID == 0 {
            // Chip never entered DS1 since the last release; nothing to do.
            return Ok(());
        }
        debug!("power: exiting ds1");
        self.bus.write_backplane(ctrl, 4, v | DS1_CTRL_EXIT)?;
        for _ in 0..DS1_EXIT_MAX_POLLS {
            let v = self.bus.read_backplane(ctrl, 4)?;
            if v & DS1_CTRL_PROC_DONE != 0 {
                self.bus.write_backplane(PMU_MIN_RES_MASK_ADDR, 4, self.pmu_min_res_mask)?;
                return Ok(());
            }
            self.os.delay_ms(DS1_EXIT_POLL_MS);
        }
        warn!("power: ds1 exit handshake timed out");
        Err(WifiError::BusUpFail)
    }
}
