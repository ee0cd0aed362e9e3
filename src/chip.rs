//! Chip family dispatch
//!
//! Wake strategy, capability flags and memory geometry differ per silicon
//! family. Everything chip-specific is captured here once at init from the
//! chip id; the rest of the driver asks `ChipInfo`, never the id.

use crate::error::{WifiError, WifiResult};

/// How the bus-power interlock brings the chip to the awake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMethod {
    /// Keep-SDIO-On handshake through the sleep CSR
    Kso,
    /// Legacy clock-gate: request HT clock and poll availability
    HtClock,
}

/// Chip-specific parameters resolved from the chip id.
#[derive(Debug, Clone, Copy)]
pub struct ChipInfo {
    /// Raw chip id as read from the chipcommon core
    pub id: u32,
    /// Awake-state strategy
    pub wake: WakeMethod,
    /// Firmware retains state across deep sleep (save/restore)
    pub save_restore: bool,
    /// Chip supports the DS1 retention state
    pub ds1: bool,
    /// Firmware carries an internal SAE handshake
    pub sae: bool,
    /// TKIP group-key rotation must be programmed per-bss on this silicon
    pub tkip_bsscfg_quirk: bool,
    /// PMU minimum-resource mask rewritten on DS1 exit
    pub pmu_min_res_mask: u32,
    /// Base of the firmware RAM window
    pub ram_base: u32,
    /// Size of the firmware RAM window
    pub ram_size: u32,
}

/// Default PMU minimum-resource mask restored after deep-sleep exit
const DEFAULT_MIN_RES_MASK: u32 = 0x0005_4FFF;

impl ChipInfo {
    /// Resolve chip parameters from the id read at init.
    ///
    /// Unknown ids are refused rather than guessed at; the interlock must
    /// never drive the wrong wake handshake.
    pub fn from_id(id: u32) -> WifiResult<Self> {
        let base = ChipInfo {
            id,
            wake: WakeMethod::Kso,
            save_restore: false,
            ds1: false,
            sae: false,
            tkip_bsscfg_quirk: false,
            pmu_min_res_mask: DEFAULT_MIN_RES_MASK,
            ram_base: 0x0000_0000,
            ram_size: 512 * 1024,
        };
        let info = match id {
            43012 => ChipInfo { save_restore: true, ds1: true, ram_size: 640 * 1024, ..base },
            4373 => ChipInfo { ram_size: 832 * 1024, ..base },
            43022 => ChipInfo { ds1: true, tkip_bsscfg_quirk: true, ..base },
            43909 => ChipInfo { wake: WakeMethod::HtClock, ram_size: 2048 * 1024, ..base },
            43439 => ChipInfo { sae: true, ram_size: 512 * 1024, ..base },
            43430 => ChipInfo { wake: WakeMethod::HtClock, ..base },
            4334 | 43362 => ChipInfo { wake: WakeMethod::HtClock, ram_size: 448 * 1024, ..base },
            55500 | 55530 | 55560 | 55900 => {
                ChipInfo { sae: true, save_restore: true, ram_size: 1024 * 1024, ..base }
            }
            89530 => ChipInfo { sae: true, ..base },
            _ => return Err(WifiError::Unsupported),
        };
        Ok(info)
    }
}
