//! Host driver core for external 802.11 modules
//!
//! Controls firmware-offloaded Wi-Fi silicon over a byte-addressed bus
//! (SDIO, SPI or a memory-mapped transport) and presents a station
//! management surface to upper networking layers. The crate owns the
//! control-message codec, the serialized command channel, asynchronous
//! event dispatch, the bus-power interlock and the station join and scan
//! state machines; bus transports, packet pools and threads are platform
//! capabilities supplied by the port.
//!
//! Typical bring-up:
//!
//! ```ignore
//! let driver = Driver::init(bus, pool, os)?;
//! // platform worker: loop { driver.service()?; }
//! driver.set_up()?;
//! driver.join(InterfaceId::PRIMARY, &ssid, Security::Wpa2AesPsk, b"passphrase")?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod chanspec;
pub mod chip;
pub mod codec;
pub mod command;
pub mod driver;
pub mod error;
pub mod event;
pub mod ie;
pub mod join;
pub mod mac;
pub mod platform;
pub mod power;
pub mod scan;

#[cfg(test)]
pub(crate) mod testutil;

pub use chanspec::{Band, Chanspec};
pub use chip::{ChipInfo, WakeMethod};
pub use driver::{
    Driver, IcmpEchoCallback, InterfaceId, PowerSaveMode, Role, WlanState, MAX_INTERFACES,
    MAX_PMKID_ENTRIES, PM2_SLEEP_RET_TIME_MAX_MS, PM2_SLEEP_RET_TIME_MIN_MS,
};
pub use error::{ignore_unsupported, WifiError, WifiResult};
pub use event::{EntryId, EventHandler, EventHeader, HandlerCategory};
pub use join::{
    classify, AuthCallback, AuthStatus, JoinProgress, JoinStatus, Security,
    DEFAULT_EAPOL_KEY_PACKET_TIMEOUT_MS, DEFAULT_JOIN_ATTEMPT_TIMEOUT_MS,
};
pub use mac::{MacAddress, Ssid, SSID_MAX_LEN};
pub use platform::{
    Buffer, BufferDir, BufferPool, Bus, BusFunction, HostOs, Semaphore, TransferDirection,
};
pub use scan::{
    BssType, ScanCallback, ScanFilters, ScanFlags, ScanResult, ScanStatus, ScanType,
    SecurityInfo,
};
