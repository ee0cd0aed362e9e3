//! Event dispatcher
//!
//! Firmware pushes asynchronous event frames on the event channel. Frames
//! are validated against the vendor framing, decoded into an `EventHeader`
//! and routed to handlers subscribed by `(interface, event code)`. Handlers
//! run on the driver worker thread, must stay O(1) and must never issue
//! nested control commands (that would deadlock against the command mutex).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::driver::Driver;
use crate::error::{WifiError, WifiResult};
use crate::mac::MacAddress;

/// Firmware event codes
pub mod event_code {
    pub const SET_SSID: u32 = 0;
    pub const JOIN: u32 = 1;
    pub const AUTH: u32 = 3;
    pub const DEAUTH: u32 = 5;
    pub const DEAUTH_IND: u32 = 6;
    pub const ASSOC: u32 = 7;
    pub const DISASSOC: u32 = 11;
    pub const DISASSOC_IND: u32 = 12;
    pub const LINK: u32 = 16;
    pub const PSK_SUP: u32 = 46;
    pub const ESCAN_RESULT: u32 = 69;
    pub const CSA_COMPLETE_IND: u32 = 80;
    pub const EXT_AUTH_REQ: u32 = 187;
    pub const EXT_AUTH_FRAME_RX: u32 = 188;
    pub const ICMP_ECHO_REQ: u32 = 190;
}

/// Event status values
pub mod event_status {
    pub const SUCCESS: u32 = 0;
    pub const FAIL: u32 = 1;
    pub const TIMEOUT: u32 = 2;
    pub const NO_NETWORKS: u32 = 3;
    pub const ABORT: u32 = 4;
    pub const NO_ACK: u32 = 5;
    pub const UNSOLICITED: u32 = 6;
    pub const ATTEMPT: u32 = 7;
    pub const PARTIAL: u32 = 8;
    pub const NEWSCAN: u32 = 9;
    pub const NEWASSOC: u32 = 10;
}

/// Event flag bits
pub mod event_flag {
    /// Carried by `LINK`: the link is up
    pub const LINK_UP: u16 = 0x01;
}

/// Handler categories an interface can hold a registration for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerCategory {
    Join = 0,
    Scan = 1,
    Auth = 2,
    IcmpEchoReq = 3,
}

pub const HANDLER_CATEGORIES: usize = 4;

/// Event lists per handler family
pub const JOIN_EVENTS: &[u32] = &[
    event_code::SET_SSID,
    event_code::LINK,
    event_code::AUTH,
    event_code::DEAUTH_IND,
    event_code::DISASSOC_IND,
    event_code::PSK_SUP,
    event_code::CSA_COMPLETE_IND,
];
pub const SCAN_EVENTS: &[u32] = &[event_code::ESCAN_RESULT];
pub const AUTH_EVENTS: &[u32] = &[event_code::EXT_AUTH_REQ, event_code::EXT_AUTH_FRAME_RX];
pub const ICMP_ECHO_REQ_EVENTS: &[u32] = &[event_code::ICMP_ECHO_REQ];

// Vendor event framing: an ethernet frame with the Broadcom link-control
// ether type, the Broadcom OUI and the BCM event subtypes. All event-message
// integers are big-endian, unlike the control path.
const ETHER_TYPE_LINK_CTL: u16 = 0x886C;
const BRCM_OUI: [u8; 3] = [0x00, 0x10, 0x18];
const BCMILCP_SUBTYPE_VENDOR_LONG: u16 = 32769;
const BCMILCP_BCM_SUBTYPE_EVENT: u16 = 1;

const ETH_HEADER_SIZE: usize = 14;
const BCM_HEADER_SIZE: usize = 10;
const EVENT_MESSAGE_SIZE: usize = 48;
pub const EVENT_FRAME_HEADER_SIZE: usize =
    ETH_HEADER_SIZE + BCM_HEADER_SIZE + EVENT_MESSAGE_SIZE;

fn get_u16_be(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn get_u32_be(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Decoded firmware event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub event_type: u32,
    pub status: u32,
    pub reason: u32,
    pub auth_type: u32,
    pub flags: u16,
    pub addr: MacAddress,
    pub datalen: u32,
    pub interface: u8,
    pub bss_index: u8,
}

/// Validate and decode one event frame (ethernet frame onward).
///
/// Returns the header and the borrowed event data.
pub fn parse_event_frame(frame: &[u8]) -> WifiResult<(EventHeader, &[u8])> {
    if frame.len() < EVENT_FRAME_HEADER_SIZE {
        return Err(WifiError::BadLength);
    }
    if get_u16_be(frame, 12) != ETHER_TYPE_LINK_CTL {
        return Err(WifiError::BadArg);
    }
    if get_u16_be(frame, 14) != BCMILCP_SUBTYPE_VENDOR_LONG {
        return Err(WifiError::BadArg);
    }
    if frame[19..22] != BRCM_OUI {
        return Err(WifiError::BadArg);
    }
    if get_u16_be(frame, 22) != BCMILCP_BCM_SUBTYPE_EVENT {
        return Err(WifiError::BadArg);
    }
    let msg = ETH_HEADER_SIZE + BCM_HEADER_SIZE;
    let header = EventHeader {
        flags: get_u16_be(frame, msg + 2),
        event_type: get_u32_be(frame, msg + 4),
        status: get_u32_be(frame, msg + 8),
        reason: get_u32_be(frame, msg + 12),
        auth_type: get_u32_be(frame, msg + 16),
        datalen: get_u32_be(frame, msg + 20),
        addr: MacAddress::from_wire(frame, msg + 24)?,
        interface: frame[msg + 46],
        bss_index: frame[msg + 47],
    };
    let data_start = EVENT_FRAME_HEADER_SIZE;
    let data_end = data_start + header.datalen as usize;
    if data_end > frame.len() {
        return Err(WifiError::BadLength);
    }
    Ok((header, &frame[data_start..data_end]))
}

/// Per-category event handler run on the driver worker thread.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, driver: &Driver, header: &EventHeader, data: &[u8]);
}

/// Stable id returned by registration, used for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId(pub(crate) u8);

struct Subscription {
    iface: u8,
    events: &'static [u32],
    handler: Arc<dyn EventHandler>,
}

/// Subscription table size shared by all interfaces
pub const MAX_EVENT_SUBSCRIPTIONS: usize = 12;

/// Routing table from `(interface, event code)` to registered handlers.
///
/// Registration and deregistration happen on the application thread; the
/// dispatcher snapshots matching handlers under the read lock and invokes
/// them after dropping it.
pub struct EventDispatcher {
    table: spin::RwLock<[Option<Subscription>; MAX_EVENT_SUBSCRIPTIONS]>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher { table: spin::RwLock::new(core::array::from_fn(|_| None)) }
    }

    /// Subscribe a handler for a list of event codes on one interface.
    pub fn register(
        &self,
        iface: u8,
        events: &'static [u32],
        handler: Arc<dyn EventHandler>,
    ) -> WifiResult<EntryId> {
        let mut table = self.table.write();
        for (i, slot) in table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Subscription { iface, events, handler });
                return Ok(EntryId(i as u8));
            }
        }
        Err(WifiError::TooManySubscriptions)
    }

    /// Remove a subscription. Removing an empty slot is a no-op.
    pub fn deregister(&self, entry: EntryId) {
        let mut table = self.table.write();
        if let Some(slot) = table.get_mut(entry.0 as usize) {
            *slot = None;
        }
    }

    pub(crate) fn handlers_for(&self, iface: u8, event: u32) -> Vec<Arc<dyn EventHandler>> {
        let table = self.table.read();
        table
            .iter()
            .flatten()
            .filter(|s| s.iface == iface && s.events.contains(&event))
            .map(|s| s.handler.clone())
            .collect()
    }

    /// Route one decoded event to its subscribers, in arrival order.
    pub(crate) fn dispatch(&self, driver: &Driver, header: &EventHeader, data: &[u8]) {
        let handlers = self.handlers_for(header.interface, header.event_type);
        if handlers.is_empty() {
            return;
        }
        for handler in handlers {
            handler.on_event(driver, header, data);
        }
    }

    /// Drop every subscription for one interface (interface teardown).
    pub(crate) fn deregister_interface(&self, iface: u8) {
        let mut table = self.table.write();
        for slot in table.iter_mut() {
            if slot.as_ref().map(|s| s.iface == iface).unwrap_or(false) {
                *slot = None;
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
