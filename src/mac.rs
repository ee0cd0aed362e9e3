//! MAC address and SSID types
//!
//! Addressing primitives as they travel on the control channel: addresses
//! are six raw octets embedded at fixed offsets inside wire aggregates,
//! SSIDs a length plus up to 32 opaque bytes.

use core::fmt;

use crate::error::{WifiError, WifiResult};

/// Octets of a MAC address in every wire aggregate
pub const MAC_ADDRESS_LEN: usize = 6;

/// 48-bit IEEE address in transmission order, as carried in control
/// messages, event frames and BSS records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MacAddress([u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    /// All-ones address: broadcast on the air; firmware also reads it as
    /// "match any BSSID" in join and deauthentication requests.
    pub const WILDCARD: MacAddress = MacAddress([0xFF; MAC_ADDRESS_LEN]);

    /// All-zero address, the firmware's "no association" sentinel.
    pub const NULL: MacAddress = MacAddress([0; MAC_ADDRESS_LEN]);

    pub const fn new(octets: [u8; MAC_ADDRESS_LEN]) -> Self {
        MacAddress(octets)
    }

    /// Read an address out of a wire buffer at the given offset.
    pub fn from_wire(buf: &[u8], offset: usize) -> WifiResult<Self> {
        match buf.get(offset..offset + MAC_ADDRESS_LEN) {
            Some(bytes) => {
                let mut octets = [0u8; MAC_ADDRESS_LEN];
                octets.copy_from_slice(bytes);
                Ok(MacAddress(octets))
            }
            None => Err(WifiError::BadLength),
        }
    }

    /// Write the address into a wire buffer at the given offset.
    pub fn write_to(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + MAC_ADDRESS_LEN].copy_from_slice(&self.0);
    }

    /// Octets in transmission order
    pub fn octets(&self) -> [u8; MAC_ADDRESS_LEN] {
        self.0
    }

    /// Group bit: set on multicast and broadcast destinations
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// True for the all-ones wildcard/broadcast address
    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD.0
    }

    /// True for the all-zero "not associated" sentinel
    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL.0
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Maximum SSID length in bytes
pub const SSID_MAX_LEN: usize = 32;

/// Service Set Identifier: up to 32 opaque bytes.
///
/// Zero-length values exist (hidden networks in scan results) but are
/// rejected as join targets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ssid {
    len: u8,
    value: [u8; SSID_MAX_LEN],
}

impl Ssid {
    /// Empty SSID (hidden network)
    pub const EMPTY: Ssid = Ssid { len: 0, value: [0; SSID_MAX_LEN] };

    /// Build from raw bytes, rejecting oversize values
    pub fn from_bytes(bytes: &[u8]) -> WifiResult<Self> {
        if bytes.len() > SSID_MAX_LEN {
            return Err(WifiError::BadArg);
        }
        let mut value = [0u8; SSID_MAX_LEN];
        value[..bytes.len()].copy_from_slice(bytes);
        Ok(Ssid { len: bytes.len() as u8, value })
    }

    /// SSID bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.value[..self.len as usize]
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the zero-length (hidden) SSID
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed-size backing array, zero padded
    pub(crate) fn raw(&self) -> &[u8; SSID_MAX_LEN] {
        &self.value
    }
}

impl core::str::FromStr for Ssid {
    type Err = WifiError;

    fn from_str(s: &str) -> WifiResult<Self> {
        Ssid::from_bytes(s.as_bytes())
    }
}

impl fmt::Debug for Ssid {
    /// SSIDs are opaque bytes; print printable ASCII and escape the rest.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.as_bytes() {
            if (0x20..0x7F).contains(&b) {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}
