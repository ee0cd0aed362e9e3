//! Control-message codec
//!
//! Encodes IOCTL and IOVAR requests onto pooled buffers and decodes the
//! responses and wire aggregates the firmware returns. All control-path
//! integers are little-endian on the wire; event messages are the one
//! big-endian exception and are handled in `event.rs`.

use alloc::vec::Vec;

use crate::error::{WifiError, WifiResult};
use crate::mac::MacAddress;

/// Negotiated upper bound for one framed IOVAR request
pub const IOVAR_MAX_LEN: usize = 8192;

/// Byte-order helpers for on-wire fields.
///
/// The dongle is little-endian; these are identities on LE hosts but every
/// wire field goes through them so the intent survives on any host.
#[inline]
pub fn host_to_dongle_16(v: u16) -> u16 {
    v.to_le()
}

#[inline]
pub fn host_to_dongle_32(v: u32) -> u32 {
    v.to_le()
}

#[inline]
pub fn dongle_to_host_16(v: u16) -> u16 {
    u16::from_le(v)
}

#[inline]
pub fn dongle_to_host_32(v: u32) -> u32 {
    u32::from_le(v)
}

#[inline]
pub(crate) fn get_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn get_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn put_u16_le(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u32_le(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Firmware IOCTL command numbers
pub mod wlc {
    pub const WLC_UP: u32 = 2;
    pub const WLC_DOWN: u32 = 3;
    pub const WLC_SET_INFRA: u32 = 20;
    pub const WLC_SET_AUTH: u32 = 22;
    pub const WLC_GET_BSSID: u32 = 23;
    pub const WLC_SET_SSID: u32 = 26;
    pub const WLC_GET_CHANNEL: u32 = 29;
    pub const WLC_SET_CHANNEL: u32 = 30;
    pub const WLC_DISASSOC: u32 = 52;
    pub const WLC_SET_BCNPRD: u32 = 76;
    pub const WLC_SET_DTIMPRD: u32 = 78;
    pub const WLC_GET_PM: u32 = 85;
    pub const WLC_SET_PM: u32 = 86;
    pub const WLC_SET_GMODE: u32 = 110;
    pub const WLC_GET_RSSI: u32 = 127;
    pub const WLC_SET_WSEC: u32 = 134;
    pub const WLC_GET_BSS_INFO: u32 = 136;
    pub const WLC_GET_ASSOCLIST: u32 = 159;
    pub const WLC_SET_WPA_AUTH: u32 = 165;
    pub const WLC_SCB_DEAUTHENTICATE_FOR_REASON: u32 = 201;
    pub const WLC_GET_VAR: u32 = 262;
    pub const WLC_SET_VAR: u32 = 263;
    pub const WLC_SET_WSEC_PMK: u32 = 268;
    pub const WLC_SET_CUSTOM_COUNTRY: u32 = 319;
}

/// Firmware error statuses surfaced through the CDC status field
pub mod bcme {
    pub const OK: i32 = 0;
    pub const UNSUPPORTED: i32 = -23;
}

// ---------------------------------------------------------------------------
// Bus framing
// ---------------------------------------------------------------------------

pub const SDPCM_HEADER_SIZE: usize = 12;

/// Logical channel carried in the SDPCM header
pub const CHANNEL_CONTROL: u8 = 0;
pub const CHANNEL_EVENT: u8 = 1;
pub const CHANNEL_DATA: u8 = 2;

/// Software bus header preceding every frame in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpcmHeader {
    pub len: u16,
    pub len_inv: u16,
    pub sequence: u8,
    pub channel_and_flags: u8,
    pub next_length: u8,
    pub header_length: u8,
    pub flow_control: u8,
    pub bus_data_credit: u8,
}

impl SdpcmHeader {
    pub fn new(total_len: u16, sequence: u8, channel: u8) -> Self {
        SdpcmHeader {
            len: total_len,
            len_inv: !total_len,
            sequence,
            channel_and_flags: channel,
            next_length: 0,
            header_length: SDPCM_HEADER_SIZE as u8,
            flow_control: 0,
            bus_data_credit: 0,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        put_u16_le(buf, 0, self.len);
        put_u16_le(buf, 2, self.len_inv);
        buf[4] = self.sequence;
        buf[5] = self.channel_and_flags;
        buf[6] = self.next_length;
        buf[7] = self.header_length;
        buf[8] = self.flow_control;
        buf[9] = self.bus_data_credit;
        buf[10] = 0;
        buf[11] = 0;
    }

    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < SDPCM_HEADER_SIZE {
            return Err(WifiError::BadLength);
        }
        let hdr = SdpcmHeader {
            len: get_u16_le(buf, 0),
            len_inv: get_u16_le(buf, 2),
            sequence: buf[4],
            channel_and_flags: buf[5],
            next_length: buf[6],
            header_length: buf[7],
            flow_control: buf[8],
            bus_data_credit: buf[9],
        };
        if hdr.len != !hdr.len_inv || (hdr.header_length as usize) < SDPCM_HEADER_SIZE {
            return Err(WifiError::BadLength);
        }
        Ok(hdr)
    }

    pub fn channel(&self) -> u8 {
        self.channel_and_flags & 0x0F
    }
}

pub const BDC_HEADER_SIZE: usize = 4;

/// Per-packet header on the event and data channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdcHeader {
    pub flags: u8,
    pub priority: u8,
    pub flags2: u8,
    /// Offset of the payload past this header, in 4-byte words
    pub data_offset: u8,
}

impl BdcHeader {
    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < BDC_HEADER_SIZE {
            return Err(WifiError::BadLength);
        }
        Ok(BdcHeader { flags: buf[0], priority: buf[1], flags2: buf[2], data_offset: buf[3] })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.flags;
        buf[1] = self.priority;
        buf[2] = self.flags2;
        buf[3] = self.data_offset;
    }
}

// ---------------------------------------------------------------------------
// CDC control header
// ---------------------------------------------------------------------------

pub const CDC_HEADER_SIZE: usize = 16;

/// Set-direction flag in the CDC flags word
pub const CDCF_IOC_SET: u32 = 0x02;
const CDCF_IFACE_SHIFT: u32 = 12;
const CDCF_IFACE_MASK: u32 = 0xF000;
const CDCF_ID_SHIFT: u32 = 16;

/// Control-message header: command id, caller-side maximum output length,
/// flags (direction, interface, transaction id) and the firmware-set status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcHeader {
    pub cmd: u32,
    pub len: u32,
    pub flags: u32,
    pub status: u32,
}

impl CdcHeader {
    pub fn request(cmd: u32, len: u32, set: bool, iface: u8, tx_id: u16) -> Self {
        let mut flags = (tx_id as u32) << CDCF_ID_SHIFT;
        flags |= ((iface as u32) << CDCF_IFACE_SHIFT) & CDCF_IFACE_MASK;
        if set {
            flags |= CDCF_IOC_SET;
        }
        CdcHeader { cmd, len, flags, status: 0 }
    }

    /// Transaction id carried in the flags word
    pub fn tx_id(&self) -> u16 {
        (self.flags >> CDCF_ID_SHIFT) as u16
    }

    /// Firmware status as a signed error code
    pub fn status_code(&self) -> i32 {
        self.status as i32
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        put_u32_le(buf, 0, host_to_dongle_32(self.cmd));
        put_u32_le(buf, 4, host_to_dongle_32(self.len));
        put_u32_le(buf, 8, host_to_dongle_32(self.flags));
        put_u32_le(buf, 12, host_to_dongle_32(self.status));
    }

    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < CDC_HEADER_SIZE {
            return Err(WifiError::BadLength);
        }
        Ok(CdcHeader {
            cmd: dongle_to_host_32(get_u32_le(buf, 0)),
            len: dongle_to_host_32(get_u32_le(buf, 4)),
            flags: dongle_to_host_32(get_u32_le(buf, 8)),
            status: dongle_to_host_32(get_u32_le(buf, 12)),
        })
    }
}

/// Frame an IOVAR payload: NUL-terminated name, the 4-byte little-endian
/// bss index for `bsscfg:`-scoped variables, then the typed argument.
pub fn iovar_payload(name: &str, bss_index: Option<u32>, value: &[u8]) -> WifiResult<Vec<u8>> {
    let scoped = name.starts_with("bsscfg:");
    let index_len = if scoped { 4 } else { 0 };
    let total = name.len() + 1 + index_len + value.len();
    if total > IOVAR_MAX_LEN {
        return Err(WifiError::BadLength);
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    if scoped {
        out.extend_from_slice(&host_to_dongle_32(bss_index.unwrap_or(0)).to_le_bytes());
    }
    out.extend_from_slice(value);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Wire aggregates
// ---------------------------------------------------------------------------

pub const WLC_SSID_SIZE: usize = 36;

/// Length-prefixed SSID as carried in SetSsid and scan/join parameters.
pub fn write_wlc_ssid(buf: &mut [u8], ssid: &crate::mac::Ssid) {
    put_u32_le(buf, 0, ssid.len() as u32);
    buf[4..36].copy_from_slice(ssid.raw());
}

pub const WSEC_PMK_SIZE: usize = 68;
pub const WSEC_MAX_PSK_LEN: usize = 64;
pub const WSEC_MIN_PSK_LEN: usize = 8;
/// Key material is a passphrase, not a raw PMK
pub const WSEC_PASSPHRASE: u16 = 0x01;

/// Pre-shared key install block for the SetWsecPmk command.
pub fn wsec_pmk_bytes(key: &[u8], flags: u16) -> [u8; WSEC_PMK_SIZE] {
    let mut out = [0u8; WSEC_PMK_SIZE];
    put_u16_le(&mut out, 0, key.len() as u16);
    put_u16_le(&mut out, 2, flags);
    out[4..4 + key.len()].copy_from_slice(key);
    out
}

pub const WSEC_MAX_SAE_PASSWORD_LEN: usize = 128;
pub const WSEC_SAE_PASSWORD_SIZE: usize = 130;

/// SAE password block for the `sae_password` variable.
pub fn sae_password_bytes(password: &[u8]) -> [u8; WSEC_SAE_PASSWORD_SIZE] {
    let mut out = [0u8; WSEC_SAE_PASSWORD_SIZE];
    put_u16_le(&mut out, 0, password.len() as u16);
    out[2..2 + password.len()].copy_from_slice(password);
    out
}

pub const CHAN_SWITCH_SIZE: usize = 6;

/// AP-initiated channel switch announcement body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanSwitch {
    pub mode: u8,
    pub count: u8,
    pub chspec: u16,
    pub reg: u8,
    pub frame_type: u8,
}

impl ChanSwitch {
    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < CHAN_SWITCH_SIZE {
            return Err(WifiError::BadLength);
        }
        Ok(ChanSwitch {
            mode: buf[0],
            count: buf[1],
            chspec: dongle_to_host_16(get_u16_le(buf, 2)),
            reg: buf[4],
            frame_type: buf[5],
        })
    }
}

pub const PMKID_SIZE: usize = 22;

/// One PMKID cache entry: BSSID plus the 16-byte identifier.
pub fn write_pmkid(buf: &mut [u8], bssid: &MacAddress, id: &[u8; 16]) {
    bssid.write_to(buf, 0);
    buf[6..22].copy_from_slice(id);
}

/// Serialize a PMKID list for the `pmkid_info` variable.
pub fn pmkid_list_bytes(entries: &[(MacAddress, [u8; 16])]) -> Vec<u8> {
    let mut out = alloc::vec![0u8; 4 + entries.len() * PMKID_SIZE];
    put_u32_le(&mut out, 0, entries.len() as u32);
    for (i, (bssid, id)) in entries.iter().enumerate() {
        write_pmkid(&mut out[4 + i * PMKID_SIZE..], bssid, id);
    }
    out
}

/// Parse a MAC list response (associated-client query).
pub fn parse_maclist(buf: &[u8]) -> WifiResult<Vec<MacAddress>> {
    if buf.len() < 4 {
        return Err(WifiError::BadLength);
    }
    let count = dongle_to_host_32(get_u32_le(buf, 0)) as usize;
    if buf.len() < 4 + count * 6 {
        return Err(WifiError::BadLength);
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(MacAddress::from_wire(buf, 4 + i * 6)?);
    }
    Ok(out)
}

pub const SCB_VAL_SIZE: usize = 10;

/// Per-station value block: i32 value followed by the station address.
pub fn scb_val_bytes(val: i32, mac: &MacAddress) -> [u8; SCB_VAL_SIZE] {
    let mut out = [0u8; SCB_VAL_SIZE];
    put_u32_le(&mut out, 0, val as u32);
    mac.write_to(&mut out, 4);
    out
}

pub const COUNTRY_SIZE: usize = 12;

/// Country aggregate for the custom-country command: NUL-padded abbrev,
/// revision (-1 = any) and the country code proper.
pub fn country_bytes(code: &[u8; 2], rev: i32) -> [u8; COUNTRY_SIZE] {
    let mut out = [0u8; COUNTRY_SIZE];
    out[0] = code[0];
    out[1] = code[1];
    put_u32_le(&mut out, 4, rev as u32);
    out[8] = code[0];
    out[9] = code[1];
    out
}

pub const CHANNEL_INFO_SIZE: usize = 12;

/// GetChannel response: hardware, target and scan channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub hw_channel: u32,
    pub target_channel: u32,
    pub scan_channel: u32,
}

impl ChannelInfo {
    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < CHANNEL_INFO_SIZE {
            return Err(WifiError::BadLength);
        }
        Ok(ChannelInfo {
            hw_channel: dongle_to_host_32(get_u32_le(buf, 0)),
            target_channel: dongle_to_host_32(get_u32_le(buf, 4)),
            scan_channel: dongle_to_host_32(get_u32_le(buf, 8)),
        })
    }
}

pub const WOWL_PATTERN_SIZE: usize = 28;

/// Wake-on-WLAN pattern header; mask and pattern bytes follow it.
pub fn wowl_pattern_bytes(
    id: u32,
    offset: u32,
    mask: &[u8],
    pattern: &[u8],
) -> Vec<u8> {
    let mut out = alloc::vec![0u8; WOWL_PATTERN_SIZE + mask.len() + pattern.len()];
    put_u32_le(&mut out, 0, mask.len() as u32);
    put_u32_le(&mut out, 4, offset);
    put_u32_le(&mut out, 8, (WOWL_PATTERN_SIZE + mask.len()) as u32);
    put_u32_le(&mut out, 12, pattern.len() as u32);
    put_u32_le(&mut out, 16, id);
    put_u32_le(&mut out, 20, 0);
    put_u32_le(&mut out, 24, 0);
    out[WOWL_PATTERN_SIZE..WOWL_PATTERN_SIZE + mask.len()].copy_from_slice(mask);
    out[WOWL_PATTERN_SIZE + mask.len()..].copy_from_slice(pattern);
    out
}

pub const TKO_HEADER_SIZE: usize = 4;

/// TCP keep-offload sub-command header; the typed body follows.
pub fn tko_bytes(subcmd: u16, body: &[u8]) -> Vec<u8> {
    let mut out = alloc::vec![0u8; TKO_HEADER_SIZE + body.len()];
    put_u16_le(&mut out, 0, subcmd);
    put_u16_le(&mut out, 2, body.len() as u16);
    out[TKO_HEADER_SIZE..].copy_from_slice(body);
    out
}

// ---------------------------------------------------------------------------
// Scan / join aggregates
// ---------------------------------------------------------------------------

pub const SCAN_PARAMS_FIXED_SIZE: usize = 64;
pub const ESCAN_PARAMS_FIXED_SIZE: usize = 8 + SCAN_PARAMS_FIXED_SIZE;

pub const ESCAN_REQ_VERSION: u32 = 1;
pub const ESCAN_ACTION_START: u16 = 1;
pub const ESCAN_ACTION_CONTINUE: u16 = 2;
pub const ESCAN_ACTION_ABORT: u16 = 3;

/// `-1` sentinel telling firmware to use its own default for a scan knob
pub const SCAN_PARAM_DEFAULT: i32 = -1;

/// Scan request parameters; `channel_list` empty means every channel.
pub struct ScanParams<'a> {
    pub ssid: crate::mac::Ssid,
    pub bssid: MacAddress,
    pub bss_type: u8,
    pub scan_type: u8,
    pub nprobes: i32,
    pub active_time: i32,
    pub passive_time: i32,
    pub home_time: i32,
    pub channel_list: &'a [u16],
}

impl<'a> ScanParams<'a> {
    fn write_fixed(&self, buf: &mut [u8]) {
        write_wlc_ssid(&mut buf[0..36], &self.ssid);
        self.bssid.write_to(buf, 36);
        buf[42] = self.bss_type;
        buf[43] = self.scan_type;
        put_u32_le(buf, 44, self.nprobes as u32);
        put_u32_le(buf, 48, self.active_time as u32);
        put_u32_le(buf, 52, self.passive_time as u32);
        put_u32_le(buf, 56, self.home_time as u32);
        put_u32_le(buf, 60, self.channel_list.len() as u32);
    }
}

/// Serialize an extended-scan request for the `escan` variable.
pub fn escan_params_bytes(action: u16, sync_id: u16, params: &ScanParams<'_>) -> Vec<u8> {
    let mut out =
        alloc::vec![0u8; ESCAN_PARAMS_FIXED_SIZE + params.channel_list.len() * 2];
    put_u32_le(&mut out, 0, ESCAN_REQ_VERSION);
    put_u16_le(&mut out, 4, action);
    put_u16_le(&mut out, 6, sync_id);
    params.write_fixed(&mut out[8..]);
    for (i, &cs) in params.channel_list.iter().enumerate() {
        put_u16_le(&mut out, ESCAN_PARAMS_FIXED_SIZE + i * 2, host_to_dongle_16(cs));
    }
    out
}

pub const ESCAN_RESULT_HEADER_SIZE: usize = 12;

/// Header of one streamed partial scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscanResultHeader {
    pub buflen: u32,
    pub version: u32,
    pub sync_id: u16,
    pub bss_count: u16,
}

impl EscanResultHeader {
    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < ESCAN_RESULT_HEADER_SIZE {
            return Err(WifiError::BadLength);
        }
        let hdr = EscanResultHeader {
            buflen: dongle_to_host_32(get_u32_le(buf, 0)),
            version: dongle_to_host_32(get_u32_le(buf, 4)),
            sync_id: dongle_to_host_16(get_u16_le(buf, 8)),
            bss_count: dongle_to_host_16(get_u16_le(buf, 10)),
        };
        if hdr.buflen as usize > buf.len() {
            return Err(WifiError::BadLength);
        }
        Ok(hdr)
    }
}

pub const EXT_JOIN_PARAMS_FIXED_SIZE: usize = 68;

/// Serialize an extended-join request for the `join` variable: target SSID,
/// assoc-scan knobs (firmware defaults) and the BSSID/chanspec constraint.
pub fn ext_join_params_bytes(
    ssid: &crate::mac::Ssid,
    bssid: &MacAddress,
    chanspecs: &[u16],
) -> Vec<u8> {
    let mut out = alloc::vec![0u8; EXT_JOIN_PARAMS_FIXED_SIZE + chanspecs.len() * 2];
    write_wlc_ssid(&mut out[0..36], ssid);
    out[36] = 0; // active assoc scan
    put_u32_le(&mut out, 40, SCAN_PARAM_DEFAULT as u32);
    put_u32_le(&mut out, 44, SCAN_PARAM_DEFAULT as u32);
    put_u32_le(&mut out, 48, SCAN_PARAM_DEFAULT as u32);
    put_u32_le(&mut out, 52, SCAN_PARAM_DEFAULT as u32);
    bssid.write_to(&mut out, 56);
    put_u16_le(&mut out, 62, 0);
    put_u32_le(&mut out, 64, chanspecs.len() as u32);
    for (i, &cs) in chanspecs.iter().enumerate() {
        put_u16_le(&mut out, EXT_JOIN_PARAMS_FIXED_SIZE + i * 2, host_to_dongle_16(cs));
    }
    out
}

// ---------------------------------------------------------------------------
// BSS info record (version 109)
// ---------------------------------------------------------------------------

pub const BSS_INFO_VERSION: u32 = 109;
pub const BSS_INFO_FIXED_SIZE: usize = 128;

/// Capability field bits
pub const DOT11_CAP_ESS: u16 = 0x0001;
pub const DOT11_CAP_IBSS: u16 = 0x0002;
pub const DOT11_CAP_PRIVACY: u16 = 0x0010;

/// BSS info flags
pub const BSS_FLAG_FROM_BEACON: u8 = 0x01;
pub const BSS_FLAG_RSSI_ONCHANNEL: u8 = 0x04;

/// One firmware BSS observation. Fixed 128-byte layout; the IE blob sits at
/// `ie_offset` from the start of the record.
#[derive(Debug, Clone)]
pub struct BssInfo {
    pub version: u32,
    pub length: u32,
    pub bssid: MacAddress,
    pub beacon_period: u16,
    pub capability: u16,
    pub ssid_len: u8,
    pub ssid: [u8; 32],
    pub rateset_count: u32,
    pub rateset: [u8; 16],
    pub chanspec: u16,
    pub atim_window: u16,
    pub dtim_period: u8,
    pub rssi: i16,
    pub phy_noise: i8,
    pub n_cap: u8,
    pub nbss_cap: u32,
    pub ctl_ch: u8,
    pub flags: u8,
    pub basic_mcs: [u8; 16],
    pub ie_offset: u16,
    pub ie_length: u32,
    pub snr: i16,
}

impl BssInfo {
    pub fn from_bytes(buf: &[u8]) -> WifiResult<Self> {
        if buf.len() < BSS_INFO_FIXED_SIZE {
            return Err(WifiError::BadLength);
        }
        let version = dongle_to_host_32(get_u32_le(buf, 0));
        if version != BSS_INFO_VERSION {
            return Err(WifiError::BadLength);
        }
        let mut ssid = [0u8; 32];
        ssid.copy_from_slice(&buf[19..51]);
        let mut rateset = [0u8; 16];
        rateset.copy_from_slice(&buf[56..72]);
        let mut basic_mcs = [0u8; 16];
        basic_mcs.copy_from_slice(&buf[100..116]);
        let info = BssInfo {
            version,
            length: dongle_to_host_32(get_u32_le(buf, 4)),
            bssid: MacAddress::from_wire(buf, 8)?,
            beacon_period: dongle_to_host_16(get_u16_le(buf, 14)),
            capability: dongle_to_host_16(get_u16_le(buf, 16)),
            ssid_len: buf[18].min(32),
            ssid,
            rateset_count: dongle_to_host_32(get_u32_le(buf, 52)),
            rateset,
            chanspec: dongle_to_host_16(get_u16_le(buf, 72)),
            atim_window: dongle_to_host_16(get_u16_le(buf, 74)),
            dtim_period: buf[76],
            rssi: get_u16_le(buf, 78) as i16,
            phy_noise: buf[80] as i8,
            n_cap: buf[81],
            nbss_cap: dongle_to_host_32(get_u32_le(buf, 84)),
            ctl_ch: buf[88],
            flags: buf[96],
            basic_mcs,
            ie_offset: dongle_to_host_16(get_u16_le(buf, 116)),
            ie_length: dongle_to_host_32(get_u32_le(buf, 120)),
            snr: get_u16_le(buf, 124) as i16,
        };
        // IE window must sit inside the record's declared length.
        let ie_end = info.ie_offset as usize + info.ie_length as usize;
        if info.ie_offset as usize > buf.len()
            || ie_end > buf.len()
            || (info.length as usize) < BSS_INFO_FIXED_SIZE
            || ie_end > info.length as usize
        {
            return Err(WifiError::BadLength);
        }
        Ok(info)
    }

    /// Borrow the IE blob out of the record buffer this was parsed from
    pub fn ies<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[self.ie_offset as usize..self.ie_offset as usize + self.ie_length as usize]
    }
}
