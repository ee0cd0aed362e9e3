//! Scan engine
//!
//! The host starts an extended scan through the `escan` variable and the
//! firmware streams one BSS record per partial event. Each record's IE blob
//! is walked to derive the security bitset, the peak data rate and the
//! country code before the user callback sees the result.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, warn};

use crate::chanspec::{Band, Chanspec};
use crate::codec::{
    self, escan_params_bytes, BssInfo, EscanResultHeader, ScanParams, BSS_FLAG_RSSI_ONCHANNEL,
    DOT11_CAP_IBSS, DOT11_CAP_PRIVACY, ESCAN_ACTION_ABORT, ESCAN_ACTION_START,
    ESCAN_RESULT_HEADER_SIZE, SCAN_PARAM_DEFAULT,
};
use crate::driver::{Driver, InterfaceId};
use crate::error::{WifiError, WifiResult};
use crate::event::{
    event_status, EventHandler, EventHeader, HandlerCategory, SCAN_EVENTS,
};
use crate::ie::{self, element_id};
use crate::mac::{MacAddress, Ssid};

/// Scan kind requested from firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    /// Send probe requests on each channel
    Active,
    /// Listen for beacons only
    Passive,
}

impl ScanType {
    pub(crate) fn wire(self) -> u8 {
        match self {
            ScanType::Active => 0,
            ScanType::Passive => 1,
        }
    }
}

/// BSS topology filter and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BssType {
    Infrastructure,
    Adhoc,
    Any,
    Unknown,
}

impl BssType {
    pub(crate) fn wire(self) -> u8 {
        match self {
            BssType::Infrastructure => 0,
            BssType::Adhoc => 1,
            BssType::Any | BssType::Unknown => 2,
        }
    }
}

bitflags! {
    /// Security posture of an observed BSS.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecurityInfo: u32 {
        const WEP        = 0x0000_0001;
        const TKIP       = 0x0000_0002;
        const AES        = 0x0000_0004;
        const SHARED     = 0x0000_8000;
        const WPA        = 0x0020_0000;
        const WPA2       = 0x0040_0000;
        const SHA256     = 0x0080_0000;
        const WPA3       = 0x0100_0000;
        const ENTERPRISE = 0x0200_0000;
        const FBT        = 0x0800_0000;
        const WPS        = 0x1000_0000;
        const IBSS       = 0x2000_0000;
    }
}

bitflags! {
    /// Qualifiers attached to one scan observation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScanFlags: u8 {
        /// Signal was sampled off the BSS's primary channel
        const RSSI_OFF_CHANNEL = 0x01;
        /// Record came from a beacon rather than a probe response
        const BEACON = 0x02;
        /// AP advertises SAE hash-to-element
        const SAE_H2E = 0x04;
    }
}

/// Immutable record of one BSS observation.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub ssid: Ssid,
    pub bssid: MacAddress,
    pub band: Band,
    pub channel: u8,
    pub signal_dbm: i16,
    pub bss_type: BssType,
    pub security: SecurityInfo,
    pub max_data_rate_kbps: u32,
    pub country: Option<[u8; 2]>,
    /// Raw IE blob as received
    pub ies: Vec<u8>,
    pub flags: ScanFlags,
}

/// Terminal and progress states surfaced to the scan callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// One more partial result
    Incomplete,
    /// Firmware walked every requested channel
    CompletedSuccessfully,
    /// Scan was aborted (host stop, new scan or new association)
    Aborted,
}

/// Scan callback; partial results arrive one at a time, then exactly one
/// terminal status with no result attached.
pub type ScanCallback = Box<dyn FnMut(ScanStatus, Option<ScanResult>) + Send>;

// ---------------------------------------------------------------------------
// IE-derived attributes
// ---------------------------------------------------------------------------

const RSN_OUI: [u8; 3] = [0x00, 0x0F, 0xAC];
const WPA_OUI: [u8; 3] = [0x00, 0x50, 0xF2];

const AKM_8021X: u8 = 1;
const AKM_PSK: u8 = 2;
const AKM_FT_8021X: u8 = 3;
const AKM_FT_PSK: u8 = 4;
const AKM_8021X_SHA256: u8 = 5;
const AKM_PSK_SHA256: u8 = 6;
const AKM_SAE: u8 = 8;

const CIPHER_TKIP: u8 = 2;
const CIPHER_CCMP_128: u8 = 4;

/// RSNX capability bit: SAE hash-to-element
const RSNX_SAE_H2E: u8 = 0x20;

fn read_u16(buf: &[u8], off: usize) -> WifiResult<u16> {
    if off + 2 > buf.len() {
        return Err(WifiError::BadLength);
    }
    Ok(u16::from_le_bytes([buf[off], buf[off + 1]]))
}

fn cipher_bits(oui: &[u8; 3], suite: &[u8]) -> SecurityInfo {
    if suite.len() < 4 || suite[..3] != oui[..] {
        return SecurityInfo::empty();
    }
    match suite[3] {
        t if t == CIPHER_TKIP => SecurityInfo::TKIP,
        t if t == CIPHER_CCMP_128 => SecurityInfo::AES,
        _ => SecurityInfo::empty(),
    }
}

fn rsn_akm_bits(suite: &[u8]) -> SecurityInfo {
    if suite.len() < 4 || suite[..3] != RSN_OUI[..] {
        return SecurityInfo::empty();
    }
    match suite[3] {
        AKM_PSK => SecurityInfo::WPA2,
        AKM_PSK_SHA256 => SecurityInfo::WPA2 | SecurityInfo::SHA256,
        AKM_SAE => SecurityInfo::WPA3,
        AKM_8021X => SecurityInfo::WPA2 | SecurityInfo::ENTERPRISE,
        AKM_8021X_SHA256 => {
            SecurityInfo::WPA2 | SecurityInfo::ENTERPRISE | SecurityInfo::SHA256
        }
        AKM_FT_PSK => SecurityInfo::WPA2 | SecurityInfo::FBT,
        AKM_FT_8021X => SecurityInfo::WPA2 | SecurityInfo::ENTERPRISE | SecurityInfo::FBT,
        _ => SecurityInfo::empty(),
    }
}

/// Walk one suite list `(count, suite * count)`, returning the accumulated
/// bits and the offset past the list.
fn suite_list(
    buf: &[u8],
    off: usize,
    map: impl Fn(&[u8]) -> SecurityInfo,
) -> WifiResult<(SecurityInfo, usize)> {
    let count = read_u16(buf, off)? as usize;
    let start = off + 2;
    let end = start + count * 4;
    if end > buf.len() {
        return Err(WifiError::BadLength);
    }
    let mut bits = SecurityInfo::empty();
    for i in 0..count {
        bits |= map(&buf[start + i * 4..start + i * 4 + 4]);
    }
    Ok((bits, end))
}

/// Derive the security bitset for one BSS record from its capability field
/// and IE blob. A malformed blob rejects the whole record.
pub fn derive_security(capability: u16, ies: &[u8]) -> WifiResult<SecurityInfo> {
    if let Some(rsn) = ie::find(ies, element_id::RSN)? {
        // version, group suite, pairwise list, AKM list
        let mut bits = SecurityInfo::empty();
        let _version = read_u16(rsn, 0)?;
        if rsn.len() < 6 {
            return Err(WifiError::BadLength);
        }
        bits |= cipher_bits(&RSN_OUI, &rsn[2..6]);
        let (pairwise, off) = suite_list(rsn, 6, |s| cipher_bits(&RSN_OUI, s))?;
        let (akm, _) = suite_list(rsn, off, rsn_akm_bits)?;
        bits |= pairwise | akm;
        return Ok(bits);
    }
    if let Some(wpa) = ie::find_vendor(ies, &WPA_OUI, 1)? {
        let mut bits = SecurityInfo::WPA;
        let _version = read_u16(wpa, 0)?;
        if wpa.len() < 6 {
            return Err(WifiError::BadLength);
        }
        bits |= cipher_bits(&WPA_OUI, &wpa[2..6]);
        let (pairwise, off) = suite_list(wpa, 6, |s| cipher_bits(&WPA_OUI, s))?;
        let (akm, _) = suite_list(wpa, off, |s| {
            if s.len() == 4 && s[..3] == WPA_OUI[..] && s[3] == AKM_8021X {
                SecurityInfo::ENTERPRISE
            } else {
                SecurityInfo::empty()
            }
        })?;
        bits |= pairwise | akm;
        return Ok(bits);
    }
    if capability & DOT11_CAP_PRIVACY != 0 {
        return Ok(SecurityInfo::WEP);
    }
    Ok(SecurityInfo::empty())
}

/// True when the RSNX element advertises hash-to-element SAE.
pub fn sae_h2e(ies: &[u8]) -> WifiResult<bool> {
    match ie::find(ies, element_id::RSNX)? {
        Some(data) if !data.is_empty() => Ok(data[0] & RSNX_SAE_H2E != 0),
        _ => Ok(false),
    }
}

/// Two-letter country code from the country information element.
pub fn country_code(ies: &[u8]) -> WifiResult<Option<[u8; 2]>> {
    match ie::find(ies, element_id::COUNTRY)? {
        Some(data) if data.len() >= 2 => Ok(Some([data[0], data[1]])),
        _ => Ok(None),
    }
}

/// 11n MCS rates in kbps for one spatial stream, long guard interval
const MCS_RATE_20MHZ: [u32; 8] = [6500, 13000, 19500, 26000, 39000, 52000, 58500, 65000];
const MCS_RATE_40MHZ: [u32; 8] =
    [13500, 27000, 40500, 54000, 81000, 108000, 121500, 135000];

/// HT capability-info bits
const HT_CAP_40MHZ: u16 = 0x0002;
const HT_CAP_SGI_20: u16 = 0x0020;
const HT_CAP_SGI_40: u16 = 0x0040;

/// Peak data rate in kbps: the highest advertised MCS combined with channel
/// width and short-GI support, falling back to the legacy rate set.
pub fn max_rate_kbps(rateset: &[u8], ies: &[u8]) -> WifiResult<u32> {
    if let Some(ht) = ie::find(ies, element_id::HT_CAPABILITIES)? {
        if ht.len() >= 19 {
            let cap = u16::from_le_bytes([ht[0], ht[1]]);
            let mcs_set = &ht[3..19];
            let mut highest: Option<usize> = None;
            for bit in 0..128 {
                if mcs_set[bit / 8] & (1 << (bit % 8)) != 0 {
                    highest = Some(bit);
                }
            }
            if let Some(idx) = highest {
                let streams = (idx / 8 + 1) as u32;
                let wide = cap & HT_CAP_40MHZ != 0;
                let base = if wide {
                    MCS_RATE_40MHZ[idx % 8]
                } else {
                    MCS_RATE_20MHZ[idx % 8]
                };
                let sgi = if wide { cap & HT_CAP_SGI_40 != 0 } else { cap & HT_CAP_SGI_20 != 0 };
                let per_stream = if sgi { base * 10 / 9 } else { base };
                return Ok(per_stream * streams);
            }
        }
    }
    // Legacy rate set: units of 500 kbps, basic-rate bit masked off
    Ok(rateset.iter().map(|r| (r & 0x7F) as u32 * 500).max().unwrap_or(0))
}

/// Build a `ScanResult` from one firmware BSS record, or `None` for records
/// dropped by policy (off-channel observations).
pub(crate) fn result_from_record(
    record: &[u8],
    drop_off_channel: bool,
) -> WifiResult<Option<ScanResult>> {
    let info = BssInfo::from_bytes(record)?;
    if drop_off_channel && info.flags & BSS_FLAG_RSSI_ONCHANNEL == 0 {
        // DSSS beacon heard on a neighbouring channel; dropped by default.
        return Ok(None);
    }
    let ies = info.ies(record);
    let mut security = derive_security(info.capability, ies)?;
    let mut flags = ScanFlags::empty();
    if info.flags & BSS_FLAG_RSSI_ONCHANNEL == 0 {
        flags |= ScanFlags::RSSI_OFF_CHANNEL;
    }
    if sae_h2e(ies)? {
        flags |= ScanFlags::SAE_H2E;
    }
    if info.flags & codec::BSS_FLAG_FROM_BEACON != 0 {
        flags |= ScanFlags::BEACON;
    }
    let bss_type = if info.capability & DOT11_CAP_IBSS != 0 {
        security |= SecurityInfo::IBSS;
        BssType::Adhoc
    } else if info.capability & codec::DOT11_CAP_ESS != 0 {
        BssType::Infrastructure
    } else {
        BssType::Unknown
    };
    let chanspec = Chanspec(info.chanspec);
    let channel = if info.ctl_ch != 0 { info.ctl_ch } else { chanspec.channel() };
    let band = chanspec.band().unwrap_or(crate::chanspec::band_for_channel(channel));
    let rates = &info.rateset[..(info.rateset_count as usize).min(info.rateset.len())];
    Ok(Some(ScanResult {
        ssid: Ssid::from_bytes(&info.ssid[..info.ssid_len as usize])?,
        bssid: info.bssid,
        band,
        channel,
        signal_dbm: info.rssi,
        bss_type,
        security,
        max_data_rate_kbps: max_rate_kbps(rates, ies)?,
        country: country_code(ies)?,
        ies: ies.to_vec(),
        flags,
    }))
}

// ---------------------------------------------------------------------------
// Scan control surface
// ---------------------------------------------------------------------------

/// Optional constraints on a scan request.
#[derive(Default)]
pub struct ScanFilters {
    /// Only report this SSID
    pub ssid: Option<Ssid>,
    /// Only report this BSSID
    pub bssid: Option<MacAddress>,
    /// Restrict to these channels (numbers, 2.4/5 GHz inferred)
    pub channels: Vec<u8>,
}

impl Driver {
    /// Start an asynchronous scan. Partial results stream into `callback`;
    /// exactly one terminal status follows them.
    ///
    /// A scan already in flight is aborted first, mirroring the firmware's
    /// newer-scan-wins behaviour.
    pub fn scan(
        &self,
        iface: InterfaceId,
        scan_type: ScanType,
        bss_type: BssType,
        filters: ScanFilters,
        callback: ScanCallback,
    ) -> WifiResult<()> {
        self.ensure_up()?;
        let ifidx = self.iface_index(iface)?;
        self.abort_scan_locked(iface);

        let entry = self.events.register(ifidx, SCAN_EVENTS, Arc::new(ScanEventHandler))?;
        let sync_id;
        {
            let mut internal = self.internal.lock();
            internal.scan_sync_id = internal.scan_sync_id.wrapping_add(1);
            sync_id = internal.scan_sync_id;
            internal.scan_cb = Some(callback);
            internal.scan_entry = Some(entry);
            internal.scan_iface = iface;
        }
        self.set_iface_entry(iface, HandlerCategory::Scan, Some(entry));

        let chanspecs: Vec<u16> = filters
            .channels
            .iter()
            .map(|&ch| Chanspec::new(ch, crate::chanspec::band_for_channel(ch)).0)
            .collect();
        let params = ScanParams {
            ssid: filters.ssid.unwrap_or(Ssid::EMPTY),
            bssid: filters.bssid.unwrap_or(MacAddress::WILDCARD),
            bss_type: bss_type.wire(),
            scan_type: scan_type.wire(),
            nprobes: SCAN_PARAM_DEFAULT,
            active_time: SCAN_PARAM_DEFAULT,
            passive_time: SCAN_PARAM_DEFAULT,
            home_time: SCAN_PARAM_DEFAULT,
            channel_list: &chanspecs,
        };
        let payload = escan_params_bytes(ESCAN_ACTION_START, sync_id, &params);
        if let Err(e) = self.commands.set_iovar(ifidx, "escan", &payload) {
            self.finish_scan(None);
            return Err(e);
        }
        Ok(())
    }

    /// Abort the scan in flight, if any. The callback observes `Aborted`.
    pub fn stop_scan(&self, iface: InterfaceId) -> WifiResult<()> {
        let ifidx = self.iface_index(iface)?;
        let active = self.internal.lock().scan_cb.is_some();
        if !active {
            return Ok(());
        }
        // Tell firmware first; the local callback teardown must happen even
        // if the abort command fails.
        let params = ScanParams {
            ssid: Ssid::EMPTY,
            bssid: MacAddress::WILDCARD,
            bss_type: BssType::Any.wire(),
            scan_type: ScanType::Active.wire(),
            nprobes: SCAN_PARAM_DEFAULT,
            active_time: SCAN_PARAM_DEFAULT,
            passive_time: SCAN_PARAM_DEFAULT,
            home_time: SCAN_PARAM_DEFAULT,
            channel_list: &[],
        };
        let sync_id = self.internal.lock().scan_sync_id;
        let payload = escan_params_bytes(ESCAN_ACTION_ABORT, sync_id, &params);
        let result = self.commands.set_iovar(ifidx, "escan", &payload);
        self.finish_scan(Some(ScanStatus::Aborted));
        result
    }

    /// Blocking scan into a caller-provided vector.
    ///
    /// Returns `PartialResults` when more networks were seen than `limit`
    /// allowed for.
    pub fn scan_synchronous(
        &self,
        iface: InterfaceId,
        results: &mut Vec<ScanResult>,
        limit: usize,
    ) -> WifiResult<()> {
        struct Sync {
            results: Vec<ScanResult>,
            terminal: Option<ScanStatus>,
            truncated: bool,
        }
        let state = Arc::new(spin::Mutex::new(Sync {
            results: Vec::new(),
            terminal: None,
            truncated: false,
        }));
        let sem = self.os.semaphore(0);

        let cb_state = state.clone();
        let cb_sem = sem.clone();
        self.scan(
            iface,
            ScanType::Active,
            BssType::Any,
            ScanFilters::default(),
            Box::new(move |status, result| {
                let mut s = cb_state.lock();
                match status {
                    ScanStatus::Incomplete => {
                        if let Some(r) = result {
                            if s.results.len() < limit {
                                s.results.push(r);
                            } else {
                                s.truncated = true;
                            }
                        }
                    }
                    terminal => {
                        s.terminal = Some(terminal);
                        cb_sem.release();
                    }
                }
            }),
        )?;

        // Unbounded wait: the caller cancels through stop_scan.
        loop {
            sem.acquire(1000);
            let mut s = state.lock();
            if s.terminal.is_some() {
                results.append(&mut s.results);
                return if s.truncated { Err(WifiError::PartialResults) } else { Ok(()) };
            }
        }
    }

    /// Abort bookkeeping for a previous scan without telling firmware (a new
    /// start request implicitly cancels it there).
    fn abort_scan_locked(&self, _iface: InterfaceId) {
        if self.internal.lock().scan_cb.is_some() {
            self.finish_scan(Some(ScanStatus::Aborted));
        }
    }

    /// Tear down scan state, optionally delivering a terminal status.
    pub(crate) fn finish_scan(&self, terminal: Option<ScanStatus>) {
        let (cb, entry, iface) = {
            let mut internal = self.internal.lock();
            (internal.scan_cb.take(), internal.scan_entry.take(), internal.scan_iface)
        };
        if let Some(entry) = entry {
            self.events.deregister(entry);
            self.set_iface_entry(iface, HandlerCategory::Scan, None);
        }
        if let (Some(mut cb), Some(status)) = (cb, terminal) {
            cb(status, None);
        }
    }
}

/// Dispatcher-side half of the scan engine.
pub(crate) struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_event(&self, driver: &Driver, header: &EventHeader, data: &[u8]) {
        match header.status {
            event_status::PARTIAL => {
                if data.len() < ESCAN_RESULT_HEADER_SIZE {
                    warn!("scan: truncated partial event");
                    return;
                }
                let hdr = match EscanResultHeader::from_bytes(data) {
                    Ok(h) => h,
                    Err(_) => {
                        warn!("scan: bad partial header");
                        return;
                    }
                };
                if hdr.bss_count == 0 || (hdr.buflen as usize) < ESCAN_RESULT_HEADER_SIZE {
                    return;
                }
                // Each partial carries exactly one BSS record.
                let record = &data[ESCAN_RESULT_HEADER_SIZE..hdr.buflen as usize];
                match result_from_record(record, true) {
                    Ok(Some(result)) => driver.deliver_scan_result(result),
                    Ok(None) => debug!("scan: dropped off-channel result"),
                    Err(_) => debug!("scan: dropped malformed result"),
                }
            }
            event_status::SUCCESS => {
                driver.finish_scan(Some(ScanStatus::CompletedSuccessfully));
            }
            event_status::NEWSCAN | event_status::NEWASSOC | event_status::ABORT => {
                driver.finish_scan(Some(ScanStatus::Aborted));
            }
            other => {
                debug!("scan: ignoring escan status {}", other);
            }
        }
    }
}

impl Driver {
    /// Hand one partial result to the user callback.
    ///
    /// The callback is moved out of the driver for the call so it may itself
    /// call back into scan control without deadlocking.
    pub(crate) fn deliver_scan_result(&self, result: ScanResult) {
        let cb = self.internal.lock().scan_cb.take();
        if let Some(mut cb) = cb {
            cb(ScanStatus::Incomplete, Some(result));
            let mut internal = self.internal.lock();
            if internal.scan_entry.is_some() && internal.scan_cb.is_none() {
                internal.scan_cb = Some(cb);
            }
        }
    }
}
