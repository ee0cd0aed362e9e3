//! Station join state machine
//!
//! A join attempt is a linear progression driven by two event sources: the
//! command responses from the command channel and the asynchronous join
//! events the dispatcher feeds into the per-interface status bitset. The
//! joining thread prepares the firmware, issues the association and then
//! blocks on the join semaphore, classifying the bitset after every wake.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::chanspec::Chanspec;
use crate::codec::{
    sae_password_bytes, wlc, write_wlc_ssid, wsec_pmk_bytes, ChanSwitch, WLC_SSID_SIZE,
    WSEC_MAX_PSK_LEN, WSEC_MAX_SAE_PASSWORD_LEN, WSEC_MIN_PSK_LEN, WSEC_PASSPHRASE,
};
use crate::driver::{Driver, InterfaceId, Role};
use crate::error::{ignore_unsupported, WifiError, WifiResult};
use crate::event::{
    event_code, event_flag, event_status, EventHandler, EventHeader, HandlerCategory,
    AUTH_EVENTS, JOIN_EVENTS,
};
use crate::mac::{MacAddress, Ssid};
use crate::scan::{ScanResult, SecurityInfo};

/// Total budget for one join attempt
pub const DEFAULT_JOIN_ATTEMPT_TIMEOUT_MS: u32 = 9000;
/// The join semaphore is polled in slices of the total budget
const JOIN_POLL_SLICES: u32 = 10;
/// EAPOL key-packet timeout programmed for WPA3 joins
pub const DEFAULT_EAPOL_KEY_PACKET_TIMEOUT_MS: u32 = 2500;
/// Radio firmware needs a settle delay before key programming
const KEY_INSTALL_PRE_DELAY_MS: u32 = 1;

/// Group-key rotation wake bit programmed for the TKIP silicon quirk
const WOWL_KEYROT: u32 = 0x2000;

/// `wpa_auth` values
mod wpa_auth {
    pub const DISABLED: u32 = 0;
    pub const UNSPECIFIED: u32 = 2;
    pub const PSK: u32 = 4;
    pub const WPA2_UNSPECIFIED: u32 = 0x40;
    pub const WPA2_PSK: u32 = 0x80;
    pub const WPA2_FT: u32 = 0x4000;
    pub const WPA2_PSK_SHA256: u32 = 0x8000;
    pub const WPA3_SAE_PSK: u32 = 0x4_0000;
}

/// Authentication algorithm for the SetAuth command
mod auth_alg {
    pub const OPEN_SYSTEM: u32 = 0;
    pub const SAE: u32 = 3;
}

/// Management-frame-protection levels for the `mfp` variable
mod mfp {
    pub const CAPABLE: u32 = 1;
    pub const REQUIRED: u32 = 2;
}

/// `wsec` cipher bits
mod wsec {
    pub const WEP: u32 = 0x01;
    pub const TKIP: u32 = 0x02;
    pub const AES: u32 = 0x04;
}

/// Firmware supplicant states reported through PskSup events
mod sup_status {
    pub const KEYXCHANGE_WAIT_M1: u32 = 4;
    pub const KEYED: u32 = 6;
    pub const KEYXCHANGE_WAIT_M3: u32 = 8;
    pub const KEYXCHANGE_WAIT_G1: u32 = 10;
}

/// Supplicant event reasons
mod sup_reason {
    pub const OTHER: u32 = 0;
    pub const WPA_PSK_TMO: u32 = 16;
}

/// Security type requested for a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Open,
    WpaTkipPsk,
    WpaAesPsk,
    WpaMixedPsk,
    Wpa2TkipPsk,
    Wpa2AesPsk,
    Wpa2MixedPsk,
    Wpa2AesPskSha256,
    Wpa2AesEnterprise,
    Wpa2MixedEnterprise,
    Wpa2FbtEnterprise,
    Wpa3Sae,
    Wpa3Wpa2Psk,
    WepPsk,
    WepShared,
    IbssOpen,
    Unknown,
}

impl Security {
    /// Cipher bits for the SetWsec command
    pub(crate) fn wsec(self) -> u32 {
        match self {
            Security::Open | Security::IbssOpen | Security::Unknown => 0,
            Security::WepPsk | Security::WepShared => wsec::WEP,
            Security::WpaTkipPsk | Security::Wpa2TkipPsk => wsec::TKIP,
            Security::WpaAesPsk
            | Security::Wpa2AesPsk
            | Security::Wpa2AesPskSha256
            | Security::Wpa2AesEnterprise
            | Security::Wpa3Sae
            | Security::Wpa3Wpa2Psk => wsec::AES,
            Security::WpaMixedPsk
            | Security::Wpa2MixedPsk
            | Security::Wpa2MixedEnterprise
            | Security::Wpa2FbtEnterprise => wsec::TKIP | wsec::AES,
        }
    }

    /// Key-management value for the SetWpaAuth command
    pub(crate) fn wpa_auth(self) -> u32 {
        match self {
            Security::Open | Security::WepPsk | Security::WepShared | Security::IbssOpen => {
                wpa_auth::DISABLED
            }
            Security::WpaTkipPsk | Security::WpaAesPsk | Security::WpaMixedPsk => wpa_auth::PSK,
            Security::Wpa2TkipPsk | Security::Wpa2AesPsk | Security::Wpa2MixedPsk => {
                wpa_auth::WPA2_PSK
            }
            Security::Wpa2AesPskSha256 => wpa_auth::WPA2_PSK_SHA256,
            Security::Wpa2AesEnterprise | Security::Wpa2MixedEnterprise => {
                wpa_auth::WPA2_UNSPECIFIED
            }
            Security::Wpa2FbtEnterprise => wpa_auth::WPA2_UNSPECIFIED | wpa_auth::WPA2_FT,
            Security::Wpa3Sae | Security::Wpa3Wpa2Psk => wpa_auth::WPA3_SAE_PSK,
            Security::Unknown => wpa_auth::UNSPECIFIED,
        }
    }

    fn auth_algorithm(self) -> u32 {
        match self {
            Security::Wpa3Sae | Security::Wpa3Wpa2Psk => auth_alg::SAE,
            _ => auth_alg::OPEN_SYSTEM,
        }
    }

    /// The firmware-internal supplicant runs the key handshake for every
    /// WPA/WPA2/WPA3 variant; enterprise included, where 802.1X only
    /// delivers the PMK and the 4-way exchange is still firmware's.
    fn needs_supplicant(self) -> bool {
        matches!(
            self,
            Security::WpaTkipPsk
                | Security::WpaAesPsk
                | Security::WpaMixedPsk
                | Security::Wpa2TkipPsk
                | Security::Wpa2AesPsk
                | Security::Wpa2MixedPsk
                | Security::Wpa2AesPskSha256
                | Security::Wpa2AesEnterprise
                | Security::Wpa2MixedEnterprise
                | Security::Wpa2FbtEnterprise
                | Security::Wpa3Sae
                | Security::Wpa3Wpa2Psk
        )
    }

    fn is_psk(self) -> bool {
        matches!(
            self,
            Security::WpaTkipPsk
                | Security::WpaAesPsk
                | Security::WpaMixedPsk
                | Security::Wpa2TkipPsk
                | Security::Wpa2AesPsk
                | Security::Wpa2MixedPsk
                | Security::Wpa2AesPskSha256
                | Security::Wpa3Wpa2Psk
        )
    }

    fn is_sae(self) -> bool {
        matches!(self, Security::Wpa3Sae | Security::Wpa3Wpa2Psk)
    }

    fn is_wpa2(self) -> bool {
        matches!(
            self,
            Security::Wpa2TkipPsk
                | Security::Wpa2AesPsk
                | Security::Wpa2MixedPsk
                | Security::Wpa2AesPskSha256
                | Security::Wpa2AesEnterprise
                | Security::Wpa2MixedEnterprise
                | Security::Wpa2FbtEnterprise
        )
    }

    /// Map an observed security bitset onto the closest join security.
    pub fn from_info(info: SecurityInfo) -> Security {
        if info.contains(SecurityInfo::IBSS) {
            return Security::IbssOpen;
        }
        if info.contains(SecurityInfo::WPA3) {
            return if info.contains(SecurityInfo::WPA2) {
                Security::Wpa3Wpa2Psk
            } else {
                Security::Wpa3Sae
            };
        }
        if info.contains(SecurityInfo::WPA2) {
            if info.contains(SecurityInfo::ENTERPRISE) {
                return if info.contains(SecurityInfo::FBT) {
                    Security::Wpa2FbtEnterprise
                } else if info.contains(SecurityInfo::TKIP) {
                    Security::Wpa2MixedEnterprise
                } else {
                    Security::Wpa2AesEnterprise
                };
            }
            if info.contains(SecurityInfo::SHA256) {
                return Security::Wpa2AesPskSha256;
            }
            return match (info.contains(SecurityInfo::TKIP), info.contains(SecurityInfo::AES)) {
                (true, true) => Security::Wpa2MixedPsk,
                (true, false) => Security::Wpa2TkipPsk,
                _ => Security::Wpa2AesPsk,
            };
        }
        if info.contains(SecurityInfo::WPA) {
            return match (info.contains(SecurityInfo::TKIP), info.contains(SecurityInfo::AES)) {
                (true, true) => Security::WpaMixedPsk,
                (false, true) => Security::WpaAesPsk,
                _ => Security::WpaTkipPsk,
            };
        }
        if info.contains(SecurityInfo::WEP) {
            return if info.contains(SecurityInfo::SHARED) {
                Security::WepShared
            } else {
                Security::WepPsk
            };
        }
        if info.is_empty() {
            Security::Open
        } else {
            Security::Unknown
        }
    }
}

bitflags! {
    /// Per-interface join progress bits, flipped only by the dispatcher.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JoinStatus: u32 {
        const ASSOCIATED        = 0x0001;
        const AUTHENTICATED     = 0x0002;
        const LINK_READY        = 0x0004;
        const SECURITY_COMPLETE = 0x0008;
        const SSID_SET          = 0x0010;
        const NO_NETWORKS       = 0x0020;
        const EAPOL_M1_TIMEOUT  = 0x0040;
        const EAPOL_M3_TIMEOUT  = 0x0080;
        const EAPOL_G1_TIMEOUT  = 0x0100;
        const EAPOL_FAILURE     = 0x0200;
    }
}

/// Outcome of classifying a join-status bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinProgress {
    /// Authenticated, linked, SSID programmed and keys in place
    Complete,
    /// Nothing terminal yet; association or authentication pending
    NotAuthenticated,
    /// Link is up but the key exchange has not finished
    NotKeyed,
    /// Firmware found no matching BSS
    NetworkNotFound,
    EapolM1Timeout,
    EapolM3Timeout,
    EapolG1Timeout,
    EapolFailure,
    /// Bits form no defined combination
    Invalid,
}

impl JoinProgress {
    /// True when the attempt can make no further progress
    fn is_terminal(self) -> bool {
        !matches!(
            self,
            JoinProgress::NotAuthenticated | JoinProgress::NotKeyed | JoinProgress::Invalid
        )
    }

    /// Error equivalent; `None` only for `Complete`
    pub(crate) fn error(self) -> Option<WifiError> {
        match self {
            JoinProgress::Complete => None,
            JoinProgress::NotAuthenticated => Some(WifiError::NotAuthenticated),
            JoinProgress::NotKeyed => Some(WifiError::NotKeyed),
            JoinProgress::NetworkNotFound => Some(WifiError::NetworkNotFound),
            JoinProgress::EapolM1Timeout => Some(WifiError::EapolKeyPacketM1Timeout),
            JoinProgress::EapolM3Timeout => Some(WifiError::EapolKeyPacketM3Timeout),
            JoinProgress::EapolG1Timeout => Some(WifiError::EapolKeyPacketG1Timeout),
            JoinProgress::EapolFailure => Some(WifiError::EapolKeyFailure),
            JoinProgress::Invalid => Some(WifiError::InvalidJoinStatus),
        }
    }
}

/// Classify a join-status bitset into exactly one outcome.
///
/// Supplicant timeout and failure bits preclude success regardless of what
/// else is set; a no-networks report beats everything.
pub fn classify(status: JoinStatus) -> JoinProgress {
    let up = JoinStatus::AUTHENTICATED | JoinStatus::LINK_READY;
    let eapol = JoinStatus::EAPOL_M1_TIMEOUT
        | JoinStatus::EAPOL_M3_TIMEOUT
        | JoinStatus::EAPOL_G1_TIMEOUT
        | JoinStatus::EAPOL_FAILURE;

    if status.contains(JoinStatus::NO_NETWORKS) {
        return JoinProgress::NetworkNotFound;
    }
    if status.intersects(eapol) {
        if !status.contains(up) {
            return JoinProgress::Invalid;
        }
        return if status.contains(JoinStatus::EAPOL_M1_TIMEOUT) {
            JoinProgress::EapolM1Timeout
        } else if status.contains(JoinStatus::EAPOL_M3_TIMEOUT) {
            JoinProgress::EapolM3Timeout
        } else if status.contains(JoinStatus::EAPOL_G1_TIMEOUT) {
            JoinProgress::EapolG1Timeout
        } else {
            JoinProgress::EapolFailure
        };
    }
    if status.contains(up | JoinStatus::SSID_SET | JoinStatus::SECURITY_COMPLETE) {
        return JoinProgress::Complete;
    }
    if status.contains(up) {
        return JoinProgress::NotKeyed;
    }
    if status == JoinStatus::SECURITY_COMPLETE || status.is_empty() {
        return JoinProgress::NotAuthenticated;
    }
    JoinProgress::Invalid
}

fn validate_key(security: Security, key: &[u8]) -> WifiResult<()> {
    match security {
        Security::Unknown => Err(WifiError::UnknownSecurityType),
        Security::WepPsk | Security::WepShared => Err(WifiError::WepNotAllowed),
        Security::IbssOpen => Err(WifiError::Unsupported),
        Security::Open | Security::Wpa2AesEnterprise | Security::Wpa2MixedEnterprise
        | Security::Wpa2FbtEnterprise => Ok(()),
        Security::Wpa3Sae => {
            if key.len() <= WSEC_MAX_SAE_PASSWORD_LEN {
                Ok(())
            } else {
                Err(WifiError::InvalidKey)
            }
        }
        _ => {
            if (WSEC_MIN_PSK_LEN..=WSEC_MAX_PSK_LEN).contains(&key.len()) {
                Ok(())
            } else {
                Err(WifiError::InvalidKey)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Join control surface
// ---------------------------------------------------------------------------

impl Driver {
    /// Join a network by SSID.
    ///
    /// Blocks until the attempt reaches a terminal state or the join budget
    /// expires. On any failure a disassociation has been attempted and the
    /// interface role reads `Invalid`.
    pub fn join(
        &self,
        iface: InterfaceId,
        ssid: &Ssid,
        security: Security,
        key: &[u8],
    ) -> WifiResult<()> {
        if ssid.is_empty() {
            return Err(WifiError::BadArg);
        }
        self.join_common(iface, ssid, None, None, security, key)
    }

    /// Join a specific BSS from a prior scan observation.
    pub fn join_specific(
        &self,
        iface: InterfaceId,
        ap: &ScanResult,
        key: &[u8],
    ) -> WifiResult<()> {
        if ap.ssid.is_empty() {
            return Err(WifiError::BadArg);
        }
        // With neither a channel nor a BSSID there is nothing specific to
        // target; refuse before any bus traffic.
        if ap.channel == 0 && ap.bssid.is_null() {
            return Err(WifiError::BadArg);
        }
        let security = Security::from_info(ap.security);
        let bssid = if ap.bssid.is_null() { None } else { Some(ap.bssid) };
        let chanspec =
            if ap.channel != 0 { Some(Chanspec::new(ap.channel, ap.band)) } else { None };
        self.join_common(iface, &ap.ssid, bssid, chanspec, security, key)
    }

    fn join_common(
        &self,
        iface: InterfaceId,
        ssid: &Ssid,
        bssid: Option<MacAddress>,
        chanspec: Option<Chanspec>,
        security: Security,
        key: &[u8],
    ) -> WifiResult<()> {
        self.ensure_up()?;
        let ifidx = self.iface_index(iface)?;
        validate_key(security, key)?;

        // Claim the attempt: the semaphore slot doubles as the in-progress
        // marker and is only ever swapped under the active-join lock.
        let sem = self.os.semaphore(0);
        {
            let _guard = self.active_join.lock();
            let mut internal = self.internal.lock();
            if internal.join_sem.is_some() {
                return Err(WifiError::JoinInProgress);
            }
            internal.join_sem = Some(sem.clone());
        }
        self.set_iface_role(iface, Role::Sta);

        // Supplemental wake request: the chip must not sleep between the
        // prepare, associate and key-exchange phases.
        if let Err(e) = self.power.acquire() {
            self.clear_active_join();
            return Err(e);
        }
        let result = self
            .prepare_join(iface, ifidx, security, key)
            .and_then(|()| self.associate(ifidx, ssid, bssid, chanspec))
            .and_then(|()| self.wait_for_join(ifidx, &sem));

        self.clear_active_join();
        self.power.release();

        match result {
            Ok(()) => {
                info!("join: {:?} complete", ssid);
                Ok(())
            }
            Err(e) => {
                warn!("join: {:?} failed: {}", ssid, e);
                let _ = self.leave_internal(iface, ifidx);
                self.set_iface_role(iface, Role::Invalid);
                Err(e)
            }
        }
    }

    /// Disassociate and tear down join state.
    ///
    /// Issued against an in-flight join, this cancels the attempt: the
    /// waiting thread is woken and unwinds through its own failure path.
    pub fn leave(&self, iface: InterfaceId) -> WifiResult<()> {
        let ifidx = self.iface_index(iface)?;
        {
            let _guard = self.active_join.lock();
            let sem = self.internal.lock().join_sem.take();
            if let Some(sem) = sem {
                sem.release();
            }
        }
        self.leave_internal(iface, ifidx)
    }

    fn leave_internal(&self, iface: InterfaceId, ifidx: u8) -> WifiResult<()> {
        if let Some(entry) = self.take_iface_entry(iface, HandlerCategory::Join) {
            self.events.deregister(entry);
        }
        let result = self.commands.set_ioctl(ifidx, wlc::WLC_DISASSOC, &[]);
        self.set_join_status(ifidx, JoinStatus::empty());
        result
    }

    /// Terminal join classification for an interface.
    pub fn is_ready_to_transceive(&self, iface: InterfaceId) -> WifiResult<()> {
        let ifidx = self.iface_index(iface)?;
        match classify(self.join_status_of(ifidx)).error() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Fourteen ordered firmware-programming steps taking the interface
    /// from idle to associable.
    fn prepare_join(
        &self,
        iface: InterfaceId,
        ifidx: u8,
        security: Security,
        key: &[u8],
    ) -> WifiResult<()> {
        let bss_index = self.bss_index_of(iface)? as u32;
        self.set_join_status(ifidx, JoinStatus::empty());

        let saved_mfp = if security != Security::Open {
            ignore_unsupported(self.commands.get_iovar_u32(ifidx, "mfp"))?
        } else {
            None
        };

        self.commands.set_ioctl_u32(ifidx, wlc::WLC_SET_WSEC, security.wsec())?;
        self.commands.set_iovar_u32(ifidx, "roam_off", 0)?;

        if self.chip.tkip_bsscfg_quirk && security == Security::WpaTkipPsk {
            // This silicon loses group-key rotation unless the security is
            // programmed per-bss and the key-rotation wake bit is set.
            self.commands
                .set_bsscfg_iovar_u32(ifidx, "bsscfg:wpa_auth", bss_index, wpa_auth::PSK)?;
            self.commands
                .set_bsscfg_iovar_u32(ifidx, "bsscfg:wsec", bss_index, security.wsec())?;
            if let Some(w) = ignore_unsupported(self.commands.get_iovar_u32(ifidx, "wowl"))? {
                let _ = ignore_unsupported(
                    self.commands.set_iovar_u32(ifidx, "wowl", w | WOWL_KEYROT),
                )?;
            }
        }

        if security.needs_supplicant() {
            self.commands.set_bsscfg_iovar_u32(ifidx, "bsscfg:sup_wpa", bss_index, 1)?;
            // EAPOL version -1: follow whatever the AP negotiates
            self.commands.set_bsscfg_iovar_u32(
                ifidx,
                "bsscfg:sup_wpa2_eapver",
                bss_index,
                -1i32 as u32,
            )?;
        }

        if security.is_psk() {
            // The settle delay avoids an intermittent key-programming
            // failure in the radio firmware; skipping it is not an option.
            self.os.delay_ms(KEY_INSTALL_PRE_DELAY_MS);
            self.commands.set_ioctl(
                ifidx,
                wlc::WLC_SET_WSEC_PMK,
                &wsec_pmk_bytes(key, WSEC_PASSPHRASE),
            )?;
        }
        if security.is_sae() {
            self.os.delay_ms(KEY_INSTALL_PRE_DELAY_MS);
            self.commands.set_iovar(ifidx, "sae_password", &sae_password_bytes(key))?;
        }

        if security.is_sae() {
            self.commands.set_bsscfg_iovar_u32(
                ifidx,
                "bsscfg:sup_wpa_tmo",
                bss_index,
                DEFAULT_EAPOL_KEY_PACKET_TIMEOUT_MS,
            )?;
            if !self.chip.sae {
                // External supplicant cannot follow firmware roams
                self.commands.set_iovar_u32(ifidx, "roam_off", 1)?;
            }
        }

        self.commands.set_ioctl_u32(ifidx, wlc::WLC_SET_INFRA, 1)?;
        self.commands.set_ioctl_u32(ifidx, wlc::WLC_SET_AUTH, security.auth_algorithm())?;

        let mfp_value = match security {
            Security::Wpa3Sae => Some(mfp::REQUIRED),
            Security::Wpa3Wpa2Psk => Some(mfp::CAPABLE),
            s if s.is_wpa2() => Some(mfp::CAPABLE),
            _ => saved_mfp,
        };
        if let Some(v) = mfp_value {
            // Older chips lack the variable entirely; carry on without MFP.
            if let Err(e) = self.commands.set_iovar_u32(ifidx, "mfp", v) {
                debug!("join: mfp not programmed: {}", e);
            }
        }

        self.commands.set_ioctl_u32(ifidx, wlc::WLC_SET_WPA_AUTH, security.wpa_auth())?;

        if security == Security::Open {
            // No handshake will run; the security half is already done.
            self.merge_join_status(ifidx, JoinStatus::SECURITY_COMPLETE);
        }

        // A handler left over from a previous attempt would double-fire.
        if let Some(stale) = self.take_iface_entry(iface, HandlerCategory::Join) {
            self.events.deregister(stale);
        }
        let entry = self
            .events
            .register(ifidx, JOIN_EVENTS, Arc::new(JoinEventHandler))
            .map_err(|_| WifiError::Unfinished)?;
        self.set_iface_entry(iface, HandlerCategory::Join, Some(entry));
        Ok(())
    }

    /// Issue the association: the extended-join variable when the firmware
    /// has it, the SetSsid command otherwise.
    fn associate(
        &self,
        ifidx: u8,
        ssid: &Ssid,
        bssid: Option<MacAddress>,
        chanspec: Option<Chanspec>,
    ) -> WifiResult<()> {
        let chanspecs: Vec<u16> = chanspec.iter().map(|c| c.0).collect();
        let params = crate::codec::ext_join_params_bytes(
            ssid,
            &bssid.unwrap_or(MacAddress::WILDCARD),
            &chanspecs,
        );
        match self.commands.set_iovar(ifidx, "join", &params) {
            Ok(()) => Ok(()),
            Err(WifiError::WlanUnsupported) => {
                debug!("join: extended join unsupported, falling back to set-ssid");
                if let Some(cs) = chanspec {
                    self.commands
                        .set_ioctl_u32(ifidx, wlc::WLC_SET_CHANNEL, cs.channel() as u32)?;
                }
                let mut buf = [0u8; WLC_SSID_SIZE];
                write_wlc_ssid(&mut buf, ssid);
                self.commands.set_ioctl(ifidx, wlc::WLC_SET_SSID, &buf)
            }
            Err(e) => Err(e),
        }
    }

    /// Block on the join semaphore in slices, classifying after every wake.
    fn wait_for_join(&self, ifidx: u8, sem: &Arc<dyn crate::platform::Semaphore>) -> WifiResult<()> {
        let slice = DEFAULT_JOIN_ATTEMPT_TIMEOUT_MS / JOIN_POLL_SLICES;
        let deadline = self.os.ticks_ms() + DEFAULT_JOIN_ATTEMPT_TIMEOUT_MS as u64;
        loop {
            let _ = sem.acquire(slice);
            let progress = classify(self.join_status_of(ifidx));
            match progress.error() {
                None => return Ok(()),
                Some(e) if progress.is_terminal() => return Err(e),
                Some(e) => {
                    // Cancelled by a concurrent leave?
                    if self.internal.lock().join_sem.is_none() {
                        return Err(e);
                    }
                    if self.os.ticks_ms() >= deadline {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn clear_active_join(&self) {
        let _guard = self.active_join.lock();
        self.internal.lock().join_sem = None;
    }

    /// Wake the joining thread; called by the dispatcher after every
    /// status mutation.
    fn signal_join(&self) {
        let _guard = self.active_join.lock();
        let sem = self.internal.lock().join_sem.clone();
        if let Some(sem) = sem {
            sem.release();
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher-side join event handling
// ---------------------------------------------------------------------------

/// Flips the per-interface join status bits; runs on the worker thread.
pub(crate) struct JoinEventHandler;

impl EventHandler for JoinEventHandler {
    fn on_event(&self, driver: &Driver, header: &EventHeader, data: &[u8]) {
        let ifidx = header.interface;
        let mut set = JoinStatus::empty();
        let mut clear = JoinStatus::empty();
        match header.event_type {
            event_code::SET_SSID => {
                if header.status == event_status::SUCCESS {
                    set |= JoinStatus::SSID_SET;
                } else if header.status == event_status::NO_NETWORKS {
                    set |= JoinStatus::NO_NETWORKS;
                }
            }
            event_code::LINK => {
                if header.flags & event_flag::LINK_UP != 0 {
                    set |= JoinStatus::LINK_READY;
                } else {
                    clear |= JoinStatus::LINK_READY;
                }
            }
            event_code::AUTH => {
                if header.status == event_status::SUCCESS {
                    set |= JoinStatus::AUTHENTICATED;
                } else {
                    clear |= JoinStatus::AUTHENTICATED;
                }
            }
            event_code::DEAUTH_IND | event_code::DISASSOC_IND => {
                clear |= JoinStatus::LINK_READY
                    | JoinStatus::AUTHENTICATED
                    | JoinStatus::ASSOCIATED;
            }
            event_code::PSK_SUP => match (header.status, header.reason) {
                (sup_status::KEYED, _) => set |= JoinStatus::SECURITY_COMPLETE,
                (sup_status::KEYXCHANGE_WAIT_M1, sup_reason::WPA_PSK_TMO) => {
                    set |= JoinStatus::EAPOL_M1_TIMEOUT;
                }
                (sup_status::KEYXCHANGE_WAIT_M3, sup_reason::WPA_PSK_TMO) => {
                    set |= JoinStatus::EAPOL_M3_TIMEOUT;
                }
                (sup_status::KEYXCHANGE_WAIT_G1, sup_reason::WPA_PSK_TMO) => {
                    set |= JoinStatus::EAPOL_G1_TIMEOUT;
                }
                (_, reason) if reason != sup_reason::OTHER => {
                    set |= JoinStatus::EAPOL_FAILURE;
                }
                _ => {}
            },
            event_code::CSA_COMPLETE_IND => {
                if let Ok(cs) = ChanSwitch::from_bytes(data) {
                    let channel = Chanspec(cs.chspec).channel();
                    debug!("join: csa to channel {}", channel);
                    driver.note_channel_switch(ifidx, channel);
                }
                return;
            }
            _ => return,
        }
        if !set.is_empty() || !clear.is_empty() {
            driver.update_join_status(ifidx, set, clear);
            driver.signal_join();
        }
    }
}

impl Driver {
    pub(crate) fn update_join_status(&self, ifidx: u8, set: JoinStatus, clear: JoinStatus) {
        let mut internal = self.internal.lock();
        if let Some(status) = internal.join_status.get_mut(ifidx as usize) {
            status.insert(set);
            status.remove(clear);
        }
    }

    pub(crate) fn merge_join_status(&self, ifidx: u8, set: JoinStatus) {
        self.update_join_status(ifidx, set, JoinStatus::empty());
    }

    pub(crate) fn set_join_status(&self, ifidx: u8, status: JoinStatus) {
        let mut internal = self.internal.lock();
        if let Some(slot) = internal.join_status.get_mut(ifidx as usize) {
            *slot = status;
        }
    }

    pub(crate) fn join_status_of(&self, ifidx: u8) -> JoinStatus {
        self.internal
            .lock()
            .join_status
            .get(ifidx as usize)
            .copied()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// SAE external authentication surface
// ---------------------------------------------------------------------------

/// Callback receiving external-auth requests and SAE frames
pub type AuthCallback = Box<dyn FnMut(&EventHeader, &[u8]) + Send>;

/// Association-manager sub-command carrying an externally built auth frame
const ASSOC_MGR_CMD_SEND_AUTH: u16 = 1;
const ASSOC_MGR_CMD_VERSION: u16 = 1;

pub(crate) struct ExtAuthEventHandler;

impl EventHandler for ExtAuthEventHandler {
    fn on_event(&self, driver: &Driver, header: &EventHeader, data: &[u8]) {
        let cb = driver.internal.lock().auth_cb.take();
        if let Some(mut cb) = cb {
            cb(header, data);
            let mut internal = driver.internal.lock();
            if internal.auth_cb.is_none() {
                internal.auth_cb = Some(cb);
            }
        }
    }
}

/// Authentication outcome reported back to firmware after an external
/// SAE exchange.
#[derive(Debug, Clone, Copy)]
pub struct AuthStatus {
    pub peer: MacAddress,
    pub ssid: Ssid,
    pub status: u16,
}

impl Driver {
    /// Route SAE external-supplicant material to `callback`.
    pub fn external_auth_request(
        &self,
        iface: InterfaceId,
        callback: AuthCallback,
    ) -> WifiResult<()> {
        let ifidx = self.iface_index(iface)?;
        let entry = self.events.register(ifidx, AUTH_EVENTS, Arc::new(ExtAuthEventHandler))?;
        self.internal.lock().auth_cb = Some(callback);
        self.set_iface_entry(iface, HandlerCategory::Auth, Some(entry));
        Ok(())
    }

    /// Stop routing external-auth material. Idempotent.
    pub fn stop_external_auth_request(&self, iface: InterfaceId) -> WifiResult<()> {
        let _ = self.iface_index(iface)?;
        if let Some(entry) = self.take_iface_entry(iface, HandlerCategory::Auth) {
            self.events.deregister(entry);
        }
        self.internal.lock().auth_cb = None;
        Ok(())
    }

    /// Report the outcome of an external SAE exchange to firmware.
    pub fn set_auth_status(&self, iface: InterfaceId, status: &AuthStatus) -> WifiResult<()> {
        let ifidx = self.iface_index(iface)?;
        let mut payload = [0u8; 44];
        crate::codec::put_u16_le(&mut payload, 0, status.status);
        status.peer.write_to(&mut payload, 2);
        crate::codec::put_u32_le(&mut payload, 8, status.ssid.len() as u32);
        payload[12..44].copy_from_slice(status.ssid.raw());
        self.commands.set_iovar(ifidx, "auth_status", &payload)
    }

    /// Transmit an externally built SAE authentication frame.
    pub fn send_auth_frame(&self, iface: InterfaceId, frame: &[u8]) -> WifiResult<()> {
        let ifidx = self.iface_index(iface)?;
        let mut payload = Vec::with_capacity(8 + frame.len());
        payload.extend_from_slice(&ASSOC_MGR_CMD_VERSION.to_le_bytes());
        payload.extend_from_slice(&((8 + frame.len()) as u16).to_le_bytes());
        payload.extend_from_slice(&ASSOC_MGR_CMD_SEND_AUTH.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(frame);
        self.commands.set_iovar(ifidx, "assoc_mgr_cmd", &payload)
    }
}
