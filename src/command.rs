//! Command channel
//!
//! Exclusive, serialized issue of control messages to firmware. One command
//! crosses the bus at a time; each request is paired with its response by
//! transaction id and the bus-power interlock is held for the duration of
//! the exchange.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use log::{trace, warn};

use crate::codec::{
    self, bcme, iovar_payload, wlc, CdcHeader, SdpcmHeader, CDC_HEADER_SIZE, CHANNEL_CONTROL,
    SDPCM_HEADER_SIZE,
};
use crate::error::{WifiError, WifiResult};
use crate::platform::{BufferDir, BufferPool, Bus, HostOs, Semaphore};
use crate::power::PowerInterlock;

/// Response deadline for one control exchange
pub const IOCTL_RESPONSE_TIMEOUT_MS: u32 = 5000;
/// Deadline for taking the command lock itself
const COMMAND_LOCK_TIMEOUT_MS: u32 = 2 * IOCTL_RESPONSE_TIMEOUT_MS;

struct Response {
    id: u16,
    status: i32,
    data: Vec<u8>,
}

/// Serialized control-message channel shared by every interface.
pub struct CommandChannel {
    bus: Arc<dyn Bus>,
    pool: Arc<dyn BufferPool>,
    power: Arc<PowerInterlock>,
    /// Count-1 semaphore: the one-active-command mutex, held across
    /// send + response wait
    lock: Arc<dyn Semaphore>,
    /// Signaled by the receive path when the response slot is filled
    resp_sem: Arc<dyn Semaphore>,
    slot: spin::Mutex<Option<Response>>,
    tx_id: AtomicU16,
    sdpcm_seq: AtomicU8,
}

impl CommandChannel {
    pub fn new(
        bus: Arc<dyn Bus>,
        pool: Arc<dyn BufferPool>,
        os: &Arc<dyn HostOs>,
        power: Arc<PowerInterlock>,
    ) -> Self {
        CommandChannel {
            bus,
            pool,
            power,
            lock: os.semaphore(1),
            resp_sem: os.semaphore(0),
            slot: spin::Mutex::new(None),
            tx_id: AtomicU16::new(1),
            sdpcm_seq: AtomicU8::new(0),
        }
    }

    /// Issue a query command and return the response payload.
    pub fn get_ioctl(
        &self,
        iface: u8,
        cmd: u32,
        payload: &[u8],
        out_len: usize,
    ) -> WifiResult<Vec<u8>> {
        self.roundtrip(iface, cmd, false, payload, out_len)
    }

    /// Issue a set command; the response carries only status.
    pub fn set_ioctl(&self, iface: u8, cmd: u32, payload: &[u8]) -> WifiResult<()> {
        self.roundtrip(iface, cmd, true, payload, 0).map(|_| ())
    }

    /// Query a named variable.
    pub fn get_iovar(&self, iface: u8, name: &str, out_len: usize) -> WifiResult<Vec<u8>> {
        let framed = iovar_payload(name, None, &[])?;
        let len = framed.len().max(out_len);
        self.roundtrip(iface, wlc::WLC_GET_VAR, false, &framed, len)
    }

    /// Set a named variable.
    pub fn set_iovar(&self, iface: u8, name: &str, value: &[u8]) -> WifiResult<()> {
        let framed = iovar_payload(name, None, value)?;
        self.roundtrip(iface, wlc::WLC_SET_VAR, true, &framed, 0).map(|_| ())
    }

    /// Set a `bsscfg:`-scoped variable for a given bss index.
    pub fn set_bsscfg_iovar(
        &self,
        iface: u8,
        name: &str,
        bss_index: u32,
        value: &[u8],
    ) -> WifiResult<()> {
        let framed = iovar_payload(name, Some(bss_index), value)?;
        self.roundtrip(iface, wlc::WLC_SET_VAR, true, &framed, 0).map(|_| ())
    }

    /// Query a 32-bit variable.
    pub fn get_iovar_u32(&self, iface: u8, name: &str) -> WifiResult<u32> {
        let data = self.get_iovar(iface, name, 4)?;
        if data.len() < 4 {
            return Err(WifiError::BadLength);
        }
        Ok(codec::dongle_to_host_32(codec::get_u32_le(&data, 0)))
    }

    /// Set a 32-bit variable.
    pub fn set_iovar_u32(&self, iface: u8, name: &str, value: u32) -> WifiResult<()> {
        self.set_iovar(iface, name, &codec::host_to_dongle_32(value).to_le_bytes())
    }

    /// Set a 32-bit `bsscfg:`-scoped variable.
    pub fn set_bsscfg_iovar_u32(
        &self,
        iface: u8,
        name: &str,
        bss_index: u32,
        value: u32,
    ) -> WifiResult<()> {
        self.set_bsscfg_iovar(
            iface,
            name,
            bss_index,
            &codec::host_to_dongle_32(value).to_le_bytes(),
        )
    }

    /// Set a 32-bit ioctl argument.
    pub fn set_ioctl_u32(&self, iface: u8, cmd: u32, value: u32) -> WifiResult<()> {
        self.set_ioctl(iface, cmd, &codec::host_to_dongle_32(value).to_le_bytes())
    }

    /// Query a 32-bit ioctl result.
    pub fn get_ioctl_u32(&self, iface: u8, cmd: u32) -> WifiResult<u32> {
        let data = self.get_ioctl(iface, cmd, &[], 4)?;
        if data.len() < 4 {
            return Err(WifiError::BadLength);
        }
        Ok(codec::dongle_to_host_32(codec::get_u32_le(&data, 0)))
    }

    fn roundtrip(
        &self,
        iface: u8,
        cmd: u32,
        set: bool,
        payload: &[u8],
        out_len: usize,
    ) -> WifiResult<Vec<u8>> {
        if !self.lock.acquire(COMMAND_LOCK_TIMEOUT_MS) {
            return Err(WifiError::IoctlTimeout);
        }
        let result = self.roundtrip_locked(iface, cmd, set, payload, out_len);
        self.lock.release();
        result
    }

    fn roundtrip_locked(
        &self,
        iface: u8,
        cmd: u32,
        set: bool,
        payload: &[u8],
        out_len: usize,
    ) -> WifiResult<Vec<u8>> {
        let id = self.tx_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.sdpcm_seq.fetch_add(1, Ordering::Relaxed);
        let data_len = payload.len().max(out_len);
        let total = SDPCM_HEADER_SIZE + CDC_HEADER_SIZE + data_len;

        let mut buf = self.pool.get_ioctl_buffer(total)?;
        {
            let frame = buf.as_mut_slice();
            SdpcmHeader::new(total as u16, seq, CHANNEL_CONTROL).write_to(frame);
            CdcHeader::request(cmd, data_len as u32, set, iface, id)
                .write_to(&mut frame[SDPCM_HEADER_SIZE..]);
            frame[SDPCM_HEADER_SIZE + CDC_HEADER_SIZE..][..payload.len()]
                .copy_from_slice(payload);
        }

        // Drop any stale response left by a previously timed-out exchange.
        *self.slot.lock() = None;
        while self.resp_sem.acquire(0) {}

        self.power.acquire()?;
        trace!("cmd {} id {} len {}", cmd, id, data_len);
        let send = self.bus.wlan_write(buf.as_slice());
        self.pool.release(buf, BufferDir::Tx);
        let result = match send {
            Ok(()) => self.wait_response(id),
            Err(e) => Err(e),
        };
        self.power.release();
        result
    }

    fn wait_response(&self, id: u16) -> WifiResult<Vec<u8>> {
        if !self.resp_sem.acquire(IOCTL_RESPONSE_TIMEOUT_MS) {
            warn!("cmd id {} timed out", id);
            return Err(WifiError::IoctlTimeout);
        }
        let resp = self.slot.lock().take().ok_or(WifiError::IoctlTimeout)?;
        if resp.id != id {
            warn!("cmd id {} answered by {}", id, resp.id);
            return Err(WifiError::BadTxId);
        }
        match resp.status {
            s if s == bcme::OK => Ok(resp.data),
            s if s == bcme::UNSUPPORTED => Err(WifiError::WlanUnsupported),
            s => {
                warn!("cmd id {} failed, firmware status {}", id, s);
                Err(WifiError::IoctlFail)
            }
        }
    }

    /// Receive-path entry: a control frame arrived. Fill the response slot
    /// and wake the waiting command.
    pub(crate) fn process_control_frame(&self, payload: &[u8]) {
        let hdr = match CdcHeader::from_bytes(payload) {
            Ok(h) => h,
            Err(_) => {
                warn!("short control frame, {} bytes", payload.len());
                return;
            }
        };
        let body = &payload[CDC_HEADER_SIZE..];
        let len = (hdr.len as usize).min(body.len());
        *self.slot.lock() = Some(Response {
            id: hdr.tx_id(),
            status: hdr.status_code(),
            data: body[..len].to_vec(),
        });
        self.resp_sem.release();
    }
}
