//! Shared fakes for driver-level tests: a scripted bus that answers control
//! requests the way firmware would, a heap-backed buffer pool and a host-OS
//! shim over std synchronization primitives.

use std::collections::{HashMap, VecDeque};
use std::string::String;
use std::sync::{Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};
use std::vec::Vec;

use alloc::sync::Arc;

use crate::codec::{
    wlc, CdcHeader, SdpcmHeader, BDC_HEADER_SIZE, CDC_HEADER_SIZE, CHANNEL_CONTROL,
    CHANNEL_EVENT, SDPCM_HEADER_SIZE,
};
use crate::error::{WifiError, WifiResult};
use crate::platform::{
    Buffer, BufferDir, BufferPool, Bus, BusFunction, HostOs, Semaphore, TransferDirection,
};
use crate::power::reg;

/// Counting semaphore over std primitives. Waits are capped so that a test
/// exercising a firmware timeout does not run for the full production
/// budget.
pub struct StdSemaphore {
    count: StdMutex<u32>,
    cv: Condvar,
}

const MAX_TEST_WAIT_MS: u64 = 400;

impl Semaphore for StdSemaphore {
    fn acquire(&self, timeout_ms: u32) -> bool {
        let capped = (timeout_ms as u64).min(MAX_TEST_WAIT_MS);
        let deadline = Instant::now() + Duration::from_millis(capped);
        let mut count = self.count.lock().unwrap();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }
    }

    fn release(&self) {
        *self.count.lock().unwrap() += 1;
        self.cv.notify_all();
    }
}

/// Host-OS shim over std.
pub struct FakeOs {
    start: Instant,
}

impl FakeOs {
    pub fn new() -> Self {
        FakeOs { start: Instant::now() }
    }
}

impl HostOs for FakeOs {
    fn semaphore(&self, initial: u32) -> Arc<dyn Semaphore> {
        Arc::new(StdSemaphore { count: StdMutex::new(initial), cv: Condvar::new() })
    }

    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms.min(5) as u64));
    }

    fn ticks_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Allocating pool with a programmable failure switch.
#[derive(Default)]
pub struct HeapPool {
    pub fail: StdMutex<bool>,
}

impl BufferPool for HeapPool {
    fn get_ioctl_buffer(&self, size: usize) -> WifiResult<Buffer> {
        if *self.fail.lock().unwrap() {
            return Err(WifiError::BufferAllocFail);
        }
        Ok(Buffer::new(size))
    }

    fn release(&self, _buffer: Buffer, _direction: BufferDir) {}
}

/// One control request observed on the scripted bus.
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub cmd: u32,
    pub set: bool,
    pub tx_id: u16,
    pub iovar: Option<String>,
    /// CDC payload (name framing included for iovars)
    pub payload: Vec<u8>,
}

/// Bus double: records every control request, answers it like firmware
/// (status/data programmable per command or variable name) and lets tests
/// push event frames into the receive queue.
pub struct ScriptedBus {
    controls: StdMutex<Vec<SentCommand>>,
    rx: StdMutex<VecDeque<Vec<u8>>>,
    reply_cmd: StdMutex<HashMap<u32, (i32, Vec<u8>)>>,
    reply_iovar: StdMutex<HashMap<String, (i32, Vec<u8>)>>,
    bp_mem: StdMutex<HashMap<u32, u8>>,
    auto_respond: StdMutex<bool>,
    wakeups: StdMutex<u32>,
    sleeps: StdMutex<u32>,
}

impl Default for ScriptedBus {
    fn default() -> Self {
        Self::with_chip(43439)
    }
}

impl ScriptedBus {
    pub fn with_chip(chip_id: u32) -> Self {
        let bus = ScriptedBus {
            controls: StdMutex::new(Vec::new()),
            rx: StdMutex::new(VecDeque::new()),
            reply_cmd: StdMutex::new(HashMap::new()),
            reply_iovar: StdMutex::new(HashMap::new()),
            bp_mem: StdMutex::new(HashMap::new()),
            auto_respond: StdMutex::new(true),
            wakeups: StdMutex::new(0),
            sleeps: StdMutex::new(0),
        };
        bus.bp_store(0x1800_0000, &chip_id.to_le_bytes());
        bus
    }

    pub fn set_auto_respond(&self, on: bool) {
        *self.auto_respond.lock().unwrap() = on;
    }

    pub fn reply_for_cmd(&self, cmd: u32, status: i32, data: &[u8]) {
        self.reply_cmd.lock().unwrap().insert(cmd, (status, data.to_vec()));
    }

    pub fn reply_for_iovar(&self, name: &str, status: i32, data: &[u8]) {
        self.reply_iovar.lock().unwrap().insert(name.into(), (status, data.to_vec()));
    }

    pub fn push_rx(&self, frame: Vec<u8>) {
        self.rx.lock().unwrap().push_back(frame);
    }

    pub fn bp_store(&self, addr: u32, bytes: &[u8]) {
        let mut mem = self.bp_mem.lock().unwrap();
        for (i, &b) in bytes.iter().enumerate() {
            mem.insert(addr + i as u32, b);
        }
    }

    pub fn last_control(&self) -> Option<SentCommand> {
        self.controls.lock().unwrap().last().cloned()
    }

    /// Forget every recorded request (between test phases).
    pub fn clear_controls(&self) {
        self.controls.lock().unwrap().clear();
    }

    pub fn control_count(&self) -> usize {
        self.controls.lock().unwrap().len()
    }

    pub fn saw_cmd(&self, cmd: u32) -> bool {
        self.controls.lock().unwrap().iter().any(|c| c.cmd == cmd)
    }

    pub fn saw_iovar(&self, name: &str) -> bool {
        self.find_iovar(name).is_some()
    }

    pub fn find_iovar(&self, name: &str) -> Option<SentCommand> {
        self.controls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.iovar.as_deref() == Some(name))
            .cloned()
    }

    /// Block (up to two seconds) until any control request was sent.
    pub fn wait_for_control(&self) {
        for _ in 0..2000 {
            if self.control_count() > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Block (up to two seconds) until the named variable was issued.
    pub fn wait_for_iovar(&self, name: &str) -> bool {
        for _ in 0..2000 {
            if self.saw_iovar(name) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    pub fn wakeup_calls(&self) -> u32 {
        *self.wakeups.lock().unwrap()
    }

    pub fn sleep_calls(&self) -> u32 {
        *self.sleeps.lock().unwrap()
    }

    fn record_and_respond(&self, frame: &[u8]) {
        let hdr = match SdpcmHeader::from_bytes(frame) {
            Ok(h) => h,
            Err(_) => return,
        };
        if hdr.channel() != CHANNEL_CONTROL {
            return;
        }
        let payload = &frame[hdr.header_length as usize..hdr.len as usize];
        let cdc = match CdcHeader::from_bytes(payload) {
            Ok(c) => c,
            Err(_) => return,
        };
        let body = payload[CDC_HEADER_SIZE..].to_vec();
        let iovar = if cdc.cmd == wlc::WLC_GET_VAR || cdc.cmd == wlc::WLC_SET_VAR {
            body.iter()
                .position(|&b| b == 0)
                .map(|n| String::from_utf8_lossy(&body[..n]).into_owned())
        } else {
            None
        };
        let sent = SentCommand {
            cmd: cdc.cmd,
            set: cdc.flags & crate::codec::CDCF_IOC_SET != 0,
            tx_id: cdc.tx_id(),
            iovar: iovar.clone(),
            payload: body,
        };
        self.controls.lock().unwrap().push(sent);

        if !*self.auto_respond.lock().unwrap() {
            return;
        }
        let reply = iovar
            .as_deref()
            .and_then(|name| self.reply_iovar.lock().unwrap().get(name).cloned())
            .or_else(|| self.reply_cmd.lock().unwrap().get(&cdc.cmd).cloned())
            .unwrap_or((0, Vec::new()));
        let mut data = reply.1;
        data.resize(cdc.len as usize, 0);
        self.push_rx(build_control_response(cdc.tx_id(), cdc.cmd, reply.0, &data));
    }
}

impl Bus for ScriptedBus {
    fn read_register(&self, _f: BusFunction, address: u32, _n: u8) -> WifiResult<u32> {
        // The chip is always immediately awake in tests.
        match address {
            reg::SLEEP_CSR => Ok(reg::KEEP_SDIO_ON | reg::DEVICE_ON),
            reg::CHIP_CLOCK_CSR => Ok(reg::HT_AVAIL | reg::ALP_AVAIL),
            _ => Ok(0),
        }
    }

    fn write_register(&self, _f: BusFunction, _a: u32, _n: u8, _v: u32) -> WifiResult<()> {
        Ok(())
    }

    fn read_backplane(&self, address: u32, byte_count: u8) -> WifiResult<u32> {
        let mem = self.bp_mem.lock().unwrap();
        let mut v = 0u32;
        for i in 0..byte_count.min(4) as u32 {
            v |= (*mem.get(&(address + i)).unwrap_or(&0) as u32) << (8 * i);
        }
        Ok(v)
    }

    fn write_backplane(&self, address: u32, byte_count: u8, value: u32) -> WifiResult<()> {
        self.bp_store(address, &value.to_le_bytes()[..byte_count.min(4) as usize]);
        Ok(())
    }

    fn transfer_backplane_bytes(
        &self,
        direction: TransferDirection,
        address: u32,
        buffer: &mut [u8],
    ) -> WifiResult<()> {
        match direction {
            TransferDirection::Read => {
                let mem = self.bp_mem.lock().unwrap();
                for (i, b) in buffer.iter_mut().enumerate() {
                    *b = *mem.get(&(address + i as u32)).unwrap_or(&0);
                }
            }
            TransferDirection::Write => {
                self.bp_store(address, buffer);
            }
        }
        Ok(())
    }

    fn wlan_write(&self, frame: &[u8]) -> WifiResult<()> {
        self.record_and_respond(frame);
        Ok(())
    }

    fn wlan_read(&self, buffer: &mut [u8]) -> WifiResult<usize> {
        let mut rx = self.rx.lock().unwrap();
        match rx.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buffer.len());
                buffer[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn wakeup(&self) -> WifiResult<()> {
        *self.wakeups.lock().unwrap() += 1;
        Ok(())
    }

    fn sleep(&self) -> WifiResult<()> {
        *self.sleeps.lock().unwrap() += 1;
        Ok(())
    }

    fn is_up(&self) -> bool {
        true
    }

    fn set_state(&self, _up: bool) {}
}

/// A control response frame as the firmware would send it.
pub fn build_control_response(tx_id: u16, cmd: u32, status: i32, data: &[u8]) -> Vec<u8> {
    let total = SDPCM_HEADER_SIZE + CDC_HEADER_SIZE + data.len();
    let mut frame = vec![0u8; total];
    SdpcmHeader::new(total as u16, 0, CHANNEL_CONTROL).write_to(&mut frame);
    let cdc = CdcHeader {
        cmd,
        len: data.len() as u32,
        flags: (tx_id as u32) << 16,
        status: status as u32,
    };
    cdc.write_to(&mut frame[SDPCM_HEADER_SIZE..]);
    frame[SDPCM_HEADER_SIZE + CDC_HEADER_SIZE..].copy_from_slice(data);
    frame
}

/// An event frame from the ethernet header onward (big-endian fields).
pub fn build_event_data_frame(
    event_type: u32,
    status: u32,
    reason: u32,
    flags: u16,
    ifidx: u8,
    bss_index: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0u8; 72 + data.len()];
    frame[..6].fill(0xFF);
    frame[12..14].copy_from_slice(&0x886Cu16.to_be_bytes());
    frame[14..16].copy_from_slice(&32769u16.to_be_bytes());
    frame[19..22].copy_from_slice(&[0x00, 0x10, 0x18]);
    frame[22..24].copy_from_slice(&1u16.to_be_bytes());
    let msg = 24;
    frame[msg..msg + 2].copy_from_slice(&1u16.to_be_bytes());
    frame[msg + 2..msg + 4].copy_from_slice(&flags.to_be_bytes());
    frame[msg + 4..msg + 8].copy_from_slice(&event_type.to_be_bytes());
    frame[msg + 8..msg + 12].copy_from_slice(&status.to_be_bytes());
    frame[msg + 12..msg + 16].copy_from_slice(&reason.to_be_bytes());
    frame[msg + 20..msg + 24].copy_from_slice(&(data.len() as u32).to_be_bytes());
    frame[msg + 46] = ifidx;
    frame[msg + 47] = bss_index;
    frame[72..].copy_from_slice(data);
    frame
}

/// A full bus frame (SDPCM + BDC) carrying one event, ready for the
/// receive queue.
pub fn build_event_bus_frame(
    event_type: u32,
    status: u32,
    reason: u32,
    flags: u16,
    ifidx: u8,
    data: &[u8],
) -> Vec<u8> {
    let eth = build_event_data_frame(event_type, status, reason, flags, ifidx, 0, data);
    let total = SDPCM_HEADER_SIZE + BDC_HEADER_SIZE + eth.len();
    let mut frame = vec![0u8; total];
    SdpcmHeader::new(total as u16, 0, CHANNEL_EVENT).write_to(&mut frame);
    // BDC header: flags, priority, flags2, data_offset all zero
    frame[SDPCM_HEADER_SIZE + BDC_HEADER_SIZE..].copy_from_slice(&eth);
    frame
}

/// One firmware BSS record (fixed part + IEs) for scan tests.
pub fn build_bss_record(
    ssid: &[u8],
    bssid: [u8; 6],
    chanspec: u16,
    ctl_ch: u8,
    rssi: i16,
    capability: u16,
    flags: u8,
    ies: &[u8],
) -> Vec<u8> {
    use crate::codec::{BSS_INFO_FIXED_SIZE, BSS_INFO_VERSION};
    let mut buf = vec![0u8; BSS_INFO_FIXED_SIZE + ies.len()];
    buf[0..4].copy_from_slice(&BSS_INFO_VERSION.to_le_bytes());
    buf[4..8].copy_from_slice(&((BSS_INFO_FIXED_SIZE + ies.len()) as u32).to_le_bytes());
    buf[8..14].copy_from_slice(&bssid);
    buf[16..18].copy_from_slice(&capability.to_le_bytes());
    buf[18] = ssid.len() as u8;
    buf[19..19 + ssid.len()].copy_from_slice(ssid);
    buf[52..56].copy_from_slice(&2u32.to_le_bytes()); // two legacy rates
    buf[56] = 0x82;
    buf[57] = 108;
    buf[72..74].copy_from_slice(&chanspec.to_le_bytes());
    buf[78..80].copy_from_slice(&rssi.to_le_bytes());
    buf[88] = ctl_ch;
    buf[96] = flags;
    buf[116..118].copy_from_slice(&(BSS_INFO_FIXED_SIZE as u16).to_le_bytes());
    buf[120..124].copy_from_slice(&(ies.len() as u32).to_le_bytes());
    buf
}

/// One escan partial-result event body wrapping a BSS record.
pub fn build_escan_partial(bss_record: &[u8]) -> Vec<u8> {
    use crate::codec::ESCAN_RESULT_HEADER_SIZE;
    let buflen = ESCAN_RESULT_HEADER_SIZE + bss_record.len();
    let mut data = vec![0u8; buflen];
    data[0..4].copy_from_slice(&(buflen as u32).to_le_bytes());
    data[4..8].copy_from_slice(&1u32.to_le_bytes());
    data[10..12].copy_from_slice(&1u16.to_le_bytes());
    data[ESCAN_RESULT_HEADER_SIZE..].copy_from_slice(bss_record);
    data
}
