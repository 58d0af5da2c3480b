//! a simulated fieldbus segment, scriptable enough to exercise a master end to end

use core::{
    ops::Range,
    task::{Context, Poll, Waker},
    };
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex},
    };

use bilge::prelude::*;
use cyclebus::{
    coe::{CoeHeader, CoeService, SdoCommandRequest, SdoCommandResponse, SdoHeader},
    data::{BusData, Cursor},
    datagram::DatagramHeader,
    mailbox::{self, MailboxConfig, MailboxType},
    transport::FieldbusTransport,
    };


/// static description of one simulated slave
pub struct SimSlaveConfig {
    pub address: u16,
    pub mailbox: Option<MailboxConfig>,
    /// logical memory range holding this slave's outputs
    pub output_region: Range<usize>,
    /// logical memory range holding this slave's inputs
    pub input_region: Range<usize>,
    /// refuse every lifecycle transition, reporting the error flag
    pub refuse_transitions: bool,
    /// answer every dictionary request with an unrelated service
    pub garbled_sdo: bool,
}
impl Default for SimSlaveConfig {
    fn default() -> Self {
        Self {
            address: 1,
            mailbox: Some(MailboxConfig::default()),
            output_region: 0 .. 0,
            input_region: 0 .. 0,
            refuse_transitions: false,
            garbled_sdo: false,
        }
    }
}

struct SimSlave {
    config: SimSlaveConfig,
    /// application-layer state, wire encoding
    al_state: u8,
    al_error: bool,
    /// last outputs received, mirrored back as inputs
    outputs: Vec<u8>,
    /// plain physical registers
    registers: HashMap<u16, Vec<u8>>,
    /// response waiting in the read mailbox
    mailbox_out: Option<Vec<u8>>,
    /// the object dictionary served over the mailbox
    dictionary: HashMap<(u16, u8), Vec<u8>>,
    /// abort requests received over the mailbox
    aborts: u32,
}
impl SimSlave {
    fn new(config: SimSlaveConfig) -> Self {
        let outputs = vec![0; config.output_region.len()];
        Self {
            config,
            al_state: 0x1,
            al_error: false,
            outputs,
            registers: HashMap::new(),
            mailbox_out: None,
            dictionary: HashMap::new(),
            aborts: 0,
        }
    }

    fn exchanging(&self) -> bool {
        matches!(self.al_state, 0x4 | 0x8)
    }

    /// serve a physical write, returns true if this slave processed it
    fn write(&mut self, offset: u16, payload: &[u8]) -> bool {
        // application-layer control
        if offset == 0x0120 && payload.len() >= 2 {
            let requested = payload[0] & 0x0f;
            let ack = payload[0] & 0x10 != 0;
            if ack {self.al_error = false}
            if self.config.refuse_transitions && requested != 0x1 {
                self.al_error = true;
            }
            else {
                self.al_state = requested;
            }
            return true
        }
        // request mailbox
        if let Some(mailbox) = self.config.mailbox {
            if offset == mailbox.write_offset && payload.len() == usize::from(mailbox.write_size) {
                self.serve_mailbox(payload);
                return true
            }
        }
        self.registers.insert(offset, payload.to_vec());
        true
    }

    /// serve a physical read, returns true if this slave processed it
    fn read(&mut self, offset: u16, payload: &mut [u8]) -> bool {
        if offset == 0x0130 && payload.len() >= 2 {
            payload[0] = self.al_state | if self.al_error {0x10} else {0};
            payload[1] = 0;
            return true
        }
        if let Some(mailbox) = self.config.mailbox {
            if offset == mailbox.read_offset {
                return match self.mailbox_out.take() {
                    Some(response) => {
                        let len = payload.len().min(response.len());
                        payload[.. len].copy_from_slice(&response[.. len]);
                        true
                    }
                    // an empty read mailbox does not acknowledge the read
                    None => false,
                }
            }
        }
        match self.registers.get(&offset) {
            Some(stored) => {
                let len = payload.len().min(stored.len());
                payload[.. len].copy_from_slice(&stored[.. len]);
            }
            None => payload.fill(0),
        }
        true
    }

    /// decode a mailbox request and leave the answer in the read mailbox
    fn serve_mailbox(&mut self, payload: &[u8]) {
        let Ok((header, content)) = mailbox::open(payload) else {return};
        if header.ty() != MailboxType::Can {return}

        let mut cursor = Cursor::new(content);
        let Ok(_coe) = cursor.unpack::<CoeHeader>() else {return};
        let Ok(request) = cursor.unpack::<SdoHeader>() else {return};

        // an abort terminates the transaction, nothing is answered
        if SdoCommandRequest::try_from(request.command()) == Ok(SdoCommandRequest::Abort) {
            self.aborts += 1;
            return
        }

        let entry = (request.index(), request.sub());
        let response = if self.config.garbled_sdo {
            // an answer no dictionary initiator can make sense of
            let mut bad = vec![0; 2 + 8];
            let mut cursor = Cursor::new(bad.as_mut_slice());
            cursor.pack(&CoeHeader::new(u9::new(0), CoeService::Emergency)).unwrap();
            bad
        }
        else {match SdoCommandRequest::try_from(request.command()) {
            Ok(SdoCommandRequest::Upload) => {
                match self.dictionary.get(&entry) {
                    Some(value) if value.len() <= 4 => {
                        let mut data = [0; 4];
                        data[.. value.len()].copy_from_slice(value);
                        sdo_response(SdoHeader::new(
                            true,
                            true,
                            u2::new((4 - value.len()) as u8),
                            false,
                            u3::from(SdoCommandResponse::Upload),
                            request.index(),
                            request.sub(),
                            ), &data)
                    }
                    // entries longer than expedited are not simulated
                    _ => sdo_abort(request.index(), request.sub(), 0x0602_0000),
                }
            }
            Ok(SdoCommandRequest::Download) if request.expedited() => {
                let size = 4 - usize::from(u8::from(request.size()));
                match cursor.read(size) {
                    Ok(data) => {
                        self.dictionary.insert(entry, data.to_vec());
                        sdo_response(SdoHeader::new(
                            false,
                            false,
                            u2::new(0),
                            false,
                            u3::from(SdoCommandResponse::Download),
                            request.index(),
                            request.sub(),
                            ), &[0; 4])
                    }
                    Err(_) => sdo_abort(request.index(), request.sub(), 0x0607_0010),
                }
            }
            _ => sdo_abort(request.index(), request.sub(), 0x0504_0001),
        }};

        let read_size = self.config.mailbox.map(|m| usize::from(m.read_size)).unwrap_or(128);
        let mut out = vec![0; read_size];
        let mut cursor = Cursor::new(out.as_mut_slice());
        cursor.pack(&mailbox::MailboxHeader::new(
            response.len() as u16,
            self.config.address,
            u6::new(0),
            u2::new(0),
            MailboxType::Can,
            header.count(),
            )).unwrap();
        cursor.write(&response).unwrap();
        self.mailbox_out = Some(out);
    }
}

/// encode one SDO answer as mailbox content
fn sdo_response(header: SdoHeader, data: &[u8; 4]) -> Vec<u8> {
    let mut content = vec![0; 2 + 4 + 4];
    let mut cursor = Cursor::new(content.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoResponse)).unwrap();
    cursor.pack(&header).unwrap();
    cursor.write(data).unwrap();
    content
}

fn sdo_abort(index: u16, sub: u8, code: u32) -> Vec<u8> {
    let mut content = vec![0; 2 + 4 + 4];
    let mut cursor = Cursor::new(content.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoResponse)).unwrap();
    cursor.pack(&SdoHeader::new(
        true, true, u2::new(0), false,
        u3::from(SdoCommandResponse::Abort),
        index, sub,
        )).unwrap();
    cursor.pack(&code).unwrap();
    content
}

struct Inner {
    slaves: Vec<SimSlave>,
    echoes: VecDeque<Vec<u8>>,
    waker: Option<Waker>,
    /// swallow that many frames without echoing them
    drop_frames: u32,
}

/**
    a whole simulated segment behind the transport trait.

    Sent frames are served synchronously: every datagram is applied to the
    simulated slaves, working counters are filled in, and the echoed frame
    becomes receivable. [SimulatedBus::drop_next] swallows frames to fake a
    broken cable.
*/
pub struct SimulatedBus {
    inner: Mutex<Inner>,
}

impl SimulatedBus {
    pub fn new(slaves: Vec<SimSlaveConfig>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slaves: slaves.into_iter().map(SimSlave::new).collect(),
                echoes: VecDeque::new(),
                waker: None,
                drop_frames: 0,
            }),
        })
    }

    /// make the next `count` frames disappear on the wire
    pub fn drop_next(&self, count: u32) {
        self.inner.lock().unwrap().drop_frames = count;
    }

    /// the last outputs a slave received, as the simulated hardware sees them
    pub fn outputs_of(&self, address: u16) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner.slaves.iter()
            .find(|slave| slave.config.address == address)
            .map(|slave| slave.outputs.clone())
            .unwrap_or_default()
    }

    /// a value in a slave's simulated dictionary
    pub fn dictionary_of(&self, address: u16, index: u16, sub: u8) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.slaves.iter()
            .find(|slave| slave.config.address == address)
            .and_then(|slave| slave.dictionary.get(&(index, sub)).cloned())
    }

    /// number of abort requests a slave's mailbox received
    pub fn aborts_of(&self, address: u16) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.slaves.iter()
            .find(|slave| slave.config.address == address)
            .map(|slave| slave.aborts)
            .unwrap_or(0)
    }

    /// seed a slave's dictionary before the test
    pub fn set_dictionary(&self, address: u16, index: u16, sub: u8, value: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slave) = inner.slaves.iter_mut().find(|slave| slave.config.address == address) {
            slave.dictionary.insert((index, sub), value.to_vec());
        }
    }

    /// apply every chained datagram of a sent frame, filling payloads and working counters
    fn serve(inner: &mut Inner, frame: &mut [u8]) {
        let mut position = 2;
        loop {
            let Ok(header) = DatagramHeader::unpack(frame.get(position ..).unwrap_or(&[])) else {return};
            let len = usize::from(u16::from(header.len()));
            let payload_at = position + 10;
            let wkc_at = payload_at + len;
            if wkc_at + 2 > frame.len() {return}

            let mut working = 0u16;
            {
                let payload = &mut frame[payload_at .. wkc_at];
                match header.command() {
                    // physical access at a fixed address
                    0x04 | 0x05 => {
                        if let Some(slave) = inner.slaves.iter_mut()
                            .find(|slave| slave.config.address == header.slave())
                        {
                            let served = if header.command() == 0x04 {
                                slave.read(header.memory(), payload)
                            } else {
                                slave.write(header.memory(), payload)
                            };
                            if served {working = 1}
                        }
                    }
                    // broadcast read, states are combined with a logical or
                    0x07 => {
                        for slave in inner.slaves.iter_mut() {
                            if header.memory() == 0x0130 && payload.len() >= 2 {
                                payload[0] |= slave.al_state | if slave.al_error {0x10} else {0};
                            }
                            working += 1;
                        }
                    }
                    // broadcast write
                    0x08 => {
                        for slave in inner.slaves.iter_mut() {
                            let copy = payload.to_vec();
                            slave.write(header.memory(), &copy);
                            working += 1;
                        }
                    }
                    // logical read, slaves mirror their outputs as inputs
                    0x0a => {
                        let range = usize::from(header.memory()) .. usize::from(header.memory()) + len;
                        for slave in inner.slaves.iter_mut() {
                            if ! slave.exchanging() {continue}
                            let region = slave.config.input_region.clone();
                            if region.start >= range.start && region.end <= range.end {
                                let at = region.start - range.start;
                                payload[at .. at + slave.outputs.len().min(region.len())]
                                    .copy_from_slice(&slave.outputs[.. slave.outputs.len().min(region.len())]);
                                working += 1;
                            }
                        }
                    }
                    // logical write
                    0x0b => {
                        let range = usize::from(header.memory()) .. usize::from(header.memory()) + len;
                        for slave in inner.slaves.iter_mut() {
                            if ! slave.exchanging() {continue}
                            let region = slave.config.output_region.clone();
                            if region.start >= range.start && region.end <= range.end {
                                let at = region.start - range.start;
                                slave.outputs.copy_from_slice(&payload[at .. at + region.len()]);
                                working += 1;
                            }
                        }
                    }
                    _ => {}
                }
            }
            frame[wkc_at .. wkc_at + 2].copy_from_slice(&working.to_le_bytes());

            if ! header.more() {return}
            position = wkc_at + 2;
        }
    }
}

impl FieldbusTransport for SimulatedBus {
    fn poll_send(&self, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.drop_frames > 0 {
            inner.drop_frames -= 1;
            return Poll::Ready(Ok(()))
        }
        let mut frame = data.to_vec();
        Self::serve(&mut inner, &mut frame);
        inner.echoes.push_back(frame);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }

    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.echoes.pop_front() {
            Some(frame) => {
                data[.. frame.len()].copy_from_slice(&frame);
                Poll::Ready(Ok(frame.len()))
            }
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
