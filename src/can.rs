/*!
    the secondary bus master, driving CANopen-class nodes over a serial
    differential bus.

    Unlike the primary engine there is no process image here: the bus carries
    standard small frames (an 11-bit identifier plus up to 8 data bytes) and
    each received frame is handed synchronously to the delegate of the node
    it came from. The master also keeps the last received object of each
    buffered kind per node, so drivers can poll [CanOpenMaster::receive_object]
    instead of reacting in the delegate.

    The receive loop runs on a [crate::task::CyclicTask], see
    [CanOpenMaster::start].
*/

use core::sync::atomic::{AtomicU64, Ordering};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
    };

use crate::{
    error::{FieldbusError, FieldbusResult},
    task::{CyclicTask, TaskConfig},
    };


/// the function codes forming the upper bits of a frame identifier
pub mod function_code {
    pub const NMT: u16 = 0x000;
    pub const SYNC: u16 = 0x080;
    pub const EMERGENCY: u16 = 0x080;
    pub const TPDO1: u16 = 0x180;
    pub const RPDO1: u16 = 0x200;
    pub const TPDO2: u16 = 0x280;
    pub const RPDO2: u16 = 0x300;
    pub const TPDO3: u16 = 0x380;
    pub const RPDO3: u16 = 0x400;
    pub const TPDO4: u16 = 0x480;
    pub const RPDO4: u16 = 0x500;
    pub const TSDO: u16 = 0x580;
    pub const RSDO: u16 = 0x600;
    pub const NODEGUARD: u16 = 0x700;

    pub(super) const FUNCTION_MASK: u16 = 0x780;
    pub(super) const NODE_MASK: u16 = 0x07f;

    /// the codes whose last received object is buffered per node
    pub(super) const BUFFERED: [u16; 7] = [EMERGENCY, TPDO1, TPDO2, TPDO3, TPDO4, TSDO, NODEGUARD];
}

/// network management command specifiers, sent with [CanOpenMaster::transmit_nmt]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum NmtCommand {
    StartRemoteNode = 0x01,
    StopRemoteNode = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// one frame on the secondary bus
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    /// 11-bit identifier: function code in the upper bits, node id in the lower 7
    pub id: u16,
    /// up to 8 data bytes
    pub data: heapless::Vec<u8, 8>,
    /// true for a remote transmission request
    pub remote: bool,
}
impl CanFrame {
    pub fn new(id: u16, data: &[u8]) -> Self {
        Self {
            id,
            data: heapless::Vec::from_slice(data).unwrap_or_default(),
            remote: false,
        }
    }
    /// the node this frame belongs to
    pub fn node(&self) -> u8 {(self.id & function_code::NODE_MASK) as u8}
    /// the function code of this frame
    pub fn function(&self) -> u16 {self.id & function_code::FUNCTION_MASK}
}

/**
    trait for the physical CAN controller backends.

    One variant per physical backend (socketcan, memory-mapped controllers),
    selected at configuration time. Reception is non-blocking since the
    master polls from its cyclic task.
*/
pub trait CanTransport: Send + Sync {
    /// pop one received frame, [None] when the receive queue is empty
    fn try_receive(&self) -> io::Result<Option<CanFrame>>;
    /// queue one frame for transmission on the next available slot
    fn send(&self, frame: &CanFrame) -> io::Result<()>;
}

/**
    trait for device drivers owning one node of the secondary bus.

    [Self::receive_object] is invoked synchronously from the bus master's
    cyclic task, it must not block; a long reaction belongs on the device's
    own task.
*/
pub trait CanOpenDelegate: Send {
    fn receive_object(&mut self, _function_code: u16, _object: &[u8]) {}
}

/// error reported by a node rejecting a service data request
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct CanSdoError {
    pub class: u8,
    pub code: u8,
}

/// per-node state guarded by the master's lock
#[derive(Default)]
struct Registry {
    delegates: HashMap<u8, Box<dyn CanOpenDelegate>>,
    /// last received object per (function code, node), cleared by consumption
    objects: HashMap<(u16, u8), heapless::Vec<u8, 8>>,
}

/// max time to wait for a reply on a service data request
const SDO_TIMEOUT: Duration = Duration::from_millis(1000);
/// max number of request retries within the timeout limit
const SDO_RETRIES: u32 = 5;

/// the secondary bus master, see the module documentation
pub struct CanOpenMaster {
    transport: Arc<dyn CanTransport>,
    registry: Mutex<Registry>,
    /// signaled whenever a service data answer arrives
    answered: tokio::sync::Notify,
    /// frames from nodes nobody registered for, dropped
    unknown_frames: AtomicU64,
}

impl CanOpenMaster {
    pub fn new(transport: Arc<dyn CanTransport>) -> Self {
        Self {
            transport,
            registry: Mutex::new(Registry::default()),
            answered: tokio::sync::Notify::new(),
            unknown_frames: AtomicU64::new(0),
        }
    }

    /// run the receive loop on its own cyclic task
    pub fn start(self: &Arc<Self>, config: TaskConfig) -> io::Result<CyclicTask> {
        let master = self.clone();
        CyclicTask::spawn(config, move || {
            let master = master.clone();
            async move {
                if let Err(error) = master.poll() {
                    log::error!("secondary bus: receive failed: {error}");
                }
            }
        })
    }

    /// register the driver owning a node, it will get every frame of that node
    pub fn register_node(&self, node: u8, delegate: Box<dyn CanOpenDelegate>) {
        self.registry.lock().unwrap().delegates.insert(node, delegate);
    }

    /// frames received from nodes without a registered driver
    pub fn unknown_frames(&self) -> u64 {
        self.unknown_frames.load(Ordering::Relaxed)
    }

    /**
        drain the receive queue, dispatching every frame to its node's
        delegate and keeping the buffered object kinds.

        Called once per tick by the task started with [Self::start].
    */
    pub fn poll(&self) -> io::Result<()> {
        while let Some(frame) = self.transport.try_receive()? {
            // remote requests target the nodes, not the master
            if frame.remote {continue}

            let function = frame.function();
            let node = frame.node();
            let mut registry = self.registry.lock().unwrap();

            match registry.delegates.get_mut(&node) {
                Some(delegate) => delegate.receive_object(function, &frame.data),
                None => {
                    self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                    log::trace!("secondary bus: frame from unregistered node {node}");
                }
            }

            if function_code::BUFFERED.contains(&function) {
                registry.objects.insert((function, node), frame.data);
                drop(registry);
                if function == function_code::TSDO {
                    self.answered.notify_waiters();
                }
            }
        }
        Ok(())
    }

    /// transmit an object with the given function code to a node
    pub fn transmit_object(&self, function: u16, node: u8, object: &[u8]) -> FieldbusResult {
        if node > 127 || object.len() > 8
            {return Err(FieldbusError::Master("a node id is 7 bits and an object 8 bytes at most"))}
        self.transport.send(&CanFrame::new(function | u16::from(node), object))?;
        Ok(())
    }

    /// transmit a network management command, node 0 addresses all nodes
    pub fn transmit_nmt(&self, command: NmtCommand, node: u8) -> FieldbusResult {
        self.transmit_object(function_code::NMT, 0, &[command as u8, node])
    }

    /// transmit a synchronization object, triggering the synchronous PDOs of all nodes
    pub fn transmit_sync(&self) -> FieldbusResult {
        self.transmit_object(function_code::SYNC, 0, &[])
    }

    /// request a nodeguard object, the answer arrives through the usual receive path
    pub fn request_nodeguard(&self, node: u8) -> FieldbusResult {
        if node > 127
            {return Err(FieldbusError::Master("a node id is 7 bits at most"))}
        self.reset_object(function_code::NODEGUARD, node);
        let mut frame = CanFrame::new(function_code::NODEGUARD | u16::from(node), &[0]);
        frame.remote = true;
        self.transport.send(&frame)?;
        Ok(())
    }

    /// the last received object of a buffered kind, [None] if none arrived since the last reset
    pub fn receive_object(&self, function: u16, node: u8) -> Option<heapless::Vec<u8, 8>> {
        self.registry.lock().unwrap().objects.get(&(function, node)).cloned()
    }

    /// forget the buffered object of the given kind, so freshness can be told apart
    pub fn reset_object(&self, function: u16, node: u8) {
        self.registry.lock().unwrap().objects.remove(&(function, node));
    }

    /**
        read an expedited service data object from a node.

        The request is retried a few times within the overall timeout, then
        fails with [FieldbusError::MailboxTimeout]. A node rejecting the
        entry yields [FieldbusError::Slave] with its error class and code.
    */
    pub async fn sdo_read(&self, node: u8, index: u16, sub: u8) -> FieldbusResult<u32, CanSdoError> {
        if node == 0 || node > 127
            {return Err(FieldbusError::Master("a node id goes from 1 to 127"))}

        let request = [
            0x40,
            index as u8, (index >> 8) as u8,
            sub,
            0, 0, 0, 0,
            ];
        let answer = self.sdo_request(node, &request).await?;

        // the upper command bits carry 4 minus the number of value bytes
        let length = 4 - usize::from((answer[0] >> 2) & 0b11);
        let mut value = 0u32;
        for (rank, byte) in answer[4 .. 4 + length].iter().enumerate() {
            value |= u32::from(*byte) << (8 * rank);
        }
        Ok(value)
    }

    /**
        write an expedited service data object to a node, confirmed by the
        node. `length` is the number of value bytes, usually 1, 2 or 4.
        Error kinds are those of [Self::sdo_read].
    */
    pub async fn sdo_write(&self, node: u8, index: u16, sub: u8, value: u32, length: u8) -> FieldbusResult<(), CanSdoError> {
        if node == 0 || node > 127
            {return Err(FieldbusError::Master("a node id goes from 1 to 127"))}
        if ! matches!(length, 1 ..= 4)
            {return Err(FieldbusError::Master("an expedited value is 1 to 4 bytes"))}

        let request = [
            0x23 + ((4 - length) << 2),
            index as u8, (index >> 8) as u8,
            sub,
            value as u8, (value >> 8) as u8, (value >> 16) as u8, (value >> 24) as u8,
            ];
        self.sdo_request(node, &request).await?;
        Ok(())
    }

    /// send one service data request and wait for the node's answer, with retries
    async fn sdo_request(&self, node: u8, request: &[u8; 8]) -> FieldbusResult<heapless::Vec<u8, 8>, CanSdoError> {
        self.reset_object(function_code::TSDO, node);

        for _retry in 0 .. SDO_RETRIES {
            self.transmit_object(function_code::RSDO, node, request)
                .map_err(FieldbusError::upgrade)?;

            let waited = tokio::time::timeout(SDO_TIMEOUT / SDO_RETRIES, async {
                loop {
                    let notified = self.answered.notified();
                    if let Some(answer) = self.receive_object(function_code::TSDO, node) {
                        return answer
                    }
                    notified.await;
                }
            }).await;

            if let Ok(answer) = waited {
                if answer.len() < 8
                    {return Err(FieldbusError::Protocol("truncated service data answer"))}
                if answer[0] & 0x80 != 0 {
                    return Err(FieldbusError::Slave(CanSdoError {
                        class: answer[7],
                        code: answer[6],
                        }))
                }
                return Ok(answer)
            }
            log::debug!("node {node}: no service data answer, retrying");
        }
        Err(FieldbusError::MailboxTimeout)
    }
}
