/*!
    the fieldbus master engine.

    A [FieldbusMaster] owns the ordered slave list and the process image, and
    drives everything through [FieldbusMaster::cycle]: one call builds one
    chained frame out of the cyclic process data, the pending state
    confirmations and a bounded batch of queued mailbox requests, exchanges
    it, then distributes the results back to each slave.

    Mailbox transactions ([FieldbusMaster::upload] / [FieldbusMaster::download])
    can be called from any task; their datagrams ride along the cyclic frame,
    so cycles must be running for them to complete. Lifecycle switches and
    distributed-clock register accesses are privileged configuration
    operations going straight through the link, outside the cyclic deadline.
*/

use core::sync::atomic::{AtomicU64, Ordering};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
    };

use bilge::prelude::u2;
use futures_concurrency::future::Join;

use crate::{
    coe::{self, SdoAbortCode, SdoResponse},
    data::{BusData, Field},
    datagram::{Datagram, SlaveAddress},
    error::{FieldbusError, FieldbusResult},
    image::ProcessImage,
    link::BusLink,
    mailbox::{self, MailboxType},
    registers::{self, AlControlRequest, AlState, AlStatus},
    slave::{LifecycleState, SlaveDelegate, SlaveDescriptor, SlaveDevice},
    };


/// consecutive unanswered cycles before a slave is forced to the fault state
pub const DEFAULT_LOSS_THRESHOLD: u32 = 3;
/// mailbox datagrams attached to one cyclic frame at most
pub const MAILBOX_PER_CYCLE: usize = 2;
/// budget for one complete mailbox transaction, segments included
pub const DEFAULT_MAILBOX_BUDGET: Duration = Duration::from_millis(1000);
/// deadline for a lifecycle switch to be confirmed by the slave
pub const DEFAULT_SWITCH_DEADLINE: Duration = Duration::from_millis(3000);
/// budget for signalling the abort of a failed mailbox transaction
const MAILBOX_ABORT_BUDGET: Duration = Duration::from_millis(100);

/// counters accumulated over the life of the master
#[derive(Clone, Debug, Default)]
pub struct MasterStatistics {
    /// completed cyclic exchanges
    pub cycles: u64,
    /// cyclic frames that got no echo within the deadline
    pub lost_frames: u64,
}

/// everything the cycle mutates, under one lock so a cycle is atomic
struct Topology {
    slaves: Vec<SlaveDevice>,
    image: ProcessImage,
}
impl Topology {
    fn find(&mut self, address: u16) -> FieldbusResult<&mut SlaveDevice> {
        self.slaves.iter_mut()
            .find(|slave| slave.descriptor.address == address)
            .ok_or(FieldbusError::Master("no slave declared at this address"))
    }
}

/// one mailbox datagram waiting to ride a cyclic frame
struct MailboxJob {
    datagram: Datagram,
    responder: tokio::sync::oneshot::Sender<FieldbusResult<Datagram>>,
}

/// exclusive-access token of one slave's mailbox, released on drop
struct MailboxToken {
    busy: Arc<Mutex<HashSet<u16>>>,
    address: u16,
}
impl MailboxToken {
    fn acquire(busy: &Arc<Mutex<HashSet<u16>>>, address: u16) -> FieldbusResult<Self, SdoAbortCode> {
        if ! busy.lock().unwrap().insert(address)
            {return Err(FieldbusError::MailboxBusy(address))}
        Ok(Self {busy: busy.clone(), address})
    }
}
impl Drop for MailboxToken {
    fn drop(&mut self) {
        self.busy.lock().unwrap().remove(&self.address);
    }
}

/// true for failures leaving the slave's mailbox slot holding a half-finished transaction
fn transaction_stranded<T>(result: &FieldbusResult<T, SdoAbortCode>) -> bool {
    matches!(result, Err(FieldbusError::MailboxTimeout
        | FieldbusError::Protocol(_)
        | FieldbusError::MalformedPayload(_)))
}

/// the fieldbus master engine, see the module documentation
pub struct FieldbusMaster {
    link: Arc<BusLink>,
    topology: tokio::sync::Mutex<Topology>,
    /// slaves with a mailbox transaction in flight
    mailbox_busy: Arc<Mutex<HashSet<u16>>>,
    /// mailbox datagrams waiting for the next cycles
    mailbox_jobs: Mutex<VecDeque<MailboxJob>>,
    mailbox_budget: Duration,
    loss_threshold: u32,
    cycles: AtomicU64,
    lost_frames: AtomicU64,
}

impl FieldbusMaster {
    pub fn new(link: Arc<BusLink>) -> Self {
        Self {
            link,
            topology: tokio::sync::Mutex::new(Topology {
                slaves: Vec::new(),
                image: ProcessImage::new(),
            }),
            mailbox_busy: Arc::new(Mutex::new(HashSet::new())),
            mailbox_jobs: Mutex::new(VecDeque::new()),
            mailbox_budget: DEFAULT_MAILBOX_BUDGET,
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            cycles: AtomicU64::new(0),
            lost_frames: AtomicU64::new(0),
        }
    }

    /// budget for one complete mailbox transaction
    pub fn set_mailbox_budget(&mut self, budget: Duration) {
        self.mailbox_budget = budget;
    }
    /// consecutive unanswered cycles before a slave is forced to the fault state
    pub fn set_loss_threshold(&mut self, threshold: u32) {
        self.loss_threshold = threshold;
    }

    pub fn statistics(&self) -> MasterStatistics {
        MasterStatistics {
            cycles: self.cycles.load(Ordering::Relaxed),
            lost_frames: self.lost_frames.load(Ordering::Relaxed),
        }
    }

    /**
        declare a slave, allocating its process-image segments.

        Slaves are declared in bus order during configuration; declaring one
        while cycles run delays the declaration to between two cycles.
    */
    pub async fn declare(&self, descriptor: SlaveDescriptor) -> FieldbusResult {
        let mut topology = self.topology.lock().await;
        if topology.slaves.iter().any(|slave| slave.descriptor.address == descriptor.address)
            {return Err(FieldbusError::Master("a slave is already declared at this address"))}
        let region = topology.image.allocate(descriptor.outputs, descriptor.inputs);
        topology.slaves.push(SlaveDevice::new(descriptor, region));
        Ok(())
    }

    /// attach a driver to a declared slave, replacing any previous one
    pub async fn attach(&self, address: u16, delegate: Box<dyn SlaveDelegate>) -> FieldbusResult {
        self.topology.lock().await.find(address)?.delegate = Some(delegate);
        Ok(())
    }

    /// last confirmed lifecycle state of a slave
    pub async fn state(&self, address: u16) -> FieldbusResult<LifecycleState> {
        Ok(self.topology.lock().await.find(address)?.state)
    }

    /// fill a slave's output bytes for the next cycle
    pub async fn update_outputs<F>(&self, address: u16, filler: F) -> FieldbusResult
    where F: FnOnce(&mut [u8])
    {
        let mut topology = self.topology.lock().await;
        let region = topology.find(address)?.region;
        filler(topology.image.outputs_mut(&region));
        Ok(())
    }

    /// read a slave's input bytes as received during the last cycle
    pub async fn read_inputs<F, R>(&self, address: u16, reader: F) -> FieldbusResult<R>
    where F: FnOnce(&[u8]) -> R
    {
        let mut topology = self.topology.lock().await;
        let region = topology.find(address)?.region;
        Ok(reader(topology.image.inputs(&region)))
    }

    /**
        run one complete exchange cycle.

        A frame timeout degrades the affected slaves and returns the error,
        but leaves the master ready for the next cycle; the caller's loop
        decides nothing more than whether to log it.
    */
    pub async fn cycle(&self) -> FieldbusResult {
        let mut topology = self.topology.lock().await;
        let topology = &mut *topology;

        // let drivers refresh their outputs
        for slave in topology.slaves.iter_mut() {
            if ! slave.state.exchanging() {continue}
            if let Some(delegate) = slave.delegate.as_mut() {
                delegate.update_outputs(topology.image.outputs_mut(&slave.region));
            }
        }

        // inputs are mapped in logical memory after all outputs
        let input_base = topology.image.outputs_len() as u16;

        // tells how to distribute one echoed datagram back
        enum Route {
            Outputs(usize),
            Inputs(usize),
            Confirm(usize),
            Mailbox(tokio::sync::oneshot::Sender<FieldbusResult<Datagram>>),
        }

        let mut datagrams = Vec::new();
        let mut routes = Vec::new();

        for (rank, slave) in topology.slaves.iter().enumerate() {
            if slave.state.exchanging() {
                let region = &slave.region;
                if ! region.output.is_empty() {
                    datagrams.push(Datagram::write(
                        SlaveAddress::Logical,
                        region.output.offset as u16,
                        topology.image.outputs(region),
                        )?);
                    routes.push(Route::Outputs(rank));
                }
                if ! region.input.is_empty() {
                    datagrams.push(Datagram::read(
                        SlaveAddress::Logical,
                        input_base + region.input.offset as u16,
                        region.input.len,
                        )?);
                    routes.push(Route::Inputs(rank));
                }
            }
            if slave.requested.is_some() {
                datagrams.push(Datagram::read_value::<AlStatus>(
                    SlaveAddress::Fixed(slave.descriptor.address),
                    registers::al::status.byte as u16,
                    )?);
                routes.push(Route::Confirm(rank));
            }
        }

        // a bounded batch of mailbox datagrams rides along
        {
            let mut jobs = self.mailbox_jobs.lock().unwrap();
            for _ in 0 .. MAILBOX_PER_CYCLE {
                match jobs.pop_front() {
                    Some(job) => {
                        datagrams.push(job.datagram);
                        routes.push(Route::Mailbox(job.responder));
                    }
                    None => break,
                }
            }
        }

        if datagrams.is_empty() {
            self.cycles.fetch_add(1, Ordering::Relaxed);
            return Ok(())
        }

        match self.link.exchange(&mut datagrams).await {
            Ok(()) => {}
            Err(error) => {
                self.lost_frames.fetch_add(1, Ordering::Relaxed);
                // degrade every slave that was part of the exchange, once each
                let mut degraded = HashSet::new();
                for route in routes {
                    let rank = match route {
                        Route::Outputs(rank) | Route::Inputs(rank) | Route::Confirm(rank) => rank,
                        Route::Mailbox(responder) => {
                            let _ = responder.send(Err(FieldbusError::FrameTimeout));
                            continue
                        }
                    };
                    if ! degraded.insert(rank) {continue}
                    let slave = &mut topology.slaves[rank];
                    if slave.record_loss(self.loss_threshold) && slave.state != LifecycleState::Error {
                        log::warn!("slave {}: no response for {} cycles, entering the fault state",
                            slave.descriptor.address, slave.lost_responses);
                        slave.state = LifecycleState::Error;
                        slave.requested = None;
                    }
                }
                return Err(error)
            }
        }

        // a slave's streak moves once per cycle, even when it had several datagrams
        let mut streaks: std::collections::HashMap<usize, bool> = std::collections::HashMap::new();

        for (datagram, route) in datagrams.into_iter().zip(routes) {
            let served = datagram.working_count() >= 1;
            match route {
                Route::Outputs(rank) => {
                    *streaks.entry(rank).or_insert(true) &= served;
                }
                Route::Inputs(rank) => {
                    *streaks.entry(rank).or_insert(true) &= served;
                    if served {
                        let slave = &mut topology.slaves[rank];
                        topology.image.inputs_mut(&slave.region).copy_from_slice(datagram.payload());
                        if let Some(delegate) = slave.delegate.as_mut() {
                            delegate.consume_inputs(topology.image.inputs(&slave.region));
                        }
                    }
                }
                Route::Confirm(rank) => {
                    let slave = &mut topology.slaves[rank];
                    if ! served {continue}
                    let status: AlStatus = match datagram.value() {
                        Ok(status) => status,
                        // one unreadable answer must not stop distributing the others
                        Err(_) => {
                            log::warn!("slave {}: unreadable state answer, ignored",
                                slave.descriptor.address);
                            continue
                        }
                    };
                    let Some(requested) = slave.requested else {continue};
                    match AlState::try_from(status.state()) {
                        Ok(reported) if reported == requested && ! status.error() => {
                            slave.state = reported.into();
                            slave.requested = None;
                            log::debug!("slave {}: reached {:?}", slave.descriptor.address, slave.state);
                        }
                        _ if status.error() => {
                            log::warn!("slave {}: refused the transition to {requested:?}",
                                slave.descriptor.address);
                            slave.state = LifecycleState::Error;
                            slave.requested = None;
                        }
                        // still transiting, keep confirming next cycle
                        _ => {}
                    }
                }
                Route::Mailbox(responder) => {
                    let _ = responder.send(Ok(datagram));
                }
            }
        }

        for (rank, served) in streaks {
            let slave = &mut topology.slaves[rank];
            if served {
                slave.record_response();
            }
            else if slave.record_loss(self.loss_threshold) && slave.state != LifecycleState::Error {
                log::warn!("slave {}: not answering its process data, entering the fault state",
                    slave.descriptor.address);
                slave.state = LifecycleState::Error;
                slave.requested = None;
            }
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /**
        request a lifecycle transition and wait for the slave to confirm it.

        Only adjacent transitions are accepted. The request is written
        directly through the link, the confirmation is picked up by the
        running cycles; without the confirmation within the deadline the
        slave is forced to the fault state.
    */
    pub async fn switch(&self, address: u16, target: LifecycleState) -> FieldbusResult {
        let requested = {
            let mut topology = self.topology.lock().await;
            let slave = topology.find(address)?;
            if ! slave.state.adjacent(target)
                {return Err(FieldbusError::Master("only adjacent lifecycle transitions can be requested"))}
            let requested = AlState::try_from(target)
                .map_err(FieldbusError::Master)?;
            slave.requested = Some(requested);
            requested
        };

        let mut control = AlControlRequest::default();
        control.set_state(requested.into());
        // moving away from the fault state acknowledges it
        control.set_ack(target == LifecycleState::Init);
        self.link.write(SlaveAddress::Fixed(address), registers::al::control, control).await?;

        let confirmed = tokio::time::timeout(DEFAULT_SWITCH_DEADLINE, async {
            loop {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let mut topology = self.topology.lock().await;
                let slave = topology.find(address)?;
                // the cycle clears the request once the slave confirmed, refused or got degraded
                if slave.requested.is_some() {continue}
                if slave.state == target {return Ok(())}
                return Err(FieldbusError::StateTransitionRejected {
                    slave: address,
                    requested: u8::from(bilge::prelude::u4::from(requested)),
                    reported: AlState::try_from(slave.state)
                        .map(|state| u8::from(bilge::prelude::u4::from(state)))
                        .unwrap_or(0),
                    })
            }
        }).await;

        match confirmed {
            Ok(result) => result,
            Err(_elapsed) => {
                let mut topology = self.topology.lock().await;
                let slave = topology.find(address)?;
                let reported = slave.state;
                slave.state = LifecycleState::Error;
                slave.requested = None;
                Err(FieldbusError::StateTransitionRejected {
                    slave: address,
                    requested: u8::from(bilge::prelude::u4::from(requested)),
                    reported: AlState::try_from(reported)
                        .map(|state| u8::from(bilge::prelude::u4::from(state)))
                        .unwrap_or(0),
                    })
            }
        }
    }

    /// request the same adjacent transition on every declared slave, concurrently
    pub async fn switch_all(&self, target: LifecycleState) -> FieldbusResult {
        let addresses = {
            let topology = self.topology.lock().await;
            topology.slaves.iter().map(|slave| slave.descriptor.address).collect::<Vec<_>>()
        };
        let results = addresses.iter()
            .map(|&address| self.switch(address, target))
            .collect::<Vec<_>>()
            .join().await;
        results.into_iter().collect()
    }

    /// reset a slave out of the fault state, back to the start of its lifecycle
    pub async fn reset(&self, address: u16) -> FieldbusResult {
        self.switch(address, LifecycleState::Init).await
    }

    /**
        privileged typed read of a slave register, bypassing the cyclic frame.

        Intended for the low-frequency configuration accesses, distributed
        clock registers in particular, see [registers::dc].
    */
    pub async fn register_read<T: BusData>(&self, address: u16, field: Field<T>) -> FieldbusResult<T> {
        self.link.read(SlaveAddress::Fixed(address), field).await?.one()
    }
    /// privileged typed write of a slave register, bypassing the cyclic frame
    pub async fn register_write<T: BusData>(&self, address: u16, field: Field<T>, value: T) -> FieldbusResult {
        match self.link.write(SlaveAddress::Fixed(address), field, value).await? {
            1 => Ok(()),
            0 => Err(FieldbusError::FrameTimeout),
            _ => Err(FieldbusError::Protocol("several slaves answered a single-slave command")),
        }
    }

    /// align a slave's cyclic unit to the master's cycle start
    pub async fn configure_clock(&self, address: u16, start_time: u64, cycle_time: u32) -> FieldbusResult {
        let local = self.register_read(address, registers::dc::receive_time_port0).await?;
        self.register_write(address, registers::dc::system_time_offset,
            start_time.wrapping_sub(u64::from(local))).await?;
        self.register_write(address, registers::dc::sync0_cycle_time, cycle_time).await?;
        self.register_write(address, registers::dc::start_time, start_time).await?;
        // sync0 generation on, cyclic unit active
        self.register_write(address, registers::dc::activation, 0b011).await?;
        Ok(())
    }

    /**
        read a value from a slave's object dictionary.

        Fails with [FieldbusError::MailboxBusy] if a transaction is already
        pending on this slave, with [FieldbusError::MailboxTimeout] if the
        transaction does not complete within the budget, and with
        [FieldbusError::Slave] carrying the abort code if the slave rejects
        the entry.
    */
    pub async fn upload(&self, address: u16, index: u16, sub: u8) -> FieldbusResult<Vec<u8>, SdoAbortCode> {
        let _token = MailboxToken::acquire(&self.mailbox_busy, address)?;
        let config = self.mailbox_config(address).await?;

        let result = tokio::time::timeout(self.mailbox_budget, async {
            self.mailbox_send(address, &config, coe::upload_request(index, sub)
                .map_err(FieldbusError::from)?).await?;

            let content = self.mailbox_answer(address, &config).await?;
            let mut value = match coe::parse_response(&content).map_err(FieldbusError::from)? {
                SdoResponse::UploadExpedited {data, ..} => return Ok(data),
                SdoResponse::UploadSized {total, data, ..} => {
                    let mut value = data;
                    value.reserve(total.saturating_sub(value.len()));
                    value
                }
                SdoResponse::Abort {code, ..} => return Err(FieldbusError::Slave(code)),
                _ => return Err(FieldbusError::Protocol("unexpected answer to an upload request")),
            };

            let mut toggle = false;
            loop {
                self.mailbox_send(address, &config, coe::upload_segment_request(toggle)
                    .map_err(FieldbusError::from)?).await?;
                let content = self.mailbox_answer(address, &config).await?;
                match coe::parse_response(&content).map_err(FieldbusError::from)? {
                    SdoResponse::UploadSegment {more, toggle: echoed, data} => {
                        if echoed != toggle
                            {return Err(FieldbusError::Protocol("upload segment toggle out of sequence"))}
                        value.extend_from_slice(&data);
                        if ! more {break}
                        toggle = ! toggle;
                    }
                    SdoResponse::Abort {code, ..} => return Err(FieldbusError::Slave(code)),
                    _ => return Err(FieldbusError::Protocol("unexpected answer to a segment request")),
                }
            }
            Ok(value)
        }).await.unwrap_or(Err(FieldbusError::MailboxTimeout));

        if transaction_stranded(&result) {
            self.mailbox_abort(address, &config, index, sub).await;
        }
        result
    }

    /**
        write a value to a slave's object dictionary, confirmed by the slave.

        Values longer than the slave's mailbox are segmented into consecutive
        round trips. Error kinds are those of [FieldbusMaster::upload].
    */
    pub async fn download(&self, address: u16, index: u16, sub: u8, value: &[u8]) -> FieldbusResult<(), SdoAbortCode> {
        let _token = MailboxToken::acquire(&self.mailbox_busy, address)?;
        let config = self.mailbox_config(address).await?;
        let capacity = usize::from(config.write_size) - crate::mailbox::MailboxHeader::packed_length();

        let result = tokio::time::timeout(self.mailbox_budget, async {
            let (request, mut sent) = coe::download_request(index, sub, value, capacity)
                .map_err(FieldbusError::from)?;
            self.mailbox_send(address, &config, request).await?;
            let content = self.mailbox_answer(address, &config).await?;
            match coe::parse_response(&content).map_err(FieldbusError::from)? {
                SdoResponse::DownloadAck {..} => {}
                SdoResponse::Abort {code, ..} => return Err(FieldbusError::Slave(code)),
                _ => return Err(FieldbusError::Protocol("unexpected answer to a download request")),
            }

            let mut toggle = false;
            while sent < value.len() {
                // segment capacity: mailbox content minus the two protocol headers
                let room = capacity - coe::CoeHeader::packed_length() - 1;
                let chunk = &value[sent .. value.len().min(sent + room)];
                let more = sent + chunk.len() < value.len();
                self.mailbox_send(address, &config,
                    coe::download_segment_request(toggle, more, chunk)
                        .map_err(FieldbusError::from)?).await?;
                let content = self.mailbox_answer(address, &config).await?;
                match coe::parse_response(&content).map_err(FieldbusError::from)? {
                    SdoResponse::DownloadSegmentAck {toggle: echoed} => {
                        if echoed != toggle
                            {return Err(FieldbusError::Protocol("download segment toggle out of sequence"))}
                    }
                    SdoResponse::Abort {code, ..} => return Err(FieldbusError::Slave(code)),
                    _ => return Err(FieldbusError::Protocol("unexpected answer to a segment request")),
                }
                sent += chunk.len();
                toggle = ! toggle;
            }
            Ok(())
        }).await.unwrap_or(Err(FieldbusError::MailboxTimeout));

        if transaction_stranded(&result) {
            self.mailbox_abort(address, &config, index, sub).await;
        }
        result
    }

    /// typed convenience over [FieldbusMaster::upload]
    pub async fn sdo_read<T: BusData>(&self, address: u16, index: u16, sub: u8) -> FieldbusResult<T, SdoAbortCode> {
        let raw = self.upload(address, index, sub).await?;
        T::unpack(&raw).map_err(|error| FieldbusError::<()>::from(error).upgrade())
    }
    /// typed convenience over [FieldbusMaster::download]
    pub async fn sdo_write<T: BusData>(&self, address: u16, index: u16, sub: u8, value: T) -> FieldbusResult<(), SdoAbortCode> {
        let mut raw = vec![0; T::packed_size()];
        value.pack(&mut raw).map_err(|error| FieldbusError::<()>::from(error).upgrade())?;
        self.download(address, index, sub, &raw).await
    }

    /// the mailbox regions of a slave, checking mailbox access is permitted
    async fn mailbox_config(&self, address: u16) -> FieldbusResult<mailbox::MailboxConfig, SdoAbortCode> {
        let mut topology = self.topology.lock().await;
        let slave = topology.find(address).map_err(FieldbusError::upgrade)?;
        if ! slave.state.mailbox_allowed()
            {return Err(FieldbusError::Master("mailbox access needs the slave pre-operational at least"))}
        slave.descriptor.mailbox
            .ok_or(FieldbusError::Master("this slave has no mailbox"))
    }

    /// queue one mailbox datagram and wait for its echoed result
    async fn mailbox_exchange(&self, datagram: Datagram) -> FieldbusResult<Datagram> {
        let (responder, receiver) = tokio::sync::oneshot::channel();
        self.mailbox_jobs.lock().unwrap().push_back(MailboxJob {datagram, responder});
        match receiver.await {
            Ok(result) => result,
            // the cycle dropped the job, same recovery as a lost frame
            Err(_closed) => Err(FieldbusError::FrameTimeout),
        }
    }

    /// write a request into a slave's mailbox, retrying while the mailbox is full
    async fn mailbox_send(
        &self,
        address: u16,
        config: &mailbox::MailboxConfig,
        content: Vec<u8>,
        ) -> FieldbusResult<(), SdoAbortCode>
    {
        let count = {
            let mut topology = self.topology.lock().await;
            let slave = topology.find(address).map_err(FieldbusError::upgrade)?;
            mailbox::next_count(&mut slave.mailbox_count)
        };
        loop {
            let request = mailbox::request(
                address, config, MailboxType::Can, u2::new(0), count, &content,
                ).map_err(FieldbusError::from)?;
            match self.mailbox_exchange(request).await {
                Ok(echoed) if echoed.working_count() >= 1 => return Ok(()),
                // mailbox still full or frame lost, try again within the budget
                Ok(_) | Err(FieldbusError::FrameTimeout) => continue,
                Err(error) => return Err(error.upgrade()),
            }
        }
    }

    /// poll a slave's read mailbox until it yields a response content
    async fn mailbox_answer(
        &self,
        address: u16,
        config: &mailbox::MailboxConfig,
        ) -> FieldbusResult<Vec<u8>, SdoAbortCode>
    {
        loop {
            let poll = mailbox::poll(address, config).map_err(FieldbusError::from)?;
            let echoed = match self.mailbox_exchange(poll).await {
                Ok(echoed) if echoed.working_count() >= 1 => echoed,
                Ok(_) | Err(FieldbusError::FrameTimeout) => continue,
                Err(error) => return Err(error.upgrade()),
            };
            let (header, content) = mailbox::open(echoed.payload())
                .map_err(FieldbusError::from)?;
            match header.ty() {
                MailboxType::Can => return Ok(content.to_vec()),
                MailboxType::Exception => {
                    let code = mailbox::error_code(content).map_err(FieldbusError::from)?;
                    log::warn!("slave {address}: mailbox exception {code:?}");
                    return Err(FieldbusError::Protocol("the slave rejected the mailbox request"))
                }
                _ => return Err(FieldbusError::Protocol("unexpected mailbox protocol in the answer")),
            }
        }
    }

    /// signal the abort of a stranded transaction, freeing the slave's mailbox slot
    async fn mailbox_abort(&self, address: u16, config: &mailbox::MailboxConfig, index: u16, sub: u8) {
        let Ok(content) = coe::abort_request(index, sub, SdoAbortCode::Timeout) else {return};
        match tokio::time::timeout(MAILBOX_ABORT_BUDGET,
            self.mailbox_send(address, config, content)).await
        {
            Ok(Ok(())) => {}
            _ => log::debug!("slave {address}: abort not delivered, its mailbox may stay busy"),
        }
    }
}
