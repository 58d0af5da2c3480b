/*!
    the frame exchange layer.

    A [BusLink] owns one transport and enforces the one-frame-in-flight rule:
    an exchange sends one assembled frame, then waits for the echoed frame
    carrying the same token, up to a fixed deadline. Everything above (cycles,
    mailbox transactions, register accesses) funnels through [BusLink::exchange].
*/

use core::sync::atomic::{AtomicU8, Ordering};
use std::{sync::Arc, time::Duration};

use crate::{
    data::{BusData, Field, Storage},
    datagram::{Datagram, Frame, SlaveAddress, MAX_FRAME},
    error::{FieldbusError, FieldbusResult},
    transport::{self, FieldbusTransport},
    };


/// deadline used when the caller does not provide one
pub const DEFAULT_EXCHANGE_DEADLINE: Duration = Duration::from_millis(20);

/// a value read from the bus, together with the number of slaves that served it
#[derive(Clone, Debug)]
pub struct Answer<T> {
    pub working_count: u16,
    pub value: T,
}
impl<T> Answer<T> {
    /// the value, if exactly one slave answered
    pub fn one(self) -> FieldbusResult<T> {
        match self.working_count {
            1 => Ok(self.value),
            0 => Err(FieldbusError::FrameTimeout),
            _ => Err(FieldbusError::Protocol("several slaves answered a single-slave command")),
        }
    }
}

/**
    serialized access to one fieldbus segment.

    The link is cheap to share: concurrent exchange calls queue on an internal
    lock, each exchange being one complete send/receive round trip. The token
    written in every datagram header distinguishes the echoed frame from stale
    frames of an aborted previous exchange.
*/
pub struct BusLink {
    transport: Arc<dyn FieldbusTransport>,
    /// serializes exchanges and owns the receive buffer
    exchanging: tokio::sync::Mutex<Box<[u8; MAX_FRAME]>>,
    token: AtomicU8,
    deadline: Duration,
}

impl BusLink {
    pub fn new(transport: Arc<dyn FieldbusTransport>) -> Self {
        Self::with_deadline(transport, DEFAULT_EXCHANGE_DEADLINE)
    }
    pub fn with_deadline(transport: Arc<dyn FieldbusTransport>, deadline: Duration) -> Self {
        Self {
            transport,
            exchanging: tokio::sync::Mutex::new(Box::new([0; MAX_FRAME])),
            token: AtomicU8::new(0),
            deadline,
        }
    }

    /// the deadline applied to every exchange
    pub fn deadline(&self) -> Duration {self.deadline}

    /**
        send the given datagrams as one chained frame and wait for its echo.

        On success every datagram holds its response payload and working
        counter. A missing echo within the deadline leaves the datagrams
        untouched and returns [FieldbusError::FrameTimeout].
    */
    pub async fn exchange(&self, datagrams: &mut [Datagram]) -> FieldbusResult {
        let token = self.token.fetch_add(1, Ordering::Relaxed);
        let mut frame = Frame::new(token);
        for datagram in datagrams.iter() {
            frame.push(datagram)?;
        }
        if frame.content() + 2 > self.transport.max_frame()
            {return Err(FieldbusError::Master("chained datagrams exceed the transport frame size"))}

        let mut buffer = self.exchanging.lock().await;
        transport::send(&*self.transport, frame.finish()?).await?;

        let received = tokio::time::timeout(self.deadline, async {
            loop {
                let size = transport::receive(&*self.transport, buffer.as_mut_slice()).await?;
                // the token sits in the first datagram header, right after the frame header
                match buffer.get(3) {
                    Some(&echoed) if echoed == token => break Ok::<_, std::io::Error>(size),
                    _ => log::trace!("discarding a frame with a foreign token"),
                }
            }
        }).await;
        match received {
            Ok(result) => {
                let size = result?;
                Frame::decode(&buffer[.. size], token, datagrams)?;
                Ok(())
            }
            Err(_elapsed) => {
                log::warn!("exchange {token}: no echoed frame within {:?}", self.deadline);
                Err(FieldbusError::FrameTimeout)
            }
        }
    }

    /// exchange one datagram, a convenience for register and mailbox accesses
    pub async fn exchange_one(&self, datagram: Datagram) -> FieldbusResult<Datagram> {
        let mut datagrams = [datagram];
        self.exchange(&mut datagrams).await?;
        let [datagram] = datagrams;
        Ok(datagram)
    }

    /// read a typed register of the addressed slave(s)
    pub async fn read<T: BusData>(&self, slave: SlaveAddress, field: Field<T>) -> FieldbusResult<Answer<T>> {
        let datagram = self.exchange_one(
            Datagram::read(slave, field.byte as u16, field.len)?,
            ).await?;
        Ok(Answer {
            working_count: datagram.working_count(),
            value: datagram.value()?,
        })
    }

    /// write a typed register of the addressed slave(s), returning the working counter
    pub async fn write<T: BusData>(&self, slave: SlaveAddress, field: Field<T>, value: T) -> FieldbusResult<u16> {
        let datagram = self.exchange_one(
            Datagram::write_value(slave, field.byte as u16, value, field.len)?,
            ).await?;
        Ok(datagram.working_count())
    }

    /// read then write back a typed register in one round trip, used for read-modify-write sequences
    pub async fn read_write<T: BusData>(&self, slave: SlaveAddress, field: Field<T>, value: T) -> FieldbusResult<Answer<T>> {
        let mut payload = T::Packed::zeroed();
        value.pack(payload.as_mut())?;
        let (command, address) = crate::datagram::DatagramCommand::writing(slave);
        let exchanged = match command {
            // broadcast and logical commands have a combined read/write form
            crate::datagram::DatagramCommand::Bwr => crate::datagram::DatagramCommand::Brw,
            crate::datagram::DatagramCommand::Lwr => crate::datagram::DatagramCommand::Lrw,
            crate::datagram::DatagramCommand::Apwr => crate::datagram::DatagramCommand::Aprw,
            crate::datagram::DatagramCommand::Fpwr => crate::datagram::DatagramCommand::Fprw,
            other => other,
        };
        let datagram = self.exchange_one(
            Datagram::new(exchanged, address, field.byte as u16, payload.as_ref().to_vec())?,
            ).await?;
        Ok(Answer {
            working_count: datagram.working_count(),
            value: datagram.value()?,
        })
    }
}
