/*!
    binary datagram framing and chaining.

    A [Datagram] encodes one addressed read/write operation: a fixed header,
    a variable-length payload and a working-counter word appended by the
    transport. Several datagrams are chained back-to-back into one [Frame]
    for transmission; the response frame echoes them in the same order, which
    is what re-associates each result with the datagram that produced it.
*/

use bilge::prelude::*;
use crate::data::{self, BusData, Cursor, PackingError, PackingResult, Storage};


/// maximum content bytes the 11-bit frame length field can describe
pub const MAX_CONTENT: usize = 2047;

/// frame buffer size, enough for the frame header and any content
pub const MAX_FRAME: usize = 2050;

/// per-datagram overhead on the wire: header plus the working-counter word
pub const DATAGRAM_OVERHEAD: usize = DatagramHeader::packed_length() + WKC_SIZE;
const WKC_SIZE: usize = 2;

/// dynamically specifies a destination on the fieldbus
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SlaveAddress {
    /// every slave will receive and execute
    Broadcast,
    /// address determined by the position of the slave on the bus
    Topological(u16),
    /// address set by the master during configuration
    Fixed(u16),
    /// the logical process image is the destination, all mapped slaves contribute
    Logical,
}

/// the possible datagram commands
#[bitsize(8)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum DatagramCommand {
    /// no operation
    #[fallback]
    #[default]
    Nop = 0x00,

    /// topological (position addressed) read
    Aprd = 0x01,
    /// topological write
    Apwr = 0x02,
    /// topological read & write
    Aprw = 0x03,

    /// fixed address read
    Fprd = 0x04,
    /// fixed address write
    Fpwr = 0x05,
    /// fixed address read & write
    Fprw = 0x06,

    /// broadcast read
    Brd = 0x07,
    /// broadcast write
    Bwr = 0x08,
    /// broadcast read & write
    Brw = 0x09,

    /// logical memory read
    Lrd = 0x0a,
    /// logical memory write
    Lwr = 0x0b,
    /// logical memory read & write
    Lrw = 0x0c,
}
impl DatagramCommand {
    /// true if the command carries data from the master to the slaves
    pub fn is_write(&self) -> bool {
        matches!(self,
            Self::Apwr | Self::Fpwr | Self::Bwr | Self::Lwr
            | Self::Aprw | Self::Fprw | Self::Brw | Self::Lrw)
    }
    /// true if the command brings data back from the slaves
    pub fn is_read(&self) -> bool {
        matches!(self,
            Self::Aprd | Self::Fprd | Self::Brd | Self::Lrd
            | Self::Aprw | Self::Fprw | Self::Brw | Self::Lrw)
    }

    /// command performing a read at the given address
    pub fn reading(slave: SlaveAddress) -> (Self, u16) {
        match slave {
            SlaveAddress::Broadcast => (Self::Brd, 0),
            SlaveAddress::Topological(position) => (Self::Aprd, 0u16.wrapping_sub(position)),
            SlaveAddress::Fixed(address) => (Self::Fprd, address),
            SlaveAddress::Logical => (Self::Lrd, 0),
        }
    }
    /// command performing a write at the given address
    pub fn writing(slave: SlaveAddress) -> (Self, u16) {
        match slave {
            SlaveAddress::Broadcast => (Self::Bwr, 0),
            SlaveAddress::Topological(position) => (Self::Apwr, 0u16.wrapping_sub(position)),
            SlaveAddress::Fixed(address) => (Self::Fpwr, address),
            SlaveAddress::Logical => (Self::Lwr, 0),
        }
    }
}

/// header of one datagram inside a frame
#[bitsize(80)]
#[derive(FromBits, DebugBits, Clone, Default)]
pub struct DatagramHeader {
    /// operation to perform, specifying the addressing mode and the read/write direction
    pub command: u8,
    /// token re-associating a response frame with the exchange that sent it
    pub token: u8,
    /// slave address, its meaning depends on the command
    pub slave: u16,
    /// memory offset of the data to access within the addressed slave
    pub memory: u16,
    /// payload length following the header, excluding the working-counter word
    pub len: u11,
    reserved: u3,
    /// set by slaves when a frame circulates without reaching the master
    pub circulating: bool,
    /// true if another datagram follows in the same frame
    pub more: bool,
    /// event request registers of all slaves, combined with a logical OR
    pub irq: u16,
}
data::bilge_busdata!(DatagramHeader, u80);

impl DatagramHeader {
    pub const fn packed_length() -> usize {10}
}

/**
    one addressed read/write operation, encoded for transmission.

    A datagram is constructed per exchange (or per mailbox request) and
    discarded after its response is consumed, it has no identity beyond one
    exchange. Cloning produces an independent record with its own payload
    storage.
*/
#[derive(Clone, Debug)]
pub struct Datagram {
    pub command: DatagramCommand,
    /// slave or position address, interpreted according to the command
    pub slave: u16,
    /// register or memory offset within the addressed slave
    pub offset: u16,
    /// payload bytes, zero-filled for reads and echoed back for writes
    payload: Vec<u8>,
    /// number of slaves that processed the command, filled from the response
    working_count: u16,
}
impl Datagram {
    /**
        datagram reading `length` bytes at the given location

        the payload is zero-filled and will hold the read data once the
        response is distributed back.
    */
    pub fn read(slave: SlaveAddress, offset: u16, length: usize) -> PackingResult<Self> {
        let (command, slave) = DatagramCommand::reading(slave);
        Self::new(command, slave, offset, vec![0; length])
    }

    /// datagram writing the given bytes at the given location
    pub fn write(slave: SlaveAddress, offset: u16, data: &[u8]) -> PackingResult<Self> {
        let (command, slave) = DatagramCommand::writing(slave);
        Self::new(command, slave, offset, data.to_vec())
    }

    /// datagram reading a typed value, its length is the value's wire size
    pub fn read_value<T: BusData>(slave: SlaveAddress, offset: u16) -> PackingResult<Self> {
        Self::read(slave, offset, T::Packed::LEN)
    }

    /**
        datagram writing a typed value tagged with an explicit length

        a length that does not match the value's wire size is a caller bug
        and is rejected at construction.
    */
    pub fn write_value<T: BusData>(slave: SlaveAddress, offset: u16, value: T, length: usize) -> PackingResult<Self> {
        if length != T::Packed::LEN
            {return Err(PackingError::BadSize(length, "length does not match the value wire size"))}
        let mut payload = T::Packed::zeroed();
        value.pack(payload.as_mut())?;
        let (command, slave) = DatagramCommand::writing(slave);
        Self::new(command, slave, offset, payload.as_ref().to_vec())
    }

    /// raw constructor, checking the payload fits the frame content the length fields can describe
    pub fn new(command: DatagramCommand, slave: u16, offset: u16, payload: Vec<u8>) -> PackingResult<Self> {
        if payload.len() + DATAGRAM_OVERHEAD > MAX_CONTENT
            {return Err(PackingError::BadSize(payload.len(), "payload exceeds the maximum frame content"))}
        Ok(Self {command, slave, offset, payload, working_count: 0})
    }

    /// payload bytes, holding the response data after a successful exchange
    pub fn payload(&self) -> &[u8] {&self.payload}
    /// wire size of this datagram, header and working counter included
    pub fn wire_size(&self) -> usize {self.payload.len() + DATAGRAM_OVERHEAD}

    /// number of slaves that processed the command during the last exchange
    pub fn working_count(&self) -> u16 {self.working_count}
    /// clear the working counter before a new exchange
    pub fn reset_working_count(&mut self) {self.working_count = 0}

    /// extract the response payload as a typed value
    pub fn value<T: BusData>(&self) -> PackingResult<T> {
        T::unpack(&self.payload)
    }
}

/// frame content type
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
enum FrameType {
    /// chained datagrams exchanging with physical or logical memory
    Datagrams = 0x1,
}

/// frame header, common to all transport mediums
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
struct FrameHeader {
    /// length of the frame content (the header itself excluded)
    len: u11,
    reserved: u1,
    ty: FrameType,
}
data::bilge_busdata!(FrameHeader, u16);

impl FrameHeader {
    const fn packed_size() -> usize {2}
}

/**
    assembles datagrams back-to-back into one transmittable frame.

    The builder is responsible for the chaining flags: every pushed datagram
    except the last one is marked as non-terminal. Exceeding the transport's
    maximum frame content is rejected before transmission.
*/
pub struct Frame {
    buffer: [u8; MAX_FRAME],
    end: usize,
    /// offset of the previously pushed datagram header, to set its chaining flag
    last: Option<usize>,
    token: u8,
}
impl Frame {
    pub fn new(token: u8) -> Self {
        Self {
            buffer: [0; MAX_FRAME],
            end: FrameHeader::packed_size(),
            last: None,
            token,
        }
    }

    /// number of content bytes used so far
    pub fn content(&self) -> usize {self.end - FrameHeader::packed_size()}
    /// true if no datagram was pushed yet
    pub fn is_empty(&self) -> bool {self.last.is_none()}

    /// true if the given datagram still fits in this frame
    pub fn fits(&self, datagram: &Datagram) -> bool {
        self.content() + datagram.wire_size() <= MAX_CONTENT
    }

    /// append a datagram to the chain, marking the previous one as non-terminal
    pub fn push(&mut self, datagram: &Datagram) -> PackingResult<()> {
        if ! self.fits(datagram)
            {return Err(PackingError::BadSize(datagram.wire_size(), "total chained length exceeds the maximum frame content"))}

        // the freshly pushed datagram is the terminal one, the previous loses that role
        if let Some(previous) = self.last {
            let place = &mut self.buffer[previous .. previous + DatagramHeader::packed_length()];
            let mut header = DatagramHeader::unpack(place)?;
            header.set_more(true);
            header.pack(place)?;
        }
        self.last = Some(self.end);

        let mut cursor = Cursor::new(&mut self.buffer[self.end ..]);
        cursor.pack(&DatagramHeader::new(
            u8::from(datagram.command),
            self.token,
            datagram.slave,
            datagram.offset,
            u11::new(datagram.payload.len() as u16),
            false,
            false,
            0,
            ))?;
        cursor.write(&datagram.payload)?;
        cursor.write(&[0; WKC_SIZE])?;
        self.end += cursor.position();
        Ok(())
    }

    /// write the frame header and return the complete wire image
    pub fn finish(&mut self) -> PackingResult<&[u8]> {
        if self.is_empty()
            {return Err(PackingError::InvalidValue("a frame must contain at least one datagram"))}
        FrameHeader::new(
            u11::new(self.content() as u16),
            FrameType::Datagrams,
            ).pack(&mut self.buffer)?;
        Ok(&self.buffer[.. self.end])
    }

    /**
        decode a response frame, distributing each chained result to the
        datagram that produced it, in the order they were pushed.

        returns an error if the frame does not carry the expected token or
        does not match the request structure.
    */
    pub fn decode(frame: &[u8], token: u8, datagrams: &mut [Datagram]) -> PackingResult<()> {
        let mut cursor = Cursor::new(frame);
        let header: FrameHeader = cursor.unpack()?;
        let content = cursor.read(usize::from(u16::from(header.len())))?;

        let mut cursor = Cursor::new(content);
        let total = datagrams.len();
        for (rank, datagram) in datagrams.iter_mut().enumerate() {
            let header: DatagramHeader = cursor.unpack()?;
            if header.token() != token
                {return Err(PackingError::InvalidValue("response frame carries a foreign token"))}
            let len = usize::from(u16::from(header.len()));
            if len != datagram.payload.len()
                {return Err(PackingError::InvalidValue("response datagram length differs from the request"))}
            datagram.payload.copy_from_slice(cursor.read(len)?);
            datagram.working_count = cursor.unpack::<u16>()?;

            let terminal = rank + 1 == total;
            if header.more() == terminal
                {return Err(PackingError::InvalidValue("chaining flags do not match the request structure"))}
        }
        Ok(())
    }
}
