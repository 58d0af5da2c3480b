/*!
    the object-dictionary protocol tunneled in the mailbox (CANopen
    application layer).

    This module only knows how to encode requests and decode responses; the
    transaction engine (ordering, the one-per-slave token, timeouts and
    retries) lives in [crate::master].

    An object-dictionary entry is addressed by a 16-bit index and an 8-bit
    sub-index. Values up to [EXPEDITED_MAX_SIZE] bytes travel inside the
    request itself (expedited transfer); longer values are segmented into
    consecutive mailbox exchanges, each a complete round trip, and
    concatenated in order at the initiator.
*/

use bilge::prelude::*;
use crate::data::{self, Cursor, PackingError, PackingResult};


/// maximum byte size of a value that can be expedited inside the request
pub const EXPEDITED_MAX_SIZE: usize = 4;

/// fixed overhead of an SDO request inside the mailbox content
pub const SDO_OVERHEAD: usize = CoeHeader::packed_length() + SdoHeader::packed_length();

/// header prefixing every mailbox content of type [crate::mailbox::MailboxType::Can]
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct CoeHeader {
    /// PDO number, unused for dictionary access
    pub number: u9,
    reserved: u3,
    pub service: CoeService,
}
data::bilge_busdata!(CoeHeader, u16);

impl CoeHeader {
    pub const fn packed_length() -> usize {2}
}

/// type of service carried behind a [CoeHeader]
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CoeService {
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}

/// header of an SDO upload/download request or response
#[bitsize(32)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct SdoHeader {
    /// true if the `size` field is meaningful
    pub sized: bool,
    /// true for an expedited transfer, the data then travels in the request
    pub expedited: bool,
    /// `4 - data length` for expedited transfers
    pub size: u2,
    /// complete-access flag, unused by this engine
    pub complete: bool,
    /// value of [SdoCommandRequest] or [SdoCommandResponse]
    pub command: u3,
    /// object-dictionary index
    pub index: u16,
    /// object-dictionary sub-index
    pub sub: u8,
}
data::bilge_busdata!(SdoHeader, u32);

impl SdoHeader {
    pub const fn packed_length() -> usize {4}
}

/// header of an SDO segment exchange, following the first round trip of a long transfer
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoSegmentHeader {
    /// true if more segments follow this one
    pub more: bool,
    /// `7 - data length` for the last segment
    pub size: u3,
    /// alternates between consecutive segments of one transfer
    pub toggle: bool,
    pub command: u3,
}
data::bilge_busdata!(SdoSegmentHeader, u8);

/// request operations on a dictionary entry
#[bitsize(3)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommandRequest {
    DownloadSegment = 0x0,
    Download = 0x1,
    Upload = 0x2,
    UploadSegment = 0x3,
    Abort = 0x4,
}

/// response operations on a dictionary entry
#[bitsize(3)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommandResponse {
    UploadSegment = 0x0,
    DownloadSegment = 0x1,
    Upload = 0x2,
    Download = 0x3,
    Abort = 0x4,
}

/// reason a slave aborted an object-dictionary transaction
#[bitsize(32)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoAbortCode {
    /// toggle bit not alternated
    BadToggle = 0x05_03_00_00,
    /// protocol timeout on the slave side
    Timeout = 0x05_04_00_00,
    /// command specifier not valid or unknown
    UnsupportedCommand = 0x05_04_00_01,
    /// out of memory
    OutOfMemory = 0x05_04_00_05,
    /// unsupported access to the object
    UnsupportedAccess = 0x06_01_00_00,
    /// attempt to read a write-only object
    WriteOnly = 0x06_01_00_01,
    /// attempt to write a read-only object
    ReadOnly = 0x06_01_00_02,
    /// object length exceeds the mailbox size
    ObjectTooBig = 0x06_01_00_05,
    /// the object does not exist in the dictionary
    InvalidIndex = 0x06_02_00_00,
    /// hardware error on the slave
    HardwareError = 0x06_06_00_00,
    /// length of the service parameter does not match the entry
    InvalidLength = 0x06_07_00_10,
    /// the sub-index does not exist
    InvalidSubIndex = 0x06_09_00_11,
    /// written value out of the entry's range
    ValueOutOfRange = 0x06_09_00_30,
    /// general error
    GeneralError = 0x08_00_00_00,
    /// data cannot be transferred or stored to the application
    Refused = 0x08_00_00_20,
    /// transfer refused because of the present device state
    StateRefused = 0x08_00_00_22,
}
data::bilge_busdata!(SdoAbortCode, u32);

/// a decoded SDO response, extracted from a received mailbox content
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SdoResponse {
    /// upload answer carrying the whole value
    UploadExpedited {index: u16, sub: u8, data: Vec<u8>},
    /// upload answer carrying the total size and the first chunk of a long value
    UploadSized {index: u16, sub: u8, total: usize, data: Vec<u8>},
    /// segment answer of a long upload
    UploadSegment {more: bool, toggle: bool, data: Vec<u8>},
    /// acknowledge of a download request
    DownloadAck {index: u16, sub: u8},
    /// acknowledge of a download segment
    DownloadSegmentAck {toggle: bool},
    /// the slave aborted the transaction
    Abort {index: u16, sub: u8, code: SdoAbortCode},
}

/// encode an upload (read) request for the given dictionary entry
pub fn upload_request(index: u16, sub: u8) -> PackingResult<Vec<u8>> {
    let mut content = vec![0; SDO_OVERHEAD + EXPEDITED_MAX_SIZE];
    let mut cursor = Cursor::new(content.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoRequest))?;
    cursor.pack(&SdoHeader::new(
        false,
        false,
        u2::new(0),
        false,
        u3::from(SdoCommandRequest::Upload),
        index,
        sub,
        ))?;
    Ok(content)
}

/// encode an upload segment request continuing a long transfer
pub fn upload_segment_request(toggle: bool) -> PackingResult<Vec<u8>> {
    let mut content = vec![0; CoeHeader::packed_length() + 8];
    let mut cursor = Cursor::new(content.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoRequest))?;
    cursor.pack(&SdoSegmentHeader::new(
        false,
        u3::new(0),
        toggle,
        u3::from(SdoCommandRequest::UploadSegment),
        ))?;
    Ok(content)
}

/**
    encode a download (write) request for the given dictionary entry.

    Values up to [EXPEDITED_MAX_SIZE] bytes are expedited; longer values send
    their total size and first chunk here, the rest follows in segments. The
    chunk capacity depends on the slave's mailbox size, given by `capacity`
    (the usable mailbox content size). Returns the encoded request and the
    number of value bytes it consumed.
*/
pub fn download_request(index: u16, sub: u8, value: &[u8], capacity: usize) -> PackingResult<(Vec<u8>, usize)> {
    if value.len() <= EXPEDITED_MAX_SIZE {
        let mut content = vec![0; SDO_OVERHEAD + EXPEDITED_MAX_SIZE];
        let mut cursor = Cursor::new(content.as_mut_slice());
        cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoRequest))?;
        cursor.pack(&SdoHeader::new(
            true,
            true,
            u2::new((EXPEDITED_MAX_SIZE - value.len()) as u8),
            false,
            u3::from(SdoCommandRequest::Download),
            index,
            sub,
            ))?;
        cursor.write(value)?;
        Ok((content, value.len()))
    }
    else {
        let room = capacity.checked_sub(SDO_OVERHEAD + 4)
            .ok_or(PackingError::BadSize(capacity, "mailbox too small for a sized download"))?;
        let chunk = value.len().min(room);
        let mut content = vec![0; SDO_OVERHEAD + 4 + chunk];
        let mut cursor = Cursor::new(content.as_mut_slice());
        cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoRequest))?;
        cursor.pack(&SdoHeader::new(
            true,
            false,
            u2::new(0),
            false,
            u3::from(SdoCommandRequest::Download),
            index,
            sub,
            ))?;
        cursor.pack(&(value.len() as u32))?;
        cursor.write(&value[.. chunk])?;
        Ok((content, chunk))
    }
}

/// encode a download segment continuing a long transfer
pub fn download_segment_request(toggle: bool, more: bool, chunk: &[u8]) -> PackingResult<Vec<u8>> {
    let pad = 7usize.saturating_sub(chunk.len());
    let mut content = vec![0; CoeHeader::packed_length() + 1 + chunk.len().max(7)];
    let mut cursor = Cursor::new(content.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoRequest))?;
    cursor.pack(&SdoSegmentHeader::new(
        more,
        u3::new(pad.min(7) as u8),
        toggle,
        u3::from(SdoCommandRequest::DownloadSegment),
        ))?;
    cursor.write(chunk)?;
    Ok(content)
}

/// encode the abort terminating an in-flight transaction and freeing the mailbox slot
pub fn abort_request(index: u16, sub: u8, code: SdoAbortCode) -> PackingResult<Vec<u8>> {
    let mut content = vec![0; SDO_OVERHEAD + 4];
    let mut cursor = Cursor::new(content.as_mut_slice());
    cursor.pack(&CoeHeader::new(u9::new(0), CoeService::SdoRequest))?;
    cursor.pack(&SdoHeader::new(
        true,
        true,
        u2::new(0),
        false,
        u3::from(SdoCommandRequest::Abort),
        index,
        sub,
        ))?;
    cursor.pack(&u32::from(code))?;
    Ok(content)
}

/// decode a received mailbox content of type [crate::mailbox::MailboxType::Can]
pub fn parse_response(content: &[u8]) -> PackingResult<SdoResponse> {
    let mut cursor = Cursor::new(content);
    let coe: CoeHeader = cursor.unpack()?;
    match coe.service() {
        CoeService::SdoResponse => {
            // segment responses use the short header, detect them by the command bits
            let command = u3::new((cursor.remain().first()
                    .ok_or(PackingError::BadSize(0, "empty sdo response"))?
                    >> 5) & 0b111);
            if let Ok(segment) = SdoCommandResponse::try_from(command) {
                match segment {
                    SdoCommandResponse::UploadSegment => {
                        let header: SdoSegmentHeader = cursor.unpack()?;
                        let data = cursor.remain();
                        let len = data.len().saturating_sub(usize::from(u8::from(header.size())));
                        return Ok(SdoResponse::UploadSegment {
                            more: header.more(),
                            toggle: header.toggle(),
                            data: data[.. len].to_vec(),
                            });
                    }
                    SdoCommandResponse::DownloadSegment => {
                        let header: SdoSegmentHeader = cursor.unpack()?;
                        return Ok(SdoResponse::DownloadSegmentAck {toggle: header.toggle()});
                    }
                    _ => {}
                }
            }
            let header: SdoHeader = cursor.unpack()?;
            match SdoCommandResponse::try_from(header.command())
                .map_err(|_| PackingError::InvalidValue("undefined sdo response command"))?
            {
                SdoCommandResponse::Upload => {
                    if header.expedited() {
                        let len = EXPEDITED_MAX_SIZE - usize::from(u8::from(header.size()));
                        Ok(SdoResponse::UploadExpedited {
                            index: header.index(),
                            sub: header.sub(),
                            data: cursor.read(len)?.to_vec(),
                            })
                    }
                    else {
                        let total = cursor.unpack::<u32>()? as usize;
                        let first = cursor.remain();
                        Ok(SdoResponse::UploadSized {
                            index: header.index(),
                            sub: header.sub(),
                            total,
                            data: first[.. first.len().min(total)].to_vec(),
                            })
                    }
                }
                SdoCommandResponse::Download => Ok(SdoResponse::DownloadAck {
                    index: header.index(),
                    sub: header.sub(),
                    }),
                SdoCommandResponse::Abort => Ok(SdoResponse::Abort {
                    index: header.index(),
                    sub: header.sub(),
                    code: cursor.unpack()?,
                    }),
                _ => Err(PackingError::InvalidValue("unexpected sdo response command")),
            }
        }
        CoeService::SdoRequest => {
            // a slave signalling an abort uses the request service
            let header: SdoHeader = cursor.unpack()?;
            if SdoCommandRequest::try_from(header.command()) == Ok(SdoCommandRequest::Abort) {
                Ok(SdoResponse::Abort {
                    index: header.index(),
                    sub: header.sub(),
                    code: cursor.unpack()?,
                    })
            }
            else {
                Err(PackingError::InvalidValue("slave sent an sdo request to the master"))
            }
        }
        _ => Err(PackingError::InvalidValue("unexpected service during an sdo transaction")),
    }
}
