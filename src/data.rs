//! Traits and helpers used to read/write fieldbus data to/from the wire.

use core::{
	marker::PhantomData,
	fmt,
	};

/**
	trait for data types that can be packed/unpacked to/from a datagram payload

	All multi-byte values on the bus are little-endian, so implementations
	must pack accordingly.
*/
pub trait BusData: Sized {
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
}

/// error raised when a value does not fit its wire representation
#[derive(Copy, Clone, Debug)]
pub enum PackingError {
    BadSize(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;

/// byte array abstraction, needed because rust does not yet support generic consts in const expressions
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

impl<const N: usize> BusData for [u8; N] {
	type Packed = Self;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough room for byte array"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < N
            {return Err(PackingError::BadSize(src.len(), "not enough bytes for byte array"))}
		Ok(Self::try_from(&src[.. N]).expect("slice len checked"))
	}
}

impl BusData for () {
	type Packed = [u8; 0];

	fn pack(&self, _dst: &mut [u8]) -> PackingResult<()>  {Ok(())}
	fn unpack(_src: &[u8]) -> PackingResult<Self>  {Ok(())}
}

impl BusData for bool {
	type Packed = [u8; 1];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.is_empty()
            {return Err(PackingError::BadSize(dst.len(), "a bool needs one byte"))}
        dst[0] = u8::from(*self);
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.is_empty()
            {return Err(PackingError::BadSize(src.len(), "a bool needs one byte"))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

/// macro implementing [BusData] for a struct or enum generated with `bilge`
/// the transmutes work around the missing accessors for the containing int in `bilge`
macro_rules! bilge_busdata {
    ($t: ty, $id: ident) => { impl crate::data::BusData for $t {
        type Packed = [u8; ($id::BITS as usize + 7)/8];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            let len = <Self::Packed as crate::data::Storage>::LEN;
            if dst.len() < len
                {return Err(crate::data::PackingError::BadSize(dst.len(), "bilge struct needs exact size"))}
            dst[.. len].copy_from_slice(&unsafe{ core::mem::transmute_copy::<Self, Self::Packed>(self) });
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            let len = <Self::Packed as crate::data::Storage>::LEN;
            if src.len() < len
                {return Err(crate::data::PackingError::BadSize(src.len(), "bilge struct needs exact size"))}
            let mut tmp = [0; core::mem::size_of::<Self>()];
            tmp[.. len].copy_from_slice(&src[.. len]);
            Ok(unsafe{ core::mem::transmute::<[u8; core::mem::size_of::<Self>()], Self>(tmp) })
        }
    }};
}
pub(crate) use bilge_busdata;

/// macro implementing [BusData] for integer and float types
macro_rules! num_busdata {
	($t: ty) => { impl crate::data::BusData for $t {
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                if dst.len() < Self::Packed::LEN
                    {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough room for integer"))}
				dst[.. Self::Packed::LEN].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
				Ok(Self::from_le_bytes(src
                    .get(.. Self::Packed::LEN)
                    .ok_or(crate::data::PackingError::BadSize(src.len(), "not enough bytes for integer"))?
					.try_into().expect("slice len checked")
					))
			}
		}};
}

num_busdata!(u8);
num_busdata!(u16);
num_busdata!(u32);
num_busdata!(u64);
num_busdata!(i8);
num_busdata!(i16);
num_busdata!(i32);
num_busdata!(i64);
num_busdata!(f32);
num_busdata!(f64);



/**
	locate some data in a slave's memory by its byte offset and length

	It acts like a typed getter/setter over a byte sequence: it does not hold
	the data, only where it lives and how long it is, so register definitions
	can be plain consts.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: BusData> {
    /// marks that T is actually used
	extracted: PhantomData<T>,
	/// start byte offset of the object
	pub byte: usize,
	/// byte length of the object
	pub len: usize,
}
impl<T: BusData> Field<T>
{
	/// build a field from its byte offset and byte length
	pub const fn new(byte: usize, len: usize) -> Self {
		Self{extracted: PhantomData, byte, len}
	}
	/// build a field from its byte offset, inferring its length from the data nominal size
	pub const fn simple(byte: usize) -> Self {
        Self{extracted: PhantomData, byte, len: T::Packed::LEN}
	}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T> {
		T::unpack(data.get(self.byte ..)
            .ok_or(PackingError::BadSize(data.len(), "field outside of data"))?
            .get(.. self.len)
            .ok_or(PackingError::BadSize(data.len(), "field outside of data"))?)
	}
	/// dump the given value to the place pointed by the field in the byte array
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        value.pack(data.get_mut(self.byte ..)
            .ok_or(PackingError::BadSize(0, "field outside of data"))?
            .get_mut(.. self.len)
            .ok_or(PackingError::BadSize(0, "field outside of data"))?)
	}
}
impl<T: BusData> fmt::Debug for Field<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Field{{0x{:x}, {}}}", self.byte, self.len)
	}
}
// [Clone] and [Copy] are implemented manually so a field stays copiable even when T is not
impl<T: BusData> Clone for Field<T> {
    fn clone(&self) -> Self   {*self}
}
impl<T: BusData> Copy for Field<T> {}
impl<T: BusData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}



/**
	helper to read/write sequential data from/to a byte slice

    Close to [std::io::Cursor], but returns slices without copying and works
    with [BusData]. Depending on the mutability of the underlying slice,
    different capabilities are provided.
*/
pub struct Cursor<T> {
    position: usize,
    data: T,
}
impl<T> Cursor<T> {
    /// create a new cursor starting at position zero in the given slice
    pub fn new(data: T) -> Self   {Self{position: 0, data}}
    /// current position in the read/write slice
    pub fn position(&self) -> usize   {self.position}
}
impl<'a> Cursor<&'a [u8]> {
    /// read the next coming bytes as a [BusData] value, and increment the position
    pub fn unpack<T: BusData>(&mut self) -> PackingResult<T> {
        let value = T::unpack(self.data.get(self.position ..).unwrap_or(&[]))?;
        self.position += T::Packed::LEN;
        Ok(value)
    }
    /// read the next coming `size` bytes and increment the position
    pub fn read(&mut self, size: usize) -> PackingResult<&'a [u8]> {
        let end = self.position + size;
        let chunk = self.data.get(self.position .. end)
            .ok_or(PackingError::BadSize(size, "not enough bytes remaining"))?;
        self.position = end;
        Ok(chunk)
    }
    /// return all the remaining bytes after current position, without advancing
    pub fn remain(&self) -> &'a [u8] {
        &self.data[self.position ..]
    }
    /// consume self and return the slice until current position
    pub fn finish(self) -> &'a [u8] {
        &self.data[.. self.position]
    }
}
impl<'a> Cursor<&'a mut [u8]> {
    /// write the next coming bytes with a [BusData] value, and increment the position
    pub fn pack<T: BusData>(&mut self, value: &T) -> PackingResult<()> {
        let end = self.position + T::Packed::LEN;
        value.pack(self.data.get_mut(self.position .. end)
            .ok_or(PackingError::BadSize(T::Packed::LEN, "not enough room remaining"))?)?;
        self.position = end;
        Ok(())
    }
    /// write the next coming bytes with the given slice, and increment the position
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        let end = self.position + value.len();
        self.data.get_mut(self.position .. end)
            .ok_or(PackingError::BadSize(value.len(), "not enough room remaining"))?
            .copy_from_slice(value);
        self.position = end;
        Ok(())
    }
    /// return all the remaining bytes after current position, without advancing
    pub fn remain(&mut self) -> &'_ mut [u8] {
        &mut self.data[self.position ..]
    }
    /// consume self and return the slice until current position
    pub fn finish(self) -> &'a mut [u8] {
        &mut self.data[.. self.position]
    }
}



#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numeric_round_trip() {
        let mut buffer = [0; 8];
        0x1122_3344u32.pack(&mut buffer).unwrap();
        assert_eq!(&buffer[.. 4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(u32::unpack(&buffer).unwrap(), 0x1122_3344);
    }

    #[test]
    fn field_get_set() {
        let field = Field::<u16>::simple(2);
        let mut data = [0; 6];
        field.set(&mut data, 0xabcd).unwrap();
        assert_eq!(data, [0, 0, 0xcd, 0xab, 0, 0]);
        assert_eq!(field.get(&data).unwrap(), 0xabcd);
    }

    #[test]
    fn cursor_bounds() {
        let data = [1u8, 2, 3];
        let mut cursor = Cursor::new(data.as_slice());
        assert_eq!(cursor.read(2).unwrap(), &[1, 2]);
        assert!(cursor.read(2).is_err());
    }
}
