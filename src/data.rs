//! Typed values exchanged over the bus, and helpers to move them in and out of the process image.

use core::fmt;

/**
    trait for data types that can live in a bus variable

    A `BusData` value is packed/unpacked as little-endian bytes, the way it appears in the
    process image. `BITS` is the size on the bus, which for booleans is a single bit even
    though the packed in-memory representation uses a whole byte.
*/
pub trait BusData: Sized {
    const ID: TypeId;
    /// size on the bus, in bits
    const BITS: usize;
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize {Self::Packed::LEN}
}

/// error raised when packing/unpacking a value to/from raw bytes
#[derive(Copy, Clone, Debug)]
pub enum PackingError {
    BadSize(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;

/// byte array abstraction, equivalent to `packed_struct::ByteArray` but usable with generic consts
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn uninit() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn uninit() -> Self {[0; N]}
}

/**
    dtype identifiers allowing to dynamically check the type of a [BusData] implementor
    against the electronic type codes found in the bus description
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeId {
    /// untyped fixed-length blob
    ARRAY,
    BOOL,
    I8, I16, I32, I64,
    U8, U16, U32, U64,
    F32, F64,
}

/// electronic data type code as carried by the bus description
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TypeCode(pub u16);

/// standard type codes, ETG.1000.6
pub mod code {
    use super::TypeCode;

    pub const NULL: TypeCode = TypeCode(0x0000);
    pub const BOOLEAN: TypeCode = TypeCode(0x0001);
    pub const INTEGER8: TypeCode = TypeCode(0x0002);
    pub const INTEGER16: TypeCode = TypeCode(0x0003);
    pub const INTEGER32: TypeCode = TypeCode(0x0004);
    pub const UNSIGNED8: TypeCode = TypeCode(0x0005);
    pub const UNSIGNED16: TypeCode = TypeCode(0x0006);
    pub const UNSIGNED32: TypeCode = TypeCode(0x0007);
    pub const REAL32: TypeCode = TypeCode(0x0008);
    pub const REAL64: TypeCode = TypeCode(0x0011);
    pub const INTEGER64: TypeCode = TypeCode(0x0015);
    pub const UNSIGNED64: TypeCode = TypeCode(0x001b);
}

impl TypeId {
    /**
        true if this variable type matches the given electronic type code

        an [TypeId::ARRAY] variable matches only the null type code, every other variable type
        matches exactly one code. A mismatch here means the binary layout described by the
        device configuration disagrees with the application's variable declarations.
    */
    pub fn matches(self, ty: TypeCode) -> bool {
        match self {
            Self::ARRAY => ty == code::NULL,
            Self::BOOL => ty == code::BOOLEAN,
            Self::I8 => ty == code::INTEGER8,
            Self::I16 => ty == code::INTEGER16,
            Self::I32 => ty == code::INTEGER32,
            Self::I64 => ty == code::INTEGER64,
            Self::U8 => ty == code::UNSIGNED8,
            Self::U16 => ty == code::UNSIGNED16,
            Self::U32 => ty == code::UNSIGNED32,
            Self::U64 => ty == code::UNSIGNED64,
            Self::F32 => ty == code::REAL32,
            Self::F64 => ty == code::REAL64,
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl<const N: usize> BusData for [u8; N] {
    const ID: TypeId = TypeId::ARRAY;
    const BITS: usize = N * 8;
    type Packed = Self;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for desired slice"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.len() < N
            {return Err(PackingError::BadSize(src.len(), "not enough bytes for desired slice"))}
        Ok(Self::try_from(&src[.. N]).map_err(|_| PackingError::BadSize(src.len(), "bad slice length"))?)
    }
}

impl BusData for bool {
    const ID: TypeId = TypeId::BOOL;
    const BITS: usize = 1;
    type Packed = [u8; 1];

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.is_empty()
            {return Err(PackingError::BadSize(0, "empty destination for bool"))}
        dst[0] = u8::from(*self);
        Ok(())
    }
    fn unpack(src: &[u8]) -> PackingResult<Self> {
        if src.is_empty()
            {return Err(PackingError::BadSize(0, "empty source for bool"))}
        Ok(src[0] & 0b1 == 0b1)
    }
}

/// macro implementing [BusData] for numeric types
macro_rules! num_busdata {
    ($t: ty, $id: ident) => { impl crate::data::BusData for $t {
        const ID: crate::data::TypeId = crate::data::TypeId::$id;
        const BITS: usize = core::mem::size_of::<$t>() * 8;
        type Packed = [u8; core::mem::size_of::<$t>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            if dst.len() < core::mem::size_of::<$t>()
                {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for number"))}
            dst[.. core::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            Ok(Self::from_le_bytes(src
                .get(.. core::mem::size_of::<$t>())
                .ok_or(crate::data::PackingError::BadSize(src.len(), "not enough bytes for number"))?
                .try_into()
                .map_err(|_| crate::data::PackingError::BadSize(src.len(), "not enough bytes for number"))?
                ))
        }
    }};
}

num_busdata!(u8, U8);
num_busdata!(u16, U16);
num_busdata!(u32, U32);
num_busdata!(u64, U64);
num_busdata!(i8, I8);
num_busdata!(i16, I16);
num_busdata!(i32, I32);
num_busdata!(i64, I64);
num_busdata!(f32, F32);
num_busdata!(f64, F64);

/// extract one bit from a byte sequence
pub fn get_bit(src: &[u8], bit: usize) -> bool {
    src[bit / 8] & (1 << (bit % 8)) != 0
}

/// set one bit in a byte sequence
pub fn set_bit(dst: &mut [u8], bit: usize, value: bool) {
    if value {dst[bit / 8] |= 1 << (bit % 8)}
    else {dst[bit / 8] &= ! (1 << (bit % 8))}
}

/**
    copy an arbitrary bit field between byte sequences

    byte-aligned copies take a `copy_from_slice` fast path since almost all process images are
    byte aligned, the general case moves single bits
*/
pub fn copy_bits(dst: &mut [u8], dst_bit: usize, src: &[u8], src_bit: usize, len: usize) {
    if dst_bit % 8 == 0 && src_bit % 8 == 0 && len % 8 == 0 {
        dst[dst_bit/8 ..][.. len/8].copy_from_slice(&src[src_bit/8 ..][.. len/8]);
    }
    else {
        for i in 0 .. len {
            set_bit(dst, dst_bit + i, get_bit(src, src_bit + i));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_match_exactly() {
        let table = [
            (TypeId::BOOL, code::BOOLEAN),
            (TypeId::I8, code::INTEGER8),
            (TypeId::I16, code::INTEGER16),
            (TypeId::I32, code::INTEGER32),
            (TypeId::I64, code::INTEGER64),
            (TypeId::U8, code::UNSIGNED8),
            (TypeId::U16, code::UNSIGNED16),
            (TypeId::U32, code::UNSIGNED32),
            (TypeId::U64, code::UNSIGNED64),
            (TypeId::F32, code::REAL32),
            (TypeId::F64, code::REAL64),
            (TypeId::ARRAY, code::NULL),
        ];
        for (id, good) in table {
            assert!(id.matches(good), "{:?} must match {}", id, good);
            for (_, other) in table.iter().filter(|(i, _)| *i != id) {
                assert!(! id.matches(*other), "{:?} must not match {}", id, other);
            }
        }
        // unknown code matches nothing
        assert!(! TypeId::U16.matches(TypeCode(0x7fff)));
    }

    #[test]
    fn bit_copy_aligned() {
        let src = [0x12, 0x34, 0x56, 0x78];
        let mut dst = [0u8; 4];
        copy_bits(&mut dst, 8, &src, 16, 16);
        assert_eq!(dst, [0, 0x56, 0x78, 0]);
    }

    #[test]
    fn bit_copy_unaligned() {
        let mut src = [0u8; 2];
        for (i, v) in [false, true, true, false].iter().enumerate() {
            set_bit(&mut src, 3 + i, *v);
        }
        let mut dst = [0u8; 1];
        copy_bits(&mut dst, 2, &src, 3, 4);
        assert!(! get_bit(&dst, 2));
        assert!(get_bit(&dst, 3));
        assert!(get_bit(&dst, 4));
        assert!(! get_bit(&dst, 5));
    }

    #[test]
    fn numeric_roundtrip() {
        let mut buffer = [0u8; 8];
        0x1234u16.pack(&mut buffer).unwrap();
        assert_eq!(u16::unpack(&buffer).unwrap(), 0x1234);
        assert_eq!(buffer[0], 0x34);

        (-1.5f64).pack(&mut buffer).unwrap();
        assert_eq!(f64::unpack(&buffer).unwrap(), -1.5);
    }
}
