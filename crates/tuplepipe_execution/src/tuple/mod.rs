pub mod schema;

use std::fmt;

use tuplepipe_error::{PipeError, Result};

/// A fixed-size binary record flowing between stages.
///
/// A tuple carries no identity beyond its bytes. All typed access goes
/// through bounds-checked accessors; numeric fields are little-endian.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    data: Box<[u8]>,
}

macro_rules! numeric_accessors {
    ($(($read:ident, $write:ident, $ty:ty)),* $(,)?) => {
        $(
            #[doc = concat!("Read a `", stringify!($ty), "` at `offset`.")]
            pub fn $read(&self, offset: usize) -> Result<$ty> {
                let bytes = self.bytes(offset, std::mem::size_of::<$ty>())?;
                let mut buf = [0; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(buf))
            }

            #[doc = concat!("Write a `", stringify!($ty), "` at `offset`.")]
            pub fn $write(&mut self, offset: usize, value: $ty) -> Result<()> {
                self.bytes_mut(offset, std::mem::size_of::<$ty>())?
                    .copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
        )*
    };
}

impl Tuple {
    /// Allocate a zeroed tuple of `size` bytes, used as a destination slot
    /// for projections and joins.
    pub fn zeroed(size: usize) -> Self {
        Tuple {
            data: vec![0; size].into_boxed_slice(),
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Tuple {
            data: bytes.into().into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.data
    }

    /// Get `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let size = self.data.len();
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(PipeError::TupleAccess { offset, len, size })
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let size = self.data.len();
        offset
            .checked_add(len)
            .and_then(|end| self.data.get_mut(offset..end))
            .ok_or(PipeError::TupleAccess { offset, len, size })
    }

    /// Copy `bytes` into this tuple starting at `offset`.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.bytes_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Deep copy `src` into this tuple. Both tuples must be the same size.
    pub fn assign(&mut self, src: &Tuple) -> Result<()> {
        if self.size() != src.size() {
            return Err(PipeError::TupleAccess {
                offset: 0,
                len: src.size(),
                size: self.size(),
            });
        }
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    /// Zero out every byte, used when a destination slot gets reused.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    numeric_accessors!(
        (read_i32, write_i32, i32),
        (read_i64, write_i64, i64),
        (read_u32, write_u32, u32),
        (read_f64, write_f64, f64),
    );
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tuple[{}](", self.data.len())?;
        for (idx, b) in self.data.iter().enumerate() {
            if idx > 0 && idx % 4 == 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u8>> for Tuple {
    fn from(value: Vec<u8>) -> Self {
        Tuple::from_bytes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_read_write() {
        let mut t = Tuple::zeroed(20);
        t.write_i32(0, -7).unwrap();
        t.write_i64(4, 1 << 40).unwrap();
        t.write_f64(12, 2.5).unwrap();

        assert_eq!(-7, t.read_i32(0).unwrap());
        assert_eq!(1 << 40, t.read_i64(4).unwrap());
        assert_eq!(2.5, t.read_f64(12).unwrap());
    }

    #[test]
    fn out_of_bounds_access() {
        let mut t = Tuple::zeroed(6);
        let err = t.read_i32(4).unwrap_err();
        assert!(matches!(
            err,
            PipeError::TupleAccess {
                offset: 4,
                len: 4,
                size: 6
            }
        ));
        assert!(t.write_i64(0, 1).is_err());
        assert!(t.bytes(usize::MAX, 2).is_err());
    }

    #[test]
    fn assign_requires_equal_sizes() {
        let src = Tuple::from_bytes(vec![1, 2, 3]);
        let mut dest = Tuple::zeroed(3);
        dest.assign(&src).unwrap();
        assert_eq!(src, dest);

        let mut small = Tuple::zeroed(2);
        assert!(small.assign(&src).is_err());
    }
}
