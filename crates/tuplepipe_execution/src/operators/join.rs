use std::fmt::Debug;

use dyn_clone::DynClone;
use tuplepipe_error::{operator_err, plan_err, Result};

use crate::tuple::Tuple;

/// Layout of an equi-join: where the key lives on each side and how large
/// every stream's tuples are.
///
/// Keys compare by raw bytes. A zero length key joins everything against a
/// single pseudo-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinKeys {
    pub left_size: usize,
    pub left_key_offset: usize,
    pub right_size: usize,
    pub right_key_offset: usize,
    pub key_len: usize,
    pub output_size: usize,
}

impl JoinKeys {
    pub fn new(
        left_size: usize,
        left_key_offset: usize,
        right_size: usize,
        right_key_offset: usize,
        key_len: usize,
        output_size: usize,
    ) -> Result<Self> {
        let fits = |offset: usize, size: usize| {
            matches!(offset.checked_add(key_len), Some(end) if end <= size)
        };
        if !fits(left_key_offset, left_size) {
            return Err(plan_err!(
                "left join key {left_key_offset}+{key_len} exceeds left tuple size {left_size}"
            ));
        }
        if !fits(right_key_offset, right_size) {
            return Err(plan_err!(
                "right join key {right_key_offset}+{key_len} exceeds right tuple size {right_size}"
            ));
        }
        if output_size == 0 {
            return Err(plan_err!("join output size must be non-zero"));
        }

        Ok(JoinKeys {
            left_size,
            left_key_offset,
            right_size,
            right_key_offset,
            key_len,
            output_size,
        })
    }

    /// Cross join layout, every left tuple matches every right tuple.
    pub fn cross(left_size: usize, right_size: usize, output_size: usize) -> Result<Self> {
        Self::new(left_size, 0, right_size, 0, 0, output_size)
    }

    pub fn left_key<'a>(&self, tuple: &'a Tuple) -> Result<&'a [u8]> {
        tuple.bytes(self.left_key_offset, self.key_len)
    }

    pub fn right_key<'a>(&self, tuple: &'a Tuple) -> Result<&'a [u8]> {
        tuple.bytes(self.right_key_offset, self.key_len)
    }
}

/// Binary equi-join contract.
pub trait Join: Debug + Sync + Send + DynClone {
    fn keys(&self) -> &JoinKeys;

    /// Write the output for a matching `left`/`right` pair into `dest`.
    fn combine(&mut self, dest: &mut Tuple, left: &Tuple, right: &Tuple) -> Result<()>;

    /// Write the output for a `left` tuple without any match.
    fn left_outer(&mut self, _dest: &mut Tuple, _left: &Tuple) -> Result<()> {
        Err(operator_err!("join does not support left outer joins"))
    }
}

impl Clone for Box<dyn Join> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

/// Outputs `left ‖ right`. Unmatched left tuples get a zeroed right half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatJoin {
    keys: JoinKeys,
}

impl ConcatJoin {
    pub fn new(
        left_size: usize,
        left_key_offset: usize,
        right_size: usize,
        right_key_offset: usize,
        key_len: usize,
    ) -> Result<Self> {
        let keys = JoinKeys::new(
            left_size,
            left_key_offset,
            right_size,
            right_key_offset,
            key_len,
            left_size + right_size,
        )?;
        Ok(ConcatJoin { keys })
    }
}

impl Join for ConcatJoin {
    fn keys(&self) -> &JoinKeys {
        &self.keys
    }

    fn combine(&mut self, dest: &mut Tuple, left: &Tuple, right: &Tuple) -> Result<()> {
        dest.write_bytes(0, left.as_bytes())?;
        dest.write_bytes(self.keys.left_size, right.as_bytes())
    }

    fn left_outer(&mut self, dest: &mut Tuple, left: &Tuple) -> Result<()> {
        dest.clear();
        dest.write_bytes(0, left.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_validated() {
        assert!(JoinKeys::new(8, 4, 8, 0, 4, 16).is_ok());
        assert!(JoinKeys::new(8, 6, 8, 0, 4, 16).is_err());
        assert!(JoinKeys::new(8, 0, 4, 2, 4, 16).is_err());
        assert!(JoinKeys::new(8, 0, 8, 0, 4, 0).is_err());
        assert_eq!(0, JoinKeys::cross(4, 4, 8).unwrap().key_len);
    }

    #[test]
    fn concat_join_combines() {
        let mut join = ConcatJoin::new(2, 0, 3, 0, 1).unwrap();
        assert_eq!(5, join.keys().output_size);

        let left = Tuple::from_bytes(vec![1, 2]);
        let right = Tuple::from_bytes(vec![1, 8, 9]);
        let mut dest = Tuple::zeroed(5);
        join.combine(&mut dest, &left, &right).unwrap();
        assert_eq!(&[1u8, 2, 1, 8, 9], dest.as_bytes());

        join.left_outer(&mut dest, &left).unwrap();
        assert_eq!(&[1u8, 2, 0, 0, 0], dest.as_bytes());
    }
}
