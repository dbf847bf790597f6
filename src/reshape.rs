//! Reshaping of flat value sequences into nested, dimensioned arrays.
//!
//! DFTB+ writes every array in its tagged results stream as one flat run of
//! tokens followed by the declared dimensions. This module rebuilds the nested
//! structure from that flat run.
//!
//! # Ordering
//!
//! The last dimension is the innermost (fastest-varying) one. For dimensions
//! `[2, 3]` the six values `a b c d e f` become `[[a, b, c], [d, e, f]]`.
//! [`NdArray::flatten`] walks the result in the same order, so
//! `flatten(reshape(v, d)) == v` for every valid input.
//!
//! # Examples
//!
//! ```
//! use dftbstep::reshape::{reshape, NdArray};
//!
//! let nested = reshape(vec![1, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
//! assert_eq!(nested.shape(), vec![2, 3]);
//! assert_eq!(nested.flatten(), vec![&1, &2, &3, &4, &5, &6]);
//! ```

use serde::Serialize;
use thiserror::Error;

/// Errors raised while reshaping a flat sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// The number of values does not match the product of the dimensions
    #[error(
        "Number of values given, {received}, is not equal to the dimensions: {dims:?} --> {expected} values"
    )]
    ShapeMismatch {
        /// Number of values actually supplied
        received: usize,
        /// Number of values implied by `dims`
        expected: usize,
        /// The requested shape
        dims: Vec<usize>,
    },
    /// A dimension of size zero was requested
    #[error("Dimensions must be positive: {dims:?}")]
    ZeroDimension {
        /// The requested shape
        dims: Vec<usize>,
    },
    /// The product of the dimensions does not fit in `usize`
    #[error("Dimensions are too large: {dims:?}")]
    TooLarge {
        /// The requested shape
        dims: Vec<usize>,
    },
}

type Result<T> = std::result::Result<T, ShapeError>;

/// A nested array of arbitrary depth.
///
/// Serializes transparently, so a 2×3 real array becomes
/// `[[1.0,2.0,3.0],[4.0,5.0,6.0]]` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NdArray<T> {
    /// A single element
    Scalar(T),
    /// One level of nesting
    Array(Vec<NdArray<T>>),
}

impl<T> NdArray<T> {
    /// Returns the element count along each level, outermost first.
    ///
    /// Only the first element of each level is inspected; arrays built by
    /// [`reshape`] are always rectangular.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::new();
        let mut current = self;
        while let NdArray::Array(items) = current {
            shape.push(items.len());
            match items.first() {
                Some(first) => current = first,
                None => break,
            }
        }
        shape
    }

    /// Collects references to every element, last index fastest.
    pub fn flatten(&self) -> Vec<&T> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                NdArray::Scalar(value) => out.push(value),
                NdArray::Array(items) => stack.extend(items.iter().rev()),
            }
        }
        out
    }

    /// Consumes the array and returns its elements, last index fastest.
    pub fn into_flat(self) -> Vec<T> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                NdArray::Scalar(value) => out.push(value),
                NdArray::Array(items) => stack.extend(items.into_iter().rev()),
            }
        }
        out
    }

    /// Applies `f` to every element, keeping the shape.
    pub fn map<U, F>(&self, f: F) -> NdArray<U>
    where
        F: Fn(&T) -> U + Copy,
    {
        match self {
            NdArray::Scalar(value) => NdArray::Scalar(f(value)),
            NdArray::Array(items) => NdArray::Array(items.iter().map(|item| item.map(f)).collect()),
        }
    }

    /// Returns the scalar if this is a zero-dimensional array.
    pub fn as_scalar(&self) -> Option<&T> {
        match self {
            NdArray::Scalar(value) => Some(value),
            NdArray::Array(_) => None,
        }
    }

    /// Returns the `index`-th sub-array or element of the outermost level.
    pub fn get(&self, index: usize) -> Option<&NdArray<T>> {
        match self {
            NdArray::Scalar(_) => None,
            NdArray::Array(items) => items.get(index),
        }
    }
}

/// Total number of elements for a shape, or `None` on overflow. An empty
/// shape holds one scalar.
pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

/// Rebuilds a nested array from a flat sequence and a target shape.
///
/// Dimensions are consumed from the last (innermost) to the first
/// (outermost): the sequence is cut into runs of `dims[i]` elements and each
/// run becomes one element of the next level up.
///
/// # Errors
///
/// - [`ShapeError::ShapeMismatch`] if `flat.len()` differs from the product
///   of `dims` (for an empty `dims`, exactly one value is required).
/// - [`ShapeError::ZeroDimension`] if any dimension is zero.
pub fn reshape<T>(flat: Vec<T>, dims: &[usize]) -> Result<NdArray<T>> {
    if dims.contains(&0) {
        return Err(ShapeError::ZeroDimension {
            dims: dims.to_vec(),
        });
    }

    let expected = element_count(dims).ok_or_else(|| ShapeError::TooLarge {
        dims: dims.to_vec(),
    })?;
    if flat.len() != expected {
        return Err(ShapeError::ShapeMismatch {
            received: flat.len(),
            expected,
            dims: dims.to_vec(),
        });
    }

    let mut level: Vec<NdArray<T>> = flat.into_iter().map(NdArray::Scalar).collect();
    for &dim in dims.iter().rev() {
        let mut next = Vec::with_capacity(level.len() / dim);
        let mut items = level.into_iter();
        loop {
            let chunk: Vec<NdArray<T>> = items.by_ref().take(dim).collect();
            if chunk.is_empty() {
                break;
            }
            next.push(NdArray::Array(chunk));
        }
        level = next;
    }

    // The count check above leaves exactly one node at the top level.
    match level.pop() {
        Some(root) if level.is_empty() => Ok(root),
        _ => Err(ShapeError::ShapeMismatch {
            received: 0,
            expected,
            dims: dims.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalars(values: &[i32]) -> NdArray<i32> {
        NdArray::Array(values.iter().copied().map(NdArray::Scalar).collect())
    }

    #[test]
    fn test_two_by_three_last_index_fastest() {
        let nested = reshape(vec![1, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
        assert_eq!(
            nested,
            NdArray::Array(vec![scalars(&[1, 2, 3]), scalars(&[4, 5, 6])])
        );
        assert_eq!(nested.shape(), vec![2, 3]);
    }

    #[test]
    fn test_empty_dims_returns_scalar() {
        let nested = reshape(vec![42.0], &[]).unwrap();
        assert_eq!(nested, NdArray::Scalar(42.0));
        assert!(nested.shape().is_empty());
    }

    #[test]
    fn test_empty_dims_requires_single_value() {
        let err = reshape(vec![1.0, 2.0], &[]).unwrap_err();
        assert_eq!(
            err,
            ShapeError::ShapeMismatch {
                received: 2,
                expected: 1,
                dims: vec![]
            }
        );
    }

    #[test]
    fn test_mismatch_reports_both_counts() {
        let err = reshape(vec![1, 2, 3], &[2, 2]).unwrap_err();
        match err {
            ShapeError::ShapeMismatch {
                received, expected, ..
            } => {
                assert_eq!(received, 3);
                assert_eq!(expected, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            reshape(Vec::<i32>::new(), &[3, 0]),
            Err(ShapeError::ZeroDimension { .. })
        ));
    }

    #[test]
    fn test_overflowing_dimensions_rejected() {
        let dims = [usize::MAX, 2];
        assert_eq!(element_count(&dims), None);
        assert_eq!(
            reshape(vec![1.0], &dims),
            Err(ShapeError::TooLarge { dims: dims.to_vec() })
        );
    }

    #[test]
    fn test_flatten_restores_order_for_several_shapes() {
        for dims in [vec![5], vec![1, 4], vec![2, 3, 4], vec![3, 1, 2, 2]] {
            let n = element_count(&dims).unwrap();
            let flat: Vec<usize> = (0..n).collect();
            let nested = reshape(flat.clone(), &dims).unwrap();
            assert_eq!(nested.shape(), dims);
            assert_eq!(nested.into_flat(), flat);
        }
    }

    #[test]
    fn test_map_keeps_shape() {
        let nested = reshape(vec![1.0, -2.0, 3.0, -4.0], &[2, 2]).unwrap();
        let negated = nested.map(|v| -v);
        assert_eq!(negated.shape(), vec![2, 2]);
        assert_eq!(negated.into_flat(), vec![-1.0, 2.0, -3.0, 4.0]);
    }
}
