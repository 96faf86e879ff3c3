//! Dense n-dimensional arrays carried inside samples
//!
//! Row-major storage with either `f32` or `i64` elements. Images load as
//! `F32`, integer label maps as `I64`.

use crate::error::{MedflowError, Result};

/// Element storage for an [`NdArray`]
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl ArrayData {
    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            ArrayData::F32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type name, used in error messages
    pub fn dtype(&self) -> &'static str {
        match self {
            ArrayData::F32(_) => "f32",
            ArrayData::I64(_) => "i64",
        }
    }
}

/// Row-major n-dimensional array
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Create an array, checking that the shape covers the data exactly
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(MedflowError::InvalidShape {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::new(shape, ArrayData::F32(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        Self::new(shape, ArrayData::I64(data))
    }

    /// All-zero `f32` array
    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: ArrayData::F32(vec![0.0; n]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> &'static str {
        self.data.dtype()
    }

    /// Borrow as `f32` slice if that is the element type
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            ArrayData::F32(v) => Some(v),
            ArrayData::I64(_) => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            ArrayData::F32(v) => Some(v),
            ArrayData::I64(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            ArrayData::I64(v) => Some(v),
            ArrayData::F32(_) => None,
        }
    }

    /// Copy of the array with `f32` elements
    pub fn to_f32(&self) -> NdArray {
        let data = match &self.data {
            ArrayData::F32(v) => v.clone(),
            ArrayData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        };
        NdArray {
            shape: self.shape.clone(),
            data: ArrayData::F32(data),
        }
    }

    /// Minimum and maximum over all elements, `None` when empty
    pub fn min_max(&self) -> Option<(f64, f64)> {
        let mut iter: Box<dyn Iterator<Item = f64>> = match &self.data {
            ArrayData::F32(v) => Box::new(v.iter().map(|&x| x as f64)),
            ArrayData::I64(v) => Box::new(v.iter().map(|&x| x as f64)),
        };
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), x| (lo.min(x), hi.max(x))))
    }

    /// Mean and population standard deviation, `None` when empty
    pub fn mean_std(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            return None;
        }
        let values: Vec<f64> = match &self.data {
            ArrayData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            ArrayData::I64(v) => v.iter().map(|&x| x as f64).collect(),
        };
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        Some((mean, var.sqrt()))
    }

    /// Reverse element order along `axis`
    pub fn flip(&self, axis: usize) -> Result<NdArray> {
        if axis >= self.ndim() {
            return Err(MedflowError::InvalidConfig {
                reason: format!("flip axis {} out of range for {}-d array", axis, self.ndim()),
            });
        }
        // Elements are grouped as [outer, axis, inner]
        let outer: usize = self.shape[..axis].iter().product();
        let dim = self.shape[axis];
        let inner: usize = self.shape[axis + 1..].iter().product();

        fn flip_vec<T: Copy>(src: &[T], outer: usize, dim: usize, inner: usize) -> Vec<T> {
            let mut out = Vec::with_capacity(src.len());
            for o in 0..outer {
                for d in (0..dim).rev() {
                    let start = (o * dim + d) * inner;
                    out.extend_from_slice(&src[start..start + inner]);
                }
            }
            out
        }

        let data = match &self.data {
            ArrayData::F32(v) => ArrayData::F32(flip_vec(v, outer, dim, inner)),
            ArrayData::I64(v) => ArrayData::I64(flip_vec(v, outer, dim, inner)),
        };
        Ok(NdArray {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Stack arrays of identical shape and dtype along a new leading axis.
    ///
    /// `key` only labels errors. The first array fixes the expected shape.
    pub fn stack(key: &str, arrays: &[&NdArray]) -> Result<NdArray> {
        let first = arrays.first().ok_or_else(|| MedflowError::InvalidConfig {
            reason: format!("cannot stack zero arrays for '{}'", key),
        })?;

        for (idx, arr) in arrays.iter().enumerate() {
            if arr.shape != first.shape {
                return Err(MedflowError::ShapeMismatch {
                    key: key.to_string(),
                    expected: first.shape.clone(),
                    found: arr.shape.clone(),
                    sample_index: idx,
                });
            }
            if arr.dtype() != first.dtype() {
                return Err(MedflowError::TypeMismatch {
                    key: key.to_string(),
                    expected: format!("{} array", first.dtype()),
                    found: format!("{} array at batch position {}", arr.dtype(), idx),
                });
            }
        }

        let mut shape = Vec::with_capacity(first.ndim() + 1);
        shape.push(arrays.len());
        shape.extend_from_slice(&first.shape);

        let data = match &first.data {
            ArrayData::F32(_) => ArrayData::F32(
                arrays
                    .iter()
                    .flat_map(|a| a.as_f32().unwrap_or(&[]).iter().copied())
                    .collect(),
            ),
            ArrayData::I64(_) => ArrayData::I64(
                arrays
                    .iter()
                    .flat_map(|a| a.as_i64().unwrap_or(&[]).iter().copied())
                    .collect(),
            ),
        };
        NdArray::new(shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_checked() {
        assert!(NdArray::from_f32(vec![2, 2], vec![1.0; 3]).is_err());
        let arr = NdArray::from_f32(vec![2, 2], vec![1.0; 4]).unwrap();
        assert_eq!(arr.ndim(), 2);
    }

    #[test]
    fn test_flip_inner_axis() {
        let arr = NdArray::from_i64(vec![2, 3], vec![1, 2, 3, 4, 5, 6]).unwrap();
        let flipped = arr.flip(1).unwrap();
        assert_eq!(flipped.as_i64().unwrap(), &[3, 2, 1, 6, 5, 4]);

        let flipped0 = arr.flip(0).unwrap();
        assert_eq!(flipped0.as_i64().unwrap(), &[4, 5, 6, 1, 2, 3]);
        assert_eq!(flipped0.flip(0).unwrap(), arr);
    }

    #[test]
    fn test_stack_adds_leading_dim() {
        let a = NdArray::from_f32(vec![2], vec![1.0, 2.0]).unwrap();
        let b = NdArray::from_f32(vec![2], vec![3.0, 4.0]).unwrap();
        let stacked = NdArray::stack("x", &[&a, &b]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(stacked.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_stack_rejects_dtype_mix() {
        let a = NdArray::from_f32(vec![1], vec![1.0]).unwrap();
        let b = NdArray::from_i64(vec![1], vec![1]).unwrap();
        let err = NdArray::stack("x", &[&a, &b]).unwrap_err();
        assert!(matches!(err, MedflowError::TypeMismatch { .. }));
    }

    #[test]
    fn test_min_max_and_stats() {
        let arr = NdArray::from_f32(vec![4], vec![1.0, 3.0, -2.0, 2.0]).unwrap();
        assert_eq!(arr.min_max(), Some((-2.0, 3.0)));
        let (mean, _) = arr.mean_std().unwrap();
        assert!((mean - 1.0).abs() < 1e-9);
        assert_eq!(NdArray::zeros(vec![0]).min_max(), None);
    }
}
