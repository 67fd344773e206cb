//! Signals are shaped buffers exchanged between operators.
//!
//! A [`Signal`] is a view onto a shared buffer. The buffer carries the key, so
//! every view of the same buffer (reshaped, sliced or strided) identifies to the
//! same [`SignalKey`]. Once a buffer's contents have been transmitted to the
//! partition that last needs them, the contents are replaced by a
//! [`Placeholder`] that keeps the shape metadata but no data.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a signal's underlying buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey(u64);

impl SignalKey {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub enum Dtype {
    Float64,
    Float32,
    Int64,
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::Float64
    }
}

/// Shape metadata left behind once a buffer's data has been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub size: usize,
    pub strides: Vec<isize>,
}

#[derive(Debug)]
enum Storage {
    Live(Vec<f64>),
    Reclaimed(Placeholder),
}

#[derive(Debug)]
struct Buffer {
    key: SignalKey,
    label: String,
    dtype: Dtype,
    shape: Vec<usize>,
    storage: RwLock<Storage>,
}

/// A view onto a signal buffer.
#[derive(Clone)]
pub struct Signal {
    buffer: Arc<Buffer>,
    shape: Vec<usize>,
    strides: Vec<isize>,
    offset: usize,
}

fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![1isize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1] as isize;
    }
    strides
}

impl Signal {
    /// Creates a new buffer holding `data` laid out row-major in `shape`. An
    /// empty shape is a scalar.
    pub fn new(
        label: impl Into<String>,
        shape: &[usize],
        data: Vec<f64>,
    ) -> Result<Self> {
        let label = label.into();
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(ConfigError::ShapeMismatch {
                label,
                shape: shape.to_vec(),
                expected,
                actual: data.len(),
            }
            .into());
        }
        Ok(Self::allocate(label, shape, data))
    }

    pub fn zeros(label: impl Into<String>, shape: &[usize]) -> Self {
        let size = shape.iter().product::<usize>();
        Self::allocate(label.into(), shape, vec![0.; size])
    }

    pub fn vector(label: impl Into<String>, data: Vec<f64>) -> Self {
        let len = data.len();
        Self::allocate(label.into(), &[len], data)
    }

    pub fn scalar(label: impl Into<String>, value: f64) -> Self {
        Self::allocate(label.into(), &[], vec![value])
    }

    fn allocate(label: String, shape: &[usize], data: Vec<f64>) -> Self {
        let buffer = Buffer {
            key: SignalKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed)),
            label,
            dtype: Dtype::Float64,
            shape: shape.to_vec(),
            storage: RwLock::new(Storage::Live(data)),
        };
        Self {
            strides: contiguous_strides(shape),
            shape: shape.to_vec(),
            offset: 0,
            buffer: Arc::new(buffer),
        }
    }

    /// The key of the underlying buffer. Identical for every view of it.
    pub fn key(&self) -> SignalKey {
        self.buffer.key
    }

    pub fn label(&self) -> &str {
        &self.buffer.label
    }

    pub fn dtype(&self) -> Dtype {
        self.buffer.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn base_shape(&self) -> &[usize] {
        &self.buffer.shape
    }

    /// Returns true if this view covers its buffer exactly, in buffer layout.
    pub fn is_whole(&self) -> bool {
        self.offset == 0
            && self.shape == self.buffer.shape
            && self.strides == contiguous_strides(&self.buffer.shape)
    }

    pub fn same_buffer(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// A view with a new shape over the same elements. Only contiguous views
    /// can be reshaped.
    pub fn reshape(&self, shape: &[usize]) -> Result<Signal> {
        if self.strides != contiguous_strides(&self.shape) {
            Err(self.invalid_view("cannot reshape a strided view"))?;
        }
        if shape.iter().product::<usize>() != self.size() {
            Err(self.invalid_view(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )))?;
        }
        Ok(Signal {
            buffer: self.buffer.clone(),
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            offset: self.offset,
        })
    }

    /// A view of `start..stop` along the first axis.
    pub fn slice(&self, start: usize, stop: usize) -> Result<Signal> {
        let len = match self.shape.first() {
            Some(len) => *len,
            None => Err(self.invalid_view("cannot slice a scalar"))?,
        };
        if start > stop || stop > len {
            Err(self.invalid_view(format!(
                "slice {}..{} out of bounds for length {}",
                start, stop, len
            )))?;
        }
        let mut shape = self.shape.clone();
        shape[0] = stop - start;
        let offset = self.offset as isize + start as isize * self.strides[0];
        Ok(Signal {
            buffer: self.buffer.clone(),
            shape,
            strides: self.strides.clone(),
            offset: offset as usize,
        })
    }

    /// A view with explicit geometry, in elements of the underlying buffer.
    pub fn view(
        &self,
        shape: &[usize],
        strides: &[isize],
        offset: usize,
    ) -> Result<Signal> {
        if shape.len() != strides.len() {
            Err(self.invalid_view("shape and strides differ in rank"))?;
        }
        let base_size = self.buffer.shape.iter().product::<usize>() as isize;
        if shape.iter().any(|&d| d == 0) {
            return Ok(Signal {
                buffer: self.buffer.clone(),
                shape: shape.to_vec(),
                strides: strides.to_vec(),
                offset,
            });
        }
        let (mut lo, mut hi) = (offset as isize, offset as isize);
        for (&d, &s) in shape.iter().zip(strides) {
            let reach = (d as isize - 1) * s;
            if reach < 0 {
                lo += reach;
            } else {
                hi += reach;
            }
        }
        if lo < 0 || hi >= base_size.max(1) {
            Err(self.invalid_view("view reaches outside its buffer"))?;
        }
        Ok(Signal {
            buffer: self.buffer.clone(),
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset,
        })
    }

    pub fn is_reclaimed(&self) -> bool {
        matches!(&*self.storage(), Storage::Reclaimed(_))
    }

    /// Shape metadata of the buffer. Available whether or not the data has
    /// been reclaimed.
    pub fn placeholder(&self) -> Placeholder {
        match &*self.storage() {
            Storage::Reclaimed(placeholder) => placeholder.clone(),
            Storage::Live(data) => Placeholder {
                dtype: self.buffer.dtype,
                shape: self.buffer.shape.clone(),
                size: data.len(),
                strides: contiguous_strides(&self.buffer.shape),
            },
        }
    }

    /// A copy of the whole buffer's contents, or `None` once reclaimed.
    pub fn buffer_data(&self) -> Option<Vec<f64>> {
        match &*self.storage() {
            Storage::Live(data) => Some(data.clone()),
            Storage::Reclaimed(_) => None,
        }
    }

    /// The elements of this view, read out of `base`, a copy of the whole
    /// buffer's contents. Elements outside `base` read as zero.
    pub fn gather(&self, base: &[f64]) -> Vec<f64> {
        let size = self.size();
        let mut out = Vec::with_capacity(size);
        if size == 0 {
            return out;
        }
        let mut index = vec![0usize; self.ndim()];
        loop {
            let pos = index
                .iter()
                .zip(&self.strides)
                .fold(self.offset as isize, |acc, (&i, &s)| acc + i as isize * s);
            out.push(base.get(pos as usize).copied().unwrap_or(0.));
            let mut axis = self.ndim();
            loop {
                if axis == 0 {
                    return out;
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < self.shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }

    /// The elements of this view, or `None` once the buffer is reclaimed.
    pub fn data(&self) -> Option<Vec<f64>> {
        self.buffer_data().map(|base| self.gather(&base))
    }

    /// Releases the buffer's data, keeping only its shape metadata.
    pub(crate) fn reclaim(&self) {
        let placeholder = self.placeholder();
        let mut storage = self
            .buffer
            .storage
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *storage = Storage::Reclaimed(placeholder);
    }

    fn storage(&self) -> std::sync::RwLockReadGuard<'_, Storage> {
        self.buffer
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid_view(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidView {
            label: self.label().to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("key", &self.key())
            .field("label", &self.label())
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .finish()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label(), self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_share_identity() {
        let sig = Signal::new("x", &[2, 3], vec![0.; 6]).unwrap();
        let flat = sig.reshape(&[6]).unwrap();
        let part = flat.slice(2, 5).unwrap();
        let strided = sig.view(&[2], &[3], 1).unwrap();

        assert_eq!(sig.key(), sig.key());
        assert_eq!(sig.key(), flat.key());
        assert_eq!(sig.key(), part.key());
        assert_eq!(sig.key(), strided.key());
        assert!(sig.is_whole());
        assert!(!part.is_whole());
        assert_eq!(part.offset(), 2);
    }

    #[test]
    fn distinct_buffers_differ() {
        let a = Signal::zeros("a", &[2]);
        let b = Signal::zeros("a", &[2]);
        assert_ne!(a.key(), b.key());
        assert!(!a.same_buffer(&b));
    }

    #[test]
    fn shape_must_match_data() {
        match Signal::new("bad", &[2, 2], vec![1.; 3]) {
            Err(crate::Error::Config(ConfigError::ShapeMismatch {
                label,
                expected,
                actual,
                ..
            })) => {
                assert_eq!(label, "bad");
                assert_eq!((expected, actual), (4, 3));
            }
            other => panic!("unexpected result {:?}", other.map(|s| s.key())),
        }
        assert_eq!(Signal::scalar("s", 1.).size(), 1);
        assert_eq!(Signal::scalar("s", 1.).ndim(), 0);
    }

    #[test]
    fn rejects_out_of_bounds_views() {
        let sig = Signal::zeros("x", &[4]);
        assert!(sig.slice(3, 5).is_err());
        assert!(sig.view(&[3], &[2], 0).is_err());
        assert!(sig.view(&[2], &[2], 1).is_ok());
        assert!(sig.slice(1, 3).unwrap().view(&[1], &[1], 0).is_ok());
    }

    #[test]
    fn views_gather_their_elements() {
        let sig =
            Signal::new("x", &[2, 3], vec![0., 1., 2., 3., 4., 5.]).unwrap();
        assert_eq!(sig.view(&[2], &[3], 1).unwrap().data(), Some(vec![1., 4.]));
        assert_eq!(
            sig.reshape(&[6]).unwrap().slice(4, 6).unwrap().data(),
            Some(vec![4., 5.])
        );
        assert_eq!(sig.view(&[2], &[-1], 2).unwrap().data(), Some(vec![2., 1.]));
        assert_eq!(Signal::scalar("s", 7.).data(), Some(vec![7.]));
    }

    #[test]
    fn reclaim_keeps_metadata() {
        let sig = Signal::new("x", &[2, 2], vec![1., 2., 3., 4.]).unwrap();
        let view = sig.slice(0, 1).unwrap();
        view.reclaim();

        assert!(sig.is_reclaimed());
        assert!(sig.buffer_data().is_none());
        let placeholder = sig.placeholder();
        assert_eq!(placeholder.shape, vec![2, 2]);
        assert_eq!(placeholder.size, 4);
        assert_eq!(placeholder.strides, vec![2, 1]);
        assert_eq!(sig.shape(), &[2, 2]);
    }
}
