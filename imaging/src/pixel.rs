//! Image frames and the generic sample-type visitor
//!
//! A frame stores one typed sample vector (8 numeric kinds). Every pixel
//! operation is written once as a [`PixelVisitor`] / [`PixelVisitorMut`] that is
//! generic over [`Pixel`], and [`PixelBuffer::accept`] instantiates it for the
//! stored type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sample data type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleType {
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    F32,
    F64,
}

impl SampleType {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::I16 | SampleType::U16 => 2,
            SampleType::I32 | SampleType::U32 | SampleType::F32 => 4,
            SampleType::I64 | SampleType::F64 => 8,
        }
    }
}

/// A numeric sample type
pub trait Pixel: Copy + PartialOrd + Send + Sync + 'static {
    const SAMPLE_TYPE: SampleType;

    fn to_f64(self) -> f64;

    /// Saturating conversion; integer kinds round to nearest
    fn from_f64(value: f64) -> Self;

    /// `max(self - other, 0)` without leaving the type's range
    fn clamped_sub(self, other: Self) -> Self;

    /// Borrow the samples if `buffer` holds this type
    fn slice_of(buffer: &PixelBuffer) -> Option<&[Self]>;

    fn into_buffer(data: Vec<Self>) -> PixelBuffer;
}

macro_rules! impl_integer_pixel {
    ($t:ty, $variant:ident) => {
        impl Pixel for $t {
            const SAMPLE_TYPE: SampleType = SampleType::$variant;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                if value.is_nan() {
                    0
                } else {
                    value.round().clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t
                }
            }

            fn clamped_sub(self, other: Self) -> Self {
                self.saturating_sub(other).max(0)
            }

            fn slice_of(buffer: &PixelBuffer) -> Option<&[Self]> {
                match buffer {
                    PixelBuffer::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn into_buffer(data: Vec<Self>) -> PixelBuffer {
                PixelBuffer::$variant(data)
            }
        }
    };
}

macro_rules! impl_float_pixel {
    ($t:ty, $variant:ident) => {
        impl Pixel for $t {
            const SAMPLE_TYPE: SampleType = SampleType::$variant;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $t
            }

            fn clamped_sub(self, other: Self) -> Self {
                (self - other).max(0.0)
            }

            fn slice_of(buffer: &PixelBuffer) -> Option<&[Self]> {
                match buffer {
                    PixelBuffer::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn into_buffer(data: Vec<Self>) -> PixelBuffer {
                PixelBuffer::$variant(data)
            }
        }
    };
}

impl_integer_pixel!(u8, U8);
impl_integer_pixel!(i16, I16);
impl_integer_pixel!(u16, U16);
impl_integer_pixel!(i32, I32);
impl_integer_pixel!(u32, U32);
impl_integer_pixel!(i64, I64);
impl_float_pixel!(f32, F32);
impl_float_pixel!(f64, F64);

/// Read-only operation over samples of any type
pub trait PixelVisitor {
    type Output;

    fn visit<T: Pixel>(self, data: &[T]) -> Self::Output;
}

/// In-place operation over samples of any type
pub trait PixelVisitorMut {
    type Output;

    fn visit_mut<T: Pixel>(self, data: &mut [T]) -> Self::Output;
}

/// Typed sample storage
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! dispatch {
    ($buffer:expr, $data:ident => $body:expr) => {
        match $buffer {
            PixelBuffer::U8($data) => $body,
            PixelBuffer::I16($data) => $body,
            PixelBuffer::U16($data) => $body,
            PixelBuffer::I32($data) => $body,
            PixelBuffer::U32($data) => $body,
            PixelBuffer::I64($data) => $body,
            PixelBuffer::F32($data) => $body,
            PixelBuffer::F64($data) => $body,
        }
    };
}

impl PixelBuffer {
    pub fn accept<V: PixelVisitor>(&self, visitor: V) -> V::Output {
        dispatch!(self, data => visitor.visit(data.as_slice()))
    }

    pub fn accept_mut<V: PixelVisitorMut>(&mut self, visitor: V) -> V::Output {
        dispatch!(self, data => visitor.visit_mut(data.as_mut_slice()))
    }

    pub fn len(&self) -> usize {
        dispatch!(self, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_type(&self) -> SampleType {
        match self {
            PixelBuffer::U8(_) => SampleType::U8,
            PixelBuffer::I16(_) => SampleType::I16,
            PixelBuffer::U16(_) => SampleType::U16,
            PixelBuffer::I32(_) => SampleType::I32,
            PixelBuffer::U32(_) => SampleType::U32,
            PixelBuffer::I64(_) => SampleType::I64,
            PixelBuffer::F32(_) => SampleType::F32,
            PixelBuffer::F64(_) => SampleType::F64,
        }
    }

    pub fn value_at(&self, index: usize) -> Option<f64> {
        dispatch!(self, data => data.get(index).map(|v| v.to_f64()))
    }

    /// All samples widened to f64
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.accept(ToF64)
    }
}

struct ToF64;

impl PixelVisitor for ToF64 {
    type Output = Vec<f64>;

    fn visit<T: Pixel>(self, data: &[T]) -> Vec<f64> {
        data.iter().map(|v| v.to_f64()).collect()
    }
}

/// Precomputed frame statistics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

struct ComputeStatistics;

impl PixelVisitor for ComputeStatistics {
    type Output = FrameStatistics;

    fn visit<T: Pixel>(self, data: &[T]) -> FrameStatistics {
        if data.is_empty() {
            return FrameStatistics::default();
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for v in data {
            let v = v.to_f64();
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let n = data.len() as f64;
        let mean = sum / n;
        let variance = data.iter().map(|v| (v.to_f64() - mean).powi(2)).sum::<f64>() / n;

        let mut values: Vec<f64> = data.iter().map(|v| v.to_f64()).collect();
        let mid = values.len() / 2;
        let (_, median, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));

        FrameStatistics {
            mean,
            stddev: variance.sqrt(),
            min,
            max,
            median: *median,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame is empty ({width}x{height})")]
    Empty {
        width: usize,
        height: usize,
    },

    #[error("Buffer holds {len} samples but frame is {width}x{height}")]
    DimensionMismatch {
        width: usize,
        height: usize,
        len: usize,
    },
}

/// Decoded single-channel image with its statistics
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    width: usize,
    height: usize,
    buffer: PixelBuffer,
    stats: FrameStatistics,
}

impl ImageFrame {
    pub fn new<T: Pixel>(width: usize, height: usize, data: Vec<T>) -> Result<Self, FrameError> {
        Self::from_buffer(width, height, T::into_buffer(data))
    }

    /// Wrap a buffer and compute its statistics
    pub fn from_buffer(width: usize, height: usize, buffer: PixelBuffer) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        if buffer.len() != width * height {
            return Err(FrameError::DimensionMismatch {
                width,
                height,
                len: buffer.len(),
            });
        }
        let stats = buffer.accept(ComputeStatistics);
        Ok(Self {
            width,
            height,
            buffer,
            stats,
        })
    }

    /// Replace the statistics with values supplied by the image loader
    pub fn with_statistics(mut self, stats: FrameStatistics) -> Self {
        self.stats = stats;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn sample_type(&self) -> SampleType {
        self.buffer.sample_type()
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    /// Writable samples; call [`recompute_statistics`](Self::recompute_statistics)
    /// after modifying them.
    pub fn buffer_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buffer
    }

    pub fn statistics(&self) -> &FrameStatistics {
        &self.stats
    }

    pub fn recompute_statistics(&mut self) {
        self.stats = self.buffer.accept(ComputeStatistics);
    }

    pub fn value(&self, x: usize, y: usize) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.buffer.value_at(y * self.width + x)
    }

    /// Row-major f64 copy of the samples
    pub fn to_f64(&self) -> Vec<f64> {
        self.buffer.to_f64_vec()
    }
}
