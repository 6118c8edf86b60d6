//! Detector frame views.
//!
//! A [`Frame`] borrows pixel memory owned by the caller: no stage in the data
//! path allocates or frees frame storage, all of them mutate the borrowed bytes
//! in place. Pixels are 16-bit little endian, rows may be padded (`stride` is in
//! bytes and must be at least `width * 2`).
//!
//! [`FrameBuffer`] is a convenience owner for callers that need somewhere to
//! keep pixels (tests, the pipeline worker, the synthetic detector).

use chrono::{DateTime, Utc};

/// The only pixel depth accepted by the data path.
pub const PIXEL_DEPTH_BITS: u32 = 16;

/// Bytes per pixel at [`PIXEL_DEPTH_BITS`].
pub const BYTES_PER_PIXEL: usize = 2;

/// Largest value a pixel can hold.
pub const PIXEL_MAX: f32 = u16::MAX as f32;

/// A mutable view over one captured detector image.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bits per pixel, must equal [`PIXEL_DEPTH_BITS`]
    pub bit_depth: u32,
    /// Row pitch in bytes
    pub stride: usize,
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Monotonic frame id assigned at capture
    pub frame_id: u64,
    data: &'a mut [u8],
}

/// Reasons a frame cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameValidationError {
    /// Empty pixel buffer
    #[error("frame has no pixel data")]
    NoData,
    /// Width or height is zero
    #[error("frame dimensions must be non-zero (got {width}x{height})")]
    ZeroDimension {
        /// Declared width
        width: u32,
        /// Declared height
        height: u32,
    },
    /// Bit depth other than 16
    #[error("unsupported pixel depth {0} bits, expected 16")]
    PixelDepth(u32),
    /// Row pitch shorter than one row of pixels
    #[error("stride {stride} is smaller than the row size {row_bytes}")]
    Stride {
        /// Declared stride
        stride: usize,
        /// Bytes in one row of pixels
        row_bytes: usize,
    },
    /// `stride * (height - 1) + row_bytes` does not fit in memory
    #[error("stride {stride} over {height} rows overflows the address space")]
    GeometryOverflow {
        /// Declared stride
        stride: usize,
        /// Declared height
        height: u32,
    },
    /// Buffer shorter than `stride * (height - 1) + row_bytes`
    #[error("pixel buffer holds {actual} bytes, frame needs {required}")]
    BufferTooSmall {
        /// Bytes the geometry requires
        required: usize,
        /// Bytes supplied
        actual: usize,
    },
}

impl<'a> Frame<'a> {
    /// Create a tightly packed 16-bit frame over `data`.
    pub fn new(width: u32, height: u32, data: &'a mut [u8]) -> Self {
        Self {
            width,
            height,
            bit_depth: PIXEL_DEPTH_BITS,
            stride: width as usize * BYTES_PER_PIXEL,
            timestamp: Utc::now(),
            frame_id: 0,
            data,
        }
    }

    /// Set the row pitch in bytes.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Set the capture metadata.
    pub fn with_capture(mut self, frame_id: u64, timestamp: DateTime<Utc>) -> Self {
        self.frame_id = frame_id;
        self.timestamp = timestamp;
        self
    }

    /// Number of bytes of pixel data in one row (excluding padding).
    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Check the frame against the data-path contract.
    pub fn validate(&self) -> Result<(), FrameValidationError> {
        if self.data.is_empty() {
            return Err(FrameValidationError::NoData);
        }
        if self.width == 0 || self.height == 0 {
            return Err(FrameValidationError::ZeroDimension {
                width: self.width,
                height: self.height,
            });
        }
        if self.bit_depth != PIXEL_DEPTH_BITS {
            return Err(FrameValidationError::PixelDepth(self.bit_depth));
        }
        let row_bytes = self.row_bytes();
        if self.stride < row_bytes {
            return Err(FrameValidationError::Stride {
                stride: self.stride,
                row_bytes,
            });
        }
        let required = self
            .stride
            .checked_mul(self.height as usize - 1)
            .and_then(|bytes| bytes.checked_add(row_bytes))
            .ok_or(FrameValidationError::GeometryOverflow {
                stride: self.stride,
                height: self.height,
            })?;
        if self.data.len() < required {
            return Err(FrameValidationError::BufferTooSmall {
                required,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Raw bytes backing the frame, including row padding.
    pub fn as_bytes(&self) -> &[u8] {
        self.data
    }

    /// Pixel bytes of row `y` (padding excluded).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.row_bytes()]
    }

    /// Mutable pixel bytes of row `y` (padding excluded).
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let len = self.row_bytes();
        &mut self.data[start..start + len]
    }

    /// Read the pixel at (x, y).
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        let offset = y as usize * self.stride + x as usize * BYTES_PER_PIXEL;
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write the pixel at (x, y).
    pub fn set_pixel(&mut self, x: u32, y: u32, value: u16) {
        let offset = y as usize * self.stride + x as usize * BYTES_PER_PIXEL;
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Apply `f(index, value) -> value` to every pixel in raster order.
    ///
    /// `index` is the dense `y * width + x` position, which lines up with
    /// calibration maps of the same dimensions.
    pub fn map_pixels<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, u16) -> u16,
    {
        let width = self.width as usize;
        for y in 0..self.height {
            let base = y as usize * width;
            for (x, px) in self.row_mut(y).chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                let value = u16::from_le_bytes([px[0], px[1]]);
                px.copy_from_slice(&f(base + x, value).to_le_bytes());
            }
        }
    }

    /// Copy the pixels into a dense `f32` working image.
    pub fn to_f32(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.pixel_count());
        for y in 0..self.height {
            out.extend(
                self.row(y)
                    .chunks_exact(BYTES_PER_PIXEL)
                    .map(|px| f32::from(u16::from_le_bytes([px[0], px[1]]))),
            );
        }
        out
    }

    /// Store a dense `f32` working image back into the frame, rounding and
    /// clamping to the 16-bit range.
    pub fn store_f32(&mut self, image: &[f32]) {
        self.map_pixels(|idx, _| quantize(image[idx]));
    }

    /// Copy the pixel rows (padding excluded) into a packed byte vector.
    pub fn packed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixel_count() * BYTES_PER_PIXEL);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

/// Round and clamp a working value to a 16-bit pixel.
pub fn quantize(value: f32) -> u16 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, PIXEL_MAX) as u16
}

/// Owned, tightly packed pixel storage for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Monotonic frame id
    pub frame_id: u64,
    /// Packed little-endian 16-bit pixels
    pub data: Vec<u8>,
}

impl FrameBuffer {
    /// Allocate a zeroed frame.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_id: 0,
            data: vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// Build a frame from 16-bit pixel values.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * BYTES_PER_PIXEL);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self {
            width,
            height,
            frame_id: 0,
            data,
        }
    }

    /// Horizontal gradient from `low` to `high`, the standard synthetic test image.
    pub fn gradient(width: u32, height: u32, low: u16, high: u16) -> Self {
        let span = f32::from(high) - f32::from(low);
        let denom = (width.max(2) - 1) as f32;
        let pixels: Vec<u16> = (0..height)
            .flat_map(|_| (0..width).map(move |x| quantize(f32::from(low) + span * x as f32 / denom)))
            .collect();
        Self::from_u16(width, height, &pixels)
    }

    /// Size of the packed pixel data in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Borrow the storage as a processable frame.
    pub fn as_frame(&mut self) -> Frame<'_> {
        let frame_id = self.frame_id;
        Frame::new(self.width, self.height, &mut self.data).with_capture(frame_id, Utc::now())
    }

    /// Decode the pixels to 16-bit values.
    pub fn to_u16(&self) -> Vec<u16> {
        self.data
            .chunks_exact(BYTES_PER_PIXEL)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect()
    }
}
