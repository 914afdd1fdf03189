// SPDX-License-Identifier: MIT
//! # Interleaved pixel buffers
//!
//! Two buffer types and their borrowed views. Both are row-major and
//! channel-interleaved; planar layouts defeat lane-wise processing.
//!
//! [`FloatImage`] owns its backing store and recycles it when a
//! reallocation asks for the same size, which matters because the engine
//! re-fills the same working tile for every block of a pass. [`IntImage`]
//! is deliberately thin: enough to hold host data and blit regions to and
//! from the float side, where all the heavy lifting happens.
//!
//! Sub-region access is borrow-based: [`MaskView`] and [`FloatView`] alias
//! a rectangle of their parent at zero cost and can never outlive it.

use crate::PixError;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn alloc_f32(len: usize) -> Result<Vec<f32>, PixError> {
    let mut v: Vec<f32> = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| PixError::Alloc { bytes: len * core::mem::size_of::<f32>() })?;
    v.resize(len, 0.0);
    Ok(v)
}

fn alloc_u8(len: usize) -> Result<Vec<u8>, PixError> {
    let mut v: Vec<u8> = Vec::new();
    v.try_reserve_exact(len).map_err(|_| PixError::Alloc { bytes: len })?;
    v.resize(len, 0);
    Ok(v)
}

/// One channel plane element of an [`IntImage`].
trait Channel: bytemuck::Pod {
    const MAX: i64;
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Channel for u8 {
    const MAX: i64 = 0xFF;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        (v.round() as i64).clamp(0, <Self as Channel>::MAX) as u8
    }
}

impl Channel for u16 {
    const MAX: i64 = 0xFFFF;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        (v.round() as i64).clamp(0, <Self as Channel>::MAX) as u16
    }
}

/// Row-major, channel-interleaved `f32` image.
///
/// The stride is measured in `f32` elements and defaults to the next
/// multiple of four large enough for `width * channels`, so a four-channel
/// image can be processed as `[f32; 4]` lanes ([`Self::simd_compatible`]).
/// Row padding holds valid (zeroed) floats but its contents are otherwise
/// undefined; whole-surface operations such as [`Self::fill`] write it.
#[derive(Debug, Default, Clone)]
pub struct FloatImage {
    data: Vec<f32>,
    width: usize,
    height: usize,
    dim: usize,
    stride: usize,
}

impl FloatImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or re-shape) the image. The backing store is reused when
    /// the new geometry needs exactly the size already held.
    pub fn alloc(&mut self, width: usize, height: usize, dim: usize) -> Result<(), PixError> {
        self.alloc_with_stride(width, height, dim, align4(width * dim))
    }

    pub fn alloc_with_stride(
        &mut self,
        width: usize,
        height: usize,
        dim: usize,
        stride: usize,
    ) -> Result<(), PixError> {
        debug_assert!(stride >= width * dim);
        let len = height * stride;
        if len != self.data.len() {
            self.data = alloc_f32(len)?;
        }
        self.width = width;
        self.height = height;
        self.dim = dim;
        self.stride = stride;
        Ok(())
    }

    /// Wrap a caller-owned buffer. The length must match the geometry
    /// exactly; no sentinel extents.
    pub fn from_vec(
        data: Vec<f32>,
        width: usize,
        height: usize,
        dim: usize,
        stride: usize,
    ) -> Result<Self, PixError> {
        let expected = height * stride;
        if data.len() != expected || stride < width * dim {
            return Err(PixError::BadGeometry { expected, got: data.len() });
        }
        Ok(Self { data, width, height, dim, stride })
    }

    pub fn free(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.dim == 0
    }

    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn dim(&self) -> usize {
        self.dim
    }
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Lane processing applies when pixels are whole `[f32; 4]` lanes and
    /// rows stay lane-aligned.
    pub fn simd_compatible(&self) -> bool {
        self.dim == 4 && self.stride % 4 == 0
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, v: usize) -> usize {
        x * self.dim + y * self.stride + v
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize, v: usize) -> f32 {
        self.data[self.index(x, y, v)]
    }

    #[inline]
    pub fn at_mut(&mut self, x: usize, y: usize, v: usize) -> &mut f32 {
        let i = self.index(x, y, v);
        &mut self.data[i]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Used extent of row `y`, padding excluded.
    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        let start = y * self.stride;
        &self.data[start..start + self.width * self.dim]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        let start = y * self.stride;
        let end = start + self.width * self.dim;
        &mut self.data[start..end]
    }

    /// Row `y` as pixel lanes. Callers check [`Self::simd_compatible`].
    #[inline]
    pub fn row_lanes_mut(&mut self, y: usize) -> &mut [[f32; 4]] {
        debug_assert!(self.simd_compatible());
        bytemuck::cast_slice_mut(self.row_mut(y))
    }

    pub fn swap(&mut self, other: &mut FloatImage) {
        core::mem::swap(self, other);
    }

    /// Fill the whole surface, row padding included.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Multiply every element by `factor`, padding included.
    pub fn scale(&mut self, factor: f32) {
        if self.simd_compatible() {
            for lane in bytemuck::cast_slice_mut::<f32, [f32; 4]>(&mut self.data) {
                for v in lane {
                    *v *= factor;
                }
            }
        } else {
            for v in &mut self.data {
                *v *= factor;
            }
        }
    }

    /// Minimum and maximum over the used extent.
    pub fn max_min(&self) -> (f32, f32) {
        if self.is_empty() {
            return (0.0, 0.0);
        }
        let mut min = self.data[0];
        let mut max = min;
        for y in 0..self.height {
            for &v in self.row(y) {
                if v > max {
                    max = v;
                }
                if v < min {
                    min = v;
                }
            }
        }
        (min, max)
    }

    /// Linearly remap the current value range onto `[a, b]`. A constant
    /// image becomes all zero; an image already spanning `[a, b]` is left
    /// untouched.
    pub fn normalize(&mut self, a: f32, b: f32) {
        if self.is_empty() {
            return;
        }
        let (min, max) = self.max_min();
        if min == max {
            self.fill(0.0);
            return;
        }
        if min == a && max == b {
            return;
        }
        let scale = (b - a) / (max - min);
        for y in 0..self.height {
            let start = y * self.stride;
            for v in &mut self.data[start..start + self.width * self.dim] {
                *v = (*v - min) * scale + a;
            }
        }
    }

    /// Blit `sprite` at `(x0, y0)`. Negative offsets clip the sprite
    /// instead of the destination; overhang past the far edges is clipped
    /// too. Channel counts must match.
    pub fn draw_image(&mut self, sprite: &FloatImage, x0: i32, y0: i32) -> Result<(), PixError> {
        if self.is_empty() || sprite.is_empty() {
            return Ok(());
        }
        if self.dim != sprite.dim {
            return Err(PixError::ChannelMismatch { dst: self.dim, src: sprite.dim });
        }

        let mut src_x = 0usize;
        let mut src_y = 0usize;
        let mut w = sprite.width;
        let mut h = sprite.height;
        let mut dst_x = x0;
        let mut dst_y = y0;
        if dst_y < 0 {
            let clip = (-dst_y) as usize;
            src_y += clip;
            h = h.saturating_sub(clip);
            dst_y = 0;
        }
        if dst_x < 0 {
            let clip = (-dst_x) as usize;
            src_x += clip;
            w = w.saturating_sub(clip);
            dst_x = 0;
        }
        let (dst_x, dst_y) = (dst_x as usize, dst_y as usize);
        if dst_x >= self.width || dst_y >= self.height {
            return Ok(());
        }
        let w = w.min(self.width - dst_x);
        let h = h.min(self.height - dst_y);

        for y in 0..h {
            let src_start = sprite.index(src_x, src_y + y, 0);
            let dst_start = self.index(dst_x, dst_y + y, 0);
            let n = w * self.dim;
            self.data[dst_start..dst_start + n]
                .copy_from_slice(&sprite.data[src_start..src_start + n]);
        }
        Ok(())
    }

    /// Bilinear sample with edge-clamped coordinates.
    pub fn linear_pix2d(&self, fx: f32, fy: f32, v: usize) -> f32 {
        let nfx = crate::clampf(fx, 0.0, (self.width - 1) as f32);
        let nfy = crate::clampf(fy, 0.0, (self.height - 1) as f32);
        let x = nfx as usize;
        let y = nfy as usize;
        let dx = nfx - x as f32;
        let dy = nfy - y as f32;
        let nx = if dx > 0.0 { x + 1 } else { x };
        let ny = if dy > 0.0 { y + 1 } else { y };
        let icc = self.at(x, y, v);
        let inc = self.at(nx, y, v);
        let icn = self.at(x, ny, v);
        let inn = self.at(nx, ny, v);
        icc + dx * (inc - icc + dy * (icc + inn - icn - inc)) + dy * (icn - icc)
    }

    /// Convert a rectangle of an integer image into this one. Channels
    /// past `min(self.dim, src.channels)` are dropped on the source side
    /// and left untouched on the destination side.
    pub fn copy_from_int(
        &mut self,
        src: &IntImage,
        src_x: usize,
        src_y: usize,
        dst_x: usize,
        dst_y: usize,
        width: usize,
        height: usize,
    ) {
        match src.bytes_per_channel {
            1 => self.copy_from_plane::<u8>(src, src_x, src_y, dst_x, dst_y, width, height),
            2 => self.copy_from_plane::<u16>(src, src_x, src_y, dst_x, dst_y, width, height),
            _ => unreachable!("IntImage construction validates bytes per channel"),
        }
    }

    fn copy_from_plane<T: Channel>(
        &mut self,
        src: &IntImage,
        src_x: usize,
        src_y: usize,
        dst_x: usize,
        dst_y: usize,
        width: usize,
        height: usize,
    ) {
        let planes = self.dim.min(src.channels);
        let in_skip = src.channels - planes;
        let out_skip = self.dim - planes;
        let width = width.min(self.width.saturating_sub(dst_x));
        let height = height.min(self.height.saturating_sub(dst_y));
        let src_stride = src.stride_bytes / core::mem::size_of::<T>();
        let samples: &[T] = bytemuck::cast_slice(&src.data);

        for y in 0..height {
            let mut pin = (src_y + y) * src_stride + src_x * src.channels;
            let mut pout = self.index(dst_x, dst_y + y, 0);
            for _ in 0..width {
                for _ in 0..planes {
                    self.data[pout] = samples[pin].to_f32();
                    pin += 1;
                    pout += 1;
                }
                pin += in_skip;
                pout += out_skip;
            }
        }
    }

    /// Convert a rectangle back into an integer image, rounding to
    /// nearest and saturating to the channel range.
    pub fn copy_to_int(
        &self,
        dst: &mut IntImage,
        src_x: usize,
        src_y: usize,
        dst_x: usize,
        dst_y: usize,
        width: usize,
        height: usize,
    ) {
        match dst.bytes_per_channel {
            1 => self.copy_to_plane::<u8>(dst, src_x, src_y, dst_x, dst_y, width, height),
            2 => self.copy_to_plane::<u16>(dst, src_x, src_y, dst_x, dst_y, width, height),
            _ => unreachable!("IntImage construction validates bytes per channel"),
        }
    }

    fn copy_to_plane<T: Channel>(
        &self,
        dst: &mut IntImage,
        src_x: usize,
        src_y: usize,
        dst_x: usize,
        dst_y: usize,
        width: usize,
        height: usize,
    ) {
        let planes = self.dim.min(dst.channels);
        let in_skip = self.dim - planes;
        let out_skip = dst.channels - planes;
        let width = width.min(self.width.saturating_sub(src_x));
        let height = height.min(self.height.saturating_sub(src_y));
        let dst_stride = dst.stride_bytes / core::mem::size_of::<T>();
        let dst_channels = dst.channels;
        let samples: &mut [T] = bytemuck::cast_slice_mut(&mut dst.data);

        for y in 0..height {
            let mut pin = self.index(src_x, src_y + y, 0);
            let mut pout = (dst_y + y) * dst_stride + dst_x * dst_channels;
            for _ in 0..width {
                for _ in 0..planes {
                    samples[pout] = T::from_f32(self.data[pin]);
                    pin += 1;
                    pout += 1;
                }
                pin += in_skip;
                pout += out_skip;
            }
        }
    }

    /// Borrow a rectangle as a read-only view.
    pub fn view(&self, x: usize, y: usize, width: usize, height: usize) -> FloatView<'_> {
        debug_assert!(x + width <= self.width && y + height <= self.height);
        FloatView { img: self, x, y, width, height }
    }
}

/// Zero-copy read view of a [`FloatImage`] rectangle.
#[derive(Clone, Copy)]
pub struct FloatView<'a> {
    img: &'a FloatImage,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

impl<'a> FloatView<'a> {
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn dim(&self) -> usize {
        self.img.dim
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize, v: usize) -> f32 {
        self.img.at(self.x + x, self.y + y, v)
    }
}

/// Integer pixel image, 1 or 2 bytes per channel, byte stride.
///
/// Host data lives here; the float side does the processing. The first
/// byte of a pixel doubles as the mask sample for single-channel masks.
#[derive(Debug, Default, Clone)]
pub struct IntImage {
    data: Vec<u8>,
    width: usize,
    height: usize,
    stride_bytes: usize,
    bytes_per_channel: usize,
    channels: usize,
}

impl IntImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        width: usize,
        height: usize,
        bytes_per_channel: usize,
        channels: usize,
    ) -> Result<Self, PixError> {
        let stride = width * bytes_per_channel * channels;
        Self::alloc_with_stride(width, height, bytes_per_channel, channels, stride)
    }

    pub fn alloc_with_stride(
        width: usize,
        height: usize,
        bytes_per_channel: usize,
        channels: usize,
        stride_bytes: usize,
    ) -> Result<Self, PixError> {
        if bytes_per_channel != 1 && bytes_per_channel != 2 {
            return Err(PixError::BadBytesPerChannel(bytes_per_channel));
        }
        let data = alloc_u8(height * stride_bytes)?;
        Ok(Self { data, width, height, stride_bytes, bytes_per_channel, channels })
    }

    /// Wrap caller-owned bytes; the length must match the geometry.
    pub fn from_vec(
        data: Vec<u8>,
        width: usize,
        height: usize,
        bytes_per_channel: usize,
        channels: usize,
        stride_bytes: usize,
    ) -> Result<Self, PixError> {
        if bytes_per_channel != 1 && bytes_per_channel != 2 {
            return Err(PixError::BadBytesPerChannel(bytes_per_channel));
        }
        let expected = height * stride_bytes;
        if data.len() != expected || stride_bytes < width * bytes_per_channel * channels {
            return Err(PixError::BadGeometry { expected, got: data.len() });
        }
        Ok(Self { data, width, height, stride_bytes, bytes_per_channel, channels })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn channels(&self) -> usize {
        self.channels
    }
    pub fn bytes_per_channel(&self) -> usize {
        self.bytes_per_channel
    }
    pub fn stride_bytes(&self) -> usize {
        self.stride_bytes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// First byte of the pixel at `(x, y)`; the mask sample.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.stride_bytes + x * self.channels * self.bytes_per_channel]
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Region blit between identically-formatted integer images. The
    /// extent is clamped to both images.
    pub fn copy_from(
        &mut self,
        src: &IntImage,
        src_x: usize,
        src_y: usize,
        dst_x: usize,
        dst_y: usize,
        width: usize,
        height: usize,
    ) -> Result<(), PixError> {
        if src.bytes_per_channel != self.bytes_per_channel {
            return Err(PixError::BadBytesPerChannel(src.bytes_per_channel));
        }
        if src.channels != self.channels {
            return Err(PixError::ChannelMismatch { dst: self.channels, src: src.channels });
        }
        let width = width
            .min(src.width.saturating_sub(src_x))
            .min(self.width.saturating_sub(dst_x));
        let height = height
            .min(src.height.saturating_sub(src_y))
            .min(self.height.saturating_sub(dst_y));

        let pixel_bytes = self.channels * self.bytes_per_channel;
        for y in 0..height {
            let src_start = (src_y + y) * src.stride_bytes + src_x * pixel_bytes;
            let dst_start = (dst_y + y) * self.stride_bytes + dst_x * pixel_bytes;
            let n = width * pixel_bytes;
            self.data[dst_start..dst_start + n]
                .copy_from_slice(&src.data[src_start..src_start + n]);
        }
        Ok(())
    }

    /// Borrow a rectangle as a mask view.
    pub fn view(&self, x: usize, y: usize, width: usize, height: usize) -> MaskView<'_> {
        debug_assert!(x + width <= self.width && y + height <= self.height);
        MaskView { img: self, x, y, width, height }
    }
}

/// Zero-copy view of an [`IntImage`] rectangle, read as mask samples.
#[derive(Clone, Copy)]
pub struct MaskView<'a> {
    img: &'a IntImage,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

impl<'a> MaskView<'a> {
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }

    /// Non-zero means the pixel is active.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.img.at(self.x + x, self.y + y)
    }

    /// True when every covered pixel is active; such a view carries no
    /// information and callers drop it before entering inner loops.
    pub fn all_active(&self) -> bool {
        for y in 0..self.height {
            for x in 0..self.width {
                if self.at(x, y) == 0 {
                    return false;
                }
            }
        }
        true
    }
}
