// SPDX-License-Identifier: MIT
//! # Three-term IIR gaussian
//!
//! The recursive blur used by the unsharp-mask pipeline: coefficients are
//! derived from the target radius, edges are mirrored, and the line is
//! filtered forward then backward in place. One generic implementation
//! serves both scalar channels and whole `[f32; 4]` pixel lanes.

use crate::{FloatImage, PixError};

/// A value the recurrence can run over: a single channel sample or a
/// four-channel lane.
pub trait Lane: Copy {
    const ZERO: Self;
    fn mul(self, k: f32) -> Self;
    fn madd(self, k: f32, v: Self) -> Self;
}

impl Lane for f32 {
    const ZERO: Self = 0.0;
    #[inline]
    fn mul(self, k: f32) -> Self {
        self * k
    }
    #[inline]
    fn madd(self, k: f32, v: Self) -> Self {
        self + k * v
    }
}

impl Lane for [f32; 4] {
    const ZERO: Self = [0.0; 4];
    #[inline]
    fn mul(self, k: f32) -> Self {
        [self[0] * k, self[1] * k, self[2] * k, self[3] * k]
    }
    #[inline]
    fn madd(self, k: f32, v: Self) -> Self {
        [
            self[0] + k * v[0],
            self[1] + k * v[1],
            self[2] + k * v[2],
            self[3] + k * v[3],
        ]
    }
}

/// Recurrence state for one blur radius and line length. The scratch line
/// is reused across every row or column of a sweep.
pub struct IirGauss<L: Lane> {
    big_b: f32,
    b1: f32,
    b2: f32,
    b3: f32,
    radius: usize,
    scratch: Vec<L>,
}

impl<L: Lane> IirGauss<L> {
    pub fn new(radius: f32, line_len: usize) -> Result<Self, PixError> {
        let q = if radius >= 2.5 {
            0.98711 * radius - 0.96330
        } else {
            3.97156 - 4.14554 * (1.0 - 0.26891 * radius).sqrt()
        };
        let b0 = 1.57825 + ((0.422205 * q + 1.4281) * q + 2.44413) * q;
        let b1 = ((1.26661 * q + 2.85619) * q + 2.44413) * q / b0;
        let b2 = -((1.26661 * q + 1.4281) * q * q) / b0;
        let b3 = 0.422205 * q * q * q / b0;
        let big_b = 1.0 - (b1 + b2 + b3);

        let w = radius as usize + 10;
        let len = line_len + 2 * w;
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(len)
            .map_err(|_| PixError::Alloc { bytes: len * core::mem::size_of::<L>() })?;
        scratch.resize(len, L::ZERO);

        Ok(Self { big_b, b1, b2, b3, radius: radius as usize, scratch })
    }

    /// Mirror-pad `line[w .. w + len)` in place, then filter forward and
    /// backward over the padded span.
    fn filter(&mut self, len: usize) {
        let w = self.radius;
        let pad = self.radius + 10;
        let line = &mut self.scratch;

        // Mirror the edges into the pad area actually used by the filter.
        for i in 1..=w {
            line[pad - i] = line[pad + i];
            line[pad + len - 1 + i] = line[pad + len - 1 - i];
        }

        let lo = pad - w;
        let hi = pad + len - 1 + w;

        let (mut d1, mut d2, mut d3) = (line[lo], line[lo], line[lo]);
        for i in lo..=hi {
            let mut v = line[i].mul(self.big_b);
            v = v.madd(self.b3, d3);
            d3 = d2;
            v = v.madd(self.b2, d2);
            d2 = d1;
            v = v.madd(self.b1, d1);
            line[i] = v;
            d1 = v;
        }

        let (mut d1, mut d2, mut d3) = (line[hi], line[hi], line[hi]);
        for i in (lo..=hi).rev() {
            let mut v = line[i].mul(self.big_b);
            v = v.madd(self.b3, d3);
            d3 = d2;
            v = v.madd(self.b2, d2);
            d2 = d1;
            v = v.madd(self.b1, d1);
            line[i] = v;
            d1 = v;
        }
    }

    /// Blur one strided line of `data` in place. Written as if it blurs a
    /// column; rows are just `stride == 1`.
    pub fn blur_line(&mut self, data: &mut [L], start: usize, len: usize, stride: usize) {
        let pad = self.radius + 10;
        for idx in 0..len {
            self.scratch[idx + pad] = data[start + idx * stride];
        }
        self.filter(len);
        for idx in 0..len {
            data[start + idx * stride] = self.scratch[idx + pad];
        }
    }
}

/// Separable IIR gaussian over the whole image, horizontal then vertical.
/// `tick` runs once per line so the caller can count progress and observe
/// cancellation between lines; returning `false` stops the sweep.
pub fn iir_blur<F: FnMut() -> bool>(
    img: &mut FloatImage,
    radius: f32,
    mut tick: F,
) -> Result<(), PixError> {
    if img.is_empty() || radius <= 0.0 {
        return Ok(());
    }

    if img.simd_compatible() {
        let lane_stride = img.stride() / 4;
        let (w, h) = (img.width(), img.height());

        let mut iir: IirGauss<[f32; 4]> = IirGauss::new(radius, w)?;
        for row in 0..h {
            if !tick() {
                return Ok(());
            }
            let data: &mut [[f32; 4]] = bytemuck::cast_slice_mut(img.data_mut());
            iir.blur_line(data, row * lane_stride, w, 1);
        }

        let mut iir: IirGauss<[f32; 4]> = IirGauss::new(radius, h)?;
        for col in 0..w {
            if !tick() {
                return Ok(());
            }
            let data: &mut [[f32; 4]] = bytemuck::cast_slice_mut(img.data_mut());
            iir.blur_line(data, col, h, lane_stride);
        }
    } else {
        let (w, h, dim, stride) = (img.width(), img.height(), img.dim(), img.stride());

        let mut iir: IirGauss<f32> = IirGauss::new(radius, w)?;
        for row in 0..h {
            if !tick() {
                return Ok(());
            }
            for v in 0..dim {
                iir.blur_line(img.data_mut(), row * stride + v, w, dim);
            }
        }

        let mut iir: IirGauss<f32> = IirGauss::new(radius, h)?;
        for col in 0..w {
            if !tick() {
                return Ok(());
            }
            for v in 0..dim {
                iir.blur_line(img.data_mut(), col * dim + v, h, stride);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_line_is_preserved() {
        let mut iir: IirGauss<f32> = IirGauss::new(4.0, 32).unwrap();
        let mut data = vec![55.0f32; 32];
        iir.blur_line(&mut data, 0, 32, 1);
        for &v in &data {
            assert!((v - 55.0).abs() < 1e-2, "constant drifted to {}", v);
        }
    }

    #[test]
    fn blur_flattens_an_impulse() {
        let mut img = FloatImage::new();
        img.alloc(31, 31, 1).unwrap();
        *img.at_mut(15, 15, 0) = 100.0;
        iir_blur(&mut img, 3.0, || true).unwrap();
        assert!(img.at(15, 15, 0) < 10.0);
        assert!(img.at(18, 15, 0) > 0.0);
        assert!((img.at(12, 15, 0) - img.at(18, 15, 0)).abs() < 1e-3);
    }

    #[test]
    fn lane_and_scalar_paths_agree() {
        let mut lanes = FloatImage::new();
        lanes.alloc(24, 9, 4).unwrap();
        let mut scalar = FloatImage::new();
        scalar.alloc(24, 9, 1).unwrap();
        for y in 0..9 {
            for x in 0..24 {
                let s = ((x * 13 + y * 29) % 83) as f32;
                for v in 0..4 {
                    *lanes.at_mut(x, y, v) = s;
                }
                *scalar.at_mut(x, y, 0) = s;
            }
        }
        iir_blur(&mut lanes, 2.5, || true).unwrap();
        iir_blur(&mut scalar, 2.5, || true).unwrap();
        for y in 0..9 {
            for x in 0..24 {
                assert!((lanes.at(x, y, 2) - scalar.at(x, y, 0)).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn tick_false_stops_early() {
        let mut img = FloatImage::new();
        img.alloc(8, 8, 1).unwrap();
        *img.at_mut(4, 4, 0) = 10.0;
        let before = img.clone();
        iir_blur(&mut img, 2.0, || false).unwrap();
        assert_eq!(img.data(), before.data());
    }
}
