// SPDX-License-Identifier: MIT
//! # Deriche recursive gaussian
//!
//! Gaussian blur as a pair of second-order IIR sweeps (forward, then
//! backward with combine) along each axis. Cost per pixel is constant in
//! sigma, which is what makes the tensor-smoothing passes affordable at
//! large regularisation values.
//!
//! Lines are gathered into a contiguous scratch buffer, filtered, and
//! scattered back; rows and columns go through the same code. Four-channel
//! lane-aligned images run the filter on whole `[f32; 4]` pixels.

use crate::{FloatImage, PixError};

#[derive(Clone, Copy)]
struct Coeffs {
    a0: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    b1: f32,
    b2: f32,
    coefp: f32,
    coefn: f32,
}

fn coeffs(sigma: f32) -> Coeffs {
    let nsigma = if sigma < 0.1 { 0.1 } else { sigma };
    let alpha = 1.695 / nsigma;
    let ema = (-alpha).exp();
    let ema2 = (-2.0 * alpha).exp();
    let b1 = -2.0 * ema;
    let b2 = ema2;
    let k = (1.0 - ema) * (1.0 - ema) / (1.0 + 2.0 * alpha * ema - ema2);
    let a0 = k;
    let a1 = k * (alpha - 1.0) * ema;
    let a2 = k * (alpha + 1.0) * ema;
    let a3 = -k * ema2;
    let coefp = (a0 + a1) / (1.0 + b1 + b2);
    let coefn = (a2 + a3) / (1.0 + b1 + b2);
    Coeffs { a0, a1, a2, a3, b1, b2, coefp, coefn }
}

/// Forward sweep into `out`, backward sweep combined back into `line`.
fn filter_line(line: &mut [f32], out: &mut [f32], c: Coeffs) {
    let n = line.len();
    debug_assert!(out.len() >= n);

    let mut xp = line[0];
    let mut yb = c.coefp * xp;
    let mut yp = yb;
    for m in 0..n {
        let xc = line[m];
        let yc = c.a0 * xc + c.a1 * xp - c.b1 * yp - c.b2 * yb;
        out[m] = yc;
        xp = xc;
        yb = yp;
        yp = yc;
    }

    let mut xn = line[n - 1];
    let mut xa = xn;
    let mut yn = c.coefn * xn;
    let mut ya = yn;
    for m in (0..n).rev() {
        let xc = line[m];
        let yc = c.a2 * xn + c.a3 * xa - c.b1 * yn - c.b2 * ya;
        xa = xn;
        xn = xc;
        ya = yn;
        yn = yc;
        line[m] = out[m] + yc;
    }
}

/// Same recurrence over whole pixel lanes.
fn filter_line_lanes(line: &mut [[f32; 4]], out: &mut [[f32; 4]], c: Coeffs) {
    #[inline]
    fn madd(acc: [f32; 4], k: f32, v: [f32; 4]) -> [f32; 4] {
        [acc[0] + k * v[0], acc[1] + k * v[1], acc[2] + k * v[2], acc[3] + k * v[3]]
    }
    #[inline]
    fn mul(k: f32, v: [f32; 4]) -> [f32; 4] {
        [k * v[0], k * v[1], k * v[2], k * v[3]]
    }

    let n = line.len();
    let mut xp = line[0];
    let mut yb = mul(c.coefp, xp);
    let mut yp = yb;
    for m in 0..n {
        let xc = line[m];
        let mut yc = mul(c.a0, xc);
        yc = madd(yc, c.a1, xp);
        yc = madd(yc, -c.b1, yp);
        yc = madd(yc, -c.b2, yb);
        out[m] = yc;
        xp = xc;
        yb = yp;
        yp = yc;
    }

    let mut xn = line[n - 1];
    let mut xa = xn;
    let mut yn = mul(c.coefn, xn);
    let mut ya = yn;
    for m in (0..n).rev() {
        let xc = line[m];
        let mut yc = mul(c.a2, xn);
        yc = madd(yc, c.a3, xa);
        yc = madd(yc, -c.b1, yn);
        yc = madd(yc, -c.b2, ya);
        xa = xn;
        xn = xc;
        ya = yn;
        yn = yc;
        let o = out[m];
        line[m] = [o[0] + yc[0], o[1] + yc[1], o[2] + yc[2], o[3] + yc[3]];
    }
}

fn blur_axis(img: &mut FloatImage, sigma: f32, horizontal: bool) -> Result<(), PixError> {
    let c = coeffs(sigma);
    let dim = img.dim();
    let (len, lines) =
        if horizontal { (img.width(), img.height()) } else { (img.height(), img.width()) };

    if img.simd_compatible() {
        let mut line: Vec<[f32; 4]> = {
            let mut v = Vec::new();
            v.try_reserve_exact(len).map_err(|_| PixError::Alloc { bytes: len * 16 })?;
            v.resize(len, [0.0; 4]);
            v
        };
        let mut out = line.clone();
        let lane_stride = img.stride() / 4;
        for i in 0..lines {
            let data: &mut [[f32; 4]] = bytemuck::cast_slice_mut(img.data_mut());
            let (start, step) = if horizontal { (i * lane_stride, 1) } else { (i, lane_stride) };
            for (k, lane) in line.iter_mut().enumerate() {
                *lane = data[start + k * step];
            }
            filter_line_lanes(&mut line, &mut out, c);
            for (k, lane) in line.iter().enumerate() {
                data[start + k * step] = *lane;
            }
        }
    } else {
        let mut line: Vec<f32> = {
            let mut v = Vec::new();
            v.try_reserve_exact(len).map_err(|_| PixError::Alloc { bytes: len * 4 })?;
            v.resize(len, 0.0);
            v
        };
        let mut out = line.clone();
        let stride = img.stride();
        for i in 0..lines {
            for v in 0..dim {
                let data = img.data_mut();
                let (start, step) = if horizontal {
                    (i * stride + v, dim)
                } else {
                    (i * dim + v, stride)
                };
                for (k, s) in line.iter_mut().enumerate() {
                    *s = data[start + k * step];
                }
                filter_line(&mut line, &mut out, c);
                for (k, s) in line.iter().enumerate() {
                    data[start + k * step] = *s;
                }
            }
        }
    }
    Ok(())
}

/// Deriche blur along both axes. Sigmas under 0.1 are a no-op.
pub fn deriche(img: &mut FloatImage, sigma: f32) -> Result<(), PixError> {
    if img.is_empty() || sigma < 0.1 {
        return Ok(());
    }
    blur_axis(img, sigma, true)?;
    blur_axis(img, sigma, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(w: usize, h: usize, dim: usize) -> FloatImage {
        let mut img = FloatImage::new();
        img.alloc(w, h, dim).unwrap();
        for v in 0..dim {
            *img.at_mut(w / 2, h / 2, v) = 100.0;
        }
        img
    }

    #[test]
    fn tiny_sigma_is_identity() {
        let mut img = impulse(9, 9, 3);
        let before = img.clone();
        deriche(&mut img, 0.05).unwrap();
        assert_eq!(img.data(), before.data());
    }

    #[test]
    fn blur_spreads_and_roughly_preserves_mass() {
        let mut img = impulse(21, 21, 1);
        deriche(&mut img, 2.0).unwrap();
        assert!(img.at(10, 10, 0) < 100.0);
        assert!(img.at(12, 10, 0) > 0.0);
        let sum: f32 = (0..21).flat_map(|y| (0..21).map(move |x| (x, y)))
            .map(|(x, y)| img.at(x, y, 0))
            .sum();
        assert!((sum - 100.0).abs() < 5.0, "mass drifted: {}", sum);
    }

    #[test]
    fn lane_path_matches_scalar_path() {
        // Same pixels through the 4-channel lane path and a 1-channel
        // scalar path must agree per channel.
        let mut lanes = FloatImage::new();
        lanes.alloc(16, 7, 4).unwrap();
        let mut scalar = FloatImage::new();
        scalar.alloc(16, 7, 1).unwrap();
        for y in 0..7 {
            for x in 0..16 {
                let s = ((x * 31 + y * 17) % 97) as f32;
                for v in 0..4 {
                    *lanes.at_mut(x, y, v) = s;
                }
                *scalar.at_mut(x, y, 0) = s;
            }
        }
        deriche(&mut lanes, 1.4).unwrap();
        deriche(&mut scalar, 1.4).unwrap();
        for y in 0..7 {
            for x in 0..16 {
                for v in 0..4 {
                    assert!((lanes.at(x, y, v) - scalar.at(x, y, 0)).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn blur_is_symmetric_for_symmetric_input() {
        let mut img = impulse(15, 15, 1);
        deriche(&mut img, 1.1).unwrap();
        for d in 1..7 {
            let l = img.at(7 - d, 7, 0);
            let r = img.at(7 + d, 7, 0);
            assert!((l - r).abs() < 1e-4);
            let u = img.at(7, 7 - d, 0);
            let dn = img.at(7, 7 + d, 0);
            assert!((u - dn).abs() < 1e-4);
        }
    }
}
