//! # Anisotropic diffusion, CPU path
//!
//! The math of the denoiser. Stage A builds the smoothed structure-tensor
//! field G from a blurred copy of the tile; Stage B converts each tensor's
//! eigensystem into the smoothing geometry G2; Stage C rotates G2 through
//! a fan of angles and, for each, integrates the image along the resulting
//! vector field; Stage D normalises the accumulator back into the tile.
//!
//! Stage A runs on the primary worker only (it is cheap relative to the
//! angle loop); B, C and D are row-parallel.

use aniso_pix::{boxblur, deriche::deriche, FloatImage, MaskView};
use log::debug;

use crate::config::Interpolation;
use crate::core::rows::RowDispatcher;
use crate::core::sync::PoolSync;
use crate::error::{Cancelled, StageAbort};

/// Stage A: build the (optionally σ-smoothed) structure tensor field `g`
/// from the working tile.
///
/// `stop_stage` 1-5 exits after the named step and leaves that
/// intermediate in `img`, scaled for display; 0 runs to completion. The
/// stop points are diagnostic surface and their exact behaviour is kept.
pub(crate) fn prep_tensors(
    img: &mut FloatImage,
    g: &mut FloatImage,
    sync: &PoolSync,
    pre_blur: f32,
    alpha: f32,
    sigma: f32,
    geom_factor: f32,
    stop_stage: i32,
) -> Result<(), StageAbort> {
    if img.is_empty() {
        return Ok(());
    }

    let alpha = alpha.max(0.0);
    let sigma = sigma.max(0.0);

    if pre_blur > 0.0 {
        boxblur::gaussian_box_blur(img, pre_blur, sync.stop_flag())?;
    }
    if stop_stage == 1 {
        return Ok(());
    }
    sync.check_cancel()?;

    let mut blurred = img.clone();
    deriche(&mut blurred, alpha)?;
    if stop_stage == 2 {
        img.swap(&mut blurred);
        return Ok(());
    }
    sync.check_cancel()?;

    if geom_factor > 0.0 {
        blurred.scale(geom_factor);
    } else {
        blurred.normalize(0.0, -geom_factor);
    }
    if stop_stage == 3 {
        img.swap(&mut blurred);
        return Ok(());
    }
    sync.check_cancel()?;

    tensor_field(&blurred, g)?;
    if stop_stage == 4 {
        g.scale(0.05);
        img.swap(g);
        return Ok(());
    }
    sync.check_cancel()?;

    if sigma > 0.0 {
        deriche(g, sigma)?;
    }
    sync.check_cancel()?;

    if stop_stage == 5 {
        g.scale(1.0 / 10_000.0);
        img.swap(g);
        return Ok(());
    }
    Ok(())
}

/// The 2-D structure tensor field of an image: per pixel, gradient energy
/// summed over channels from forward/backward finite differences. Four
/// components are allocated though only three are used, for lane layout.
fn tensor_field(img: &FloatImage, res: &mut FloatImage) -> Result<(), aniso_pix::PixError> {
    if img.is_empty() {
        res.free();
        return Ok(());
    }
    res.alloc(img.width(), img.height(), 4)?;
    res.fill(0.0);

    let w = img.width();
    let h = img.height();
    for k in 0..img.dim() {
        for y in 0..h {
            let yp = y.saturating_sub(1);
            let yn = (y + 1).min(h - 1);
            for x in 0..w {
                let xp = x.saturating_sub(1);
                let xn = (x + 1).min(w - 1);
                let icc = img.at(x, y, k);
                let ixf = img.at(xn, y, k) - icc;
                let ixb = icc - img.at(xp, y, k);
                let iyf = img.at(x, yn, k) - icc;
                let iyb = icc - img.at(x, yp, k);
                *res.at_mut(x, y, 0) += 0.5 * (ixf * ixf + ixb * ixb);
                *res.at_mut(x, y, 1) += 0.25 * (ixf * iyf + ixf * iyb + ixb * iyf + ixb * iyb);
                *res.at_mut(x, y, 2) += 0.5 * (iyf * iyf + iyb * iyb);
            }
        }
    }
    Ok(())
}

/// Eigensystem of the symmetric 2x2 tensor `[a b; b c]`.
/// Returns `(l_small, l_big, u, v)` with `u` the unit eigenvector of the
/// smaller eigenvalue and `v` of the larger.
fn symmetric_eigen(a: f32, b: f32, c: f32) -> (f32, f32, [f32; 2], [f32; 2]) {
    let e = a + c;
    let f = (e * e - 4.0 * (a * c - b * b)).max(0.0).sqrt();
    let l_small = 0.5 * (e - f);
    let l_big = 0.5 * (e + f);
    let theta_big = (l_big - a).atan2(b);
    let theta_small = (l_small - a).atan2(b);
    (
        l_small,
        l_big,
        [theta_small.cos(), theta_small.sin()],
        [theta_big.cos(), theta_big.sin()],
    )
}

/// Stage B (row-parallel): smooth the tensors of `g` into the geometry
/// field `g2`. `g` is read-only; each worker writes only the rows it
/// fetched.
pub(crate) fn smooth_tensors(
    g: &FloatImage,
    g2: &mut FloatImage,
    sync: &PoolSync,
    rows: &RowDispatcher,
    sharpness: f32,
    anisotropy: f32,
) -> Result<(), Cancelled> {
    let sharpness = sharpness.max(0.0);
    let anisotropy = anisotropy.clamp(0.0, 1.0);
    let nsharpness = sharpness.max(1e-5);
    let power1 = 0.5 * nsharpness;
    let power2 = power1 / (1e-7 + 1.0 - anisotropy);

    while let Some(y) = rows.next() {
        sync.check_cancel()?;
        sync.tick();
        for x in 0..g.width() {
            let a = g.at(x, y, 0);
            let b = g.at(x, y, 1);
            let c = g.at(x, y, 2);
            let (l1, l2, u, v) = symmetric_eigen(a, b, c);
            let n1 = (1.0 + l1 + l2).powf(-power1);
            let n2 = (1.0 + l1 + l2).powf(-power2);
            let [ux, uy] = u;
            let [vx, vy] = v;
            *g2.at_mut(x, y, 0) = n1 * ux * ux + n2 * vx * vx;
            *g2.at_mut(x, y, 1) = n1 * ux * uy + n2 * vx * vy;
            *g2.at_mut(x, y, 2) = n1 * uy * uy + n2 * vy * vy;
        }
    }
    Ok(())
}

/// Stage C1 (row-parallel): rotate the geometry field by `theta` degrees
/// into the per-pixel walk field `w`: `(n, u·dl/n, v·dl/n)` per pixel.
pub(crate) fn init_angle_field(
    g2: &FloatImage,
    w: &mut FloatImage,
    sync: &PoolSync,
    rows: &RowDispatcher,
    theta: f32,
    dl: f32,
) -> Result<(), Cancelled> {
    let thetar = theta * std::f32::consts::PI / 180.0;
    let vx = thetar.cos();
    let vy = thetar.sin();

    while let Some(y) = rows.next() {
        sync.check_cancel()?;
        sync.tick();
        for x in 0..g2.width() {
            let a = g2.at(x, y, 0);
            let b = g2.at(x, y, 1);
            let c = g2.at(x, y, 2);
            let u = a * vx + b * vy;
            let v = b * vx + c * vy;
            let n = (u * u + v * v).sqrt() + 1e-5;
            let dln = dl / n;
            *w.at_mut(x, y, 0) = n;
            *w.at_mut(x, y, 1) = u * dln;
            *w.at_mut(x, y, 2) = v * dln;
        }
    }
    Ok(())
}

/// Bilinear sample of the walk vector at `(fx, fy)`, with each corner
/// vector flipped to agree with the reference direction `(ru, rv)` before
/// blending. Without the alignment, anti-parallel neighbours cancel in
/// the interpolation.
fn sample_vector_aligned(w: &FloatImage, fx: f32, fy: f32, ru: f32, rv: f32) -> (f32, f32) {
    let maxx = (w.width() - 1) as f32;
    let maxy = (w.height() - 1) as f32;
    let nfx = fx.clamp(0.0, maxx);
    let nfy = fy.clamp(0.0, maxy);
    let x = nfx as usize;
    let y = nfy as usize;
    let dx = nfx - x as f32;
    let dy = nfy - y as f32;
    let nx = if dx > 0.0 { x + 1 } else { x };
    let ny = if dy > 0.0 { y + 1 } else { y };

    let corner = |cx: usize, cy: usize| -> (f32, f32) {
        let u = w.at(cx, cy, 1);
        let v = w.at(cx, cy, 2);
        if u * ru + v * rv < 0.0 {
            (-u, -v)
        } else {
            (u, v)
        }
    };
    let (ucc, vcc) = corner(x, y);
    let (unc, vnc) = corner(nx, y);
    let (ucn, vcn) = corner(x, ny);
    let (unn, vnn) = corner(nx, ny);

    let blend = |cc: f32, nc: f32, cn: f32, nn: f32| -> f32 {
        cc + dx * (nc - cc + dy * (cc + nn - cn - nc)) + dy * (cn - cc)
    };
    (blend(ucc, unc, ucn, unn), blend(vcc, vnc, vcn, vnn))
}

/// Stage C2 (row-parallel): for every active pixel, walk the curve the
/// field defines and accumulate gaussian-weighted samples into `dest`.
///
/// The arclength advances by `dl` per step, or by `dl * n/n_local` in
/// alt-amplitude mode: passing near a contour (small local field) then
/// counts as more distance, so the walk cannot overshoot a contour it
/// started far away from. That is what kills the ghosting at high
/// amplitude.
#[allow(clippy::too_many_arguments)]
pub(crate) fn integrate_angle(
    img: &FloatImage,
    w: &FloatImage,
    mask: Option<&MaskView<'_>>,
    dest: &mut FloatImage,
    sync: &PoolSync,
    rows: &RowDispatcher,
    alt_amplitude: bool,
    amplitude: f32,
    dl: f32,
    gauss_prec: f32,
    interpolation: Interpolation,
    fast_approx: bool,
) -> Result<(), Cancelled> {
    let sqrt2amplitude = (2.0 * amplitude).sqrt();
    let dx1 = (img.width() - 1) as f32;
    let dy1 = (img.height() - 1) as f32;
    let dim = img.dim();
    let mut tmp = vec![0.0f32; dim];

    while let Some(y) = rows.next() {
        sync.check_cancel()?;
        sync.tick();
        for x in 0..img.width() {
            if let Some(m) = mask {
                if m.at(x, y) == 0 {
                    continue;
                }
            }

            tmp.fill(0.0);
            let n = w.at(x, y, 0);
            let fsigma = n * sqrt2amplitude;
            let length = gauss_prec * fsigma;
            let fsigma2 = 2.0 * fsigma * fsigma;
            let mut s = 0.0f32;
            let (mut pu, mut pv) = (0.0f32, 0.0f32);
            let mut fx = x as f32;
            let mut fy = y as f32;
            let mut l = 0.0f32;

            match interpolation {
                Interpolation::Nearest => {
                    while l < length && fx >= 0.0 && fx <= dx1 && fy >= 0.0 && fy <= dy1 {
                        let cx = fx.round() as usize;
                        let cy = fy.round() as usize;
                        if fast_approx {
                            for (k, t) in tmp.iter_mut().enumerate() {
                                *t += img.at(cx, cy, k);
                            }
                            s += 1.0;
                        } else {
                            let coef = (-l * l / fsigma2).exp();
                            for (k, t) in tmp.iter_mut().enumerate() {
                                *t += coef * img.at(cx, cy, k);
                            }
                            s += coef;
                        }

                        let mut u = w.at(cx, cy, 1);
                        let mut v = w.at(cx, cy, 2);

                        if alt_amplitude {
                            let n2 = w.at(cx, cy, 0);
                            l += dl * (n / n2);
                        } else {
                            l += dl;
                        }

                        if pu * u + pv * v < 0.0 {
                            u = -u;
                            v = -v;
                        }
                        fx += u;
                        fy += v;
                        pu = u;
                        pv = v;
                    }
                }
                Interpolation::Linear => {
                    while l < length && fx >= 0.0 && fx <= dx1 && fy >= 0.0 && fy <= dy1 {
                        let cx = fx as usize;
                        let cy = fy as usize;
                        let curru = w.at(cx, cy, 1);
                        let currv = w.at(cx, cy, 2);
                        let (mut u, mut v) = sample_vector_aligned(w, fx, fy, curru, currv);
                        if pu * u + pv * v < 0.0 {
                            u = -u;
                            v = -v;
                        }
                        if fast_approx {
                            for (k, t) in tmp.iter_mut().enumerate() {
                                *t += img.linear_pix2d(fx, fy, k);
                            }
                            s += 1.0;
                        } else {
                            let coef = (-l * l / fsigma2).exp();
                            for (k, t) in tmp.iter_mut().enumerate() {
                                *t += coef * img.linear_pix2d(fx, fy, k);
                            }
                            s += coef;
                        }
                        fx += u;
                        fy += v;
                        pu = u;
                        pv = v;

                        if alt_amplitude {
                            let n2 = w.at(cx, cy, 0);
                            l += dl * (n / n2);
                        } else {
                            l += dl;
                        }
                    }
                }
                Interpolation::RungeKutta => {
                    while l < length && fx >= 0.0 && fx <= dx1 && fy >= 0.0 && fy <= dy1 {
                        let cx = fx as usize;
                        let cy = fy as usize;
                        let curru = w.at(cx, cy, 1);
                        let currv = w.at(cx, cy, 2);
                        // Half-step predictor, then the corrected vector.
                        let (u0, v0) = sample_vector_aligned(w, fx, fy, curru, currv);
                        let (mut u, mut v) = sample_vector_aligned(
                            w,
                            fx + 0.5 * u0,
                            fy + 0.5 * v0,
                            curru,
                            currv,
                        );
                        if pu * u + pv * v < 0.0 {
                            u = -u;
                            v = -v;
                        }
                        if fast_approx {
                            for (k, t) in tmp.iter_mut().enumerate() {
                                *t += img.linear_pix2d(fx, fy, k);
                            }
                            s += 1.0;
                        } else {
                            let coef = (-l * l / fsigma2).exp();
                            for (k, t) in tmp.iter_mut().enumerate() {
                                *t += coef * img.linear_pix2d(fx, fy, k);
                            }
                            s += coef;
                        }
                        fx += u;
                        fy += v;
                        pu = u;
                        pv = v;

                        if alt_amplitude {
                            let n2 = w.at(cx, cy, 0);
                            l += dl * (n / n2);
                        } else {
                            l += dl;
                        }
                    }
                }
            }

            if s > 0.0 {
                for (k, t) in tmp.iter().enumerate() {
                    *dest.at_mut(x, y, k) += t / s;
                }
            } else {
                for k in 0..dim {
                    *dest.at_mut(x, y, k) += img.at(x, y, k);
                }
            }
        }
    }
    Ok(())
}

/// Stage D (row-parallel): average the accumulator over the `n_angles`
/// directions actually integrated and write it back into the tile.
pub(crate) fn finalize(
    dest: &FloatImage,
    img: &mut FloatImage,
    n_angles: i32,
    mask: Option<&MaskView<'_>>,
    sync: &PoolSync,
    rows: &RowDispatcher,
) -> Result<(), Cancelled> {
    debug_assert!(n_angles > 0);
    let n = n_angles as f32;
    while let Some(y) = rows.next() {
        sync.check_cancel()?;
        for x in 0..img.width() {
            if let Some(m) = mask {
                if m.at(x, y) == 0 {
                    continue;
                }
            }
            for v in 0..img.dim() {
                *img.at_mut(x, y, v) = dest.at(x, y, v) / n;
            }
        }
    }
    Ok(())
}

/// Trace for the stage timings; the angle loop dominates.
pub(crate) fn log_stage(name: &str, started: std::time::Instant) {
    debug!("timing: {} {:.3}s", name, started.elapsed().as_secs_f32());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eigen_of_diagonal_tensor() {
        let (l1, l2, u, v) = symmetric_eigen(4.0, 0.0, 1.0);
        assert!((l1 - 1.0).abs() < 1e-6);
        assert!((l2 - 4.0).abs() < 1e-6);
        // v belongs to the larger eigenvalue: the x axis here.
        assert!(v[0].abs() > 0.99);
        assert!(u[1].abs() > 0.99);
    }

    #[test]
    fn eigen_vectors_are_orthonormal() {
        let (_, _, u, v) = symmetric_eigen(2.0, 0.7, 1.3);
        let dot = u[0] * v[0] + u[1] * v[1];
        assert!(dot.abs() < 1e-5);
        assert!((u[0] * u[0] + u[1] * u[1] - 1.0).abs() < 1e-5);
        assert!((v[0] * v[0] + v[1] * v[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn tensor_field_is_zero_on_constant_image() {
        let mut img = FloatImage::new();
        img.alloc(8, 8, 3).unwrap();
        img.fill(55.0);
        let mut g = FloatImage::new();
        tensor_field(&img, &mut g).unwrap();
        assert_eq!(g.dim(), 4);
        for y in 0..8 {
            for x in 0..8 {
                for c in 0..3 {
                    assert_eq!(g.at(x, y, c), 0.0);
                }
            }
        }
    }

    #[test]
    fn tensor_field_sees_a_vertical_edge() {
        let mut img = FloatImage::new();
        img.alloc(8, 8, 1).unwrap();
        for y in 0..8 {
            for x in 4..8 {
                *img.at_mut(x, y, 0) = 100.0;
            }
        }
        let mut g = FloatImage::new();
        tensor_field(&img, &mut g).unwrap();
        // Gradient energy concentrates in G.x along the edge, with no
        // diagonal term.
        assert!(g.at(4, 4, 0) > 0.0);
        assert_eq!(g.at(4, 4, 1), 0.0);
        assert_eq!(g.at(4, 4, 2), 0.0);
    }

    #[test]
    fn aligned_sampling_does_not_cancel_opposed_vectors() {
        // Two neighbouring pixels carry opposite vectors; naive bilinear
        // interpolation midway between them would collapse to zero.
        let mut w = FloatImage::new();
        w.alloc(2, 1, 4).unwrap();
        *w.at_mut(0, 0, 0) = 1.0;
        *w.at_mut(0, 0, 1) = 0.8;
        *w.at_mut(0, 0, 2) = 0.0;
        *w.at_mut(1, 0, 0) = 1.0;
        *w.at_mut(1, 0, 1) = -0.8;
        *w.at_mut(1, 0, 2) = 0.0;
        let (u, v) = sample_vector_aligned(&w, 0.5, 0.0, 0.8, 0.0);
        assert!((u - 0.8).abs() < 1e-6);
        assert_eq!(v, 0.0);
    }
}
