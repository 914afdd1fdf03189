// SPDX-License-Identifier: MIT
//! # Gaussian by three box passes
//!
//! A gaussian approximated by running a box average three times along each
//! axis. Each pass is a running sum with fractionally-weighted edge taps,
//! so non-integer box widths blur smoothly.
//!
//! A single pass does not repair artefacts within one box width of the
//! edge of its work area. [`gaussian_box_blur`] therefore pads the image
//! with edge-clamped pixels first and crops back afterwards; callers that
//! invoke [`box_blur`] directly must provide their own margin.
//!
//! The public radius is in reference-implementation units and is mapped
//! onto a box width through an empirically calibrated interpolation table.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{FloatImage, PixError};

/// Calibration samples: (reference radius, box width). The reference
/// quantises its radius to 0.1, so these are approximate by nature; beyond
/// the last pair the mapping extrapolates the final segment (it is close
/// to linear out there).
const RADIUS_TABLE: [(f32, f32); 16] = [
    (0.0, 1.0),
    (0.3, 1.1),
    (0.5, 1.2),
    (0.7, 1.3),
    (0.8, 1.4),
    (0.9, 1.5),
    (1.05, 1.7),
    (1.1, 1.8),
    (1.15, 1.9),
    (1.2, 2.0),
    (1.45, 3.0),
    (2.6, 5.0),
    (5.15, 10.0),
    (10.1, 20.0),
    (15.2, 30.0),
    (25.15, 50.0),
];

fn lerp_span(x: f32, l1: f32, h1: f32, l2: f32, h2: f32) -> f32 {
    (x - l1) * (h2 - l2) / (h1 - l1) + l2
}

/// Map a reference-unit blur radius onto a box side. A box side of 1.0 or
/// less does not blur.
pub fn box_width_for_radius(radius: f32) -> f32 {
    let mut i = 1;
    while i < RADIUS_TABLE.len() && RADIUS_TABLE[i].0 < radius {
        i += 1;
    }
    if i == RADIUS_TABLE.len() {
        // Off the end of the table; extrapolate the last segment.
        i -= 1;
    }
    let (x1, b1) = RADIUS_TABLE[i];
    let (x0, b0) = RADIUS_TABLE[i - 1];
    lerp_span(radius, x1, x0, b1, b0)
}

/// One box pass along an axis. `box_width` is the full side of the box in
/// pixels and may be fractional.
pub fn box_blur(img: &mut FloatImage, box_width: f32, horizontal: bool) -> Result<(), PixError> {
    if img.is_empty() {
        return Ok(());
    }
    // Half-width: the averaging distance each side of the output pixel.
    let half = box_width / 2.0;

    let mut out = FloatImage::new();
    out.alloc_with_stride(img.width(), img.height(), img.dim(), img.stride())?;

    let f_start = -half + 0.5;
    let f_end = f_start + half * 2.0;

    // Distance from the right-hand weighted tap to the output pixel.
    let offset = (half + 0.5 + 1e-5).floor() as usize;
    // Distance from the right tap back to the left tap; >= offset.
    let width_i = (f_end.floor() - f_start.floor() + 1e-5).floor() as usize;

    let (right_edge, left_edge) = if width_i == 0 {
        (f_end - f_start, 0.0)
    } else {
        (f_end - f_end.floor(), (f_start + 1e-5).ceil() - f_start)
    };

    // The whole pixels between the fractional taps.
    let sum_width = (half * 2.0 - left_edge - right_edge).round() as i32;
    let sum_weight = if sum_width == 0 { 0.0 } else { 1.0 / (half * 2.0) };
    let right_weight = right_edge / (half * 2.0);
    let left_weight = left_edge / (half * 2.0);

    let n = if horizontal { img.width() } else { img.height() };
    let lines = if horizontal { img.height() } else { img.width() };
    let dim = img.dim();
    let stride = img.stride();
    let start = n.min(width_i.max(offset));

    for i in 0..lines {
        for v in 0..dim {
            let (base, step) =
                if horizontal { (i * stride + v, dim) } else { (i * dim + v, stride) };
            let src = img.data();

            // Prime the running sum up to the first full-box position.
            let mut sum = (sum_width + 1) as f32 * src[base];
            for x in 0..start {
                let xl = (x as i32 - width_i as i32).clamp(0, n as i32 - 1) as usize;
                let xc = x.min(n - 1);
                sum -= src[base + xl * step];
                sum += src[base + xc * step];
            }

            // The first `offset` pixels never get a full box; carry the
            // source values so they are not left uninitialised.
            for x in 0..offset.min(n) {
                out.data_mut()[base + x * step] = src[base + x * step];
            }

            for x in start..n {
                let wl = src[base + (x - width_i) * step];
                let wr = src[base + x * step];
                sum -= wl;
                out.data_mut()[base + (x - offset) * step] =
                    sum * sum_weight + wl * left_weight + wr * right_weight;
                sum += wr;
            }
        }
    }

    img.swap(&mut out);
    Ok(())
}

/// Approximate a gaussian of the given reference radius with three box
/// passes per axis, padding first with edge-clamp repetition so the
/// per-pass edge artefacts never reach the visible area.
///
/// If `stop` becomes true between passes the image is left untouched and
/// the call returns early; the caller owns cancellation semantics.
pub fn gaussian_box_blur(
    img: &mut FloatImage,
    radius: f32,
    stop: &AtomicBool,
) -> Result<(), PixError> {
    if img.is_empty() {
        return Ok(());
    }
    let box_width = box_width_for_radius(radius);
    let border = (box_width.ceil() as usize) * 3;

    let mut padded = FloatImage::new();
    padded.alloc(img.width() + border * 2, img.height() + border * 2, img.dim())?;
    padded.draw_image(img, border as i32, border as i32)?;

    // Repeat the border pixels outward. The padding itself gets blurred
    // by every pass, which is what the reference edge behaviour does.
    let (pw, ph, dim) = (padded.width(), padded.height(), padded.dim());
    for y in 0..ph {
        let cy = y.clamp(border, ph - border - 1);
        let interior_row = y >= border && y + border < ph;
        for x in 0..pw {
            if interior_row && x >= border && x + border < pw {
                continue;
            }
            let cx = x.clamp(border, pw - border - 1);
            for v in 0..dim {
                let s = padded.at(cx, cy, v);
                *padded.at_mut(x, y, v) = s;
            }
        }
    }

    for horizontal in [true, true, true, false, false, false] {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        box_blur(&mut padded, box_width, horizontal)?;
    }

    img.draw_image(&padded, -(border as i32), -(border as i32))
}
