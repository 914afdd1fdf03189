//! # Unsharp mask with tonal weighting
//!
//! The sharpening variant: blur a copy of the tile with the three-term
//! IIR gaussian, then push each channel away from the blurred version
//! wherever the difference clears the threshold. The push is scaled by a
//! piecewise-linear factor over the pixel's luminance band (shadow /
//! midtone / light / highlight) and damped by `sqrt` of the headroom, so
//! highlights are not blown out and shadows are not crushed.
//!
//! Works on pixels in `[0, 1]`; the tile is brought into that range from
//! its `[0, 255]`-scaled form on entry and restored on exit.

use aniso_pix::{iir::iir_blur, FloatImage};

use crate::config::UnsharpSettings;
use crate::core::sync::PoolSync;
use crate::error::{Cancelled, StageAbort};

// Luminance weights for 3- and 4-channel images. Anything else gets a
// plain channel average, which is all we can do without knowing the
// colour model.
const FR: f32 = 0.212671;
const FG: f32 = 0.715160;
const FB: f32 = 0.072169;

/// Tone response: linear interpolation of the band factors across the
/// four luminance quarters.
fn noise_factor(value: f32, shadow: f32, midtone: f32, light: f32, high: f32) -> f32 {
    if value <= 0.25 {
        shadow
    } else if value <= 0.5 {
        let v = (0.5 - value) / 0.25;
        shadow * v + midtone * (1.0 - v)
    } else if value <= 0.75 {
        let v = (0.75 - value) / 0.25;
        midtone * v + light * (1.0 - v)
    } else {
        let v = (1.0 - value) / 0.25;
        light * v + high * (1.0 - v)
    }
}

fn apply_gamma(img: &mut FloatImage, gamma: f32, sync: &PoolSync) -> Result<(), Cancelled> {
    for y in 0..img.height() {
        sync.check_cancel()?;
        sync.tick();
        for v in img.row_mut(y) {
            *v = v.powf(gamma);
        }
    }
    Ok(())
}

/// Merge the source and the blurred copy (held in `dest`); `dest` ends up
/// holding the sharpened result.
#[allow(clippy::too_many_arguments)]
fn combine(
    img: &FloatImage,
    dest: &mut FloatImage,
    amount_up: f32,
    amount_down: f32,
    threshold: f32,
    shadow: f32,
    midtone: f32,
    light: f32,
    high: f32,
    sync: &PoolSync,
) -> Result<(), Cancelled> {
    let dim = img.dim();
    for y in 0..img.height() {
        sync.check_cancel()?;
        sync.tick();
        for x in 0..img.width() {
            let lum = if dim == 3 || dim == 4 {
                FR * img.at(x, y, 0) + FG * img.at(x, y, 1) + FB * img.at(x, y, 2)
            } else {
                let mut sum = 0.0;
                for v in 0..dim {
                    sum += img.at(x, y, v);
                }
                sum / dim as f32
            };
            let a = noise_factor(lum, shadow, midtone, light, high);

            for v in 0..dim {
                let mut value = img.at(x, y, v);
                let dvalue = dest.at(x, y, v);
                let mut diff = value - dvalue;

                if diff > threshold {
                    diff -= threshold;
                    value += diff * a * amount_up * (1.0 - value).max(0.0).sqrt();
                } else if diff < -threshold {
                    diff += threshold;
                    value += diff * a * amount_down * value.max(0.0).sqrt();
                }

                *dest.at_mut(x, y, v) = value.clamp(0.0, 1.0);
            }
        }
    }
    Ok(())
}

/// The full unsharp pass over one `[0, 1]`-ranged tile: optional gamma,
/// separable IIR blur, inverse gamma, clamp, tone-weighted combine.
/// `dest` receives the result.
fn unsharp_region(
    img: &FloatImage,
    dest: &mut FloatImage,
    s: &UnsharpSettings,
    sync: &PoolSync,
) -> Result<(), StageAbort> {
    dest.alloc_with_stride(img.width(), img.height(), img.dim(), img.stride())?;
    dest.data_mut().copy_from_slice(img.data());

    if s.gamma != 1.0 {
        apply_gamma(dest, s.gamma, sync)?;
    }

    iir_blur(dest, s.radius, || {
        if sync.stopping() {
            return false;
        }
        sync.tick();
        true
    })?;
    sync.check_cancel()?;

    if s.gamma != 1.0 {
        apply_gamma(dest, 1.0 / s.gamma, sync)?;
    }

    for v in dest.data_mut() {
        *v = v.clamp(0.0, 1.0);
    }

    combine(
        img,
        dest,
        s.amount_up,
        s.amount_down,
        s.threshold,
        s.shadow,
        s.midtone,
        s.light,
        s.high,
        sync,
    )?;
    Ok(())
}

/// Process one working tile in place. Primary worker only; the row
/// passes inside are cheap enough that fanning them out is not worth the
/// barrier traffic.
pub(crate) fn unsharp_tile(
    img: &mut FloatImage,
    dest: &mut FloatImage,
    s: &UnsharpSettings,
    sync: &PoolSync,
) -> Result<(), StageAbort> {
    let scale = s.input_scale / 255.0;
    img.scale(scale);
    unsharp_region(img, dest, s, sync)?;
    img.swap(dest);
    img.scale(1.0 / scale);
    Ok(())
}

/// Progress denominator for one unsharp run over the given tiling.
pub(crate) fn progress_denominator(s: &UnsharpSettings, total_rows: usize, total_cols: usize) -> u64 {
    let mut max = 0u64;
    if s.gamma != 1.0 {
        max += total_rows as u64 * 2;
    }
    max += total_rows as u64; // horizontal blur
    max += total_cols as u64; // vertical blur
    max += total_rows as u64; // combine
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_sync() -> PoolSync {
        let sync = PoolSync::new();
        sync.begin_run(1);
        sync
    }

    #[test]
    fn noise_factor_interpolates_bands() {
        assert_eq!(noise_factor(0.1, 2.0, 1.0, 0.5, 0.0), 2.0);
        assert!((noise_factor(0.375, 2.0, 1.0, 0.5, 0.0) - 1.5).abs() < 1e-6);
        assert!((noise_factor(0.625, 2.0, 1.0, 0.5, 0.0) - 0.75).abs() < 1e-6);
        assert!((noise_factor(1.0, 2.0, 1.0, 0.5, 0.0) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn flat_tile_is_unchanged() {
        let sync = idle_sync();
        let mut img = FloatImage::new();
        img.alloc(16, 16, 4).unwrap();
        img.fill(128.0);
        let mut dest = FloatImage::new();
        unsharp_tile(&mut img, &mut dest, &UnsharpSettings::default(), &sync).unwrap();
        for y in 0..16 {
            for x in 0..16 {
                assert!((img.at(x, y, 0) - 128.0).abs() < 0.1);
            }
        }
    }

    #[test]
    fn edge_contrast_increases() {
        let sync = idle_sync();
        let mut img = FloatImage::new();
        img.alloc(32, 8, 3).unwrap();
        for y in 0..8 {
            for x in 0..32 {
                let v = if x < 16 { 64.0 } else { 192.0 };
                for c in 0..3 {
                    *img.at_mut(x, y, c) = v;
                }
            }
        }
        let mut dest = FloatImage::new();
        let mut s = UnsharpSettings::default();
        s.amount_up = 1.0;
        s.amount_down = 1.0;
        unsharp_tile(&mut img, &mut dest, &s, &sync).unwrap();
        // The dark side of the edge darkens, the bright side brightens.
        assert!(img.at(15, 4, 0) < 64.0 + 0.1);
        assert!(img.at(14, 4, 0) < 64.0);
        assert!(img.at(17, 4, 0) > 192.0);
    }

    #[test]
    fn threshold_suppresses_small_differences() {
        let sync = idle_sync();
        let mut img = FloatImage::new();
        img.alloc(16, 4, 1).unwrap();
        for y in 0..4 {
            for x in 0..16 {
                // A one-grey-level ripple.
                *img.at_mut(x, y, 0) = if x % 2 == 0 { 128.0 } else { 129.0 };
            }
        }
        let before = img.clone();
        let mut dest = FloatImage::new();
        let mut s = UnsharpSettings::default();
        s.gamma = 1.0;
        s.threshold = 0.1; // far above the ripple in [0,1] units
        s.amount_up = 2.0;
        s.amount_down = 2.0;
        unsharp_tile(&mut img, &mut dest, &s, &sync).unwrap();
        for x in 0..16 {
            assert!((img.at(x, 2, 0) - before.at(x, 2, 0)).abs() < 0.2);
        }
    }

    #[test]
    fn denominator_counts_row_passes() {
        let s = UnsharpSettings::default(); // gamma 1.8: two gamma passes
        assert_eq!(progress_denominator(&s, 100, 40), 100 * 2 + 100 + 40 + 100);
        let mut s = s;
        s.gamma = 1.0;
        assert_eq!(progress_denominator(&s, 100, 40), 100 + 40 + 100);
    }
}
