//! Shared test fixtures: deterministic images and run helpers.

// Each integration target pulls in the subset of helpers it needs.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use aniso::controller::Controller;
use aniso::Settings;
use aniso_pix::IntImage;

/// Deterministic congruential generator so noise fixtures reproduce
/// bit-for-bit everywhere.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u8(&mut self) -> u8 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u8
    }
}

/// Uniform-noise 8-bit image from the given seed.
pub fn noise_image(width: usize, height: usize, channels: usize, seed: u64) -> IntImage {
    let mut rng = Lcg::new(seed);
    let mut img = IntImage::alloc(width, height, 1, channels).unwrap();
    for b in img.bytes_mut() {
        *b = rng.next_u8();
    }
    img
}

pub fn constant_image(width: usize, height: usize, channels: usize, value: u8) -> IntImage {
    let mut img = IntImage::alloc(width, height, 1, channels).unwrap();
    img.fill(value);
    img
}

/// Standard deviation over all bytes.
pub fn stddev(img: &IntImage) -> f64 {
    let bytes = img.bytes();
    let mean = bytes.iter().map(|&b| b as f64).sum::<f64>() / bytes.len() as f64;
    let var =
        bytes.iter().map(|&b| (b as f64 - mean).powi(2)).sum::<f64>() / bytes.len() as f64;
    var.sqrt()
}

pub fn max_abs_diff(a: &IntImage, b: &IntImage) -> u8 {
    a.bytes()
        .iter()
        .zip(b.bytes())
        .map(|(&x, &y)| x.abs_diff(y))
        .max()
        .unwrap_or(0)
}

/// The S2 reference settings: one smoothing iteration at moderate
/// amplitude, nearest-neighbour walk, fast approximation.
pub fn s2_settings() -> Settings {
    Settings {
        amplitude: 40.0,
        sharpness: 0.7,
        anisotropy: 0.3,
        alpha: 0.6,
        sigma: 1.1,
        dl: 0.8,
        da: 30.0,
        gauss_prec: 2.0,
        fast_approx: true,
        iterations: 1,
        ..Settings::default()
    }
}

/// Block until the controller reports completion; panics on a hang.
pub fn wait_finished(engine: &Controller) {
    let deadline = Instant::now() + Duration::from_secs(120);
    while !engine.finished() {
        assert!(Instant::now() < deadline, "engine did not finish in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Run to completion and return the processed bytes.
pub fn run_and_fetch(engine: &mut Controller, image: IntImage) -> Vec<u8> {
    engine.set_target(image);
    engine.run().expect("run should start");
    wait_finished(engine);
    assert_eq!(engine.error(), None);
    engine.with_result(|img| img.bytes().to_vec()).expect("engine is idle")
}
