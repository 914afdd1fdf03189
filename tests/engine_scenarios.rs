//! End-to-end controller scenarios over the in-process engine.

mod common;

use std::time::{Duration, Instant};

use aniso::controller::Controller;
use aniso::{EngineError, Pipeline, UnsharpSettings};
use aniso_pix::IntImage;
use common::*;

/// S1: iterations = 0 leaves the image bit-identical.
#[test]
fn s1_identity_with_zero_iterations() {
    let image = constant_image(32, 32, 3, 128);
    let reference = image.clone();

    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.settings.iterations = 0;
    let out = run_and_fetch(&mut engine, image);
    assert_eq!(out, reference.bytes());
}

/// S2: one iteration over noise actually smooths, without blowing any
/// pixel across half the range.
#[test]
fn s2_single_block_smooths_noise() {
    let image = noise_image(100, 100, 3, 42);
    let input_dev = stddev(&image);
    let reference = image.clone();

    let mut engine = Controller::new();
    engine.settings = s2_settings();
    let out = run_and_fetch(&mut engine, image);
    let out_img =
        IntImage::from_vec(out, 100, 100, 1, 3, 300).unwrap();

    assert!(
        stddev(&out_img) < input_dev,
        "output deviation {} not below input {}",
        stddev(&out_img),
        input_dev
    );
    assert!(max_abs_diff(&out_img, &reference) <= 128);
    // Something must actually have happened.
    assert!(max_abs_diff(&out_img, &reference) > 0);
}

/// S3: forcing a multi-block tiling changes the result by at most one
/// grey level against the single-block run; the overlap archive is what
/// keeps the seams invisible.
#[test]
fn s3_tile_boundaries_match_single_block() {
    let image = noise_image(3000, 100, 3, 42);

    let mut single = Controller::new();
    single.settings = s2_settings();
    let reference = run_and_fetch(&mut single, image.clone());

    let mut tiled = Controller::new();
    tiled.settings = s2_settings();
    tiled.options.block_pixel_limit = 100_000;
    let out = run_and_fetch(&mut tiled, image);

    let max_diff = reference
        .iter()
        .zip(&out)
        .map(|(&a, &b)| a.abs_diff(b))
        .max()
        .unwrap();
    assert!(max_diff <= 1, "tile seams diverged by {} grey levels", max_diff);
}

/// S4: abort mid-run returns promptly, reports no error, and a fresh run
/// afterwards produces the undisturbed result.
#[test]
fn s4_abort_is_clean_and_rerunnable() {
    let image = noise_image(400, 400, 3, 42);

    let mut reference_engine = Controller::new();
    reference_engine.settings = s2_settings();
    let reference = run_and_fetch(&mut reference_engine, image.clone());

    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.set_target(image.clone());
    engine.run().unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    while engine.progress() < 0.1 && !engine.finished() {
        assert!(Instant::now() < deadline, "never reached 10% progress");
        std::thread::sleep(Duration::from_millis(1));
    }
    engine.abort();
    assert_eq!(engine.error(), None);

    let rerun = run_and_fetch(&mut engine, image);
    assert_eq!(rerun, reference, "rerun after abort diverged");
}

/// S6: with a half mask, the masked side is bit-identical to the source
/// and the active side is processed.
#[test]
fn s6_half_mask_leaves_masked_side_untouched() {
    let image = noise_image(100, 100, 3, 42);
    let reference = image.clone();

    let mut mask = IntImage::alloc(100, 100, 1, 1).unwrap();
    for y in 0..100 {
        for x in 50..100 {
            let i = y * mask.stride_bytes() + x;
            mask.bytes_mut()[i] = 255;
        }
    }

    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.set_mask(mask);
    let out = run_and_fetch(&mut engine, image);
    let out_img = IntImage::from_vec(out, 100, 100, 1, 3, 300).unwrap();

    let mut changed_right = 0;
    for y in 0..100 {
        for x in 0..100 {
            for c in 0..3 {
                let a = out_img.bytes()[y * 300 + x * 3 + c];
                let b = reference.bytes()[y * 300 + x * 3 + c];
                if x < 50 {
                    assert_eq!(a, b, "masked pixel changed at {},{}", x, y);
                } else if a != b {
                    changed_right += 1;
                }
            }
        }
    }
    assert!(changed_right > 0, "active side was not processed");
}

/// A uniformly active mask must not change the result at all.
#[test]
fn uniform_mask_matches_no_mask() {
    let image = noise_image(64, 64, 3, 7);

    let mut plain = Controller::new();
    plain.settings = s2_settings();
    let reference = run_and_fetch(&mut plain, image.clone());

    let mut masked = Controller::new();
    masked.settings = s2_settings();
    masked.set_mask(constant_image(64, 64, 1, 255));
    let out = run_and_fetch(&mut masked, image);

    assert_eq!(out, reference);
}

/// An all-zero mask prunes every block; the output is the input.
#[test]
fn all_zero_mask_is_a_no_op() {
    let image = noise_image(64, 64, 3, 9);
    let reference = image.clone();

    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.set_mask(constant_image(64, 64, 1, 0));
    let out = run_and_fetch(&mut engine, image);

    assert_eq!(out, reference.bytes());
}

/// A 1x1 image survives the full pipeline unchanged.
#[test]
fn one_by_one_image_is_returned_unchanged() {
    let image = constant_image(1, 1, 3, 77);
    let mut engine = Controller::new();
    engine.settings = s2_settings();
    let out = run_and_fetch(&mut engine, image);
    assert_eq!(out, vec![77, 77, 77]);
}

/// Non-positive discretisation parameters surface through error(), not
/// as a hang or a panic.
#[test]
fn invalid_discretisation_reports_through_error() {
    let image = noise_image(32, 32, 3, 3);
    let reference = image.clone();

    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.settings.da = 0.0;
    engine.set_target(image);
    engine.run().unwrap();
    wait_finished(&engine);

    match engine.error() {
        Some(EngineError::Validation(_)) => {}
        other => panic!("expected a validation error, got {:?}", other),
    }
    // Consumed: the next query is clean.
    assert_eq!(engine.error(), None);
    // And the image was not touched.
    let out = engine.with_result(|img| img.bytes().to_vec()).unwrap();
    assert_eq!(out, reference.bytes());
}

/// Starting a second run while one is in flight is an illegal state.
#[test]
fn run_while_running_is_rejected() {
    let image = noise_image(500, 500, 3, 11);
    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.set_target(image);
    engine.run().unwrap();

    match engine.run() {
        Err(EngineError::Validation(msg)) => assert!(msg.contains("already running")),
        other => panic!("expected already-running rejection, got {:?}", other),
    }
    engine.abort();
    assert_eq!(engine.error(), None);
}

/// Mask and image dimensions must agree.
#[test]
fn mask_dimension_mismatch_is_rejected() {
    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.set_target(noise_image(32, 32, 3, 1));
    engine.set_mask(constant_image(16, 16, 1, 255));
    assert!(matches!(engine.run(), Err(EngineError::Validation(_))));
}

/// The unsharp pipeline runs through the same framework and sharpens an
/// edge.
#[test]
fn unsharp_pipeline_sharpens() {
    let mut image = IntImage::alloc(64, 16, 1, 3).unwrap();
    for y in 0..16 {
        for x in 0..64 {
            let v = if x < 32 { 80u8 } else { 170 };
            for c in 0..3 {
                let i = y * image.stride_bytes() + x * 3 + c;
                image.bytes_mut()[i] = v;
            }
        }
    }

    let mut engine = Controller::new();
    engine.pipeline = Pipeline::Unsharp(UnsharpSettings {
        amount_up: 1.0,
        amount_down: 1.0,
        ..UnsharpSettings::default()
    });
    let out = run_and_fetch(&mut engine, image);
    let out_img = IntImage::from_vec(out, 64, 16, 1, 3, 192).unwrap();

    // Overshoot on both sides of the edge.
    assert!(out_img.at(31, 8) < 80, "dark side was {}", out_img.at(31, 8));
    assert!(out_img.at(33, 8) > 170, "bright side was {}", out_img.at(33, 8));
}

/// Multi-threaded runs agree with the single-threaded reference; the row
/// dispatcher and barriers must make thread count invisible.
#[test]
fn thread_count_does_not_change_the_result() {
    let image = noise_image(120, 90, 3, 21);

    let mut one = Controller::new();
    one.settings = s2_settings();
    one.options.threads = 1;
    let reference = run_and_fetch(&mut one, image.clone());

    let mut four = Controller::new();
    four.settings = s2_settings();
    four.options.threads = 4;
    let out = run_and_fetch(&mut four, image);

    assert_eq!(out, reference);
}

/// Partial-stage output (diagnostic taps) returns an intermediate and
/// still terminates cleanly.
#[test]
fn partial_stage_output_terminates() {
    for stage in 1..=5 {
        let image = noise_image(48, 48, 3, 5);
        let mut engine = Controller::new();
        engine.settings = s2_settings();
        engine.settings.pre_blur = 1.0;
        engine.settings.partial_stage_output = stage;
        let out = run_and_fetch(&mut engine, image);
        assert_eq!(out.len(), 48 * 48 * 3);
    }
}

/// Progress is monotonic and lands at 1.0.
#[test]
fn progress_is_monotonic() {
    let image = noise_image(300, 300, 3, 13);
    let mut engine = Controller::new();
    engine.settings = s2_settings();
    engine.set_target(image);
    engine.run().unwrap();

    let mut last = 0.0f32;
    while !engine.finished() {
        let p = engine.progress();
        assert!(p >= last, "progress went backwards: {} -> {}", last, p);
        assert!((0.0..=1.0).contains(&p));
        last = p;
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(engine.progress(), 1.0);
    assert_eq!(engine.error(), None);
}
