//! # aniso
//!
//! An image-denoising/sharpening engine built around two anisotropic-
//! smoothing pipelines: structure-tensor-driven diffusion, and an
//! unsharp mask with tonal weighting.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────────────────┐
//! │ Controller │──▶│ Block Tiler │──▶│ Worker Pool               │
//! │  (async)   │   │ (overlaps)  │   │  primary + N-1 auxiliary  │
//! └────────────┘   └─────────────┘   │  stage barrier            │
//!        ▲                           │  row dispatcher           │
//!        │ pipes                     │  diffusion / unsharp      │
//! ┌────────────┐                     └──────────────────────────┘
//! │ Host bridge│  client ◀─── length-framed protocol ───▶ server
//! └────────────┘
//! ```
//!
//! The [`controller::Controller`] accepts a source image, a mask and the
//! tuning records, then runs the selected pipeline over overlapping
//! blocks with a pool of stage-synchronised workers. The
//! [`bridge`] hosts the same controller behind a command protocol in a
//! separate process, which is how a host with a non-thread-safe
//! allocator (or a flaky GPU driver) stays insulated from the engine.
//!
//! Pixel buffers and the separable blurs live in the `aniso-pix`
//! sub-crate.
//!
//! ## Example
//!
//! ```no_run
//! use aniso::controller::Controller;
//! use aniso_pix::IntImage;
//!
//! fn denoise(image: IntImage) -> IntImage {
//!     let mut engine = Controller::new();
//!     engine.set_target(image);
//!     engine.settings.amplitude = 40.0;
//!     engine.run().expect("start");
//!     while !engine.finished() {
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//!     engine.take_target().expect("engine is idle")
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod tiler;

pub use config::{DisplayMode, Interpolation, Options, Pipeline, Settings, UnsharpSettings};
pub use controller::Controller;
pub use error::{Cancelled, EngineError};
