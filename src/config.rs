//! # Run configuration
//!
//! Two kinds of records, mirroring their roles on the wire:
//!
//! - **Settings** affect the output: the diffusion tuning record
//!   ([`Settings`]) and the unsharp-mask variant ([`UnsharpSettings`]).
//! - **Options** do not affect the output: thread count, the GPU flag,
//!   display mode (UI pass-through) and the block pixel budget.
//!
//! All of them are plain bit-copyable records so they can cross the host
//! bridge unchanged. Validation happens once at run start; the defaults
//! here are the tuned values the filters ship with.

use crate::error::EngineError;

/// Interpolation scheme for the line-integral walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Nearest-neighbour sampling.
    #[default]
    Nearest,
    /// Bilinear sampling of image and vector field.
    Linear,
    /// Second-order Runge-Kutta: half-step predictor, bilinear correction.
    RungeKutta,
}

impl Interpolation {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Linear,
            2 => Self::RungeKutta,
            _ => Self::Nearest,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Nearest => 0,
            Self::Linear => 1,
            Self::RungeKutta => 2,
        }
    }
}

/// Diffusion-pipeline tuning parameters.
///
/// The parameters assume colour components in the usual `[0, 255]` range;
/// if the input arrives scaled differently, `input_scale` is the factor
/// that would bring it there (in practice it only scales `gfact`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub input_scale: f32,
    /// Gaussian pre-blur radius applied before the first iteration.
    pub pre_blur: f32,
    /// Amplitude of the anisotropic smoothing.
    pub amplitude: f32,
    /// Contour preservation.
    pub sharpness: f32,
    /// Smoothing anisotropy in `[0, 1]`.
    pub anisotropy: f32,
    /// Gaussian pre-blur (sigma) of the image the tensors are built from.
    pub alpha: f32,
    /// Regularity of the tensor-valued geometry.
    pub sigma: f32,
    /// Geometry factor; non-positive values request normalisation onto
    /// `[0, -gfact]` instead of scaling.
    pub gfact: f32,
    /// Spatial discretisation step.
    pub dl: f32,
    /// Angular discretisation step in degrees.
    pub da: f32,
    /// Precision of the gaussian arclength window.
    pub gauss_prec: f32,
    pub interpolation: Interpolation,
    /// Diagnostic stop point: 1-5 exit Stage A early and return the named
    /// intermediate, scaled for display. 0 runs the whole pipeline.
    pub partial_stage_output: i32,
    pub iterations: i32,
    /// Constant-weight accumulation instead of the gaussian window.
    pub fast_approx: bool,
    /// Rescale walk steps by the ratio of the starting field magnitude to
    /// the local one, curing ghosting at high amplitude.
    pub alt_amplitude: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_scale: 1.0,
            pre_blur: 0.0,
            amplitude: 60.0,
            sharpness: 0.7,
            anisotropy: 0.3,
            alpha: 0.6,
            sigma: 1.1,
            gfact: 1.0,
            dl: 0.8,
            da: 30.0,
            gauss_prec: 2.0,
            interpolation: Interpolation::Nearest,
            partial_stage_output: 0,
            iterations: 1,
            fast_approx: true,
            alt_amplitude: true,
        }
    }
}

impl Settings {
    /// The discretisation parameters must be positive or the angle and
    /// walk loops never terminate.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.dl <= 0.0 || self.da <= 0.0 || self.gauss_prec <= 0.0 {
            return Err(EngineError::Validation(
                "dl, da and gauss_prec must be positive".to_string(),
            ));
        }
        if self.iterations < 0 {
            return Err(EngineError::Validation("iterations must be >= 0".to_string()));
        }
        Ok(())
    }

    /// Compact description of every non-default parameter, for logs.
    pub fn summary(&self) -> String {
        let d = Settings::default();
        let mut out = String::new();
        let mut push = |flag: &str, value: f32| {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("{}{:.3}", flag, value));
        };
        if self.amplitude != d.amplitude {
            push("-dt ", self.amplitude);
        }
        if self.sharpness != d.sharpness {
            push("-p ", self.sharpness);
        }
        if self.anisotropy != d.anisotropy {
            push("-a ", self.anisotropy);
        }
        if self.alpha != d.alpha {
            push("-alpha ", self.alpha);
        }
        if self.sigma != d.sigma {
            push("-sigma ", self.sigma);
        }
        if self.pre_blur != d.pre_blur {
            push("-gauss ", self.pre_blur);
        }
        if self.iterations != d.iterations {
            push("-iter ", self.iterations as f32);
        }
        if self.gfact != d.gfact {
            push("-fact ", self.gfact);
        }
        if self.dl != d.dl {
            push("-dl ", self.dl);
        }
        if self.da != d.da {
            push("-da ", self.da);
        }
        if self.gauss_prec != d.gauss_prec {
            push("-prec ", self.gauss_prec);
        }
        if self.interpolation != d.interpolation {
            push("-interp ", self.interpolation.as_u32() as f32);
        }
        if self.fast_approx {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("-fast");
        }
        if self.alt_amplitude {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("-alt");
        }
        out
    }
}

/// Unsharp-mask variant tuning parameters. Tone weights are factors over
/// the shadow / midtone / light / highlight luminance bands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnsharpSettings {
    pub input_scale: f32,
    pub radius: f32,
    pub amount_up: f32,
    pub amount_down: f32,
    pub threshold: f32,
    pub gamma: f32,
    pub shadow: f32,
    pub midtone: f32,
    pub light: f32,
    pub high: f32,
}

impl Default for UnsharpSettings {
    fn default() -> Self {
        Self {
            input_scale: 1.0,
            radius: 5.0,
            amount_up: 0.5,
            amount_down: 0.0,
            threshold: 0.0,
            gamma: 1.8,
            shadow: 1.0,
            midtone: 1.0,
            light: 1.0,
            high: 1.0,
        }
    }
}

impl UnsharpSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.radius < 0.0 {
            return Err(EngineError::Validation("radius must be >= 0".to_string()));
        }
        if self.gamma <= 0.0 {
            return Err(EngineError::Validation("gamma must be positive".to_string()));
        }
        Ok(())
    }
}

/// Which pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Pipeline {
    #[default]
    Diffusion,
    Unsharp(UnsharpSettings),
}

/// Display mode, passed through for the UI; the engine never reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Single,
    Inside,
    SideBySide,
}

impl DisplayMode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Inside,
            2 => Self::SideBySide,
            _ => Self::Single,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Single => 0,
            Self::Inside => 1,
            Self::SideBySide => 2,
        }
    }
}

/// Configuration that does not affect the output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Options {
    /// Zero uses one thread per CPU; positive is an exact count; negative
    /// uses that many fewer threads than CPUs.
    pub threads: i32,
    /// Route through the GPU back-end where one is built in. Also clamps
    /// tile axes to the texture limit.
    pub gpu: bool,
    pub display_mode: DisplayMode,
    /// Override for the tiler's pixels-per-block budget; 0 keeps the
    /// 5-million default.
    pub block_pixel_limit: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threads: 0,
            gpu: false,
            display_mode: DisplayMode::Single,
            block_pixel_limit: 0,
        }
    }
}

impl Options {
    /// Resolve the thread-count rule against the CPUs actually present.
    pub fn resolved_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads as usize;
        }
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let n = cpus as i64 + self.threads as i64;
        n.max(1) as usize
    }
}
