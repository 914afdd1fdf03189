use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use aniso::controller::Controller;
use aniso::{Interpolation, Pipeline, UnsharpSettings};
use aniso_pix::IntImage;

/// Anisotropic denoise/sharpen engine.
///
/// In file mode the named image is processed in place of a hosting
/// application. With --server the process speaks the binary command
/// protocol on stdin/stdout instead; that mode is spawned automatically
/// by hosts and is not meant to be driven by hand.
#[derive(Parser, Debug)]
#[command(name = "anisod")]
#[command(about = "Anisotropic smoothing engine: denoise or sharpen an image")]
struct Args {
    /// Run as a worker process on stdin/stdout.
    #[arg(long)]
    server: bool,

    /// Input image (anything the image crate can read).
    input: Option<PathBuf>,

    /// Output path; defaults to the input with a .out.png suffix.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Processing mode: "denoise" (anisotropic diffusion) or "sharpen"
    /// (unsharp mask).
    #[arg(short, long, default_value = "denoise")]
    mode: String,

    /// Worker threads: 0 = one per CPU, negative = that many fewer.
    #[arg(short, long, default_value_t = 0)]
    threads: i32,

    /// Smoothing amplitude (denoise).
    #[arg(long, default_value_t = 60.0)]
    amplitude: f32,

    /// Contour preservation (denoise).
    #[arg(long, default_value_t = 0.7)]
    sharpness: f32,

    /// Smoothing anisotropy in [0,1] (denoise).
    #[arg(long, default_value_t = 0.3)]
    anisotropy: f32,

    /// Tensor pre-blur sigma (denoise).
    #[arg(long, default_value_t = 0.6)]
    alpha: f32,

    /// Tensor-field regularity sigma (denoise).
    #[arg(long, default_value_t = 1.1)]
    sigma: f32,

    /// Smoothing iterations (denoise).
    #[arg(long, default_value_t = 1)]
    iterations: i32,

    /// Interpolation: "nearest", "linear" or "rk2" (denoise).
    #[arg(long, default_value = "nearest")]
    interpolation: String,

    /// Gaussian pre-blur radius before the first iteration (denoise).
    #[arg(long, default_value_t = 0.0)]
    pre_blur: f32,

    /// Exact gaussian weighting instead of the fast approximation
    /// (denoise).
    #[arg(long)]
    precise: bool,

    /// Blur radius (sharpen).
    #[arg(long, default_value_t = 5.0)]
    radius: f32,

    /// Sharpening amount (sharpen).
    #[arg(long, default_value_t = 0.5)]
    amount: f32,

    /// Difference threshold below which pixels are left alone (sharpen).
    #[arg(long, default_value_t = 0.0)]
    threshold: f32,

    /// Gamma applied around the blur (sharpen).
    #[arg(long, default_value_t = 1.8)]
    gamma: f32,
}

fn parse_interpolation(name: &str) -> Result<Interpolation> {
    match name {
        "nearest" => Ok(Interpolation::Nearest),
        "linear" => Ok(Interpolation::Linear),
        "rk2" => Ok(Interpolation::RungeKutta),
        other => Err(anyhow!("unknown interpolation {:?}; use nearest, linear or rk2", other)),
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    if args.server {
        return aniso::bridge::server::run_server().map_err(Into::into);
    }

    let input = args
        .input
        .as_ref()
        .ok_or_else(|| anyhow!("an input image is required (or --server)"))?;
    let output = args.output.clone().unwrap_or_else(|| input.with_extension("out.png"));

    let rgb = image::open(input)
        .with_context(|| format!("opening {}", input.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let source = IntImage::from_vec(
        rgb.into_raw(),
        width as usize,
        height as usize,
        1,
        3,
        width as usize * 3,
    )
    .map_err(|e| anyhow!("{}", e))?;

    let mut engine = Controller::new();
    engine.options.threads = args.threads;
    engine.set_target(source);

    match args.mode.as_str() {
        "denoise" => {
            engine.settings.amplitude = args.amplitude;
            engine.settings.sharpness = args.sharpness;
            engine.settings.anisotropy = args.anisotropy;
            engine.settings.alpha = args.alpha;
            engine.settings.sigma = args.sigma;
            engine.settings.iterations = args.iterations;
            engine.settings.pre_blur = args.pre_blur;
            engine.settings.fast_approx = !args.precise;
            engine.settings.interpolation = parse_interpolation(&args.interpolation)?;
        }
        "sharpen" => {
            engine.pipeline = Pipeline::Unsharp(UnsharpSettings {
                radius: args.radius,
                amount_up: args.amount,
                amount_down: args.amount,
                threshold: args.threshold,
                gamma: args.gamma,
                ..UnsharpSettings::default()
            });
        }
        other => return Err(anyhow!("unknown mode {:?}; use denoise or sharpen", other)),
    }

    engine.run().map_err(|e| anyhow!("{}", e))?;
    while !engine.finished() {
        std::thread::sleep(Duration::from_millis(100));
        log::info!("progress: {:.0}%", engine.progress() * 100.0);
    }
    if let Some(err) = engine.error() {
        return Err(anyhow!("{}", err));
    }

    let result = engine.take_target().ok_or_else(|| anyhow!("engine kept the image"))?;
    let buffer = image::RgbImage::from_raw(width, height, result.bytes().to_vec())
        .ok_or_else(|| anyhow!("result buffer has the wrong size"))?;
    buffer.save(&output).with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(())
}
