use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use screenplate::render::renderer::{RenderVariant, Renderer};
use screenplate::stitch::{StitchProject, StitchingParams};
use screenplate::{Caches, Image, ImageMetadata, Linearization, Progress, ScrToImg};

/// Reconstruct color photographs from scans of additive screen plates.
#[derive(Parser, Debug)]
#[command(name = "plate")]
#[command(about = "Render and stitch color-screen plate scans")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose tracing (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Original,
    Preview,
    Realistic,
    Fast,
    Interpolated,
    Predictive,
    Combined,
    Diff,
}

impl Mode {
    fn variant(self) -> RenderVariant {
        match self {
            Mode::Original => RenderVariant::Original,
            Mode::Preview => RenderVariant::PreviewGrid,
            Mode::Realistic => RenderVariant::Realistic,
            Mode::Fast => RenderVariant::Fast,
            Mode::Interpolated => RenderVariant::Interpolated { original_color: false },
            Mode::Predictive => RenderVariant::Predictive,
            Mode::Combined => RenderVariant::Combined,
            Mode::Diff => RenderVariant::Diff,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render one scan using a CSP project file.
    Render {
        /// Input scan (TIFF/PNG, 16-bit preferred)
        scan: PathBuf,
        /// CSP project with screen and render parameters
        #[arg(short, long)]
        project: PathBuf,
        /// Output TIFF
        #[arg(short, long, default_value = "out.tif")]
        output: PathBuf,
        /// Render mode
        #[arg(short, long, default_value = "interpolated")]
        mode: Mode,
        /// Output step in input pixels per output pixel
        #[arg(short, long, default_value_t = 1.0)]
        step: f64,
    },
    /// Detect the screen lattice of a scan and write a CSP project.
    Detect {
        scan: PathBuf,
        #[arg(short, long, default_value = "detected.csp")]
        output: PathBuf,
        /// Screen type to assume
        #[arg(short = 't', long, default_value = "Dufay")]
        screen_type: String,
    },
    /// Stitch a grid of scans described by a CSP stitch project.
    Stitch {
        project: PathBuf,
        #[arg(short, long, default_value = "stitched.tif")]
        output: PathBuf,
        /// Also write per-overlap diff images and enforce thresholds
        #[arg(long)]
        diffs: bool,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Decode a scan with the `image` crate; 16-bit stays 16-bit.
fn load_scan(path: &Path) -> Result<Image> {
    let decoded = image::open(path)
        .with_context(|| format!("cannot decode {}", path.display()))?;
    let metadata = ImageMetadata::default();
    let img = match decoded {
        image::DynamicImage::ImageLuma16(gray) => Image::load(
            gray.width(),
            gray.height(),
            65535,
            Some(gray.into_raw()),
            None,
            metadata,
        ),
        image::DynamicImage::ImageRgb16(rgb) => Image::load(
            rgb.width(),
            rgb.height(),
            65535,
            None,
            Some(rgb.into_raw()),
            metadata,
        ),
        image::DynamicImage::ImageLuma8(gray) => {
            let (w, h) = (gray.width(), gray.height());
            let data = gray.into_raw().into_iter().map(|v| v as u16 * 257).collect();
            Image::load(w, h, 65535, Some(data), None, metadata)
        }
        other => {
            let rgb = other.to_rgb16();
            let (w, h) = (rgb.width(), rgb.height());
            Image::load(w, h, 65535, None, Some(rgb.into_raw()), metadata)
        }
    }?;
    Ok(img)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let caches = Caches::new();

    match args.command {
        Command::Render {
            scan,
            project,
            output,
            mode,
            step,
        } => {
            let data = screenplate::csp::load_file(&project)?;
            let mut img = load_scan(&scan)?;
            img.linearize(Linearization::Gamma(data.render.gamma))?;
            let map = ScrToImg::new(data.scr.clone())?;
            let mut renderer = Renderer::new(
                &caches,
                &img,
                map,
                data.render.clone(),
                mode.variant(),
                65535,
            )?;
            let progress = Progress::new();
            renderer.precompute_all(Some(&progress))?;

            let out_w = (img.width() as f64 / step).round() as usize;
            let out_h = (img.height() as f64 / step).round() as usize;
            let mut pixels = vec![0u16; out_w * out_h * 3];
            progress.set_task("rendering", out_h);
            for y in 0..out_h {
                for x in 0..out_w {
                    let [r, g, b] =
                        renderer.render_pixel_img(x as f64 * step, y as f64 * step);
                    let o = (y * out_w + x) * 3;
                    pixels[o] = r;
                    pixels[o + 1] = g;
                    pixels[o + 2] = b;
                }
                progress.inc_progress();
            }
            screenplate::tiff::TiffWriter::new(&output).write_rgb16(
                out_w as u32,
                out_h as u32,
                &pixels,
            )?;
            println!("wrote {}", output.display());
        }
        Command::Detect {
            scan,
            output,
            screen_type,
        } => {
            let Some(ty) = screenplate::ScreenType::from_name(&screen_type) else {
                bail!("unknown screen type: {screen_type}");
            };
            let img = load_scan(&scan)?;
            let dparams = screenplate::detect::ScrDetectParameters::default();
            let detected = screenplate::detect::detect_screen(&img, &dparams, None, ty, None)?;
            let data = screenplate::csp::CspData {
                scr: detected.params,
                detect: Some(dparams),
                ..Default::default()
            };
            screenplate::csp::save_file(&output, &data)?;
            println!(
                "detected {} screen, pixel size {:.4}; wrote {}",
                screen_type,
                detected.pixel_size,
                output.display()
            );
        }
        Command::Stitch {
            project,
            output,
            diffs,
        } => {
            let data = screenplate::csp::load_file(&project)?;
            if data.stitch_tiles.is_empty() {
                bail!("{} contains no stitch_image records", project.display());
            }
            let cols = data.stitch_tiles.iter().map(|t| t.col).max().unwrap_or(0) as usize + 1;
            let rows = data.stitch_tiles.iter().map(|t| t.row).max().unwrap_or(0) as usize + 1;
            let mut filenames = vec![vec![PathBuf::new(); cols]; rows];
            for t in &data.stitch_tiles {
                filenames[t.row as usize][t.col as usize] = PathBuf::from(&t.filename);
            }
            let params = StitchingParams {
                screen_type: data.scr.screen_type,
                filenames,
                diffs,
                workdir: Some(std::env::temp_dir()),
                ..Default::default()
            };
            let gamma = data.render.gamma;
            let mut prj = StitchProject::new(
                params,
                data.render.clone(),
                data.detect.clone().unwrap_or_default(),
                &caches,
                Box::new(move |path| {
                    let mut img = load_scan(path).map_err(|e| {
                        screenplate::CoreError::load(path.display().to_string(), e.to_string())
                    })?;
                    img.linearize(Linearization::Gamma(gamma))?;
                    Ok(img)
                }),
            )?;
            let progress = Progress::new();
            prj.determine_positions(Some(&progress))?;
            if diffs {
                prj.write_diffs(&output, Some(&progress))?;
            }
            prj.write_stitched(&output, Some(&progress))?;
            println!("wrote {}", output.display());
        }
    }
    Ok(())
}
