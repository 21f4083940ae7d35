// Blacklight CLI driver
//
// Takes a single input file, runs the full ray-tracing pipeline, and writes
// the image pyramid. Any construction or I/O failure prints one line and
// exits nonzero.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use blacklight::{Pipeline, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "blacklight")]
#[command(about = "General-relativistic radiative-transfer renderer", long_about = None)]
struct Args {
    /// Path to the input file
    input: PathBuf,
}

fn run(args: &Args) -> Result<()> {
    let config = RunConfig::from_file(&args.input)?;
    let resolution = config.camera.resolution;
    let mut pipeline = Pipeline::new(config)?;

    // Per-ray progress for the root level
    let total_pixels = (resolution * resolution) as u64;
    let bar = ProgressBar::new(total_pixels);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rays")?
            .progress_chars("=> "),
    );
    {
        let bar = bar.clone();
        pipeline.set_progress(Arc::new(move |count| {
            if count <= total_pixels {
                bar.set_position(count);
            }
        }));
    }

    pipeline.run()?;
    bar.finish_and_clear();
    pipeline.write_output()?;

    let (time_geodesic, time_sample, time_integrate) = pipeline.times();
    let stats = pipeline.stats();
    println!("Geodesic integration: {time_geodesic:.3} s");
    println!("Sampling:             {time_sample:.3} s");
    println!("Transfer integration: {time_integrate:.3} s");
    println!("Refinement levels:    {}", pipeline.num_levels());
    if stats.flagged_rays > 0 {
        println!("Flagged rays:         {}", stats.flagged_rays);
    }
    if stats.clamped_pixels > 0 {
        println!("Clamped pixels:       {}", stats.clamped_pixels);
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if let Err(error) = run(&args) {
        println!("Error: {error}");
        std::process::exit(1);
    }
}
