// Image-pyramid output: JSON manifest plus raw little-endian payloads

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::channels::ChannelSchema;
use crate::error::{BlacklightError, Result};
use crate::pyramid::ImagePyramid;

#[derive(Debug, Clone, Serialize)]
pub struct LevelManifest {
    pub level: usize,
    // Tile (i, j) indices in this level's tile grid
    pub tiles: Vec<[u32; 2]>,
    pub num_pix: usize,
    pub file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub resolution: usize,
    pub block_size: usize,
    pub spin: f64,
    pub mass_msun: f64,
    pub image_frequency: f64,
    pub channels: Vec<String>,
    pub levels: Vec<LevelManifest>,
    pub assembled_file: String,
    pub num_renders: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rustc_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_timestamp: Option<String>,
}

// Raw little-endian f64 payload, optionally gzipped
fn write_binary(path: &PathBuf, data: &[f64], gzip: bool) -> Result<()> {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    if gzip {
        let file = fs::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?;
    } else {
        fs::write(path, bytes)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn write_output(
    dir: &Path,
    gzip: bool,
    pyramid: &ImagePyramid,
    schema: &ChannelSchema,
    spin: f64,
    mass_msun: f64,
    image_frequency: f64,
    num_renders: usize,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    let suffix = if gzip { ".f64.gz" } else { ".f64" };

    let mut levels = Vec::new();
    for (level, data) in pyramid.populated_levels() {
        let file = format!("level_{level}{suffix}");
        let payload = data
            .image
            .as_slice()
            .ok_or_else(|| BlacklightError::Output("non-contiguous level image".to_string()))?;
        write_binary(&dir.join(&file), payload, gzip)?;
        if let Some(renders) = &data.renders {
            let render_file = format!("render_{level}{suffix}");
            let payload = renders.as_slice().ok_or_else(|| {
                BlacklightError::Output("non-contiguous render image".to_string())
            })?;
            write_binary(&dir.join(&render_file), payload, gzip)?;
        }
        levels.push(LevelManifest {
            level,
            tiles: data.tiles.iter().map(|t| [t.i, t.j]).collect(),
            num_pix: data.image.nrows(),
            file,
        });
    }

    // Root-grid assembly of every channel, stacked channel-major
    let assembled_file = format!("assembled{suffix}");
    let mut assembled = Vec::with_capacity(schema.len() * pyramid.resolution * pyramid.resolution);
    for channel in 0..schema.len() {
        let plane = pyramid.assemble(channel);
        assembled.extend(plane.iter().copied());
    }
    write_binary(&dir.join(&assembled_file), &assembled, gzip)?;

    let manifest = Manifest {
        resolution: pyramid.resolution,
        block_size: pyramid.block_size,
        spin,
        mass_msun,
        image_frequency,
        channels: schema.names(),
        levels,
        assembled_file,
        num_renders,
        git_sha: Some(env!("BLACKLIGHT_GIT_SHA").to_string()).filter(|s| s != "unknown"),
        rustc_version: Some(env!("BLACKLIGHT_RUSTC_VERSION").to_string())
            .filter(|s| s != "unknown"),
        build_timestamp: Some(env!("BLACKLIGHT_BUILD_TIMESTAMP").to_string())
            .filter(|s| s != "0"),
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| BlacklightError::Output(e.to_string()))?;
    fs::write(dir.join("manifest.json"), manifest_json)?;
    Ok(())
}
