// Binary checkpoints for geodesic and sample data
//
// File grammar, all little-endian:
//   magic "BLCK" | kind u8 | version u32 | resolution u32 |
//   num_pix u64 | num_steps u64 | payload arrays
// The grammar is independent of in-memory layout; loads reject any shape
// mismatch rather than reinterpreting data.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::{Array2, Array3};

use crate::error::{BlacklightError, Result};
use crate::geodesic::GeodesicSet;
use crate::sample::SampleSet;

const MAGIC: &[u8; 4] = b"BLCK";
const VERSION: u32 = 1;

const KIND_GEODESIC: u8 = 0;
const KIND_SAMPLE: u8 = 1;

struct Writer<W: Write> {
    inner: W,
}

impl<W: Write> Writer<W> {
    fn u32(&mut self, v: u32) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }
    fn u64(&mut self, v: u64) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }
    fn f64_slice(&mut self, vs: &[f64]) -> std::io::Result<()> {
        for v in vs {
            self.inner.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }
}

struct Reader<R: Read> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    fn u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
    fn f64_vec(&mut self, len: usize) -> std::io::Result<Vec<f64>> {
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 8];
        for _ in 0..len {
            self.inner.read_exact(&mut buf)?;
            out.push(f64::from_le_bytes(buf));
        }
        Ok(out)
    }
}

fn write_header<W: Write>(
    w: &mut Writer<W>,
    kind: u8,
    resolution: usize,
    num_pix: usize,
    num_steps: usize,
) -> std::io::Result<()> {
    w.inner.write_all(MAGIC)?;
    w.inner.write_all(&[kind])?;
    w.u32(VERSION)?;
    w.u32(resolution as u32)?;
    w.u64(num_pix as u64)?;
    w.u64(num_steps as u64)
}

fn read_header<R: Read>(
    r: &mut Reader<R>,
    path: &Path,
    kind: u8,
    resolution: usize,
    num_pix: usize,
) -> Result<usize> {
    let mut magic = [0u8; 4];
    r.inner.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(BlacklightError::checkpoint(path, "bad magic"));
    }
    let mut kind_buf = [0u8; 1];
    r.inner.read_exact(&mut kind_buf)?;
    if kind_buf[0] != kind {
        return Err(BlacklightError::checkpoint(path, "wrong checkpoint kind"));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(BlacklightError::checkpoint(
            path,
            format!("unsupported version {version}"),
        ));
    }
    let file_resolution = r.u32()? as usize;
    if file_resolution != resolution {
        return Err(BlacklightError::checkpoint(
            path,
            format!("resolution {file_resolution} does not match run resolution {resolution}"),
        ));
    }
    let file_num_pix = r.u64()? as usize;
    if file_num_pix != num_pix {
        return Err(BlacklightError::checkpoint(
            path,
            format!("pixel count {file_num_pix} does not match run pixel count {num_pix}"),
        ));
    }
    Ok(r.u64()? as usize)
}

fn write_counts_and_flags<W: Write>(
    w: &mut Writer<W>,
    counts: &[u32],
    flags: &[bool],
) -> std::io::Result<()> {
    for &c in counts {
        w.u32(c)?;
    }
    let bytes: Vec<u8> = flags.iter().map(|&f| f as u8).collect();
    w.inner.write_all(&bytes)
}

fn read_counts_and_flags<R: Read>(
    r: &mut Reader<R>,
    num_pix: usize,
) -> std::io::Result<(Vec<u32>, Vec<bool>)> {
    let mut counts = Vec::with_capacity(num_pix);
    for _ in 0..num_pix {
        counts.push(r.u32()?);
    }
    let mut bytes = vec![0u8; num_pix];
    r.inner.read_exact(&mut bytes)?;
    Ok((counts, bytes.into_iter().map(|b| b != 0).collect()))
}

pub fn save_geodesics(path: &Path, resolution: usize, set: &GeodesicSet) -> Result<()> {
    let file = File::create(path)?;
    let mut w = Writer { inner: BufWriter::new(file) };
    write_header(&mut w, KIND_GEODESIC, resolution, set.num_pix(), set.num_steps)?;
    write_counts_and_flags(&mut w, &set.counts, &set.flags)?;
    w.f64_slice(set.positions.as_slice().expect("standard layout"))?;
    w.f64_slice(set.momenta.as_slice().expect("standard layout"))?;
    w.f64_slice(set.lambdas.as_slice().expect("standard layout"))?;
    w.inner.flush()?;
    Ok(())
}

pub fn load_geodesics(path: &Path, resolution: usize, num_pix: usize) -> Result<GeodesicSet> {
    let file = File::open(path)?;
    let mut r = Reader { inner: BufReader::new(file) };
    let num_steps = read_header(&mut r, path, KIND_GEODESIC, resolution, num_pix)?;
    let (counts, flags) = read_counts_and_flags(&mut r, num_pix)?;
    let positions = Array3::from_shape_vec(
        (num_pix, num_steps, 4),
        r.f64_vec(num_pix * num_steps * 4)?,
    )
    .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    let momenta = Array3::from_shape_vec(
        (num_pix, num_steps, 4),
        r.f64_vec(num_pix * num_steps * 4)?,
    )
    .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    let lambdas = Array2::from_shape_vec((num_pix, num_steps), r.f64_vec(num_pix * num_steps)?)
        .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    Ok(GeodesicSet {
        num_steps,
        counts,
        flags,
        positions,
        momenta,
        lambdas,
    })
}

pub fn save_samples(path: &Path, resolution: usize, set: &SampleSet) -> Result<()> {
    let file = File::create(path)?;
    let mut w = Writer { inner: BufWriter::new(file) };
    write_header(&mut w, KIND_SAMPLE, resolution, set.num_pix(), set.num_steps)?;
    write_counts_and_flags(&mut w, &set.counts, &set.flags)?;
    w.f64_slice(set.positions.as_slice().expect("standard layout"))?;
    w.f64_slice(set.momenta.as_slice().expect("standard layout"))?;
    w.f64_slice(set.lengths.as_slice().expect("standard layout"))?;
    w.f64_slice(set.radii.as_slice().expect("standard layout"))?;
    w.inner.flush()?;
    Ok(())
}

pub fn load_samples(path: &Path, resolution: usize, num_pix: usize) -> Result<SampleSet> {
    let file = File::open(path)?;
    let mut r = Reader { inner: BufReader::new(file) };
    let num_steps = read_header(&mut r, path, KIND_SAMPLE, resolution, num_pix)?;
    let (counts, flags) = read_counts_and_flags(&mut r, num_pix)?;
    let positions = Array3::from_shape_vec(
        (num_pix, num_steps, 4),
        r.f64_vec(num_pix * num_steps * 4)?,
    )
    .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    let momenta = Array3::from_shape_vec(
        (num_pix, num_steps, 4),
        r.f64_vec(num_pix * num_steps * 4)?,
    )
    .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    let lengths = Array2::from_shape_vec((num_pix, num_steps), r.f64_vec(num_pix * num_steps)?)
        .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    let radii = Array2::from_shape_vec((num_pix, num_steps), r.f64_vec(num_pix * num_steps)?)
        .map_err(|e| BlacklightError::checkpoint(path, e.to_string()))?;
    Ok(SampleSet {
        num_steps,
        counts,
        flags,
        positions,
        momenta,
        lengths,
        radii,
    })
}
