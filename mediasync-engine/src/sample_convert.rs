//! Sample format converters feeding the ring buffers
//!
//! Nodes produce `f32` samples internally and convert them to the negotiated
//! wire encoding. The converter is picked once, when the format is
//! negotiated, and stored on the node.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{EngineError, EngineResult};
use crate::format::SampleFormat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Entries in the pre-computed noise table
const DITHER_SIZE: usize = 1 << 10;

/// Dither settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DitherConfig {
    /// Noise amplitude in output LSBs as a power of two; 0 disables dither
    pub intensity: u32,
    /// Fixed seed for reproducible noise
    pub seed: Option<u64>,
}

/// Converts interleaved `f32` samples to a wire encoding
pub trait SampleConverter: Send {
    fn name(&self) -> &'static str;

    fn output_format(&self) -> SampleFormat;

    /// Convert as many samples of `src` as fit into `dst`; returns bytes written
    fn convert(&mut self, src: &[f32], dst: &mut [u8]) -> usize;
}

/// Pick the converter for `target`
pub fn select_converter(target: SampleFormat, config: DitherConfig) -> EngineResult<Box<dyn SampleConverter>> {
    if config.intensity >= 32 {
        return Err(EngineError::ConfigError(format!(
            "dither intensity {} out of range",
            config.intensity
        )));
    }

    let converter: Box<dyn SampleConverter> = match target {
        SampleFormat::F32LE => Box::new(F32Copy),
        int_format => {
            let dither = if config.intensity > 0 {
                Some(NoiseTable::new(int_format, config)?)
            } else {
                None
            };
            Box::new(F32ToInt {
                format: int_format,
                dither,
            })
        }
    };
    Ok(converter)
}

struct F32Copy;

impl SampleConverter for F32Copy {
    fn name(&self) -> &'static str {
        "f32-copy"
    }

    fn output_format(&self) -> SampleFormat {
        SampleFormat::F32LE
    }

    fn convert(&mut self, src: &[f32], dst: &mut [u8]) -> usize {
        let n = src.len().min(dst.len() / 4);
        for (sample, out) in src[..n].iter().zip(dst.chunks_exact_mut(4)) {
            out.copy_from_slice(&sample.to_le_bytes());
        }
        n * 4
    }
}

struct NoiseTable {
    noise: Vec<f32>,
    pos: usize,
}

impl NoiseTable {
    fn new(format: SampleFormat, config: DitherConfig) -> EngineResult<Self> {
        let mut noise = Vec::new();
        noise.try_reserve_exact(DITHER_SIZE).map_err(|e| {
            EngineError::AllocationFailed(format!("dither table: {}", e))
        })?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let amplitude = (1u64 << config.intensity) as f32 / full_scale(format);
        noise.extend((0..DITHER_SIZE).map(|_| rng.gen_range(-0.5f32..0.5) * amplitude));

        Ok(NoiseTable { noise, pos: 0 })
    }

    fn next(&mut self) -> f32 {
        let v = self.noise[self.pos];
        self.pos = (self.pos + 1) & (DITHER_SIZE - 1);
        v
    }
}

fn full_scale(format: SampleFormat) -> f32 {
    match format {
        SampleFormat::S16LE | SampleFormat::S16BE => 32767.0,
        SampleFormat::S24LE => 8_388_607.0,
        SampleFormat::S32LE => 2_147_483_647.0,
        SampleFormat::F32LE => 1.0,
    }
}

struct F32ToInt {
    format: SampleFormat,
    dither: Option<NoiseTable>,
}

impl SampleConverter for F32ToInt {
    fn name(&self) -> &'static str {
        if self.dither.is_some() {
            "f32-to-int-dither"
        } else {
            "f32-to-int"
        }
    }

    fn output_format(&self) -> SampleFormat {
        self.format
    }

    fn convert(&mut self, src: &[f32], dst: &mut [u8]) -> usize {
        let width = self.format.bytes_per_sample() as usize;
        let scale = full_scale(self.format) as f64;
        let n = src.len().min(dst.len() / width);

        for (sample, out) in src[..n].iter().zip(dst.chunks_exact_mut(width)) {
            let noise = self.dither.as_mut().map_or(0.0, NoiseTable::next);
            let v = ((*sample + noise).clamp(-1.0, 1.0) as f64 * scale).round() as i32;
            match self.format {
                SampleFormat::S16BE => out.copy_from_slice(&(v as i16).to_be_bytes()),
                _ => out.copy_from_slice(&v.to_le_bytes()[..width]),
            }
        }
        n * width
    }
}
