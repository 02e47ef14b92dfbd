//! Delay-locked loop for clock drift compensation
//!
//! Turns the difference between the desired and the actual ring occupancy
//! into a smoothed, multiplicative playback-rate correction centered at 1.0.
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


use std::f64::consts::PI;

/// Widest usable loop bandwidth
pub const DLL_BW_MAX: f64 = 0.128;
/// Narrowest loop bandwidth, used right after a resync
pub const DLL_BW_MIN: f64 = 0.016;

/// DLL configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DllConfig {
    /// Loop bandwidth
    pub bandwidth: f64,
    /// Averaging window in samples
    pub period: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Errors are clamped to `±max_error` samples before filtering
    pub max_error: f32,
    /// Correction is clamped to `1.0 ± max_deviation`
    pub max_deviation: f32,
}

impl Default for DllConfig {
    fn default() -> Self {
        DllConfig {
            bandwidth: DLL_BW_MIN,
            period: 128,
            sample_rate: 48000,
            max_error: 96.0, // 2ms at 48kHz
            max_deviation: 0.05,
        }
    }
}

/// Second-order delay-locked loop
#[derive(Debug, Clone)]
pub struct Dll {
    config: DllConfig,
    z1: f64,
    z2: f64,
    z3: f64,
    w0: f64,
    w1: f64,
    w2: f64,
    correction: f32,
}

impl Dll {
    /// Create and initialize a loop
    pub fn new(config: DllConfig) -> Self {
        let mut dll = Dll {
            config,
            z1: 0.0,
            z2: 0.0,
            z3: 0.0,
            w0: 0.0,
            w1: 0.0,
            w2: 0.0,
            correction: 1.0,
        };
        dll.init(config.bandwidth, config.period, config.sample_rate);
        dll
    }

    /// Reset the filter state and configure its time constant.
    ///
    /// A larger bandwidth reacts faster but passes more jitter through.
    pub fn init(&mut self, bandwidth: f64, period: u32, sample_rate: u32) {
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.z3 = 0.0;
        self.correction = 1.0;
        self.set_bandwidth(bandwidth, period, sample_rate);
    }

    /// Change the time constant, keeping the filter state
    pub fn set_bandwidth(&mut self, bandwidth: f64, period: u32, sample_rate: u32) {
        let period = period.max(1);
        let sample_rate = sample_rate.max(1);
        let w = 2.0 * PI * bandwidth * period as f64 / sample_rate as f64;

        self.w0 = 1.0 - (-20.0 * w).exp();
        self.w1 = w * 1.5 / period as f64;
        self.w2 = w / 1.5;

        self.config.bandwidth = bandwidth;
        self.config.period = period;
        self.config.sample_rate = sample_rate;
    }

    /// Reinitialize with the configured bandwidth
    pub fn reset(&mut self) {
        let DllConfig { bandwidth, period, sample_rate, .. } = self.config;
        self.init(bandwidth, period, sample_rate);
    }

    /// Feed an occupancy error (`target - current`, in samples) and get the
    /// new rate correction.
    pub fn update(&mut self, error: f32) -> f32 {
        let error = error.clamp(-self.config.max_error, self.config.max_error) as f64;

        self.z1 += self.w0 * (self.w1 * error - self.z1);
        self.z2 += self.w0 * (self.z1 - self.z2);
        self.z3 += self.w2 * self.z2;

        let corr = (1.0 - (self.z2 + self.z3)) as f32;
        let limit = self.config.max_deviation;
        self.correction = corr.clamp(1.0 - limit, 1.0 + limit);
        self.correction
    }

    /// Last correction returned by [`Dll::update`]
    pub fn correction(&self) -> f32 {
        self.correction
    }

    pub fn bandwidth(&self) -> f64 {
        self.config.bandwidth
    }

    pub fn config(&self) -> &DllConfig {
        &self.config
    }
}
