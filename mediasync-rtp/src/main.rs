//! RTP streaming daemon
//!
//! Runs one end of an RTP audio stream: `send` streams a sine tone to
//! `MEDIASYNC_REMOTE_ADDR`, `receive` plays back whatever arrives on
//! `MEDIASYNC_LOCAL_ADDR` with clock drift compensation.
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


mod host;

use anyhow::Result;
use mediasync_config::{AppConfig, Mode};
use mediasync_logging::LogFormat;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging
    let format: LogFormat = config.log_format.parse()?;
    mediasync_logging::init("mediasync-rtp", config.log_level(), format)?;

    let mode = config.mode()?;
    info!(
        ?mode,
        sample_rate = config.sample_rate,
        channels = config.channels,
        packet_samples = config.packet_samples(),
        target_occupancy = config.target_occupancy(),
        direct_timestamp = config.direct_timestamp,
        "Configuration loaded"
    );

    match mode {
        Mode::Send => host::run_sender(&config).await?,
        Mode::Receive => host::run_receiver(&config).await?,
    }

    info!("mediasync-rtp stopped");
    Ok(())
}
