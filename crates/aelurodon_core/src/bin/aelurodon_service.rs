/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aelurodon_core::config::InstanceConfig;
use aelurodon_core::layout::DataLayout;
use aelurodon_core::runtime;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: aelurodon_service <config.json>")?;
    let cfg = InstanceConfig::load(&config_path)?;

    // Bootstrap a local account when credentials arrive via the environment.
    if let (Ok(nickname), Ok(password)) = (
        std::env::var("AELURODON_ACCOUNT"),
        std::env::var("AELURODON_PASSWORD"),
    ) {
        let layout = DataLayout::new(cfg.resolve_data_dir()?);
        let account = runtime::ensure_account(&cfg, &layout, &nickname, Some(&password))?;
        tracing::info!("account ready: {}", account.handle);
    }

    runtime::start(cfg).await
}
