mod nvt_api;
mod nvt_colors;
mod nvt_config;
mod nvt_controllers;
mod nvt_features;
mod nvt_gui;
mod nvt_layers;
mod nvt_models;
mod nvt_overlay;
mod nvt_popup;
mod nvt_surface;
mod nvt_views;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use log::info;
use nvt_api::{HttpTransitApi, TransitApi};
use nvt_colors::RouteColorResolver;
use nvt_config::{NvtConfig, StyleKey};
use nvt_features::build_collection;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "nvt_live_map", version, about = "Live transit vehicle map")]
struct Cli {
    /// Backend base URL (overrides NVT_API_BASE)
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Initial basemap: streets, light, dark, demo, 3d or custom
    #[arg(long, global = true)]
    style: Option<String>,

    /// Custom basemap style URL (overrides NVT_STYLE_URL)
    #[arg(long, global = true)]
    style_url: Option<String>,

    /// Vehicle poll interval in seconds (overrides NVT_POLL_SECS)
    #[arg(long, global = true)]
    poll_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Open the desktop map (default)
    Gui,
    /// Fetch routes and vehicles once and print the rendered vehicles as GeoJSON
    Snapshot {
        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },
    /// Print one route's shape as GeoJSON
    RouteShape { route_id: String },
}

impl Cli {
    fn apply(&self, config: &mut NvtConfig) -> anyhow::Result<()> {
        if let Some(base) = &self.api_base {
            config.api_base = base.trim().trim_end_matches('/').to_string();
        }
        if let Some(url) = &self.style_url {
            config.custom_style_url = Some(url.clone());
            config.initial_style = StyleKey::Custom;
        }
        if let Some(style) = &self.style {
            config.initial_style =
                StyleKey::parse(style).ok_or_else(|| anyhow!("unknown style '{}'", style))?;
        }
        if let Some(secs) = self.poll_secs {
            if secs == 0 {
                return Err(anyhow!("--poll-secs must be positive"));
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(())
    }
}

fn current_thread_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn snapshot(config: &NvtConfig, pretty: bool) -> anyhow::Result<()> {
    let runtime = current_thread_runtime()?;
    let api = HttpTransitApi::new(&config.api_base, config.request_timeout)?;

    let (routes, records) = runtime.block_on(async {
        futures::future::join(api.routes(), api.vehicles()).await
    });
    let records = records.with_context(|| format!("fetching vehicles from {}", config.api_base))?;

    let mut resolver = RouteColorResolver::default();
    match routes {
        Ok(rows) => resolver.rebuild(&rows),
        Err(e) => log::warn!("routes unavailable, using fallback colors: {}", e),
    }

    let collection = build_collection(&records, &resolver, nvt_models::unix_now());
    info!("{} of {} vehicles renderable", collection.len(), records.len());

    let geojson = collection.to_geojson();
    let out = if pretty {
        serde_json::to_string_pretty(&geojson)?
    } else {
        serde_json::to_string(&geojson)?
    };
    println!("{}", out);
    Ok(())
}

fn route_shape(config: &NvtConfig, route_id: String) -> anyhow::Result<()> {
    let runtime = current_thread_runtime()?;
    let api = HttpTransitApi::new(&config.api_base, config.request_timeout)?;
    let shape = runtime
        .block_on(api.route_shape(route_id.clone()))
        .with_context(|| format!("fetching shape of route {}", route_id))?;
    println!("{}", serde_json::to_string(&shape)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = NvtConfig::from_env().context("invalid NVT_* environment")?;
    cli.apply(&mut config)?;
    info!(
        "api {} | style {} | poll every {:?}",
        config.api_base,
        config.initial_style.as_str(),
        config.poll_interval
    );

    match cli.command.unwrap_or(Mode::Gui) {
        Mode::Gui => nvt_gui::run_gui(config).map_err(|e| anyhow!("GUI failed: {}", e)),
        Mode::Snapshot { pretty } => snapshot(&config, pretty),
        Mode::RouteShape { route_id } => route_shape(&config, route_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_config(vars: &[(&str, &str)]) -> NvtConfig {
        NvtConfig::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    #[test]
    fn test_style_url_flag_completes_custom_env_style() {
        let mut config = env_config(&[("NVT_STYLE", "custom")]);
        let cli = Cli::parse_from(["nvt_live_map", "--style-url", "https://x/style.json"]);
        cli.apply(&mut config).unwrap();
        assert_eq!(config.initial_style, StyleKey::Custom);
        assert_eq!(config.custom_style_url.as_deref(), Some("https://x/style.json"));
    }

    #[test]
    fn test_custom_style_without_url_fails_after_overlay() {
        let mut config = env_config(&[("NVT_STYLE", "custom")]);
        let cli = Cli::parse_from(["nvt_live_map", "snapshot"]);
        assert!(cli.apply(&mut config).is_err());
    }

    #[test]
    fn test_cli_overrides_env_values() {
        let mut config = env_config(&[("NVT_API_BASE", "http://env.test")]);
        let cli = Cli::parse_from([
            "nvt_live_map",
            "--api-base",
            "http://cli.test/",
            "--poll-secs",
            "9",
        ]);
        cli.apply(&mut config).unwrap();
        assert_eq!(config.api_base, "http://cli.test");
        assert_eq!(config.poll_interval, Duration::from_secs(9));
        assert!(Cli::parse_from(["nvt_live_map", "--poll-secs", "0"])
            .apply(&mut config)
            .is_err());
    }
}
