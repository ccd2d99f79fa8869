/*
 * Plugin Sandbox
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result};
use clap::Parser;

use plugin_sandbox::config::{Cli, Config};
use plugin_sandbox::core::logger::{
    self, LogLevel, Logger, LoggerConfig, log_task_complete_with_details, log_task_start,
};
use plugin_sandbox::{PluginHost, PluginLoader, PluginMetadata};

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Cli::parse();

    Logger::init(LoggerConfig {
        min_level: if args.debug { LogLevel::Debug } else { LogLevel::Info },
        journald_format: args.journald,
        ..LoggerConfig::default()
    })?;

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            logger::log_init_failed("plugin sandbox", &format!("{:#}", e));
            return Err(e);
        }
    };
    args.apply(&mut config);

    log_task_start("Loading plugins");
    let host = PluginHost::new(&config.sandbox).context("Failed to create plugin host")?;
    let plugins = PluginLoader::new(&host)
        .verbose(!args.quiet)
        .load_all(&config.discovery.plugins_dir, &config.discovery.file_name)
        .with_context(|| {
            format!(
                "Failed to prepare plugins directory {}",
                config.discovery.plugins_dir.display()
            )
        })?;
    log_task_complete_with_details(
        "Loading plugins",
        &format!("{} loaded", plugins.len()),
    );

    if args.json {
        let metadata: Vec<&PluginMetadata> = plugins.iter().map(|p| &p.metadata).collect();
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    } else {
        for plugin in &plugins {
            println!("{}", plugin.metadata);
        }
    }

    Ok(())
}
