mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::time::Duration;
use tracing::{error, info};
use vigil::benchmark::{BenchmarkConfig, LoadProfile, request_fn};
use vigil::{
    EngineConfig, LoggingConfig, ShutdownOutcome, StartupMode, VigilEngine, VigilError,
};

/// Exit codes for the operational surface.
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_STARTUP_FAILURE: i32 = 3;
const EXIT_FORCED_SHUTDOWN: i32 = 4;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: if cli.verbose { "debug" } else { "info" }.to_string(),
        json: cli.json_logs,
        file: None,
    };
    let _log_guard = match logging.init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, VigilError> {
    let engine_config = EngineConfig {
        catalog_paths: cli.config.clone(),
        profile: cli.profile.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Start {
            mode,
            duration_secs,
            shutdown_timeout_secs,
        } => {
            let mode: StartupMode = mode
                .parse()
                .map_err(|reason| VigilError::Other(anyhow::anyhow!("{reason}")))?;

            let engine = VigilEngine::new(engine_config).await?;
            engine.register_catalog_stubs().await?;
            let report = engine.start(mode).await?;
            info!(
                "Started {} services in {:.2}s (estimated {:.2}s)",
                report.records.iter().filter(|r| r.success).count(),
                report.actual_wall_clock_secs,
                report.estimated_wall_clock_secs
            );

            match duration_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => {
                    info!("Running; press ctrl-c to stop");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }

            let shutdown = engine
                .stop(Duration::from_secs(shutdown_timeout_secs))
                .await;
            let forced = shutdown
                .outcomes
                .values()
                .filter(|outcome| **outcome == ShutdownOutcome::Forced)
                .count();
            if forced > 0 {
                error!("{} services required forced shutdown", forced);
                return Ok(EXIT_FORCED_SHUTDOWN);
            }
            Ok(0)
        }

        Commands::Report => {
            let engine = VigilEngine::new(engine_config).await?;
            engine.register_catalog_stubs().await?;
            let report = engine.report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }

        Commands::Validate => {
            let engine = VigilEngine::new(engine_config).await?;
            let validation = engine.catalog().validate_all();
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if validation.is_valid() {
                info!("Catalog valid: {} services", engine.catalog().len());
                Ok(0)
            } else {
                Ok(EXIT_CONFIG_ERROR)
            }
        }

        Commands::Audit { samples } => {
            let engine = VigilEngine::new(engine_config).await?;
            engine.register_catalog_stubs().await?;
            engine.start(StartupMode::EssentialOnly).await?;

            for _ in 0..samples {
                engine.monitor().tick().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let report = engine.audit().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            engine.stop(Duration::from_secs(10)).await;
            Ok(0)
        }

        Commands::Bench {
            load,
            duration_secs,
            warmup_secs,
        } => {
            let profile = match load.to_ascii_lowercase().as_str() {
                "light" => LoadProfile::Light,
                "moderate" => LoadProfile::Moderate,
                "heavy" => LoadProfile::Heavy,
                "burst" => LoadProfile::Burst,
                other => {
                    return Err(VigilError::Other(anyhow::anyhow!(
                        "unknown load profile: {other}"
                    )));
                }
            };

            let engine = VigilEngine::new(engine_config).await?;
            engine.register_catalog_stubs().await?;
            engine.start(StartupMode::EssentialOnly).await?;

            let handle = engine.handle("auth_service");
            let request = request_fn(move || {
                let handle = handle.clone();
                async move { handle.get().await.map(|_| ()).map_err(anyhow::Error::from) }
            });

            let config = BenchmarkConfig::new(
                "service_access",
                profile,
                Duration::from_secs(duration_secs),
            )
            .with_warmup(Duration::from_secs(warmup_secs));

            let result = engine.benchmarks().run(config, request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            engine.stop(Duration::from_secs(10)).await;
            Ok(0)
        }
    }
}

fn exit_code_for(error: &VigilError) -> i32 {
    match error {
        VigilError::Config(_) | VigilError::Toml(_) | VigilError::Yaml(_) => EXIT_CONFIG_ERROR,
        VigilError::Lifecycle(crate_err) => match crate_err {
            vigil::LifecycleError::EssentialStartupFailure { .. } => EXIT_STARTUP_FAILURE,
            _ => 1,
        },
        _ => 1,
    }
}
