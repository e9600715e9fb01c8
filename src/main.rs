use navrt::app::{Application, Host, USER_KEY};
use navrt::cli::Args;
use navrt::config::{self, RuntimeConfig};
use navrt::core::clock::SystemClock;
use navrt::core::events::UserRecord;
use navrt::host::{ConsoleFactory, LocalFetcher, OfflineClient};
use navrt::storage::{MemoryStorage, Storage};

use anyhow::Context;
use clap::Parser;
use log::{debug, info};
use serde_json::json;
use std::sync::Arc;

fn init_logging(args: &Args, path_config: &config::PathConfig) -> anyhow::Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);
    info!(
        "Config path: {}",
        config::config_file(config::CONFIG_FILE, &path_config).display()
    );

    let runtime_config = RuntimeConfig::load(&path_config)?;
    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&runtime_config)?);
        return Ok(());
    }

    let clock = Arc::new(SystemClock::new());
    let storage = Arc::new(MemoryStorage::new(clock.clone()));
    if let Some(token) = &args.token {
        // Seed the session the way a previous login would have
        let user = UserRecord::new().with_field("token", json!(token));
        storage.set(USER_KEY, serde_json::to_value(&user)?, None, false);
    }
    let factory = Arc::new(ConsoleFactory::new(args.broken.iter().cloned()));
    let host = Host {
        network: Arc::new(OfflineClient),
        fetcher: Arc::new(LocalFetcher::new(args.assets_dir.clone())),
        factory: factory.clone(),
        storage,
        clock,
        reload: Some(Arc::new(|| info!("reload requested"))),
    };

    let app = Application::new(runtime_config, host)?;
    info!("navrt v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut locations = args.locations.iter();
    let outcome = app.init(locations.next().map(String::as_str));
    report(&app, &factory, "init", &outcome);

    for location in locations {
        let outcome = app.router().resolve(location);
        report(&app, &factory, location, &outcome);
        app.tick();
    }

    for (page, visits) in app.page_views() {
        println!("{:>6}  {}", visits, page);
    }
    let stats = app.cache().stats();
    info!(
        "cache: {} entries, {:.2}KB, hit rate {:.1}%",
        app.cache().len(),
        app.cache().size_kb(),
        stats.hit_rate() * 100.0
    );
    Ok(())
}

fn report(app: &Application, factory: &ConsoleFactory, location: &str, outcome: &navrt::core::NavigationOutcome) {
    println!(
        "{} -> {:?} [current: {}, previous: {}]",
        location,
        outcome,
        app.router().current_route(),
        app.router().previous_route().unwrap_or_default()
    );
    for line in factory.take_transcript() {
        println!("    {}", line);
    }
}
