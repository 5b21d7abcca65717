use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::sync::Arc;

use process_watchdog::api;
use process_watchdog::cli::CommandArgs;
use process_watchdog::state::{start_engine, WatchdogConfig, WatchdogState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();
    let bind_address = args.bind_address();
    let config = WatchdogConfig::from(&args);

    log::info!("🔄 Loading rules from {:?}...", config.rules_file);
    let state = match WatchdogState::linux(config.clone()) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            log::error!("❌ Failed to initialize watchdog: {}", e);
            for cause in e.chain().skip(1) {
                log::error!("     - {}", cause);
            }
            return Err(std::io::Error::other(e.to_string()));
        }
    };
    log::info!("✓ Loaded {} rules", state.catalog.snapshot().rule_count());

    let engine = start_engine(state.clone(), WatchdogState::event_sources(&config));

    print_banner(&args, &state.monitoring_mode());

    let data = web::Data::from(state);
    let result = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(api::configure)
    })
        .bind(&bind_address)?
        .run()
        .await;

    engine.shutdown().await;
    result
}

fn print_banner(args: &CommandArgs, mode: &str) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      Process Watchdog v{:<35}║", env!("CARGO_PKG_VERSION"));
    println!("║      Lifecycle tracking & rule enforcement                ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Server starting on http://{}:{}", args.address, args.port);
    println!("🔍 Monitoring mode: {}", mode);
    println!();
    println!("📋 Available endpoints:");
    println!("  GET    /api/rules              - List threshold rules");
    println!("  POST   /api/rules              - Add a threshold rule");
    println!("  DELETE /api/rules              - Remove a threshold rule");
    println!("  GET    /api/disallowed         - List disallowed processes");
    println!("  POST   /api/disallowed         - Add a disallowed process");
    println!("  DELETE /api/disallowed/{{name}}  - Remove a disallowed process");
    println!("  GET    /api/permanent          - List permanent processes");
    println!("  POST   /api/permanent          - Add a permanent process");
    println!("  DELETE /api/permanent/{{name}}   - Remove a permanent process");
    println!("  GET    /api/defaults           - List default CPU settings");
    println!("  POST   /api/defaults           - Add default CPU settings");
    println!("  DELETE /api/defaults/{{name}}    - Remove default CPU settings");
    println!("  GET    /api/processes          - List tracked processes");
    println!("  GET    /api/processes/{{pid}}    - Process snapshot");
    println!("  PUT    /api/focus/{{pid}}        - Focus a process");
    println!("  DELETE /api/focus/{{pid}}        - Clear focus");
    println!("  GET    /api/alerts             - Recent alerts");
    println!("  GET    /api/status             - Engine status");
    println!("  GET    /metrics                - Prometheus metrics");
    println!("  GET    /health                 - Health check");
    println!();
    println!("💡 Features:");
    println!("  • Process / thread / module / handle / region tracking");
    println!("  • CPU, memory, instance and energy rules (sysinfo)");
    println!("  • Lifecycle events via eBPF, procfs polling fallback");
    println!("  • Prometheus metrics export");
    println!("═══════════════════════════════════════════════════════════");
}
