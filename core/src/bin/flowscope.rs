//! flowscope service binary.
//!
//! Usage:
//! ```
//! cargo run -p flowscope_core --bin flowscope -- --storage-path ./flowscope_data --port 8000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use flowscope_core::api::run_server;
use flowscope_core::config::ServiceConfig;
use flowscope_core::logging::init_logging;
use flowscope_core::service::FlowService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ServiceConfig::from_env();
    parse_args(&mut config);

    std::fs::create_dir_all(&config.storage_path)?;
    let _log_guard = init_logging(&config.storage_path)?;

    let service = Arc::new(FlowService::open(config).await?);
    run_server(service).await
}

fn parse_args(config: &mut ServiceConfig) {
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--storage-path" => {
                if let Some(path) = args.next() {
                    config.storage_path = PathBuf::from(path);
                }
            }
            "--bind" => {
                if let Some(bind) = args.next() {
                    config.bind_address = bind;
                }
            }
            "--port" => match args.next().map(|v| v.parse::<u16>()) {
                Some(Ok(port)) => config.port = port,
                Some(Err(e)) => eprintln!("Invalid --port: {e}"),
                None => eprintln!("--port needs a value"),
            },
            "--max-rows" => match args.next().map(|v| v.parse::<usize>()) {
                Some(Ok(rows)) if rows > 0 => config.max_rows = rows,
                Some(Ok(_)) => eprintln!("--max-rows must be positive"),
                Some(Err(e)) => eprintln!("Invalid --max-rows: {e}"),
                None => eprintln!("--max-rows needs a value"),
            },
            "--help" | "-h" => {
                eprintln!("flowscope {}", flowscope_core::VERSION);
                eprintln!();
                eprintln!("Usage: flowscope [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --storage-path <PATH>   Database and log directory (env FLOWSCOPE_STORAGE)");
                eprintln!("  --bind <ADDR>           Listen address (env FLOWSCOPE_BIND, default 127.0.0.1)");
                eprintln!("  --port <PORT>           Listen port (env FLOWSCOPE_PORT, default 8000)");
                eprintln!("  --max-rows <N>          Flows kept before eviction (env FLOWSCOPE_MAX_ROWS)");
                eprintln!("  --help, -h              Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }
}
