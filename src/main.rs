mod cli;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use cli::Cli;
use httptap::logger::{Event, Logger};
use httptap::tap::config::CaptureConfig;
use httptap::tap::Engine;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the shared logger, optionally teeing events to a file.
    let logger = match Logger::new(cli.log_file.as_deref()) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            eprintln!("cannot open log file: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = CaptureConfig {
        interface: cli.interface,
        ports: cli.ports,
        max_body_size: cli.max_body_size,
        max_concurrent_connections: cli.max_connections,
        connection_idle_timeout_ms: cli.idle_timeout_ms,
        ..CaptureConfig::default()
    };

    // Shared shutdown flag flipped by the Ctrl+C handler; the main loop
    // exits on the next poll.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_ctrlc = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        shutdown_ctrlc.store(true, Ordering::SeqCst);
    })
    .expect("failed to register Ctrl+C handler");

    let mut engine = Engine::new(Arc::clone(&logger));
    let start = engine.start(&config, |msg| {
        if let Ok(line) = serde_json::to_string(&msg) {
            println!("{}", line);
        }
    });
    if let Err(err) = start {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }

    // Idle until Ctrl+C or until the capture worker dies on its own.
    while !shutdown.load(Ordering::SeqCst) && engine.is_running() {
        thread::sleep(Duration::from_millis(200));
    }

    let failed = engine.last_error().is_some() && !shutdown.load(Ordering::SeqCst);
    if let Some(stats) = engine.stop() {
        logger.log(&Event::Summary { stats });
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
