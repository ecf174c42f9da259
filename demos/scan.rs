// In demos/scan.rs
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use station_broker::config::LOG_ENV_VAR;
use station_broker::Station::Service::{ClientSession, ScanEvent, StationConnection};
use station_broker::Station::Structs::Selector;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <client-name> <station>[,<station>...] [selector...]", args[0]);
        std::process::exit(1);
    }

    let selectors = args[3..]
        .iter()
        .map(|s| s.parse::<Selector>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut session = ClientSession::new();
    for station in args[2].split(',') {
        session.add(StationConnection::new(station, &args[1])?.with_selectors(selectors.clone()));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_for_handler.store(true, Ordering::SeqCst);
    })?;

    println!("{:<8} {:<10} {:<8} {:<12} {:>6}", "Station", "Packet", "Kind", "Stream", "Bytes");
    println!("{}", "=".repeat(50));

    while !stop.load(Ordering::SeqCst) {
        match session.scan() {
            Some(ScanEvent::Records { station, records }) => {
                for record in records {
                    println!(
                        "{:<8} {:<10} {:<8} {:<12} {:>6}",
                        station,
                        record.packet_num,
                        record.kind.to_string(),
                        record.stream.to_string(),
                        record.data.len()
                    );
                }
            }
            Some(ScanEvent::Alert { station, code }) => {
                println!("{:<8} ** {} ({})", station, code, code.code());
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }

    Ok(())
}
