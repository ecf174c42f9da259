// In demos/broker.rs
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use station_broker::config::LOG_ENV_VAR;
use station_broker::Station::Buffer::QueueKind;
use station_broker::Station::Dispatch::InfoKind;
use station_broker::Station::Structs::StreamId;
use station_broker::{BrokerBuilder, BrokerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = BrokerConfig::load(args.get(1).map(String::as_str))?;
    let mut broker = BrokerBuilder::new().with_config(config.clone()).build()?;
    broker.set_info(InfoKind::Link, Some(format!("synthetic link for {}", config.station).into_bytes()));

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = Arc::clone(&stop);

    // Handle Ctrl+C to clean up
    ctrlc::set_handler(move || {
        stop_for_handler.store(true, Ordering::SeqCst);
    })?;

    info!(region = %config.region_name(), "press Ctrl+C to exit");

    let streams = [
        StreamId::new("00", "BHZ"),
        StreamId::new("00", "BHN"),
        StreamId::new("00", "BHE"),
    ];
    let mut sample = 0u32;
    let mut last_record = Instant::now();
    let mut last_timing = Instant::now();

    while !stop.load(Ordering::SeqCst) && !broker.terminate_requested() {
        let now = Instant::now();
        broker.poll_once_at(now);
        broker.maintenance(now);

        // One record per stream every 100 ms, unless a client is holding the queue
        if last_record.elapsed() >= Duration::from_millis(100)
            && !broker.check_and_update_block_mask(Some(QueueKind::Data))
        {
            last_record = Instant::now();
            let t = now_secs();
            for stream in streams {
                let payload: Vec<u8> = (0..64u32)
                    .flat_map(|i| ((sample + i) as i32 - 32).to_le_bytes())
                    .collect();
                match broker.publish(QueueKind::Data, stream, t, t, &payload) {
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "record dropped"),
                }
            }
            sample = sample.wrapping_add(64);
        }

        if last_timing.elapsed() >= Duration::from_secs(1)
            && !broker.check_and_update_block_mask(Some(QueueKind::Timing))
        {
            last_timing = Instant::now();
            let t = now_secs();
            let _ = broker.publish(QueueKind::Timing, StreamId::BLANK, t, t, b"LOCK 100%");
        }

        if broker.take_reconfigure_request() {
            info!("reconfigure requested, nothing to reload in the synthetic link");
        }

        std::thread::sleep(config.poll_interval());
    }

    info!(gap_events = broker.gap_events(), "broker shutting down");
    Ok(())
}
