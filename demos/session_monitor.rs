use std::sync::Arc;
use tracing::{error, info};
use treadsync::{BtleplugLink, ChannelSink, FtmsDevice, Result, Scheduler, SinkEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃 Treadsync Session Monitor Example");

    let link = match BtleplugLink::new().await {
        Ok(link) => Arc::new(link),
        Err(e) => {
            error!("❌ No usable Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    let (sink, mut events) = ChannelSink::channel();
    let mut scheduler = Scheduler::default();
    scheduler.add(FtmsDevice::new(
        &FtmsDevice::default_config("treadmill"),
        link,
        scheduler.arbiter(),
        Arc::new(sink),
    ));

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SinkEvent::Started => println!("\n▶️  Session started"),
                SinkEvent::Ended => println!("\n⏹️  Session ended"),
                SinkEvent::Telemetry(sample) => println!(
                    "│ {:6} steps │ {:8.1} m │ {:5} s │ {:5.1} km/h │",
                    sample.steps,
                    sample.distance_meters,
                    sample.duration_seconds,
                    sample.speed_kph.unwrap_or(0.0)
                ),
            }
        }
    });

    info!("Waiting for a treadmill, press Ctrl+C to stop");
    scheduler.run_until(tokio::signal::ctrl_c()).await;

    info!("👋 Done");
    Ok(())
}
