use std::time::{Duration, Instant};

use dogstatsd_client::{DogStatsDBuilder, MetricOptions};

fn main() {
    tracing_subscriber::fmt::init();

    let client = DogStatsDBuilder::default()
        .with_port(9125)
        .with_telemetry_flush_interval(None)
        .build()
        .expect("failed to build DogStatsD client");

    client.increment("idle_metric", &MetricOptions::default()).expect("metric too large");

    // Loop over and over, incrementing our counter every 10 seconds or so.
    let mut last_update = Instant::now();
    loop {
        if last_update.elapsed() > Duration::from_secs(10) {
            client.increment("idle_metric", &MetricOptions::default()).expect("metric too large");
            last_update = Instant::now();
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}
