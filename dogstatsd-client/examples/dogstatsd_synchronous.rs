use dogstatsd_client::{DogStatsDBuilder, EventOptions, MetricOptions, ServiceCheckOptions, ServiceCheckStatus};
use metrics::Label;
use rand::Rng;

fn main() {
    tracing_subscriber::fmt::init();

    let client = DogStatsDBuilder::default()
        .with_port(9125)
        .with_single_thread(true)
        .with_global_tags([Label::new("system", "foo")])
        .build()
        .expect("failed to build DogStatsD client");

    client.gauge("testing", 42.0, &MetricOptions::default()).expect("metric too large");
    client
        .event("Example started", "Pretending to do some work.", &EventOptions::default(), &[])
        .expect("event too large");
    client
        .service_check("example.up", ServiceCheckStatus::Ok, &ServiceCheckOptions::default(), &[])
        .expect("service check too large");

    let mut rng = rand::rng();
    let sampled = MetricOptions::default().sample_rate(0.1);

    // Loop over and over, pretending to do some work.
    loop {
        client.increment("tcp_server_loops", &sampled).expect("metric too large");
        client.time("tcp_server_loop_delta", &sampled, || {
            client.histogram("work_units", rng.random_range(0.0..1.0), &sampled).expect("metric too large");
        });

        let lucky = rand::random_bool(0.75);
        let tags = [Label::new("lucky", if lucky { "yes" } else { "no" })];
        let outcome = if lucky { "hit" } else { "miss" };
        client.set("iteration_outcomes", outcome, &MetricOptions::with_tags(&tags)).expect("metric too large");
    }
}
