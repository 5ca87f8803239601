use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use dos_detection_service::core::{DetectionConfig, Detector, DetectorState, TrafficEvent, WindowStats};
use std::net::{IpAddr, Ipv4Addr};

/// One second of traffic from `sources` addresses, `per_source` events each
fn traffic(sources: u32, per_source: u32) -> Vec<TrafficEvent> {
    let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut events = Vec::with_capacity((sources * per_source) as usize);
    for n in 0..per_source {
        let at = start + Duration::microseconds(i64::from(n) * 1_000_000 / i64::from(per_source));
        for s in 0..sources {
            let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + s));
            events.push(TrafficEvent::new(ip, at, 512));
        }
    }
    events
}

fn window_stats_benchmark(c: &mut Criterion) {
    let config = DetectionConfig::default();
    let events = traffic(1_000, 50);

    c.bench_function("window_stats_record_50k", |b| {
        b.iter_batched(
            || WindowStats::from_config(&config),
            |mut stats| {
                for event in &events {
                    stats.record(black_box(event));
                }
                stats
            },
            BatchSize::LargeInput,
        )
    });
}

fn detection_tick_benchmark(c: &mut Criterion) {
    let config = DetectionConfig { flood_pps: 40.0, ..Default::default() };
    let detector = Detector::new(config.clone()).unwrap();
    let events = traffic(1_000, 50);
    let now = Utc.timestamp_opt(1_700_000_001, 0).unwrap();

    c.bench_function("detector_tick_1000_sources", |b| {
        b.iter_batched(
            || (DetectorState::new(&config), events.clone()),
            |(mut state, events)| detector.tick(&mut state, events, black_box(now)),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, window_stats_benchmark, detection_tick_benchmark);
criterion_main!(benches);
