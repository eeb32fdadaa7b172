use chrono::{Duration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::seq::index::sample as sample_indices;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, NormalError};
use serde::Serialize;

use crate::types::metric::MetricPoint;

/// Synthetic points plus the rows that received an injected spike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleBatch {
    pub points: Vec<MetricPoint>,
    /// Spiked row indices, ascending.
    pub spikes: Vec<usize>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Generate `n` synthetic points spaced `freq_seconds` apart from `start`,
/// with a few injected cpu/disk/latency spikes. Deterministic for a seed.
pub fn generate(
    n: usize,
    freq_seconds: i64,
    seed: u64,
    start: NaiveDateTime,
) -> Result<SampleBatch, NormalError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let cpu = Normal::<f64>::new(28.0, 6.0)?;
    let ram = Normal::<f64>::new(58.0, 5.0)?;
    let disk = Normal::<f64>::new(18.0, 4.0)?;
    let latency = Normal::<f64>::new(110.0, 12.0)?;

    let mut points: Vec<MetricPoint> = (0..n)
        .map(|i| {
            let ts = start + Duration::seconds(i as i64 * freq_seconds);
            MetricPoint {
                ts: ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
                cpu: cpu.sample(&mut rng).clamp(1.0, 95.0),
                ram: ram.sample(&mut rng).clamp(10.0, 95.0),
                disk: disk.sample(&mut rng).clamp(1.0, 95.0),
                latency_ms: latency.sample(&mut rng).clamp(20.0, 1500.0),
            }
        })
        .collect();

    let cpu_spike = Normal::<f64>::new(35.0, 10.0)?;
    let disk_spike = Normal::<f64>::new(30.0, 10.0)?;
    let latency_spike = Normal::<f64>::new(500.0, 200.0)?;

    let count = ((n as f64 * 0.02) as usize).max(3).min(n);
    let mut spikes = sample_indices(&mut rng, n, count).into_vec();
    for &idx in &spikes {
        let p = &mut points[idx];
        p.cpu = (p.cpu + cpu_spike.sample(&mut rng)).clamp(1.0, 99.0);
        p.disk = (p.disk + disk_spike.sample(&mut rng)).clamp(1.0, 99.0);
        p.latency_ms = (p.latency_ms + latency_spike.sample(&mut rng)).clamp(20.0, 2000.0);
    }
    spikes.sort_unstable();

    for p in &mut points {
        p.cpu = round2(p.cpu);
        p.ram = round2(p.ram);
        p.disk = round2(p.disk);
        p.latency_ms = round2(p.latency_ms);
    }
    Ok(SampleBatch { points, spikes })
}
