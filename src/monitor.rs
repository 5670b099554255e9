//! Live observer: a terminal RTT/congestion snapshot printer plus a
//! static 2x2 PNG panel (throughput / cwnd / RTT / packets-in-flight)
//! rendered once from the accumulated sample history at shutdown, since
//! a CLI process has no display to animate a live chart into.

use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;
use tracing::warn;

use crate::endpoint::{CongestionStats, Endpoint, RttStats};
use crate::metrics::{MetricsSink, PacketMetric, ThroughputSample};

/// Prints one RTT/congestion snapshot to stdout, matching the shape of
/// the source's periodic monitor output.
pub fn print_snapshot(rtt: &RttStats, congestion: &CongestionStats) {
    println!("[RTT STATS]");
    println!("  avg: {:.6}s", rtt.avg_secs);
    println!("  min/max: {:.6}s / {:.6}s", rtt.min_secs, rtt.max_secs);
    println!("  dev: {:.6}s", rtt.dev_secs);
    println!("  rto: {:.3}s", rtt.rto_secs);
    println!("  samples: {}", rtt.sample_count);
    println!();
    println!("[CONGESTION STATS]");
    println!("  state: {:?}", congestion.state);
    println!("  cwnd: {:.2}", congestion.cwnd);
    println!("  ssthresh: {:.2}", congestion.ssthresh);
    println!("  in flight: {}", congestion.in_flight);
    println!("  bytes acked: {}", congestion.bytes_acked_total);
    println!("{}", "-".repeat(60));
}

pub fn snapshot_from_endpoint(endpoint: &Endpoint) {
    print_snapshot(&endpoint.rtt_stats(), &endpoint.congestion_stats());
}

type Panel<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

/// Renders a 2x2 PNG panel (throughput, cwnd/ssthresh, RTT,
/// packets-in-flight) from the sink's accumulated history into
/// `out_dir/trudp_panel.png`.
pub fn render_panel(sink: &MetricsSink, out_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join("trudp_panel.png");

    let (packets, throughput) = sink.snapshot();
    if packets.is_empty() && throughput.is_empty() {
        warn!("no samples recorded; panel render skipped");
        return Ok(());
    }

    let root = BitMapBackend::new(&path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((2, 2));

    draw_throughput(&panels[0], &throughput)?;
    draw_cwnd(&panels[1], &packets)?;
    draw_rtt(&panels[2], &packets)?;
    draw_in_flight(&panels[3], &throughput)?;

    root.present()?;
    Ok(())
}

fn draw_throughput(
    area: &Panel,
    samples: &[ThroughputSample],
) -> Result<(), Box<dyn std::error::Error>> {
    let max_t = samples.iter().map(|s| s.elapsed_secs).fold(1.0, f64::max);
    let max_bytes = samples.iter().map(|s| s.bytes_acked).max().unwrap_or(1) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption("Throughput (bytes acked)", ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..max_t, 0.0..max_bytes.max(1.0))?;
    chart.configure_mesh().draw()?;
    chart.draw_series(LineSeries::new(
        samples.iter().map(|s| (s.elapsed_secs, s.bytes_acked as f64)),
        &BLUE,
    ))?;
    Ok(())
}

fn draw_cwnd(area: &Panel, metrics: &[PacketMetric]) -> Result<(), Box<dyn std::error::Error>> {
    let max_t = metrics.iter().map(|m| m.elapsed_secs).fold(1.0, f64::max);
    let max_cwnd = metrics.iter().map(|m| m.cwnd).fold(1.0, f64::max);

    let mut chart = ChartBuilder::on(area)
        .caption("Congestion window", ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..max_t, 0.0..max_cwnd)?;
    chart.configure_mesh().draw()?;
    chart.draw_series(LineSeries::new(
        metrics.iter().map(|m| (m.elapsed_secs, m.cwnd)),
        &RED,
    ))?;
    chart.draw_series(LineSeries::new(
        metrics.iter().map(|m| (m.elapsed_secs, m.ssthresh)),
        &GREEN,
    ))?;
    Ok(())
}

fn draw_rtt(area: &Panel, metrics: &[PacketMetric]) -> Result<(), Box<dyn std::error::Error>> {
    let samples: Vec<(f64, f64)> = metrics
        .iter()
        .filter_map(|m| m.rtt_secs.map(|r| (m.elapsed_secs, r)))
        .collect();
    let max_t = samples.iter().map(|(t, _)| *t).fold(1.0, f64::max);
    let max_rtt = samples.iter().map(|(_, r)| *r).fold(0.01, f64::max);

    let mut chart = ChartBuilder::on(area)
        .caption("RTT", ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..max_t, 0.0..max_rtt)?;
    chart.configure_mesh().draw()?;
    chart.draw_series(LineSeries::new(samples, &MAGENTA))?;
    Ok(())
}

fn draw_in_flight(
    area: &Panel,
    samples: &[ThroughputSample],
) -> Result<(), Box<dyn std::error::Error>> {
    let max_t = samples.iter().map(|s| s.elapsed_secs).fold(1.0, f64::max);
    let max_in_flight = samples.iter().map(|s| s.packets_in_flight).max().unwrap_or(1) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption("Packets in flight", ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..max_t, 0.0..max_in_flight.max(1.0))?;
    chart.configure_mesh().draw()?;
    chart.draw_series(LineSeries::new(
        samples.iter().map(|s| (s.elapsed_secs, s.packets_in_flight as f64)),
        &BLACK,
    ))?;
    Ok(())
}
