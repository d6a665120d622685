use aoatrack::{
    local_to_polar, project, IngestOutcome, Pose, TargetTracker, TrackerConfig,
    DEFAULT_MIN_HEADING_SPEED,
};

fn main() -> anyhow::Result<()> {
    println!("Tracking a tag walking across the anchor's field of view...");

    let config = TrackerConfig::default();
    config.validate().map_err(anyhow::Error::msg)?;
    let tracker = TargetTracker::new(config);

    // Carrier parked at (10, 20) facing map +y
    let pose = Pose::new(10.0, 20.0, std::f64::consts::FRAC_PI_2);

    for step in 0..40 {
        let t = step as f64 * 0.1;
        let (x, y) = (-1.0 + 0.5 * t, 2.0);

        // Small deterministic wobble standing in for sensor noise
        let wobble = ((step * 7919) % 11) as f64 - 5.0;
        let (d, a) = local_to_polar(x, y);
        let distance_mm = (d * 1000.0 + wobble * 3.0).round() as i32;
        let angle_centidegrees = (a.to_degrees() * 100.0 + wobble * 5.0).round() as i16;

        // Inject one glitch reading
        let outcome = if step == 20 {
            tracker.ingest(1, distance_mm, angle_centidegrees.saturating_add(15_000), t)
        } else {
            tracker.ingest(1, distance_mm, angle_centidegrees, t)
        };
        if let IngestOutcome::Rejected(reason) = outcome {
            println!("  t={:.1}s: measurement rejected ({:?})", t, reason);
            continue;
        }

        if step % 5 == 0 {
            if let Some(track) = tracker.get_state(1) {
                let global = project(&track, &pose, t, DEFAULT_MIN_HEADING_SPEED);
                println!(
                    "  t={:.1}s local=({:+.2}, {:+.2}) v=({:+.2}, {:+.2}) conf={:.2} init={} global=({:.2}, {:.2})",
                    t, track.x, track.y, track.vx, track.vy, track.confidence, track.initialized,
                    global.x, global.y
                );
            }
        }
    }

    let counters = tracker.counters();
    println!(
        "\nAccepted {} measurements, rejected {}, speed capped {} times",
        counters.accepted,
        counters.rejected(),
        counters.speed_capped
    );

    Ok(())
}
