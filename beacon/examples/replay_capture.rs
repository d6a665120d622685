//! Replay a raw anchor capture (or a simulated walk) through the pipeline
//!
//! ```text
//! cargo run --example replay_capture -- [capture.bin] [config.json]
//! ```

use aoa_beacon::{
    BeaconConfig, BeaconPipeline, ByteSource, ChannelSource, EventKind, Frame, PipelineEvent, Pose,
    ReaderSource,
};
use aoatrack::local_to_polar;
use std::fs::File;
use std::thread;
use std::time::Duration;

fn simulated_walk() -> ChannelSource {
    let (tx, source) = ChannelSource::pair(256);
    thread::spawn(move || {
        for step in 0..60 {
            let t = step as f64 * 0.05;
            // Two tags: one crossing left to right, one walking away
            for (tag_id, (x, y)) in [(1u8, (-1.5 + 0.6 * t, 2.0)), (2u8, (0.5, 1.0 + 0.4 * t))] {
                let (d, a) = local_to_polar(x, y);
                let frame = Frame::measurement(
                    1,
                    tag_id,
                    (d * 1000.0).round() as i32,
                    (a.to_degrees() * 100.0).round() as i16,
                );
                let mut bytes = frame.encode().to_vec();
                // Line noise between frames
                bytes.extend_from_slice(&[0x00, 0x55, 0x13]);
                if tx.send(bytes).is_err() {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
    });
    source
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(2) {
        Some(path) => BeaconConfig::from_file(path)?,
        None => BeaconConfig::default(),
    };

    let source: Box<dyn ByteSource> = match args.get(1) {
        Some(path) => {
            println!("Replaying capture {}", path);
            Box::new(ReaderSource::new(File::open(path)?, 4096, path.clone()))
        }
        None => {
            println!("No capture given, simulating two walking tags");
            Box::new(simulated_walk())
        }
    };

    let pipeline = BeaconPipeline::start(config, Some(source), None)?;
    pipeline.push_pose(Pose::new(10.0, 20.0, std::f64::consts::FRAC_PI_2))?;

    pipeline.subscribe_fn(&[EventKind::Global], |event| {
        if let PipelineEvent::Global(global) = event {
            println!(
                "  tag {} global=({:.2}, {:.2}) heading={:.0}deg{} conf={:.2}",
                global.tag_id,
                global.x,
                global.y,
                global.heading.heading.to_degrees(),
                if global.heading.reliable { "" } else { "?" },
                global.confidence
            );
        }
    });

    // Keep the carrier pose fresh while the replay runs
    loop {
        pipeline.push_pose(Pose::new(10.0, 20.0, std::f64::consts::FRAC_PI_2))?;
        thread::sleep(Duration::from_millis(100));
        let status = pipeline.status();
        if !status.transport_connected && status.last_transport_error.is_some() {
            break;
        }
    }

    for track in pipeline.tracker().snapshot_all() {
        println!(
            "Final tag {}: local=({:+.2}, {:+.2}) v=({:+.2}, {:+.2}) updates={}",
            track.tag_id, track.x, track.y, track.vx, track.vy, track.update_count
        );
    }

    let report = pipeline.stop();
    println!("{}", serde_json::to_string_pretty(&pipeline.status())?);
    println!("Stopped in {} ms", report.elapsed_ms);

    Ok(())
}
