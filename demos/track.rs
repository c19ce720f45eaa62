//! Drive a learning session with a synthetic camera/IMU feed, poll it like a
//! UI would, and save an area description once relocalized.
//!
//! Usage: cargo run --example track [store_dir]
//!
//! `AREATRACK_LOAD_LATEST=1` relocalizes against the newest saved record;
//! `AREATRACK_AUTO_RECOVERY=0` disables automatic recovery.

use areatrack::config::read_env_bool;
use areatrack::{
    channel_service, AdfStore, CameraFrame, Feature, FramePair, ImuSample, SensorFeed, Session,
    SessionConfig, SessionFlags, TrackerTuning,
};
use nalgebra::{Isometry3, Point3, Vector3};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RADIUS_M: f64 = 0.5;
const OMEGA: f64 = 0.6;
const IMU_HZ: u64 = 200;
const FRAME_EVERY: u64 = 7;

fn main() {
    env_logger::init();

    let root = std::env::args().nth(1).unwrap_or_else(|| "adf_store".into());
    let store = match AdfStore::open(&root) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to open store {}: {}", root, e);
            std::process::exit(1);
        }
    };

    let session = Session::new(store.clone(), TrackerTuning::from_env());
    let (feed, mut service) = channel_service(1024);

    let mut flags = SessionFlags::AREA_LEARNING;
    if read_env_bool("AREATRACK_AUTO_RECOVERY", true) {
        flags |= SessionFlags::AUTO_RECOVERY;
    }
    if read_env_bool("AREATRACK_LOAD_LATEST", false) {
        flags |= SessionFlags::LOAD_ADF_ON_START;
    }
    let config = SessionConfig::new(flags);
    if let Err(e) = session.connect(&mut service, config) {
        eprintln!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let feeder = {
        let running = running.clone();
        std::thread::Builder::new()
            .name("synthetic-feed".into())
            .spawn(move || feed_loop(feed, running))
            .unwrap_or_else(|e| {
                eprintln!("Failed to spawn feeder: {}", e);
                std::process::exit(1);
            })
    };

    println!("Tracking (10 s)...");
    let start = Instant::now();
    let mut saved = None;
    while start.elapsed() < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(100));

        if let Some(pose) = session.current_pose(FramePair::SOS_DEVICE) {
            let e = pose.euler_deg();
            println!(
                "{:<12}  pos=[{:+.3}, {:+.3}, {:+.3}]  yaw={:+6.1}  conf={:.2}  reloc={}",
                session.current_status().to_string(),
                pose.translation[0],
                pose.translation[1],
                pose.translation[2],
                e[2],
                pose.confidence,
                session.is_relocalized(),
            );
        }
        for event in session.events().drain() {
            println!("  event  {}", event);
        }

        if saved.is_none() && session.is_relocalized() {
            match session.begin_save("demo room") {
                Ok(pending) => saved = Some(pending),
                Err(e) => eprintln!("Save not started: {}", e),
            }
        }
        if let Some(result) = saved.as_ref().and_then(|p| p.try_result()) {
            match result {
                Ok(record) => println!("Saved area description {}", record.uuid),
                Err(e) => eprintln!("Save failed: {}", e),
            }
        }
    }

    if let Some(report) = session.pose_report(FramePair::SOS_DEVICE) {
        println!("{}", report);
    }

    running.store(false, Ordering::Relaxed);
    let _ = feeder.join();
    session.disconnect();

    println!("\nStored area descriptions:");
    for summary in store.list_all() {
        println!("  {}  {}", summary.uuid, summary.name.as_deref().unwrap_or("<unnamed>"));
    }
}

/// Landmarks on the walls of a 4 m room.
fn room() -> Vec<(u64, Vector3<f64>)> {
    let mut points = Vec::new();
    let mut id = 1u64;
    for i in 0..8 {
        for h in [0.5, 1.2, 1.9] {
            let a = i as f64 * std::f64::consts::TAU / 8.0;
            points.push((id, Vector3::new(2.0 * a.cos(), 2.0 * a.sin(), h)));
            id += 1;
        }
    }
    points
}

fn device_pose(t: f64) -> Isometry3<f64> {
    let a = OMEGA * t;
    Isometry3::new(
        Vector3::new(RADIUS_M * a.cos(), RADIUS_M * a.sin(), 1.2),
        Vector3::new(0.0, 0.0, a),
    )
}

fn feed_loop(feed: SensorFeed, running: Arc<AtomicBool>) {
    let landmarks = room();
    let period = Duration::from_micros(1_000_000 / IMU_HZ);
    let mut n: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let ts = 1 + n * 1_000_000 / IMU_HZ;
        let t = ts as f64 * 1e-6;
        let pose = device_pose(t);

        // Specific force: centripetal acceleration minus gravity, in the body frame.
        let a = OMEGA * t;
        let accel_world = Vector3::new(
            -RADIUS_M * OMEGA * OMEGA * a.cos(),
            -RADIUS_M * OMEGA * OMEGA * a.sin(),
            9.81,
        );
        let accel_body = pose.rotation.inverse() * accel_world;
        feed.push_imu(ImuSample {
            timestamp_us: ts,
            accelerometer: [accel_body.x, accel_body.y, accel_body.z],
            gyroscope: [0.0, 0.0, OMEGA],
        });

        if n % FRAME_EVERY == 0 {
            let device_t_world = pose.inverse();
            let features = landmarks
                .iter()
                .map(|(id, p)| {
                    let local = device_t_world * Point3::from(*p);
                    Feature {
                        descriptor: *id,
                        position: [local.x, local.y, local.z],
                    }
                })
                .collect();
            feed.push_frame(CameraFrame {
                timestamp_us: ts,
                features,
            });
        }

        n += 1;
        std::thread::sleep(period);
    }
}
