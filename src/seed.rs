//! First-run demo data so a fresh console has something to show.
//!
//! Each table is only seeded while it is empty, so running this on every
//! start-up is safe.

use chrono::Utc;
use rand::Rng;

use crate::database::{Database, DatabaseError};
use crate::models::{format_timestamp, MissionMode, MissionStatus, NewEvent, TelemetryPoint};

const SEED_TELEMETRY_SAMPLES: i64 = 30;

const SEED_EVENTS: [&str; 3] = [
    "System boot complete",
    "Telemetry link nominal",
    "Leak sensor test passed",
];

const SEED_CLIPS: [(&str, &str); 2] = [
    ("Startup test", "https://example.com/startup.mp4"),
    ("Turbidity spike", "https://example.com/turbidity.mp4"),
];

pub fn seed_demo_data<R: Rng>(db: &Database, rng: &mut R) -> Result<(), DatabaseError> {
    let start = std::time::Instant::now();
    // Checked up front: creating the mission below logs an event of its own.
    let seed_events = db.count_events()? == 0;

    let mission_id = if db.count_missions()? == 0 {
        let mission = db.create_mission("Bench Test", &MissionStatus::Active, &MissionMode::Manual)?;
        Some(mission.id)
    } else {
        db.default_mission_id()?
    };

    db.ensure_autonomy_state()?;

    if seed_events {
        for message in SEED_EVENTS {
            db.append_event(&NewEvent::info(None, message))?;
        }
    }

    if db.count_telemetry()? == 0 {
        let now = Utc::now().naive_utc();
        for i in 0..SEED_TELEMETRY_SAMPLES {
            let ts = now - chrono::Duration::seconds(SEED_TELEMETRY_SAMPLES - i);
            let point = TelemetryPoint {
                yaw: Some(rng.gen_range(-3.0..3.0)),
                pitch: Some(rng.gen_range(-2.0..2.0)),
                roll: Some(rng.gen_range(-2.0..2.0)),
                battery_v: Some(15.8 + rng.gen_range(-0.4..0.1)),
                battery_i: Some(3.5 + rng.gen_range(-1.0..1.0)),
                water_temp: Some(21.0 + rng.gen_range(-1.0..1.0)),
                turbidity: Some(0.2 + rng.gen_range(0.0..0.4)),
                leak: false,
                internal_temp: Some(32.0 + rng.gen_range(-1.0..1.0)),
            };
            db.insert_telemetry(mission_id, &format_timestamp(ts), &point)?;
        }
    }

    if db.count_video_clips()? == 0 {
        for (label, url) in SEED_CLIPS {
            db.create_video_clip(None, label, url)?;
        }
    }

    log::info!(
        "Demo data check completed in {:.1}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    #[test]
    fn test_seed_populates_empty_store_once() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("seed.db")).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        seed_demo_data(&db, &mut rng).unwrap();
        assert_eq!(db.count_missions().unwrap(), 1);
        assert_eq!(db.count_telemetry().unwrap(), SEED_TELEMETRY_SAMPLES);
        assert_eq!(db.count_video_clips().unwrap(), 2);
        assert!(db.has_autonomy_state().unwrap());
        // three seed events plus "Mission created"
        assert_eq!(db.count_events().unwrap(), 4);

        seed_demo_data(&db, &mut rng).unwrap();
        assert_eq!(db.count_missions().unwrap(), 1);
        assert_eq!(db.count_telemetry().unwrap(), SEED_TELEMETRY_SAMPLES);
        assert_eq!(db.count_events().unwrap(), 4);

        let mission_id = db.default_mission_id().unwrap();
        let samples = db.latest_telemetry(100).unwrap();
        assert!(samples.iter().all(|s| s.mission_id == mission_id));
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
