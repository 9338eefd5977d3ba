use anyhow::Result;
use petalsonic_pool::{
    AudioEngineContext, AudioEngineDesc, CpalBackend, MemoryLoader, PcmClip, PlayId, Pose, Quat,
    SoundHandle, SymphoniaLoader, Vec3, VirtualBackend,
};
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();

    // Usage: pool_demo [--virtual] [path/to/sound]
    let args: Vec<String> = std::env::args().skip(1).collect();
    let headless = args.iter().any(|a| a == "--virtual");
    let path = args.iter().find(|a| !a.starts_with("--")).cloned();

    let desc = AudioEngineDesc::new().slot_count(8);
    let mut engine = if headless {
        let (backend, _probe) = VirtualBackend::new();
        let mut backend = Some(backend);
        AudioEngineContext::start(desc, MemoryLoader::new(), move || {
            backend
                .take()
                .ok_or_else(|| petalsonic_pool::PetalSonicError::AudioDevice("already opened".into()))
        })?
    } else {
        let backend_desc = desc.clone();
        AudioEngineContext::start(desc, SymphoniaLoader, move || CpalBackend::open(&backend_desc))?
    };

    let sound = match &path {
        Some(path) => {
            log::info!("Loading {}", path);
            engine.load_sound(path)?
        }
        None => SoundHandle::from_clip("tone", tone(440.0, Duration::from_secs(2))?),
    };

    log::info!("=== One-shot on the left ===");
    let left = play_at(&engine, &sound, Vec3::new(-2.0, 0.0, 0.0), false);
    run_for(&engine, Duration::from_millis(2500));
    log::info!("One-shot still live: {}", left.is_some_and(|id| engine.is_playing(id)));

    log::info!("=== Looping on the right, then fade out ===");
    if let Some(id) = play_at(&engine, &sound, Vec3::new(2.0, 0.0, 0.0), true) {
        run_for(&engine, Duration::from_secs(2));
        engine.fade_out_by_play_id(id, Duration::from_secs(1));
        run_for(&engine, Duration::from_millis(1500));
        log::info!("Looping source still live after fade: {}", engine.is_playing(id));
    }

    log::info!("=== Listener turns around ===");
    let behind = play_at(&engine, &sound, Vec3::new(0.0, 0.0, 2.0), true);
    engine.set_listener_pose(Pose::new(Vec3::ZERO, Quat::from_rotation_y(std::f32::consts::PI)))?;
    run_for(&engine, Duration::from_secs(1));
    if let Some(id) = behind {
        engine.stop_by_play_id(id);
    }

    log::info!("Free slots before shutdown: {}/{}", engine.free_slots(), engine.slot_count());
    engine.shutdown()?;
    log::info!("Demo finished");
    Ok(())
}

fn play_at(
    engine: &AudioEngineContext,
    sound: &SoundHandle,
    position: Vec3,
    looping: bool,
) -> Option<PlayId> {
    let Some(mut source) = engine.source_begin_new() else {
        log::warn!("Voice pool exhausted");
        return None;
    };
    source.set_position(position).set_looping(looping);
    Some(source.play(sound))
}

/// Keeps draining engine messages the way a game loop would once per frame.
fn run_for(engine: &AudioEngineContext, duration: Duration) {
    let frame = Duration::from_millis(16);
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        engine.process_messages();
        thread::sleep(frame);
        elapsed += frame;
    }
}

fn tone(frequency: f32, duration: Duration) -> Result<PcmClip> {
    let sample_rate = 48000;
    let frames = (duration.as_secs_f32() * sample_rate as f32) as usize;
    let samples = (0..frames)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (t * frequency * std::f32::consts::TAU).sin() * 0.2
        })
        .collect();
    Ok(PcmClip::new(samples, sample_rate, 1)?)
}
