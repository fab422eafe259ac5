//! End-to-end lifecycle scenarios through the public API, driven against
//! the recording test engine.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use beltane_studio::{
    Connector, Notifier, SampleFormat, Server, Studio, StudioConfig, TestServer,
};

struct Harness {
    studio: Arc<Studio>,
    servers: Arc<Mutex<Vec<Arc<TestServer>>>>,
    notifications: crossbeam_channel::Receiver<beltane_studio::Notification>,
}

fn harness() -> Harness {
    let servers: Arc<Mutex<Vec<Arc<TestServer>>>> = Arc::new(Mutex::new(Vec::new()));
    let produced = Arc::clone(&servers);
    let connect: Connector = Box::new(move |_| {
        let server = TestServer::new();
        produced.lock().unwrap().push(Arc::clone(&server));
        Ok(server as Arc<dyn Server>)
    });
    let config = StudioConfig {
        midi_in_bridge: PathBuf::from("/nonexistent/midi-in"),
        midi_out_bridge: PathBuf::from("/nonexistent/midi-out"),
        synthdef_dir: PathBuf::from("/defs"),
        rand_stream_path: PathBuf::from("/buffers/rand-stream.wav"),
        ..StudioConfig::default()
    };
    let (notifier, notifications) = Notifier::new();
    let studio = Studio::new(config, connect, notifier).unwrap();
    Harness {
        studio,
        servers,
        notifications,
    }
}

fn write_wav(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..128i16 {
        writer.write_sample(i).unwrap();
        writer.write_sample(-i).unwrap();
    }
    writer.finalize().unwrap();
    path
}

#[test]
fn buffer_cache_lifecycle_scenario() {
    let h = harness();
    let studio = &h.studio;

    // allocate "click" 2s → id A, ready
    let (a, hit) = studio.allocate_buffer("click", Some(2.0)).unwrap();
    assert!(!hit);
    a.wait_ready(Duration::from_secs(1)).unwrap();

    // same duration again → same id, cache hit
    let (a2, hit) = studio.allocate_buffer("click", Some(2.0)).unwrap();
    assert!(hit);
    assert_eq!(a.id(), a2.id());

    // different duration → new id, old freed
    let (b, hit) = studio.allocate_buffer("click", Some(4.0)).unwrap();
    assert!(!hit);
    assert_ne!(b.id(), a.id());
    let server = Arc::clone(h.servers.lock().unwrap().last().unwrap());
    assert!(server.buffers_freed().contains(&a.id()));

    // free → true, then false
    assert!(studio.free_buffer("click").unwrap());
    assert!(!studio.free_buffer("click").unwrap());
}

#[test]
fn concurrent_sample_loads_share_one_buffer() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let sample = write_wav(dir.path(), "kick.wav");

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let studio = Arc::clone(&h.studio);
            let sample = sample.clone();
            thread::spawn(move || studio.load_sample(&sample).unwrap().0.id())
        })
        .collect();
    let ids: Vec<i32> = handles.into_iter().map(|t| t.join().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    let server = Arc::clone(h.servers.lock().unwrap().last().unwrap());
    // one read-allocation for the rand stream at init, exactly one for the sample
    assert_eq!(
        server.count(|op| matches!(
            op,
            beltane_studio::server::TestOp::AllocBufferRead { .. }
        )),
        2
    );
}

#[test]
fn reboot_restores_caches_and_reports_progress() {
    let h = harness();
    let studio = &h.studio;
    let dir = tempfile::tempdir().unwrap();
    let sample = write_wav(dir.path(), "snare.wav");

    studio.load_sample(&sample).unwrap();
    studio.set_bit_depth(24).unwrap();
    assert!(studio.reboot());

    // previously cached sample paths come back after a bounded delay
    let deadline = Instant::now() + Duration::from_secs(2);
    while !studio.sample_loaded(&sample) {
        assert!(Instant::now() < deadline, "sample did not repopulate");
        thread::sleep(Duration::from_millis(10));
    }

    // the operator channel saw the reboot progress messages
    let messages: Vec<String> = h.notifications.try_iter().map(|n| n.message).collect();
    assert!(messages.iter().any(|m| m.contains("Rebooting audio server")));
    assert!(messages.iter().any(|m| m.contains("Audio server ready")));

    // recordings use the configured bit depth on the fresh handle
    assert!(studio.recording_start(Path::new("/tmp/take.wav"), 0).unwrap());
    let server = Arc::clone(h.servers.lock().unwrap().last().unwrap());
    let stream = server
        .find(|op| matches!(op, beltane_studio::server::TestOp::OpenBufferStream { .. }))
        .unwrap();
    match stream {
        beltane_studio::server::TestOp::OpenBufferStream {
            block_size, format, ..
        } => {
            assert_eq!(block_size, 65536);
            assert_eq!(format, SampleFormat::Int24);
        }
        _ => unreachable!(),
    }
    assert!(studio.recording_stop(0).unwrap());
}

#[test]
fn recording_per_bus_protocol() {
    let h = harness();
    let studio = &h.studio;
    let path = Path::new("/tmp/session.wav");

    assert!(!studio.recording_stop(0).unwrap());
    assert!(studio.recording_start(path, 0).unwrap());
    assert!(!studio.recording_start(path, 0).unwrap());
    assert!(studio.recording_start(path, 1).unwrap());

    assert!(studio.recording_stop(0).unwrap());
    assert!(studio.recording_stop(1).unwrap());
    assert!(!studio.is_recording());
    assert!(studio.recording_start(path, 0).unwrap());
}

#[test]
fn shutdown_is_quiet_and_final() {
    let h = harness();
    h.studio.pause(true).unwrap();
    h.studio.shutdown();
    // shutting down twice must not panic or error
    h.studio.shutdown();
}
