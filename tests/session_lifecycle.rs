use std::fs;

use tempfile::tempdir;

use engagement_monitor::session::{RESULTS_LOG_FILE, RESULTS_LOG_HEADER, SUMMARY_FILE};
use engagement_monitor::{
    start_session, summarize_log, EngagementError, EngagementVerdict, SessionOptions,
};
use engagement_monitor::EngagementLevel::{self, *};

fn bucket_files(dir: &std::path::Path, level: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.join("engagement").join(level))
        .expect("bucket dir")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn start_creates_layout_and_header() {
    let root = tempdir().unwrap();
    let mut session = start_session("alice", "s1", root.path(), SessionOptions::default()).unwrap();
    let dir = root.path().join("alice").join("s1");

    for level in ["0", "1", "2", "3"] {
        assert!(dir.join("engagement").join(level).is_dir());
    }
    let log = fs::read_to_string(dir.join(RESULTS_LOG_FILE)).unwrap();
    assert_eq!(log, format!("{RESULTS_LOG_HEADER}\n"));
    assert!(session.is_active());

    session.stop_session().unwrap();
}

#[test]
fn recorded_frames_land_in_log_and_buckets() {
    let root = tempdir().unwrap();
    let mut session = start_session("bob", "s1", root.path(), SessionOptions::default()).unwrap();
    let dir = session.layout().dir().to_path_buf();

    let levels: [EngagementLevel; 5] = [Level2, NoDetection, Level3, Level2, Level0];
    let mut names = Vec::new();
    for level in levels {
        let record = session
            .record_frame(b"\xFF\xD8jpeg\xFF\xD9", level, 0.9, 0.05)
            .unwrap();
        names.push(record.frame_name);
    }
    assert_eq!(session.frames_recorded(), 5);

    let mut two = vec![names[0].clone(), names[3].clone()];
    two.sort();
    assert_eq!(bucket_files(&dir, "2"), two);
    assert_eq!(bucket_files(&dir, "3"), vec![names[2].clone()]);
    assert_eq!(bucket_files(&dir, "0"), vec![names[4].clone()]);
    assert!(bucket_files(&dir, "1").is_empty());
    assert_eq!(
        fs::read(dir.join("engagement/3").join(&names[2])).unwrap(),
        b"\xFF\xD8jpeg\xFF\xD9"
    );

    let log = fs::read_to_string(dir.join(RESULTS_LOG_FILE)).unwrap();
    let rows: Vec<&str> = log.lines().skip(1).collect();
    assert_eq!(rows.len(), 5);
    let no_detection: Vec<&str> = rows[1].split(',').collect();
    assert_eq!(no_detection[1], names[1]);
    assert_eq!(no_detection[2], "-1");
    assert_eq!(no_detection[3], "0.000000");
    assert_eq!(no_detection[5], "20.000");

    let summary = session.stop_session().unwrap();
    assert_eq!(summary.total_frames, 5);
    assert_eq!(summary.no_detection_frames, 1);
    assert_eq!(summary.level_counts, [1, 0, 2, 1]);
    assert_eq!(summary.level_percentages, [25.0, 0.0, 50.0, 25.0]);
    assert_eq!(summary.verdict, EngagementVerdict::High);
    assert!(dir.join(SUMMARY_FILE).is_file());
}

#[test]
fn zero_response_time_records_zero_fps() {
    let root = tempdir().unwrap();
    let mut session = start_session("carol", "s1", root.path(), SessionOptions::default()).unwrap();
    let record = session.record_frame(b"x", Level1, 0.5, 0.0).unwrap();
    assert_eq!(record.fps, 0.0);
    session.stop_session().unwrap();
}

#[test]
fn invalid_measurements_leave_no_trace() {
    let root = tempdir().unwrap();
    let mut session = start_session("dave", "s1", root.path(), SessionOptions::default()).unwrap();
    let dir = session.layout().dir().to_path_buf();

    for bad in [-0.1, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            session.record_frame(b"x", Level3, 0.9, bad),
            Err(EngagementError::InvalidMeasurement(_))
        ));
    }
    assert_eq!(session.frames_recorded(), 0);
    assert!(bucket_files(&dir, "3").is_empty());
    let log = fs::read_to_string(dir.join(RESULTS_LOG_FILE)).unwrap();
    assert_eq!(log.lines().count(), 1);

    session.stop_session().unwrap();
}

#[test]
fn closed_session_rejects_further_use() {
    let root = tempdir().unwrap();
    let mut session = start_session("erin", "s1", root.path(), SessionOptions::default()).unwrap();
    session.record_frame(b"x", Level0, 0.4, 0.1).unwrap();
    session.stop_session().unwrap();

    assert!(!session.is_active());
    assert!(matches!(
        session.record_frame(b"x", Level0, 0.4, 0.1),
        Err(EngagementError::SessionClosed)
    ));
    assert!(matches!(
        session.stop_session(),
        Err(EngagementError::SessionClosed)
    ));
}

#[test]
fn empty_session_is_low_with_zero_percentages() {
    let root = tempdir().unwrap();
    let mut session = start_session("frank", "s1", root.path(), SessionOptions::default()).unwrap();
    let summary = session.stop_session().unwrap();
    assert_eq!(summary.total_frames, 0);
    assert_eq!(summary.level_percentages, [0.0; 4]);
    assert_eq!(summary.verdict, EngagementVerdict::Low);
}

#[test]
fn concurrent_start_conflicts_until_stop() {
    let root = tempdir().unwrap();
    let mut first = start_session("gina", "s1", root.path(), SessionOptions::default()).unwrap();

    assert!(matches!(
        start_session("gina", "s1", root.path(), SessionOptions::default()),
        Err(EngagementError::DirectoryConflict(_))
    ));
    let mut other = start_session("gina", "s2", root.path(), SessionOptions::default()).unwrap();

    first.stop_session().unwrap();
    other.stop_session().unwrap();
    let mut again = start_session("gina", "s1", root.path(), SessionOptions::default()).unwrap();
    again.stop_session().unwrap();
}

#[test]
fn restart_resets_the_results_log() {
    let root = tempdir().unwrap();
    let mut session = start_session("hank", "s1", root.path(), SessionOptions::default()).unwrap();
    session.record_frame(b"x", Level2, 0.7, 0.1).unwrap();
    session.record_frame(b"y", Level2, 0.7, 0.1).unwrap();
    session.stop_session().unwrap();

    let mut session = start_session("hank", "s1", root.path(), SessionOptions::default()).unwrap();
    let log = session.layout().results_log();
    assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 1);
    session.record_frame(b"z", Level1, 0.6, 0.1).unwrap();
    let summary = session.stop_session().unwrap();
    assert_eq!(summary.total_frames, 1);
    assert_eq!(summary.level_counts, [0, 1, 0, 0]);
}

#[test]
fn force_unlock_clears_a_stale_lock() {
    let root = tempdir().unwrap();
    let session = start_session("ivan", "s1", root.path(), SessionOptions::default()).unwrap();
    let lock = session.layout().lock();
    // Simulate a crash: the lock outlives the handle.
    std::mem::forget(session);
    assert!(lock.exists());

    assert!(matches!(
        start_session("ivan", "s1", root.path(), SessionOptions::default()),
        Err(EngagementError::DirectoryConflict(_))
    ));
    let mut session = start_session(
        "ivan",
        "s1",
        root.path(),
        SessionOptions {
            video: false,
            force_unlock: true,
        },
    )
    .unwrap();
    session.stop_session().unwrap();
    assert!(!lock.exists());
}

#[test]
fn dropped_session_releases_its_lock() {
    let root = tempdir().unwrap();
    {
        let mut session =
            start_session("judy", "s1", root.path(), SessionOptions::default()).unwrap();
        session.record_frame(b"x", Level3, 0.8, 0.2).unwrap();
    }
    let mut session = start_session("judy", "s1", root.path(), SessionOptions::default()).unwrap();
    session.stop_session().unwrap();
}

#[test]
fn path_unsafe_identifiers_are_rejected() {
    let root = tempdir().unwrap();
    for (respondent, label) in [("../x", "s1"), ("ok", "a/b"), ("", "s1")] {
        assert!(matches!(
            start_session(respondent, label, root.path(), SessionOptions::default()),
            Err(EngagementError::InvalidIdentifier { .. })
        ));
    }
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
}

#[test]
fn video_sink_collects_every_frame() {
    let root = tempdir().unwrap();
    let mut session = start_session(
        "kate",
        "s1",
        root.path(),
        SessionOptions {
            video: true,
            force_unlock: false,
        },
    )
    .unwrap();
    session.record_frame(b"\xFF\xD8one", Level2, 0.9, 0.1).unwrap();
    session
        .record_frame(b"\xFF\xD8two", NoDetection, 0.0, 0.1)
        .unwrap();
    let video = session.layout().video();
    session.stop_session().unwrap();

    let bytes = fs::read(video).unwrap();
    assert_eq!(bytes, b"\xFF\xD8one\xFF\xD8two");
}

#[test]
fn report_rebuilds_the_summary_from_the_log() {
    let root = tempdir().unwrap();
    let mut session = start_session("liam", "s9", root.path(), SessionOptions::default()).unwrap();
    for level in [Level0, Level1, Level1, Level3, NoDetection] {
        session.record_frame(b"x", level, 0.5, 0.25).unwrap();
    }
    let live = session.stop_session().unwrap();

    let rebuilt = summarize_log(&session.layout().results_log()).unwrap();
    assert_eq!(rebuilt.respondent, "liam");
    assert_eq!(rebuilt.session_label, "s9");
    assert_eq!(rebuilt.total_frames, live.total_frames);
    assert_eq!(rebuilt.level_counts, live.level_counts);
    assert_eq!(rebuilt.verdict, EngagementVerdict::Low);
    assert!((rebuilt.mean_fps - 4.0).abs() < 1e-9);
}

#[test]
fn racing_starts_for_one_session_admit_exactly_one() {
    use std::sync::{Arc, Barrier};

    const RACERS: usize = 16;
    let root = tempdir().unwrap();
    let barrier = Arc::new(Barrier::new(RACERS));
    let results: Vec<_> = (0..RACERS)
        .map(|_| {
            let barrier = barrier.clone();
            let root = root.path().to_path_buf();
            std::thread::spawn(move || {
                barrier.wait();
                start_session("mona", "s1", &root, SessionOptions::default())
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|racer| racer.join().unwrap())
        .collect();

    let mut winners: Vec<_> = results
        .into_iter()
        .filter_map(|result| match result {
            Ok(session) => Some(session),
            Err(EngagementError::DirectoryConflict(_)) => None,
            Err(other) => panic!("unexpected start failure: {other:?}"),
        })
        .collect();
    assert_eq!(winners.len(), 1);

    let mut winner = winners.pop().unwrap();
    winner.record_frame(b"x", Level2, 0.9, 0.1).unwrap();
    let summary = winner.stop_session().unwrap();
    assert_eq!(summary.total_frames, 1);
}
