//! End-to-end: recorder -> link transport -> host -> store -> CSV.

use std::fs;
use std::num::NonZeroUsize;
use std::time::Duration;

use sensorcollect_lib::{
    db::Database,
    host::Host,
    models::{Batch, MotionSample, Reading},
    reassembly::MergePolicy,
    recorder::Recorder,
    sampler::{ReplaySource, Sampler},
    settings::Settings,
    transport::{wire, DeliveryMode, LinkTransport, Outbox, PairedLink, Transport},
};
use tempfile::TempDir;
use uuid::Uuid;

struct Rig {
    _dir: TempDir,
    host: Host,
    link: PairedLink,
    transport: LinkTransport,
}

async fn rig(policy: MergePolicy) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        data_dir: dir.path().join("phone"),
        export_dir: Some(dir.path().join("exports")),
        merge_policy: policy,
        chunk_size: 10,
        ..Settings::default()
    };

    let mut host = Host::open(settings).await.unwrap();
    let link = PairedLink::new();
    host.attach(link.take_inbound().unwrap()).unwrap();

    let watch_db = Database::new(dir.path().join("watch").join("watch.sqlite3")).unwrap();
    let transport = LinkTransport::new(link.clone(), Outbox::new(watch_db, 100));

    Rig {
        _dir: dir,
        host,
        link,
        transport,
    }
}

fn recorder(rig: &Rig, delivery: DeliveryMode) -> Recorder<LinkTransport> {
    let sample = MotionSample {
        user_acceleration: [0.1, -0.2, 0.3],
        rotation_rate: [1.0, 2.0, 3.0],
        gravity: [0.0, 0.0, -1.0],
        attitude: [0.5, 0.25, -0.125],
    };
    let sampler = Sampler::new(
        Box::new(ReplaySource::new(vec![sample])),
        Duration::from_millis(10),
    );
    Recorder::new(
        sampler,
        rig.transport.clone(),
        NonZeroUsize::new(10).unwrap(),
        delivery,
    )
}

async fn record(recorder: &Recorder<LinkTransport>, duration: Duration) {
    recorder.start().await.unwrap();
    tokio::time::sleep(duration).await;
    recorder.pause().await.unwrap();
}

#[tokio::test]
async fn guaranteed_session_arrives_whole_after_reconnect() {
    let rig = rig(MergePolicy::Idempotent).await;
    rig.link.activate().await.unwrap();
    rig.link.set_reachable(false);

    let recorder = recorder(&rig, DeliveryMode::Guaranteed);
    record(&recorder, Duration::from_millis(120)).await;
    let report = recorder.save().await.unwrap();

    assert!(report.readings > 0);
    assert_eq!(report.queued, report.batches);
    rig.host.sync().await.unwrap();
    assert!(rig.host.session(&report.session_key).is_none());

    rig.link.set_reachable(true);
    assert_eq!(rig.transport.flush().await.unwrap(), report.batches);
    rig.host.sync().await.unwrap();

    let session = rig.host.session(&report.session_key).unwrap();
    assert_eq!(session.len(), report.readings);
    assert!(session.windows(2).all(|w| w[0].time < w[1].time));
    assert_eq!(session[0].time, 0.0);

    let export = rig.host.export_all(None).await.unwrap();
    assert!(export.is_complete());
    let (_, file) = export.succeeded().next().unwrap();
    let csv = fs::read_to_string(&file.path).unwrap();
    assert_eq!(csv.lines().count(), report.readings + 1);
    assert!(csv.lines().nth(1).unwrap().ends_with(",0.1,-0.2,0.3,1.0,2.0,3.0,0.0,0.0,-1.0,0.5,0.25,-0.125"));
    assert!(!file.path.to_string_lossy().contains(':'));

    rig.host.shutdown().await.unwrap();
}

#[tokio::test]
async fn best_effort_loses_batches_sent_while_unreachable() {
    let rig = rig(MergePolicy::Idempotent).await;
    rig.link.activate().await.unwrap();
    rig.link.set_reachable(false);

    let recorder = recorder(&rig, DeliveryMode::BestEffort);
    record(&recorder, Duration::from_millis(60)).await;
    let report = recorder.save().await.unwrap();

    assert_eq!(report.dropped, report.batches);
    assert_eq!(rig.transport.stats().dropped as usize, report.batches);

    rig.host.sync().await.unwrap();
    assert!(rig.host.list_sessions().is_empty());
    rig.host.shutdown().await.unwrap();
}

#[tokio::test]
async fn consecutive_saves_make_distinct_sessions() {
    let rig = rig(MergePolicy::Idempotent).await;
    rig.link.activate().await.unwrap();

    let recorder = recorder(&rig, DeliveryMode::Guaranteed);
    record(&recorder, Duration::from_millis(40)).await;
    let first = recorder.save().await.unwrap();
    record(&recorder, Duration::from_millis(40)).await;
    let second = recorder.save().await.unwrap();

    assert_ne!(first.session_key, second.session_key);
    rig.host.sync().await.unwrap();

    let keys = rig.host.store().keys();
    assert_eq!(keys, vec![first.session_key.clone(), second.session_key.clone()]);
    // Each session has its own clock.
    assert_eq!(rig.host.session(&second.session_key).unwrap()[0].time, 0.0);

    rig.host.shutdown().await.unwrap();
}

fn redelivered_payload() -> Vec<u8> {
    let batch = Batch::new(
        "2024-07-02 12:00:00",
        vec![Reading::at(0.0), Reading::at(0.01)],
    )
    .with_message_id(Uuid::new_v4());
    wire::encode(&batch).unwrap().into_bytes()
}

async fn deliver_twice(policy: MergePolicy) -> usize {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        data_dir: dir.path().to_path_buf(),
        merge_policy: policy,
        ..Settings::default()
    };
    let mut host = Host::open(settings).await.unwrap();
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    host.attach(rx).unwrap();

    let payload = redelivered_payload();
    tx.send(payload.clone()).await.unwrap();
    tx.send(payload).await.unwrap();
    host.sync().await.unwrap();

    let len = host.session("2024-07-02 12:00:00").map_or(0, |s| s.len());
    host.shutdown().await.unwrap();
    len
}

#[tokio::test]
async fn redelivery_duplicates_only_under_append() {
    assert_eq!(deliver_twice(MergePolicy::Append).await, 4);
    assert_eq!(deliver_twice(MergePolicy::Idempotent).await, 2);
}
