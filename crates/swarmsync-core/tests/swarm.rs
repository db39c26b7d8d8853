//! End-to-end downloads through the swarm coordinator

mod common;

use common::{content, sha256_hex, version_of, MemoryPeer};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmsync_core::engine::{
    BandwidthGovernor, PartialStore, SwarmConfig, SwarmCoordinator, SwarmOutcome,
    TransferDatabase, TransferRecord,
};
use swarmsync_core::{EventBus, Peer, SharedPeer};
use swarmsync_types::{
    Direction, FileVersion, PeerId, Priority, TransferEvent, TransferProblem, TransferState,
};
use tempfile::TempDir;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    store: PartialStore,
    governor: BandwidthGovernor,
    events: EventBus,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        tokio::fs::create_dir_all(&root).await.unwrap();
        let db = TransferDatabase::new(dir.path().join("transfers.db"))
            .await
            .unwrap();
        Self {
            store: PartialStore::new(&root, db, 2000),
            root,
            _dir: dir,
            governor: BandwidthGovernor::default(),
            events: EventBus::default(),
        }
    }

    fn coordinator(
        &self,
        version: FileVersion,
        sources: Vec<SharedPeer>,
        config: SwarmConfig,
    ) -> (Arc<TransferRecord>, SwarmCoordinator) {
        let record = TransferRecord::new(
            Direction::Download,
            version,
            Priority::Normal,
            self.events.clone(),
        );
        let (coordinator, _handle) = SwarmCoordinator::new(
            Arc::clone(&record),
            self.store.clone(),
            self.governor.clone(),
            self.events.clone(),
            config,
            sources,
        );
        (record, coordinator)
    }
}

fn config(chunk_size: usize) -> SwarmConfig {
    SwarmConfig {
        chunk_size: chunk_size as u64,
        stall_timeout: Duration::from_millis(500),
        persist_interval: Duration::from_millis(100),
        ..SwarmConfig::default()
    }
}

async fn read(path: &std::path::Path) -> Vec<u8> {
    tokio::fs::read(path).await.unwrap()
}

#[tokio::test]
async fn test_four_sources_share_the_chunks() {
    let fx = Fixture::new().await;
    let data = content(12 * MIB, 1);
    let version = version_of("media/clip.mov", &data, 1);

    let peers: Vec<Arc<MemoryPeer>> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| {
            MemoryPeer::new(id, data.clone())
                .with_latency(Duration::from_millis(10))
                .into_shared()
        })
        .collect();
    let sources: Vec<SharedPeer> = peers.iter().map(|p| p.clone() as SharedPeer).collect();

    let (record, coordinator) = fx.coordinator(version, sources, config(MIB));
    let outcome = coordinator.run().await;

    let final_path = fx.root.join("media/clip.mov");
    assert_eq!(outcome, SwarmOutcome::Completed(final_path.clone()));
    assert_eq!(record.state(), TransferState::Completed);
    assert_eq!(sha256_hex(&read(&final_path).await), sha256_hex(&data));

    let mut seen = BTreeSet::new();
    for peer in &peers {
        let chunks = peer.served_chunks(MIB as u64);
        assert!(!chunks.is_empty(), "{} served nothing", peer.id());
        for chunk in chunks {
            assert!(seen.insert(chunk), "chunk {} served twice", chunk);
        }
    }
    assert_eq!(seen, (0..12).collect::<BTreeSet<u64>>());
}

#[tokio::test]
async fn test_whole_file_from_peer_without_part_support() {
    let fx = Fixture::new().await;
    let data = content(300 * KIB, 2);
    let version = version_of("notes.txt", &data, 4);

    let slow = MemoryPeer::new("slow", data.clone())
        .without_part_support()
        .with_bandwidth(1_000)
        .into_shared();
    let fast = MemoryPeer::new("fast", data.clone())
        .without_part_support()
        .with_bandwidth(50_000)
        .into_shared();

    let (record, coordinator) = fx.coordinator(
        version,
        vec![slow.clone() as SharedPeer, fast.clone() as SharedPeer],
        config(64 * KIB),
    );
    let outcome = coordinator.run().await;

    assert!(matches!(outcome, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("notes.txt")).await, data);
    assert!(slow.served().is_empty());
    assert_eq!(fast.served(), vec![(0, data.len() as u64)]);
    assert_eq!(record.transferred(), data.len() as u64);
}

#[tokio::test]
async fn test_lost_source_chunks_are_reassigned() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let data = content(10 * chunk, 3);
    let version = version_of("archive.tar", &data, 1);

    let flaky = MemoryPeer::new("flaky", data.clone())
        .disconnect_after(2)
        .into_shared();
    let steady: Vec<Arc<MemoryPeer>> = ["s1", "s2"]
        .iter()
        .map(|id| {
            MemoryPeer::new(id, data.clone())
                .with_latency(Duration::from_millis(20))
                .into_shared()
        })
        .collect();
    let mut sources: Vec<SharedPeer> = vec![flaky.clone() as SharedPeer];
    sources.extend(steady.iter().map(|p| p.clone() as SharedPeer));

    let mut rx = fx.events.subscribe();
    let (record, coordinator) = fx.coordinator(version, sources, config(chunk));
    let outcome = coordinator.run().await;

    assert!(matches!(outcome, SwarmOutcome::Completed(_)));
    assert_eq!(sha256_hex(&read(&fx.root.join("archive.tar")).await), sha256_hex(&data));
    assert_eq!(flaky.served().len(), 2);
    assert!(!record.has_peer(&PeerId::from("flaky")));

    let mut removed = false;
    while let Ok(event) = rx.try_recv() {
        if let TransferEvent::SourceRemoved { peer, .. } = event {
            removed |= peer == PeerId::from("flaky");
        }
    }
    assert!(removed);
}

#[tokio::test]
async fn test_no_sources_breaks_the_download() {
    let fx = Fixture::new().await;
    let data = content(200 * KIB, 4);
    let version = version_of("gone.bin", &data, 1);

    let peer = MemoryPeer::new("p", data.clone()).into_shared();
    peer.disconnect();
    let (record, coordinator) = fx.coordinator(version, vec![peer as SharedPeer], config(64 * KIB));

    assert_eq!(
        coordinator.run().await,
        SwarmOutcome::Broken(TransferProblem::NoSources)
    );
    assert_eq!(record.state(), TransferState::Broken);
    assert!(!fx.root.join("gone.bin").exists());
}

#[tokio::test]
async fn test_older_local_copy_is_reused() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let v1 = content(8 * chunk, 5);
    let mut v2 = v1.clone();
    v2[3 * chunk..4 * chunk].copy_from_slice(&content(chunk, 6));
    tokio::fs::write(fx.root.join("report.odt"), &v1).await.unwrap();

    let peer = MemoryPeer::new("p", v2.clone())
        .with_parts_record(chunk as u64)
        .into_shared();
    let mut rx = fx.events.subscribe();
    let (record, coordinator) = fx.coordinator(
        version_of("report.odt", &v2, 2),
        vec![peer.clone() as SharedPeer],
        config(chunk),
    );

    assert!(matches!(coordinator.run().await, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("report.odt")).await, v2);
    assert_eq!(peer.served_chunks(chunk as u64), BTreeSet::from([3]));

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TransferEvent::StateChanged { id, state } = event {
            if id == record.id() {
                states.push(state);
            }
        }
    }
    assert!(states.contains(&TransferState::Matching));
    assert!(states.contains(&TransferState::Copying));
    assert_eq!(states.last(), Some(&TransferState::Verifying));
    assert!(record.is_completed());
}

#[tokio::test]
async fn test_superseded_partial_feeds_the_new_version() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let v1 = content(8 * chunk, 7);

    // v1 breaks after four chunks
    let first = MemoryPeer::new("first", v1.clone())
        .disconnect_after(4)
        .into_shared();
    let (_, coordinator) = fx.coordinator(
        version_of("slides.pdf", &v1, 1),
        vec![first as SharedPeer],
        config(chunk),
    );
    assert_eq!(
        coordinator.run().await,
        SwarmOutcome::Broken(TransferProblem::NoSources)
    );

    let mut v2 = v1.clone();
    v2[chunk..2 * chunk].copy_from_slice(&content(chunk, 8));
    v2[6 * chunk..7 * chunk].copy_from_slice(&content(chunk, 9));
    let second = MemoryPeer::new("second", v2.clone())
        .with_parts_record(chunk as u64)
        .into_shared();
    let (_, coordinator) = fx.coordinator(
        version_of("slides.pdf", &v2, 2),
        vec![second.clone() as SharedPeer],
        config(chunk),
    );

    assert!(matches!(coordinator.run().await, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("slides.pdf")).await, v2);
    assert_eq!(
        second.served_chunks(chunk as u64),
        BTreeSet::from([1, 4, 5, 6, 7])
    );
    assert!(fx.store.load_meta("slides.pdf").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stalled_source_gives_way() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let data = content(6 * chunk, 10);
    let version = version_of("big.iso", &data, 1);

    let stuck = MemoryPeer::new("stuck", data.clone()).stalled().into_shared();
    let good = MemoryPeer::new("good", data.clone())
        .with_latency(Duration::from_millis(5))
        .into_shared();

    let (_, coordinator) = fx.coordinator(
        version,
        vec![stuck.clone() as SharedPeer, good.clone() as SharedPeer],
        config(chunk),
    );
    let outcome = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
        .await
        .unwrap();

    assert!(matches!(outcome, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("big.iso")).await, data);
    assert!(stuck.served().is_empty());
}

#[tokio::test]
async fn test_matching_partial_resumes_without_refetching() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let data = content(8 * chunk, 11);
    let version = version_of("vm/disk.img", &data, 3);

    let first = MemoryPeer::new("first", data.clone())
        .disconnect_after(3)
        .into_shared();
    let (_, coordinator) = fx.coordinator(version.clone(), vec![first.clone() as SharedPeer], config(chunk));
    assert_eq!(
        coordinator.run().await,
        SwarmOutcome::Broken(TransferProblem::NoSources)
    );
    let fetched = first.served_chunks(chunk as u64);
    assert!(!fetched.is_empty());

    let second = MemoryPeer::new("second", data.clone()).into_shared();
    let (record, coordinator) = fx.coordinator(version, vec![second.clone() as SharedPeer], config(chunk));
    assert!(matches!(coordinator.run().await, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("vm/disk.img")).await, data);

    let refetched = second.served_chunks(chunk as u64);
    assert!(fetched.is_disjoint(&refetched), "written chunks were fetched again");
    let all: BTreeSet<u64> = fetched.union(&refetched).copied().collect();
    assert_eq!(all, (0..8).collect::<BTreeSet<u64>>());
    assert_eq!(record.transferred(), data.len() as u64);
}

#[tokio::test]
async fn test_failed_verification_refetches_only_bad_chunks() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let data = content(8 * chunk, 12);
    let version = version_of("ledger.db", &data, 1);

    let mut tampered = data.clone();
    tampered[3 * chunk + 100] ^= 0xff;
    let bad = MemoryPeer::new("bad", tampered).into_shared();
    // Knows the block signatures but serves nothing
    let index = MemoryPeer::new("index", data.clone())
        .with_parts_record(chunk as u64)
        .into_shared();
    index.disconnect();

    let (record, coordinator) = fx.coordinator(
        version.clone(),
        vec![bad as SharedPeer, index as SharedPeer],
        config(chunk),
    );
    assert_eq!(
        coordinator.run().await,
        SwarmOutcome::Broken(TransferProblem::ChecksumMismatch)
    );
    assert_eq!(record.state(), TransferState::Broken);
    assert!(!fx.root.join("ledger.db").exists());
    let meta = fx.store.load_meta("ledger.db").await.unwrap().unwrap();
    assert_eq!(meta.chunk_bitmap, "11101111");

    let good = MemoryPeer::new("good", data.clone()).into_shared();
    let (record, coordinator) = fx.coordinator(version, vec![good.clone() as SharedPeer], config(chunk));
    assert!(matches!(coordinator.run().await, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("ledger.db")).await, data);
    assert_eq!(good.served_chunks(chunk as u64), BTreeSet::from([3]));
    assert_eq!(record.transferred(), data.len() as u64);
}

#[tokio::test]
async fn test_whole_file_resume_counts_each_chunk_once() {
    let fx = Fixture::new().await;
    let chunk = 64 * KIB;
    let data = content(8 * chunk, 13);
    let version = version_of("movie.mkv", &data, 1);

    // Chunks 2..6 are already on disk, the rest is missing
    let prepared = fx.store.prepare(&version, chunk as u64).await.unwrap();
    let mut pool = prepared.pool;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&prepared.path)
        .await
        .unwrap();
    for index in 2..6 {
        file.seek(SeekFrom::Start((index * chunk) as u64)).await.unwrap();
        file.write_all(&data[index * chunk..(index + 1) * chunk]).await.unwrap();
        pool.mark_available(index);
    }
    file.flush().await.unwrap();
    drop(file);
    fx.store.save_progress(&version, &pool).await.unwrap();

    let peer = MemoryPeer::new("p", data.clone())
        .without_part_support()
        .into_shared();
    let mut rx = fx.events.subscribe();
    let (record, coordinator) = fx.coordinator(version, vec![peer.clone() as SharedPeer], config(chunk));
    assert!(matches!(coordinator.run().await, SwarmOutcome::Completed(_)));
    assert_eq!(read(&fx.root.join("movie.mkv")).await, data);

    // The stream runs from the first gap to the end
    assert_eq!(peer.served(), vec![(0, data.len() as u64)]);
    assert_eq!(record.transferred(), data.len() as u64);
    while let Ok(event) = rx.try_recv() {
        if let TransferEvent::Progress { transferred, total, .. } = event {
            assert!(transferred <= total);
        }
    }
}
