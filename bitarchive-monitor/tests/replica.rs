use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bitarchive_core::space::FixedSpaceProbe;
use bitarchive_core::{
    ArchiveFile, ArchiveSettings, BatchJob, Bitarchive, BitarchiveError, CodecId, ContainerWriter,
    FilterSpec, JobRegistry, LocalFile,
};
use bitarchive_monitor::{
    BatchReply, BatchRequest, BatchTransport, BoxFuture, ClusterSettings, LocalTransport,
    MonitorError, NodeOutcome, NodeSettings, ReplicaCoordinator,
};

fn node_store(root: &Path, node: &str, files: &[&str]) -> Arc<Bitarchive> {
    let base = root.join(node);
    let mut s = ArchiveSettings::with_dirs([base.join("wa001")]);
    s.batch.output_dir = Some(base.join("batch-out"));
    let store = Bitarchive::open_with_probe(s, Arc::new(FixedSpaceProbe::new(1 << 40))).unwrap();
    let incoming = base.join("incoming");
    std::fs::create_dir_all(&incoming).unwrap();
    for name in files {
        let path = incoming.join(name);
        let mut w = ContainerWriter::create(&path).unwrap();
        w.append("http://example.org/", CodecId::Stored, name.as_bytes())
            .unwrap();
        w.finish().unwrap();
        store.upload(&LocalFile::new(&path).unwrap(), name).unwrap();
    }
    Arc::new(store)
}

fn cluster(root: &Path, default_ms: u64, nodes: &[&str]) -> ClusterSettings {
    let mut replicas = BTreeMap::new();
    replicas.insert(
        "ONE".to_string(),
        nodes
            .iter()
            .map(|id| NodeSettings {
                id: id.to_string(),
                settings: ArchiveSettings::default(),
            })
            .collect(),
    );
    ClusterSettings {
        default_batch_timeout_ms: default_ms,
        sign_of_life_delay_ms: 60_000,
        output_dir: Some(root.join("merged")),
        replicas,
    }
}

/// A coordinator that has just heard from every node of replica ONE.
fn live(
    settings: ClusterSettings,
    registry: Arc<JobRegistry>,
    transport: Arc<dyn BatchTransport>,
) -> ReplicaCoordinator {
    let ids: Vec<String> = settings
        .nodes("ONE")
        .unwrap()
        .iter()
        .map(|n| n.id.clone())
        .collect();
    let coord = ReplicaCoordinator::new(settings, registry, transport);
    for id in &ids {
        coord.sign_of_life(id);
    }
    coord
}

struct PickyJob;

impl BatchJob for PickyJob {
    fn name(&self) -> &str {
        "picky"
    }

    fn process_file(&mut self, file: &ArchiveFile, out: &mut dyn Write) -> bitarchive_core::Result<bool> {
        if file.name == "Upload3.ARC" {
            return Err(BitarchiveError::Format("truncated record".into()));
        }
        writeln!(out, "{}", file.name)?;
        Ok(true)
    }
}

struct PatientJob;

impl BatchJob for PatientJob {
    fn name(&self) -> &str {
        "patient"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    fn process_file(&mut self, _file: &ArchiveFile, _out: &mut dyn Write) -> bitarchive_core::Result<bool> {
        Ok(true)
    }
}

fn registry() -> Arc<JobRegistry> {
    let mut r = JobRegistry::with_builtins();
    r.register("picky", || Box::new(PickyJob));
    r.register("patient", || Box::new(PatientJob));
    Arc::new(r)
}

/// Delays one node and cuts another off, forwarding the rest.
struct Unreliable {
    inner: LocalTransport,
    slow: &'static str,
    delay: Duration,
    dead: &'static str,
}

impl BatchTransport for Unreliable {
    fn send(&self, node: &str, request: BatchRequest) -> BoxFuture<bitarchive_monitor::Result<BatchReply>> {
        if node == self.dead {
            let node = node.to_string();
            return Box::pin(async move {
                Err(MonitorError::Transport(format!("{node} unreachable")))
            });
        }
        let delay = if node == self.slow {
            self.delay
        } else {
            Duration::ZERO
        };
        let fut = self.inner.send(node, request);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            fut.await
        })
    }
}

fn local(registry: Arc<JobRegistry>, nodes: &[(&str, Arc<Bitarchive>)]) -> LocalTransport {
    let mut t = LocalTransport::new(registry);
    for (id, store) in nodes {
        t.add_node(*id, Arc::clone(store));
    }
    t
}

#[tokio::test]
async fn replies_are_summed_and_outputs_merged() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload2.ARC", "Upload1.ARC"]);
    let sb2 = node_store(tmp.path(), "sb2", &["Upload3.ARC"]);
    let reg = registry();
    let transport = Arc::new(local(reg.clone(), &[("sb1", sb1), ("sb2", sb2)]));
    let coord = live(cluster(tmp.path(), 5_000, &["sb2", "sb1"]), reg, transport);

    let st = coord
        .run_batch_on_replica("filelist", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert_eq!(st.replied(), 2);
    assert_eq!(st.files_processed, 3);
    assert!(st.failures.is_empty());
    // filelist sorts the merged output
    let merged = std::fs::read_to_string(st.result_file.unwrap()).unwrap();
    assert_eq!(merged, "Upload1.ARC\nUpload2.ARC\nUpload3.ARC\n");
    assert!(coord.in_flight().is_empty());
}

#[tokio::test]
async fn failures_are_tagged_with_their_node() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload1.ARC"]);
    let sb2 = node_store(tmp.path(), "sb2", &["Upload3.ARC", "Upload4.ARC"]);
    let reg = registry();
    let transport = Arc::new(local(reg.clone(), &[("sb1", sb1), ("sb2", sb2)]));
    let coord = live(cluster(tmp.path(), 5_000, &["sb1", "sb2"]), reg, transport);

    let st = coord
        .run_batch_on_replica("picky", FilterSpec::Matching(vec![r"Upload\d\.ARC".into()]), "ONE")
        .await
        .unwrap();
    assert_eq!(st.files_processed, 3);
    assert_eq!(st.failures.len(), 1);
    assert_eq!(st.failures[0].node, "sb2");
    assert_eq!(st.failures[0].filename, "Upload3.ARC");

    // picky has no post-processing, so the merge is the plain concatenation in node order
    let merged = std::fs::read_to_string(st.result_file.unwrap()).unwrap();
    assert_eq!(merged, "Upload1.ARC\nUpload4.ARC\n");
}

#[tokio::test]
async fn silent_and_broken_nodes_do_not_block_the_rest() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload1.ARC"]);
    let sb2 = node_store(tmp.path(), "sb2", &["Upload2.ARC"]);
    let sb3 = node_store(tmp.path(), "sb3", &["Upload3.ARC"]);
    let reg = registry();
    let transport = Arc::new(Unreliable {
        inner: local(reg.clone(), &[("sb1", sb1), ("sb2", sb2), ("sb3", sb3)]),
        slow: "sb2",
        delay: Duration::from_secs(30),
        dead: "sb3",
    });
    let coord = live(cluster(tmp.path(), 1_000, &["sb1", "sb2", "sb3"]), reg, transport);

    let started = std::time::Instant::now();
    let st = coord
        .run_batch_on_replica("filelist", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(st.timed_out(), ["sb2"]);
    assert_eq!(st.failed_nodes(), ["sb3"]);
    assert!(matches!(st.nodes[0].outcome, NodeOutcome::Replied(_)));
    assert_eq!(st.files_processed, 1);
    assert_eq!(
        std::fs::read_to_string(st.result_file.unwrap()).unwrap(),
        "Upload1.ARC\n"
    );
}

#[tokio::test]
async fn declared_timeout_extends_the_wait() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload1.ARC"]);
    let reg = registry();
    let transport = Arc::new(Unreliable {
        inner: local(reg.clone(), &[("sb1", sb1)]),
        slow: "sb1",
        delay: Duration::from_millis(400),
        dead: "",
    });
    let coord = live(cluster(tmp.path(), 100, &["sb1"]), reg, transport);

    let st = coord
        .run_batch_on_replica("filelist", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert_eq!(st.timed_out(), ["sb1"]);

    let st = coord
        .run_batch_on_replica("patient", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert_eq!(st.replied(), 1);
    assert_eq!(st.files_processed, 1);
}

#[tokio::test]
async fn pending_batches_are_visible_while_waiting() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload1.ARC"]);
    let reg = registry();
    let transport = Arc::new(Unreliable {
        inner: local(reg.clone(), &[("sb1", sb1)]),
        slow: "sb1",
        delay: Duration::from_millis(300),
        dead: "",
    });
    let coord = live(cluster(tmp.path(), 5_000, &["sb1"]), reg, transport);

    let (st, seen) = tokio::join!(
        coord.run_batch_on_replica("checksum", FilterSpec::All, "ONE"),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            coord.in_flight()
        }
    );
    let st = st.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, st.request_id);
    assert_eq!(seen[0].job, "checksum");
    assert!(coord.in_flight().is_empty());
}

#[tokio::test]
async fn unknown_replica_and_job_are_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry();
    let transport = Arc::new(LocalTransport::new(reg.clone()));
    let coord = live(cluster(tmp.path(), 100, &["sb1"]), reg, transport);

    assert!(matches!(
        coord.run_batch_on_replica("filelist", FilterSpec::All, "TWO").await,
        Err(MonitorError::UnknownReplica(_))
    ));
    assert!(matches!(
        coord.run_batch_on_replica("no.such.Job", FilterSpec::All, "ONE").await,
        Err(MonitorError::Core(BitarchiveError::UnknownId(_)))
    ));
}

#[tokio::test]
async fn unroutable_node_is_a_node_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry();
    let transport = Arc::new(LocalTransport::new(reg.clone()));
    let coord = live(cluster(tmp.path(), 100, &["ghost"]), reg, transport);

    let st = coord
        .run_batch_on_replica("filelist", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert_eq!(st.failed_nodes(), ["ghost"]);
    assert!(st.result_file.is_none());
}

#[tokio::test]
async fn nodes_without_sign_of_life_are_not_asked() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload1.ARC"]);
    let sb2 = node_store(tmp.path(), "sb2", &["Upload2.ARC"]);
    let reg = registry();
    let transport = Arc::new(local(reg.clone(), &[("sb1", sb1), ("sb2", sb2)]));
    let coord = ReplicaCoordinator::new(cluster(tmp.path(), 5_000, &["sb1", "sb2"]), reg, transport);
    coord.sign_of_life("sb1");

    let st = coord
        .run_batch_on_replica("filelist", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert_eq!(st.replied(), 1);
    assert_eq!(st.not_running(), ["sb2"]);
    assert!(st.failed_nodes().is_empty() && st.timed_out().is_empty());
    assert_eq!(st.files_processed, 1);
    // sb2 never ran anything
    assert!(!tmp.path().join("sb2").join("batch-out").exists());
}

#[tokio::test]
async fn stale_sign_of_life_expires_until_the_node_speaks_again() {
    let tmp = tempfile::tempdir().unwrap();
    let sb1 = node_store(tmp.path(), "sb1", &["Upload1.ARC"]);
    let sb2 = node_store(tmp.path(), "sb2", &["Upload2.ARC"]);
    let reg = registry();
    let transport = Arc::new(local(reg.clone(), &[("sb1", sb1), ("sb2", sb2)]));
    let mut settings = cluster(tmp.path(), 5_000, &["sb1", "sb2"]);
    settings.sign_of_life_delay_ms = 150;
    let coord = live(settings, reg, transport);
    assert_eq!(coord.running_nodes("ONE").unwrap(), ["sb1", "sb2"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    coord.sign_of_life("sb1");
    let st = coord
        .run_batch_on_replica("filelist", FilterSpec::All, "ONE")
        .await
        .unwrap();
    assert_eq!(st.not_running(), ["sb2"]);
    assert_eq!(
        std::fs::read_to_string(st.result_file.unwrap()).unwrap(),
        "Upload1.ARC\n"
    );

    coord.sign_of_life("sb2");
    assert_eq!(coord.running_nodes("ONE").unwrap(), ["sb1", "sb2"]);
    assert!(matches!(
        coord.running_nodes("TWO"),
        Err(MonitorError::UnknownReplica(_))
    ));
}
