use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitarchive_core::{
    ArchiveSettings, Bitarchive, BitarchiveError, CodecId, ContainerReader, ContainerWriter,
    Filter, FilterSpec, JobRegistry, LocalFile,
};
use bitarchive_monitor::{
    ClusterSettings, LocalTransport, MonitorError, NodeOutcome, ReplicaCoordinator, Result,
};
use walkdir::WalkDir;

use crate::presentation::cli::FilterArgs;

pub fn open_store(settings: Option<&Path>, dirs: &[PathBuf]) -> Result<Bitarchive> {
    let mut s = match settings {
        Some(path) => ArchiveSettings::from_json_file(path)?,
        None => ArchiveSettings::default(),
    };
    if !dirs.is_empty() {
        s.storage_dirs = dirs.to_vec();
    }
    if s.storage_dirs.is_empty() {
        return Err(MonitorError::Settings(
            "no storage directories; pass --settings or --dir".into(),
        ));
    }
    Ok(Bitarchive::open(s)?)
}

impl FilterArgs {
    pub fn to_spec(&self) -> FilterSpec {
        if let Some(name) = &self.name {
            FilterSpec::Named(name.clone())
        } else if !self.names.is_empty() {
            FilterSpec::NamedAny(self.names.clone())
        } else if !self.regex.is_empty() {
            FilterSpec::Matching(self.regex.clone())
        } else {
            FilterSpec::All
        }
    }
}

/// Files under `inputs` in walk order, directories expanded.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for input in inputs {
        let root = input.parent().unwrap_or_else(|| Path::new(""));
        for entry in WalkDir::new(input).sort_by_file_name() {
            let entry = entry.map_err(|e| MonitorError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let uri = format!("file:///{}", rel.to_string_lossy().replace('\\', "/"));
            out.push((uri, entry.into_path()));
        }
    }
    Ok(out)
}

pub fn handle_pack(out: PathBuf, inputs: Vec<PathBuf>, zstd: bool) -> Result<()> {
    let codec = if zstd { CodecId::Zstd } else { CodecId::Stored };
    let files = collect_inputs(&inputs)?;
    let mut w = ContainerWriter::create(&out)?;
    for (uri, path) in &files {
        let off = w.append(uri, codec, BufReader::new(File::open(path)?))?;
        tracing::debug!(%uri, offset = off, "record written");
    }
    let len = w.finish()?;
    println!("Packed {} record(s) into {} ({len} bytes)", files.len(), out.display());
    Ok(())
}

pub fn handle_records(file: PathBuf) -> Result<()> {
    let reader = ContainerReader::open(&file)?;
    for rec in reader.records()? {
        let (offset, header) = rec?;
        println!(
            "{offset:>12} {:>12} {:?} {}",
            header.raw_len, header.codec, header.uri
        );
    }
    Ok(())
}

/// The name to store `src` under: `--name` if given, else its file name.
fn stored_name(src: &Path, name: Option<String>) -> Result<String> {
    match name {
        Some(n) => Ok(n),
        None => src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BitarchiveError::InvalidArgument(format!("no file name in '{}'", src.display()))
                    .into()
            }),
    }
}

pub fn handle_upload(store: &Bitarchive, src: PathBuf, name: Option<String>) -> Result<()> {
    let name = stored_name(&src, name)?;
    let source = LocalFile::new(&src)?;
    let file = store.upload(&source, &name)?;
    let checksum = store
        .ledger()
        .lookup(&file.name)?
        .and_then(|e| e.checksum)
        .unwrap_or_default();
    println!("{} {} {} {}", file.name, file.size, checksum, file.path.display());
    Ok(())
}

pub fn handle_get(store: &Bitarchive, filename: String, offset: i64, out: Option<PathBuf>) -> Result<()> {
    let Some(mut record) = store.get(&filename, offset)? else {
        eprintln!("{filename}: not stored here");
        return Ok(());
    };
    match out {
        Some(path) => {
            let mut w = BufWriter::new(File::create(&path)?);
            let n = record.get_data(&mut w)?;
            w.flush()?;
            eprintln!("{} bytes from {}:{offset} -> {}", n, record.uri(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            record.get_data(&mut lock)?;
            lock.flush()?;
        }
    }
    Ok(())
}

pub fn handle_get_file(store: &Bitarchive, filename: String) -> Result<()> {
    match store.get_file(&filename)? {
        Some(path) => println!("{}", path.display()),
        None => println!("{filename}: not stored here"),
    }
    Ok(())
}

pub fn handle_list(store: &Bitarchive, filter: FilterArgs, report: bool) -> Result<()> {
    let filter = Filter::compile(&filter.to_spec())?;
    for f in store.files_matching(&filter)? {
        println!("{:>14} {}", f.size, f.name);
    }
    if report {
        println!("# accepting uploads: {}", store.accepts_uploads());
        for d in store.directory_report() {
            let free = d
                .free
                .map_or_else(|| "?".to_string(), |b| b.to_string());
            println!(
                "# {} files={} used={} free={}",
                d.base.display(),
                d.files,
                d.used,
                free
            );
        }
    }
    Ok(())
}

pub fn handle_batch(store: &Bitarchive, job: String, filter: FilterArgs, app_id: String) -> Result<()> {
    let registry = JobRegistry::with_builtins();
    let mut job = registry.create(&job)?;
    let filter = Filter::compile(&filter.to_spec())?;
    let status = store.batch(&app_id, job.as_mut(), &filter)?;
    for line in &status.log {
        println!("{line}");
    }
    for f in &status.failures {
        println!("FAILED {}: {}", f.filename, f.message);
    }
    if let Some(err) = &status.finish_error {
        println!("finish: {err}");
    }
    if let Some(path) = &status.result_file {
        println!("result: {}", path.display());
    }
    Ok(())
}

pub fn handle_remove(store: &Bitarchive, filename: String, checksum: String) -> Result<()> {
    let attic = store.remove_and_get_file(&filename, &checksum)?;
    println!("{filename} moved to {}", attic.display());
    Ok(())
}

pub fn handle_reconcile(store: &Bitarchive) -> Result<()> {
    let restored = store.reconcile_ledger_from_disk()?;
    println!("Restored {restored} ledger entr{}", if restored == 1 { "y" } else { "ies" });
    Ok(())
}

pub fn handle_replica_batch(
    cluster: PathBuf,
    replica: String,
    job: String,
    filter: FilterArgs,
) -> Result<()> {
    let settings = ClusterSettings::from_json_file(&cluster)?;
    let registry = Arc::new(JobRegistry::with_builtins());
    let mut transport = LocalTransport::new(Arc::clone(&registry));
    let mut opened = Vec::new();
    for node in settings.nodes(&replica)? {
        match Bitarchive::open(node.settings.clone()) {
            Ok(store) => {
                transport.add_node(node.id.clone(), Arc::new(store));
                opened.push(node.id.clone());
            }
            Err(e) => tracing::warn!(node = %node.id, error = %e, "node did not open"),
        }
    }
    let coordinator = ReplicaCoordinator::new(settings, registry, Arc::new(transport));
    // an in-process node that opened is alive
    for id in &opened {
        coordinator.sign_of_life(id);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let status = rt.block_on(coordinator.run_batch_on_replica(&job, filter.to_spec(), &replica))?;
    for n in &status.nodes {
        match &n.outcome {
            NodeOutcome::Replied(st) => println!(
                "{}: processed {} failed {}",
                n.node,
                st.files_processed,
                st.failures.len()
            ),
            NodeOutcome::Failed(msg) => println!("{}: error: {msg}", n.node),
            NodeOutcome::TimedOut => println!("{}: no reply in time", n.node),
            NodeOutcome::NotRunning => println!("{}: not running", n.node),
        }
    }
    for f in &status.failures {
        println!("FAILED {}/{}: {}", f.node, f.filename, f.message);
    }
    if let Some(path) = &status.result_file {
        println!("result: {}", path.display());
    }
    Ok(())
}
