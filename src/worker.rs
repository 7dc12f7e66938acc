use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};
use log::trace;
use tarpc::{client, context, tokio_serde::formats::Json};

use crate::{
    intermediate_path, output_path, partition, Directive, JobServiceClient, KeyValue, TaskKind,
};

/// How long to sleep when the coordinator has nothing to hand out yet.
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// One stateless task executor. Several workers share `dir` and the
/// coordinator; none of them knows the others exist.
pub struct Worker {
    /// Directory all artifacts are read from and written to. Must be the
    /// same for every worker in the job.
    pub dir: PathBuf,
    /// Coordinator address, e.g. "127.0.0.1:9999".
    pub server: String,
    pub map: fn(&PathBuf, &String) -> Vec<(String, String)>,
    pub reduce: fn(&String, &Vec<String>) -> String,
}

impl Worker {
    /// Runs the acquire/execute/report loop until the coordinator replies
    /// Done. Every transport or I/O error is fatal to this worker; there is
    /// no local retry, the coordinator's watchdog reassigns whatever was in
    /// flight here.
    pub async fn launch(&self) -> anyhow::Result<()> {
        let transport = tarpc::serde_transport::tcp::connect(&self.server, Json::default)
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.server))?;
        let client = JobServiceClient::new(client::Config::default(), transport).spawn();

        loop {
            match client.acquire_task(context::current()).await? {
                Directive::Map {
                    task_id,
                    input,
                    reducer_count,
                } => {
                    self.run_map(task_id, &input, reducer_count)?;
                    client
                        .task_done(context::current(), TaskKind::Map, task_id)
                        .await?;
                }
                Directive::Reduce {
                    task_id,
                    map_task_count,
                } => {
                    self.run_reduce(task_id, map_task_count)?;
                    client
                        .task_done(context::current(), TaskKind::Reduce, task_id)
                        .await?;
                }
                Directive::Wait => tokio::time::sleep(WAIT_INTERVAL).await,
                Directive::Done => break,
            }
        }
        Ok(())
    }

    /// Maps one input file into `reducer_count` partitioned intermediate
    /// artifacts, one JSON record per line. Every bucket is written, empty
    /// ones included, so a reduce task can rely on all M of its inputs
    /// existing.
    fn run_map(&self, task_id: usize, input: &PathBuf, reducer_count: usize) -> anyhow::Result<()> {
        trace!("map task {} on {:?}", task_id, input);
        let contents = fs::read_to_string(input)
            .with_context(|| format!("cannot read map input {:?}", input))?;

        let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); reducer_count];
        for (key, value) in (self.map)(input, &contents) {
            let r = partition(&key, reducer_count);
            buckets[r].push(KeyValue { key, value });
        }

        for (r, bucket) in buckets.iter().enumerate() {
            let mut encoded = String::new();
            for kv in bucket {
                encoded.push_str(&serde_json::to_string(kv)?);
                encoded.push('\n');
            }
            let path = intermediate_path(&self.dir, task_id, r);
            // Written to a temporary name and renamed into place, so the
            // artifact is never observable half-written.
            AtomicFile::new(&path, AllowOverwrite)
                .write(|f| f.write_all(encoded.as_bytes()))
                .with_context(|| format!("cannot write intermediate {:?}", path))?;
        }
        Ok(())
    }

    /// Aggregates this partition's records from all `map_task_count`
    /// intermediate artifacts into the final output artifact.
    fn run_reduce(&self, task_id: usize, map_task_count: usize) -> anyhow::Result<()> {
        trace!(
            "reduce task {} over {} intermediate files",
            task_id,
            map_task_count
        );
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for m in 0..map_task_count {
            let path = intermediate_path(&self.dir, m, task_id);
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("cannot read intermediate {:?}", path))?;
            for line in contents.lines() {
                let kv: KeyValue = serde_json::from_str(line)
                    .with_context(|| format!("malformed record in {:?}", path))?;
                groups.entry(kv.key).or_default().push(kv.value);
            }
        }

        let mut out = String::new();
        for (key, values) in &groups {
            let value = (self.reduce)(key, values);
            out.push_str(&format!("{} {}\n", key, value));
        }
        let path = output_path(&self.dir, task_id);
        AtomicFile::new(&path, AllowOverwrite)
            .write(|f| f.write_all(out.as_bytes()))
            .with_context(|| format!("cannot write output {:?}", path))?;
        Ok(())
    }
}
