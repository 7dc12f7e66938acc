use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};
use log::trace;
use structopt::StructOpt;

use mapred::app::wc::{map, reduce};
use mapred::{output_path, partition};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,

    /// Directory to write the mr-out-* files into
    #[structopt(short, long, default_value = "target")]
    dir: PathBuf,

    #[structopt(long, default_value = "10")]
    nreduce: usize,
}

/// Single-process reference run: same map, same partitioning, same reduce,
/// same output naming as the distributed path, with no coordinator.
fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    let mut groups = HashMap::<String, Vec<String>>::new();
    for fname in &opt.files {
        let contents = fs::read_to_string(fname)?;
        for (k, v) in map(fname, &contents) {
            groups.entry(k).or_default().push(v);
        }
    }

    let mut outputs: Vec<Vec<(String, String)>> = vec![Vec::new(); opt.nreduce];
    for (k, vs) in &groups {
        let r = partition(k, opt.nreduce);
        outputs[r].push((k.clone(), reduce(k, vs)));
    }

    for (r, mut pairs) in outputs.into_iter().enumerate() {
        pairs.sort();
        let path = output_path(&opt.dir, r);
        AtomicFile::new(&path, AllowOverwrite).write(|f| {
            let mut s = String::new();
            for (k, v) in &pairs {
                s.push_str(&format!("{} {}\n", k, v));
            }
            f.write_all(s.as_bytes())
        })?;
        trace!("wrote {:?}", path);
    }
    Ok(())
}
