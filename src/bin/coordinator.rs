use std::path::PathBuf;
use std::time::Duration;

use log::info;
use structopt::StructOpt;

use mapred::Coordinator;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Port to serve worker RPCs on
    #[structopt(short, long)]
    port: u16,

    /// Seconds before an unreported task is reassigned
    #[structopt(short, long, default_value = "10")]
    timeout: u64,

    /// Number of reduce tasks
    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Input files, one map task each
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let coordinator = Coordinator::new(opt.files, opt.nreduce, Duration::from_secs(opt.timeout));

    let server = coordinator.clone();
    let mut server = tokio::spawn(async move { server.launch(opt.port).await });

    // Exiting once the job is done is what tells lingering workers, via
    // their next failed call, that there is nothing left for them.
    loop {
        tokio::select! {
            res = &mut server => {
                res??;
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if coordinator.done() {
                    break;
                }
            }
        }
    }
    info!("job complete");
    Ok(())
}
