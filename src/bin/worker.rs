use std::path::PathBuf;

use structopt::StructOpt;

use mapred::app::wc;
use mapred::Worker;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"))]
struct Opt {
    /// Coordinator address, host:port
    #[structopt(short, long)]
    server: String,

    /// Directory shared with the coordinator and the other workers
    #[structopt(short, long, default_value = "target")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let w = Worker {
        dir: opt.dir,
        server: opt.server,
        map: wc::map,
        reduce: wc::reduce,
    };
    w.launch().await
}
