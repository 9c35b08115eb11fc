use clap::Parser;

#[tokio::main]
async fn main() {
    let args = govmaster::gov::cli::Args::parse();
    let cfg = match govmaster::gov::config::load_master_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("govmaster: {e:#}");
            std::process::exit(2);
        }
    };
    // govmaster is daemon-only: control commands go through govctl.
    match govmaster::gov::daemon::run_daemon_async(cfg).await {
        Ok(exit) => std::process::exit(exit.code()),
        Err(e) => {
            eprintln!("govmaster: {e:#}");
            std::process::exit(1);
        }
    }
}
