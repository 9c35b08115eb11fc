fn main() {
    if let Err(e) = govmaster::gov::govctl_cli::run() {
        eprintln!("govctl: {e:#}");
        std::process::exit(1);
    }
}
