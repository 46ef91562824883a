fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    tracklet_node::telemetry::init();
    let args: Vec<String> = std::env::args().collect();
    let config = tracklet_node::NodeConfig::from_args(&args)?;
    tracklet_node::run(config)
}
