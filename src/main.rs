use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tcptamper::Logger;
use tcptamper::ProbeEvent;
use tcptamper::RunVerdict;
use tcptamper::ShellRunner;
use tcptamper::StaticNetwork;
use tcptamper::SystemNetwork;
use tcptamper::TamperConfig;
use tcptamper::network::HostNetwork;
use tcptamper::spawn_run;

/// Probe how the path to a remote peer treats anomalous TCP segments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Json config file, flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote peer address or host name
    #[arg(short, long)]
    server: Option<String>,

    /// Remote ports, comma separated
    #[arg(short, long, value_delimiter = ',')]
    ports: Option<Vec<u16>>,

    /// Source addresses to probe from, comma separated (default: every interface address)
    #[arg(short, long, value_delimiter = ',')]
    local: Option<Vec<IpAddr>>,

    /// Seed for the source port generator
    #[arg(long)]
    seed: Option<u64>,

    /// Path of the helper binary
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Zip bundle to install the helper from when it is missing
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Also run the extended variant catalog
    #[arg(short, long)]
    extended: bool,

    /// Print the report as json
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<TamperConfig, tcptamper::TamperError> {
    let mut config = match &args.config {
        Some(path) => TamperConfig::from_file(path)?,
        None => TamperConfig::default(),
    };
    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    if let Some(ports) = &args.ports {
        config.server_ports = ports.clone();
    }
    if let Some(local) = &args.local {
        config.local_addrs = Some(local.clone());
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(helper) = &args.helper {
        config.helper_path = helper.clone();
    }
    if args.bundle.is_some() {
        config.helper_bundle = args.bundle.clone();
    }
    if args.extended {
        config.extended_variants = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let logging = if args.verbose {
        Logger::init_debug_logging()
    } else {
        Logger::init_info_logging()
    };
    if let Err(e) = logging {
        eprintln!("{}", e);
    }

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("load config failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let network: Box<dyn HostNetwork> = match &config.local_addrs {
        Some(addrs) => Box::new(StaticNetwork::new(addrs.clone())),
        None => Box::new(SystemNetwork),
    };
    let handle = spawn_run(config, Box::new(ShellRunner::new()), network);
    for event in handle.events.iter() {
        if let ProbeEvent::Progress { completed, total } = event {
            eprintln!("Running Tests: {}/{}", completed, total);
        }
    }
    let report = match handle.join() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if args.json {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", report);
    }
    match report.verdict {
        RunVerdict::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
