#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use aether_control::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "aether-controld",
    about = "Leader-coordinated bandwidth allocation control plane"
)]
struct Cli {
    /// Path to the control-plane config file
    #[arg(short, long, default_value = "aether.toml")]
    config: PathBuf,

    /// API listen address
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    listen: String,

    /// Admin listen address (health/metrics)
    #[arg(long, default_value = "0.0.0.0:9401")]
    admin_listen: String,
}

fn main() {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_threads();
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }));

    match result {
        Ok(()) => {}
        Err(e) if e.downcast_ref::<server::bootstrap::ConfigError>().is_some() => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
        Err(e) if e.downcast_ref::<server::bootstrap::LeaseCorruption>().is_some() => {
            eprintln!("{}", e);
            std::process::exit(3);
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}
