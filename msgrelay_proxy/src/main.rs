//! Msgrelay proxy node executable.

use std::net::{IpAddr, SocketAddr};

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use msgrelay::{pf_error, ProxyError, ProxyServer};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Host address to listen on.
    #[arg(long, default_value_t = String::from("0.0.0.0"))]
    host: String,

    /// Proxy port open to clients and backend replicas.
    #[arg(short, long, default_value_t = 60000)]
    port: u16,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Optional TOML string of tunable configuration parameters.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the listening address on
    /// success or `Err(ProxyError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, ProxyError> {
        if self.port <= 1024 {
            return Err(ProxyError(format!("invalid port {}", self.port)));
        }
        if self.threads < 2 {
            return Err(ProxyError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let host: IpAddr = self.host.parse().map_err(|e| {
            ProxyError(format!(
                "failed to parse host '{}': {}",
                self.host, e
            ))
        })?;
        Ok(SocketAddr::new(host, self.port))
    }
}

// Proxy executable main entrance.
fn proxy_main() -> Result<(), ProxyError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let proxy_addr = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-proxy")
        .build()?;

    // enter tokio runtime, set up the proxy, and start the accept loop
    runtime.block_on(async move {
        let mut server =
            ProxyServer::new_and_setup(proxy_addr, args.config.as_deref())
                .await?;

        server.run().await;

        Ok::<(), ProxyError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = proxy_main() {
        pf_error!("proxy_main exitted: {}", e);
        std::process::exit(1);
    }
}
