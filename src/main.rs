use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use swapgate::backend::ProcessBackend;
use swapgate::config::Config;
use swapgate::gate::RequestGate;
use swapgate::logging::init_tracing;
use swapgate::proxy::ProxyServer;
use swapgate::swap::policy::build_policy;
use swapgate::swap::{ChangeHook, SourceWatcher, StaleFlag, SwapCoordinator, SwapSettings};
use swapgate::tunnel::TunnelProxy;

#[derive(Debug, Parser)]
#[command(name = "swapgate", version, about = "Swap backend generations behind a stable endpoint")]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Primary HTTP listen address
    #[arg(long)]
    bind: Option<String>,

    /// Sideband tunnel listen address ("" disables the tunnel)
    #[arg(long)]
    tunnel_bind: Option<String>,

    /// Mount admin routes under this path prefix
    #[arg(long)]
    admin_prefix: Option<String>,

    /// Extra paths to watch for source changes
    #[arg(long = "watch")]
    watch: Vec<PathBuf>,

    /// Backend command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.proxy.bind_addr = bind;
        }
        if let Some(tunnel_bind) = self.tunnel_bind {
            config.proxy.tunnel_bind_addr = Some(tunnel_bind);
        }
        if let Some(prefix) = self.admin_prefix {
            config.proxy.admin_prefix = Some(prefix);
        }
        config.swap.watch_paths.extend(self.watch);

        let mut command = self.command.into_iter();
        if let Some(program) = command.next() {
            config.backend.command = program;
            config.backend.args = command.collect();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load config")?;
    cli.apply(&mut config);
    config.validate().context("Invalid config")?;

    let backend = Arc::new(
        ProcessBackend::new(config.backend.clone(), config.defaults.connect_timeout())
            .context("Failed to build backend client")?,
    );
    let coordinator = Arc::new(SwapCoordinator::new(
        backend,
        SwapSettings::from(&config.swap),
    ));

    let stale = StaleFlag::new();
    let _watcher = if config.swap.watch_paths.is_empty() {
        None
    } else {
        let on_change: Option<ChangeHook> = if config.swap.eager_on_change {
            let runtime = tokio::runtime::Handle::current();
            let coordinator = coordinator.clone();
            Some(Box::new(move || {
                let _guard = runtime.enter();
                let handle = coordinator.trigger_swap_after_current();
                tracing::info!(generation = %handle.generation(), "Swap triggered by source change");
            }) as ChangeHook)
        } else {
            None
        };

        Some(
            SourceWatcher::start(
                &config.swap.watch_paths,
                config.swap.watch_debounce(),
                stale.clone(),
                on_change,
            )
            .context("Failed to start source watcher")?,
        )
    };

    let policy = build_policy(&config.swap, &stale);
    tracing::info!(policy = policy.name(), "Swap policy configured");

    let gate = Arc::new(RequestGate::new(
        coordinator.clone(),
        policy,
        config.swap.hold_timeout(),
    ));
    let tunnel = Arc::new(TunnelProxy::new(
        coordinator.clone(),
        config.defaults.connect_timeout(),
        config.swap.hold_timeout(),
    ));

    let mut server = ProxyServer::new(&config, gate, tunnel).context("Failed to build proxy")?;
    server.try_bind().await.context("Failed to bind")?;

    // Bring up the first generation before serving. A failure here is not
    // fatal: the cold-start policy retries on the first request.
    let first = coordinator.trigger_swap();
    match first.wait().await {
        Ok(generation) => tracing::info!(%generation, "Initial generation active"),
        Err(e) => tracing::error!(error = %e, "Initial swap failed"),
    }

    server.run().await.context("Proxy server failed")?;
    Ok(())
}
