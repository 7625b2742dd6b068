//! Mount a HopsFS/HDFS namespace as a local filesystem.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser as _;
use tracing::{error, info, warn};

use hopsfs_mount::config::Args;
use hopsfs_mount::fs::clock::{Clock, WallClock};
use hopsfs_mount::fs::dfs::DfsClient;
use hopsfs_mount::fs::fault_tolerant::FaultTolerantDfsClient;
use hopsfs_mount::fs::hopsfs::HopsFsClient;
use hopsfs_mount::fs::idcache::{IdentityCache, IdentityConfig, NixUserDatabase};
use hopsfs_mount::fs::retry::RetryPolicy;
use hopsfs_mount::fs::{Filesystem, MountConfig};
use hopsfs_mount::fuse::{mount_options, HopsFuse};
use hopsfs_mount::logging;

fn main() -> ExitCode {
    // Usage errors (exit code 2) are produced by the parser itself.
    let args = Args::parse();

    if let Some(log_file) = &args.log_file {
        if let Err(e) = logging::check_log_file(log_file) {
            eprintln!("Error creating log file {}: {e}", log_file.display());
            return ExitCode::FAILURE;
        }
    }
    if let Err(e) = logging::init(&args.log_level, args.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        stage_dir = %args.stage_dir.display(),
        tls = args.tls,
        retry_max_attempts = args.retry_max_attempts,
        connections = args.num_connections,
        "starting hopsfs-mount"
    );

    if let Err(e) = create_staging_dir(&args) {
        error!(stage_dir = %args.stage_dir.display(), error = %e, "failed to create staging dir");
        return ExitCode::FAILURE;
    }
    raise_fd_limit();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to create the tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args, runtime.handle().clone())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

async fn run(args: Args, runtime: tokio::runtime::Handle) -> Result<(), ()> {
    let clock: Arc<dyn Clock> = Arc::new(WallClock);
    let policy = Arc::new(RetryPolicy::new(
        args.retry_max_attempts,
        args.retry_min_delay,
        args.retry_max_delay,
        args.retry_time_limit,
        clock.clone(),
    ));
    let idcache = Arc::new(IdentityCache::new(Box::new(NixUserDatabase), clock.clone()));

    let identity = IdentityConfig {
        force_username: args.force_username(),
        group_from_dataset_path: args.group_from_dataset_path,
    };

    let dfs_user = resolve_dfs_user(&identity, &idcache)?;
    info!(user = %dfs_user, "connecting to the DFS");

    let mut connectors: Vec<Arc<dyn DfsClient>> = Vec::with_capacity(args.num_connections.max(1));
    for _ in 0..args.num_connections.max(1) {
        let mut builder = webhdfs::Client::builder(&args.namenode, args.tls).with_user(&dfs_user);
        if args.tls {
            builder = builder.with_tls(webhdfs::TlsOptions {
                root_ca_bundle: args.root_ca_bundle.clone(),
                client_certificate: args.client_certificate.clone(),
                client_key: args.client_key.clone(),
            });
        }
        let raw = Arc::new(HopsFsClient::new(
            builder.build(),
            clock.clone(),
            idcache.clone(),
            identity.clone(),
        ));
        connectors.push(Arc::new(FaultTolerantDfsClient::new(raw, policy.clone())));
    }
    info!(count = connectors.len(), "created file system clients");

    if args.src_dir != "/" {
        if let Err(e) = connectors[0].stat(&args.src_dir).await {
            error!(src_dir = %args.src_dir, error = %e, "source mount directory is not accessible");
            return Err(());
        }
    }

    if !args.lazy {
        if let Err(e) = connectors[0].ensure_connected().await {
            error!(error = %e, "cannot establish a connection to the DFS; use --lazy to mount anyway");
            return Err(());
        }
    }

    let config = MountConfig {
        src_dir: args.src_dir.clone(),
        allowed_prefixes: args.allowed_prefix_list(),
        read_only: args.read_only,
        stage_dir: args.stage_dir.clone(),
        enable_page_cache: args.enable_page_cache,
        identity,
    };
    let fs = Filesystem::new(connectors, config, policy, clock, idcache);

    let options = mount_options("hopsfs", args.read_only, args.allow_other);
    let adapter = HopsFuse::new(fs.clone(), runtime);
    let session = match fuser::spawn_mount2(adapter, &args.mountpoint, &options) {
        Ok(session) => session,
        Err(e) => {
            error!(mountpoint = %args.mountpoint.display(), error = %e, "failed to mount");
            return Err(());
        }
    };
    info!(
        mountpoint = %args.mountpoint.display(),
        src_dir = %args.src_dir,
        "mounted successfully"
    );

    wait_for_shutdown().await;

    // Stop granting retries so in-flight operations drain promptly, then
    // force the unmount.
    fs.shut_down_retries();
    fs.unmount(&args.mountpoint).await;
    drop(session);
    info!("closed");
    Ok(())
}

fn resolve_dfs_user(identity: &IdentityConfig, idcache: &IdentityCache) -> Result<String, ()> {
    if let Some(forced) = &identity.force_username {
        return Ok(forced.clone());
    }
    if let Ok(user) = std::env::var("HADOOP_USER_NAME") {
        if !user.is_empty() {
            return Ok(user);
        }
    }
    match idcache.current_user() {
        Ok(user) => Ok(user),
        Err(e) => {
            error!(error = %e, "could not determine the connecting user");
            Err(())
        }
    }
}

fn create_staging_dir(args: &Args) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt as _;
    match std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&args.stage_dir)
    {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Lift the descriptor limit; every open file consumes a staging fd.
fn raise_fd_limit() {
    const WANT: u64 = 1024 * 1024;
    if let Err(e) =
        nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE, WANT, WANT)
    {
        warn!(error = %e, "failed to raise the open file limit to 1M");
    }
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "could not install the SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
        _ = sigterm.recv() => info!("received termination signal, shutting down"),
    }
}
