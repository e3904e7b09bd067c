#![forbid(unsafe_code)]

use usbipd::{start_server, Config, DeviceRegistry, Metrics};

#[derive(Default)]
struct CliArgs {
    bind: Option<std::net::SocketAddr>,
    devices: Vec<(String, String)>, // (busid, monitor device path)
    ready_stdout: bool,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--ready-stdout" {
            out.ready_stdout = true;
            continue;
        }

        if arg == "--bind" {
            let value = args
                .next()
                .ok_or_else(|| "--bind requires a value like 0.0.0.0:3240".to_string())?;
            out.bind = Some(
                value
                    .parse()
                    .map_err(|_| format!("invalid --bind value {value:?}"))?,
            );
            continue;
        }

        if arg == "--device" {
            let value = args
                .next()
                .ok_or_else(|| "--device requires a value like 1-2=\\\\.\\UsbMon0".to_string())?;
            let (busid, path) = value
                .split_once('=')
                .ok_or_else(|| format!("invalid --device value {value:?} (want busid=path)"))?;
            out.devices.push((busid.to_string(), path.to_string()));
            continue;
        }

        if arg == "--help" || arg == "-h" {
            println!(
                "Usage: usbipd [--bind <ip:port>] [--device <busid>=<path>]... [--ready-stdout]\n\
                 \n\
                 Options:\n\
                 \t--bind <ip:port>\tOverride the bind address (env: USBIPD_BIND)\n\
                 \t--device <busid>=<path>\tExport a monitor-captured device\n\
                 \t--ready-stdout\t\tPrint USBIPD_READY <addr> once listening"
            );
            std::process::exit(0);
        }

        return Err(format!("unknown argument {arg:?}"));
    }

    Ok(out)
}

fn tokio_worker_threads_from_env() -> Option<usize> {
    let raw = match std::env::var("USBIPD_TOKIO_WORKER_THREADS") {
        Ok(v) => v,
        Err(_) => return None,
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            eprintln!(
                "warning: invalid USBIPD_TOKIO_WORKER_THREADS value: {raw:?} (expected positive integer); using Tokio default"
            );
            None
        }
    }
}

fn build_tokio_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = tokio_worker_threads_from_env() {
        builder.worker_threads(n);
    }
    builder.enable_all().build()
}

fn main() -> std::io::Result<()> {
    build_tokio_runtime()?.block_on(async_main())
}

async fn async_main() -> std::io::Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err:#}");
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, err));
        }
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let registry = DeviceRegistry::new();
    for (busid, path) in &cli.devices {
        if let Err(err) = export_device(&registry, busid, path).await {
            tracing::error!(%busid, %path, "export failed: {err}");
            std::process::exit(1);
        }
        tracing::info!(%busid, %path, "device exported");
    }

    let metrics = Metrics::new();
    let handle = match start_server(config, registry, metrics).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!("failed to start server: {err}");
            return Err(err);
        }
    };

    if cli.ready_stdout {
        println!("USBIPD_READY {}", handle.local_addr());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(windows)]
async fn export_device(
    registry: &DeviceRegistry,
    busid: &str,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;
    let channel = usbipd_monitor::windows::MonitorChannel::open(std::path::Path::new(path))?;
    usbipd::export_probed_device(registry, busid, path, Arc::new(channel)).await?;
    Ok(())
}

#[cfg(not(windows))]
async fn export_device(
    _registry: &DeviceRegistry,
    _busid: &str,
    _path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("device export requires the USB monitor driver (Windows)".into())
}
