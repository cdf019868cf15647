mod collectors;
mod config;
mod http;
mod metrics;
mod snapshot;
mod stream;

use axum::serve;
use clap::Parser;
use collectors::system::{is_raspberry_pi, read_board_model, SystemStatsProvider};
use collectors::Sampler;
use config::{Config, ConfigError};
use metrics::Metrics;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use stream::StreamManager;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Parser, Debug)]
#[command(name = "sysmond")]
#[command(version)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    per_cpu: bool,
    #[arg(long = "disk", value_name = "PATH")]
    disks: Vec<String>,
    #[arg(long)]
    stats_namespace: Option<String>,
    #[arg(long, value_name = "SECS")]
    stats_update_freq: Option<f64>,
    #[arg(long, conflicts_with = "no_require_pi")]
    require_pi: bool,
    #[arg(long, conflicts_with = "require_pi")]
    no_require_pi: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let model = read_board_model();
    if !is_raspberry_pi(model.as_deref()) {
        if cfg.platform.require_raspberry_pi {
            error!(
                model = model.as_deref().unwrap_or("UNKNOWN"),
                "требуется Raspberry Pi, запуск невозможен"
            );
            std::process::exit(1);
        }
        warn!(
            model = model.as_deref().unwrap_or("UNKNOWN"),
            "плата не похожа на Raspberry Pi, часть показателей может отсутствовать"
        );
    }

    let interval = cfg.stream.update_interval();
    info!(
        listen = %cfg.listen,
        namespace = %cfg.stream.namespace,
        interval = %humantime::format_duration(interval),
        per_cpu = cfg.stats.per_cpu,
        disks = ?cfg.stats.disks,
        "запуск sysmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let sampler = Sampler::new(Arc::new(SystemStatsProvider::new(cfg.stats.sampling())));
    let stream = Arc::new(StreamManager::new(
        &cfg.stream,
        sampler.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = stream.mount(http::build_router(metrics.clone(), sampler));
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    stream.shutdown().await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = match cli.config.as_deref() {
        Some(path) => Config::load_from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load_from_file(DEFAULT_CONFIG_PATH)?
        }
        None => {
            info!(
                path = DEFAULT_CONFIG_PATH,
                "файл конфигурации не найден, используются значения по умолчанию"
            );
            Config::default()
        }
    };
    apply_overrides(&mut cfg, cli);
    cfg.validate()?;
    Ok(cfg)
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(listen) = &cli.listen {
        cfg.listen = listen.clone();
    }
    if cli.per_cpu {
        cfg.stats.per_cpu = true;
    }
    if !cli.disks.is_empty() {
        cfg.stats.disks = cli.disks.clone();
    }
    if let Some(namespace) = &cli.stats_namespace {
        cfg.stream.namespace = namespace.clone();
    }
    if let Some(freq) = cli.stats_update_freq {
        cfg.stream.update_freq_secs = freq;
    }
    if cli.require_pi {
        cfg.platform.require_raspberry_pi = true;
    } else if cli.no_require_pi {
        cfg.platform.require_raspberry_pi = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "sysmond",
            "--listen",
            "127.0.0.1:9000",
            "--per-cpu",
            "--disk",
            "/",
            "--disk",
            "/tmp",
            "--stats-namespace",
            "/live",
            "--stats-update-freq",
            "0.5",
            "--require-pi",
        ]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &cli);

        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert!(cfg.stats.per_cpu);
        assert_eq!(cfg.stats.disks, vec!["/".to_string(), "/tmp".to_string()]);
        assert_eq!(cfg.stream.namespace, "/live");
        assert_eq!(cfg.stream.update_freq_secs, 0.5);
        assert!(cfg.platform.require_raspberry_pi);
    }

    #[test]
    fn no_flags_keep_file_values() {
        let cli = Cli::parse_from(["sysmond"]);
        let mut cfg = Config::default();
        cfg.platform.require_raspberry_pi = true;
        cfg.stats.disks = vec!["/".to_string()];
        apply_overrides(&mut cfg, &cli);

        assert!(cfg.platform.require_raspberry_pi);
        assert_eq!(cfg.stats.disks, vec!["/".to_string()]);
        assert_eq!(cfg.stream.namespace, "/stats");
    }

    #[test]
    fn require_pi_flags_conflict() {
        let parsed = Cli::try_parse_from(["sysmond", "--require-pi", "--no-require-pi"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_override_fails_validation() {
        let cli = Cli::parse_from([
            "sysmond",
            "--config",
            "/definitely/missing/config.yaml",
        ]);
        assert!(matches!(load_config(&cli), Err(ConfigError::Read { .. })));

        let cli = Cli::parse_from(["sysmond", "--stats-update-freq", "0"]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &cli);
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }
}
