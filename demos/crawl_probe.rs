use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use fetchwarden::{
    CrawlRequest, Delivery, DispatcherConfig, DispatcherConfigBuilder, HandlerFuture,
    ResponseHandler, Runner,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::time::sleep;

const DEFAULT_URLS: &str = "https://example.com/,https://www.rust-lang.org/";
const DEFAULT_SPIDER: &str = "crawl-probe";
const DEFAULT_WORKER_COUNT: usize = 8;
const DEFAULT_PER_DOMAIN: usize = 2;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_LOG_DIRECTIVE: &str = "warn";
const IDLE_POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let args = ProbeArgs::from_env()?;
    let bar = build_progress_bar(args.urls.len() as u64);
    bar.println(format!(
        "Fetching {} URLs with {} workers through {} identities",
        args.urls.len(),
        args.worker_count,
        args.proxies.len().max(1)
    ));

    let config = args.to_dispatcher_config()?;
    let stats = Arc::new(ProbeStats::default());
    let handler = ProgressHandler {
        bar: bar.clone(),
        stats: stats.clone(),
    };
    let mut runner = Runner::new(config, handler)?;
    runner.dispatcher().submit_all(
        args.urls
            .iter()
            .map(|url| CrawlRequest::new(DEFAULT_SPIDER, url.clone())),
    );

    let started_at = Instant::now();
    runner.start().await?;
    let shutdown = runner.cancellation_token();
    loop {
        if runner.dispatcher().is_idle() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bar.println("Ctrl-C received; stopping");
                break;
            }
            _ = shutdown.cancelled() => break,
            _ = sleep(IDLE_POLL) => {
                bar.set_position(runner.dispatcher().dead_letter_stats().total + stats.delivered());
            }
        }
    }

    let stop_result = runner.stop().await;
    bar.finish_with_message(if stop_result.is_ok() {
        "done"
    } else {
        "aborted"
    });
    print_summary(&bar, &runner, &stats, started_at.elapsed());
    stop_result
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    fetchwarden::init_tracing();
}

fn build_progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(len.max(1)), ProgressDrawTarget::stdout_with_hz(12));
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages ({per_sec:.2} pg/s) {msg}",
    )
    .expect("valid progress bar template")
    .progress_chars("=>-");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn print_summary(
    bar: &ProgressBar,
    runner: &Runner<ProgressHandler>,
    stats: &ProbeStats,
    elapsed: Duration,
) {
    let dispatcher = runner.dispatcher();
    let telemetry = dispatcher.telemetry();
    let dead = dispatcher.dead_letter_stats();
    bar.println(format!(
        "Delivered {} pages ({} bytes) in {:.2}s; {} dead letters, {} retries, {} left queued",
        stats.delivered(),
        stats.bytes.load(Ordering::Relaxed),
        elapsed.as_secs_f64(),
        dead.total,
        telemetry.retried,
        dispatcher.frontier().len()
    ));
    for (reason, count) in &dead.by_reason {
        bar.println(format!("  dead letter: {reason} x{count}"));
    }
    for stats in dispatcher.identity_stats().per_identity.values() {
        bar.println(format!(
            "  {} {:?}: {} ok / {} failed",
            stats.endpoint, stats.state, stats.success_count, stats.failure_count
        ));
    }
}

struct ProbeArgs {
    urls: Vec<String>,
    proxies: Vec<String>,
    worker_count: usize,
    per_domain: usize,
    max_retries: u32,
}

impl ProbeArgs {
    fn from_env() -> Result<Self> {
        let urls = split_list(&read_env_or_default("FETCHWARDEN_URLS", DEFAULT_URLS));
        let proxies = split_list(&read_env_or_default("FETCHWARDEN_PROXIES", ""));
        let worker_count =
            parse_env_with_default::<usize>("FETCHWARDEN_WORKERS", DEFAULT_WORKER_COUNT)?;
        let per_domain =
            parse_env_with_default::<usize>("FETCHWARDEN_PER_DOMAIN", DEFAULT_PER_DOMAIN)?;
        let max_retries =
            parse_env_with_default::<u32>("FETCHWARDEN_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;

        ensure!(!urls.is_empty(), "FETCHWARDEN_URLS must list at least one URL");
        ensure!(worker_count > 0, "FETCHWARDEN_WORKERS must be greater than 0");
        ensure!(per_domain > 0, "FETCHWARDEN_PER_DOMAIN must be greater than 0");

        Ok(Self {
            urls,
            proxies,
            worker_count,
            per_domain,
            max_retries,
        })
    }

    fn to_dispatcher_config(&self) -> Result<DispatcherConfig> {
        let builder: DispatcherConfigBuilder = if self.proxies.is_empty() {
            DispatcherConfig::builder().direct()
        } else {
            self.proxies
                .iter()
                .fold(DispatcherConfig::builder(), |builder, proxy| {
                    builder.proxy(proxy.clone())
                })
        };

        builder
            .worker_count(self.worker_count)
            .per_domain_concurrency(self.per_domain)
            .max_retries(self.max_retries)
            .build()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}

#[derive(Default)]
struct ProbeStats {
    delivered: AtomicU64,
    bytes: AtomicU64,
}

impl ProbeStats {
    fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

struct ProgressHandler {
    bar: ProgressBar,
    stats: Arc<ProbeStats>,
}

impl ResponseHandler for ProgressHandler {
    fn handle<'a>(&'a self, delivery: Delivery) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes
                .fetch_add(delivery.response.body.len() as u64, Ordering::Relaxed);
            self.bar.set_message(format!(
                "{} {}",
                delivery.response.status,
                delivery.request.url()
            ));
            Ok(())
        })
    }
}
