use crate::config::EngineConfig;
use crate::error::SyncError;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_NETWORK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub network_check_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            network_check_interval: DEFAULT_NETWORK_CHECK_INTERVAL,
        }
    }
}

impl From<&EngineConfig> for BackoffConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.retry_max_retries,
            initial_backoff: Duration::from_secs(config.retry_initial_backoff_secs),
            max_backoff: Duration::from_secs(config.retry_max_backoff_secs),
            backoff_multiplier: config.retry_backoff_multiplier,
            network_check_interval: Duration::from_secs(config.network_check_interval_secs),
        }
    }
}

/// Tracks the current backoff delay across retry attempts.
#[derive(Debug, Clone, Copy)]
struct BackoffState {
    current_delay: Duration,
}

impl BackoffState {
    fn new(config: &BackoffConfig) -> Self {
        Self { current_delay: config.initial_backoff }
    }

    fn reset(&mut self, config: &BackoffConfig) {
        self.current_delay = config.initial_backoff;
    }

    fn advance(&mut self, config: &BackoffConfig) -> Duration {
        let delay = self.current_delay;
        let next_secs = delay.as_secs_f64() * config.backoff_multiplier;
        self.current_delay = Duration::from_secs_f64(next_secs).min(config.max_backoff);
        delay
    }
}

/// Runs `f` up to `config.max_retries + 1` times, doubling the delay
/// between attempts (capped at `max_backoff`). Retries only on
/// [`SyncError::is_transient`]; any other error (including connectivity,
/// which callers should route through [`retry_with_network_wait`] instead)
/// is returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(config: &BackoffConfig, mut f: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut backoff = BackoffState::new(config);
    let mut attempt = 0u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = backoff.advance(config);
                tracing::warn!(target: "retry", attempt, ?delay, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Polls `health_check` every `check_interval` until it returns `true`.
/// Fires `on_waiting` once at the start and `on_restored` once on success;
/// logs a heartbeat every 12th attempt (~60s at the default interval).
pub async fn wait_for_network<H, Fut>(
    health_check: H,
    check_interval: Duration,
    on_waiting: impl FnOnce(),
    on_restored: impl FnOnce(),
) where
    H: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tracing::info!(target: "retry", "network appears down, waiting for connectivity");
    on_waiting();

    let mut attempts: u64 = 0;
    loop {
        tokio::time::sleep(check_interval).await;
        attempts += 1;

        if health_check().await {
            tracing::info!(target: "retry", elapsed_secs = attempts * check_interval.as_secs(), "network restored");
            on_restored();
            return;
        }

        if attempts % 12 == 0 {
            tracing::info!(target: "retry", elapsed_secs = attempts * check_interval.as_secs(), "still waiting for network");
        }
    }
}

/// Combines backoff retry with network-aware waiting (sec 4.11): a
/// connectivity error suspends indefinitely in [`wait_for_network`] and
/// resets the backoff counter once restored; any other transient error
/// uses ordinary backoff; everything else is returned immediately.
pub async fn retry_with_network_wait<F, Fut, T, H, HFut>(
    config: &BackoffConfig,
    mut f: F,
    health_check: H,
    mut on_network_waiting: impl FnMut(),
    mut on_network_restored: impl FnMut(),
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
    H: Fn() -> HFut,
    HFut: Future<Output = bool>,
{
    let mut backoff = BackoffState::new(config);
    let mut attempt = 0u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_connectivity() => {
                tracing::warn!(target: "retry", error = %err, "network error");
                wait_for_network(
                    &health_check,
                    config.network_check_interval,
                    &mut on_network_waiting,
                    &mut on_network_restored,
                )
                .await;
                backoff.reset(config);
                attempt = 0;
            }
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = backoff.advance(config);
                tracing::warn!(target: "retry", attempt, ?delay, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
