#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **koi-scheduler** - concurrency, cost and retry policy for the
//! pipeline's paid stages.
//!
//! A [`Scheduler`] bounds how many stage runs are in flight at once,
//! tracks how much each cost category has spent today against a
//! configured daily budget, decides which model tier a given priority
//! should route to, and runs the retry/backoff loop paid-model calls go
//! through on transient failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Errors raised by the scheduler.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    /// Running this stage would push `category`'s spend for today past
    /// its configured daily budget.
    #[error("daily budget exceeded for category '{category}': {spent:.4} + {estimated:.4} > {limit:.4}")]
    BudgetExceeded {
        /// The cost category over budget.
        category: String,
        /// Amount already spent today.
        spent: f64,
        /// Estimated cost of the call that was rejected.
        estimated: f64,
        /// The configured daily limit.
        limit: f64,
    },
}

/// File extensions treated as source code for the content-classification
/// heuristic, independent of any fenced-code-block markers.
const CODE_FILE_EXTENSIONS: &[&str] = &[
    ".rs", ".py", ".js", ".ts", ".tsx", ".jsx", ".go", ".java", ".c", ".h", ".cpp", ".hpp", ".rb", ".php",
    ".cs", ".kt", ".swift", ".sh", ".sql", ".yaml", ".yml", ".toml", ".json",
];

/// A content-classification heuristic that decides whether a paid stage
/// should even be attempted for a given piece of text, independent of
/// budget. Used to skip enrichment/extraction on content unlikely to
/// benefit from it: very short snippets, content that is mostly
/// non-linguistic, and source code (fenced code blocks, or text that
/// just names a known source file).
pub fn should_skip_for_content(text: &str, min_chars: usize) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < min_chars {
        return true;
    }
    if is_code(trimmed) {
        return true;
    }
    let alphabetic = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    let total = trimmed.chars().count().max(1);
    (alphabetic as f64 / total as f64) < 0.3
}

/// Whether `text` looks like source code rather than prose: a fenced
/// code block (however `to_markdown` wraps a non-text/non-markdown
/// format), or a reference to a file with a known source-code extension.
fn is_code(text: &str) -> bool {
    if text.starts_with("```") {
        return true;
    }
    text.split_whitespace()
        .any(|word| CODE_FILE_EXTENSIONS.iter().any(|ext| word.ends_with(ext)))
}

/// Requested urgency for a model call, used to pick a model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Background/batch work; route to the cheapest available model.
    Low,
    /// Default interactive priority.
    Normal,
    /// Time-sensitive or high-value content; route to the strongest
    /// available model regardless of extra cost.
    High,
}

/// Maps a priority and cost category to the model identifier that
/// category should use at that priority, falling back to `default` when
/// no override is configured.
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    overrides: HashMap<(String, Priority), String>,
    default_model: String,
}

impl ModelRouter {
    /// Build a router that falls back to `default_model` for any
    /// (category, priority) pair without an explicit override.
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            overrides: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    /// Configure which model `category` should use at `priority`.
    pub fn set_route(&mut self, category: impl Into<String>, priority: Priority, model: impl Into<String>) {
        self.overrides.insert((category.into(), priority), model.into());
    }

    /// Resolve the model identifier for `category` at `priority`.
    pub fn route(&self, category: &str, priority: Priority) -> &str {
        self.overrides
            .get(&(category.to_string(), priority))
            .unwrap_or(&self.default_model)
    }
}

/// How retries are spaced out after a transient failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay; attempt `n` (0-indexed retry count) waits
    /// `base_delay * 2^n`, plus jitter.
    pub base_delay: Duration,
    /// Maximum jitter added on top of the exponential delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `f`, retrying on `Err` up to `max_attempts` times with
    /// exponential backoff and jitter. Returns the last error if every
    /// attempt fails.
    pub async fn run<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.max_attempts => {
                    warn!(attempt, %err, "retrying after transient failure");
                    let backoff = self.base_delay * 2u32.pow(attempt);
                    let jitter_ms = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Default)]
struct DailyUsage {
    date: Option<NaiveDate>,
    spent_usd: f64,
}

/// Bounds concurrency and per-category daily spend for paid pipeline
/// stages.
pub struct Scheduler {
    concurrency: Arc<Semaphore>,
    daily_budgets: HashMap<String, f64>,
    usage: Mutex<HashMap<String, DailyUsage>>,
    pub router: ModelRouter,
    pub retry: RetryPolicy,
}

/// An acquired concurrency slot; dropping it returns the slot to the
/// pool.
pub struct Slot(#[allow(dead_code)] OwnedSemaphorePermit);

impl Scheduler {
    /// Build a scheduler allowing `max_in_flight` concurrent paid-stage
    /// runs, with each entry in `daily_budgets` capping that category's
    /// USD spend per UTC calendar day.
    pub fn new(max_in_flight: usize, daily_budgets: HashMap<String, f64>) -> Self {
        Self {
            concurrency: Arc::new(Semaphore::new(max_in_flight)),
            daily_budgets,
            usage: Mutex::new(HashMap::new()),
            router: ModelRouter::new("deterministic"),
            retry: RetryPolicy::default(),
        }
    }

    /// Wait for a free concurrency slot.
    pub async fn acquire(&self) -> Slot {
        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("scheduler semaphore is never closed");
        Slot(permit)
    }

    /// Check whether spending `estimated_cost` under `category` today
    /// would stay within budget, without recording it. Categories with
    /// no configured budget are unmetered.
    pub async fn check_budget(&self, category: &str, estimated_cost: f64) -> Result<(), SchedulerError> {
        let Some(&limit) = self.daily_budgets.get(category) else {
            return Ok(());
        };
        let mut usage = self.usage.lock().await;
        let entry = usage.entry(category.to_string()).or_default();
        let today = Utc::now().date_naive();
        if entry.date != Some(today) {
            entry.date = Some(today);
            entry.spent_usd = 0.0;
        }
        if entry.spent_usd + estimated_cost > limit {
            return Err(SchedulerError::BudgetExceeded {
                category: category.to_string(),
                spent: entry.spent_usd,
                estimated: estimated_cost,
                limit,
            });
        }
        Ok(())
    }

    /// Record that `category` spent `cost_usd`, rolling over to a fresh
    /// day's counter if needed. Call after a successful paid call whose
    /// actual cost is now known.
    pub async fn record_spend(&self, category: &str, cost_usd: f64) {
        let mut usage = self.usage.lock().await;
        let entry = usage.entry(category.to_string()).or_default();
        let today = Utc::now().date_naive();
        if entry.date != Some(today) {
            entry.date = Some(today);
            entry.spent_usd = 0.0;
        }
        entry.spent_usd += cost_usd;
    }

    /// Today's recorded spend for `category`, `0.0` if nothing has been
    /// recorded yet today.
    pub async fn spent_today(&self, category: &str) -> f64 {
        let usage = self.usage.lock().await;
        match usage.get(category) {
            Some(entry) if entry.date == Some(Utc::now().date_naive()) => entry.spent_usd,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_blocks_past_max_in_flight() {
        let scheduler = Scheduler::new(1, HashMap::new());
        let _slot = scheduler.acquire().await;
        let second = tokio::time::timeout(Duration::from_millis(50), scheduler.acquire()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn slot_is_released_on_drop() {
        let scheduler = Scheduler::new(1, HashMap::new());
        {
            let _slot = scheduler.acquire().await;
        }
        let second = tokio::time::timeout(Duration::from_millis(50), scheduler.acquire()).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn unmetered_category_is_never_over_budget() {
        let scheduler = Scheduler::new(4, HashMap::new());
        assert!(scheduler.check_budget("enrich", 1_000_000.0).await.is_ok());
    }

    #[tokio::test]
    async fn spend_within_budget_is_allowed_then_rejected_once_exhausted() {
        let mut budgets = HashMap::new();
        budgets.insert("embed".to_string(), 1.0);
        let scheduler = Scheduler::new(4, budgets);

        assert!(scheduler.check_budget("embed", 0.6).await.is_ok());
        scheduler.record_spend("embed", 0.6).await;
        assert!(scheduler.check_budget("embed", 0.5).await.is_err());
        assert!(scheduler.check_budget("embed", 0.4).await.is_ok());
    }

    #[test]
    fn skip_heuristic_flags_short_text() {
        assert!(should_skip_for_content("hi", 10));
        assert!(!should_skip_for_content("a reasonably long sentence to enrich", 10));
    }

    #[test]
    fn skip_heuristic_flags_mostly_non_alphabetic_text() {
        assert!(should_skip_for_content("12345 67890 !!!! #### @@@@", 5));
    }

    #[test]
    fn skip_heuristic_flags_fenced_code_blocks() {
        let code = "```rust\nfn main() {\n    println!(\"hello\");\n}\n```";
        assert!(should_skip_for_content(code, 5));
    }

    #[test]
    fn skip_heuristic_flags_known_source_file_mentions() {
        assert!(should_skip_for_content("see the fix in src/lib.rs for details", 5));
        assert!(!should_skip_for_content("a reasonably long sentence with no code in it", 5));
    }

    #[test]
    fn router_falls_back_to_default() {
        let router = ModelRouter::new("gpt-4o-mini");
        assert_eq!(router.route("embed", Priority::Low), "gpt-4o-mini");
    }

    #[test]
    fn router_uses_configured_override() {
        let mut router = ModelRouter::new("gpt-4o-mini");
        router.set_route("extract", Priority::High, "gpt-4o");
        assert_eq!(router.route("extract", Priority::High), "gpt-4o");
        assert_eq!(router.route("extract", Priority::Low), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn retry_policy_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::from_millis(1),
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(|| {
                let count = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("transient")
                    } else {
                        Ok(count)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn retry_policy_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::from_millis(1),
        };
        let result: Result<u32, &str> = policy.run(|| async { Err("always fails") }).await;
        assert_eq!(result, Err("always fails"));
    }
}
