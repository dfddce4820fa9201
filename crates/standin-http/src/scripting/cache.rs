//! Compiled-script cache.
//!
//! Compilation cost dominates execution cost for the embedded scripts, so
//! byte-identical sources share a single compiled AST. Entries are bounded
//! in number and additionally expire after a fixed TTL regardless of slot
//! pressure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rhai::{Engine, AST};
use tracing::{debug, trace, warn};

use crate::error::{Result, StandinError};
use crate::scripting::{create_engine, invoke, ScriptContext, ScriptOutput};

/// Bounded retry for the known transient failure when turning a cached
/// compiled artifact into a callable under concurrency. Narrowly scoped to
/// that race; this is not a blanket retry-everything policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Invoked unconditionally after every script execution. The default is a
/// no-op; environments that exhibit memory growth under long-running script
/// execution can install a reclaiming implementation.
pub trait MemoryPressureHook: Send + Sync {
    fn after_execution(&self);
}

/// Default hook: does nothing.
pub struct NoOpMemoryHook;

impl MemoryPressureHook for NoOpMemoryHook {
    fn after_execution(&self) {}
}

/// Configuration for the script cache.
#[derive(Clone, Debug)]
pub struct ScriptCacheConfig {
    /// Maximum number of cached compiled scripts.
    pub max_entries: usize,
    /// Fixed time-to-live, independent of slot pressure.
    pub ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for ScriptCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Cache statistics, exposed for tests and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
}

struct CacheEntry {
    ast: Arc<AST>,
    created_at: Instant,
}

/// Entries and statistics behind a single lock.
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
}

/// Probe run before each invocation of a cached artifact; an `Err` is the
/// transient instantiation race. Injectable so tests can exercise the retry
/// ceiling; production leaves it unset (instantiation succeeds immediately).
pub type InstantiationProbe = dyn Fn(u32) -> std::result::Result<(), String> + Send + Sync;

/// Compiles and memoizes embedded script sources, keyed by the fully
/// include-expanded source text. Constructed once per process (or once per
/// harness run); safe for concurrent lookups and insertions.
pub struct ScriptCache {
    config: ScriptCacheConfig,
    engine: Engine,
    state: RwLock<CacheState>,
    memory_hook: Box<dyn MemoryPressureHook>,
    instantiation_probe: Option<Box<InstantiationProbe>>,
}

impl ScriptCache {
    pub fn new(config: ScriptCacheConfig) -> Self {
        debug!(
            max_entries = config.max_entries,
            ttl_secs = config.ttl.as_secs(),
            "creating script cache"
        );
        Self {
            config,
            engine: create_engine(),
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            memory_hook: Box::new(NoOpMemoryHook),
            instantiation_probe: None,
        }
    }

    pub fn with_memory_hook(mut self, hook: Box<dyn MemoryPressureHook>) -> Self {
        self.memory_hook = hook;
        self
    }

    pub fn with_instantiation_probe(mut self, probe: Box<InstantiationProbe>) -> Self {
        self.instantiation_probe = Some(probe);
        self
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        let mut stats = state.stats.clone();
        stats.size = state.entries.len();
        stats
    }

    /// Execute a fully include-expanded script source against a request
    /// context. Compiles on miss, reuses the cached AST on hit, and runs the
    /// memory pressure hook after the invocation regardless of outcome.
    pub async fn execute(&self, source: &str, context: &ScriptContext) -> Result<ScriptOutput> {
        let ast = self.get_or_compile(source)?;
        self.instantiate(&ast).await?;
        let result = invoke(&self.engine, &ast, context);
        self.memory_hook.after_execution();
        result
    }

    fn get_or_compile(&self, source: &str) -> Result<Arc<AST>> {
        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            match state.entries.get(source) {
                Some(entry) if entry.created_at.elapsed() > self.config.ttl => {
                    state.entries.remove(source);
                    state.stats.expirations += 1;
                    state.stats.misses += 1;
                    trace!("script cache entry expired");
                }
                Some(entry) => {
                    state.stats.hits += 1;
                    return Ok(Arc::clone(&entry.ast));
                }
                None => {
                    state.stats.misses += 1;
                }
            }
        }

        // Compile outside the lock; concurrent compilers of the same source
        // produce identical ASTs and the last insert wins.
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| StandinError::ScriptCompilation(e.to_string()))?;
        let ast = Arc::new(ast);

        let mut state = self.state.write();
        if state.entries.len() >= self.config.max_entries {
            // Evict the oldest-inserted entry.
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&oldest);
                state.stats.evictions += 1;
            }
        }
        state.entries.insert(
            source.to_string(),
            CacheEntry {
                ast: Arc::clone(&ast),
                created_at: Instant::now(),
            },
        );
        state.stats.inserts += 1;
        Ok(ast)
    }

    /// Run the instantiation probe with bounded retry. Concurrent requests
    /// hitting the race retry independently; there is no queue.
    async fn instantiate(&self, _ast: &Arc<AST>) -> Result<()> {
        let Some(probe) = self.instantiation_probe.as_ref() else {
            return Ok(());
        };
        let policy = &self.config.retry;
        for attempt in 1..=policy.max_attempts {
            match probe(attempt) {
                Ok(()) => return Ok(()),
                Err(reason) if attempt < policy.max_attempts => {
                    warn!(attempt, reason, "script instantiation race, retrying");
                    tokio::time::sleep(policy.backoff).await;
                }
                Err(reason) => {
                    warn!(attempt, reason, "script instantiation race, giving up");
                    return Err(StandinError::CompilationRaceExhausted {
                        attempts: policy.max_attempts,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ParameterTable;
    use crate::request::StandinRequest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> ScriptContext {
        ScriptContext::new(
            &StandinRequest::new("GET", "/test"),
            ParameterTable::new(),
        )
    }

    fn cache() -> ScriptCache {
        ScriptCache::new(ScriptCacheConfig::default())
    }

    #[tokio::test]
    async fn test_hit_and_miss_accounting() {
        let cache = cache();
        let ctx = context();
        cache.execute(r#""a""#, &ctx).await.unwrap();
        cache.execute(r#""a""#, &ctx).await.unwrap();
        cache.execute(r#""b""#, &ctx).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.size, 2);
    }

    #[tokio::test]
    async fn test_bounded_eviction() {
        let cache = ScriptCache::new(ScriptCacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        let ctx = context();
        cache.execute(r#""a""#, &ctx).await.unwrap();
        cache.execute(r#""b""#, &ctx).await.unwrap();
        cache.execute(r#""c""#, &ctx).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = ScriptCache::new(ScriptCacheConfig {
            ttl: Duration::from_millis(0),
            ..Default::default()
        });
        let ctx = context();
        cache.execute(r#""a""#, &ctx).await.unwrap();
        cache.execute(r#""a""#, &ctx).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_compilation_error_surfaces() {
        let cache = cache();
        let err = cache.execute("let = ;", &context()).await.unwrap_err();
        assert!(matches!(err, StandinError::ScriptCompilation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let cache = cache().with_instantiation_probe(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err("transient load race".to_string())
        }));

        let err = cache.execute(r#""a""#, &context()).await.unwrap_err();
        assert!(matches!(
            err,
            StandinError::CompilationRaceExhausted { attempts: 5 }
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_before_ceiling() {
        let cache = cache().with_instantiation_probe(Box::new(|attempt| {
            if attempt < 3 {
                Err("transient load race".to_string())
            } else {
                Ok(())
            }
        }));
        let out = cache.execute(r#""ok""#, &context()).await.unwrap();
        assert_eq!(out.body, "ok");
    }

    #[tokio::test]
    async fn test_memory_hook_runs_after_every_invocation() {
        struct CountingHook(AtomicU32);
        impl MemoryPressureHook for CountingHook {
            fn after_execution(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hook = Arc::new(CountingHook(AtomicU32::new(0)));
        struct Shared(Arc<CountingHook>);
        impl MemoryPressureHook for Shared {
            fn after_execution(&self) {
                self.0.after_execution();
            }
        }

        let cache = cache().with_memory_hook(Box::new(Shared(Arc::clone(&hook))));
        let ctx = context();
        cache.execute(r#""a""#, &ctx).await.unwrap();
        // Runs on failed executions too.
        let _ = cache.execute("1 / 0", &ctx).await;
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }
}
