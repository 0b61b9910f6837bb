//! Exhaustible per-completion resources.
//!
//! Counters only move through test-and-decrement (`fetch_update`), so a
//! successful decrement always corresponds to work that was started and no
//! counter goes below zero. Tokens are the exception: usage is only known
//! after a response arrives, so the token counter may be driven negative by
//! the final subtraction and is checked at the start of the next step.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Which budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    Iterations,
    LlmCalls,
    Tokens,
    Time,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BudgetResource::Iterations => "iterations",
            BudgetResource::LlmCalls => "llm_calls",
            BudgetResource::Tokens => "tokens",
            BudgetResource::Time => "time",
        };
        f.write_str(name)
    }
}

/// Immutable view of the counters, published with `IterationStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub iterations_remaining: u64,
    pub llm_calls_remaining: u64,
    pub tokens_remaining: Option<i64>,
    pub total_tokens_used: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug)]
pub struct Budget {
    iterations_remaining: AtomicU64,
    llm_calls_remaining: AtomicU64,
    /// `i64::MAX` sentinel when unlimited; may go negative once.
    tokens_remaining: AtomicI64,
    tokens_limited: bool,
    total_tokens_used: AtomicU64,
    started_at: Instant,
    max_time: Option<Duration>,
}

impl Budget {
    pub fn new(config: &Config) -> Self {
        Self {
            // Completion-wide pool shared by the root and every sub-call;
            // the per-call cap is enforced separately in GenerateStep.
            iterations_remaining: AtomicU64::new(u64::from(config.max_iterations)),
            llm_calls_remaining: AtomicU64::new(config.max_llm_calls),
            tokens_remaining: AtomicI64::new(
                config
                    .max_total_tokens
                    .map_or(i64::MAX, |t| i64::try_from(t).unwrap_or(i64::MAX)),
            ),
            tokens_limited: config.max_total_tokens.is_some(),
            total_tokens_used: AtomicU64::new(0),
            started_at: Instant::now(),
            max_time: config.max_time(),
        }
    }

    /// Test-and-decrement one iteration. `false` means the pool is empty.
    pub fn try_consume_iteration(&self) -> bool {
        self.iterations_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Test-and-decrement one model invocation.
    pub fn try_consume_llm_call(&self) -> bool {
        self.llm_calls_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Record observed token usage after a response. May drive the counter
    /// negative; exhaustion is reported by `tokens_exhausted` on the next
    /// step.
    pub fn record_tokens(&self, used: u64) {
        self.total_tokens_used.fetch_add(used, Ordering::SeqCst);
        if self.tokens_limited {
            let used = i64::try_from(used).unwrap_or(i64::MAX);
            self.tokens_remaining.fetch_sub(used, Ordering::SeqCst);
        }
    }

    pub fn tokens_exhausted(&self) -> bool {
        self.tokens_limited && self.tokens_remaining.load(Ordering::SeqCst) <= 0
    }

    pub fn time_exhausted(&self) -> bool {
        self.max_time
            .is_some_and(|max| self.started_at.elapsed() >= max)
    }

    pub fn iterations_remaining(&self) -> u64 {
        self.iterations_remaining.load(Ordering::SeqCst)
    }

    pub fn llm_calls_remaining(&self) -> u64 {
        self.llm_calls_remaining.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            iterations_remaining: self.iterations_remaining.load(Ordering::SeqCst),
            llm_calls_remaining: self.llm_calls_remaining.load(Ordering::SeqCst),
            tokens_remaining: self
                .tokens_limited
                .then(|| self.tokens_remaining.load(Ordering::SeqCst)),
            total_tokens_used: self.total_tokens_used.load(Ordering::SeqCst),
            elapsed_ms: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}
