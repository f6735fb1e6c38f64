use crate::domain::model::ProbeOutcome;
use crate::domain::ports::Oracle;
use crate::utils::error::Result;
use futures::stream::{self, StreamExt};
use std::time::Duration;

const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Digits, lowercase, uppercase, punctuation and space.
pub fn printable_charset() -> Vec<char> {
    ('0'..='9')
        .chain('a'..='z')
        .chain('A'..='Z')
        .chain(PUNCTUATION.chars())
        .chain(std::iter::once(' '))
        .collect()
}

/// Escapes the `LIKE` wildcards (and the escape character itself).
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Doubles single quotes so the value stays inside a SQL string literal.
pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }
}

/// Recovers secrets one character at a time through an [`Oracle`].
pub struct BlindExtractor<O: Oracle> {
    oracle: O,
    charset: Vec<char>,
    retry: RetryPolicy,
    concurrency: usize,
    max_length: usize,
}

impl<O: Oracle> BlindExtractor<O> {
    pub fn new(oracle: O) -> Self {
        let charset = printable_charset();
        Self {
            oracle,
            concurrency: charset.len(),
            charset,
            retry: RetryPolicy::default(),
            max_length: 256,
        }
    }

    pub fn with_charset(mut self, charset: impl IntoIterator<Item = char>) -> Self {
        let mut seen = Vec::new();
        for c in charset {
            if !seen.contains(&c) {
                seen.push(c);
            }
        }
        self.charset = seen;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn charset(&self) -> &[char] {
        &self.charset
    }

    /// Walks every prefix the oracle confirms, starting from `known`.
    ///
    /// A prefix that no candidate extends is a finished value. Several values
    /// sharing a prefix are all returned, in charset order.
    pub async fn extract(&self, known: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut stack = vec![known.to_string()];

        while let Some(prefix) = stack.pop() {
            if !prefix.is_empty() && prefix.chars().count() >= self.max_length {
                tracing::warn!("Reached max length {} at {:?}", self.max_length, prefix);
                found.push(prefix);
                continue;
            }

            let hits = self.probe_all(&prefix).await?;
            if hits.is_empty() {
                if !prefix.is_empty() {
                    tracing::info!("✅ Extracted: {}", prefix);
                    found.push(prefix);
                }
                continue;
            }

            for hit in hits.iter().rev() {
                stack.push(hit.candidate.clone());
            }
        }

        Ok(found)
    }

    /// Probes `prefix + c` for every charset character and returns the hits.
    pub async fn probe_all(&self, prefix: &str) -> Result<Vec<ProbeOutcome>> {
        let candidates: Vec<String> = self
            .charset
            .iter()
            .map(|c| format!("{}{}", prefix, c))
            .collect();

        let outcomes: Vec<Result<ProbeOutcome>> = stream::iter(candidates)
            .map(|candidate| async move {
                let hit = self.probe_with_retry(&candidate).await;
                hit.map(|hit| ProbeOutcome { candidate, hit })
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut hits = Vec::new();
        for outcome in outcomes {
            let outcome = outcome?;
            if outcome.hit {
                tracing::info!("{}", outcome.candidate);
                hits.push(outcome);
            }
        }
        Ok(hits)
    }

    async fn probe_with_retry(&self, candidate: &str) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.oracle.probe(candidate).await {
                Ok(hit) => return Ok(hit),
                Err(e) => {
                    if self.retry.max_attempts.is_some_and(|max| attempt >= max) {
                        tracing::error!(
                            "Probe {:?} failed after {} attempts: {}",
                            candidate,
                            attempt,
                            e
                        );
                        return Err(e);
                    }
                    tracing::debug!("Probe {:?} failed (attempt {}): {}", candidate, attempt, e);
                    if !self.retry.delay.is_zero() {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }
    }
}
