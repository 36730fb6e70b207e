//! Error policies for inbound processing.
//!
//! When processing an inbound batch fails, the consumer asks its
//! [`ErrorPolicy`] what to do, given how many times processing has failed
//! so far. Without a policy, any failure is fatal and stops the consumer.

use std::time::Duration;

use crate::messages::Endpoint;

/// Invalid error policy configuration.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Error policy chain is empty")]
    EmptyChain,

    #[error("{0} must be the last policy in a chain")]
    NotLast(&'static str),

    #[error("max_failed_attempts must be at least 1")]
    ZeroAttempts,
}

/// Decision for a failed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Process the same batch again after `delay`.
    Retry { delay: Duration },
    /// Acknowledge and drop.
    Skip,
    /// Forward the raw messages to another endpoint, then acknowledge.
    Move(Endpoint),
    /// Stop the consumer.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_failed_attempts: u32,
    pub initial_delay: Duration,
    pub delay_increment: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePolicy {
    pub endpoint: Endpoint,
    /// Processing is retried until this many attempts have failed.
    pub max_failed_attempts: u32,
}

/// What to do when processing fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPolicy {
    Skip,
    Retry(RetryPolicy),
    Move(MovePolicy),
    /// First applicable policy wins.
    Chain(Vec<ErrorPolicy>),
}

impl ErrorPolicy {
    pub fn skip() -> Self {
        Self::Skip
    }

    /// Retries immediately while fewer than `max_failed_attempts` attempts failed.
    pub fn retry(max_failed_attempts: u32) -> Self {
        Self::retry_with_delay(max_failed_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Retry `k` waits `initial_delay + delay_increment * (k - 1)`.
    pub fn retry_with_delay(
        max_failed_attempts: u32,
        initial_delay: Duration,
        delay_increment: Duration,
    ) -> Self {
        Self::Retry(RetryPolicy {
            max_failed_attempts,
            initial_delay,
            delay_increment,
        })
    }

    pub fn move_to(endpoint: Endpoint, max_failed_attempts: u32) -> Self {
        Self::Move(MovePolicy {
            endpoint,
            max_failed_attempts,
        })
    }

    /// Builds a validated chain. Nested chains are flattened.
    pub fn chain(policies: Vec<ErrorPolicy>) -> Result<Self, PolicyError> {
        let chain = Self::Chain(flatten(policies));
        chain.validate()?;
        Ok(chain)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        match self {
            Self::Skip => Ok(()),
            Self::Retry(retry) if retry.max_failed_attempts == 0 => Err(PolicyError::ZeroAttempts),
            Self::Move(mv) if mv.max_failed_attempts == 0 => Err(PolicyError::ZeroAttempts),
            Self::Retry(_) | Self::Move(_) => Ok(()),
            Self::Chain(policies) => {
                let policies = flatten(policies.clone());
                if policies.is_empty() {
                    return Err(PolicyError::EmptyChain);
                }
                for (position, policy) in policies.iter().enumerate() {
                    policy.validate()?;
                    let last = position + 1 == policies.len();
                    match policy {
                        Self::Skip if !last => return Err(PolicyError::NotLast("Skip")),
                        Self::Move(_) if !last => return Err(PolicyError::NotLast("Move")),
                        _ => {}
                    }
                }
                Ok(())
            }
        }
    }

    /// Whether this policy takes charge after `failed_attempts` failures.
    pub fn can_handle(&self, failed_attempts: u32) -> bool {
        match self {
            Self::Skip | Self::Move(_) => true,
            Self::Retry(retry) => failed_attempts < retry.max_failed_attempts,
            Self::Chain(policies) => policies.iter().any(|p| p.can_handle(failed_attempts)),
        }
    }

    /// Decides what to do after processing failed `failed_attempts` times (1-based).
    pub fn decide(&self, failed_attempts: u32) -> ErrorAction {
        match self {
            Self::Skip => ErrorAction::Skip,
            Self::Retry(retry) if failed_attempts < retry.max_failed_attempts => {
                ErrorAction::Retry {
                    delay: retry.delay(failed_attempts),
                }
            }
            Self::Retry(_) => ErrorAction::Fatal,
            Self::Move(mv) if failed_attempts < mv.max_failed_attempts => ErrorAction::Retry {
                delay: Duration::ZERO,
            },
            Self::Move(mv) => ErrorAction::Move(mv.endpoint.clone()),
            Self::Chain(policies) => policies
                .iter()
                .find(|p| p.can_handle(failed_attempts))
                .map_or(ErrorAction::Fatal, |p| p.decide(failed_attempts)),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_delay + self.delay_increment * attempt.saturating_sub(1)
    }
}

fn flatten(policies: Vec<ErrorPolicy>) -> Vec<ErrorPolicy> {
    policies
        .into_iter()
        .flat_map(|policy| match policy {
            ErrorPolicy::Chain(inner) => flatten(inner),
            other => vec![other],
        })
        .collect()
}

/// Decides with an optional policy. No policy means every failure is fatal.
pub fn decide(policy: Option<&ErrorPolicy>, failed_attempts: u32) -> ErrorAction {
    policy.map_or(ErrorAction::Fatal, |p| p.decide(failed_attempts))
}
