// =============================================================================
// Error taxonomy for the exchange boundary and the order pipeline
// =============================================================================
//
// Every adapter call returns `Result<T, ExchangeError>`. Vendor payloads are
// normalized into this taxonomy at the adapter; nothing above it inspects raw
// HTTP responses. The order pipeline itself does not use errors for refusals:
// a guard or sizing stage that declines an order returns `Refusal`, which is
// expected control flow and logged at most once per occurrence.
// =============================================================================

use thiserror::Error;

/// Normalized exchange failure classes.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// A 4xx-class response carrying a vendor error code (e.g. -1106, -4046).
    #[error("exchange client error {code} (http {status}): {message}")]
    Client {
        code: i64,
        status: u16,
        message: String,
    },

    /// A 5xx-class response with no actionable code.
    #[error("exchange server error: {0}")]
    Server(String),

    /// Connectivity failure: DNS, connect, timeout, broken transfer.
    #[error("network error: {0}")]
    Network(String),

    /// Rate-limit ban (HTTP 418/429 or code -1003). `until_epoch` is the
    /// parsed unban time in UNIX seconds, already buffered.
    #[error("rate limited until epoch {until_epoch:.0}: {message}")]
    Ban { until_epoch: f64, message: String },
}

impl ExchangeError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_ban(&self) -> bool {
        matches!(self, Self::Ban { .. })
    }

    /// Vendor error code when present.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Client { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the message (or code) indicates request-frequency pressure
    /// that warrants an inline retry of an order submission.
    pub fn is_rate_pressure(&self) -> bool {
        if self.is_ban() {
            return true;
        }
        let text = self.to_string().to_ascii_lowercase();
        const TOKENS: &[&str] = &[
            "too frequent",
            "-1003",
            "frequency",
            "rate limit",
            "request too many",
            "too many requests",
        ];
        TOKENS.iter().any(|t| text.contains(t))
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// =============================================================================
// Pipeline refusals
// =============================================================================

/// Why the order pipeline declined to submit. These are expected outcomes,
/// not faults; each carries enough context for a single log line.
#[derive(Debug, Clone, PartialEq)]
pub enum Refusal {
    /// A second order with the same signature in the same bar.
    BarGuard,
    /// The per-engine copy of the bar guard tripped.
    BarGuardLocal,
    /// An identical attempt is still pending for this (symbol, side).
    PendingAttempt,
    /// A recent successful order with this signature is inside the guard
    /// window. Carries the remaining seconds.
    SignatureGuard { remaining: f64 },
    /// A ledger entry with this signature was created moments ago and the
    /// exchange still reports the side live.
    DuplicatePendingFill,
    /// The indicator flipped sides too recently.
    FlipCooldown { remaining: f64 },
    /// The same-direction signal has not repeated enough bars yet.
    AwaitingConfirmation { seen: u32, required: u32 },
    /// Opposite exposure could not be flattened before opening.
    ConflictResidual,
    /// Sizing could not produce a legal quantity.
    Sizing(String),
    /// Margin type or leverage could not be aligned before the order.
    MarginMode(String),
    /// The opposite side is live and one-way add-only blocks the open.
    AddOnlyBlocked,
    /// The risk coordinator denied the open.
    RiskDenied,
    /// The engine is stopping; orders originated before the stop are dropped.
    Stopping,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BarGuard => write!(f, "bar guard: order already placed this bar"),
            Self::BarGuardLocal => write!(f, "bar guard (engine): order already placed this bar"),
            Self::PendingAttempt => write!(f, "pending attempt still open"),
            Self::SignatureGuard { remaining } => {
                write!(f, "signature guard: wait {remaining:.1}s")
            }
            Self::DuplicatePendingFill => write!(f, "duplicate pending fill"),
            Self::FlipCooldown { remaining } => write!(f, "flip cooldown: wait {remaining:.1}s"),
            Self::AwaitingConfirmation { seen, required } => {
                write!(f, "confirmation {seen}/{required} bars")
            }
            Self::ConflictResidual => write!(f, "opposite exposure still live"),
            Self::Sizing(msg) => write!(f, "sizing blocked: {msg}"),
            Self::MarginMode(msg) => write!(f, "margin mode: {msg}"),
            Self::AddOnlyBlocked => write!(f, "opposite open blocked (one-way add-only)"),
            Self::RiskDenied => write!(f, "risk coordinator denied open"),
            Self::Stopping => write!(f, "engine stopping"),
        }
    }
}
