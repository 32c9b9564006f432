//! Error types for saorsa-ledger.
//!
//! Every error maps to an [`ErrorClass`] so callers can decide whether a
//! retry can ever help without matching on message text.

use crate::payment::QuorumId;
use alloy_primitives::{Address, U256};
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The request itself is malformed.
    Validation,
    /// A quorum is missing payment or protocol configuration.
    Config,
    /// The account or network is out of capacity for now.
    Capacity,
    /// The durable store or chain reader failed transiently.
    Store,
}

/// What a caller may expect from retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryHint {
    /// Retrying the same request can never succeed.
    Never,
    /// A later period or a top-up may let the request through.
    Later,
    /// The failure was transient; retrying immediately may succeed.
    Now,
}

impl ErrorClass {
    /// Retry expectation for this class.
    #[must_use]
    pub const fn retry_hint(self) -> RetryHint {
        match self {
            Self::Validation | Self::Config => RetryHint::Never,
            Self::Capacity => RetryHint::Later,
            Self::Store => RetryHint::Now,
        }
    }

    const fn severity(self) -> u8 {
        match self {
            Self::Capacity => 0,
            Self::Validation => 1,
            Self::Store => 2,
            Self::Config => 3,
        }
    }
}

/// Stable codes for batch metering failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchErrorCode {
    /// The batch held no certificates.
    BatchEmpty,
    /// A certificate had no blob header.
    BlobHeaderNil,
    /// Global payment parameters could not be read.
    PaymentParamsFailed,
    /// The account holds no reservation for a quorum.
    ReservationNotFound,
    /// Reservations could not be read from the chain.
    ReservationLookupFailed,
    /// The reservation is outside its active window.
    ReservationInactive,
    /// The request period is neither current nor previous.
    ReservationPeriodInvalid,
    /// The bin was already at its limit.
    BinAlreadyFull,
    /// Aggregated usage is larger than one bin.
    UsageExceedsLimit,
    /// The overflow bin already holds usage.
    OverflowPeriodLimit,
    /// The overflow period lies past the reservation end.
    OverflowWindowLimit,
}

impl BatchErrorCode {
    /// Upper-case code string, suitable for RPC status details.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BatchEmpty => "BATCH_EMPTY",
            Self::BlobHeaderNil => "BLOB_HEADER_NIL",
            Self::PaymentParamsFailed => "PAYMENT_PARAMS_FAILED",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::ReservationLookupFailed => "RESERVATION_LOOKUP_FAILED",
            Self::ReservationInactive => "RESERVATION_INACTIVE",
            Self::ReservationPeriodInvalid => "RESERVATION_PERIOD_INVALID",
            Self::BinAlreadyFull => "BIN_ALREADY_FULL",
            Self::UsageExceedsLimit => "USAGE_EXCEEDS_LIMIT",
            Self::OverflowPeriodLimit => "OVERFLOW_PERIOD_LIMIT",
            Self::OverflowWindowLimit => "OVERFLOW_WINDOW_LIMIT",
        }
    }

    const fn class(self) -> ErrorClass {
        match self {
            Self::BatchEmpty | Self::BlobHeaderNil => ErrorClass::Validation,
            Self::PaymentParamsFailed | Self::ReservationLookupFailed => ErrorClass::Store,
            _ => ErrorClass::Capacity,
        }
    }
}

impl std::fmt::Display for BatchErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in saorsa-ledger.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or unusable quorum configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// No usable reservation for the request.
    #[error("reservation unavailable: {0}")]
    ReservationUnavailable(String),

    /// A single request is larger than a whole bin.
    #[error("symbol usage {usage} exceeds bin limit {bin_limit} for quorum {quorum}")]
    UsageExceedsBinLimit {
        /// Quorum being charged.
        quorum: QuorumId,
        /// Symbols requested.
        usage: u64,
        /// Capacity of one bin.
        bin_limit: u64,
    },

    /// The current bin was already saturated.
    #[error("reservation limit exceeded for quorum {quorum}")]
    ReservationLimitExceeded {
        /// Quorum being charged.
        quorum: QuorumId,
    },

    /// The overflow bin already holds usage.
    #[error("overflow bin for period {index} already used for quorum {quorum}")]
    OverflowBinOccupied {
        /// Quorum being charged.
        quorum: QuorumId,
        /// Period number of the overflow bin.
        index: u32,
    },

    /// The overflow period falls after the reservation ends.
    #[error("overflow period is beyond reservation end for quorum {quorum}")]
    OverflowBeyondReservation {
        /// Quorum being charged.
        quorum: QuorumId,
    },

    /// The ring slot has already moved on to a newer period.
    #[error("period {index} for quorum {quorum} has been superseded")]
    PeriodSuperseded {
        /// Quorum being addressed.
        quorum: QuorumId,
        /// Period number requested.
        index: u32,
    },

    /// The on-demand deposit cannot cover the charge.
    #[error("insufficient on-demand balance: requires {required}, deposit {available}")]
    InsufficientBalance {
        /// Cumulative payment the debit would need.
        required: U256,
        /// On-chain deposit ceiling.
        available: U256,
    },

    /// A revert asked for more than was recorded.
    #[error("invalid revert: {0}")]
    InvalidRevert(String),

    /// The network-wide on-demand bin is full.
    #[error("global on-demand throughput exceeded: {usage} > {limit} in period {period}")]
    GlobalLimitExceeded {
        /// Period start of the global bin.
        period: u64,
        /// Usage the bin would reach.
        usage: u64,
        /// Bin capacity.
        limit: u64,
    },

    /// The token bucket has too few immediately available tokens.
    #[error("on-demand throughput exhausted: requested {requested} symbols, {available} available")]
    ThroughputExhausted {
        /// Symbols asked for.
        requested: u64,
        /// Tokens available at the time of asking.
        available: u64,
    },

    /// A config problem blocked the reservation path; on-demand was not tried.
    #[error("no payment method available for {account}: reservation failed and {reservation}")]
    NoPaymentMethod {
        /// Account being debited.
        account: Address,
        /// Reservation failure.
        reservation: Box<Error>,
    },

    /// Both the reservation and the on-demand path failed.
    #[error(
        "cannot create payment information for reservation or on-demand. Account: {account}, \
         Reservation Error: {reservation}, On-demand Error: {on_demand}"
    )]
    PaymentUnavailable {
        /// Account being debited.
        account: Address,
        /// Reservation failure.
        reservation: Box<Error>,
        /// On-demand failure.
        on_demand: Box<Error>,
    },

    /// Batch metering failure.
    #[error("batch metering failed [{code}]: {message}")]
    Batch {
        /// Stable failure code.
        code: BatchErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// A conditional write lost to a concurrent writer.
    #[error("conditional write failed: {0}")]
    ConditionFailed(String),

    /// A multi-key read asked for more keys than one call allows.
    #[error("request of {requested} keys exceeds limit of {max}")]
    ExceedsBatchLimit {
        /// Keys requested.
        requested: usize,
        /// Per-call ceiling.
        max: usize,
    },

    /// A store or chain call ran past its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Chain reader error.
    #[error("chain read error: {0}")]
    Chain(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest(_) | Self::InvalidRevert(_) | Self::Serialization(_) => {
                ErrorClass::Validation
            }
            Self::Config(_) | Self::ExceedsBatchLimit { .. } => ErrorClass::Config,
            Self::ReservationUnavailable(_)
            | Self::UsageExceedsBinLimit { .. }
            | Self::ReservationLimitExceeded { .. }
            | Self::OverflowBinOccupied { .. }
            | Self::OverflowBeyondReservation { .. }
            | Self::PeriodSuperseded { .. }
            | Self::InsufficientBalance { .. }
            | Self::GlobalLimitExceeded { .. }
            | Self::ThroughputExhausted { .. } => ErrorClass::Capacity,
            Self::NoPaymentMethod { reservation, .. } => reservation.class(),
            Self::PaymentUnavailable {
                reservation,
                on_demand,
                ..
            } => {
                let (a, b) = (reservation.class(), on_demand.class());
                if a.severity() >= b.severity() {
                    a
                } else {
                    b
                }
            }
            Self::Batch { code, .. } => code.class(),
            Self::ConditionFailed(_)
            | Self::Timeout(_)
            | Self::Storage(_)
            | Self::Chain(_)
            | Self::Io(_) => ErrorClass::Store,
        }
    }

    /// Retry expectation for this error.
    #[must_use]
    pub fn retry_hint(&self) -> RetryHint {
        self.class().retry_hint()
    }

    /// True for missing-configuration failures, which never fall back to on-demand.
    #[must_use]
    pub fn is_config(&self) -> bool {
        self.class() == ErrorClass::Config
    }

    /// True when a conditional store write lost a race.
    #[must_use]
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed(_))
    }

    pub(crate) fn batch(code: BatchErrorCode, message: impl Into<String>) -> Self {
        Self::Batch {
            code,
            message: message.into(),
        }
    }
}
