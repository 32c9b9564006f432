//! In-memory account ledger, as held by a dispersing client.

use super::{
    charge_reservations, check_revert, on_demand_charge, AccountLedger, DebitOutcome,
};
use crate::error::{Error, Result};
use crate::payment::logic::validate_reservations;
use crate::payment::{
    AccountState, DebitSlip, OnDemandPayment, PaymentVaultParams, QuorumId, QuorumPeriodRecords,
    ReservedPayment,
};
use crate::wire::AccountStateBundle;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// State change a debit would publish.
enum Pending {
    Records(QuorumPeriodRecords),
    Cumulative(U256),
}

/// Ledger of one account held entirely in process memory.
///
/// All state sits behind one lock, so a debit sees and publishes
/// reservations, bins and the cumulative payment as a single unit.
#[derive(Debug)]
pub struct LocalAccountLedger {
    account: Address,
    state: RwLock<AccountState>,
}

impl LocalAccountLedger {
    /// Ledger with no recorded usage.
    #[must_use]
    pub fn new(
        account: Address,
        reservations: BTreeMap<QuorumId, ReservedPayment>,
        on_demand: OnDemandPayment,
        num_bins: usize,
    ) -> Self {
        Self::from_account_state(account, AccountState::new(reservations, on_demand, num_bins))
    }

    /// Ledger seeded with an existing snapshot.
    #[must_use]
    pub fn from_account_state(account: Address, state: AccountState) -> Self {
        Self {
            account,
            state: RwLock::new(state),
        }
    }

    /// Ledger built from a decoded wire bundle.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a payment field is not a valid
    /// 256-bit integer.
    pub fn from_bundle(
        account: Address,
        bundle: &AccountStateBundle,
        num_bins: usize,
    ) -> Result<Self> {
        Ok(Self::from_account_state(account, bundle.to_account_state(num_bins)?))
    }

    /// Account this ledger charges.
    #[must_use]
    pub const fn account(&self) -> Address {
        self.account
    }

    /// Replace the whole state, e.g. after syncing with a server.
    pub fn set_account_state(&self, state: AccountState) {
        *self.state.write() = state;
    }

    /// Payment method a debit of `slip` would use right now, without
    /// recording anything.
    ///
    /// # Errors
    ///
    /// Same as [`AccountLedger::debit`].
    pub fn preview_debit(&self, slip: &DebitSlip, params: &PaymentVaultParams) -> Result<DebitOutcome> {
        self.check_account(slip)?;
        let state = self.state.read();
        decide(&state, self.account, slip, params).map(|(_, outcome)| outcome)
    }

    /// Charge `slip`; see [`AccountLedger::debit`].
    ///
    /// # Errors
    ///
    /// - [`Error::NoPaymentMethod`] when configuration is missing
    /// - [`Error::PaymentUnavailable`] when neither method has capacity
    pub fn debit_now(&self, slip: &DebitSlip, params: &PaymentVaultParams) -> Result<DebitOutcome> {
        self.check_account(slip)?;
        let mut state = self.state.write();
        let (pending, outcome) = decide(&state, self.account, slip, params)?;
        match pending {
            Pending::Records(records) => state.period_records = records,
            Pending::Cumulative(cumulative) => state.cumulative_payment = cumulative,
        }
        Ok(outcome)
    }

    /// Undo `outcome`; see [`AccountLedger::revert_debit`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRevert`] if the recorded usage or payment is
    /// smaller than what `outcome` claims. Nothing changes in that case.
    pub fn revert_now(&self, slip: &DebitSlip, outcome: &DebitOutcome) -> Result<()> {
        self.check_account(slip)?;
        check_revert(slip, outcome)?;
        let mut state = self.state.write();
        match outcome {
            DebitOutcome::Reservation { charges } => {
                let mut records = state.period_records.clone();
                for charge in charges {
                    records.subtract_usage(charge.quorum, charge.index, charge.symbols)?;
                    if let Some(overflow) = charge.overflow {
                        records.subtract_usage(charge.quorum, overflow.index, overflow.symbols)?;
                    }
                }
                state.period_records = records;
            }
            DebitOutcome::OnDemand { charged, .. } => {
                let reverted = state.cumulative_payment.checked_sub(*charged).ok_or_else(|| {
                    Error::InvalidRevert(format!(
                        "payment {charged} exceeds cumulative {}",
                        state.cumulative_payment
                    ))
                })?;
                state.cumulative_payment = reverted;
            }
        }
        Ok(())
    }

    fn check_account(&self, slip: &DebitSlip) -> Result<()> {
        if slip.account() != self.account {
            return Err(Error::InvalidRequest(format!(
                "slip for {} presented to ledger of {}",
                slip.account(),
                self.account
            )));
        }
        Ok(())
    }
}

fn decide(
    state: &AccountState,
    account: Address,
    slip: &DebitSlip,
    params: &PaymentVaultParams,
) -> Result<(Pending, DebitOutcome)> {
    let reservation = validate_reservations(
        &state.reservations,
        params,
        slip.quorum_numbers(),
        slip.timestamp_ns(),
        slip.received_at_ns(),
    )
    .and_then(|()| {
        let mut records = state.period_records.clone();
        let charges = charge_reservations(&mut records, &state.reservations, params, slip)?;
        Ok((records, charges))
    });

    let reservation_err = match reservation {
        Ok((records, charges)) => {
            return Ok((Pending::Records(records), DebitOutcome::Reservation { charges }));
        }
        Err(e) if e.is_config() => {
            return Err(Error::NoPaymentMethod {
                account,
                reservation: Box::new(e),
            });
        }
        Err(e) => e,
    };
    debug!("Reservation path rejected for {account}: {reservation_err}");

    match charge_on_demand(state, params, slip) {
        Ok((cumulative, outcome)) => Ok((Pending::Cumulative(cumulative), outcome)),
        Err(on_demand) => Err(Error::PaymentUnavailable {
            account,
            reservation: Box::new(reservation_err),
            on_demand: Box::new(on_demand),
        }),
    }
}

fn charge_on_demand(
    state: &AccountState,
    params: &PaymentVaultParams,
    slip: &DebitSlip,
) -> Result<(U256, DebitOutcome)> {
    let (symbols, charged) = on_demand_charge(params, slip)?;
    let available = state.on_demand.cumulative_payment;
    let cumulative = state
        .cumulative_payment
        .checked_add(charged)
        .filter(|c| *c <= available)
        .ok_or_else(|| Error::InsufficientBalance {
            required: state.cumulative_payment.saturating_add(charged),
            available,
        })?;
    Ok((
        cumulative,
        DebitOutcome::OnDemand {
            charged,
            cumulative,
            symbols,
        },
    ))
}

#[async_trait]
impl AccountLedger for LocalAccountLedger {
    async fn debit(&self, slip: &DebitSlip, params: &PaymentVaultParams) -> Result<DebitOutcome> {
        self.debit_now(slip, params)
    }

    async fn revert_debit(&self, slip: &DebitSlip, outcome: &DebitOutcome) -> Result<()> {
        self.revert_now(slip, outcome)
    }

    async fn account_state(&self) -> AccountState {
        self.state.read().clone()
    }
}
