use crate::error::WalletError;
use crate::models::schema::pending_invoices;
use crate::models::sub_account::SubAccount;
use crate::models::{now, with_serialization_retry};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::rand::RngCore;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle of an issued invoice. `pending` is the only non-terminal state.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceState {
    Pending,
    Settled,
    Failed,
    Expired,
}

impl InvoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Pending => "pending",
            InvoiceState::Settled => "settled",
            InvoiceState::Failed => "failed",
            InvoiceState::Expired => "expired",
        }
    }

    fn from_column(s: &str) -> InvoiceState {
        match s {
            "pending" => InvoiceState::Pending,
            "settled" => InvoiceState::Settled,
            "failed" => InvoiceState::Failed,
            "expired" => InvoiceState::Expired,
            other => panic!("invalid invoice state in ledger: {other}"),
        }
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An invoice issued on a sub-wallet's behalf, awaiting upstream settlement.
#[derive(
    Queryable,
    Insertable,
    Identifiable,
    AsChangeset,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PendingInvoice {
    pub id: String,
    pub sub_account_id: String,
    pub invoice: Option<String>,
    pub payment_hash: Option<String>,
    pub description_hash: Option<String>,
    amount_msats: i64,
    state: String,
    pub expires_at: Option<i64>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
    pub settled_at: Option<chrono::NaiveDateTime>,
    raw: Option<String>,
}

/// Parameters for registering a freshly issued invoice.
#[derive(Debug, Clone, Default)]
pub struct RegisterPendingInvoice {
    pub sub_account_id: String,
    pub invoice: Option<String>,
    pub payment_hash: Option<String>,
    pub description_hash: Option<String>,
    pub amount_msats: u64,
    pub expires_at: Option<i64>,
    /// Upstream's original response, retained for audit.
    pub raw: Option<serde_json::Value>,
}

/// Identifier triple used to correlate upstream results with the ledger.
/// Match preference: payment_hash, then invoice, then description_hash.
#[derive(Debug, Clone, Default)]
pub struct InvoiceQuery {
    pub payment_hash: Option<String>,
    pub invoice: Option<String>,
    pub description_hash: Option<String>,
}

impl InvoiceQuery {
    pub fn is_empty(&self) -> bool {
        self.payment_hash.is_none() && self.invoice.is_none() && self.description_hash.is_none()
    }
}

impl PendingInvoice {
    pub fn amount_msats(&self) -> u64 {
        self.amount_msats as u64
    }

    pub fn state(&self) -> InvoiceState {
        InvoiceState::from_column(&self.state)
    }

    pub fn raw(&self) -> Option<serde_json::Value> {
        self.raw.as_deref().and_then(|r| serde_json::from_str(r).ok())
    }

    /// Insert in state `pending` and refresh the owner's aggregate in the
    /// same transaction.
    pub fn register(
        conn: &mut SqliteConnection,
        params: RegisterPendingInvoice,
    ) -> Result<PendingInvoice, WalletError> {
        if params.amount_msats == 0 {
            return Err(WalletError::InvalidInput(
                "pending invoice amount must be positive".to_string(),
            ));
        }
        if params.invoice.is_none()
            && params.payment_hash.is_none()
            && params.description_hash.is_none()
        {
            return Err(WalletError::InvalidInput(
                "pending invoice needs a payment_hash, invoice, or description_hash".to_string(),
            ));
        }

        // id preference: payment_hash, else hash of the invoice string, else random
        let id = match (&params.payment_hash, &params.invoice) {
            (Some(payment_hash), _) => payment_hash.clone(),
            (None, Some(invoice)) => {
                sha256::Hash::hash(invoice.as_bytes()).to_string()
            }
            (None, None) => {
                let mut id_bytes = [0u8; 16];
                OsRng.fill_bytes(&mut id_bytes);
                hex::encode(id_bytes)
            }
        };

        let ts = now();
        let record = PendingInvoice {
            id,
            sub_account_id: params.sub_account_id,
            invoice: params.invoice,
            payment_hash: params.payment_hash,
            description_hash: params.description_hash,
            amount_msats: params.amount_msats as i64,
            state: InvoiceState::Pending.as_str().to_string(),
            expires_at: params.expires_at,
            created_at: ts,
            updated_at: ts,
            settled_at: None,
            raw: params
                .raw
                .as_ref()
                .map(|r| r.to_string()),
        };

        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                match diesel::insert_into(pending_invoices::table)
                    .values(&record)
                    .execute(conn)
                {
                    Ok(_) => {}
                    Err(diesel::result::Error::DatabaseError(
                        diesel::result::DatabaseErrorKind::UniqueViolation,
                        _,
                    )) => return Err(WalletError::DuplicateKey(record.id.clone())),
                    Err(e) => return Err(e.into()),
                }
                SubAccount::refresh_pending(conn, &record.sub_account_id)?;
                Ok(pending_invoices::table.find(&record.id).first(conn)?)
            })
        })
    }

    pub fn find_by_id(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<PendingInvoice>, WalletError> {
        Ok(pending_invoices::table.find(id).first(conn).optional()?)
    }

    pub fn find_for_sub_account(
        conn: &mut SqliteConnection,
        sub_account_id: &str,
    ) -> Result<Vec<PendingInvoice>, WalletError> {
        Ok(pending_invoices::table
            .filter(pending_invoices::sub_account_id.eq(sub_account_id))
            .order(pending_invoices::created_at.asc())
            .load(conn)?)
    }

    /// Look up an invoice by any of the three identifiers, preferring
    /// payment_hash over invoice over description_hash; ties broken by most
    /// recent update.
    pub fn find_matching(
        conn: &mut SqliteConnection,
        query: &InvoiceQuery,
    ) -> Result<Option<PendingInvoice>, WalletError> {
        if let Some(payment_hash) = query.payment_hash.as_deref() {
            let found: Option<PendingInvoice> = pending_invoices::table
                .filter(pending_invoices::payment_hash.eq(payment_hash))
                .order(pending_invoices::updated_at.desc())
                .first(conn)
                .optional()?;
            if found.is_some() {
                return Ok(found);
            }
        }
        if let Some(invoice) = query.invoice.as_deref() {
            let found: Option<PendingInvoice> = pending_invoices::table
                .filter(pending_invoices::invoice.eq(invoice))
                .order(pending_invoices::updated_at.desc())
                .first(conn)
                .optional()?;
            if found.is_some() {
                return Ok(found);
            }
        }
        if let Some(description_hash) = query.description_hash.as_deref() {
            let found: Option<PendingInvoice> = pending_invoices::table
                .filter(pending_invoices::description_hash.eq(description_hash))
                .order(pending_invoices::updated_at.desc())
                .first(conn)
                .optional()?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Transition out of `pending` into `failed` or `expired`, releasing the
    /// owner's pending share in the same transaction. `pending -> settled`
    /// goes through [`PendingInvoice::settle`] so the credit commits with it.
    pub fn update_state(
        conn: &mut SqliteConnection,
        id: &str,
        new_state: InvoiceState,
        settled_at: Option<chrono::NaiveDateTime>,
    ) -> Result<PendingInvoice, WalletError> {
        if new_state == InvoiceState::Settled {
            let (invoice, _) = Self::settle(conn, id, None, settled_at)?;
            return Ok(invoice);
        }

        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                let current: PendingInvoice = pending_invoices::table
                    .find(id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| WalletError::NotFound(format!("pending invoice {id}")))?;

                if current.state() != InvoiceState::Pending || new_state == InvoiceState::Pending {
                    return Err(WalletError::InvalidTransition {
                        from: current.state(),
                        to: new_state,
                    });
                }

                diesel::update(pending_invoices::table.find(id))
                    .set((
                        pending_invoices::state.eq(new_state.as_str()),
                        pending_invoices::settled_at.eq(settled_at),
                        pending_invoices::updated_at.eq(now()),
                    ))
                    .execute(conn)?;

                SubAccount::refresh_pending(conn, &current.sub_account_id)?;
                Ok(pending_invoices::table.find(id).first(conn)?)
            })
        })
    }

    /// `pending -> settled` with the balance credit, atomically.
    ///
    /// The credited amount is the upstream-reported one when present,
    /// falling back to the registered amount.
    pub fn settle(
        conn: &mut SqliteConnection,
        id: &str,
        credited_msats: Option<u64>,
        settled_at: Option<chrono::NaiveDateTime>,
    ) -> Result<(PendingInvoice, SubAccount), WalletError> {
        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                let current: PendingInvoice = pending_invoices::table
                    .find(id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| WalletError::NotFound(format!("pending invoice {id}")))?;

                if current.state() != InvoiceState::Pending {
                    return Err(WalletError::InvalidTransition {
                        from: current.state(),
                        to: InvoiceState::Settled,
                    });
                }

                let credited = credited_msats
                    .map(|a| a as i64)
                    .unwrap_or(current.amount_msats);

                diesel::update(pending_invoices::table.find(id))
                    .set((
                        pending_invoices::state.eq(InvoiceState::Settled.as_str()),
                        pending_invoices::settled_at.eq(Some(settled_at.unwrap_or_else(now))),
                        pending_invoices::updated_at.eq(now()),
                    ))
                    .execute(conn)?;

                SubAccount::credit_settlement(conn, &current.sub_account_id, credited)?;
                SubAccount::refresh_pending(conn, &current.sub_account_id)?;

                let invoice = pending_invoices::table.find(id).first(conn)?;
                let account = crate::models::schema::sub_accounts::table
                    .find(&current.sub_account_id)
                    .first(conn)?;
                Ok((invoice, account))
            })
        })
    }

    /// Bulk-transition every `pending` row past its expiry to `expired` and
    /// refresh the touched aggregates. Idempotent.
    pub fn prune_expired(
        conn: &mut SqliteConnection,
        now_unix: i64,
    ) -> Result<Vec<PendingInvoice>, WalletError> {
        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                let expired: Vec<PendingInvoice> = pending_invoices::table
                    .filter(pending_invoices::state.eq(InvoiceState::Pending.as_str()))
                    .filter(pending_invoices::expires_at.le(now_unix))
                    .load(conn)?;

                if expired.is_empty() {
                    return Ok(Vec::new());
                }

                let ids: Vec<&str> = expired.iter().map(|i| i.id.as_str()).collect();
                diesel::update(
                    pending_invoices::table.filter(pending_invoices::id.eq_any(&ids)),
                )
                .set((
                    pending_invoices::state.eq(InvoiceState::Expired.as_str()),
                    pending_invoices::updated_at.eq(now()),
                ))
                .execute(conn)?;

                let owners: BTreeSet<&str> =
                    expired.iter().map(|i| i.sub_account_id.as_str()).collect();
                for owner in owners {
                    SubAccount::refresh_pending(conn, owner)?;
                }

                Ok(pending_invoices::table
                    .filter(pending_invoices::id.eq_any(&ids))
                    .load(conn)?)
            })
        })
    }
}
