use crate::error::WalletError;
use crate::keys::WalletKeys;
use crate::models::schema::{pending_invoices, sub_accounts};
use crate::models::{now, with_serialization_retry};
use crate::vault::Vault;
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::rand::RngCore;
use bitcoin::secp256k1::Secp256k1;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable};
use serde::{Deserialize, Serialize};

/// Identity and accounting for one virtual sub-wallet.
///
/// The two secrets are stored as vault envelopes; plaintext leaves this
/// module exactly once, from [`SubAccount::create`].
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
pub struct SubAccount {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    relays: String,
    pub service_pubkey: String,
    #[serde(skip_serializing)]
    service_secret: Vec<u8>,
    pub client_pubkey: String,
    #[serde(skip_serializing)]
    client_secret: Vec<u8>,
    balance_msats: i64,
    pending_msats: i64,
    metadata: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
    pub last_used_at: Option<chrono::NaiveDateTime>,
    pub usage_count: i64,
}

/// Operator input for creating a sub-wallet.
#[derive(Debug, Clone, Default)]
pub struct CreateSubAccount {
    pub label: String,
    pub description: Option<String>,
    pub relays: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    /// 32-byte hex; generated when absent.
    pub service_secret_hex: Option<String>,
    /// 32-byte hex; generated when absent.
    pub client_secret_hex: Option<String>,
}

/// Plaintext key pairs, returned exactly once from create.
#[derive(Debug, Clone, Copy)]
pub struct SubAccountSecrets {
    pub service: WalletKeys,
    pub client: WalletKeys,
}

impl SubAccount {
    pub fn balance_msats(&self) -> u64 {
        self.balance_msats as u64
    }

    pub fn pending_msats(&self) -> u64 {
        self.pending_msats as u64
    }

    pub fn relays(&self) -> Vec<String> {
        serde_json::from_str(&self.relays).unwrap_or_default()
    }

    pub fn metadata(&self) -> Option<serde_json::Value> {
        self.metadata
            .as_deref()
            .and_then(|m| serde_json::from_str(m).ok())
    }

    pub fn service_keys(&self, vault: &Vault) -> Result<WalletKeys, WalletError> {
        let plain = vault.decrypt(&self.service_secret)?;
        let secp = Secp256k1::new();
        WalletKeys::from_secret_hex(&secp, &hex::encode(plain))
    }

    pub fn client_keys(&self, vault: &Vault) -> Result<WalletKeys, WalletError> {
        let plain = vault.decrypt(&self.client_secret)?;
        let secp = Secp256k1::new();
        WalletKeys::from_secret_hex(&secp, &hex::encode(plain))
    }

    /// Create a sub-wallet, generating any key pair the operator did not
    /// supply. Returns the record plus the plaintext secrets, once.
    pub fn create(
        conn: &mut SqliteConnection,
        vault: &Vault,
        input: CreateSubAccount,
    ) -> Result<(SubAccount, SubAccountSecrets), WalletError> {
        let secp = Secp256k1::new();
        let service = match input.service_secret_hex.as_deref() {
            Some(hex_secret) => WalletKeys::from_secret_hex(&secp, hex_secret)?,
            None => WalletKeys::generate(&secp),
        };
        let client = match input.client_secret_hex.as_deref() {
            Some(hex_secret) => WalletKeys::from_secret_hex(&secp, hex_secret)?,
            None => WalletKeys::generate(&secp),
        };

        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);

        let ts = now();
        let record = SubAccount {
            id: hex::encode(id_bytes),
            label: input.label,
            description: input.description,
            relays: serde_json::to_string(&input.relays)
                .map_err(|e| WalletError::InvalidInput(format!("relays: {e}")))?,
            service_pubkey: service.public_hex(),
            service_secret: vault.encrypt(&service.secret.secret_bytes()),
            client_pubkey: client.public_hex(),
            client_secret: vault.encrypt(&client.secret.secret_bytes()),
            balance_msats: 0,
            pending_msats: 0,
            metadata: input
                .metadata
                .map(|m| serde_json::to_string(&m))
                .transpose()
                .map_err(|e| WalletError::InvalidInput(format!("metadata: {e}")))?,
            created_at: ts,
            updated_at: ts,
            last_used_at: None,
            usage_count: 0,
        };

        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                match diesel::insert_into(sub_accounts::table)
                    .values(&record)
                    .execute(conn)
                {
                    Ok(_) => {}
                    Err(diesel::result::Error::DatabaseError(
                        diesel::result::DatabaseErrorKind::UniqueViolation,
                        info,
                    )) => {
                        // sqlite names the column: "UNIQUE constraint failed:
                        // sub_accounts.client_pubkey"
                        let colliding = if info.message().contains("client_pubkey") {
                            record.client_pubkey.clone()
                        } else {
                            record.service_pubkey.clone()
                        };
                        return Err(WalletError::DuplicateKey(colliding));
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            })
        })?;

        Ok((record, SubAccountSecrets { service, client }))
    }

    pub fn find_by_id(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<SubAccount>, WalletError> {
        Ok(sub_accounts::table.find(id).first(conn).optional()?)
    }

    pub fn find_by_service_pubkey(
        conn: &mut SqliteConnection,
        service_pubkey: &str,
    ) -> Result<Option<SubAccount>, WalletError> {
        Ok(sub_accounts::table
            .filter(sub_accounts::service_pubkey.eq(service_pubkey))
            .first(conn)
            .optional()?)
    }

    pub fn find_all(conn: &mut SqliteConnection) -> Result<Vec<SubAccount>, WalletError> {
        Ok(sub_accounts::table
            .order(sub_accounts::created_at.asc())
            .load(conn)?)
    }

    /// Atomically apply a signed balance delta. A delta that would take the
    /// balance negative fails inside the transaction and changes nothing.
    pub fn adjust_balance(
        conn: &mut SqliteConnection,
        id: &str,
        delta_msats: i64,
    ) -> Result<SubAccount, WalletError> {
        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                let account: SubAccount = sub_accounts::table
                    .find(id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| WalletError::UnknownSubAccount(id.to_string()))?;

                let new_balance = account.balance_msats + delta_msats;
                if new_balance < 0 {
                    return Err(WalletError::InsufficientBalance {
                        available: account.balance_msats as u64,
                        required: delta_msats.unsigned_abs(),
                    });
                }

                diesel::update(sub_accounts::table.find(id))
                    .set((
                        sub_accounts::balance_msats.eq(new_balance),
                        sub_accounts::updated_at.eq(now()),
                    ))
                    .execute(conn)?;

                Ok(sub_accounts::table.find(id).first(conn)?)
            })
        })
    }

    /// Update usage metadata after a handled request.
    pub fn touch(
        conn: &mut SqliteConnection,
        id: &str,
        increment_usage: bool,
        update_last_used: bool,
    ) -> Result<(), WalletError> {
        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                let account: SubAccount = sub_accounts::table
                    .find(id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| WalletError::UnknownSubAccount(id.to_string()))?;

                let usage = if increment_usage {
                    account.usage_count + 1
                } else {
                    account.usage_count
                };
                let last_used = if update_last_used {
                    Some(now())
                } else {
                    account.last_used_at
                };

                diesel::update(sub_accounts::table.find(id))
                    .set((
                        sub_accounts::usage_count.eq(usage),
                        sub_accounts::last_used_at.eq(last_used),
                    ))
                    .execute(conn)?;
                Ok(())
            })
        })
    }

    /// Privileged operator removal; owned pending invoices cascade.
    pub fn remove(conn: &mut SqliteConnection, id: &str) -> Result<(), WalletError> {
        with_serialization_retry(|| {
            conn.immediate_transaction(|conn| {
                let deleted =
                    diesel::delete(sub_accounts::table.find(id)).execute(conn)?;
                if deleted == 0 {
                    return Err(WalletError::UnknownSubAccount(id.to_string()));
                }
                Ok(())
            })
        })
    }

    /// Recompute `pending_msats` from the canonical sum of owned pending
    /// invoices. Must run inside the transaction that changed them.
    pub(crate) fn refresh_pending(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<i64, diesel::result::Error> {
        let total: Option<i64> = pending_invoices::table
            .filter(pending_invoices::sub_account_id.eq(id))
            .filter(pending_invoices::state.eq("pending"))
            .select(sql::<Nullable<BigInt>>("SUM(amount_msats)"))
            .first(conn)?;
        let total = total.unwrap_or(0);

        diesel::update(sub_accounts::table.find(id))
            .set((
                sub_accounts::pending_msats.eq(total),
                sub_accounts::updated_at.eq(now()),
            ))
            .execute(conn)?;

        Ok(total)
    }

    /// Credit a settled invoice amount. Runs inside the settlement
    /// transaction, after the state transition, so the credit and the
    /// aggregate refresh commit together.
    pub(crate) fn credit_settlement(
        conn: &mut SqliteConnection,
        id: &str,
        credited_msats: i64,
    ) -> Result<(), diesel::result::Error> {
        let account: SubAccount = sub_accounts::table.find(id).first(conn)?;
        diesel::update(sub_accounts::table.find(id))
            .set((
                sub_accounts::balance_msats.eq(account.balance_msats + credited_msats),
                sub_accounts::updated_at.eq(now()),
            ))
            .execute(conn)?;
        Ok(())
    }
}
