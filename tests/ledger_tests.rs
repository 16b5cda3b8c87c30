use walletmux::error::WalletError;
use walletmux::models::pending_invoice::{
    InvoiceQuery, InvoiceState, PendingInvoice, RegisterPendingInvoice,
};
use walletmux::models::sub_account::{CreateSubAccount, SubAccount};
use walletmux::vault::Vault;

use test_utils::{random_hex, setup_db, unix_now, MASTER_KEY};

fn create_account(conn: &mut diesel::SqliteConnection, vault: &Vault, label: &str) -> SubAccount {
    let (account, _) = SubAccount::create(
        conn,
        vault,
        CreateSubAccount {
            label: label.to_string(),
            ..Default::default()
        },
    )
    .unwrap();
    account
}

fn register_invoice(
    conn: &mut diesel::SqliteConnection,
    account: &SubAccount,
    amount_msats: u64,
    expires_at: Option<i64>,
) -> PendingInvoice {
    PendingInvoice::register(
        conn,
        RegisterPendingInvoice {
            sub_account_id: account.id.clone(),
            invoice: Some(format!("lntest{}", random_hex(8))),
            payment_hash: Some(random_hex(32)),
            description_hash: None,
            amount_msats,
            expires_at,
            raw: None,
        },
    )
    .unwrap()
}

#[test]
fn create_returns_plaintext_secrets_once() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();

    let (account, secrets) = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "alice".to_string(),
            description: Some("first".to_string()),
            relays: vec!["wss://relay.test".to_string()],
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(account.id.len(), 32);
    assert_eq!(account.balance_msats(), 0);
    assert_eq!(account.pending_msats(), 0);
    assert_eq!(account.usage_count, 0);
    assert_eq!(account.service_pubkey, secrets.service.public_hex());
    assert_eq!(account.client_pubkey, secrets.client.public_hex());

    // stored ciphertext decrypts back to the same key pair
    let service = account.service_keys(&vault).unwrap();
    assert_eq!(service.secret_hex(), secrets.service.secret_hex());
    let client = account.client_keys(&vault).unwrap();
    assert_eq!(client.secret_hex(), secrets.client.secret_hex());
}

#[test]
fn create_honors_supplied_secrets_and_rejects_bad_ones() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();

    let secret_hex = random_hex(32);
    let (account, secrets) = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "fixed".to_string(),
            service_secret_hex: Some(secret_hex.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(secrets.service.secret_hex(), secret_hex);
    assert_eq!(account.service_pubkey, secrets.service.public_hex());

    let err = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "bad".to_string(),
            client_secret_hex: Some("abcd".to_string()),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::InvalidInput(_)));
}

#[test]
fn create_rejects_duplicate_pubkeys() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();

    let secret_hex = random_hex(32);
    let (existing, _) = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "one".to_string(),
            service_secret_hex: Some(secret_hex.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    let err = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "two".to_string(),
            service_secret_hex: Some(secret_hex),
            ..Default::default()
        },
    )
    .unwrap_err();
    match err {
        WalletError::DuplicateKey(key) => assert_eq!(key, existing.service_pubkey),
        other => panic!("expected DuplicateKey, got {other}"),
    }
}

#[test]
fn duplicate_key_error_names_the_colliding_pubkey() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();

    let secret_hex = random_hex(32);
    let (existing, _) = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "one".to_string(),
            client_secret_hex: Some(secret_hex.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    // collision on the client pair must name the client pubkey, not the
    // (fresh, unrelated) service pubkey
    let err = SubAccount::create(
        &mut conn,
        &vault,
        CreateSubAccount {
            label: "two".to_string(),
            client_secret_hex: Some(secret_hex),
            ..Default::default()
        },
    )
    .unwrap_err();
    match err {
        WalletError::DuplicateKey(key) => assert_eq!(key, existing.client_pubkey),
        other => panic!("expected DuplicateKey, got {other}"),
    }
}

#[test]
fn concurrent_creates_never_collide() {
    let (pool, _dir) = setup_db();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        handles.push(std::thread::spawn(move || {
            let vault = Vault::new(MASTER_KEY);
            let mut conn = pool.get().unwrap();
            create_account(&mut conn, &vault, &format!("w{worker}"))
        }));
    }
    let accounts: Vec<SubAccount> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut service_keys: Vec<&str> =
        accounts.iter().map(|a| a.service_pubkey.as_str()).collect();
    service_keys.sort();
    service_keys.dedup();
    assert_eq!(service_keys.len(), 8);

    let mut conn = pool.get().unwrap();
    assert_eq!(SubAccount::find_all(&mut conn).unwrap().len(), 8);
}

#[test]
fn adjust_balance_enforces_non_negative() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");

    let account = SubAccount::adjust_balance(&mut conn, &account.id, 1_000).unwrap();
    assert_eq!(account.balance_msats(), 1_000);

    let err = SubAccount::adjust_balance(&mut conn, &account.id, -1_500).unwrap_err();
    assert!(matches!(
        err,
        WalletError::InsufficientBalance {
            available: 1_000,
            required: 1_500
        }
    ));

    // the failed delta changed nothing
    let account = SubAccount::find_by_id(&mut conn, &account.id).unwrap().unwrap();
    assert_eq!(account.balance_msats(), 1_000);

    let account = SubAccount::adjust_balance(&mut conn, &account.id, -1_000).unwrap();
    assert_eq!(account.balance_msats(), 0);
}

#[test]
fn register_refreshes_pending_aggregate() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");

    register_invoice(&mut conn, &account, 500_000, None);
    register_invoice(&mut conn, &account, 200_000, None);

    let account = SubAccount::find_by_id(&mut conn, &account.id).unwrap().unwrap();
    assert_eq!(account.pending_msats(), 700_000);
    assert_eq!(account.balance_msats(), 0);
}

#[test]
fn register_requires_amount_and_identifier() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");

    let err = PendingInvoice::register(
        &mut conn,
        RegisterPendingInvoice {
            sub_account_id: account.id.clone(),
            payment_hash: Some(random_hex(32)),
            amount_msats: 0,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::InvalidInput(_)));

    let err = PendingInvoice::register(
        &mut conn,
        RegisterPendingInvoice {
            sub_account_id: account.id.clone(),
            amount_msats: 1_000,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, WalletError::InvalidInput(_)));
}

#[test]
fn settle_credits_balance_and_releases_pending() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");
    let invoice = register_invoice(&mut conn, &account, 500_000, None);

    let (settled, account) =
        PendingInvoice::settle(&mut conn, &invoice.id, None, None).unwrap();
    assert_eq!(settled.state(), InvoiceState::Settled);
    assert!(settled.settled_at.is_some());
    assert_eq!(account.balance_msats(), 500_000);
    assert_eq!(account.pending_msats(), 0);
}

#[test]
fn settle_prefers_upstream_reported_amount() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");
    let invoice = register_invoice(&mut conn, &account, 500_000, None);

    // upstream settled for more than face value (overpayment)
    let (_, account) =
        PendingInvoice::settle(&mut conn, &invoice.id, Some(510_000), None).unwrap();
    assert_eq!(account.balance_msats(), 510_000);
    assert_eq!(account.pending_msats(), 0);
}

#[test]
fn terminal_states_reject_further_transitions() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");
    let invoice = register_invoice(&mut conn, &account, 100_000, None);

    PendingInvoice::update_state(&mut conn, &invoice.id, InvoiceState::Failed, None).unwrap();

    for next in [
        InvoiceState::Pending,
        InvoiceState::Settled,
        InvoiceState::Expired,
    ] {
        let err =
            PendingInvoice::update_state(&mut conn, &invoice.id, next, None).unwrap_err();
        assert!(matches!(err, WalletError::InvalidTransition { .. }));
    }

    // the failed invoice released its pending share exactly once
    let account = SubAccount::find_by_id(&mut conn, &account.id).unwrap().unwrap();
    assert_eq!(account.pending_msats(), 0);
    assert_eq!(account.balance_msats(), 0);
}

#[test]
fn find_matching_prefers_payment_hash_over_invoice() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");

    let by_hash = register_invoice(&mut conn, &account, 1_000, None);
    let by_invoice = register_invoice(&mut conn, &account, 2_000, None);

    let found = PendingInvoice::find_matching(
        &mut conn,
        &InvoiceQuery {
            payment_hash: by_hash.payment_hash.clone(),
            invoice: by_invoice.invoice.clone(),
            description_hash: None,
        },
    )
    .unwrap()
    .unwrap();
    assert_eq!(found.id, by_hash.id);

    // unknown hash falls through to the invoice match
    let found = PendingInvoice::find_matching(
        &mut conn,
        &InvoiceQuery {
            payment_hash: Some(random_hex(32)),
            invoice: by_invoice.invoice.clone(),
            description_hash: None,
        },
    )
    .unwrap()
    .unwrap();
    assert_eq!(found.id, by_invoice.id);

    assert!(PendingInvoice::find_matching(
        &mut conn,
        &InvoiceQuery {
            payment_hash: Some(random_hex(32)),
            invoice: None,
            description_hash: None,
        },
    )
    .unwrap()
    .is_none());
}

#[test]
fn prune_expired_is_idempotent_and_scoped() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let alice = create_account(&mut conn, &vault, "alice");
    let bob = create_account(&mut conn, &vault, "bob");

    let now = unix_now();
    let stale = register_invoice(&mut conn, &alice, 200_000, Some(now - 10));
    register_invoice(&mut conn, &alice, 300_000, Some(now + 600));
    register_invoice(&mut conn, &bob, 50_000, None);

    let swept = PendingInvoice::prune_expired(&mut conn, now).unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, stale.id);
    assert_eq!(swept[0].state(), InvoiceState::Expired);

    let alice = SubAccount::find_by_id(&mut conn, &alice.id).unwrap().unwrap();
    assert_eq!(alice.pending_msats(), 300_000);
    assert_eq!(alice.balance_msats(), 0);

    // invoices without expiry are untouched
    let bob = SubAccount::find_by_id(&mut conn, &bob.id).unwrap().unwrap();
    assert_eq!(bob.pending_msats(), 50_000);

    // a second sweep finds nothing
    assert!(PendingInvoice::prune_expired(&mut conn, now).unwrap().is_empty());
}

#[test]
fn touch_updates_usage_metadata() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");
    assert!(account.last_used_at.is_none());

    SubAccount::touch(&mut conn, &account.id, true, true).unwrap();
    SubAccount::touch(&mut conn, &account.id, true, false).unwrap();

    let account = SubAccount::find_by_id(&mut conn, &account.id).unwrap().unwrap();
    assert_eq!(account.usage_count, 2);
    assert!(account.last_used_at.is_some());
}

#[test]
fn remove_cascades_to_pending_invoices() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();
    let account = create_account(&mut conn, &vault, "alice");
    let invoice = register_invoice(&mut conn, &account, 100_000, None);

    SubAccount::remove(&mut conn, &account.id).unwrap();

    assert!(SubAccount::find_by_id(&mut conn, &account.id).unwrap().is_none());
    assert!(PendingInvoice::find_by_id(&mut conn, &invoice.id).unwrap().is_none());

    let err = SubAccount::remove(&mut conn, &account.id).unwrap_err();
    assert!(matches!(err, WalletError::UnknownSubAccount(_)));
}

#[test]
fn list_orders_by_creation() {
    let (pool, _dir) = setup_db();
    let vault = Vault::new(MASTER_KEY);
    let mut conn = pool.get().unwrap();

    for label in ["first", "second", "third"] {
        create_account(&mut conn, &vault, label);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let labels: Vec<String> = SubAccount::find_all(&mut conn)
        .unwrap()
        .into_iter()
        .map(|a| a.label)
        .collect();
    assert_eq!(labels, ["first", "second", "third"]);
}
