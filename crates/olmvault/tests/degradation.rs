//! Degradation controller tests against real backends.
//!
//! Unreachable SQLite is simulated with a database path whose directory does
//! not exist yet; creating the directory brings the backend back. Mid-run
//! outages use `ChaoticKeyStore` wrapped around a working SQLite store.

use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use olmvault::{
    AccountKey, AccountRecord, ChaoticKeyStore, DeviceKey, KeyStore, KeyVault, MegolmSession,
    Mode, OlmSession, PoolSettings, RecoverySettings, SqliteKeyStore,
};
use tempfile::tempdir;

fn fast_pool() -> PoolSettings {
    PoolSettings { max_size: 2, acquire_timeout: Duration::from_millis(200) }
}

fn manual_recovery() -> RecoverySettings {
    RecoverySettings { check_every: u64::MAX, min_interval: Duration::from_secs(3600) }
}

fn megolm(id: &str, pickle: &[u8]) -> MegolmSession {
    MegolmSession {
        room_id: "!r:x".into(),
        session_id: id.into(),
        sender_key: "curve".into(),
        pickle: pickle.to_vec(),
        signing_keys: BTreeMap::from([("ed25519".into(), "sig".into())]),
        forwarding_chain: Vec::new(),
        created_at_ms: 0,
    }
}

fn peer_device() -> DeviceKey {
    DeviceKey {
        user_id: "@peer:x".into(),
        device_id: "PEER".into(),
        key_bundle: b"bundle".to_vec(),
        display_name: "peer".into(),
        deleted: false,
    }
}

fn olm(id: &str) -> OlmSession {
    OlmSession {
        sender_key: "peer-curve".into(),
        session_id: id.into(),
        pickle: b"olm".to_vec(),
        created_at_ms: 1,
        last_used_ms: 2,
    }
}

/// Exercise all five entity pairs and check each read sees its write.
fn exercise_all_entities(store: &dyn KeyStore, acct: &AccountKey) {
    let record = AccountRecord { pickle: b"acct".to_vec(), shared: false };
    store.save_account(acct, &record).unwrap();
    assert_eq!(store.load_account(acct).unwrap(), Some(record));

    store.save_device_key(acct, &peer_device()).unwrap();
    assert_eq!(store.load_device_keys(acct, false).unwrap(), vec![peer_device()]);

    store.save_olm_session(acct, &olm("o1")).unwrap();
    assert_eq!(store.load_olm_sessions(acct, "peer-curve").unwrap(), vec![olm("o1")]);

    store.save_megolm_session(acct, &megolm("s1", b"k1")).unwrap();
    assert_eq!(store.load_megolm_sessions(acct).unwrap(), vec![megolm("s1", b"k1")]);
    assert_eq!(store.load_megolm_session(acct, "!r:x", "s1").unwrap(), Some(megolm("s1", b"k1")));

    store.save_sync_cursor(acct, "t1").unwrap();
    assert_eq!(store.load_sync_cursor(acct).unwrap().as_deref(), Some("t1"));
}

fn durable_at(path: &Path) -> SqliteKeyStore {
    SqliteKeyStore::open(path, fast_pool())
}

#[test]
fn test_unreachable_at_init_serves_from_memory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing").join("keys.db");
    let vault = KeyVault::open(Some(durable_at(&path)), manual_recovery()).unwrap();
    assert_eq!(vault.mode(), Mode::Degraded);

    let acct = AccountKey::new("@bot:x", "BOT");
    exercise_all_entities(&vault, &acct);

    let report = vault.health(Some(&acct)).unwrap();
    assert_eq!(report.mode, Mode::Degraded);
    assert!(!report.persistent);
    assert!(report.durable_enabled);
    assert_eq!(report.backend, "sqlite");
    assert_eq!(report.fallback_accounts, 1);
    assert_eq!(report.account.unwrap().session_count, 1);
    assert!(!path.exists());
}

#[test]
fn test_recovery_replays_into_sqlite() {
    let dir = tempdir().unwrap();
    let db_dir = dir.path().join("later");
    let path = db_dir.join("keys.db");
    let vault = KeyVault::open(Some(durable_at(&path)), manual_recovery()).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");

    exercise_all_entities(&vault, &acct);
    assert_eq!(vault.try_recover(), Mode::Degraded);

    // Backend comes back
    fs::create_dir(&db_dir).unwrap();
    assert_eq!(vault.try_recover(), Mode::Durable);
    assert_eq!(vault.fallback_accounts(), 0);

    let direct = durable_at(&path);
    assert_eq!(direct.load_account(&acct).unwrap().unwrap().pickle, b"acct");
    assert_eq!(direct.load_device_keys(&acct, false).unwrap(), vec![peer_device()]);
    assert_eq!(direct.load_olm_sessions(&acct, "peer-curve").unwrap(), vec![olm("o1")]);
    assert_eq!(direct.load_megolm_session(&acct, "!r:x", "s1").unwrap(), Some(megolm("s1", b"k1")));
    assert_eq!(direct.load_sync_cursor(&acct).unwrap().as_deref(), Some("t1"));

    // Later writes go straight to the durable store
    vault.save_sync_cursor(&acct, "t2").unwrap();
    assert_eq!(direct.load_sync_cursor(&acct).unwrap().as_deref(), Some("t2"));
}

#[test]
fn test_recovery_on_nth_call() {
    let dir = tempdir().unwrap();
    let db_dir = dir.path().join("later");
    let settings = RecoverySettings { check_every: 4, min_interval: Duration::ZERO };
    let vault = KeyVault::open(Some(durable_at(&db_dir.join("keys.db"))), settings).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");

    vault.save_sync_cursor(&acct, "t1").unwrap();
    fs::create_dir(&db_dir).unwrap();

    let mut modes = Vec::new();
    for _ in 0..3 {
        vault.load_sync_cursor(&acct).unwrap();
        modes.push(vault.mode());
    }
    assert_eq!(modes, [Mode::Degraded, Mode::Degraded, Mode::Durable]);
    assert_eq!(vault.load_sync_cursor(&acct).unwrap().as_deref(), Some("t1"));
}

#[test]
fn test_outage_mid_run_is_sticky_and_loud() {
    let dir = tempdir().unwrap();
    let sqlite = durable_at(&dir.path().join("keys.db"));
    let chaos = ChaoticKeyStore::reliable(sqlite);
    let vault = KeyVault::open(Some(chaos.clone()), manual_recovery()).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");

    vault.save_megolm_session(&acct, &megolm("before", b"durable")).unwrap();
    assert_eq!(vault.mode(), Mode::Durable);

    chaos.set_outage(true);
    vault.save_megolm_session(&acct, &megolm("during", b"volatile")).unwrap();
    assert_eq!(vault.mode(), Mode::Degraded);

    // The write that hit the outage is readable from the fallback
    assert_eq!(
        vault.load_megolm_session(&acct, "!r:x", "during").unwrap().unwrap().pickle,
        b"volatile"
    );

    // Sticky: the backend is healthy again but nothing is routed to it
    chaos.set_outage(false);
    let attempts = chaos.operation_count();
    vault.save_megolm_session(&acct, &megolm("after", b"volatile")).unwrap();
    assert_eq!(chaos.operation_count(), attempts);

    let report = vault.health(None).unwrap();
    assert_eq!(report.downgrades, 1);
    assert!(!report.persistent);
    assert!(report.summary().contains("NOT persistent"));

    assert_eq!(vault.try_recover(), Mode::Durable);
    let ids: Vec<String> = chaos
        .inner()
        .load_megolm_sessions(&acct)
        .unwrap()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(ids, ["after", "before", "during"]);
}

#[test]
fn test_degraded_wipe_is_replayed() {
    let dir = tempdir().unwrap();
    let chaos = ChaoticKeyStore::reliable(durable_at(&dir.path().join("keys.db")));
    let vault = KeyVault::open(Some(chaos.clone()), manual_recovery()).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");
    let bystander = AccountKey::new("@other:x", "OTHER");

    vault.save_megolm_session(&acct, &megolm("s1", b"old")).unwrap();
    vault.save_sync_cursor(&bystander, "keep").unwrap();

    chaos.set_outage(true);
    vault.wipe_account(&acct).unwrap();
    vault.save_sync_cursor(&acct, "fresh-login").unwrap();
    assert_eq!(vault.pending_replay_ops(), 1);

    chaos.set_outage(false);
    assert_eq!(vault.try_recover(), Mode::Durable);

    let durable = chaos.inner();
    assert!(durable.load_megolm_sessions(&acct).unwrap().is_empty());
    assert_eq!(durable.load_sync_cursor(&acct).unwrap().as_deref(), Some("fresh-login"));
    assert_eq!(durable.load_sync_cursor(&bystander).unwrap().as_deref(), Some("keep"));
}

#[test]
fn test_failed_replay_is_retried() {
    let dir = tempdir().unwrap();
    let chaos = ChaoticKeyStore::reliable(durable_at(&dir.path().join("keys.db")));
    chaos.set_outage(true);
    let vault = KeyVault::open(Some(chaos.clone()), manual_recovery()).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");
    for i in 0..20 {
        vault.save_megolm_session(&acct, &megolm(&format!("s{i:02}"), &[i])).unwrap();
    }

    // Probe passes but most replay writes fail
    chaos.set_outage(false);
    chaos.set_failure_rate(0.9);
    let mut attempts = 0;
    while vault.try_recover() != Mode::Durable {
        attempts += 1;
        assert_eq!(vault.fallback_accounts(), 1);
        if attempts == 5 {
            chaos.set_failure_rate(0.0);
        }
        assert!(attempts < 10);
    }

    assert_eq!(chaos.inner().load_megolm_sessions(&acct).unwrap().len(), 20);
    assert_eq!(vault.fallback_accounts(), 0);
}

#[test]
fn test_degraded_room_key_import_keeps_live_ratchet() {
    let dir = tempdir().unwrap();
    let chaos = ChaoticKeyStore::reliable(durable_at(&dir.path().join("keys.db")));
    let vault = KeyVault::open(Some(chaos.clone()), manual_recovery()).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");
    vault.save_megolm_session(&acct, &megolm("s1", b"live-ratchet")).unwrap();

    chaos.set_outage(true);
    let backup = [megolm("s1", b"old-export"), megolm("s2", b"old-export")];
    assert_eq!(vault.import_room_keys(&acct, &backup).unwrap(), 2);

    chaos.set_outage(false);
    assert_eq!(vault.try_recover(), Mode::Durable);

    let durable = chaos.inner();
    assert_eq!(
        durable.load_megolm_session(&acct, "!r:x", "s1").unwrap().unwrap().pickle,
        b"live-ratchet"
    );
    assert_eq!(
        durable.load_megolm_session(&acct, "!r:x", "s2").unwrap().unwrap().pickle,
        b"old-export"
    );
}

#[test]
fn test_reopen_schema_replays_degraded_writes() {
    let dir = tempdir().unwrap();
    let chaos = ChaoticKeyStore::reliable(durable_at(&dir.path().join("keys.db")));
    let vault = KeyVault::open(Some(chaos.clone()), manual_recovery()).unwrap();
    let acct = AccountKey::new("@bot:x", "BOT");

    chaos.set_outage(true);
    vault.save_megolm_session(&acct, &megolm("s1", b"degraded-v1")).unwrap();
    chaos.set_outage(false);

    vault.ensure_schema().unwrap();
    assert_eq!(vault.mode(), Mode::Durable);
    assert_eq!(vault.fallback_accounts(), 0);
    assert_eq!(
        chaos.inner().load_megolm_session(&acct, "!r:x", "s1").unwrap(),
        Some(megolm("s1", b"degraded-v1"))
    );

    vault.save_megolm_session(&acct, &megolm("s1", b"durable-v2")).unwrap();
    chaos.set_outage(true);
    vault.save_sync_cursor(&acct, "t1").unwrap();
    chaos.set_outage(false);
    assert_eq!(vault.try_recover(), Mode::Durable);
    assert_eq!(
        chaos.inner().load_megolm_session(&acct, "!r:x", "s1").unwrap(),
        Some(megolm("s1", b"durable-v2"))
    );
}
