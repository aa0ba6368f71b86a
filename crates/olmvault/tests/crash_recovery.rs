//! Restart tests for the SQLite key store.
//!
//! These tests verify that encryption state persists across close/reopen
//! cycles, simulating bot restarts.

use std::collections::BTreeMap;

use olmvault::{
    AccountKey, AccountRecord, EncryptedRoom, KeyStore, MegolmSession, Mode, OlmSession,
    StoreConfig, open_vault,
};
use tempfile::tempdir;

fn megolm(room: &str, id: &str, pickle: &[u8]) -> MegolmSession {
    MegolmSession {
        room_id: room.into(),
        session_id: id.into(),
        sender_key: "curve".into(),
        pickle: pickle.to_vec(),
        signing_keys: BTreeMap::new(),
        forwarding_chain: Vec::new(),
        created_at_ms: 0,
    }
}

#[test]
fn test_identity_survives_restart() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::sqlite(dir.path().join("keys.db"));
    let acct = AccountKey::new("@bot:example.org", "BOTDEVICE");

    // First run: log in, receive keys, sync
    {
        let vault = open_vault(&config).unwrap();
        assert_eq!(vault.mode(), Mode::Durable);

        vault
            .save_account(&acct, &AccountRecord { pickle: b"account-pickle".to_vec(), shared: true })
            .unwrap();
        for i in 0..10 {
            vault
                .save_megolm_session(&acct, &megolm("!room:x", &format!("s{i}"), &[i as u8; 64]))
                .unwrap();
        }
        vault
            .save_olm_session(
                &acct,
                &OlmSession {
                    sender_key: "peer".into(),
                    session_id: "o1".into(),
                    pickle: b"olm".to_vec(),
                    created_at_ms: 10,
                    last_used_ms: 20,
                },
            )
            .unwrap();
        vault.save_encrypted_room(&acct, &EncryptedRoom::new("!room:x")).unwrap();
        vault.save_sync_cursor(&acct, "s72594_4483_1934").unwrap();

        // Vault dropped
    }

    // Second run: resume identity from disk
    {
        let vault = open_vault(&config).unwrap();
        assert_eq!(vault.mode(), Mode::Durable);

        let record = vault.load_account(&acct).unwrap().unwrap();
        assert_eq!(record.pickle, b"account-pickle");
        assert!(record.shared);

        let sessions = vault.load_megolm_sessions(&acct).unwrap();
        assert_eq!(sessions.len(), 10);
        for session in &sessions {
            let i: u8 = session.session_id[1..].parse().unwrap();
            assert_eq!(session.pickle, vec![i; 64]);
        }

        assert_eq!(vault.load_olm_sessions(&acct, "peer").unwrap()[0].last_used_ms, 20);
        assert_eq!(vault.load_encrypted_rooms(&acct).unwrap().len(), 1);
        assert_eq!(vault.load_sync_cursor(&acct).unwrap().as_deref(), Some("s72594_4483_1934"));
    }
}

#[test]
fn test_ratchet_updates_survive_restart() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::sqlite(dir.path().join("keys.db"));
    let acct = AccountKey::new("@bot:x", "BOT");

    for step in 0..5u8 {
        let vault = open_vault(&config).unwrap();
        if step > 0 {
            let previous = vault.load_megolm_session(&acct, "!r:x", "s1").unwrap().unwrap();
            assert_eq!(previous.pickle, vec![step - 1]);
        }
        vault.save_megolm_session(&acct, &megolm("!r:x", "s1", &[step])).unwrap();
        vault.save_sync_cursor(&acct, &format!("batch-{step}")).unwrap();
    }

    let vault = open_vault(&config).unwrap();
    assert_eq!(vault.stats(&acct).unwrap().session_count, 1);
    assert_eq!(vault.load_sync_cursor(&acct).unwrap().as_deref(), Some("batch-4"));
}

#[test]
fn test_wipe_survives_restart() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::sqlite(dir.path().join("keys.db"));
    let acct = AccountKey::new("@bot:x", "BOT");

    {
        let vault = open_vault(&config).unwrap();
        vault.save_megolm_session(&acct, &megolm("!r:x", "s1", b"k")).unwrap();
        assert!(vault.wipe_account(&acct).unwrap());
    }

    {
        let vault = open_vault(&config).unwrap();
        assert!(vault.load_megolm_sessions(&acct).unwrap().is_empty());
        assert!(vault.list_accounts().unwrap().is_empty());
    }
}

#[test]
fn test_degraded_writes_do_not_survive_restart() {
    let dir = tempdir().unwrap();
    let mut config = StoreConfig::sqlite(dir.path().join("keys.db"));
    config.durable_enabled = false;
    let acct = AccountKey::new("@bot:x", "BOT");

    {
        let vault = open_vault(&config).unwrap();
        assert_eq!(vault.mode(), Mode::Degraded);
        vault.save_sync_cursor(&acct, "volatile").unwrap();
        assert_eq!(vault.load_sync_cursor(&acct).unwrap().as_deref(), Some("volatile"));
    }

    config.durable_enabled = true;
    let vault = open_vault(&config).unwrap();
    assert_eq!(vault.mode(), Mode::Durable);
    assert_eq!(vault.load_sync_cursor(&acct).unwrap(), None);
}
