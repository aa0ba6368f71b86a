//! Chaos property tests for the degradation controller.
//!
//! A `KeyVault` wraps a `ChaoticKeyStore` that fails a random share of
//! calls. The same operations are applied to a plain `MemoryKeyStore`
//! model. Invariants checked:
//! - No caller ever sees an availability error
//! - Once failures stop and the vault recovers, the durable store holds
//!   exactly what the model holds, however the ops were split between the
//!   durable store and the fallback

use std::{collections::BTreeMap, time::Duration};

use olmvault::{
    AccountKey, AccountRecord, ChaoticKeyStore, DeviceKey, EncryptedRoom, KeyStore, KeyVault,
    MegolmSession, MemoryKeyStore, Mode, OlmSession, RecoverySettings,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    SaveAccount { account: usize, shared: bool },
    SaveMegolm { account: usize, room: u8, session: u8, pickle: u8 },
    ImportRoomKeys { account: usize, room: u8, session: u8, pickle: u8 },
    SaveOlm { account: usize, session: u8, last_used: i64 },
    SaveDevice { account: usize, device: u8 },
    DeleteDevice { account: usize, device: u8 },
    SaveCursor { account: usize, token: u16 },
    SaveRoom { account: usize, room: u8 },
    Wipe { account: usize },
}

const ACCOUNTS: usize = 3;

fn accounts() -> Vec<AccountKey> {
    (0..ACCOUNTS).map(|i| AccountKey::new(format!("@user{i}:x"), format!("DEV{i}"))).collect()
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let account = 0..ACCOUNTS;
    prop_oneof![
        1 => (account.clone(), any::<bool>())
            .prop_map(|(account, shared)| Op::SaveAccount { account, shared }),
        4 => (account.clone(), 0u8..3, 0u8..4, any::<u8>()).prop_map(
            |(account, room, session, pickle)| Op::SaveMegolm { account, room, session, pickle }
        ),
        2 => (account.clone(), 0u8..3, 0u8..4, any::<u8>()).prop_map(
            |(account, room, session, pickle)| Op::ImportRoomKeys { account, room, session, pickle }
        ),
        2 => (account.clone(), 0u8..3, 0i64..1000)
            .prop_map(|(account, session, last_used)| Op::SaveOlm { account, session, last_used }),
        2 => (account.clone(), 0u8..3).prop_map(|(account, device)| Op::SaveDevice { account, device }),
        1 => (account.clone(), 0u8..3)
            .prop_map(|(account, device)| Op::DeleteDevice { account, device }),
        2 => (account.clone(), any::<u16>()).prop_map(|(account, token)| Op::SaveCursor { account, token }),
        1 => (account.clone(), 0u8..3).prop_map(|(account, room)| Op::SaveRoom { account, room }),
        1 => account.prop_map(|account| Op::Wipe { account }),
    ]
}

fn megolm(room: u8, session: u8, pickle: u8) -> MegolmSession {
    MegolmSession {
        room_id: format!("!room{room}:x"),
        session_id: format!("s{session}"),
        sender_key: "curve".into(),
        pickle: vec![pickle],
        signing_keys: BTreeMap::new(),
        forwarding_chain: Vec::new(),
        created_at_ms: i64::from(pickle),
    }
}

fn apply(store: &dyn KeyStore, accounts: &[AccountKey], op: &Op) {
    match *op {
        Op::SaveAccount { account, shared } => {
            let record = AccountRecord { pickle: vec![u8::from(shared)], shared };
            store.save_account(&accounts[account], &record).unwrap();
        },
        Op::SaveMegolm { account, room, session, pickle } => {
            store.save_megolm_session(&accounts[account], &megolm(room, session, pickle)).unwrap();
        },
        Op::ImportRoomKeys { account, room, session, pickle } => {
            // An old export: may name sessions the store already ratcheted
            let export = [megolm(room, session, pickle), megolm(room, (session + 1) % 4, pickle)];
            store.import_room_keys(&accounts[account], &export).unwrap();
        },
        Op::SaveOlm { account, session, last_used } => {
            let session = OlmSession {
                sender_key: "peer".into(),
                session_id: format!("o{session}"),
                pickle: vec![session],
                created_at_ms: 0,
                last_used_ms: last_used,
            };
            store.save_olm_session(&accounts[account], &session).unwrap();
        },
        Op::SaveDevice { account, device } => {
            let device = DeviceKey {
                user_id: "@peer:x".into(),
                device_id: format!("D{device}"),
                key_bundle: vec![device],
                display_name: String::new(),
                deleted: false,
            };
            store.save_device_key(&accounts[account], &device).unwrap();
        },
        Op::DeleteDevice { account, device } => {
            store.delete_device_key(&accounts[account], "@peer:x", &format!("D{device}")).unwrap();
        },
        Op::SaveCursor { account, token } => {
            store.save_sync_cursor(&accounts[account], &format!("batch-{token}")).unwrap();
        },
        Op::SaveRoom { account, room } => {
            store
                .save_encrypted_room(&accounts[account], &EncryptedRoom::new(format!("!room{room}:x")))
                .unwrap();
        },
        Op::Wipe { account } => {
            store.wipe_account(&accounts[account]).unwrap();
        },
    }
}

fn recover_fully(vault: &KeyVault<ChaoticKeyStore<MemoryKeyStore>>) {
    let mut attempts = 0;
    while vault.try_recover() != Mode::Durable {
        attempts += 1;
        assert!(attempts < 3, "recovery kept failing with failures disabled");
    }
}

#[test]
fn prop_vault_converges_to_model_after_recovery() {
    proptest!(|(
        failure_rate in 0.0..0.7,
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..120),
    )| {
        let accounts = accounts();
        let chaos = ChaoticKeyStore::with_seed(MemoryKeyStore::new(), failure_rate, seed);
        let settings = RecoverySettings { check_every: 8, min_interval: Duration::ZERO };
        let vault = KeyVault::open(Some(chaos.clone()), settings).unwrap();
        let model = MemoryKeyStore::new();

        for op in &ops {
            apply(&vault, &accounts, op);
            apply(&model, &accounts, op);
        }

        chaos.set_failure_rate(0.0);
        recover_fully(&vault);
        prop_assert_eq!(vault.fallback_accounts(), 0);
        prop_assert_eq!(vault.pending_replay_ops(), 0);

        // ORACLE: the durable store matches the model account by account
        for account in &accounts {
            prop_assert_eq!(
                chaos.inner().export_account(account).unwrap(),
                model.export_account(account).unwrap()
            );
        }
    });
}

#[test]
fn prop_outage_window_is_replayed() {
    proptest!(|(
        before in prop::collection::vec(op_strategy(), 0..40),
        during in prop::collection::vec(op_strategy(), 1..40),
        after in prop::collection::vec(op_strategy(), 0..40),
    )| {
        let accounts = accounts();
        let chaos = ChaoticKeyStore::reliable(MemoryKeyStore::new());
        let settings = RecoverySettings { check_every: u64::MAX, min_interval: Duration::MAX };
        let vault = KeyVault::open(Some(chaos.clone()), settings).unwrap();
        let model = MemoryKeyStore::new();

        for op in &before {
            apply(&vault, &accounts, op);
            apply(&model, &accounts, op);
        }
        prop_assert_eq!(vault.mode(), Mode::Durable);

        chaos.set_outage(true);
        for op in &during {
            apply(&vault, &accounts, op);
            apply(&model, &accounts, op);
        }
        prop_assert_eq!(vault.mode(), Mode::Degraded);
        prop_assert_eq!(vault.downgrades(), 1);

        chaos.set_outage(false);
        recover_fully(&vault);
        for op in &after {
            apply(&vault, &accounts, op);
            apply(&model, &accounts, op);
        }

        for account in &accounts {
            prop_assert_eq!(
                chaos.inner().export_account(account).unwrap(),
                model.export_account(account).unwrap()
            );
        }
    });
}
