//! Fuzz target for KeyVault under backend failures
//!
//! Drives a vault whose durable store is a `ChaoticKeyStore` through
//! arbitrary operation sequences, outages and recovery attempts.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Outages switched on and off mid-sequence
//! - Recovery attempts interleaved with writes and wipes
//! - Room-key imports that overlap sessions the backend already holds
//!
//! # Invariants
//!
//! - No operation ever surfaces an availability error to the caller
//! - Reads never fail, whichever store serves them
//! - After failures stop and recovery succeeds, the durable store holds
//!   exactly what a plain in-memory model holds

#![no_main]

use std::{collections::BTreeMap, time::Duration};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use olmvault::{
    AccountKey, ChaoticKeyStore, DeviceKey, KeyStore, KeyVault, MegolmSession, MemoryKeyStore,
    Mode, RecoverySettings,
};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticKeyStore RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Automatic recovery check period (0 disables)
    check_every: u8,
    operations: Vec<VaultOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum VaultOperation {
    SaveMegolm { account: u8, session: u8, pickle: Vec<u8> },
    ImportRoomKeys { account: u8, sessions: Vec<u8>, pickle: Vec<u8> },
    SaveDevice { account: u8, device: u8 },
    DeleteDevice { account: u8, device: u8 },
    SaveCursor { account: u8, token: u16 },
    Wipe { account: u8 },
    SetOutage(bool),
    TryRecover,
    Heartbeat,
}

fn account(idx: u8) -> AccountKey {
    AccountKey::new(format!("@user{}:fuzz", idx % 3), "FUZZ")
}

fn megolm(session: u8, pickle: Vec<u8>) -> MegolmSession {
    MegolmSession {
        room_id: "!room:fuzz".into(),
        session_id: format!("s{}", session % 4),
        sender_key: "curve".into(),
        pickle,
        signing_keys: BTreeMap::new(),
        forwarding_chain: Vec::new(),
        created_at_ms: 0,
    }
}

fn device(idx: u8) -> DeviceKey {
    DeviceKey {
        user_id: "@peer:fuzz".into(),
        device_id: format!("D{}", idx % 3),
        key_bundle: vec![idx],
        display_name: String::new(),
        deleted: false,
    }
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let chaos =
        ChaoticKeyStore::with_seed(MemoryKeyStore::new(), failure_rate, scenario.chaos_seed);
    let settings = RecoverySettings {
        check_every: match scenario.check_every {
            0 => u64::MAX,
            n => u64::from(n),
        },
        min_interval: Duration::ZERO,
    };
    let Ok(vault) = KeyVault::open(Some(chaos.clone()), settings) else {
        panic!("chaotic failures must never surface as a schema error");
    };
    let model = MemoryKeyStore::new();

    for op in scenario.operations.into_iter().take(256) {
        match op {
            VaultOperation::SaveMegolm { account: idx, session, pickle } => {
                let session = megolm(session, pickle);
                vault.save_megolm_session(&account(idx), &session).unwrap();
                model.save_megolm_session(&account(idx), &session).unwrap();
                vault
                    .load_megolm_session(&account(idx), &session.room_id, &session.session_id)
                    .unwrap();
            },
            VaultOperation::ImportRoomKeys { account: idx, sessions, pickle } => {
                let export: Vec<_> =
                    sessions.into_iter().take(8).map(|s| megolm(s, pickle.clone())).collect();
                vault.import_room_keys(&account(idx), &export).unwrap();
                model.import_room_keys(&account(idx), &export).unwrap();
            },
            VaultOperation::SaveDevice { account: idx, device: d } => {
                vault.save_device_key(&account(idx), &device(d)).unwrap();
                model.save_device_key(&account(idx), &device(d)).unwrap();
            },
            VaultOperation::DeleteDevice { account: idx, device: d } => {
                let id = device(d).device_id;
                vault.delete_device_key(&account(idx), "@peer:fuzz", &id).unwrap();
                model.delete_device_key(&account(idx), "@peer:fuzz", &id).unwrap();
            },
            VaultOperation::SaveCursor { account: idx, token } => {
                let token = format!("batch-{token}");
                vault.save_sync_cursor(&account(idx), &token).unwrap();
                model.save_sync_cursor(&account(idx), &token).unwrap();
                vault.load_sync_cursor(&account(idx)).unwrap();
            },
            VaultOperation::Wipe { account: idx } => {
                vault.wipe_account(&account(idx)).unwrap();
                model.wipe_account(&account(idx)).unwrap();
            },
            VaultOperation::SetOutage(outage) => chaos.set_outage(outage),
            VaultOperation::TryRecover => {
                vault.try_recover();
            },
            VaultOperation::Heartbeat => {
                vault.heartbeat();
            },
        }
    }

    verify_final_invariants(&vault, &chaos, &model);
});

fn verify_final_invariants(
    vault: &KeyVault<ChaoticKeyStore<MemoryKeyStore>>,
    chaos: &ChaoticKeyStore<MemoryKeyStore>,
    model: &MemoryKeyStore,
) {
    chaos.set_outage(false);
    chaos.set_failure_rate(0.0);
    assert_eq!(vault.try_recover(), Mode::Durable, "recovery failed with a healthy backend");
    assert_eq!(vault.fallback_accounts(), 0);

    // INVARIANT: nothing written through the vault was lost or resurrected
    for idx in 0..3 {
        assert_eq!(
            chaos.inner().export_account(&account(idx)).unwrap(),
            model.export_account(&account(idx)).unwrap(),
            "durable store diverged from model for {}",
            account(idx)
        );
    }
}
