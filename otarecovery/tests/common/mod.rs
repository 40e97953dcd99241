// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use rsa::RsaPrivateKey;
use x509_cert::{
    Certificate,
    der::{Encode, EncodePem, pem::LineEnding},
};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use otarecovery::{
    crypto,
    format::ota,
    recovery::{
        Services,
        service::{
            Broadcaster, EuiccCallback, EuiccManager, EuiccResult, LskfCallback, PowerManager,
            RecoveryService, StorageCheckpoint, SubscriptionInfo, SubscriptionManager,
            UncryptProgress, UserRestrictions,
        },
    },
};

pub struct TestKeys {
    pub key: RsaPrivateKey,
    pub cert: Certificate,
}

impl TestKeys {
    pub fn generate(subject: &str) -> Self {
        let key = crypto::generate_rsa_key_pair(1024).unwrap();
        let cert =
            crypto::generate_cert(&key, 1, Duration::from_secs(24 * 60 * 60), subject).unwrap();

        Self { key, cert }
    }

    pub fn cert_der(&self) -> Vec<u8> {
        self.cert.to_der().unwrap()
    }

    pub fn cert_pem(&self) -> Vec<u8> {
        self.cert.to_pem(LineEnding::LF).unwrap().into_bytes()
    }
}

/// Key generation is slow, so every test in a binary shares one key.
pub fn test_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();

    KEYS.get_or_init(|| TestKeys::generate("CN=otarecovery test"))
}

/// Build a zip with stored entries so that the payload bytes are predictable.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

pub fn sign(unsigned: &[u8], keys: &TestKeys) -> Vec<u8> {
    let mut signed = vec![];

    ota::sign_zip(
        Cursor::new(unsigned),
        &mut signed,
        &keys.key,
        &keys.cert,
        &AtomicBool::new(false),
    )
    .unwrap();

    signed
}

pub fn write_keystore(path: &Path, certs: &[(&str, Vec<u8>)]) -> PathBuf {
    let entries = certs
        .iter()
        .map(|(n, d)| (*n, d.as_slice()))
        .collect::<Vec<_>>();

    std::fs::write(path, build_zip(&entries)).unwrap();

    path.to_owned()
}

/// Ordered record of the calls made to the fake services.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn get(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub struct FakeRecovery {
    pub events: Events,
    pub setup_bcb_result: bool,
    pub clear_bcb_result: bool,
    pub uncrypt_result: bool,
    pub uncrypt_progress: Vec<u8>,
    pub lskf_result: bool,
    /// Time spent inside `setup_bcb`, to widen race windows.
    pub setup_bcb_delay: Duration,
    /// File whose contents are recorded with the `setup_bcb` events.
    pub watch_file: Option<PathBuf>,
    pub bcb: Mutex<Option<String>>,
}

impl FakeRecovery {
    pub fn new(events: &Events) -> Self {
        Self {
            events: events.clone(),
            setup_bcb_result: true,
            clear_bcb_result: true,
            uncrypt_result: true,
            uncrypt_progress: vec![],
            lskf_result: true,
            setup_bcb_delay: Duration::ZERO,
            watch_file: None,
            bcb: Mutex::new(None),
        }
    }

    pub fn bcb(&self) -> Option<String> {
        self.bcb.lock().unwrap().clone()
    }

    fn bcb_event(&self, name: &str) -> String {
        match &self.watch_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path).unwrap_or_default();
                format!("{name} {}", contents.trim_end())
            }
            None => name.to_owned(),
        }
    }
}

impl RecoveryService for FakeRecovery {
    fn uncrypt(&self, package: &Path, progress: UncryptProgress<'_>) -> std::io::Result<bool> {
        self.events.push(format!("uncrypt {}", package.display()));

        for p in &self.uncrypt_progress {
            progress(*p);
        }

        Ok(self.uncrypt_result)
    }

    fn setup_bcb(&self, command: &str) -> std::io::Result<bool> {
        self.events.push(self.bcb_event("setup_bcb begin"));
        thread::sleep(self.setup_bcb_delay);
        *self.bcb.lock().unwrap() = Some(command.to_owned());
        self.events.push(self.bcb_event("setup_bcb end"));

        Ok(self.setup_bcb_result)
    }

    fn clear_bcb(&self) -> std::io::Result<bool> {
        self.events.push("clear_bcb");
        *self.bcb.lock().unwrap() = None;

        Ok(self.clear_bcb_result)
    }

    fn reboot_recovery_with_command(&self, command: &str) -> std::io::Result<()> {
        self.events.push("reboot_recovery_with_command");
        *self.bcb.lock().unwrap() = Some(command.to_owned());

        Ok(())
    }

    fn request_lskf(&self, token: &str, callback: Option<LskfCallback>) -> std::io::Result<bool> {
        self.events.push(format!("request_lskf {token}"));

        if let Some(cb) = callback {
            cb();
        }

        Ok(self.lskf_result)
    }

    fn clear_lskf(&self) -> std::io::Result<bool> {
        self.events.push("clear_lskf");

        Ok(self.lskf_result)
    }

    fn reboot_with_lskf(&self, token: &str, reason: &str) -> std::io::Result<bool> {
        self.events.push(format!("reboot_with_lskf {token} {reason}"));

        Ok(self.lskf_result)
    }
}

pub struct FakePower {
    pub events: Events,
    pub quiescent: bool,
}

impl PowerManager for FakePower {
    fn reboot(&self, reason: &str) {
        self.events.push(format!("reboot {reason}"));
    }

    fn should_reboot_quiescently(&self) -> bool {
        self.quiescent
    }
}

pub struct FakeRestrictions(pub bool);

impl UserRestrictions for FakeRestrictions {
    fn is_factory_reset_disallowed(&self) -> bool {
        self.0
    }
}

/// Completes the broadcast from another thread, like the real system does.
pub struct FakeBroadcaster {
    pub events: Events,
}

impl Broadcaster for FakeBroadcaster {
    fn send_master_clear_notification(&self, on_complete: Box<dyn FnOnce() + Send>) {
        self.events.push("master_clear_notification");

        let events = self.events.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            events.push("master_clear_notification done");
            on_complete();
        });
    }
}

/// Answers at most `responses` requests successfully, from another thread.
/// Requests beyond that never get a callback.
pub struct FakeEuicc {
    pub events: Events,
    pub enabled: bool,
    pub responses: usize,
    answered: AtomicUsize,
    pending: Mutex<Vec<EuiccCallback>>,
}

impl FakeEuicc {
    pub fn new(events: &Events, responses: usize) -> Self {
        Self {
            events: events.clone(),
            enabled: true,
            responses,
            answered: AtomicUsize::new(0),
            pending: Mutex::new(vec![]),
        }
    }

    fn respond(&self, callback: EuiccCallback) {
        if self.answered.fetch_add(1, Ordering::SeqCst) < self.responses {
            thread::spawn(move || callback(EuiccResult::ok()));
        } else {
            // Keep the callback alive so that it's never called.
            self.pending.lock().unwrap().push(callback);
        }
    }
}

impl EuiccManager for FakeEuicc {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn erase_subscriptions(&self, callback: EuiccCallback) {
        self.events.push("erase_subscriptions");
        self.respond(callback);
    }

    fn delete_subscription(&self, card_id: i32, subscription_id: i32, callback: EuiccCallback) {
        self.events
            .push(format!("delete_subscription {card_id} {subscription_id}"));
        self.respond(callback);
    }
}

pub struct FakeSubscriptions(pub Vec<SubscriptionInfo>);

impl SubscriptionManager for FakeSubscriptions {
    fn available_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.0.clone()
    }
}

pub struct FakeCheckpoint {
    pub events: Events,
    pub needs_checkpoint: bool,
    pub abort_succeeds: bool,
}

impl StorageCheckpoint for FakeCheckpoint {
    fn needs_checkpoint(&self) -> std::io::Result<bool> {
        Ok(self.needs_checkpoint)
    }

    fn abort_changes(&self, message: &str, retry: bool) -> std::io::Result<()> {
        self.events.push(format!("abort_changes {message} {retry}"));

        if self.abort_succeeds {
            Ok(())
        } else {
            Err(std::io::Error::other("vold is not running"))
        }
    }
}

pub fn invisible_subscription(subscription_id: i32) -> SubscriptionInfo {
    SubscriptionInfo {
        subscription_id,
        card_id: 1,
        embedded: true,
        group_uuid: Some("3f8a2c1e-5b7d-4e9f-a0c6-1d2b3e4f5a6b".to_owned()),
        opportunistic: true,
    }
}

/// The fakes behind a [`Services`] instance, kept around for inspection.
pub struct Fakes {
    pub events: Events,
    pub recovery: Arc<FakeRecovery>,
    pub power: Arc<FakePower>,
    pub euicc: Arc<FakeEuicc>,
    pub restricted: bool,
    pub subscriptions: Vec<SubscriptionInfo>,
    pub checkpoint: Arc<FakeCheckpoint>,
    pub settings: otarecovery::config::Config,
}

impl Fakes {
    pub fn new() -> Self {
        let events = Events::default();

        Self {
            recovery: Arc::new(FakeRecovery::new(&events)),
            power: Arc::new(FakePower {
                events: events.clone(),
                quiescent: false,
            }),
            euicc: Arc::new(FakeEuicc::new(&events, usize::MAX)),
            restricted: false,
            subscriptions: vec![],
            checkpoint: Arc::new(FakeCheckpoint {
                events: events.clone(),
                needs_checkpoint: false,
                abort_succeeds: true,
            }),
            settings: otarecovery::config::Config::default(),
            events,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            recovery: self.recovery.clone(),
            power: self.power.clone(),
            restrictions: Arc::new(FakeRestrictions(self.restricted)),
            broadcaster: Arc::new(FakeBroadcaster {
                events: self.events.clone(),
            }),
            euicc: Some(self.euicc.clone() as Arc<dyn EuiccManager>),
            subscriptions: Arc::new(FakeSubscriptions(self.subscriptions.clone())),
            settings: Arc::new(self.settings.clone()),
            checkpoint: self.checkpoint.clone(),
        }
    }
}
