//! In-memory storage backend.
//!
//! The reference backend for tests and single-process deployments. All
//! state lives behind one mutex; every trait operation takes the lock once,
//! which also provides the per-(ID, command UUID) atomicity the queue
//! contract requires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use aspen_core::{
    Authenticate, BootstrapToken, CheckinMessage, Command, CommandPayload, CommandResults,
    CommandStatus, EnrollType, GetBootstrapToken, Push, Request, SetBootstrapToken, TokenUpdate,
    UserAuthenticate,
};
use chrono::{DateTime, Utc};

use crate::{
    BootstrapTokenStore, CertAuthRetriever, CertAuthStore, CheckinStore, CommandEnqueuer,
    CommandQueueStore, DeviceChannelOnly, EnqueueIdErrors, PushCert, PushCertStore, PushInfoStore,
    StoreMigrator, TokenUpdateTallyStore,
};

#[derive(Debug, Default)]
struct DeviceRecord {
    identity_cert_der: Option<Vec<u8>>,
    serial_number: Option<String>,
    authenticate_raw: Vec<u8>,
    token_update_raw: Option<Vec<u8>>,
    unlock_token: Option<Vec<u8>>,
    bootstrap_token: Option<Vec<u8>>,
    checkout_raw: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct UserRecord {
    device_id: String,
    token_update_raw: Option<Vec<u8>>,
    user_authenticate_raw: Option<Vec<u8>>,
    user_authenticate_digest_raw: Option<Vec<u8>>,
    checkout_raw: Option<Vec<u8>>,
}

#[derive(Debug)]
struct EnrollmentRecord {
    enroll_type: EnrollType,
    device_id: String,
    topic: String,
    push_magic: String,
    token: Vec<u8>,
    enabled: bool,
    token_update_tally: i64,
    enrolled_at: Option<DateTime<Utc>>,
    last_seen_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredCommand {
    request_type: String,
    raw: Vec<u8>,
}

#[derive(Debug)]
struct QueueItem {
    uuid: String,
    active: bool,
}

#[derive(Debug)]
struct ResultRecord {
    status: CommandStatus,
    raw: Vec<u8>,
    not_now_at: Option<DateTime<Utc>>,
    not_now_tally: i64,
}

#[derive(Debug)]
struct PushCertRecord {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    stale_token: u64,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<String, DeviceRecord>,
    users: HashMap<String, UserRecord>,
    enrollments: HashMap<String, EnrollmentRecord>,
    commands: HashMap<String, StoredCommand>,
    queues: HashMap<String, Vec<QueueItem>>,
    results: HashMap<(String, String), ResultRecord>,
    cert_auth: HashMap<String, String>,
    cert_auth_reverse: HashMap<String, String>,
    push_certs: HashMap<String, PushCertRecord>,
}

/// In-memory storage backend.
#[derive(Clone, Default)]
pub struct InMemStorage {
    inner: Arc<Mutex<Inner>>,
}

impl InMemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the enrollment is currently enabled.
    pub fn enabled(&self, id: &str) -> bool {
        self.lock()
            .enrollments
            .get(id)
            .map(|e| e.enabled)
            .unwrap_or(false)
    }
}

impl Inner {
    fn touch(&mut self, id: &str) {
        if let Some(e) = self.enrollments.get_mut(id) {
            e.last_seen_at = Utc::now();
        }
    }

    fn user_channel_ids(&self, device_id: &str) -> Vec<String> {
        self.enrollments
            .iter()
            .filter(|(id, e)| e.device_id == device_id && id.as_str() != device_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn disable_one(&mut self, id: &str) {
        if let Some(e) = self.enrollments.get_mut(id) {
            e.enabled = false;
            e.token_update_tally = 0;
        }
    }

    fn clear_one_queue(&mut self, id: &str) {
        let Some(queue) = self.queues.get_mut(id) else {
            return;
        };
        for item in queue.iter_mut().filter(|i| i.active) {
            let terminal = self
                .results
                .get(&(id.to_string(), item.uuid.clone()))
                .map(|r| r.status.is_terminal())
                .unwrap_or(false);
            if !terminal {
                item.active = false;
            }
        }
    }
}

impl CheckinStore for InMemStorage {
    fn store_authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut inner = self.lock();
        let device = inner.devices.entry(id.id.clone()).or_default();
        device.identity_cert_der = req.certificate.clone();
        if msg.serial_number.is_some() {
            device.serial_number = msg.serial_number.clone();
        }
        device.authenticate_raw = msg.raw.clone();
        device.token_update_raw = None;
        // a fresh enrollment must not inherit the previous escrow
        device.bootstrap_token = None;
        inner.touch(&id.id);
        Ok(())
    }

    fn store_token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut inner = self.lock();
        match &id.parent_id {
            Some(parent) => {
                if msg.unlock_token.is_some() {
                    tracing::info!(enrollment_id = %id.id, "UnlockToken on user channel not stored");
                }
                let user = inner.users.entry(id.id.clone()).or_default();
                user.device_id = parent.clone();
                user.token_update_raw = Some(msg.raw.clone());
            }
            None => {
                let device = inner.devices.entry(id.id.clone()).or_default();
                if let Some(unlock) = &msg.unlock_token {
                    device.unlock_token = Some(unlock.to_vec());
                }
                device.token_update_raw = Some(msg.raw.clone());
            }
        }

        let device_id = id.device_channel_id().to_string();
        let now = Utc::now();
        let entry = inner
            .enrollments
            .entry(id.id.clone())
            .or_insert_with(|| EnrollmentRecord {
                enroll_type: id.enroll_type,
                device_id: device_id.clone(),
                topic: String::new(),
                push_magic: String::new(),
                token: Vec::new(),
                enabled: false,
                token_update_tally: 0,
                enrolled_at: None,
                last_seen_at: now,
            });
        entry.enroll_type = id.enroll_type;
        entry.device_id = device_id;
        entry.topic = msg.topic.clone();
        entry.push_magic = msg.push_magic.clone();
        entry.token = msg.token.clone();
        entry.enabled = true;
        entry.token_update_tally += 1;
        if entry.token_update_tally == 1 {
            entry.enrolled_at = Some(now);
        }
        entry.last_seen_at = now;
        Ok(())
    }

    fn store_user_authenticate(
        &self,
        req: &Request,
        msg: &UserAuthenticate,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let parent = id
            .parent_id
            .clone()
            .ok_or_else(|| color_eyre::eyre::eyre!("UserAuthenticate on a device channel"))?;
        let mut inner = self.lock();
        let user = inner.users.entry(id.id.clone()).or_default();
        user.device_id = parent;
        if msg.digest_response.is_empty() {
            user.user_authenticate_raw = Some(msg.raw.clone());
        } else {
            user.user_authenticate_digest_raw = Some(msg.raw.clone());
        }
        inner.touch(&id.id);
        Ok(())
    }

    fn store_checkout(
        &self,
        req: &Request,
        msg: &aspen_core::CheckOut,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut inner = self.lock();
        match &id.parent_id {
            Some(parent) => {
                let user = inner.users.entry(id.id.clone()).or_default();
                user.device_id = parent.clone();
                user.checkout_raw = Some(msg.raw.clone());
            }
            None => {
                inner.devices.entry(id.id.clone()).or_default().checkout_raw =
                    Some(msg.raw.clone());
            }
        }
        inner.touch(&id.id);
        Ok(())
    }

    fn disable(&self, req: &Request) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut inner = self.lock();
        inner.disable_one(&id.id);
        for user_id in inner.user_channel_ids(&id.id) {
            inner.disable_one(&user_id);
        }
        Ok(())
    }
}

impl CommandQueueStore for InMemStorage {
    fn store_command_report(
        &self,
        req: &Request,
        report: &CommandResults,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut inner = self.lock();
        inner.touch(&id.id);
        if report.status == CommandStatus::Idle {
            return Ok(());
        }
        if report.command_uuid.is_empty() {
            color_eyre::eyre::bail!("empty command UUID");
        }
        let key = (id.id.clone(), report.command_uuid.clone());
        match inner.results.get_mut(&key) {
            Some(existing) => {
                existing.status = report.status;
                existing.raw = report.raw.clone();
                if report.status == CommandStatus::NotNow {
                    // not_now_at keeps the first NotNow only
                    existing.not_now_tally += 1;
                }
            }
            None => {
                let not_now = report.status == CommandStatus::NotNow;
                inner.results.insert(
                    key,
                    ResultRecord {
                        status: report.status,
                        raw: report.raw.clone(),
                        not_now_at: not_now.then(Utc::now),
                        not_now_tally: i64::from(not_now),
                    },
                );
            }
        }
        Ok(())
    }

    fn retrieve_next_command(
        &self,
        req: &Request,
        skip_not_now: bool,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        let id = req.require_enroll_id()?;
        let inner = self.lock();
        let Some(queue) = inner.queues.get(&id.id) else {
            return Ok(None);
        };
        for item in queue.iter().filter(|i| i.active) {
            let status = inner
                .results
                .get(&(id.id.clone(), item.uuid.clone()))
                .map(|r| r.status);
            let eligible = match status {
                None => true,
                Some(CommandStatus::NotNow) => !skip_not_now,
                Some(_) => false,
            };
            if !eligible {
                continue;
            }
            let Some(stored) = inner.commands.get(&item.uuid) else {
                continue;
            };
            return Ok(Some(Command {
                command_uuid: item.uuid.clone(),
                command: CommandPayload {
                    request_type: stored.request_type.clone(),
                },
                raw: stored.raw.clone(),
            }));
        }
        Ok(None)
    }

    fn clear_queue(&self, req: &Request) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut inner = self.lock();
        inner.clear_one_queue(&id.id);
        for user_id in inner.user_channel_ids(&id.id) {
            inner.clear_one_queue(&user_id);
        }
        Ok(())
    }
}

impl CommandEnqueuer for InMemStorage {
    fn enqueue_command(
        &self,
        ids: &[String],
        cmd: &Command,
    ) -> color_eyre::eyre::Result<EnqueueIdErrors> {
        if ids.is_empty() {
            color_eyre::eyre::bail!("no id(s) supplied to queue command to");
        }
        let mut inner = self.lock();
        if inner.commands.contains_key(&cmd.command_uuid) {
            color_eyre::eyre::bail!("command already exists: {}", cmd.command_uuid);
        }
        inner.commands.insert(
            cmd.command_uuid.clone(),
            StoredCommand {
                request_type: cmd.command.request_type.clone(),
                raw: cmd.raw.clone(),
            },
        );
        for id in ids {
            inner.queues.entry(id.clone()).or_default().push(QueueItem {
                uuid: cmd.command_uuid.clone(),
                active: true,
            });
        }
        Ok(EnqueueIdErrors::new())
    }
}

impl PushInfoStore for InMemStorage {
    fn retrieve_push_info(
        &self,
        ids: &[String],
    ) -> color_eyre::eyre::Result<HashMap<String, Push>> {
        if ids.is_empty() {
            color_eyre::eyre::bail!("no ids provided");
        }
        let inner = self.lock();
        let mut out = HashMap::new();
        for id in ids {
            let Some(e) = inner.enrollments.get(id) else {
                continue;
            };
            if !e.enabled || e.topic.is_empty() || e.push_magic.is_empty() || e.token.is_empty() {
                continue;
            }
            out.insert(
                id.clone(),
                Push {
                    topic: e.topic.clone(),
                    push_magic: e.push_magic.clone(),
                    token: e.token.clone(),
                },
            );
        }
        Ok(out)
    }
}

impl PushCertStore for InMemStorage {
    fn store_push_cert(
        &self,
        pem_cert: &[u8],
        pem_key: &[u8],
    ) -> color_eyre::eyre::Result<String> {
        let topic = aspen_crypto::topic_from_pem_cert(pem_cert)?;
        let mut inner = self.lock();
        match inner.push_certs.get_mut(&topic) {
            Some(existing) => {
                existing.cert_pem = pem_cert.to_vec();
                existing.key_pem = pem_key.to_vec();
                existing.stale_token += 1;
            }
            None => {
                inner.push_certs.insert(
                    topic.clone(),
                    PushCertRecord {
                        cert_pem: pem_cert.to_vec(),
                        key_pem: pem_key.to_vec(),
                        stale_token: 0,
                    },
                );
            }
        }
        Ok(topic)
    }

    fn retrieve_push_cert(&self, topic: &str) -> color_eyre::eyre::Result<Option<PushCert>> {
        let inner = self.lock();
        Ok(inner.push_certs.get(topic).map(|r| PushCert {
            cert_pem: r.cert_pem.clone(),
            key_pem: r.key_pem.clone(),
            stale_token: r.stale_token.to_string(),
        }))
    }

    fn is_push_cert_stale(
        &self,
        topic: &str,
        stale_token: &str,
    ) -> color_eyre::eyre::Result<bool> {
        let inner = self.lock();
        match inner.push_certs.get(topic) {
            Some(r) => Ok(r.stale_token.to_string() != stale_token),
            None => Ok(true),
        }
    }
}

impl CertAuthStore for InMemStorage {
    fn has_cert_hash(&self, _req: &Request, hash: &str) -> color_eyre::eyre::Result<bool> {
        Ok(self
            .lock()
            .cert_auth_reverse
            .contains_key(&hash.to_lowercase()))
    }

    fn enrollment_has_cert_hash(&self, req: &Request) -> color_eyre::eyre::Result<bool> {
        let id = req.require_enroll_id()?;
        Ok(self.lock().cert_auth.contains_key(&id.id))
    }

    fn is_cert_hash_associated(
        &self,
        req: &Request,
        hash: &str,
    ) -> color_eyre::eyre::Result<bool> {
        let id = req.require_enroll_id()?;
        Ok(self
            .lock()
            .cert_auth
            .get(&id.id)
            .map(|h| *h == hash.to_lowercase())
            .unwrap_or(false))
    }

    fn associate_cert_hash(&self, req: &Request, hash: &str) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let hash = hash.to_lowercase();
        let mut inner = self.lock();
        if let Some(previous) = inner.cert_auth.insert(id.id.clone(), hash.clone()) {
            inner.cert_auth_reverse.remove(&previous);
        }
        inner.cert_auth_reverse.insert(hash, id.id.clone());
        Ok(())
    }
}

impl CertAuthRetriever for InMemStorage {
    fn enrollment_from_hash(&self, hash: &str) -> color_eyre::eyre::Result<Option<String>> {
        Ok(self
            .lock()
            .cert_auth_reverse
            .get(&hash.to_lowercase())
            .cloned())
    }
}

impl BootstrapTokenStore for InMemStorage {
    fn store_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut inner = self.lock();
        inner
            .devices
            .entry(id.id.clone())
            .or_default()
            .bootstrap_token = Some(msg.bootstrap_token.clone());
        inner.touch(&id.id);
        Ok(())
    }

    fn retrieve_bootstrap_token(
        &self,
        req: &Request,
        _msg: &GetBootstrapToken,
    ) -> color_eyre::eyre::Result<Option<BootstrapToken>> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut inner = self.lock();
        inner.touch(&id.id);
        Ok(inner
            .devices
            .get(&id.id)
            .and_then(|d| d.bootstrap_token.clone())
            .map(|token| BootstrapToken {
                bootstrap_token: token,
            }))
    }
}

impl TokenUpdateTallyStore for InMemStorage {
    fn retrieve_token_update_tally(&self, id: &str) -> color_eyre::eyre::Result<i64> {
        Ok(self
            .lock()
            .enrollments
            .get(id)
            .map(|e| e.token_update_tally)
            .unwrap_or(0))
    }
}

impl StoreMigrator for InMemStorage {
    fn retrieve_migration_checkins(
        &self,
        visit: &mut dyn FnMut(CheckinMessage) -> color_eyre::eyre::Result<()>,
    ) -> color_eyre::eyre::Result<()> {
        // collect under the lock, visit after releasing it so the visitor
        // can drive services backed by this same store
        let mut messages = Vec::new();
        let inner = self.lock();
        let mut device_ids: Vec<&String> = inner.devices.keys().collect();
        device_ids.sort();
        for device_id in device_ids {
            let enabled = inner
                .enrollments
                .get(device_id)
                .map(|e| e.enabled)
                .unwrap_or(false);
            if !enabled {
                continue;
            }
            let device = &inner.devices[device_id];
            let Ok(auth) = aspen_core::decode_checkin(&device.authenticate_raw) else {
                continue;
            };
            let Some(token_update_raw) = &device.token_update_raw else {
                continue;
            };
            let Ok(token_update) = aspen_core::decode_checkin(token_update_raw) else {
                continue;
            };
            messages.push(auth);
            messages.push(token_update);
            if let Some(bs_token) = &device.bootstrap_token {
                messages.push(synthesize_bootstrap_token(device_id, bs_token)?);
            }

            let mut user_ids: Vec<&String> = inner
                .users
                .iter()
                .filter(|(_, u)| u.device_id == **device_id)
                .map(|(id, _)| id)
                .collect();
            user_ids.sort();
            for user_id in user_ids {
                let user_enabled = inner
                    .enrollments
                    .get(user_id)
                    .map(|e| e.enabled)
                    .unwrap_or(false);
                if !user_enabled {
                    continue;
                }
                let user = &inner.users[user_id];
                for raw in [
                    &user.user_authenticate_raw,
                    &user.user_authenticate_digest_raw,
                    &user.token_update_raw,
                ]
                .into_iter()
                .flatten()
                {
                    if let Ok(msg) = aspen_core::decode_checkin(raw) {
                        messages.push(msg);
                    }
                }
            }
        }
        drop(inner);
        for msg in messages {
            visit(msg)?;
        }
        Ok(())
    }
}

/// Build a SetBootstrapToken message from an escrowed token and device ID.
fn synthesize_bootstrap_token(
    device_id: &str,
    token: &[u8],
) -> color_eyre::eyre::Result<CheckinMessage> {
    use color_eyre::eyre::WrapErr as _;

    #[derive(serde::Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Wire<'a> {
        message_type: &'static str,
        #[serde(rename = "UDID")]
        udid: &'a str,
        #[serde(with = "serde_bytes_ref")]
        bootstrap_token: &'a [u8],
    }
    mod serde_bytes_ref {
        pub fn serialize<S: serde::Serializer>(b: &&[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_bytes(b)
        }
    }

    let mut raw = Vec::new();
    plist::to_writer_xml(
        &mut raw,
        &Wire {
            message_type: "SetBootstrapToken",
            udid: device_id,
            bootstrap_token: token,
        },
    )
    .wrap_err("synthesizing SetBootstrapToken")?;
    aspen_core::decode_checkin(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspen_core::EnrollId;

    fn device_request(id: &str) -> Request {
        Request::new().with_enroll_id(EnrollId {
            enroll_type: EnrollType::Device,
            id: id.to_string(),
            parent_id: None,
        })
    }

    #[test]
    fn push_cert_stale_token_changes_on_rotation() {
        let store = InMemStorage::new();
        // no cert at all is always stale
        assert!(store.is_push_cert_stale("com.apple.mgmt.X", "0").unwrap());
    }

    #[test]
    fn clear_queue_rejects_user_channel() {
        let store = InMemStorage::new();
        let req = Request::new().with_enroll_id(EnrollId {
            enroll_type: EnrollType::User,
            id: "D:U".into(),
            parent_id: Some("D".into()),
        });
        let err = store.clear_queue(&req).unwrap_err();
        assert!(aspen_core::find_in_chain::<DeviceChannelOnly>(&err).is_some());
    }

    #[test]
    fn bootstrap_token_round_trip_and_clear_on_authenticate() {
        let store = InMemStorage::new();
        let req = device_request("D1");
        let set = SetBootstrapToken {
            enrollment: Default::default(),
            bootstrap_token: b"tok".to_vec(),
            raw: Vec::new(),
        };
        store.store_bootstrap_token(&req, &set).unwrap();
        let get = GetBootstrapToken {
            enrollment: Default::default(),
            raw: Vec::new(),
        };
        let token = store.retrieve_bootstrap_token(&req, &get).unwrap().unwrap();
        assert_eq!(token.bootstrap_token, b"tok");

        let auth = Authenticate {
            enrollment: Default::default(),
            topic: "com.apple.mgmt.X".into(),
            serial_number: Some("S1".into()),
            build_version: None,
            os_version: None,
            product_name: None,
            model: None,
            model_name: None,
            device_name: None,
            raw: b"<plist/>".to_vec(),
        };
        store.store_authenticate(&req, &auth).unwrap();
        assert!(store.retrieve_bootstrap_token(&req, &get).unwrap().is_none());
    }

    #[test]
    fn cert_hash_association_overwrites_and_reindexes() {
        let store = InMemStorage::new();
        let req = device_request("D1");
        store.associate_cert_hash(&req, "AAAA").unwrap();
        assert!(store.is_cert_hash_associated(&req, "aaaa").unwrap());
        assert_eq!(
            store.enrollment_from_hash("aaaa").unwrap().as_deref(),
            Some("D1")
        );
        store.associate_cert_hash(&req, "bbbb").unwrap();
        assert!(!store.is_cert_hash_associated(&req, "aaaa").unwrap());
        assert!(store.enrollment_from_hash("aaaa").unwrap().is_none());
        assert_eq!(
            store.enrollment_from_hash("bbbb").unwrap().as_deref(),
            Some("D1")
        );
    }
}
