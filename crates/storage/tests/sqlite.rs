//! Storage-contract tests driven against the SQLite backend.

use std::sync::atomic::{AtomicUsize, Ordering};

use aspen_core::{
    Authenticate, Command, CommandPayload, CommandResults, CommandStatus, EnrollId, EnrollType,
    Enrollment, Request, TokenUpdate,
};
use aspen_storage::{
    BootstrapTokenStore, CertAuthStore, CheckinStore, CommandEnqueuer, CommandQueueStore,
    PushInfoStore, SqliteStorage, TokenUpdateTallyStore,
};

static DB_SEQ: AtomicUsize = AtomicUsize::new(0);

struct TestDb {
    path: std::path::PathBuf,
    store: SqliteStorage,
}

impl TestDb {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!(
            "aspen-sqlite-test-{}-{}.db",
            std::process::id(),
            DB_SEQ.fetch_add(1, Ordering::SeqCst),
        ));
        let _ = std::fs::remove_file(&path);
        let store = SqliteStorage::new(path.to_str().unwrap()).unwrap();
        store.run_migrations().unwrap();
        Self { path, store }
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn device_id(id: &str) -> EnrollId {
    EnrollId {
        enroll_type: EnrollType::Device,
        id: id.to_string(),
        parent_id: None,
    }
}

fn user_id(device: &str, user: &str) -> EnrollId {
    EnrollId {
        enroll_type: EnrollType::User,
        id: format!("{device}:{user}"),
        parent_id: Some(device.to_string()),
    }
}

fn request(id: EnrollId) -> Request {
    Request::new().with_enroll_id(id)
}

fn command(uuid: &str) -> Command {
    Command {
        command_uuid: uuid.to_string(),
        command: CommandPayload {
            request_type: uuid.to_string(),
        },
        raw: format!("<plist>{uuid}</plist>").into_bytes(),
    }
}

fn report(uuid: &str, status: CommandStatus) -> CommandResults {
    CommandResults {
        enrollment: Enrollment::default(),
        command_uuid: uuid.to_string(),
        status,
        error_chain: Vec::new(),
        raw: format!("<report>{uuid}:{status}</report>").into_bytes(),
    }
}

fn enroll(store: &SqliteStorage, id: &EnrollId) {
    let req = request(id.clone());
    if id.parent_id.is_none() {
        let auth = Authenticate {
            enrollment: Enrollment::default(),
            topic: "com.apple.mgmt.X".into(),
            serial_number: Some("S1".into()),
            build_version: None,
            os_version: None,
            product_name: None,
            model: None,
            model_name: None,
            device_name: None,
            raw: b"<auth/>".to_vec(),
        };
        store.store_authenticate(&req, &auth).unwrap();
    }
    let token_update = TokenUpdate {
        enrollment: Enrollment::default(),
        topic: "com.apple.mgmt.X".into(),
        push_magic: "PM".into(),
        token: vec![0xde, 0xad, 0xbe, 0xef],
        unlock_token: None,
        awaiting_configuration: false,
        raw: b"<tokupd/>".to_vec(),
    };
    store.store_token_update(&req, &token_update).unwrap();
}

#[test]
fn queue_is_fifo_with_not_now_semantics() {
    let db = TestDb::new();
    let store = &db.store;
    let id = device_id("X");
    let req = request(id.clone());
    enroll(store, &id);

    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    store
        .enqueue_command(&[id.id.clone()], &command("CMD2"))
        .unwrap();

    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");
    assert_eq!(next.raw, command("CMD1").raw);

    store
        .store_command_report(&req, &report("CMD1", CommandStatus::NotNow))
        .unwrap();
    let next = store.retrieve_next_command(&req, true).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD2");
    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");

    store
        .store_command_report(&req, &report("CMD1", CommandStatus::Acknowledged))
        .unwrap();
    let next = store.retrieve_next_command(&req, true).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD2");
    store
        .store_command_report(&req, &report("CMD2", CommandStatus::Acknowledged))
        .unwrap();
    assert!(store.retrieve_next_command(&req, false).unwrap().is_none());
}

#[test]
fn idle_reports_never_mutate_the_queue() {
    let db = TestDb::new();
    let store = &db.store;
    let id = device_id("Z");
    let req = request(id.clone());
    enroll(store, &id);

    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    store
        .store_command_report(&req, &report("", CommandStatus::Idle))
        .unwrap();
    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");
}

#[test]
fn clear_queue_covers_user_channels() {
    let db = TestDb::new();
    let store = &db.store;
    let device = device_id("D1");
    let user = user_id("D1", "U1");
    let device_req = request(device.clone());
    let user_req = request(user.clone());
    enroll(store, &device);
    enroll(store, &user);

    store
        .enqueue_command(&[device.id.clone(), user.id.clone()], &command("CMD1"))
        .unwrap();
    store.clear_queue(&device_req).unwrap();

    assert!(store
        .retrieve_next_command(&device_req, false)
        .unwrap()
        .is_none());
    assert!(store
        .retrieve_next_command(&user_req, false)
        .unwrap()
        .is_none());
}

#[test]
fn disable_cascades_and_resets_tally() {
    let db = TestDb::new();
    let store = &db.store;
    let device = device_id("D2");
    let user = user_id("D2", "U1");
    enroll(store, &device);
    enroll(store, &user);
    assert!(store.enabled(&device.id).unwrap());
    assert!(store.enabled(&user.id).unwrap());
    assert_eq!(store.retrieve_token_update_tally(&device.id).unwrap(), 1);

    store.disable(&request(device.clone())).unwrap();
    assert!(!store.enabled(&device.id).unwrap());
    assert!(!store.enabled(&user.id).unwrap());
    assert_eq!(store.retrieve_token_update_tally(&device.id).unwrap(), 0);

    // re-enrolling starts the tally over
    enroll(store, &device);
    assert_eq!(store.retrieve_token_update_tally(&device.id).unwrap(), 1);
}

#[test]
fn push_info_silently_skips_unknown_ids() {
    let db = TestDb::new();
    let store = &db.store;
    let a = device_id("A");
    enroll(store, &a);

    let infos = store
        .retrieve_push_info(&["A".into(), "B".into()])
        .unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos["A"].push_magic, "PM");
    assert_eq!(infos["A"].token_hex(), "deadbeef");
}

#[test]
fn cert_hash_association_round_trip() {
    let db = TestDb::new();
    let store = &db.store;
    let id = device_id("C1");
    let req = request(id.clone());
    enroll(store, &id);

    assert!(!store.enrollment_has_cert_hash(&req).unwrap());
    store.associate_cert_hash(&req, "ABCD").unwrap();
    assert!(store.enrollment_has_cert_hash(&req).unwrap());
    assert!(store.is_cert_hash_associated(&req, "abcd").unwrap());
    assert!(store.has_cert_hash(&req, "abcd").unwrap());
    assert!(!store.is_cert_hash_associated(&req, "ffff").unwrap());
}

#[test]
fn bootstrap_token_cleared_on_reenrollment() {
    let db = TestDb::new();
    let store = &db.store;
    let id = device_id("B1");
    let req = request(id.clone());
    enroll(store, &id);

    let set = aspen_core::SetBootstrapToken {
        enrollment: Enrollment::default(),
        bootstrap_token: b"tok".to_vec(),
        raw: b"<bst/>".to_vec(),
    };
    store.store_bootstrap_token(&req, &set).unwrap();
    let get = aspen_core::GetBootstrapToken {
        enrollment: Enrollment::default(),
        raw: Vec::new(),
    };
    assert_eq!(
        store
            .retrieve_bootstrap_token(&req, &get)
            .unwrap()
            .unwrap()
            .bootstrap_token,
        b"tok"
    );

    enroll(store, &id);
    assert!(store.retrieve_bootstrap_token(&req, &get).unwrap().is_none());
}

#[test]
fn deletion_mode_garbage_collects_completed_commands() {
    let db = TestDb::new();
    let store = db.store.clone().with_command_deletion(true);
    let id = device_id("RM");
    let req = request(id.clone());
    enroll(&store, &id);

    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");

    store
        .store_command_report(&req, &report("CMD1", CommandStatus::Acknowledged))
        .unwrap();
    assert!(store.retrieve_next_command(&req, false).unwrap().is_none());

    // the same UUID can be enqueued again once the body was collected
    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");
}
