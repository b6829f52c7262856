//! Storage-contract tests driven against the in-memory backend.

use aspen_core::{
    Authenticate, Command, CommandPayload, CommandResults, CommandStatus, EnrollId, EnrollType,
    Enrollment, Request, TokenUpdate,
};
use aspen_storage::{
    CheckinStore, CommandEnqueuer, CommandQueueStore, InMemStorage, PushInfoStore,
    TokenUpdateTallyStore,
};

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

// the enrollment header is unused at the storage layer; the request carries
// the normalized id
fn report(uuid: &str, status: CommandStatus) -> CommandResults {
    CommandResults {
        enrollment: Enrollment::default(),
        command_uuid: uuid.to_string(),
        status,
        error_chain: Vec::new(),
        raw: format!("<report>{uuid}:{status}</report>").into_bytes(),
    }
}

fn enroll(store: &InMemStorage, id: &EnrollId, topic: &str) {
    let req = request(id.clone());
    if id.parent_id.is_none() {
        let auth = Authenticate {
            enrollment: Enrollment::default(),
            topic: topic.to_string(),
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
        topic: topic.to_string(),
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
    let store = InMemStorage::new();
    let id = device_id("X");
    let req = request(id.clone());
    enroll(&store, &id, "com.apple.mgmt.X");

    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    store
        .enqueue_command(&[id.id.clone()], &command("CMD2"))
        .unwrap();

    // oldest pending first
    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");

    // NotNow keeps CMD1 in the queue but skips it when asked
    store
        .store_command_report(&req, &report("CMD1", CommandStatus::NotNow))
        .unwrap();
    let next = store.retrieve_next_command(&req, true).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD2");

    // an Idle-style fetch resurfaces the NotNow'd command (it is older)
    let next = store.retrieve_next_command(&req, false).unwrap().unwrap();
    assert_eq!(next.command_uuid, "CMD1");

    // terminal report finalizes CMD1
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
fn enqueued_command_returned_exactly_until_terminal_report() {
    let store = InMemStorage::new();
    let id = device_id("Y");
    let req = request(id.clone());
    enroll(&store, &id, "com.apple.mgmt.X");

    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    // repeated fetches return the same command until a report lands
    for _ in 0..3 {
        let next = store.retrieve_next_command(&req, true).unwrap().unwrap();
        assert_eq!(next.command_uuid, "CMD1");
        assert_eq!(next.raw, command("CMD1").raw);
    }
    store
        .store_command_report(&req, &report("CMD1", CommandStatus::Error))
        .unwrap();
    assert!(store.retrieve_next_command(&req, false).unwrap().is_none());
}

#[test]
fn idle_reports_never_mutate_the_queue() {
    let store = InMemStorage::new();
    let id = device_id("Z");
    let req = request(id.clone());
    enroll(&store, &id, "com.apple.mgmt.X");

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
fn duplicate_command_uuid_is_a_whole_batch_error() {
    let store = InMemStorage::new();
    let id = device_id("D");
    enroll(&store, &id, "com.apple.mgmt.X");
    store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .unwrap();
    assert!(store
        .enqueue_command(&[id.id.clone()], &command("CMD1"))
        .is_err());
}

#[test]
fn clear_queue_spares_terminal_results_and_covers_user_channels() {
    let store = InMemStorage::new();
    let device = device_id("D1");
    let user = user_id("D1", "U1");
    let device_req = request(device.clone());
    let user_req = request(user.clone());
    enroll(&store, &device, "com.apple.mgmt.X");
    enroll(&store, &user, "com.apple.mgmt.X");

    store
        .enqueue_command(&[device.id.clone(), user.id.clone()], &command("CMD1"))
        .unwrap();
    store
        .enqueue_command(&[device.id.clone()], &command("CMD2"))
        .unwrap();
    // CMD1 acknowledged on the device; still pending on the user channel
    store
        .store_command_report(&device_req, &report("CMD1", CommandStatus::Acknowledged))
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
    let store = InMemStorage::new();
    let device = device_id("D2");
    let user = user_id("D2", "U1");
    enroll(&store, &device, "com.apple.mgmt.X");
    enroll(&store, &user, "com.apple.mgmt.X");
    assert!(store.enabled(&device.id));
    assert!(store.enabled(&user.id));
    assert_eq!(store.retrieve_token_update_tally(&device.id).unwrap(), 1);

    store.disable(&request(device.clone())).unwrap();
    assert!(!store.enabled(&device.id));
    assert!(!store.enabled(&user.id));
    assert_eq!(store.retrieve_token_update_tally(&device.id).unwrap(), 0);

    // disabling twice yields identical state
    store.disable(&request(device.clone())).unwrap();
    assert!(!store.enabled(&device.id));
    assert_eq!(store.retrieve_token_update_tally(&user.id).unwrap(), 0);
}

#[test]
fn push_info_silently_skips_unknown_and_disabled_ids() {
    let store = InMemStorage::new();
    let a = device_id("A");
    let c = device_id("C");
    enroll(&store, &a, "com.apple.mgmt.X");
    enroll(&store, &c, "com.apple.mgmt.X");

    let infos = store
        .retrieve_push_info(&["A".into(), "B".into(), "C".into()])
        .unwrap();
    assert_eq!(infos.len(), 2);
    assert!(infos.contains_key("A"));
    assert!(!infos.contains_key("B"));
    assert_eq!(infos["C"].push_magic, "PM");
    assert_eq!(infos["C"].token_hex(), "deadbeef");

    store.disable(&request(a.clone())).unwrap();
    let infos = store.retrieve_push_info(&["A".into()]).unwrap();
    assert!(infos.is_empty());
}

#[test]
fn token_update_tally_counts_and_enables() {
    let store = InMemStorage::new();
    let id = device_id("T1");
    enroll(&store, &id, "com.apple.mgmt.X");
    assert_eq!(store.retrieve_token_update_tally(&id.id).unwrap(), 1);
    assert!(store.enabled(&id.id));

    // another TokenUpdate bumps the tally
    let req = request(id.clone());
    let token_update = TokenUpdate {
        enrollment: Enrollment::default(),
        topic: "com.apple.mgmt.X".into(),
        push_magic: "PM2".into(),
        token: vec![1, 2, 3],
        unlock_token: None,
        awaiting_configuration: false,
        raw: b"<tokupd2/>".to_vec(),
    };
    store.store_token_update(&req, &token_update).unwrap();
    assert_eq!(store.retrieve_token_update_tally(&id.id).unwrap(), 2);

    let infos = store.retrieve_push_info(&[id.id.clone()]).unwrap();
    assert_eq!(infos[&id.id].push_magic, "PM2");
}
