//! Diesel schema definitions.

diesel::table! {
    devices (id) {
        id -> Text,
        identity_cert_der -> Nullable<Binary>,
        serial_number -> Nullable<Text>,
        authenticate_raw -> Binary,
        token_update_raw -> Nullable<Binary>,
        unlock_token -> Nullable<Binary>,
        bootstrap_token -> Nullable<Binary>,
        checkout_raw -> Nullable<Binary>,
        authenticate_at -> Timestamp,
    }
}

diesel::table! {
    users (id) {
        id -> Text,
        device_id -> Text,
        token_update_raw -> Nullable<Binary>,
        user_authenticate_raw -> Nullable<Binary>,
        user_authenticate_digest_raw -> Nullable<Binary>,
        checkout_raw -> Nullable<Binary>,
    }
}

diesel::table! {
    enrollments (id) {
        id -> Text,
        device_id -> Text,
        user_id -> Nullable<Text>,
        enroll_type -> Text,
        topic -> Text,
        push_magic -> Text,
        token -> Binary,
        enabled -> Bool,
        token_update_tally -> BigInt,
        enrolled_at -> Nullable<Timestamp>,
        last_seen_at -> Timestamp,
    }
}

diesel::table! {
    commands (command_uuid) {
        command_uuid -> Text,
        request_type -> Text,
        command -> Binary,
        created_at -> Timestamp,
    }
}

diesel::table! {
    enrollment_queue (id) {
        id -> Integer,
        enrollment_id -> Text,
        command_uuid -> Text,
        active -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    command_results (id) {
        id -> Integer,
        enrollment_id -> Text,
        command_uuid -> Text,
        status -> Text,
        result -> Binary,
        not_now_at -> Nullable<Timestamp>,
        not_now_tally -> BigInt,
    }
}

diesel::table! {
    cert_auth_associations (enrollment_id) {
        enrollment_id -> Text,
        sha256 -> Text,
    }
}

diesel::table! {
    push_certs (topic) {
        topic -> Text,
        cert_pem -> Binary,
        key_pem -> Binary,
        stale_token -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    devices,
    users,
    enrollments,
    commands,
    enrollment_queue,
    command_results,
    cert_auth_associations,
    push_certs,
);
