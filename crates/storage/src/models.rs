//! Database models for the SQLite backend.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::{
    cert_auth_associations, command_results, commands, devices, enrollment_queue, enrollments,
    push_certs, users,
};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = devices)]
pub struct DeviceRow {
    pub id: String,
    pub identity_cert_der: Option<Vec<u8>>,
    pub serial_number: Option<String>,
    pub authenticate_raw: Vec<u8>,
    pub token_update_raw: Option<Vec<u8>>,
    pub unlock_token: Option<Vec<u8>>,
    pub bootstrap_token: Option<Vec<u8>>,
    pub checkout_raw: Option<Vec<u8>>,
    pub authenticate_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = devices)]
pub struct NewDevice<'a> {
    pub id: &'a str,
    pub identity_cert_der: Option<&'a [u8]>,
    pub serial_number: Option<&'a str>,
    pub authenticate_raw: &'a [u8],
    pub authenticate_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
pub struct UserRow {
    pub id: String,
    pub device_id: String,
    pub token_update_raw: Option<Vec<u8>>,
    pub user_authenticate_raw: Option<Vec<u8>>,
    pub user_authenticate_digest_raw: Option<Vec<u8>>,
    pub checkout_raw: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = enrollments)]
pub struct EnrollmentRow {
    pub id: String,
    pub device_id: String,
    pub user_id: Option<String>,
    pub enroll_type: String,
    pub topic: String,
    pub push_magic: String,
    pub token: Vec<u8>,
    pub enabled: bool,
    pub token_update_tally: i64,
    pub enrolled_at: Option<NaiveDateTime>,
    pub last_seen_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = enrollments)]
pub struct NewEnrollment<'a> {
    pub id: &'a str,
    pub device_id: &'a str,
    pub user_id: Option<&'a str>,
    pub enroll_type: &'a str,
    pub topic: &'a str,
    pub push_magic: &'a str,
    pub token: &'a [u8],
    pub enabled: bool,
    pub token_update_tally: i64,
    pub enrolled_at: Option<NaiveDateTime>,
    pub last_seen_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commands)]
pub struct NewCommand<'a> {
    pub command_uuid: &'a str,
    pub request_type: &'a str,
    pub command: &'a [u8],
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = enrollment_queue)]
pub struct NewQueueItem<'a> {
    pub enrollment_id: &'a str,
    pub command_uuid: &'a str,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = command_results)]
pub struct NewCommandResult<'a> {
    pub enrollment_id: &'a str,
    pub command_uuid: &'a str,
    pub status: &'a str,
    pub result: &'a [u8],
    pub not_now_at: Option<NaiveDateTime>,
    pub not_now_tally: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = cert_auth_associations)]
pub struct NewCertAuthAssociation<'a> {
    pub enrollment_id: &'a str,
    pub sha256: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = push_certs)]
pub struct NewPushCert<'a> {
    pub topic: &'a str,
    pub cert_pem: &'a [u8],
    pub key_pem: &'a [u8],
    pub stale_token: i64,
}
