//! SQLite storage backend (Diesel + r2d2 pooling).

use std::collections::HashMap;

use aspen_core::{
    Authenticate, BootstrapToken, CheckOut, CheckinMessage, Command, CommandPayload,
    CommandResults, CommandStatus, GetBootstrapToken, Push, Request, SetBootstrapToken,
    TokenUpdate, UserAuthenticate,
};
use chrono::Utc;
use color_eyre::eyre::WrapErr as _;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;

use crate::models::*;
use crate::schema::*;
use crate::traits::*;

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
type Conn = PooledConnection<ConnectionManager<SqliteConnection>>;

const NOT_NOW: &str = "NotNow";

/// SQLite-backed storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    delete_commands: bool,
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database URL.
    pub fn new(database_url: &str) -> color_eyre::eyre::Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .wrap_err("creating connection pool")?;
        Ok(Self {
            pool,
            delete_commands: false,
        })
    }

    /// Hard-delete command attachments (and unreferenced command bodies) on
    /// terminal results instead of retaining them for audit.
    pub fn with_command_deletion(mut self, delete: bool) -> Self {
        self.delete_commands = delete;
        self
    }

    pub fn run_migrations(&self) -> color_eyre::eyre::Result<()> {
        use diesel_migrations::MigrationHarness as _;

        let mut conn = self.conn()?;
        conn.run_pending_migrations(crate::MIGRATIONS)
            .map_err(|e| color_eyre::eyre::eyre!("running migrations: {e}"))?;
        Ok(())
    }

    fn conn(&self) -> color_eyre::eyre::Result<Conn> {
        self.pool.get().wrap_err("getting database connection")
    }

    /// Whether the enrollment is currently enabled.
    pub fn enabled(&self, id: &str) -> color_eyre::eyre::Result<bool> {
        let mut conn = self.conn()?;
        let enabled: Option<bool> = enrollments::table
            .filter(enrollments::id.eq(id))
            .select(enrollments::enabled)
            .first(&mut conn)
            .optional()
            .wrap_err("reading enabled flag")?;
        Ok(enabled.unwrap_or(false))
    }

    fn update_last_seen(&self, conn: &mut Conn, id: &str) -> QueryResult<()> {
        diesel::update(enrollments::table.filter(enrollments::id.eq(id)))
            .set(enrollments::last_seen_at.eq(Utc::now().naive_utc()))
            .execute(conn)?;
        Ok(())
    }

    /// The device itself plus any user-channel enrollments parented to it.
    fn channel_ids(&self, conn: &mut Conn, device_id: &str) -> QueryResult<Vec<String>> {
        let mut ids: Vec<String> = enrollments::table
            .filter(enrollments::device_id.eq(device_id))
            .select(enrollments::id)
            .load(conn)?;
        if !ids.iter().any(|i| i == device_id) {
            ids.push(device_id.to_string());
        }
        Ok(ids)
    }
}

impl CheckinStore for SqliteStorage {
    fn store_authenticate(
        &self,
        req: &Request,
        msg: &Authenticate,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        let now = Utc::now().naive_utc();

        let row = NewDevice {
            id: &id.id,
            identity_cert_der: req.certificate.as_deref(),
            serial_number: msg.serial_number.as_deref(),
            authenticate_raw: &msg.raw,
            authenticate_at: now,
        };
        diesel::insert_into(devices::table)
            .values(&row)
            .on_conflict(devices::id)
            .do_update()
            .set((
                devices::identity_cert_der.eq(req.certificate.as_deref()),
                devices::serial_number.eq(msg.serial_number.as_deref()),
                devices::authenticate_raw.eq(&msg.raw[..]),
                devices::token_update_raw.eq(None::<Vec<u8>>),
                devices::bootstrap_token.eq(None::<Vec<u8>>),
                devices::authenticate_at.eq(now),
            ))
            .execute(&mut conn)
            .wrap_err("storing authenticate")?;
        self.update_last_seen(&mut conn, &id.id)
            .wrap_err("updating last seen")?;
        Ok(())
    }

    fn store_token_update(
        &self,
        req: &Request,
        msg: &TokenUpdate,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        let now = Utc::now().naive_utc();

        match &id.parent_id {
            Some(parent) => {
                if msg.unlock_token.is_some() {
                    tracing::info!(enrollment_id = %id.id, "UnlockToken on user channel not stored");
                }
                diesel::insert_into(users::table)
                    .values((
                        users::id.eq(&id.id),
                        users::device_id.eq(parent),
                        users::token_update_raw.eq(Some(&msg.raw[..])),
                    ))
                    .on_conflict(users::id)
                    .do_update()
                    .set((
                        users::device_id.eq(parent),
                        users::token_update_raw.eq(Some(&msg.raw[..])),
                    ))
                    .execute(&mut conn)
                    .wrap_err("storing user token update")?;
            }
            None => {
                let updated = if let Some(unlock) = &msg.unlock_token {
                    diesel::update(devices::table.filter(devices::id.eq(&id.id)))
                        .set((
                            devices::token_update_raw.eq(Some(&msg.raw[..])),
                            devices::unlock_token.eq(Some(&unlock[..])),
                        ))
                        .execute(&mut conn)
                } else {
                    diesel::update(devices::table.filter(devices::id.eq(&id.id)))
                        .set(devices::token_update_raw.eq(Some(&msg.raw[..])))
                        .execute(&mut conn)
                }
                .wrap_err("storing device token update")?;
                if updated == 0 {
                    color_eyre::eyre::bail!("no device record for {}", id.id);
                }
            }
        }

        let existing: Option<(i64, Option<chrono::NaiveDateTime>)> = enrollments::table
            .filter(enrollments::id.eq(&id.id))
            .select((enrollments::token_update_tally, enrollments::enrolled_at))
            .first(&mut conn)
            .optional()
            .wrap_err("reading enrollment tally")?;
        let tally = existing.map(|(t, _)| t).unwrap_or(0) + 1;
        let enrolled_at = match existing {
            Some((t, at)) if t > 0 => at,
            _ => Some(now),
        };

        let user_id = id.parent_id.as_ref().map(|_| id.id.as_str());
        let enroll_type = id.enroll_type.to_string();
        let row = NewEnrollment {
            id: &id.id,
            device_id: id.device_channel_id(),
            user_id,
            enroll_type: &enroll_type,
            topic: &msg.topic,
            push_magic: &msg.push_magic,
            token: &msg.token,
            enabled: true,
            token_update_tally: tally,
            enrolled_at,
            last_seen_at: now,
        };
        diesel::insert_into(enrollments::table)
            .values(&row)
            .on_conflict(enrollments::id)
            .do_update()
            .set((
                enrollments::device_id.eq(id.device_channel_id()),
                enrollments::user_id.eq(user_id),
                enrollments::enroll_type.eq(id.enroll_type.to_string()),
                enrollments::topic.eq(&msg.topic),
                enrollments::push_magic.eq(&msg.push_magic),
                enrollments::token.eq(&msg.token[..]),
                enrollments::enabled.eq(true),
                enrollments::token_update_tally.eq(tally),
                enrollments::enrolled_at.eq(enrolled_at),
                enrollments::last_seen_at.eq(now),
            ))
            .execute(&mut conn)
            .wrap_err("storing token update")?;
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
            .as_deref()
            .ok_or_else(|| color_eyre::eyre::eyre!("UserAuthenticate on a device channel"))?;
        let mut conn = self.conn()?;
        if msg.digest_response.is_empty() {
            diesel::insert_into(users::table)
                .values((
                    users::id.eq(&id.id),
                    users::device_id.eq(parent),
                    users::user_authenticate_raw.eq(Some(&msg.raw[..])),
                ))
                .on_conflict(users::id)
                .do_update()
                .set(users::user_authenticate_raw.eq(Some(&msg.raw[..])))
                .execute(&mut conn)
        } else {
            diesel::insert_into(users::table)
                .values((
                    users::id.eq(&id.id),
                    users::device_id.eq(parent),
                    users::user_authenticate_digest_raw.eq(Some(&msg.raw[..])),
                ))
                .on_conflict(users::id)
                .do_update()
                .set(users::user_authenticate_digest_raw.eq(Some(&msg.raw[..])))
                .execute(&mut conn)
        }
        .wrap_err("storing user authenticate")?;
        self.update_last_seen(&mut conn, &id.id)
            .wrap_err("updating last seen")?;
        Ok(())
    }

    fn store_checkout(&self, req: &Request, msg: &CheckOut) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        match &id.parent_id {
            Some(parent) => {
                diesel::insert_into(users::table)
                    .values((
                        users::id.eq(&id.id),
                        users::device_id.eq(parent),
                        users::checkout_raw.eq(Some(&msg.raw[..])),
                    ))
                    .on_conflict(users::id)
                    .do_update()
                    .set(users::checkout_raw.eq(Some(&msg.raw[..])))
                    .execute(&mut conn)
            }
            None => diesel::update(devices::table.filter(devices::id.eq(&id.id)))
                .set(devices::checkout_raw.eq(Some(&msg.raw[..])))
                .execute(&mut conn),
        }
        .wrap_err("storing checkout")?;
        self.update_last_seen(&mut conn, &id.id)
            .wrap_err("updating last seen")?;
        Ok(())
    }

    fn disable(&self, req: &Request) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut conn = self.conn()?;
        diesel::update(
            enrollments::table
                .filter(enrollments::device_id.eq(&id.id))
                .filter(enrollments::enabled.eq(true)),
        )
        .set((
            enrollments::enabled.eq(false),
            enrollments::token_update_tally.eq(0),
        ))
        .execute(&mut conn)
        .wrap_err("disabling enrollment")?;
        Ok(())
    }
}

impl SqliteStorage {
    fn delete_command_tx(
        &self,
        conn: &mut Conn,
        id: &str,
        uuid: &str,
    ) -> QueryResult<()> {
        conn.transaction(|conn| {
            diesel::delete(
                command_results::table
                    .filter(command_results::enrollment_id.eq(id))
                    .filter(command_results::command_uuid.eq(uuid)),
            )
            .execute(conn)?;
            diesel::delete(
                enrollment_queue::table
                    .filter(enrollment_queue::enrollment_id.eq(id))
                    .filter(enrollment_queue::command_uuid.eq(uuid)),
            )
            .execute(conn)?;

            // garbage-collect the body when nothing references it anymore
            let queued: i64 = enrollment_queue::table
                .filter(enrollment_queue::command_uuid.eq(uuid))
                .count()
                .get_result(conn)?;
            let reported: i64 = command_results::table
                .filter(command_results::command_uuid.eq(uuid))
                .count()
                .get_result(conn)?;
            if queued == 0 && reported == 0 {
                diesel::delete(commands::table.filter(commands::command_uuid.eq(uuid)))
                    .execute(conn)?;
            }
            Ok(())
        })
    }
}

impl CommandQueueStore for SqliteStorage {
    fn store_command_report(
        &self,
        req: &Request,
        report: &CommandResults,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        self.update_last_seen(&mut conn, &id.id)
            .wrap_err("updating last seen")?;
        if report.status == CommandStatus::Idle {
            return Ok(());
        }
        if report.command_uuid.is_empty() {
            color_eyre::eyre::bail!("empty command UUID");
        }

        if self.delete_commands && report.status != CommandStatus::NotNow {
            return self
                .delete_command_tx(&mut conn, &id.id, &report.command_uuid)
                .wrap_err("deleting command");
        }

        let not_now = report.status == CommandStatus::NotNow;
        let status = report.status.to_string();
        let row = NewCommandResult {
            enrollment_id: &id.id,
            command_uuid: &report.command_uuid,
            status: &status,
            result: &report.raw,
            // only ever represents the first NotNow
            not_now_at: not_now.then(|| Utc::now().naive_utc()),
            not_now_tally: i64::from(not_now),
        };
        let insert = diesel::insert_into(command_results::table).values(&row);
        if not_now {
            insert
                .on_conflict((
                    command_results::enrollment_id,
                    command_results::command_uuid,
                ))
                .do_update()
                .set((
                    command_results::status.eq(report.status.to_string()),
                    command_results::result.eq(&report.raw[..]),
                    command_results::not_now_tally.eq(command_results::not_now_tally + 1),
                ))
                .execute(&mut conn)
        } else {
            insert
                .on_conflict((
                    command_results::enrollment_id,
                    command_results::command_uuid,
                ))
                .do_update()
                .set((
                    command_results::status.eq(report.status.to_string()),
                    command_results::result.eq(&report.raw[..]),
                ))
                .execute(&mut conn)
        }
        .wrap_err("storing command report")?;
        Ok(())
    }

    fn retrieve_next_command(
        &self,
        req: &Request,
        skip_not_now: bool,
    ) -> color_eyre::eyre::Result<Option<Command>> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;

        let join = enrollment_queue::table
            .inner_join(
                commands::table.on(commands::command_uuid.eq(enrollment_queue::command_uuid)),
            )
            .left_join(
                command_results::table.on(command_results::command_uuid
                    .eq(enrollment_queue::command_uuid)
                    .and(command_results::enrollment_id.eq(enrollment_queue::enrollment_id))),
            )
            .filter(enrollment_queue::enrollment_id.eq(&id.id))
            .filter(enrollment_queue::active.eq(true));

        let row: Option<(String, String, Vec<u8>)> = if skip_not_now {
            join.filter(command_results::status.is_null())
                .order(enrollment_queue::id.asc())
                .select((
                    commands::command_uuid,
                    commands::request_type,
                    commands::command,
                ))
                .first(&mut conn)
                .optional()
        } else {
            join.filter(
                command_results::status
                    .is_null()
                    .or(command_results::status.eq(NOT_NOW)),
            )
            .order(enrollment_queue::id.asc())
            .select((
                commands::command_uuid,
                commands::request_type,
                commands::command,
            ))
            .first(&mut conn)
            .optional()
        }
        .wrap_err("retrieving next command")?;

        Ok(row.map(|(command_uuid, request_type, raw)| Command {
            command_uuid,
            command: CommandPayload { request_type },
            raw,
        }))
    }

    fn clear_queue(&self, req: &Request) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut conn = self.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let ids: Vec<String> = {
                let mut ids: Vec<String> = enrollments::table
                    .filter(enrollments::device_id.eq(&id.id))
                    .select(enrollments::id)
                    .load(conn)?;
                if !ids.iter().any(|i| *i == id.id) {
                    ids.push(id.id.clone());
                }
                ids
            };
            let rows: Vec<i32> = enrollment_queue::table
                .left_join(
                    command_results::table.on(command_results::command_uuid
                        .eq(enrollment_queue::command_uuid)
                        .and(command_results::enrollment_id.eq(enrollment_queue::enrollment_id))),
                )
                .filter(enrollment_queue::enrollment_id.eq_any(&ids))
                .filter(enrollment_queue::active.eq(true))
                .filter(
                    command_results::status
                        .is_null()
                        .or(command_results::status.eq(NOT_NOW)),
                )
                .select(enrollment_queue::id)
                .load(conn)?;
            diesel::update(enrollment_queue::table.filter(enrollment_queue::id.eq_any(rows)))
                .set(enrollment_queue::active.eq(false))
                .execute(conn)?;
            Ok(())
        })
        .wrap_err("clearing queue")?;
        Ok(())
    }
}

impl CommandEnqueuer for SqliteStorage {
    fn enqueue_command(
        &self,
        ids: &[String],
        cmd: &Command,
    ) -> color_eyre::eyre::Result<EnqueueIdErrors> {
        if ids.is_empty() {
            color_eyre::eyre::bail!("no id(s) supplied to queue command to");
        }
        let mut conn = self.conn()?;
        let now = Utc::now().naive_utc();
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(commands::table)
                .values(&NewCommand {
                    command_uuid: &cmd.command_uuid,
                    request_type: &cmd.command.request_type,
                    command: &cmd.raw,
                    created_at: now,
                })
                .execute(conn)?;
            let items: Vec<NewQueueItem<'_>> = ids
                .iter()
                .map(|id| NewQueueItem {
                    enrollment_id: id,
                    command_uuid: &cmd.command_uuid,
                    active: true,
                    created_at: now,
                })
                .collect();
            diesel::insert_into(enrollment_queue::table)
                .values(&items)
                .execute(conn)?;
            Ok(())
        })
        .wrap_err("enqueueing command")?;
        Ok(EnqueueIdErrors::new())
    }
}

impl PushInfoStore for SqliteStorage {
    fn retrieve_push_info(
        &self,
        ids: &[String],
    ) -> color_eyre::eyre::Result<HashMap<String, Push>> {
        if ids.is_empty() {
            color_eyre::eyre::bail!("no ids provided");
        }
        let mut conn = self.conn()?;
        let rows: Vec<(String, String, String, Vec<u8>)> = enrollments::table
            .filter(enrollments::id.eq_any(ids))
            .filter(enrollments::enabled.eq(true))
            .select((
                enrollments::id,
                enrollments::topic,
                enrollments::push_magic,
                enrollments::token,
            ))
            .load(&mut conn)
            .wrap_err("retrieving push info")?;
        Ok(rows
            .into_iter()
            .map(|(id, topic, push_magic, token)| {
                (
                    id,
                    Push {
                        topic,
                        push_magic,
                        token,
                    },
                )
            })
            .collect())
    }
}

impl PushCertStore for SqliteStorage {
    fn store_push_cert(
        &self,
        pem_cert: &[u8],
        pem_key: &[u8],
    ) -> color_eyre::eyre::Result<String> {
        let topic = aspen_crypto::topic_from_pem_cert(pem_cert)?;
        let mut conn = self.conn()?;
        diesel::insert_into(push_certs::table)
            .values(&NewPushCert {
                topic: &topic,
                cert_pem: pem_cert,
                key_pem: pem_key,
                stale_token: 0,
            })
            .on_conflict(push_certs::topic)
            .do_update()
            .set((
                push_certs::cert_pem.eq(pem_cert),
                push_certs::key_pem.eq(pem_key),
                push_certs::stale_token.eq(push_certs::stale_token + 1),
            ))
            .execute(&mut conn)
            .wrap_err("storing push cert")?;
        Ok(topic)
    }

    fn retrieve_push_cert(&self, topic: &str) -> color_eyre::eyre::Result<Option<PushCert>> {
        let mut conn = self.conn()?;
        let row: Option<(Vec<u8>, Vec<u8>, i64)> = push_certs::table
            .filter(push_certs::topic.eq(topic))
            .select((
                push_certs::cert_pem,
                push_certs::key_pem,
                push_certs::stale_token,
            ))
            .first(&mut conn)
            .optional()
            .wrap_err("retrieving push cert")?;
        Ok(row.map(|(cert_pem, key_pem, stale_token)| PushCert {
            cert_pem,
            key_pem,
            stale_token: stale_token.to_string(),
        }))
    }

    fn is_push_cert_stale(
        &self,
        topic: &str,
        stale_token: &str,
    ) -> color_eyre::eyre::Result<bool> {
        let mut conn = self.conn()?;
        let current: Option<i64> = push_certs::table
            .filter(push_certs::topic.eq(topic))
            .select(push_certs::stale_token)
            .first(&mut conn)
            .optional()
            .wrap_err("checking push cert staleness")?;
        Ok(match current {
            Some(current) => current.to_string() != stale_token,
            None => true,
        })
    }
}

impl CertAuthStore for SqliteStorage {
    fn has_cert_hash(&self, _req: &Request, hash: &str) -> color_eyre::eyre::Result<bool> {
        let mut conn = self.conn()?;
        let count: i64 = cert_auth_associations::table
            .filter(cert_auth_associations::sha256.eq(hash.to_lowercase()))
            .count()
            .get_result(&mut conn)
            .wrap_err("checking cert hash")?;
        Ok(count > 0)
    }

    fn enrollment_has_cert_hash(&self, req: &Request) -> color_eyre::eyre::Result<bool> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        let count: i64 = cert_auth_associations::table
            .filter(cert_auth_associations::enrollment_id.eq(&id.id))
            .count()
            .get_result(&mut conn)
            .wrap_err("checking enrollment cert hash")?;
        Ok(count > 0)
    }

    fn is_cert_hash_associated(
        &self,
        req: &Request,
        hash: &str,
    ) -> color_eyre::eyre::Result<bool> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        let count: i64 = cert_auth_associations::table
            .filter(cert_auth_associations::enrollment_id.eq(&id.id))
            .filter(cert_auth_associations::sha256.eq(hash.to_lowercase()))
            .count()
            .get_result(&mut conn)
            .wrap_err("checking cert hash association")?;
        Ok(count > 0)
    }

    fn associate_cert_hash(&self, req: &Request, hash: &str) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        let mut conn = self.conn()?;
        let hash = hash.to_lowercase();
        diesel::insert_into(cert_auth_associations::table)
            .values(&NewCertAuthAssociation {
                enrollment_id: &id.id,
                sha256: &hash,
            })
            .on_conflict(cert_auth_associations::enrollment_id)
            .do_update()
            .set(cert_auth_associations::sha256.eq(&hash))
            .execute(&mut conn)
            .wrap_err("associating cert hash")?;
        Ok(())
    }
}

impl CertAuthRetriever for SqliteStorage {
    fn enrollment_from_hash(&self, hash: &str) -> color_eyre::eyre::Result<Option<String>> {
        let mut conn = self.conn()?;
        cert_auth_associations::table
            .filter(cert_auth_associations::sha256.eq(hash.to_lowercase()))
            .select(cert_auth_associations::enrollment_id)
            .first(&mut conn)
            .optional()
            .wrap_err("retrieving enrollment from hash")
    }
}

impl BootstrapTokenStore for SqliteStorage {
    fn store_bootstrap_token(
        &self,
        req: &Request,
        msg: &SetBootstrapToken,
    ) -> color_eyre::eyre::Result<()> {
        let id = req.require_enroll_id()?;
        if id.parent_id.is_some() {
            return Err(DeviceChannelOnly.into());
        }
        let mut conn = self.conn()?;
        let updated = diesel::update(devices::table.filter(devices::id.eq(&id.id)))
            .set(devices::bootstrap_token.eq(Some(&msg.bootstrap_token[..])))
            .execute(&mut conn)
            .wrap_err("storing bootstrap token")?;
        if updated == 0 {
            color_eyre::eyre::bail!("no device record for {}", id.id);
        }
        self.update_last_seen(&mut conn, &id.id)
            .wrap_err("updating last seen")?;
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
        let mut conn = self.conn()?;
        let token: Option<Option<Vec<u8>>> = devices::table
            .filter(devices::id.eq(&id.id))
            .select(devices::bootstrap_token)
            .first(&mut conn)
            .optional()
            .wrap_err("retrieving bootstrap token")?;
        self.update_last_seen(&mut conn, &id.id)
            .wrap_err("updating last seen")?;
        Ok(token.flatten().map(|t| BootstrapToken { bootstrap_token: t }))
    }
}

impl TokenUpdateTallyStore for SqliteStorage {
    fn retrieve_token_update_tally(&self, id: &str) -> color_eyre::eyre::Result<i64> {
        let mut conn = self.conn()?;
        let tally: Option<i64> = enrollments::table
            .filter(enrollments::id.eq(id))
            .select(enrollments::token_update_tally)
            .first(&mut conn)
            .optional()
            .wrap_err("retrieving token update tally")?;
        Ok(tally.unwrap_or(0))
    }
}

impl StoreMigrator for SqliteStorage {
    fn retrieve_migration_checkins(
        &self,
        visit: &mut dyn FnMut(CheckinMessage) -> color_eyre::eyre::Result<()>,
    ) -> color_eyre::eyre::Result<()> {
        let mut conn = self.conn()?;
        let device_rows: Vec<DeviceRow> = devices::table
            .order(devices::id.asc())
            .load(&mut conn)
            .wrap_err("loading devices")?;

        for device in device_rows {
            let enabled: Option<bool> = enrollments::table
                .filter(enrollments::id.eq(&device.id))
                .select(enrollments::enabled)
                .first(&mut conn)
                .optional()
                .wrap_err("loading enrollment")?;
            if !enabled.unwrap_or(false) {
                continue;
            }
            let Ok(auth) = aspen_core::decode_checkin(&device.authenticate_raw) else {
                continue;
            };
            let Some(token_update_raw) = &device.token_update_raw else {
                continue;
            };
            let Ok(token_update) = aspen_core::decode_checkin(token_update_raw) else {
                continue;
            };
            visit(auth)?;
            visit(token_update)?;

            let user_rows: Vec<UserRow> = users::table
                .filter(users::device_id.eq(&device.id))
                .order(users::id.asc())
                .load(&mut conn)
                .wrap_err("loading users")?;
            for user in user_rows {
                let user_enabled: Option<bool> = enrollments::table
                    .filter(enrollments::id.eq(&user.id))
                    .select(enrollments::enabled)
                    .first(&mut conn)
                    .optional()
                    .wrap_err("loading user enrollment")?;
                if !user_enabled.unwrap_or(false) {
                    continue;
                }
                for raw in [
                    &user.user_authenticate_raw,
                    &user.user_authenticate_digest_raw,
                    &user.token_update_raw,
                ]
                .into_iter()
                .flatten()
                {
                    if let Ok(msg) = aspen_core::decode_checkin(raw) {
                        visit(msg)?;
                    }
                }
            }
        }
        Ok(())
    }
}
