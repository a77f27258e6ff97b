use anyhow::{bail, Context};
use pixelchain_types::{Address, FactionScope, HistoryEntry};
use postgres::{Client, NoTls};
use rusqlite::{params, Connection, OptionalExtension};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use url::Url;

use crate::{Allowance, Counters, FactionMember, Ledger, StoreError};

const ENTRY_COLUMNS: &str = "address, position, day, color, time, metadata";

enum Backend {
    Sqlite(Connection),
    Postgres(Client),
}

/// Ledger and counters in one relational database.
///
/// The clients are blocking; every call runs on the blocking pool behind a mutex, so
/// statements from concurrent readers are serialized.
#[derive(Clone)]
pub struct SqlStore {
    backend: Arc<Mutex<Backend>>,
}

impl SqlStore {
    pub fn open_sqlite(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open ledger sqlite db")?;
        init_schema_sqlite(&conn)?;
        Ok(Self::from_backend(Backend::Sqlite(conn)))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger")?;
        init_schema_sqlite(&conn)?;
        Ok(Self::from_backend(Backend::Sqlite(conn)))
    }

    pub async fn connect_postgres(url: &str) -> anyhow::Result<Self> {
        validate_postgres_url(url)?;
        let url = url.to_string();
        let client = tokio::task::spawn_blocking(move || -> anyhow::Result<Client> {
            let mut client = Client::connect(&url, NoTls).context("open ledger postgres")?;
            init_schema_postgres(&mut client)?;
            Ok(client)
        })
        .await
        .context("join postgres connect task")??;
        Ok(Self::from_backend(Backend::Postgres(client)))
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Backend) -> Result<T, StoreError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_backend(&backend);
            op(&mut guard)
        })
        .await?
    }
}

#[cfg(test)]
impl SqlStore {
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<(), StoreError> {
        self.run(move |backend| match backend {
            Backend::Sqlite(conn) => Ok(conn.execute_batch(sql)?),
            Backend::Postgres(client) => Ok(client.batch_execute(sql)?),
        })
        .await
    }
}

fn lock_backend(backend: &Mutex<Backend>) -> MutexGuard<'_, Backend> {
    match backend.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Ledger connection lock poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

fn validate_postgres_url(url: &str) -> anyhow::Result<()> {
    if env_flag("LEDGER_POSTGRES_ALLOW_PUBLIC") {
        return Ok(());
    }

    let parsed = Url::parse(url).context("parse postgres url")?;
    if !matches!(parsed.scheme(), "postgres" | "postgresql") {
        bail!("postgres url must start with postgres:// or postgresql://");
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("postgres url missing host"))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        bail!("postgres host is public; set LEDGER_POSTGRES_ALLOW_PUBLIC=1 to override");
    }

    if env_flag("LEDGER_POSTGRES_ALLOW_HOSTNAME") {
        return Ok(());
    }
    bail!("postgres host must be a private IP; set LEDGER_POSTGRES_ALLOW_HOSTNAME=1 to allow hostnames");
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

fn init_schema_sqlite(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS pixels (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             address TEXT NOT NULL,
             position INTEGER NOT NULL,
             day INTEGER,
             color INTEGER NOT NULL,
             time INTEGER NOT NULL,
             metadata TEXT
         );
         CREATE INDEX IF NOT EXISTS pixels_address_position ON pixels(address, position, time, id);
         CREATE INDEX IF NOT EXISTS pixels_position ON pixels(position, time, id);
         CREATE INDEX IF NOT EXISTS pixels_address ON pixels(address, time, id);
         CREATE TABLE IF NOT EXISTS last_placed_time (
             address TEXT PRIMARY KEY,
             time INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS extra_pixels (
             address TEXT PRIMARY KEY,
             available INTEGER NOT NULL DEFAULT 0,
             used INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS faction_members_info (
             address TEXT PRIMARY KEY,
             last_placed_time INTEGER NOT NULL,
             member_pixels INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS chain_faction_members_info (
             address TEXT PRIMARY KEY,
             last_placed_time INTEGER NOT NULL,
             member_pixels INTEGER NOT NULL
         );",
    )
    .context("init ledger schema")?;
    Ok(())
}

fn init_schema_postgres(client: &mut Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS pixels (
                 id BIGSERIAL PRIMARY KEY,
                 address TEXT NOT NULL,
                 position BIGINT NOT NULL,
                 day BIGINT,
                 color BIGINT NOT NULL,
                 time BIGINT NOT NULL,
                 metadata TEXT
             );
             CREATE INDEX IF NOT EXISTS pixels_address_position ON pixels(address, position, time, id);
             CREATE INDEX IF NOT EXISTS pixels_position ON pixels(position, time, id);
             CREATE INDEX IF NOT EXISTS pixels_address ON pixels(address, time, id);
             CREATE TABLE IF NOT EXISTS last_placed_time (
                 address TEXT PRIMARY KEY,
                 time BIGINT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS extra_pixels (
                 address TEXT PRIMARY KEY,
                 available BIGINT NOT NULL DEFAULT 0,
                 used BIGINT NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS faction_members_info (
                 address TEXT PRIMARY KEY,
                 last_placed_time BIGINT NOT NULL,
                 member_pixels BIGINT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS chain_faction_members_info (
                 address TEXT PRIMARY KEY,
                 last_placed_time BIGINT NOT NULL,
                 member_pixels BIGINT NOT NULL
             );",
        )
        .context("init ledger schema")?;
    Ok(())
}

fn faction_table(scope: FactionScope) -> &'static str {
    match scope {
        FactionScope::Faction => "faction_members_info",
        FactionScope::Chain => "chain_faction_members_info",
    }
}

fn to_i64(value: u64, field: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
}

fn to_u64(value: i64, field: &'static str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        field,
        value: value.to_string(),
    })
}

/// A `pixels` row as the drivers return it.
struct StoredRow {
    address: String,
    position: i64,
    day: Option<i64>,
    color: i64,
    time: i64,
    metadata: Option<String>,
}

impl StoredRow {
    fn from_sqlite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            position: row.get(1)?,
            day: row.get(2)?,
            color: row.get(3)?,
            time: row.get(4)?,
            metadata: row.get(5)?,
        })
    }

    fn from_postgres(row: &postgres::Row) -> Result<Self, postgres::Error> {
        Ok(Self {
            address: row.try_get(0)?,
            position: row.try_get(1)?,
            day: row.try_get(2)?,
            color: row.try_get(3)?,
            time: row.try_get(4)?,
            metadata: row.try_get(5)?,
        })
    }

    fn into_entry(self) -> Result<HistoryEntry, StoreError> {
        let address = Address::parse(&self.address).map_err(|_| StoreError::Corrupt {
            field: "address",
            value: self.address.clone(),
        })?;
        let color = u32::try_from(self.color).map_err(|_| StoreError::Corrupt {
            field: "color",
            value: self.color.to_string(),
        })?;
        let metadata = match self.metadata {
            Some(text) => Some(serde_json::from_str(&text).map_err(|_| StoreError::Corrupt {
                field: "metadata",
                value: text,
            })?),
            None => None,
        };
        Ok(HistoryEntry {
            address,
            position: to_u64(self.position, "position")?,
            color,
            timestamp: to_u64(self.time, "time")?,
            day_index: self.day.map(|day| to_u64(day, "day")).transpose()?,
            metadata,
        })
    }
}

/// Bound parameters of an appended entry.
struct NewRow {
    address: String,
    position: i64,
    day: Option<i64>,
    color: i64,
    time: i64,
    metadata: Option<String>,
}

impl NewRow {
    fn new(entry: &HistoryEntry) -> Result<Self, StoreError> {
        Ok(Self {
            address: entry.address.as_str().to_string(),
            position: to_i64(entry.position, "position")?,
            day: entry
                .day_index
                .map(|day| to_i64(day, "day"))
                .transpose()?,
            color: i64::from(entry.color),
            time: to_i64(entry.timestamp, "time")?,
            metadata: entry.metadata.as_ref().map(|value| value.to_string()),
        })
    }
}

/// Row filter for the newest-entry lookups.
enum Scope {
    Slot(String, i64),
    Position(i64),
    Address(String),
}

impl Backend {
    fn append(&mut self, row: &NewRow) -> Result<(), StoreError> {
        match self {
            Backend::Sqlite(conn) => {
                conn.execute(
                    "INSERT INTO pixels (address, position, day, color, time, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![row.address, row.position, row.day, row.color, row.time, row.metadata],
                )?;
            }
            Backend::Postgres(client) => {
                client.execute(
                    "INSERT INTO pixels (address, position, day, color, time, metadata)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &row.address,
                        &row.position,
                        &row.day,
                        &row.color,
                        &row.time,
                        &row.metadata,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn newest(&mut self, scope: &Scope) -> Result<Option<HistoryEntry>, StoreError> {
        let row = match (self, scope) {
            (Backend::Sqlite(conn), Scope::Slot(address, position)) => conn
                .query_row(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE address = ?1 AND position = ?2
                         ORDER BY time DESC, id DESC LIMIT 1"
                    ),
                    params![address, position],
                    StoredRow::from_sqlite,
                )
                .optional()?,
            (Backend::Sqlite(conn), Scope::Position(position)) => conn
                .query_row(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE position = ?1
                         ORDER BY time DESC, id DESC LIMIT 1"
                    ),
                    params![position],
                    StoredRow::from_sqlite,
                )
                .optional()?,
            (Backend::Sqlite(conn), Scope::Address(address)) => conn
                .query_row(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE address = ?1
                         ORDER BY time DESC, id DESC LIMIT 1"
                    ),
                    params![address],
                    StoredRow::from_sqlite,
                )
                .optional()?,
            (Backend::Postgres(client), Scope::Slot(address, position)) => client
                .query_opt(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE address = $1 AND position = $2
                         ORDER BY time DESC, id DESC LIMIT 1"
                    ),
                    &[address, position],
                )?
                .map(|row| StoredRow::from_postgres(&row))
                .transpose()?,
            (Backend::Postgres(client), Scope::Position(position)) => client
                .query_opt(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE position = $1
                         ORDER BY time DESC, id DESC LIMIT 1"
                    ),
                    &[position],
                )?
                .map(|row| StoredRow::from_postgres(&row))
                .transpose()?,
            (Backend::Postgres(client), Scope::Address(address)) => client
                .query_opt(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE address = $1
                         ORDER BY time DESC, id DESC LIMIT 1"
                    ),
                    &[address],
                )?
                .map(|row| StoredRow::from_postgres(&row))
                .transpose()?,
        };
        row.map(StoredRow::into_entry).transpose()
    }

    fn remove_newest(
        &mut self,
        address: &str,
        position: i64,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        let row = match self {
            Backend::Sqlite(conn) => conn
                .query_row(
                    &*format!(
                        "DELETE FROM pixels WHERE id = (
                             SELECT id FROM pixels WHERE address = ?1 AND position = ?2
                             ORDER BY time DESC, id DESC LIMIT 1
                         ) RETURNING {ENTRY_COLUMNS}"
                    ),
                    params![address, position],
                    StoredRow::from_sqlite,
                )
                .optional()?,
            Backend::Postgres(client) => client
                .query_opt(
                    &*format!(
                        "DELETE FROM pixels WHERE id = (
                             SELECT id FROM pixels WHERE address = $1 AND position = $2
                             ORDER BY time DESC, id DESC LIMIT 1
                         ) RETURNING {ENTRY_COLUMNS}"
                    ),
                    &[&address, &position],
                )?
                .map(|row| StoredRow::from_postgres(&row))
                .transpose()?,
        };
        row.map(StoredRow::into_entry).transpose()
    }

    fn history(
        &mut self,
        address: &str,
        position: i64,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = match self {
            Backend::Sqlite(conn) => {
                let mut stmt = conn.prepare(&*format!(
                    "SELECT {ENTRY_COLUMNS} FROM pixels WHERE address = ?1 AND position = ?2
                     ORDER BY time DESC, id DESC LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![address, position, limit], StoredRow::from_sqlite)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Backend::Postgres(client) => client
                .query(
                    &*format!(
                        "SELECT {ENTRY_COLUMNS} FROM pixels WHERE address = $1 AND position = $2
                         ORDER BY time DESC, id DESC LIMIT $3"
                    ),
                    &[&address, &position, &limit],
                )?
                .iter()
                .map(StoredRow::from_postgres)
                .collect::<Result<Vec<_>, _>>()?,
        };
        rows.into_iter().map(StoredRow::into_entry).collect()
    }

    fn cooldown(&mut self, address: &str) -> Result<Option<i64>, StoreError> {
        Ok(match self {
            Backend::Sqlite(conn) => conn
                .query_row(
                    "SELECT time FROM last_placed_time WHERE address = ?1",
                    params![address],
                    |row| row.get(0),
                )
                .optional()?,
            Backend::Postgres(client) => client
                .query_opt(
                    "SELECT time FROM last_placed_time WHERE address = $1",
                    &[&address],
                )?
                .map(|row| row.try_get(0))
                .transpose()?,
        })
    }

    fn set_cooldown(&mut self, address: &str, time: i64) -> Result<(), StoreError> {
        match self {
            Backend::Sqlite(conn) => {
                conn.execute(
                    "INSERT INTO last_placed_time (address, time) VALUES (?1, ?2)
                     ON CONFLICT(address) DO UPDATE SET time = excluded.time",
                    params![address, time],
                )?;
            }
            Backend::Postgres(client) => {
                client.execute(
                    "INSERT INTO last_placed_time (address, time) VALUES ($1, $2)
                     ON CONFLICT(address) DO UPDATE SET time = excluded.time",
                    &[&address, &time],
                )?;
            }
        }
        Ok(())
    }

    fn clear_cooldown(&mut self, address: &str) -> Result<(), StoreError> {
        match self {
            Backend::Sqlite(conn) => {
                conn.execute(
                    "DELETE FROM last_placed_time WHERE address = ?1",
                    params![address],
                )?;
            }
            Backend::Postgres(client) => {
                client.execute(
                    "DELETE FROM last_placed_time WHERE address = $1",
                    &[&address],
                )?;
            }
        }
        Ok(())
    }

    fn allowance(&mut self, address: &str) -> Result<Allowance, StoreError> {
        let row: Option<(i64, i64)> = match self {
            Backend::Sqlite(conn) => conn
                .query_row(
                    "SELECT available, used FROM extra_pixels WHERE address = ?1",
                    params![address],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            Backend::Postgres(client) => client
                .query_opt(
                    "SELECT available, used FROM extra_pixels WHERE address = $1",
                    &[&address],
                )?
                .map(|row| -> Result<(i64, i64), postgres::Error> {
                    Ok((row.try_get(0)?, row.try_get(1)?))
                })
                .transpose()?,
        };
        Ok(row
            .map(|(available, used)| Allowance { available, used })
            .unwrap_or_default())
    }

    fn adjust_allowance(
        &mut self,
        address: &str,
        available_delta: i64,
        used_delta: i64,
    ) -> Result<Allowance, StoreError> {
        let (available, used) = match self {
            Backend::Sqlite(conn) => conn.query_row(
                "INSERT INTO extra_pixels (address, available, used) VALUES (?1, ?2, ?3)
                 ON CONFLICT(address) DO UPDATE SET
                     available = extra_pixels.available + excluded.available,
                     used = extra_pixels.used + excluded.used
                 RETURNING available, used",
                params![address, available_delta, used_delta],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?,
            Backend::Postgres(client) => {
                let row = client.query_one(
                    "INSERT INTO extra_pixels (address, available, used) VALUES ($1, $2, $3)
                     ON CONFLICT(address) DO UPDATE SET
                         available = extra_pixels.available + excluded.available,
                         used = extra_pixels.used + excluded.used
                     RETURNING available, used",
                    &[&address, &available_delta, &used_delta],
                )?;
                (row.try_get(0)?, row.try_get(1)?)
            }
        };
        Ok(Allowance { available, used })
    }

    fn faction_member(
        &mut self,
        scope: FactionScope,
        address: &str,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let table = faction_table(scope);
        Ok(match self {
            Backend::Sqlite(conn) => conn
                .query_row(
                    &*format!(
                        "SELECT last_placed_time, member_pixels FROM {table} WHERE address = ?1"
                    ),
                    params![address],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            Backend::Postgres(client) => client
                .query_opt(
                    &*format!(
                        "SELECT last_placed_time, member_pixels FROM {table} WHERE address = $1"
                    ),
                    &[&address],
                )?
                .map(|row| -> Result<(i64, i64), postgres::Error> {
                    Ok((row.try_get(0)?, row.try_get(1)?))
                })
                .transpose()?,
        })
    }

    fn set_faction_member(
        &mut self,
        scope: FactionScope,
        address: &str,
        last_placed_time: i64,
        member_pixels: i64,
    ) -> Result<(), StoreError> {
        let table = faction_table(scope);
        match self {
            Backend::Sqlite(conn) => {
                conn.execute(
                    &*format!(
                        "INSERT INTO {table} (address, last_placed_time, member_pixels)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(address) DO UPDATE SET
                             last_placed_time = excluded.last_placed_time,
                             member_pixels = excluded.member_pixels"
                    ),
                    params![address, last_placed_time, member_pixels],
                )?;
            }
            Backend::Postgres(client) => {
                client.execute(
                    &*format!(
                        "INSERT INTO {table} (address, last_placed_time, member_pixels)
                         VALUES ($1, $2, $3)
                         ON CONFLICT(address) DO UPDATE SET
                             last_placed_time = excluded.last_placed_time,
                             member_pixels = excluded.member_pixels"
                    ),
                    &[&address, &last_placed_time, &member_pixels],
                )?;
            }
        }
        Ok(())
    }
}

impl Ledger for SqlStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let row = NewRow::new(&entry)?;
        self.run(move |backend| backend.append(&row)).await
    }

    async fn most_recent(
        &self,
        address: &Address,
        position: u64,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        let scope = Scope::Slot(address.to_string(), to_i64(position, "position")?);
        self.run(move |backend| backend.newest(&scope)).await
    }

    async fn remove_most_recent(
        &self,
        address: &Address,
        position: u64,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        let address = address.to_string();
        let position = to_i64(position, "position")?;
        self.run(move |backend| backend.remove_newest(&address, position))
            .await
    }

    async fn latest_at(&self, position: u64) -> Result<Option<HistoryEntry>, StoreError> {
        let scope = Scope::Position(to_i64(position, "position")?);
        self.run(move |backend| backend.newest(&scope)).await
    }

    async fn latest_by(&self, address: &Address) -> Result<Option<HistoryEntry>, StoreError> {
        let scope = Scope::Address(address.to_string());
        self.run(move |backend| backend.newest(&scope)).await
    }

    async fn history(
        &self,
        address: &Address,
        position: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let address = address.to_string();
        let position = to_i64(position, "position")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |backend| backend.history(&address, position, limit))
            .await
    }
}

impl Counters for SqlStore {
    async fn cooldown(&self, address: &Address) -> Result<Option<u64>, StoreError> {
        let address = address.to_string();
        let time = self.run(move |backend| backend.cooldown(&address)).await?;
        time.map(|time| to_u64(time, "time")).transpose()
    }

    async fn set_cooldown(&self, address: &Address, timestamp: u64) -> Result<(), StoreError> {
        let address = address.to_string();
        let time = to_i64(timestamp, "time")?;
        self.run(move |backend| backend.set_cooldown(&address, time))
            .await
    }

    async fn clear_cooldown(&self, address: &Address) -> Result<(), StoreError> {
        let address = address.to_string();
        self.run(move |backend| backend.clear_cooldown(&address))
            .await
    }

    async fn allowance(&self, address: &Address) -> Result<Allowance, StoreError> {
        let address = address.to_string();
        self.run(move |backend| backend.allowance(&address)).await
    }

    async fn adjust_allowance(
        &self,
        address: &Address,
        available_delta: i64,
        used_delta: i64,
    ) -> Result<Allowance, StoreError> {
        let address = address.to_string();
        self.run(move |backend| backend.adjust_allowance(&address, available_delta, used_delta))
            .await
    }

    async fn faction_member(
        &self,
        scope: FactionScope,
        address: &Address,
    ) -> Result<Option<FactionMember>, StoreError> {
        let address = address.to_string();
        let row = self
            .run(move |backend| backend.faction_member(scope, &address))
            .await?;
        row.map(|(time, pixels)| {
            Ok(FactionMember {
                last_placed_time: to_u64(time, "last_placed_time")?,
                member_pixels: u32::try_from(pixels).map_err(|_| StoreError::Corrupt {
                    field: "member_pixels",
                    value: pixels.to_string(),
                })?,
            })
        })
        .transpose()
    }

    async fn set_faction_member(
        &self,
        scope: FactionScope,
        address: &Address,
        member: FactionMember,
    ) -> Result<(), StoreError> {
        let address = address.to_string();
        let time = to_i64(member.last_placed_time, "last_placed_time")?;
        let pixels = i64::from(member.member_pixels);
        self.run(move |backend| backend.set_faction_member(scope, &address, time, pixels))
            .await
    }
}
