use super::{JobStore, PeerRecord, StoreError};
use crate::attributes::{AttrValue, SlotAttributes};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, error, info};

/// node index used for job-level attributes
const JOB_NODE: i64 = -1;

/// Job store persisting into a SQLite database, shared by all jobs through (cluster, proc)
#[derive(Debug)]
pub struct SQLiteStore {
    connection: Connection,
    cluster: i64,
    proc: i64,
}

fn node_key(node: Option<usize>) -> i64 {
    node.map_or(JOB_NODE, |node| node as i64)
}

impl SQLiteStore {
    pub fn load(path: &Path, cluster: i64, proc: i64) -> Result<Self, StoreError> {
        Ok(Self {
            connection: Connection::open(path)?,
            cluster,
            proc,
        })
    }

    pub fn open_in_memory(cluster: i64, proc: i64) -> Result<Self, StoreError> {
        Ok(Self {
            connection: Connection::open_in_memory()?,
            cluster,
            proc,
        })
    }

    pub fn init(&mut self) -> Result<(), StoreError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, giving up");

                return Err(StoreError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    fn upsert_attr(
        connection: &Connection,
        cluster: i64,
        proc: i64,
        node: i64,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), StoreError> {
        connection
            .prepare_cached(
                "insert or replace into attributes (cluster, proc, node, name, value)
                values (?, ?, ?, ?, ?)",
            )?
            .execute(params![cluster, proc, node, name, serde_yaml::to_string(value)?])?;

        Ok(())
    }

    fn node_attributes(&self, node: i64) -> Result<SlotAttributes, StoreError> {
        let mut statement = self.connection.prepare_cached(
            "select name, value from attributes where cluster = ? and proc = ? and node = ?",
        )?;
        let rows = statement.query_map(params![self.cluster, self.proc, node], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut attributes = SlotAttributes::new();
        for row in rows {
            let (name, value) = row?;
            attributes.set(&name, serde_yaml::from_str::<AttrValue>(&value)?);
        }

        Ok(attributes)
    }
}

impl JobStore for SQLiteStore {
    fn record_peer(&mut self, peer: &PeerRecord) -> Result<(), StoreError> {
        let transaction = self.connection.transaction()?;

        transaction
            .prepare_cached(
                "insert or replace into peers (cluster, proc, node, address, claim_id)
                values (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                self.cluster,
                self.proc,
                peer.node as i64,
                peer.address,
                peer.claim_id
            ])?;

        for (name, value) in peer.attributes.iter() {
            Self::upsert_attr(
                &transaction,
                self.cluster,
                self.proc,
                peer.node as i64,
                name,
                value,
            )?;
        }

        transaction.commit()?;
        debug!(node = peer.node, "Recorded peer {}", peer.claim_id);

        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let rows = self
            .connection
            .prepare_cached(
                "select node, address, claim_id from peers
                where cluster = ? and proc = ? order by node",
            )?
            .query_map(params![self.cluster, self.proc], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut peers = Vec::with_capacity(rows.len());
        for (node, address, claim_id) in rows {
            peers.push(PeerRecord {
                node: usize::try_from(node).map_err(|_| StoreError::InvalidNode(node))?,
                address,
                claim_id,
                attributes: self.node_attributes(node)?,
            });
        }

        Ok(peers)
    }

    fn update_attr(
        &mut self,
        node: Option<usize>,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), StoreError> {
        Self::upsert_attr(
            &self.connection,
            self.cluster,
            self.proc,
            node_key(node),
            name,
            value,
        )
    }

    fn lookup_attr(
        &self,
        node: Option<usize>,
        name: &str,
    ) -> Result<Option<AttrValue>, StoreError> {
        let value: Option<String> = self
            .connection
            .prepare_cached(
                "select value from attributes
                where cluster = ? and proc = ? and node = ? and name = ?",
            )?
            .query_row(
                params![self.cluster, self.proc, node_key(node), name],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match value {
            Some(value) => Some(serde_yaml::from_str(&value)?),
            None => None,
        })
    }
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists peers (
    cluster integer not null,
    proc integer not null,
    node integer not null,
    address text not null,
    claim_id text not null,
    primary key (cluster, proc, node)
);",
    "create table if not exists attributes (
    cluster integer not null,
    proc integer not null,
    node integer not null,
    name text not null,
    value text not null,
    primary key (cluster, proc, node, name)
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
