//! Statically declared storage mapping for the outbox table.
//!
//! The table, its columns and its indexes are described once as constants.
//! SQL-backed ledgers render their statements from these descriptors. The
//! in-memory ledger builds one ordered set per entry of
//! `OUTBOX_TABLE.indexes`, keyed by the index columns and maintained with
//! `IndexDescriptor::covers`.
//!
//! # Access paths
//! The producer scan ("find undispatched") and the consumer-driven update
//! ("mark received") each get their own filtered index. The two filters are
//! mutually exclusive on `produced_at`, so a row is in at most one of them
//! and the two paths never lock the same index pages.

use std::fmt::Write as _;

use super::record::OutboxRecord;
use super::status::StatusField;

/// One column of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub nullable: bool,
}

/// Which logical access path an index serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPath {
    /// Dispatch scheduler's "select eligible" scan.
    ProducerScan,
    /// Consumer-driven status updates and "unreceived" lookups.
    ConsumerUpdate,
}

/// A filtered (partial) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    /// SQL predicate of the partial index.
    pub filter: &'static str,
    pub access_path: AccessPath,
}

/// A table and everything needed to render its statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [ColumnDescriptor],
    pub indexes: &'static [IndexDescriptor],
}

pub const ID: ColumnDescriptor = ColumnDescriptor {
    name: "id",
    sql_type: "BIGSERIAL",
    nullable: false,
};
pub const GROUP_KEY: ColumnDescriptor = ColumnDescriptor {
    name: "group_key",
    sql_type: "VARCHAR(56)",
    nullable: false,
};
pub const PAYLOAD_REF: ColumnDescriptor = ColumnDescriptor {
    name: "payload_ref",
    sql_type: "TEXT",
    nullable: false,
};
pub const RANK: ColumnDescriptor = ColumnDescriptor {
    name: "rank",
    sql_type: "BIGINT",
    nullable: false,
};
pub const PRODUCED_AT: ColumnDescriptor = ColumnDescriptor {
    name: "produced_at",
    sql_type: "TIMESTAMPTZ",
    nullable: true,
};
pub const RECEIVED_AT: ColumnDescriptor = ColumnDescriptor {
    name: "received_at",
    sql_type: "TIMESTAMPTZ",
    nullable: true,
};
pub const PROCESSED_AT: ColumnDescriptor = ColumnDescriptor {
    name: "processed_at",
    sql_type: "TIMESTAMPTZ",
    nullable: true,
};
pub const RETRY_COUNT: ColumnDescriptor = ColumnDescriptor {
    name: "retry_count",
    sql_type: "INTEGER NOT NULL DEFAULT 0",
    nullable: false,
};
pub const ERROR_CODE: ColumnDescriptor = ColumnDescriptor {
    name: "error_code",
    sql_type: "TEXT",
    nullable: true,
};
pub const CREATED_AT: ColumnDescriptor = ColumnDescriptor {
    name: "created_at",
    sql_type: "TIMESTAMPTZ NOT NULL DEFAULT now()",
    nullable: false,
};

pub const UNDISPATCHED_INDEX: IndexDescriptor = IndexDescriptor {
    name: "ix_outbox_undispatched",
    columns: &["group_key", "rank", "id"],
    filter: "produced_at IS NULL",
    access_path: AccessPath::ProducerScan,
};

pub const UNRECEIVED_INDEX: IndexDescriptor = IndexDescriptor {
    name: "ix_outbox_unreceived",
    columns: &["id"],
    filter: "produced_at IS NOT NULL AND received_at IS NULL",
    access_path: AccessPath::ConsumerUpdate,
};

pub const OUTBOX_TABLE: TableDescriptor = TableDescriptor {
    name: "outbox",
    primary_key: "id",
    columns: &[
        ID,
        GROUP_KEY,
        PAYLOAD_REF,
        RANK,
        PRODUCED_AT,
        RECEIVED_AT,
        PROCESSED_AT,
        RETRY_COUNT,
        ERROR_CODE,
        CREATED_AT,
    ],
    indexes: &[UNDISPATCHED_INDEX, UNRECEIVED_INDEX],
};

impl IndexDescriptor {
    /// Whether `record` satisfies this index's filter, i.e. has an entry in it.
    pub fn covers(&self, record: &OutboxRecord) -> bool {
        match self.access_path {
            AccessPath::ProducerScan => record.produced_at().is_none(),
            AccessPath::ConsumerUpdate => {
                record.produced_at().is_some() && record.received_at.is_none()
            }
        }
    }
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The index dedicated to an access path.
    pub fn index_for(&self, path: AccessPath) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.access_path == path)
    }

    /// `CREATE TABLE` plus one `CREATE INDEX ... WHERE` per filtered index.
    pub fn create_table_sql(&self) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", self.name);
        for column in self.columns {
            let null = if column.nullable || column.sql_type.contains("NOT NULL") {
                ""
            } else {
                " NOT NULL"
            };
            let _ = writeln!(sql, "    {} {}{},", column.name, column.sql_type, null);
        }
        let _ = writeln!(sql, "    PRIMARY KEY ({})\n);", self.primary_key);
        for index in self.indexes {
            let _ = writeln!(
                sql,
                "CREATE INDEX IF NOT EXISTS {} ON {} ({}) WHERE {};",
                index.name,
                self.name,
                index.columns.join(", "),
                index.filter
            );
        }
        sql
    }

    /// Producer scan. `$1` = retry cap, `$2` = limit.
    ///
    /// Rows whose `retry_count` is beyond the cap are dead letters.
    ///
    /// The leading predicate matches the undispatched index filter, so the
    /// planner can only satisfy it from that index.
    pub fn select_eligible_sql(&self) -> String {
        let columns: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        format!(
            "SELECT {} FROM {} WHERE {} AND retry_count <= $1 ORDER BY group_key, rank, id LIMIT $2",
            columns.join(", "),
            self.name,
            UNDISPATCHED_INDEX.filter
        )
    }

    /// One parameterized bulk status update. `$1` = timestamp, `$2` = id array.
    ///
    /// Guarded with `IS NULL` so repeating it is a no-op, and with the
    /// prerequisite column so a status is never written out of order.
    pub fn bulk_update_sql(&self, field: StatusField) -> String {
        let column = field.column().name;
        let mut sql = format!("UPDATE {} SET {} = $1", self.name, column);
        if field == StatusField::Produced {
            sql.push_str(", error_code = NULL");
        }
        let _ = write!(sql, " WHERE id = ANY($2) AND {column} IS NULL");
        if let Some(pre) = field.prerequisite() {
            let _ = write!(sql, " AND {} IS NOT NULL", pre.column().name);
        }
        sql.push_str(" RETURNING id");
        sql
    }

    /// Failure path for a single record. `$1` = error code, `$2` = id.
    pub fn record_failure_sql(&self) -> String {
        format!(
            "UPDATE {} SET retry_count = retry_count + 1, error_code = $1 WHERE id = $2 AND produced_at IS NULL RETURNING retry_count",
            self.name
        )
    }
}
