//! Table definitions, insert statements and additive migrations.
//!
//! Every statement here is idempotent so setup can run on every start:
//! `CREATE TABLE IF NOT EXISTS`, `CREATE INDEX IF NOT EXISTS` (MariaDB) and
//! column migrations guarded by an `information_schema` lookup.

use crate::persistence::record::RecordKind;

/// What happens when a row collides with an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// `INSERT IGNORE`: duplicate keys are dropped silently.
    IgnoreDuplicates,
    /// Plain `INSERT` into a table with a surrogate key.
    Append,
}

/// Multi-row insert for one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertStatement {
    /// Backing table.
    pub table: &'static str,
    /// Column names in bind order.
    pub columns: &'static [&'static str],
    /// Behavior on a natural key clash.
    pub conflict: ConflictPolicy,
    /// Leading columns forming the natural key; 0 for append-only tables.
    pub key_len: usize,
}

impl InsertStatement {
    /// `INSERT [IGNORE] INTO `T` (`a`, `b`) VALUES ` without the value tuples.
    pub fn prefix(&self) -> String {
        let verb = match self.conflict {
            ConflictPolicy::IgnoreDuplicates => "INSERT IGNORE INTO",
            ConflictPolicy::Append => "INSERT INTO",
        };
        let columns = self
            .columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{verb} `{}` ({columns}) VALUES ", self.table)
    }

    /// Rows per statement that keep the bind count under `max_placeholders`.
    pub fn rows_per_chunk(&self, max_placeholders: usize) -> usize {
        (max_placeholders / self.columns.len().max(1)).max(1)
    }
}

/// DDL of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    /// Record kind stored here.
    pub kind: RecordKind,
    /// `CREATE TABLE IF NOT EXISTS` statement.
    pub create: &'static str,
    /// `CREATE INDEX` statements run after the table exists.
    pub indexes: &'static [&'static str],
    /// Insert used by the writer.
    pub insert: InsertStatement,
}

/// Column added after the table was first deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMigration {
    /// Table to alter.
    pub table: &'static str,
    /// Column to add.
    pub column: &'static str,
    /// SQL type and default of the column.
    pub definition: &'static str,
}

impl ColumnMigration {
    /// `ALTER TABLE ... ADD COLUMN` for this migration.
    pub fn alter_statement(&self) -> String {
        format!(
            "ALTER TABLE `{}` ADD COLUMN `{}` {}",
            self.table, self.column, self.definition
        )
    }
}

/// Every table, in [`RecordKind`] order.
pub const TABLES: [TableSchema; 9] = [
    TableSchema {
        kind: RecordKind::Daq,
        create: "CREATE TABLE IF NOT EXISTS LS_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `RTD_1` FLOAT NULL, `RTD_2` FLOAT NULL,
            `DIST_1` FLOAT NULL, `DIST_2` FLOAT NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_ls_datetime ON LS_DATA (datetime)"],
        insert: InsertStatement {
            table: "LS_DATA",
            columns: &["datetime", "RTD_1", "RTD_2", "DIST_1", "DIST_2"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::Radon,
        create: "CREATE TABLE IF NOT EXISTS RADON_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `mu` FLOAT NULL, `sigma` FLOAT NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_radon_datetime ON RADON_DATA (datetime)"],
        insert: InsertStatement {
            table: "RADON_DATA",
            columns: &["datetime", "mu", "sigma"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::Magnetometer,
        create: "CREATE TABLE IF NOT EXISTS MAGNETOMETER_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `Bx` FLOAT NULL, `By` FLOAT NULL,
            `Bz` FLOAT NULL, `B_mag` FLOAT NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_mag_datetime ON MAGNETOMETER_DATA (datetime)"],
        insert: InsertStatement {
            table: "MAGNETOMETER_DATA",
            columns: &["datetime", "Bx", "By", "Bz", "B_mag"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::ThO2,
        create: "CREATE TABLE IF NOT EXISTS TH_O2_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `temperature` FLOAT NULL,
            `humidity` FLOAT NULL, `oxygen` FLOAT NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_tho2_datetime ON TH_O2_DATA (datetime)"],
        insert: InsertStatement {
            table: "TH_O2_DATA",
            columns: &["datetime", "temperature", "humidity", "oxygen"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::Ups,
        create: "CREATE TABLE IF NOT EXISTS UPS_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `status` VARCHAR(64) NULL,
            `linev` FLOAT NULL, `bcharge` FLOAT NULL, `timeleft` FLOAT NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_ups_datetime ON UPS_DATA (datetime)"],
        insert: InsertStatement {
            table: "UPS_DATA",
            columns: &["datetime", "status", "linev", "bcharge", "timeleft"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::Fire,
        create: "CREATE TABLE IF NOT EXISTS FIRE_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `status_code` INT NULL,
            `is_fire` BOOLEAN NULL, `is_fault` BOOLEAN NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_fire_datetime ON FIRE_DATA (datetime)"],
        insert: InsertStatement {
            table: "FIRE_DATA",
            columns: &["datetime", "status_code", "is_fire", "is_fault"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::Voc,
        create: "CREATE TABLE IF NOT EXISTS VOC_DATA (
            `datetime` DATETIME NOT NULL PRIMARY KEY, `concentration` FLOAT NULL,
            `alarm` INT NULL, `unit` VARCHAR(16) NULL)",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_voc_datetime ON VOC_DATA (datetime)"],
        insert: InsertStatement {
            table: "VOC_DATA",
            columns: &["datetime", "concentration", "alarm", "unit"],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 1,
        },
    },
    TableSchema {
        kind: RecordKind::Hv,
        create: "CREATE TABLE IF NOT EXISTS HV_DATA (
            `datetime` DATETIME, `slot` INT, `channel` INT, `power` BOOLEAN, `vmon` FLOAT,
            `imon` FLOAT, `v0set` FLOAT, `i0set` FLOAT, `status` INT,
            PRIMARY KEY (`datetime`, `slot`, `channel`))",
        indexes: &["CREATE INDEX IF NOT EXISTS idx_hv_datetime ON HV_DATA (datetime)"],
        insert: InsertStatement {
            table: "HV_DATA",
            columns: &[
                "datetime", "slot", "channel", "power", "vmon", "imon", "v0set", "i0set", "status",
            ],
            conflict: ConflictPolicy::IgnoreDuplicates,
            key_len: 3,
        },
    },
    TableSchema {
        kind: RecordKind::Pdu,
        create: "CREATE TABLE IF NOT EXISTS PDU_DATA (
            `id` BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, `datetime` DATETIME(3) NOT NULL,
            `port` INT NOT NULL, `state` BOOLEAN NULL, `power_w` FLOAT NULL,
            `current_ma` FLOAT NULL, `energy_wh` FLOAT NULL)",
        indexes: &[
            "CREATE INDEX IF NOT EXISTS idx_pdu_datetime ON PDU_DATA (datetime)",
            "CREATE INDEX IF NOT EXISTS idx_pdu_datetime_port ON PDU_DATA (datetime, port)",
        ],
        insert: InsertStatement {
            table: "PDU_DATA",
            columns: &["datetime", "port", "state", "power_w", "current_ma", "energy_wh"],
            conflict: ConflictPolicy::Append,
            key_len: 0,
        },
    },
];

/// Columns added to existing deployments at startup.
pub const MIGRATIONS: [ColumnMigration; 3] = [
    ColumnMigration {
        table: "PDU_DATA",
        column: "energy_wh",
        definition: "FLOAT NULL",
    },
    ColumnMigration {
        table: "VOC_DATA",
        column: "unit",
        definition: "VARCHAR(16) NULL",
    },
    ColumnMigration {
        table: "HV_DATA",
        column: "status",
        definition: "INT NULL",
    },
];

/// Schema of the table backing `kind`.
pub fn table_schema(kind: RecordKind) -> &'static TableSchema {
    // TABLES is declared in RecordKind order.
    &TABLES[kind as usize]
}

/// Insert for `kind`.
pub fn insert_statement(kind: RecordKind) -> &'static InsertStatement {
    &table_schema(kind).insert
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_its_own_table() {
        for kind in RecordKind::ALL {
            let schema = table_schema(kind);
            assert_eq!(schema.kind, kind);
            assert_eq!(schema.insert.table, kind.table());
            assert!(schema.create.contains(kind.table()));
            assert!(!schema.indexes.is_empty());
        }
    }

    #[test]
    fn insert_prefix_uses_conflict_policy() {
        assert_eq!(
            insert_statement(RecordKind::Radon).prefix(),
            "INSERT IGNORE INTO `RADON_DATA` (`datetime`, `mu`, `sigma`) VALUES "
        );
        assert!(insert_statement(RecordKind::Pdu)
            .prefix()
            .starts_with("INSERT INTO `PDU_DATA`"));
    }

    #[test]
    fn chunking_respects_placeholder_limit() {
        let hv = insert_statement(RecordKind::Hv);
        let rows = hv.rows_per_chunk(65_535);
        assert_eq!(rows, 7281);
        assert!(rows * hv.columns.len() <= 65_535);
    }

    #[test]
    fn migrations_target_known_columns() {
        for migration in MIGRATIONS {
            let schema = TABLES
                .iter()
                .find(|t| t.insert.table == migration.table)
                .unwrap();
            assert!(schema.insert.columns.contains(&migration.column));
        }
        assert_eq!(
            MIGRATIONS[0].alter_statement(),
            "ALTER TABLE `PDU_DATA` ADD COLUMN `energy_wh` FLOAT NULL"
        );
    }
}
