//! Dialect adapters: the per-engine query strings.
//!
//! The dialect is a tagged set of query providers selected once at connect
//! time from the live connection's product name. Most of the query set is
//! shared; only the upserts differ, because each engine spells
//! insert-or-update its own way. Every template holds a `{}` placeholder at
//! each table reference, substituted with the configured prefix before
//! execution.

/// The target engine flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Embedded SQLite databases.
    Sqlite,
    /// MySQL servers.
    Mysql,
}

impl Dialect {
    /// Looks up the adapter for a lowercased product name.
    #[must_use]
    pub fn for_product(name: &str) -> Option<Self> {
        match name {
            "sqlite" => Some(Self::Sqlite),
            "mysql" => Some(Self::Mysql),
            _ => None,
        }
    }

    /// The adapter's product name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
        }
    }

    /// The bundled schema deployment script.
    pub(crate) fn schema_script(self) -> &'static str {
        match self {
            Self::Sqlite => include_str!("deploy/sqlite.sql"),
            Self::Mysql => include_str!("deploy/mysql.sql"),
        }
    }

    /// Upsert for the global parameter table: an existing key gets its
    /// value updated in place.
    pub(crate) fn insert_global_parameter(self) -> &'static str {
        match self {
            Self::Sqlite => "INSERT OR REPLACE INTO {}global (`key`, `value`) VALUES (?, ?)",
            Self::Mysql => {
                "INSERT INTO {}global (`key`, `value`) VALUES (?, ?) \
                 ON DUPLICATE KEY UPDATE `value` = VALUES(`value`)"
            }
        }
    }

    /// Upsert for permission rows: an existing (segment, key) pair gets its
    /// value updated in place.
    pub(crate) fn insert_permission(self) -> &'static str {
        match self {
            Self::Sqlite => {
                "INSERT INTO {}permissions (segment, `key`, `value`) VALUES (?, ?, ?) \
                 ON CONFLICT (segment, `key`) DO UPDATE SET `value` = excluded.`value`"
            }
            Self::Mysql => {
                "INSERT INTO {}permissions (segment, `key`, `value`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `value` = VALUES(`value`)"
            }
        }
    }

    /// Upsert for option rows: an existing (segment, key) pair gets its
    /// value updated in place.
    pub(crate) fn insert_option(self) -> &'static str {
        match self {
            Self::Sqlite => {
                "INSERT INTO {}options (segment, `key`, `value`) VALUES (?, ?, ?) \
                 ON CONFLICT (segment, `key`) DO UPDATE SET `value` = excluded.`value`"
            }
            Self::Mysql => {
                "INSERT INTO {}options (segment, `key`, `value`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `value` = VALUES(`value`)"
            }
        }
    }
}

/// Query templates shared between dialects.
pub(crate) mod queries {
    pub const SELECT_GLOBAL_PARAMETER: &str = "SELECT `value` FROM {}global WHERE `key` = ?";
    pub const DELETE_GLOBAL_PARAMETER: &str = "DELETE FROM {}global WHERE `key` = ?";

    pub const SELECT_SUBJECT_BY_ID: &str =
        "SELECT type, identifier FROM {}subjects WHERE id = ?";
    pub const SELECT_SUBJECT_BY_NAME: &str =
        "SELECT id FROM {}subjects WHERE type = ? AND identifier = ?";
    pub const INSERT_SUBJECT: &str = "INSERT INTO {}subjects (type, identifier) VALUES (?, ?)";
    pub const DELETE_SUBJECT_BY_ID: &str = "DELETE FROM {}subjects WHERE id = ?";
    pub const DELETE_SUBJECT_BY_NAME: &str =
        "DELETE FROM {}subjects WHERE type = ? AND identifier = ?";
    pub const SELECT_SUBJECT_IDENTIFIERS: &str =
        "SELECT identifier FROM {}subjects WHERE type = ?";
    pub const SELECT_SUBJECT_TYPES: &str = "SELECT DISTINCT type FROM {}subjects";
    pub const SELECT_ALL_SUBJECTS: &str = "SELECT id, type, identifier FROM {}subjects";

    pub const SELECT_SEGMENTS_BY_SUBJECT: &str =
        "SELECT id, perm_default FROM {}segments WHERE subject = ?";
    pub const INSERT_SEGMENT: &str =
        "INSERT INTO {}segments (subject, perm_default) VALUES (?, ?)";
    pub const DELETE_SEGMENT: &str = "DELETE FROM {}segments WHERE id = ?";
    pub const UPDATE_SEGMENT_DEFAULT: &str =
        "UPDATE {}segments SET perm_default = ? WHERE id = ?";

    pub const SELECT_CONTEXTS_BY_SEGMENT: &str =
        "SELECT `key`, `value` FROM {}contexts WHERE segment = ?";
    pub const INSERT_CONTEXT: &str =
        "INSERT INTO {}contexts (segment, `key`, `value`) VALUES (?, ?, ?)";
    pub const DELETE_CONTEXTS: &str = "DELETE FROM {}contexts WHERE segment = ?";

    pub const SELECT_PERMISSIONS_BY_SEGMENT: &str =
        "SELECT `key`, `value` FROM {}permissions WHERE segment = ?";
    pub const DELETE_PERMISSION_KEY: &str =
        "DELETE FROM {}permissions WHERE segment = ? AND `key` = ?";
    pub const DELETE_PERMISSIONS: &str = "DELETE FROM {}permissions WHERE segment = ?";

    pub const SELECT_OPTIONS_BY_SEGMENT: &str =
        "SELECT `key`, `value` FROM {}options WHERE segment = ?";
    pub const DELETE_OPTION_KEY: &str =
        "DELETE FROM {}options WHERE segment = ? AND `key` = ?";
    pub const DELETE_OPTIONS: &str = "DELETE FROM {}options WHERE segment = ?";

    pub const SELECT_PARENTS_BY_SEGMENT: &str =
        "SELECT `{}subjects`.`id`, `{}subjects`.`type`, `{}subjects`.`identifier` \
         FROM {}inheritance LEFT JOIN {}subjects \
         ON `{}inheritance`.`parent` = `{}subjects`.`id` \
         WHERE `{}inheritance`.`segment` = ?";
    pub const INSERT_PARENT: &str =
        "INSERT INTO {}inheritance (segment, parent) VALUES (?, ?)";
    pub const DELETE_PARENT: &str =
        "DELETE FROM {}inheritance WHERE segment = ? AND parent = ?";
    pub const DELETE_PARENTS: &str = "DELETE FROM {}inheritance WHERE segment = ?";

    pub const SELECT_CONTEXT_INHERITANCE: &str =
        "SELECT child_key, child_value, parent_key, parent_value \
         FROM {}context_inheritance ORDER BY id ASC";
    pub const INSERT_CONTEXT_INHERITANCE: &str =
        "INSERT INTO {}context_inheritance (child_key, child_value, parent_key, parent_value) \
         VALUES (?, ?, ?, ?)";
    pub const DELETE_CONTEXT_INHERITANCE_CHILD: &str =
        "DELETE FROM {}context_inheritance WHERE child_key = ? AND child_value = ?";

    pub const SELECT_RANK_LADDER: &str =
        "SELECT `{}subjects`.`id`, `{}subjects`.`type`, `{}subjects`.`identifier` \
         FROM {}rank_ladders LEFT JOIN {}subjects \
         ON `{}rank_ladders`.`subject` = `{}subjects`.`id` \
         WHERE `{}rank_ladders`.`name` = ? ORDER BY `{}rank_ladders`.`id` ASC";
    pub const TEST_RANK_LADDER: &str =
        "SELECT id FROM {}rank_ladders WHERE name = ? LIMIT 1";
    pub const INSERT_RANK_LADDER: &str =
        "INSERT INTO {}rank_ladders (name, subject) VALUES (?, ?)";
    pub const DELETE_RANK_LADDER: &str = "DELETE FROM {}rank_ladders WHERE name = ?";
    pub const SELECT_RANK_LADDER_NAMES: &str = "SELECT DISTINCT name FROM {}rank_ladders";
}
