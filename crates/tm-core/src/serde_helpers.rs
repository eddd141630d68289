//! Shared serde default functions used by the configuration types.

pub fn default_lock_timeout_secs() -> u64 {
    15
}

pub fn default_lease_ttl_secs() -> u64 {
    30
}

pub fn default_migration_timeout_secs() -> u64 {
    300
}

pub fn default_sequence_digits() -> usize {
    6
}
