//! CLI command implementations

pub(crate) mod common;
pub(crate) mod create;
pub(crate) mod down;
pub(crate) mod force;
pub(crate) mod status;
pub(crate) mod up;
pub(crate) mod validate;
pub(crate) mod version;
