pub mod ident;
pub mod models;

/// Collection names shared by both storage backends.
pub mod collections {
    pub const USERS: &str = "users";
    pub const CHANNELS: &str = "channels";
    pub const PROGRAMS: &str = "programs";
    pub const COUNTERS: &str = "counters";
    pub const MIGRATIONS: &str = "migrations";
}

/// Name of the counter that allocates program identifiers.
pub const PROGRAM_ID_COUNTER: &str = "program_id";
