use std::fmt;

use serde::Serialize;

use higgstv_db::sqlite::ForeignKeyViolation;

/// Errors listed in the summary before the remainder is elided.
pub const SHOWN_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub total: usize,
    pub migrated: usize,
    /// Already present in the destination.
    pub skipped: usize,
    pub failed: usize,
}

/// A user reference in a channel with no migrated user behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmappedReference {
    pub channel_id: String,
    pub user_id: String,
    /// `owner` or `permission`.
    pub role: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub source_users: i64,
    pub dest_users: i64,
    pub source_channels: i64,
    pub dest_channels: i64,
    pub source_programs: i64,
    pub dest_programs: i64,
    pub mismatches: Vec<String>,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.foreign_key_violations.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub users: EntityStats,
    pub channels: EntityStats,
    pub programs: EntityStats,
    pub counters: EntityStats,
    pub migrations: EntityStats,
    pub errors: Vec<String>,
    pub unmapped_references: Vec<UnmappedReference>,
    pub verification: Option<Verification>,
}

impl MigrationReport {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

fn write_stats(f: &mut fmt::Formatter<'_>, label: &str, s: &EntityStats) -> fmt::Result {
    writeln!(
        f,
        "  {:<11} {:>6} total, {:>6} migrated, {:>6} skipped, {:>6} failed",
        label, s.total, s.migrated, s.skipped, s.failed
    )
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "Migration summary")?;
        writeln!(f, "{}", "=".repeat(50))?;
        write_stats(f, "users", &self.users)?;
        write_stats(f, "channels", &self.channels)?;
        write_stats(f, "programs", &self.programs)?;
        write_stats(f, "counters", &self.counters)?;
        write_stats(f, "migrations", &self.migrations)?;

        if !self.errors.is_empty() {
            writeln!(f, "\nErrors: {}", self.errors.len())?;
            for err in self.errors.iter().take(SHOWN_ERRORS) {
                writeln!(f, "  - {}", err)?;
            }
            if self.errors.len() > SHOWN_ERRORS {
                writeln!(f, "  ... and {} more", self.errors.len() - SHOWN_ERRORS)?;
            }
        }

        if !self.unmapped_references.is_empty() {
            writeln!(f, "\nUnmapped user references: {}", self.unmapped_references.len())?;
            for r in self.unmapped_references.iter().take(SHOWN_ERRORS) {
                writeln!(f, "  - channel {} {} {}", r.channel_id, r.role, r.user_id)?;
            }
        }

        if let Some(v) = &self.verification {
            writeln!(f, "\nVerification")?;
            writeln!(f, "  users:    {} source, {} destination", v.source_users, v.dest_users)?;
            writeln!(f, "  channels: {} source, {} destination", v.source_channels, v.dest_channels)?;
            writeln!(f, "  programs: {} source, {} destination", v.source_programs, v.dest_programs)?;
            for m in &v.mismatches {
                writeln!(f, "  mismatch: {}", m)?;
            }
            for violation in &v.foreign_key_violations {
                writeln!(f, "  foreign key: {}", violation)?;
            }
            writeln!(f, "  result: {}", if v.passed() { "passed" } else { "FAILED" })?;
        }
        Ok(())
    }
}
