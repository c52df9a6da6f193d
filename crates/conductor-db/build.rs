//! Build script for the embedded migrations.
//!
//! `sqlx::migrate!` reads `migrations/` at compile time, so the crate must be
//! rebuilt whenever a migration is added or edited.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
