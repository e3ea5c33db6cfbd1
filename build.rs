//! Build script for ollama-gateway.
//!
//! `sqlx::migrate!` embeds the migrations directory at compile time, so a
//! changed or added migration must trigger a rebuild.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=migrations");
}
