// ── Credence Atoms Layer ─────────────────────────────────────────────────────
// Pure data types, profiles, and error definitions — zero side effects, no
// I/O, no locking. Dependency rule: atoms may only depend on std and external
// pure crates. Nothing here may import from engine/.

pub mod error;
pub mod profile;
pub mod types;
