//! Names of things in the hub key space.

/// Artefact records, status, data, errors, links, dependents.
pub const ARTEFACTS: &str = "artefacts";
/// Funsie records and their inp/out/extra side tables.
pub const FUNSIES: &str = "funsies";
/// Operation records, edges, options, owner locks.
pub const OPERATIONS: &str = "operations";
/// Parametric subgraph records.
pub const PARAMETRIC: &str = "parametric";
/// Sorted set of all known full hashes, for short-hash lookup.
pub const HASH_INDEX: &str = "hash.index";
/// Per-DAG operation sets.
pub const DAG_OPERATIONS: &str = "dag.operations";
/// Per-DAG remaining-parents counters.
pub const DAG_STATUS: &str = "dag.status";
/// Set of all active DAG keys.
pub const DAG_INDEX: &str = "dag.index";
/// Terminator operation of a sub-DAG instance.
pub const DAG_TERMINATOR: &str = "dag.terminator";
/// Remaining sub-DAG completions per (parent DAG, originating op).
pub const DAG_SUBDAG_PENDING: &str = "dag.subdag_pending";

/// Sentinel parent for constants and session inputs.
pub const ROOT: &str = "root";

/// Build a hub key `prefix:address`.
#[must_use]
pub fn key(prefix: &str, address: &str) -> String {
    format!("{prefix}:{address}")
}

/// Build a hub key `prefix:address:suffix`.
#[must_use]
pub fn subkey(prefix: &str, address: &str, suffix: &str) -> String {
    format!("{prefix}:{address}:{suffix}")
}
