//! Resolve (short) hashes to graph objects.

use convenient_hub::Hub;

use crate::errors::Result;
use crate::funsie::Funsie;
use crate::graph::{is_artefact, is_operation, Artefact, Operation};
use crate::hashes::hash_load;

/// Any addressable graph entity.
#[derive(Debug, Clone)]
pub enum Object {
    /// An artefact record.
    Artefact(Artefact),
    /// A funsie record.
    Funsie(Funsie),
    /// An operation record.
    Operation(Operation),
}

/// All objects whose hash starts with `prefix`.
///
/// Short-hash collisions are not resolved here: every candidate is
/// returned and the caller decides whether ambiguity is acceptable.
///
/// # Errors
///
/// Propagates hub failures.
pub fn get(hub: &Hub, prefix: &str) -> Result<Vec<Object>> {
    let mut out = Vec::new();
    for hash in hash_load(hub, prefix)? {
        if is_artefact(hub, &hash)? {
            out.push(Object::Artefact(Artefact::grab(hub, &hash)?));
        } else if is_operation(hub, &hash)? {
            out.push(Object::Operation(Operation::grab(hub, &hash)?));
        } else if let Ok(funsie) = Funsie::grab(hub, &hash) {
            out.push(Object::Funsie(funsie));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::put;
    use crate::session::Session;

    #[test]
    fn finds_objects_by_prefix() {
        let session = Session::in_memory();
        let a = put(&session, "findable").unwrap();
        let found = get(&session.hub, a.hash.short()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(&found[0], Object::Artefact(art) if art.hash == a.hash));

        assert!(get(&session.hub, "ffffff").unwrap().is_empty());
    }
}
