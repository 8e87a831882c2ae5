//! Parametric subgraphs: freeze a piece of workflow, replay it with new
//! inputs.
//!
//! A parametric names the operations connecting declared input artefacts
//! to declared output artefacts, in topological order. Committing one
//! hashes the subgraph *symbolically* (input hashes replaced by their
//! declared names) so the identity is independent of the particular values
//! it was built with. Recalling re-runs `make_op` over the saved order
//! with substituted inputs; since operation identity is hash-determined,
//! unchanged subtrees are shared with the original.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use convenient_hub::{Cmd, Hub};
use tracing::error;

use crate::constants::{key, subkey, ARTEFACTS, OPERATIONS, PARAMETRIC};
use crate::dag::{ancestors, descendants};
use crate::errors::{EngineError, Result};
use crate::funsie::Funsie;
use crate::graph::{make_op, Artefact, Operation, Parent};
use crate::hashes::{hash_save_cmd, ContentHash, Hasher};
use crate::session::Session;

const NAMES_KEY: &str = "parametric:names";

/// The operations connecting `inputs` to `outputs`: the intersection of
/// the outputs' ancestor cone and the inputs' dependent cone.
fn parametrize_subgraph(
    hub: &Hub,
    inputs: &BTreeMap<String, Artefact>,
    outputs: &BTreeMap<String, Artefact>,
) -> Result<BTreeSet<ContentHash>> {
    let mut output_ops = Vec::new();
    for (name, artefact) in outputs {
        match &artefact.parent {
            Parent::Root => return Err(EngineError::ParametricRoot(name.clone())),
            Parent::Op(op) => output_ops.push(op.clone()),
        }
    }
    let mut out_ancestors = ancestors(hub, &output_ops, false)?;
    out_ancestors.extend(output_ops);

    let mut input_ops: Vec<ContentHash> = Vec::new();
    for (name, artefact) in inputs {
        let mut found = false;
        for dependent in
            hub.smembers(&subkey(ARTEFACTS, artefact.hash.as_str(), "dependents"))?
        {
            let dependent = ContentHash::from_hex(&dependent)?;
            if out_ancestors.contains(&dependent) {
                input_ops.push(dependent.clone());
                found = true;
            }
        }
        if !found {
            error!("parametrized input {name} does not change any outputs");
        }
    }
    let mut in_descendants = descendants(hub, &input_ops)?;
    in_descendants.extend(input_ops);

    Ok(out_ancestors
        .intersection(&in_descendants)
        .cloned()
        .collect())
}

/// Parent-to-children edges restricted to the subgraph.
fn subgraph_edges(
    hub: &Hub,
    nodes: &BTreeSet<ContentHash>,
) -> Result<HashMap<ContentHash, BTreeSet<ContentHash>>> {
    let mut edges: HashMap<ContentHash, BTreeSet<ContentHash>> = HashMap::new();
    for node in nodes {
        for raw in hub.smembers(&subkey(OPERATIONS, node.as_str(), "parents"))? {
            if raw == crate::constants::ROOT {
                continue;
            }
            let parent = ContentHash::from_hex(&raw)?;
            if nodes.contains(&parent) {
                edges.entry(parent).or_default().insert(node.clone());
            }
        }
    }
    Ok(edges)
}

/// Kahn's algorithm over the restricted edge set.
fn subgraph_toposort(
    nodes: &BTreeSet<ContentHash>,
    edges: &HashMap<ContentHash, BTreeSet<ContentHash>>,
) -> Vec<ContentHash> {
    let mut in_degree: BTreeMap<ContentHash, usize> =
        nodes.iter().map(|n| (n.clone(), 0)).collect();
    for children in edges.values() {
        for child in children {
            if let Some(d) = in_degree.get_mut(child) {
                *d += 1;
            }
        }
    }
    let mut ready: Vec<ContentHash> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| n.clone())
        .collect();
    let mut sorted = Vec::new();
    while let Some(node) = ready.pop() {
        sorted.push(node.clone());
        if let Some(children) = edges.get(&node) {
            for child in children {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(child.clone());
                    }
                }
            }
        }
    }
    sorted
}

/// Symbolic re-hash of the subgraph: inputs become their declared names,
/// each op is re-hashed by the usual rule, synthesized outputs become
/// `<ophash>:<name>` strings.
fn hash_parametric(
    hub: &Hub,
    sorted_nodes: &[ContentHash],
    inputs: &BTreeMap<String, Artefact>,
    outputs: &BTreeMap<String, Artefact>,
) -> Result<ContentHash> {
    let mut translation: HashMap<String, String> = HashMap::new();
    for (name, artefact) in inputs {
        translation.insert(artefact.hash.as_str().to_string(), name.clone());
    }

    for node in sorted_nodes {
        let op = Operation::grab(hub, node)?;
        let mut substituted = BTreeMap::new();
        for (slot, input_hash) in &op.inp {
            let sub = translation
                .entry(input_hash.as_str().to_string())
                .or_insert_with(|| input_hash.as_str().to_string())
                .clone();
            substituted.insert(slot.clone(), sub);
        }
        let mut hasher = Hasher::new();
        hasher.update(b"op");
        hasher.update(op.funsie.as_str());
        for (slot, sub) in &substituted {
            hasher.update(format!("file={slot}, hash={sub}"));
        }
        let symbolic = hasher.finish();
        for (slot, out_hash) in &op.out {
            translation.insert(
                out_hash.as_str().to_string(),
                format!("{symbolic}:{slot}"),
            );
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(b"parametric");
    for (name, artefact) in outputs {
        let sub = translation
            .get(artefact.hash.as_str())
            .cloned()
            .unwrap_or_else(|| artefact.hash.as_str().to_string());
        hasher.update(format!("output:{name}, hash:{sub}"));
    }
    Ok(hasher.finish())
}

/// A named, frozen subgraph.
#[derive(Debug, Clone)]
pub struct Parametric {
    /// Lookup name.
    pub name: String,
    /// Symbolic content hash.
    pub hash: ContentHash,
    /// Operations in topological order.
    pub ops: Vec<ContentHash>,
    /// Declared input name to original artefact hash.
    pub inp: BTreeMap<String, ContentHash>,
    /// Declared output name to original artefact hash.
    pub out: BTreeMap<String, ContentHash>,
}

impl Parametric {
    /// Save to the hub, including the name reverse-lookup.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn put(&self, hub: &Hub) -> Result<()> {
        let mut cmds = vec![Cmd::Del {
            key: key(PARAMETRIC, self.hash.as_str()),
        }];
        for op in &self.ops {
            cmds.push(Cmd::RPush {
                key: key(PARAMETRIC, self.hash.as_str()),
                value: op.as_str().as_bytes().to_vec(),
            });
        }
        cmds.push(Cmd::HSetMap {
            key: subkey(PARAMETRIC, self.hash.as_str(), "inp"),
            entries: self
                .inp
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().as_bytes().to_vec()))
                .collect(),
        });
        cmds.push(Cmd::HSetMap {
            key: subkey(PARAMETRIC, self.hash.as_str(), "out"),
            entries: self
                .out
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().as_bytes().to_vec()))
                .collect(),
        });
        cmds.push(Cmd::Set {
            key: subkey(PARAMETRIC, self.hash.as_str(), "name"),
            value: self.name.as_bytes().to_vec(),
        });
        cmds.push(Cmd::HSet {
            key: NAMES_KEY.to_string(),
            field: self.name.clone(),
            value: self.hash.as_str().as_bytes().to_vec(),
        });
        cmds.push(hash_save_cmd(&self.hash));
        hub.pipeline(cmds)?;
        Ok(())
    }

    /// Load from the hub by hash.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Missing` when nothing is stored under the
    /// hash.
    pub fn grab(hub: &Hub, hash: &ContentHash) -> Result<Self> {
        let raw_ops = hub.lrange(&key(PARAMETRIC, hash.as_str()))?;
        if raw_ops.is_empty() {
            return Err(EngineError::Missing {
                kind: "parametric",
                address: hash.as_str().to_string(),
            });
        }
        let ops = raw_ops
            .iter()
            .map(|raw| ContentHash::from_hex(&String::from_utf8_lossy(raw)))
            .collect::<Result<Vec<_>>>()?;
        let parse = |raw: BTreeMap<String, Vec<u8>>| -> Result<BTreeMap<String, ContentHash>> {
            raw.into_iter()
                .map(|(k, v)| Ok((k, ContentHash::from_hex(&String::from_utf8_lossy(&v))?)))
                .collect()
        };
        let inp = parse(hub.hgetall(&subkey(PARAMETRIC, hash.as_str(), "inp"))?)?;
        let out = parse(hub.hgetall(&subkey(PARAMETRIC, hash.as_str(), "out"))?)?;
        let name = hub
            .get(&subkey(PARAMETRIC, hash.as_str(), "name"))?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .ok_or(EngineError::Corrupt {
                kind: "parametric",
                address: hash.as_str().to_string(),
            })?;
        Ok(Self {
            name,
            hash: hash.clone(),
            ops,
            inp,
            out,
        })
    }

    /// Resolve a parametric hash by name.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn resolve_name(hub: &Hub, name: &str) -> Result<Option<ContentHash>> {
        hub.hget(NAMES_KEY, name)?
            .map(|raw| ContentHash::from_hex(&String::from_utf8_lossy(&raw)))
            .transpose()
    }

    /// Rebuild the subgraph with `new_inputs` substituted for the declared
    /// inputs. Returns the substituted output artefacts.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UndefinedInput` for missing substitutions and
    /// propagates hub failures.
    pub fn evaluate(
        &self,
        session: &Session,
        new_inputs: &BTreeMap<String, Artefact>,
    ) -> Result<BTreeMap<String, Artefact>> {
        let mut translation: HashMap<ContentHash, Artefact> = HashMap::new();
        for (name, original) in &self.inp {
            let replacement = new_inputs
                .get(name)
                .ok_or_else(|| EngineError::UndefinedInput(name.clone()))?;
            translation.insert(original.clone(), replacement.clone());
        }

        for node in &self.ops {
            let op = Operation::grab(&session.hub, node)?;
            let mut inp = BTreeMap::new();
            for (slot, input_hash) in &op.inp {
                if !translation.contains_key(input_hash) {
                    translation.insert(
                        input_hash.clone(),
                        Artefact::grab(&session.hub, input_hash)?,
                    );
                }
                inp.insert(slot.clone(), translation[input_hash].clone());
            }
            let funsie = Funsie::grab(&session.hub, &op.funsie)?;
            let new_op = make_op(&session.hub, &funsie, &inp, &op.options)?;
            for (slot, out_hash) in &new_op.out {
                translation.insert(
                    op.out[slot].clone(),
                    Artefact::grab(&session.hub, out_hash)?,
                );
            }
        }

        let mut outputs = BTreeMap::new();
        for (name, original) in &self.out {
            let artefact = translation
                .get(original)
                .cloned()
                .ok_or(EngineError::Corrupt {
                    kind: "parametric",
                    address: self.hash.as_str().to_string(),
                })?;
            outputs.insert(name.clone(), artefact);
        }
        Ok(outputs)
    }
}

/// Freeze the subgraph connecting `inp` to `out` under `name`.
///
/// # Errors
///
/// Returns `EngineError::ParametricRoot` when a declared output is a
/// constant, and propagates hub failures.
pub fn make_parametric(
    session: &Session,
    name: &str,
    inp: &BTreeMap<String, Artefact>,
    out: &BTreeMap<String, Artefact>,
) -> Result<Parametric> {
    let nodes = parametrize_subgraph(&session.hub, inp, out)?;
    let edges = subgraph_edges(&session.hub, &nodes)?;
    let sorted = subgraph_toposort(&nodes, &edges);

    let param = Parametric {
        name: name.to_string(),
        hash: hash_parametric(&session.hub, &sorted, inp, out)?,
        ops: sorted,
        inp: inp
            .iter()
            .map(|(k, v)| (k.clone(), v.hash.clone()))
            .collect(),
        out: out
            .iter()
            .map(|(k, v)| (k.clone(), v.hash.clone()))
            .collect(),
    };
    param.put(&session.hub)?;
    Ok(param)
}

/// Recall a parametric by name or hash prefix and evaluate it with new
/// inputs.
///
/// # Errors
///
/// Returns `EngineError::UnknownHash` when nothing matches, and propagates
/// evaluation failures.
pub fn recall(
    session: &Session,
    name_or_hash: &str,
    new_inputs: &BTreeMap<String, Artefact>,
) -> Result<BTreeMap<String, Artefact>> {
    let hash = match Parametric::resolve_name(&session.hub, name_or_hash)? {
        Some(hash) => hash,
        None => ContentHash::from_hex(name_or_hash)
            .map_err(|_| EngineError::UnknownHash(name_or_hash.to_string()))?,
    };
    let param = Parametric::grab(&session.hub, &hash)?;
    param.evaluate(session, new_inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn toposort_respects_edges() {
        let mk = |c: char| {
            ContentHash::from_hex(&format!("{}", c).repeat(40)).unwrap()
        };
        let a = mk('a');
        let b = mk('b');
        let c = mk('c');
        let nodes: BTreeSet<ContentHash> = [a.clone(), b.clone(), c.clone()].into();
        let mut edges: HashMap<ContentHash, BTreeSet<ContentHash>> = HashMap::new();
        edges.insert(a.clone(), [b.clone()].into());
        edges.insert(b.clone(), [c.clone()].into());

        let sorted = subgraph_toposort(&nodes, &edges);
        assert_eq!(sorted, vec![a, b, c]);
    }
}
