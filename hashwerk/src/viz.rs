//! DOT export of the graph feeding one or more targets.

use std::collections::BTreeSet;

use crate::dag::{ancestors, nearest_operation};
use crate::errors::Result;
use crate::funsie::Funsie;
use crate::graph::{get_status, Artefact, ArtefactStatus, Operation};
use crate::hashes::ContentHash;
use crate::session::Session;

fn status_color(status: ArtefactStatus) -> &'static str {
    match status {
        ArtefactStatus::Done => "green3",
        ArtefactStatus::Const => "dodgerblue3",
        ArtefactStatus::Error => "red2",
        ArtefactStatus::Linked => "darkorchid3",
        _ => "gray60",
    }
}

fn escape(label: &str) -> String {
    let mut short: String = label.chars().take(40).collect();
    if short.len() < label.len() {
        short.push('…');
    }
    short.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Render the closure of operations feeding `targets` as a DOT digraph.
///
/// Operations are boxes labelled with their funsie identity, artefacts are
/// ellipses colored by status.
///
/// # Errors
///
/// Propagates hub failures; unknown targets are reported by the
/// resolution step.
pub fn export_dot(session: &Session, targets: &[ContentHash]) -> Result<String> {
    let hub = &session.hub;
    let mut ops: BTreeSet<ContentHash> = BTreeSet::new();
    for target in targets {
        if let Some(op) = nearest_operation(hub, target)? {
            ops.extend(ancestors(hub, &[op.hash.clone()], true)?);
            ops.insert(op.hash);
        }
    }

    let mut artefacts: BTreeSet<ContentHash> = BTreeSet::new();
    let mut lines = vec![
        "digraph hashwerk {".to_string(),
        "  rankdir=LR;".to_string(),
        "  node [fontname=\"monospace\", fontsize=10];".to_string(),
    ];

    for op in &ops {
        let node = Operation::grab(hub, op)?;
        let funsie = Funsie::grab(hub, &node.funsie)?;
        lines.push(format!(
            "  \"{op}\" [shape=box, label=\"{}\\n{}\"];",
            escape(&funsie.what),
            op.short()
        ));
        for (name, input) in &node.inp {
            artefacts.insert(input.clone());
            lines.push(format!(
                "  \"{input}\" -> \"{op}\" [label=\"{}\"];",
                escape(name)
            ));
        }
        for (name, output) in &node.out {
            artefacts.insert(output.clone());
            lines.push(format!(
                "  \"{op}\" -> \"{output}\" [label=\"{}\"];",
                escape(name)
            ));
        }
    }

    for artefact in &artefacts {
        let status = get_status(hub, artefact)?;
        let kind = Artefact::grab(hub, artefact)
            .map(|a| a.kind.as_str())
            .unwrap_or("?");
        lines.push(format!(
            "  \"{artefact}\" [shape=ellipse, color={}, label=\"{} ({kind})\"];",
            status_color(status),
            artefact.short()
        ));
    }

    lines.push("}".to_string());
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{put, Shell};

    #[test]
    fn exports_ops_and_artefacts() {
        let session = Session::in_memory();
        let a = put(&session, "data").unwrap();
        let out = Shell::new()
            .cmd("cat f1")
            .input("f1", &a)
            .call(&session)
            .unwrap();

        let dot = export_dot(&session, &[out.hash.clone()]).unwrap();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains(out.hash.as_str()));
        assert!(dot.contains(a.hash.as_str()));
        assert!(dot.contains("shape=box"));
        assert!(dot.contains("dodgerblue3"));
    }
}
