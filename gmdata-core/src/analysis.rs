//! Per-entry disassembly and control-flow analysis over a whole container.
//!
//! Entries are independent read-only work items. They are spread over scoped worker threads and
//! every entry reports its own result, so a failing entry never takes its siblings down.

use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crate::bytecode::cfg::{self, Cfg};
use crate::bytecode::disasm::disassemble;
use crate::error::{Error, Result};
use crate::format::chunks::code::CodeEntry;
use crate::format::container::Container;
use crate::format::resolver::Id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAnalysis {
    pub listing: String,
    pub cfg: Cfg,
}

#[derive(Debug)]
pub struct EntryReport {
    pub id: Id<CodeEntry>,
    pub name: String,
    pub result: Result<EntryAnalysis>,
}

pub fn analyze_entry(container: &Container, id: Id<CodeEntry>) -> Result<EntryAnalysis> {
    let code = container
        .code()
        .ok_or_else(|| Error::InvariantViolation("container has no decoded CODE chunk".into()))?;
    let view = code.view(id)?;
    Ok(EntryAnalysis {
        listing: disassemble(&view, container),
        cfg: cfg::build(&view)?,
    })
}

fn analyze_isolated(container: &Container, id: Id<CodeEntry>) -> EntryReport {
    let result = panic::catch_unwind(AssertUnwindSafe(|| analyze_entry(container, id)))
        .unwrap_or_else(|payload| {
            let what = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::InvariantViolation(format!("analysis panicked: {what}")))
        });
    if let Err(e) = &result {
        log::warn!("code entry {}: {e}", id.index());
    }
    EntryReport {
        id,
        name: container
            .entry_name(id)
            .map_or_else(|| format!("entry{}", id.index()), |n| n.into_owned()),
        result,
    }
}

/// Analyze every code entry. Reports come back in table order.
pub fn analyze_all(container: &Container) -> Vec<EntryReport> {
    let Some(code) = container.code() else {
        return Vec::new();
    };
    let ids: Vec<Id<CodeEntry>> = code.entries.iter().map(|(id, _)| id).collect();
    if ids.is_empty() {
        return Vec::new();
    }

    let workers = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    let per_worker = ids.len().div_ceil(workers);
    log::debug!("analyzing {} code entries on {workers} workers", ids.len());

    thread::scope(|scope| {
        let handles: Vec<_> = ids
            .chunks(per_worker)
            .map(|batch| {
                scope.spawn(move || {
                    batch
                        .iter()
                        .map(|&id| analyze_isolated(container, id))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(ids.chunks(per_worker))
            .flat_map(|(handle, batch)| {
                // a batch only panics outside `analyze_isolated`; report its entries as failed
                handle.join().unwrap_or_else(|_| {
                    batch
                        .iter()
                        .map(|&id| EntryReport {
                            id,
                            name: format!("entry{}", id.index()),
                            result: Err(Error::InvariantViolation("worker panicked".into())),
                        })
                        .collect()
                })
            })
            .collect()
    })
}
