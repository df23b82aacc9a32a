//! Bookkeeping for the retrigger queue.
//!
//! An entry asks for a job to run again once its run numbered below `required_run` has ended.
//! Each job has at most one entry, with the highest required run number seen.

use rollout_core::ports::RetriggerEntry;
use rollout_core::run::JobStatus;

/// The entries, with a requirement for `required` added, unless an equal or later one exists.
/// Earlier requirements for the same job are dropped.
pub fn enqueue(entries: &[RetriggerEntry], required: RetriggerEntry) -> Vec<RetriggerEntry> {
    let covered = entries
        .iter()
        .any(|entry| entry.job == required.job && entry.required_run >= required.required_run);
    let mut updated: Vec<RetriggerEntry> = entries
        .iter()
        .filter(|entry| !(entry.job == required.job && entry.required_run < required.required_run))
        .cloned()
        .collect();
    if !covered {
        updated.push(required);
    }
    updated
}

/// Whether the job has yet to start the run the entry requires.
pub fn needs_trigger(entry: &RetriggerEntry, status: &JobStatus) -> bool {
    status
        .last_triggered()
        .is_none_or(|run| run.id.number < entry.required_run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use rollout_core::job::JobType;
    use rollout_core::run::Run;
    use rollout_core::RunId;

    #[test]
    fn test_enqueue_keeps_latest_requirement_per_job() {
        let system = job("default", JobType::SystemTest);
        let production = prod_job("default", "us-east-3");

        let entries = enqueue(&[], RetriggerEntry::new(system.clone(), 2));
        let entries = enqueue(&entries, RetriggerEntry::new(production.clone(), 4));
        assert_eq!(entries.len(), 2);

        // An earlier requirement is already covered.
        assert_eq!(enqueue(&entries, RetriggerEntry::new(system.clone(), 1)), entries);

        let entries = enqueue(&entries, RetriggerEntry::new(system.clone(), 3));
        assert_eq!(
            entries,
            vec![
                RetriggerEntry::new(production, 4),
                RetriggerEntry::new(system, 3)
            ]
        );
    }

    #[test]
    fn test_needs_trigger_until_required_run_starts() {
        let system = job("default", JobType::SystemTest);
        let entry = RetriggerEntry::new(system.clone(), 2);
        assert!(needs_trigger(&entry, &JobStatus::empty(system.clone())));

        let run = |number| Run::new(RunId::new(system.clone(), number), target(SYSTEM_VERSION, 1), t(0), false);
        assert!(needs_trigger(&entry, &JobStatus::new(system.clone(), vec![run(1)])));
        assert!(!needs_trigger(&entry, &JobStatus::new(system.clone(), vec![run(1), run(2)])));
    }
}
